//! Purpose: Export orchestrator: discover databases and tables, upload descriptors, schemas, data.
//! Exports: `BackupOptions`, `BackupSummary`, `TableRef`, `run_backup`, `ensure_if_not_exists`.
//! Role: Drives one export run over a `QueryClient` and a `Storage` with a bounded worker pool.
//! Invariants: One job per database descriptor and one per table; failures never cancel siblings.
//! Invariants: A table's data object is written only after its schema object succeeded.
//! Invariants: Data streams straight from the query response into storage; server-side
//! compression is passed through instead of re-compressed.
use crate::clickhouse::{QueryClient, quote_identifier, quote_literal};
use crate::core::codec::{BoxRead, Compression};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::jobs::{first_error, run_jobs};
use crate::core::naming::{data_object, database_object, schema_object};
use crate::filter::Filters;
use crate::storage::{Storage, StorageExt};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info};

/// Databases that belong to the server itself.
const SYSTEM_DATABASES: &[&str] = &["system", "INFORMATION_SCHEMA", "information_schema"];

/// Engines whose tables hold no rows of their own.
const DATALESS_ENGINES: &[&str] = &[
    "View",
    "MaterializedView",
    "LiveView",
    "WindowView",
    "Dictionary",
];

/// Rows per generated INSERT statement.
const INSERT_BATCH_ROWS: u32 = 10_000;

#[derive(Clone, Debug)]
pub struct BackupOptions {
    pub backup: String,
    pub compression: Compression,
    pub compression_level: i32,
    pub parallelism: usize,
    pub filters: Filters,
}

impl BackupOptions {
    pub fn new(backup: impl Into<String>) -> Self {
        Self {
            backup: backup.into(),
            compression: Compression::Gzip,
            compression_level: 0,
            parallelism: 1,
            filters: Filters::default(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TableRef {
    pub database: String,
    pub name: String,
    pub engine: String,
}

impl TableRef {
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.database),
            quote_identifier(&self.name)
        )
    }

    pub fn stores_data(&self) -> bool {
        !DATALESS_ENGINES.contains(&self.engine.as_str())
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BackupSummary {
    pub backup: String,
    pub databases: usize,
    pub tables: usize,
    pub objects: Vec<String>,
    pub elapsed_ms: u128,
}

enum ExportJob {
    Database(String),
    Table(TableRef),
}

pub fn run_backup(
    client: &dyn QueryClient,
    storage: &dyn Storage,
    options: &BackupOptions,
) -> Result<BackupSummary> {
    validate_backup_name(&options.backup)?;
    let started = Instant::now();

    let databases = list_databases(client, options)?;
    let tables = list_tables(client, &databases, options)?;
    info!(
        backup = %options.backup,
        databases = databases.len(),
        tables = tables.len(),
        parallelism = options.parallelism.max(1),
        compression = %options.compression,
        "starting backup"
    );

    let mut jobs = Vec::with_capacity(databases.len() + tables.len());
    jobs.extend(databases.iter().cloned().map(ExportJob::Database));
    jobs.extend(tables.iter().cloned().map(ExportJob::Table));

    let written = Mutex::new(Vec::new());
    let errors = run_jobs(jobs, options.parallelism, |job| {
        let objects = match job {
            ExportJob::Database(database) => {
                vec![export_database(client, storage, options, &database)?]
            }
            ExportJob::Table(table) => export_table(client, storage, options, &table)?,
        };
        written
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .extend(objects);
        Ok(())
    });
    first_error("export", errors)?;

    let mut objects = written.into_inner().unwrap_or_else(|poison| poison.into_inner());
    objects.sort();
    let summary = BackupSummary {
        backup: options.backup.clone(),
        databases: databases.len(),
        tables: tables.len(),
        objects,
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(
        backup = %summary.backup,
        objects = summary.objects.len(),
        elapsed_ms = summary.elapsed_ms,
        "backup finished"
    );
    Ok(summary)
}

pub fn validate_backup_name(backup: &str) -> Result<()> {
    let valid = !backup.is_empty()
        && backup != "."
        && backup != ".."
        && !backup.contains('/')
        && !backup.contains('\\');
    if valid {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid backup name {backup:?}"))
            .with_hint("Backup names are a single path segment, e.g. nightly-2026-10-14."))
    }
}

fn list_databases(client: &dyn QueryClient, options: &BackupOptions) -> Result<Vec<String>> {
    let excluded = SYSTEM_DATABASES
        .iter()
        .map(|name| quote_literal(name))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT name FROM system.databases WHERE name NOT IN ({excluded}) ORDER BY name FORMAT TSVRaw"
    );
    let body = client.execute_query(sql.as_bytes())?;
    Ok(tsv_rows(&body)
        .filter_map(|row| row.into_iter().next())
        .filter(|name| options.filters.keep_database(name))
        .collect())
}

fn list_tables(
    client: &dyn QueryClient,
    databases: &[String],
    options: &BackupOptions,
) -> Result<Vec<TableRef>> {
    if databases.is_empty() {
        return Ok(Vec::new());
    }
    let names = databases
        .iter()
        .map(|name| quote_literal(name))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT database, name, engine FROM system.tables \
         WHERE is_temporary = 0 AND database IN ({names}) \
         ORDER BY database, name FORMAT TSVRaw"
    );
    let body = client.execute_query(sql.as_bytes())?;
    let mut tables = Vec::new();
    for row in tsv_rows(&body) {
        let [database, name, engine]: [String; 3] = row.try_into().map_err(|row: Vec<String>| {
            Error::new(ErrorKind::Execution)
                .with_message(format!("unexpected system.tables row with {} columns", row.len()))
        })?;
        if options.filters.keep_table(&database, &name) {
            tables.push(TableRef {
                database,
                name,
                engine,
            });
        }
    }
    Ok(tables)
}

fn tsv_rows(body: &[u8]) -> impl Iterator<Item = Vec<String>> + '_ {
    body.split(|byte| *byte == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split(|byte| *byte == b'\t')
                .map(|field| String::from_utf8_lossy(field).to_string())
                .collect()
        })
}

fn show_create(client: &dyn QueryClient, target: &str) -> Result<String> {
    let sql = format!("SHOW CREATE {target} FORMAT TSVRaw");
    let body = client.execute_query(sql.as_bytes())?;
    let statement = String::from_utf8_lossy(&body).trim().to_string();
    if statement.is_empty() {
        return Err(Error::new(ErrorKind::Execution)
            .with_message(format!("SHOW CREATE {target} returned nothing")));
    }
    Ok(ensure_if_not_exists(&statement))
}

fn upload_statement(
    storage: &dyn Storage,
    options: &BackupOptions,
    name: &str,
    statement: String,
) -> Result<String> {
    let reader: BoxRead = Box::new(Cursor::new(statement.into_bytes()));
    storage.upload(
        name,
        reader,
        options.compression,
        options.compression_level,
        None,
    )
}

fn export_database(
    client: &dyn QueryClient,
    storage: &dyn Storage,
    options: &BackupOptions,
    database: &str,
) -> Result<String> {
    let name = database_object(&options.backup, database);
    let statement = show_create(client, &format!("DATABASE {}", quote_identifier(database)))
        .map_err(|err| err.with_object(name.clone()))?;
    let physical = upload_statement(storage, options, &name, statement)?;
    debug!(object = %physical, "database descriptor written");
    Ok(physical)
}

fn export_table(
    client: &dyn QueryClient,
    storage: &dyn Storage,
    options: &BackupOptions,
    table: &TableRef,
) -> Result<Vec<String>> {
    let qualified = table.qualified_name();
    let schema_name = schema_object(&options.backup, &table.database, &table.name);
    let statement = show_create(client, &format!("TABLE {qualified}"))
        .map_err(|err| err.with_object(schema_name.clone()))?;
    let schema = upload_statement(storage, options, &schema_name, statement)?;
    if !table.stores_data() {
        info!(table = %qualified, engine = %table.engine, "schema exported; engine holds no data");
        return Ok(vec![schema]);
    }

    let data_name = data_object(&options.backup, &table.database, &table.name);
    let sql = format!(
        "SELECT * FROM {qualified} FORMAT SQLInsert SETTINGS \
         output_format_sql_insert_table_name = {}, \
         output_format_sql_insert_include_column_names = 0, \
         output_format_sql_insert_quote_names = 0, \
         output_format_sql_insert_max_batch_size = {INSERT_BATCH_ROWS}",
        quote_literal(&qualified)
    );
    let stream = client
        .execute_query_streaming(&sql, options.compression.content_encoding())
        .map_err(|err| err.with_object(data_name.clone()))?;
    let pre_encoded = stream
        .content_encoding
        .as_deref()
        .filter(|encoding| Compression::from_content_encoding(encoding) != Some(Compression::None));
    let data = storage.upload(
        &data_name,
        stream.reader,
        options.compression,
        options.compression_level,
        pre_encoded,
    )?;
    info!(table = %qualified, object = %data, "table exported");
    Ok(vec![schema, data])
}

/// Rewrites `CREATE <kind> name` to `CREATE <kind> IF NOT EXISTS name` so replay is repeatable.
pub fn ensure_if_not_exists(statement: &str) -> String {
    const KINDS: &[&str] = &[
        "DATABASE",
        "TABLE",
        "VIEW",
        "MATERIALIZED VIEW",
        "LIVE VIEW",
        "WINDOW VIEW",
        "DICTIONARY",
    ];
    let trimmed = statement.trim_start();
    let upper = trimmed.to_ascii_uppercase();
    for kind in KINDS {
        let head = format!("CREATE {kind} ");
        if !upper.starts_with(&head) {
            continue;
        }
        if upper[head.len()..].trim_start().starts_with("IF NOT EXISTS") {
            return trimmed.to_string();
        }
        return format!("{head}IF NOT EXISTS {}", &trimmed[head.len()..]);
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::{TableRef, ensure_if_not_exists, tsv_rows, validate_backup_name};

    #[test]
    fn create_statements_become_idempotent() {
        assert_eq!(
            ensure_if_not_exists("CREATE DATABASE sales\nENGINE = Atomic"),
            "CREATE DATABASE IF NOT EXISTS sales\nENGINE = Atomic"
        );
        assert_eq!(
            ensure_if_not_exists("CREATE TABLE sales.orders (`id` UInt64) ENGINE = MergeTree"),
            "CREATE TABLE IF NOT EXISTS sales.orders (`id` UInt64) ENGINE = MergeTree"
        );
        assert_eq!(
            ensure_if_not_exists("CREATE MATERIALIZED VIEW sales.mv TO sales.t AS SELECT 1"),
            "CREATE MATERIALIZED VIEW IF NOT EXISTS sales.mv TO sales.t AS SELECT 1"
        );
        assert_eq!(
            ensure_if_not_exists("CREATE TABLE IF NOT EXISTS sales.orders (x UInt8)"),
            "CREATE TABLE IF NOT EXISTS sales.orders (x UInt8)"
        );
        assert_eq!(ensure_if_not_exists("ATTACH TABLE x"), "ATTACH TABLE x");
    }

    #[test]
    fn tsv_rows_split_fields() {
        let rows = tsv_rows(b"sales\torders\tMergeTree\nsales\tv\tView\n").collect::<Vec<_>>();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec!["sales", "v", "View"]);
    }

    #[test]
    fn dataless_engines_skip_data_export() {
        let table = |engine: &str| TableRef {
            database: "sales".to_string(),
            name: "t".to_string(),
            engine: engine.to_string(),
        };
        assert!(table("MergeTree").stores_data());
        assert!(!table("View").stores_data());
        assert!(!table("MaterializedView").stores_data());
        assert_eq!(table("Log").qualified_name(), "`sales`.`t`");
    }

    #[test]
    fn backup_names_are_single_segments() {
        assert!(validate_backup_name("nightly-1").is_ok());
        assert!(validate_backup_name("").is_err());
        assert!(validate_backup_name("a/b").is_err());
        assert!(validate_backup_name("..").is_err());
    }
}
