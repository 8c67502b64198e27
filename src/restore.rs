//! Purpose: Import orchestrator: list a backup, classify objects, replay them phase by phase.
//! Exports: `RestoreOptions`, `RestoreSummary`, `run_restore`, `plan_restore`, `RestorePlan`.
//! Role: Drives one restore run over a `Storage` and a destination `QueryClient`.
//! Invariants: Phases run strictly in order: descriptors, schemas, data. A phase starts only
//! after every job of the previous one finished, and only if none of them failed.
//! Invariants: Within a phase every job runs to completion even after a sibling fails.
//! Invariants: In the schema phase, views and dictionaries replay after every table succeeded.
//! Invariants: Every execution error is tagged with the originating object name.
use crate::backup::validate_backup_name;
use crate::clickhouse::QueryClient;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::jobs::{first_error, run_jobs};
use crate::core::naming::{BackupObject, ObjectKind, backup_prefix, classify};
use crate::core::statements::StatementReader;
use crate::filter::Filters;
use crate::storage::{Storage, StorageExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct RestoreOptions {
    pub backup: String,
    pub parallelism: usize,
    pub filters: Filters,
}

impl RestoreOptions {
    pub fn new(backup: impl Into<String>) -> Self {
        Self {
            backup: backup.into(),
            parallelism: 1,
            filters: Filters::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RestoreSummary {
    pub backup: String,
    pub databases: usize,
    pub schemas: usize,
    pub data_objects: usize,
    pub statements: u64,
    pub elapsed_ms: u128,
}

/// Objects of one backup grouped by replay phase.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RestorePlan {
    pub databases: Vec<BackupObject>,
    pub schemas: Vec<BackupObject>,
    pub data: Vec<BackupObject>,
}

impl RestorePlan {
    pub fn is_empty(&self) -> bool {
        self.databases.is_empty() && self.schemas.is_empty() && self.data.is_empty()
    }
}

/// Classifies listed names; compression variants of one logical object collapse to one entry.
pub fn plan_restore(backup: &str, names: &[String], filters: &Filters) -> RestorePlan {
    let objects = names
        .iter()
        .filter_map(|name| classify(backup, name))
        .filter(|object| match &object.table {
            Some(table) => filters.keep_table(&object.database, table),
            None => filters.keep_database(&object.database),
        })
        .collect::<BTreeSet<_>>();

    let mut plan = RestorePlan::default();
    for object in objects {
        match object.kind {
            ObjectKind::Database => plan.databases.push(object),
            ObjectKind::Schema => plan.schemas.push(object),
            ObjectKind::Data => plan.data.push(object),
        }
    }
    plan
}

pub fn run_restore(
    client: &dyn QueryClient,
    storage: &dyn Storage,
    options: &RestoreOptions,
) -> Result<RestoreSummary> {
    validate_backup_name(&options.backup)?;
    let started = Instant::now();

    let names = storage.list_objects(&backup_prefix(&options.backup), true)?;
    let plan = plan_restore(&options.backup, &names, &options.filters);
    if plan.is_empty() {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message(format!("backup {:?} has no restorable objects", options.backup))
            .with_object(backup_prefix(&options.backup))
            .with_hint("Run `clickdump list` to see available backups."));
    }
    info!(
        backup = %options.backup,
        databases = plan.databases.len(),
        schemas = plan.schemas.len(),
        data = plan.data.len(),
        parallelism = options.parallelism.max(1),
        "starting restore"
    );

    let statements = AtomicU64::new(0);
    let summary = RestoreSummary {
        backup: options.backup.clone(),
        databases: plan.databases.len(),
        schemas: plan.schemas.len(),
        data_objects: plan.data.len(),
        ..RestoreSummary::default()
    };

    run_phase(ObjectKind::Database, plan.databases, options, |object| {
        let body = download_statement(storage, object)?;
        execute_whole(client, object, &body)
    })?;
    // Views and dictionaries read from tables, so they replay after every table exists.
    let deferred = Mutex::new(Vec::new());
    run_phase(ObjectKind::Schema, plan.schemas, options, |object| {
        let body = download_statement(storage, object)?;
        if reads_other_tables(&body) {
            lock(&deferred).push((object.clone(), body));
            return Ok(());
        }
        execute_whole(client, object, &body)
    })?;
    let deferred = deferred.into_inner().unwrap_or_else(|poison| poison.into_inner());
    if !deferred.is_empty() {
        info!(objects = deferred.len(), "replaying dependent schemas");
        let errors = run_jobs(deferred, options.parallelism, |(object, body)| {
            execute_whole(client, &object, &body)
        });
        first_error(ObjectKind::Schema.label(), errors)?;
    }
    run_phase(ObjectKind::Data, plan.data, options, |object| {
        let count = replay_statements(client, storage, object)?;
        statements.fetch_add(count, Ordering::Relaxed);
        Ok(())
    })?;

    let summary = RestoreSummary {
        statements: statements.into_inner(),
        elapsed_ms: started.elapsed().as_millis(),
        ..summary
    };
    info!(
        backup = %summary.backup,
        statements = summary.statements,
        elapsed_ms = summary.elapsed_ms,
        "restore finished"
    );
    Ok(summary)
}

fn run_phase<F>(
    kind: ObjectKind,
    objects: Vec<BackupObject>,
    options: &RestoreOptions,
    work: F,
) -> Result<()>
where
    F: Fn(&BackupObject) -> Result<()> + Sync,
{
    if objects.is_empty() {
        return Ok(());
    }
    info!(phase = kind.label(), objects = objects.len(), "restore phase started");
    let errors = run_jobs(objects, options.parallelism, |object| work(&object));
    first_error(kind.label(), errors)
}

/// Descriptor and schema objects hold one statement each.
fn download_statement(storage: &dyn Storage, object: &BackupObject) -> Result<Vec<u8>> {
    let body = storage.download_to_vec(&object.logical_name)?;
    Ok(body.trim_ascii().to_vec())
}

fn execute_whole(client: &dyn QueryClient, object: &BackupObject, statement: &[u8]) -> Result<()> {
    if statement.is_empty() {
        debug!(object = %object.logical_name, "empty object skipped");
        return Ok(());
    }
    client
        .execute_query(statement)
        .map_err(|err| tag_execution(err, object, &String::from_utf8_lossy(statement)))?;
    debug!(object = %object.logical_name, "statement replayed");
    Ok(())
}

/// Statements that select from other tables when created.
fn reads_other_tables(statement: &[u8]) -> bool {
    const DEPENDENT: &[&[u8]] = &[
        b"CREATE VIEW",
        b"CREATE OR REPLACE VIEW",
        b"CREATE MATERIALIZED VIEW",
        b"CREATE LIVE VIEW",
        b"CREATE WINDOW VIEW",
        b"CREATE DICTIONARY",
        b"CREATE OR REPLACE DICTIONARY",
    ];
    let head = statement[..statement.len().min(32)].to_ascii_uppercase();
    DEPENDENT.iter().any(|prefix| head.starts_with(prefix))
}

fn replay_statements(
    client: &dyn QueryClient,
    storage: &dyn Storage,
    object: &BackupObject,
) -> Result<u64> {
    let stream = storage.download(&object.logical_name)?;
    let mut count = 0u64;
    for statement in StatementReader::new(stream) {
        let statement = statement.map_err(|err| err.with_object(object.logical_name.clone()))?;
        client
            .execute_query(statement.as_bytes())
            .map_err(|err| tag_execution(err, object, &statement.first_line()))?;
        count += 1;
        debug!(
            object = %object.logical_name,
            statement = count,
            bytes = statement.as_bytes().len(),
            "statement replayed"
        );
    }
    info!(object = %object.logical_name, statements = count, "data replayed");
    Ok(count)
}

fn tag_execution(err: Error, object: &BackupObject, statement: &str) -> Error {
    let err = if err.statement().is_none() {
        err.with_statement(statement)
    } else {
        err
    };
    err.with_object(object.logical_name.clone())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[cfg(test)]
mod tests {
    use super::{plan_restore, reads_other_tables};
    use crate::core::naming::ObjectKind;
    use crate::filter::{Filters, NameFilter};

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn plan_groups_by_phase_and_dedupes_variants() {
        let listed = names(&[
            "b1/sales.database.sql.gz",
            "b1/sales/orders.schema.sql.gz",
            "b1/sales/orders.data.sql.gz",
            "b1/sales/orders.data.sql",
            "b1/logs.database.sql",
            "b1/notes.txt",
        ]);
        let plan = plan_restore("b1", &listed, &Filters::default());
        assert_eq!(plan.databases.len(), 2);
        assert_eq!(plan.schemas.len(), 1);
        assert_eq!(plan.data.len(), 1);
        assert_eq!(plan.data[0].kind, ObjectKind::Data);
        assert_eq!(plan.data[0].logical_name, "b1/sales/orders.data.sql");
    }

    #[test]
    fn views_and_dictionaries_are_dependent_schemas() {
        assert!(reads_other_tables(b"CREATE VIEW IF NOT EXISTS s.v AS SELECT 1"));
        assert!(reads_other_tables(b"create materialized view s.mv TO s.t AS SELECT 1"));
        assert!(reads_other_tables(b"CREATE DICTIONARY IF NOT EXISTS s.d (k UInt64)"));
        assert!(!reads_other_tables(b"CREATE TABLE IF NOT EXISTS s.t (x UInt8)"));
        assert!(!reads_other_tables(b"CREATE DATABASE IF NOT EXISTS s"));
        assert!(!reads_other_tables(b""));
    }

    #[test]
    fn plan_applies_filters() {
        let listed = names(&[
            "b1/sales.database.sql",
            "b1/sales/orders.schema.sql",
            "b1/sales/tmp.schema.sql",
            "b1/logs.database.sql",
            "b1/logs/events.schema.sql",
        ]);
        let filters = Filters {
            databases: NameFilter::lists(names(&["sales"]), Vec::new()),
            tables: NameFilter::lists(Vec::new(), names(&["tmp"])),
        };
        let plan = plan_restore("b1", &listed, &filters);
        assert_eq!(plan.databases.len(), 1);
        assert_eq!(plan.schemas.len(), 1);
        assert_eq!(plan.schemas[0].table.as_deref(), Some("orders"));
    }
}
