//! Purpose: Logical object naming for a backup and classification of listed objects.
//! Exports: `ObjectKind`, `BackupObject`, `database_object`, `schema_object`, `data_object`, `classify`.
//! Role: Single source for the `<backup>/<db>[/<table>].<kind>.sql` layout.
//! Invariants: Names use `/` separators regardless of backend.
//! Invariants: Classification strips one trailing compression extension before matching.
use crate::core::codec::Compression;

pub const DATABASE_SUFFIX: &str = ".database.sql";
pub const SCHEMA_SUFFIX: &str = ".schema.sql";
pub const DATA_SUFFIX: &str = ".data.sql";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ObjectKind {
    Database,
    Schema,
    Data,
}

impl ObjectKind {
    pub fn label(self) -> &'static str {
        match self {
            ObjectKind::Database => "database",
            ObjectKind::Schema => "schema",
            ObjectKind::Data => "data",
        }
    }
}

/// A listed object resolved to its logical name and the database/table it belongs to.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct BackupObject {
    pub kind: ObjectKind,
    pub logical_name: String,
    pub database: String,
    pub table: Option<String>,
}

pub fn database_object(backup: &str, database: &str) -> String {
    format!("{backup}/{database}{DATABASE_SUFFIX}")
}

pub fn schema_object(backup: &str, database: &str, table: &str) -> String {
    format!("{backup}/{database}/{table}{SCHEMA_SUFFIX}")
}

pub fn data_object(backup: &str, database: &str, table: &str) -> String {
    format!("{backup}/{database}/{table}{DATA_SUFFIX}")
}

pub fn backup_prefix(backup: &str) -> String {
    format!("{}/", backup.trim_end_matches('/'))
}

pub fn strip_compression(name: &str) -> &str {
    let ext = Compression::from_name(name).extension();
    &name[..name.len() - ext.len()]
}

/// Returns `None` for objects outside the backup layout.
pub fn classify(backup: &str, physical_name: &str) -> Option<BackupObject> {
    let logical = strip_compression(physical_name);
    let prefix = backup_prefix(backup);
    let relative = logical.strip_prefix(&prefix)?;

    let (kind, stem) = if let Some(stem) = relative.strip_suffix(DATABASE_SUFFIX) {
        (ObjectKind::Database, stem)
    } else if let Some(stem) = relative.strip_suffix(SCHEMA_SUFFIX) {
        (ObjectKind::Schema, stem)
    } else if let Some(stem) = relative.strip_suffix(DATA_SUFFIX) {
        (ObjectKind::Data, stem)
    } else {
        return None;
    };

    let (database, table) = match kind {
        ObjectKind::Database => {
            if stem.is_empty() || stem.contains('/') {
                return None;
            }
            (stem.to_string(), None)
        }
        ObjectKind::Schema | ObjectKind::Data => {
            let (database, table) = stem.split_once('/')?;
            if database.is_empty() || table.is_empty() || table.contains('/') {
                return None;
            }
            (database.to_string(), Some(table.to_string()))
        }
    };

    Some(BackupObject {
        kind,
        logical_name: logical.to_string(),
        database,
        table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_backup_convention() {
        assert_eq!(database_object("b1", "sales"), "b1/sales.database.sql");
        assert_eq!(schema_object("b1", "sales", "orders"), "b1/sales/orders.schema.sql");
        assert_eq!(data_object("b1", "sales", "orders"), "b1/sales/orders.data.sql");
    }

    #[test]
    fn classify_strips_compression_extension() {
        let object = classify("b1", "b1/sales/orders.data.sql.zstd").expect("data object");
        assert_eq!(object.kind, ObjectKind::Data);
        assert_eq!(object.logical_name, "b1/sales/orders.data.sql");
        assert_eq!(object.database, "sales");
        assert_eq!(object.table.as_deref(), Some("orders"));

        let object = classify("b1", "b1/sales.database.sql.gz").expect("descriptor");
        assert_eq!(object.kind, ObjectKind::Database);
        assert_eq!(object.table, None);

        let object = classify("b1", "b1/sales/orders.schema.sql").expect("schema");
        assert_eq!(object.kind, ObjectKind::Schema);
    }

    #[test]
    fn classify_ignores_foreign_objects() {
        assert_eq!(classify("b1", "b1/readme.txt"), None);
        assert_eq!(classify("b1", "b2/sales.database.sql"), None);
        assert_eq!(classify("b1", "b1/sales/orders.sql"), None);
        assert_eq!(classify("b1", "b1/a/b/c.data.sql"), None);
        assert_eq!(classify("b1", "b1/a/b.database.sql"), None);
    }

    #[test]
    fn strip_compression_only_removes_known_suffixes() {
        assert_eq!(strip_compression("x.sql.gz"), "x.sql");
        assert_eq!(strip_compression("x.sql.zstd"), "x.sql");
        assert_eq!(strip_compression("x.sql.bz2"), "x.sql.bz2");
    }
}
