//! Purpose: Database/table inclusion predicates shared by export and restore.
//! Exports: `NameFilter`, `Filters`.
//! Role: Narrow which databases and tables a run touches.
//! Invariants: An empty include list keeps everything; exclusion always wins over inclusion.
use std::fmt;
use std::sync::Arc;

type Predicate = dyn Fn(&str) -> bool + Send + Sync;

#[derive(Clone)]
pub struct NameFilter {
    keep: Arc<Predicate>,
}

impl NameFilter {
    pub fn any() -> Self {
        Self::from_fn(|_| true)
    }

    pub fn from_fn(keep: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            keep: Arc::new(keep),
        }
    }

    /// Exact-name include/exclude lists.
    pub fn lists(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self::from_fn(move |name| {
            let included = include.is_empty() || include.iter().any(|item| item == name);
            included && !exclude.iter().any(|item| item == name)
        })
    }

    pub fn keep(&self, name: &str) -> bool {
        (self.keep)(name)
    }
}

impl Default for NameFilter {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Debug for NameFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NameFilter")
    }
}

#[derive(Clone, Debug, Default)]
pub struct Filters {
    pub databases: NameFilter,
    pub tables: NameFilter,
}

impl Filters {
    pub fn keep_database(&self, database: &str) -> bool {
        self.databases.keep(database)
    }

    pub fn keep_table(&self, database: &str, table: &str) -> bool {
        self.keep_database(database) && self.tables.keep(table)
    }
}

#[cfg(test)]
mod tests {
    use super::{Filters, NameFilter};

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn empty_include_keeps_everything_but_exclusions() {
        let filter = NameFilter::lists(Vec::new(), names(&["tmp"]));
        assert!(filter.keep("sales"));
        assert!(!filter.keep("tmp"));
    }

    #[test]
    fn exclusion_beats_inclusion() {
        let filter = NameFilter::lists(names(&["a", "b"]), names(&["b"]));
        assert!(filter.keep("a"));
        assert!(!filter.keep("b"));
        assert!(!filter.keep("c"));
    }

    #[test]
    fn table_filter_requires_database_match() {
        let filters = Filters {
            databases: NameFilter::lists(names(&["sales"]), Vec::new()),
            tables: NameFilter::from_fn(|table| !table.starts_with('.')),
        };
        assert!(filters.keep_table("sales", "orders"));
        assert!(!filters.keep_table("sales", ".inner.mv"));
        assert!(!filters.keep_table("logs", "orders"));
    }
}
