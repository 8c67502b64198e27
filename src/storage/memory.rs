//! Purpose: In-process storage backend keyed by physical object name.
//! Exports: `MemoryStorage`, `StoredObject`.
//! Role: Test double and embedding target; records every probe for observability.
//! Invariants: Listing semantics match the remote backends (grouped prefixes end in `/`).
use super::Storage;
use crate::core::codec::BoxRead;
use crate::core::error::{Error, ErrorKind, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_encoding: Option<String>,
}

#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    probes: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, body: impl Into<Vec<u8>>) {
        lock(&self.objects).insert(
            name.into(),
            StoredObject {
                body: body.into(),
                content_encoding: None,
            },
        );
    }

    pub fn object(&self, name: &str) -> Option<StoredObject> {
        lock(&self.objects).get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every name passed to `get_object`, in call order.
    pub fn probes(&self) -> Vec<String> {
        lock(&self.probes).clone()
    }

    /// Makes reads and writes of `name` fail with an I/O error.
    pub fn fail_on(&self, name: impl Into<String>) {
        lock(&self.failing).insert(name.into());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_failing(&self, name: &str) -> Result<()> {
        if lock(&self.failing).contains(name) {
            return Err(Error::new(ErrorKind::Io)
                .with_message("injected storage failure")
                .with_object(name));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn put_object(
        &self,
        name: &str,
        body: &mut dyn Read,
        content_encoding: Option<&str>,
    ) -> Result<()> {
        self.check_failing(name)?;
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes)
            .map_err(|err| Error::from_io("failed to read upload body", err))?;
        lock(&self.objects).insert(
            name.to_string(),
            StoredObject {
                body: bytes,
                content_encoding: content_encoding.map(str::to_string),
            },
        );
        Ok(())
    }

    fn get_object(&self, name: &str) -> Result<Option<BoxRead>> {
        lock(&self.probes).push(name.to_string());
        self.check_failing(name)?;
        Ok(lock(&self.objects)
            .get(name)
            .map(|object| Box::new(Cursor::new(object.body.clone())) as BoxRead))
    }

    fn list_objects(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let objects = lock(&self.objects);
        let mut names = BTreeSet::new();
        for name in objects.keys() {
            let Some(rest) = name.strip_prefix(prefix) else {
                continue;
            };
            match rest.find('/') {
                Some(idx) if !recursive => {
                    names.insert(format!("{prefix}{}", &rest[..=idx]));
                }
                _ => {
                    names.insert(name.clone());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[cfg(test)]
mod tests {
    use super::MemoryStorage;
    use crate::storage::Storage;

    #[test]
    fn non_recursive_listing_groups_prefixes() {
        let storage = MemoryStorage::new();
        storage.insert("b1/db.database.sql", "CREATE DATABASE db");
        storage.insert("b1/db/t.schema.sql.gz", "x");
        storage.insert("b1/db/t.data.sql.gz", "x");
        storage.insert("b2/db.database.sql", "x");

        assert_eq!(
            storage.list_objects("b1/", false).expect("list"),
            vec!["b1/db.database.sql".to_string(), "b1/db/".to_string()]
        );
        assert_eq!(
            storage.list_objects("", false).expect("list"),
            vec!["b1/".to_string(), "b2/".to_string()]
        );
        assert_eq!(storage.list_objects("b1/", true).expect("list").len(), 3);
    }
}
