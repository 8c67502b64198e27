//! Purpose: Filesystem storage backend rooted at one directory.
//! Exports: `FileStorage`.
//! Role: Local or mounted-volume target; also the backend used by end-to-end tests.
//! Invariants: Objects appear under their final name only once fully written (temp + rename).
//! Invariants: Object names never escape the root (`..` and absolute segments are rejected).
use super::Storage;
use crate::core::codec::BoxRead;
use crate::core::error::{Error, ErrorKind, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if root.as_os_str().is_empty() {
            return Err(Error::new(ErrorKind::Config)
                .with_message("file storage requires a root path")
                .with_hint("Pass --path <dir>."));
        }
        fs::create_dir_all(root).map_err(|err| {
            Error::new(ErrorKind::Config)
                .with_message(format!("cannot create storage root {}", root.display()))
                .with_source(err)
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if !safe || name.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("object name escapes the storage root")
                .with_object(name));
        }
        Ok(self.root.join(relative))
    }

    fn walk(&self, dir: &Path, recursive: bool, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(Error::io(format!("failed to list {}", dir.display()), err)),
        };
        for entry in entries {
            let entry =
                entry.map_err(|err| Error::io(format!("failed to list {}", dir.display()), err))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|err| Error::io(format!("failed to stat {}", path.display()), err))?;
            let Some(name) = self.relative_name(&path) else {
                continue;
            };
            if file_type.is_dir() {
                if recursive {
                    self.walk(&path, true, out)?;
                } else {
                    out.push(format!("{name}/"));
                }
            } else if file_type.is_file() && !is_temp_name(&name) {
                out.push(name);
            }
        }
        Ok(())
    }

    fn relative_name(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts = relative
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

impl Storage for FileStorage {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn put_object(
        &self,
        name: &str,
        body: &mut dyn Read,
        _content_encoding: Option<&str>,
    ) -> Result<()> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| Error::io(format!("failed to create {}", parent.display()), err))?;
        }
        let temp = temp_path(&path);
        let result = write_file(&temp, body).and_then(|()| {
            fs::rename(&temp, &path).map_err(|err| Error::io("failed to publish object", err))
        });
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result
    }

    fn get_object(&self, name: &str) -> Result<Option<BoxRead>> {
        let path = self.resolve(name)?;
        match File::open(&path) {
            Ok(file) => Ok(Some(Box::new(BufReader::new(file)))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::io(format!("failed to open {}", path.display()), err)),
        }
    }

    fn list_objects(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        // Walk from the deepest directory the prefix names, then filter by the full prefix.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir_part)?
        };
        let mut names = Vec::new();
        self.walk(&start, recursive, &mut names)?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }
}

fn write_file(path: &Path, body: &mut dyn Read) -> Result<()> {
    let file = File::create(path)
        .map_err(|err| Error::io(format!("failed to create {}", path.display()), err))?;
    let mut writer = BufWriter::new(file);
    io::copy(body, &mut writer).map_err(|err| Error::from_io("failed to write object", err))?;
    let file = writer
        .into_inner()
        .map_err(|err| Error::io("failed to flush object", err.into_error()))?;
    file.sync_all()
        .map_err(|err| Error::io("failed to sync object", err))?;
    Ok(())
}

const TEMP_MARKER: &str = ".clickdump-tmp-";

fn temp_path(path: &Path) -> PathBuf {
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(
        "{file_name}{TEMP_MARKER}{}-{counter}",
        std::process::id()
    ))
}

fn is_temp_name(name: &str) -> bool {
    name.contains(TEMP_MARKER)
}

#[cfg(test)]
mod tests {
    use super::FileStorage;
    use crate::core::codec::Compression;
    use crate::core::error::ErrorKind;
    use crate::storage::{Storage, StorageExt};
    use std::io::{Cursor, Read};

    #[test]
    fn upload_creates_intermediate_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(temp.path()).expect("storage");
        let physical = storage
            .upload(
                "b1/sales/orders.schema.sql",
                Box::new(Cursor::new(b"CREATE TABLE IF NOT EXISTS sales.orders".to_vec())),
                Compression::Gzip,
                5,
                None,
            )
            .expect("upload");
        assert_eq!(physical, "b1/sales/orders.schema.sql.gz");
        assert!(temp.path().join("b1/sales/orders.schema.sql.gz").is_file());

        let mut body = String::new();
        storage
            .download("b1/sales/orders.schema.sql")
            .expect("download")
            .read_to_string(&mut body)
            .expect("read");
        assert_eq!(body, "CREATE TABLE IF NOT EXISTS sales.orders");
    }

    #[test]
    fn listing_is_relative_to_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(temp.path()).expect("storage");
        for name in ["b1/db.database.sql", "b1/db/t.schema.sql", "b1/db/t.data.sql.zstd"] {
            storage
                .put_object(name, &mut Cursor::new(b"x".to_vec()), None)
                .expect("put");
        }
        assert_eq!(
            storage.list_objects("b1/", false).expect("list"),
            vec!["b1/db.database.sql".to_string(), "b1/db/".to_string()]
        );
        assert_eq!(
            storage.list_objects("b1/", true).expect("list"),
            vec![
                "b1/db.database.sql".to_string(),
                "b1/db/t.data.sql.zstd".to_string(),
                "b1/db/t.schema.sql".to_string(),
            ]
        );
        assert_eq!(storage.list_objects("", false).expect("list"), vec!["b1/".to_string()]);
        assert!(storage.list_objects("missing/", true).expect("list").is_empty());
    }

    #[test]
    fn missing_object_is_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(temp.path()).expect("storage");
        assert!(storage.get_object("b1/none.sql").expect("probe").is_none());
    }

    #[test]
    fn names_cannot_escape_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(temp.path().join("root")).expect("storage");
        let err = storage
            .put_object("../outside.sql", &mut Cursor::new(Vec::new()), None)
            .expect_err("escape");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
