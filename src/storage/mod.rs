//! Purpose: Storage port every backend implements, plus compression-aware upload/download.
//! Exports: `Storage`, `StorageExt`, `StorageConfig`, `open_storage`, backend types.
//! Role: Seam between orchestrators and concrete backends (file, S3, memory).
//! Invariants: Backends only move physical names and bytes; naming and codec policy live here.
//! Invariants: Download probes `.gz`, then `.zstd`, then the bare name; only not-found continues.
//! Invariants: Object names are `/`-separated and relative to the backend's configured base.
mod file;
mod memory;
mod s3;

pub use file::FileStorage;
pub use memory::{MemoryStorage, StoredObject};
pub use s3::{S3Config, S3Storage};

use crate::core::codec::{BoxRead, Compression, compress, decompress};
use crate::core::error::{Error, ErrorKind, Result};
use serde::Deserialize;
use std::io::Read;
use std::path::PathBuf;
use tracing::debug;

pub trait Storage: Send + Sync {
    /// Short backend label used in logs.
    fn kind(&self) -> &'static str;

    /// Writes `body` under `name`, creating implied parent prefixes.
    /// `content_encoding` is set when the body is already compressed in that encoding.
    fn put_object(
        &self,
        name: &str,
        body: &mut dyn Read,
        content_encoding: Option<&str>,
    ) -> Result<()>;

    /// Opens `name` for reading; `Ok(None)` when it does not exist.
    fn get_object(&self, name: &str) -> Result<Option<BoxRead>>;

    /// Lists names under `prefix`. Non-recursive listing returns immediate children and
    /// represents deeper content as grouped prefixes ending in `/`.
    fn list_objects(&self, prefix: &str, recursive: bool) -> Result<Vec<String>>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Compression-aware operations shared by every backend.
pub trait StorageExt: Storage {
    /// Uploads `reader` under `name` plus the compression extension; returns the physical name.
    fn upload(
        &self,
        name: &str,
        reader: BoxRead,
        format: Compression,
        level: i32,
        pre_encoded: Option<&str>,
    ) -> Result<String> {
        let pre_encoded = match pre_encoded {
            Some(encoding) => match Compression::from_content_encoding(encoding) {
                Some(Compression::None) => None,
                Some(encoded) => Some(encoded),
                None => {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message(format!("unsupported content encoding {encoding:?}"))
                        .with_object(name));
                }
            },
            None => None,
        };

        let (mut stream, physical, content_encoding) = match pre_encoded {
            Some(encoded) => (
                reader,
                format!("{name}{}", encoded.extension()),
                encoded.content_encoding(),
            ),
            None => {
                let (stream, ext) = compress(reader, format, level);
                (stream, format!("{name}{ext}"), None)
            }
        };

        debug!(backend = self.kind(), object = %physical, "uploading object");
        self.put_object(&physical, &mut stream, content_encoding)
            .map_err(|err| tag_object(err, &physical))?;
        Ok(physical)
    }

    /// Opens the first existing compression variant of `name`, decompressed.
    fn download(&self, name: &str) -> Result<BoxRead> {
        let candidates = download_candidates(name);
        for candidate in &candidates {
            match self.get_object(candidate) {
                Ok(Some(stream)) => {
                    debug!(backend = self.kind(), object = %candidate, "downloading object");
                    return Ok(decompress(stream, candidate));
                }
                Ok(None) => continue,
                Err(err) => return Err(tag_object(err, candidate)),
            }
        }
        Err(Error::new(ErrorKind::NotFound)
            .with_message("no compression variant of object exists")
            .with_object(name)
            .with_candidates(candidates))
    }

    /// Downloads `name` and reads it fully.
    fn download_to_vec(&self, name: &str) -> Result<Vec<u8>> {
        let mut stream = self.download(name)?;
        let mut body = Vec::new();
        stream
            .read_to_end(&mut body)
            .map_err(|err| tag_object(Error::from_io("failed to read object", err), name))?;
        Ok(body)
    }
}

impl<T: Storage + ?Sized> StorageExt for T {}

pub fn download_candidates(name: &str) -> Vec<String> {
    vec![
        format!("{name}{}", Compression::Gzip.extension()),
        format!("{name}{}", Compression::Zstd.extension()),
        name.to_string(),
    ]
}

fn tag_object(err: Error, object: &str) -> Error {
    if err.object().is_some() {
        err
    } else {
        err.with_object(object)
    }
}

/// Runtime backend selection.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    File { path: PathBuf },
    S3(S3Config),
}

impl StorageConfig {
    /// Parses a `{"type": "file" | "s3", ...}` document; omitted S3 fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Config)
                .with_message("invalid storage config")
                .with_hint(r#"Expected {"type":"file","path":...} or {"type":"s3","bucket":...}."#)
                .with_source(err)
        })
    }
}

pub fn open_storage(config: &StorageConfig) -> Result<Box<dyn Storage>> {
    match config {
        StorageConfig::File { path } => Ok(Box::new(FileStorage::new(path)?)),
        StorageConfig::S3(config) => Ok(Box::new(S3Storage::new(config.clone())?)),
    }
}
