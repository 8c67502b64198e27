//! Purpose: Streaming gzip/zstd compression keyed by format, decompression keyed by name.
//! Exports: `Compression`, `compress`, `decompress`, `BoxRead`.
//! Role: Leaf codec used by the storage port on upload and download.
//! Invariants: The extension is derived from the format alone (`.gz`, `.zstd`, or none).
//! Invariants: Encoders are finished before the pipe closes; any producer error reaches the reader.
//! Invariants: Construction failures surface on the first read, never as a hung stream.
use crate::core::error::{Error, ErrorKind};
use crate::core::pipe::{PipeWriter, pipe};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fmt;
use std::io::{self, Read};
use std::thread;
use tracing::debug;

pub type BoxRead = Box<dyn Read + Send>;

/// Chunks buffered between encoder thread and consumer.
const PIPE_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn from_content_encoding(encoding: &str) -> Option<Self> {
        match encoding.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Compression::Gzip),
            "zstd" => Some(Compression::Zstd),
            "" | "identity" => Some(Compression::None),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Self {
        if name.ends_with(Compression::Gzip.extension()) {
            Compression::Gzip
        } else if name.ends_with(Compression::Zstd.extension()) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zstd",
        }
    }

    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("gzip"),
            Compression::Zstd => Some("zstd"),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

pub fn gzip_level(level: i32) -> flate2::Compression {
    match u32::try_from(level) {
        Ok(level @ 1..=9) => flate2::Compression::new(level),
        _ => flate2::Compression::default(),
    }
}

pub fn zstd_level(level: i32) -> i32 {
    let range = zstd::compression_level_range();
    if level <= 0 {
        zstd::DEFAULT_COMPRESSION_LEVEL
    } else {
        level.clamp(1, *range.end())
    }
}

/// Returns the compressed stream and the extension to append to the logical name.
pub fn compress(raw: BoxRead, format: Compression, level: i32) -> (BoxRead, &'static str) {
    if format == Compression::None {
        return (raw, "");
    }
    let (writer, reader) = pipe(PIPE_CAPACITY);
    thread::spawn(move || pump(raw, writer, format, level));
    (Box::new(reader), format.extension())
}

fn pump(mut raw: BoxRead, mut writer: PipeWriter, format: Compression, level: i32) {
    match encode(&mut raw, &mut writer, format, level) {
        Ok(()) => writer.close(),
        Err(err) => {
            debug!(error = %err, %format, "compression producer failed");
            writer.fail(err);
        }
    }
}

fn encode(
    raw: &mut BoxRead,
    writer: &mut PipeWriter,
    format: Compression,
    level: i32,
) -> io::Result<()> {
    match format {
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(writer, gzip_level(level));
            io::copy(raw, &mut encoder)?;
            encoder.finish()?;
        }
        Compression::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(writer, zstd_level(level))?;
            io::copy(raw, &mut encoder)?;
            encoder.finish()?;
        }
        Compression::None => {
            io::copy(raw, writer)?;
        }
    }
    Ok(())
}

/// Picks the decoder from the suffix of `name`; dropping the handle drops decoder then stream.
pub fn decompress(stream: BoxRead, name: &str) -> BoxRead {
    match Compression::from_name(name) {
        Compression::Gzip => Box::new(MultiGzDecoder::new(stream)),
        Compression::Zstd => match zstd::stream::read::Decoder::new(stream) {
            Ok(decoder) => Box::new(decoder),
            Err(err) => Box::new(FailedReader::new(
                Error::new(ErrorKind::Io)
                    .with_message("failed to initialize zstd decoder")
                    .with_object(name)
                    .with_source(err),
            )),
        },
        Compression::None => stream,
    }
}

/// Reader that fails on first use with a stored error.
pub struct FailedReader {
    error: Option<Error>,
}

impl FailedReader {
    pub fn new(error: Error) -> Self {
        Self { error: Some(error) }
    }
}

impl Read for FailedReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        match self.error.take() {
            Some(error) => Err(error.into_io()),
            None => Err(io::Error::other("stream already failed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BoxRead, Compression, compress, decompress, gzip_level, zstd_level};
    use std::io::{self, Cursor, Read};

    fn payload() -> Vec<u8> {
        (0..50_000u32)
            .flat_map(|i| format!("INSERT INTO t VALUES ({i}, 'row {i}');\n").into_bytes())
            .collect()
    }

    fn boxed(bytes: Vec<u8>) -> BoxRead {
        Box::new(Cursor::new(bytes))
    }

    fn read_all(mut reader: BoxRead) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn round_trip_for_every_format() {
        let data = payload();
        for (format, level) in [
            (Compression::Gzip, 0),
            (Compression::Gzip, 9),
            (Compression::Zstd, 3),
            (Compression::Zstd, 22),
            (Compression::None, 0),
        ] {
            let (stream, ext) = compress(boxed(data.clone()), format, level);
            let name = format!("b/db/t.data.sql{ext}");
            let restored = read_all(decompress(stream, &name)).expect("round trip");
            assert_eq!(restored, data, "format {format} level {level}");
        }
    }

    #[test]
    fn compressed_output_is_smaller_and_self_describing() {
        let data = payload();
        let (stream, ext) = compress(boxed(data.clone()), Compression::Gzip, 6);
        let compressed = read_all(stream).expect("gzip");
        assert_eq!(ext, ".gz");
        assert!(compressed.len() < data.len());
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

        let (stream, ext) = compress(boxed(data.clone()), Compression::Zstd, 3);
        let compressed = read_all(stream).expect("zstd");
        assert_eq!(ext, ".zstd");
        assert_eq!(&compressed[..4], &[0x28, 0xb5, 0x2f, 0xfd]);
    }

    #[test]
    fn extension_follows_format() {
        assert_eq!(Compression::Gzip.extension(), ".gz");
        assert_eq!(Compression::Zstd.extension(), ".zstd");
        assert_eq!(Compression::None.extension(), "");
        assert_eq!(Compression::from_name("b/x.sql.gz"), Compression::Gzip);
        assert_eq!(Compression::from_name("b/x.sql.zstd"), Compression::Zstd);
        assert_eq!(Compression::from_name("b/x.sql.lz4"), Compression::None);
    }

    #[test]
    fn levels_are_clamped() {
        assert_eq!(gzip_level(0), flate2::Compression::default());
        assert_eq!(gzip_level(12), flate2::Compression::default());
        assert_eq!(gzip_level(4), flate2::Compression::new(4));
        assert_eq!(zstd_level(-5), zstd::DEFAULT_COMPRESSION_LEVEL);
        assert_eq!(zstd_level(99), *zstd::compression_level_range().end());
        assert!(zstd_level(2) < zstd_level(19));
    }

    #[test]
    fn source_errors_propagate_to_consumer() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "source reset"))
            }
        }
        let (stream, _) = compress(Box::new(Broken), Compression::Zstd, 1);
        let err = read_all(stream).expect_err("source failure");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn decompress_selects_by_suffix_only() {
        let (stream, _) = compress(boxed(b"SELECT 1".to_vec()), Compression::Gzip, 1);
        let gz = read_all(stream).expect("gzip");
        // Bare name: bytes pass through untouched.
        assert_eq!(read_all(decompress(boxed(gz.clone()), "x.sql")).expect("raw"), gz);
        assert_eq!(
            read_all(decompress(boxed(gz), "x.sql.gz")).expect("decoded"),
            b"SELECT 1"
        );
    }

    #[test]
    fn corrupt_zstd_fails_on_read() {
        let reader = decompress(boxed(b"not zstd at all".to_vec()), "x.sql.zstd");
        assert!(read_all(reader).is_err());
    }
}
