//! Purpose: Bounded in-memory pipe connecting a producer thread to a blocking reader.
//! Exports: `pipe`, `PipeWriter`, `PipeReader`.
//! Role: Lets an encoder thread stream into an upload without buffering whole objects.
//! Invariants: At most `capacity` chunks are in flight; the writer blocks when full.
//! Invariants: A producer failure (or a writer dropped without `close`) surfaces as a read error.
use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

type Chunk = Result<Vec<u8>, io::Error>;

pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(capacity.max(1));
    (
        PipeWriter {
            tx: Some(tx),
            closed: false,
        },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            done: false,
        },
    )
}

pub struct PipeWriter {
    tx: Option<SyncSender<Chunk>>,
    closed: bool,
}

impl PipeWriter {
    /// Marks the stream complete; the reader sees EOF after draining.
    pub fn close(mut self) {
        self.closed = true;
        self.tx.take();
    }

    /// Ends the stream with `err`, which the reader returns after draining buffered chunks.
    pub fn fail(mut self, err: io::Error) {
        self.closed = true;
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe writer closed"))?;
        tx.send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe producer stopped before finishing the stream",
            )));
        }
    }
}

pub struct PipeReader {
    rx: Receiver<Chunk>,
    current: Vec<u8>,
    pos: usize,
    done: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.current.len() {
            if self.done {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => {
                    self.done = true;
                    return Err(err);
                }
                Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
        let available = &self.current[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::pipe;
    use std::io::{self, Read, Write};
    use std::thread;

    #[test]
    fn reader_receives_everything_written_before_close() {
        let (mut writer, mut reader) = pipe(2);
        let producer = thread::spawn(move || {
            for i in 0..100u32 {
                writer.write_all(format!("{i},").as_bytes()).expect("write");
            }
            writer.close();
        });
        let mut out = String::new();
        reader.read_to_string(&mut out).expect("read");
        producer.join().expect("join");
        let expected = (0..100u32).map(|i| format!("{i},")).collect::<String>();
        assert_eq!(out, expected);
    }

    #[test]
    fn producer_failure_reaches_reader_after_data() {
        let (mut writer, mut reader) = pipe(4);
        writer.write_all(b"partial").expect("write");
        writer.fail(io::Error::other("encoder exploded"));

        let mut buf = [0u8; 7];
        reader.read_exact(&mut buf).expect("buffered data");
        assert_eq!(&buf, b"partial");
        let err = reader.read(&mut buf).expect_err("error after data");
        assert_eq!(err.to_string(), "encoder exploded");
    }

    #[test]
    fn dropped_writer_is_not_mistaken_for_eof() {
        let (writer, mut reader) = pipe(1);
        drop(writer);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).expect_err("truncated stream");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn writer_fails_once_reader_is_gone() {
        let (mut writer, reader) = pipe(1);
        drop(reader);
        let err = writer.write(b"x").expect_err("broken pipe");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        writer.close();
    }
}
