//! Purpose: Crate-wide error value shared by storage, codec, and orchestrators.
//! Exports: `Error`, `ErrorKind`, `Result`, `to_exit_code`.
//! Role: Single error type so job errors can be collected and reported uniformly.
//! Invariants: `ErrorKind` is the only thing callers branch on; messages are for humans.
//! Invariants: Exit codes per kind are stable across releases.
use std::error::Error as StdError;
use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Config,
    NotFound,
    Io,
    Execution,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    object: Option<String>,
    statement: Option<String>,
    candidates: Vec<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            object: None,
            statement: None,
            candidates: Vec::new(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Storage object (logical or physical name) the error originated from.
    pub fn object(&self) -> Option<&str> {
        self.object.as_deref()
    }

    /// First line of the statement the destination rejected.
    pub fn statement(&self) -> Option<&str> {
        self.statement.as_deref()
    }

    /// Physical names probed before giving up on a download.
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    /// Keeps only the first line of `statement`.
    pub fn with_statement(mut self, statement: &str) -> Self {
        let first = statement.lines().next().unwrap_or_default().trim();
        self.statement = Some(first.to_string());
        self
    }

    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Error::new(ErrorKind::Io)
            .with_message(message)
            .with_source(source)
    }

    /// Recovers an `Error` that travelled through an `io::Error` (e.g. across a pipe).
    pub fn from_io(message: impl Into<String>, err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(inner) = inner.downcast::<Error>() {
                    return *inner;
                }
            }
            return Error::new(ErrorKind::Io).with_message(message);
        }
        Error::io(message, err)
    }

    pub fn into_io(self) -> io::Error {
        io::Error::other(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(object) = &self.object {
            write!(f, " (object: {object})")?;
        }
        if let Some(statement) = &self.statement {
            write!(f, " (statement: {statement})")?;
        }
        if !self.candidates.is_empty() {
            write!(f, " (tried: {})", self.candidates.join(", "))?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Config => 3,
        ErrorKind::NotFound => 4,
        ErrorKind::Io => 5,
        ErrorKind::Execution => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::Config, 3),
            (ErrorKind::NotFound, 4),
            (ErrorKind::Io, 5),
            (ErrorKind::Execution, 6),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn statement_keeps_first_line_only() {
        let err = Error::new(ErrorKind::Execution)
            .with_statement("INSERT INTO t VALUES\n(1, 'a'),\n(2, 'b')");
        assert_eq!(err.statement(), Some("INSERT INTO t VALUES"));
    }

    #[test]
    fn error_survives_io_round_trip() {
        let original = Error::new(ErrorKind::NotFound).with_object("b/db.database.sql");
        let recovered = Error::from_io("read failed", original.into_io());
        assert_eq!(recovered.kind(), ErrorKind::NotFound);
        assert_eq!(recovered.object(), Some("b/db.database.sql"));
    }

    #[test]
    fn display_lists_candidates() {
        let err = Error::new(ErrorKind::NotFound)
            .with_message("object not found")
            .with_candidates(vec!["x.gz".to_string(), "x".to_string()]);
        assert_eq!(err.to_string(), "NotFound: object not found (tried: x.gz, x)");
    }
}
