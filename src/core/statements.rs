//! Purpose: Split a SQL byte stream into statements on unquoted semicolons.
//! Exports: `Statement`, `StatementReader`.
//! Role: Restore-side parser between data object download and statement execution.
//! Invariants: Never splits inside '...', "..." or `...`; a backslash escapes the next byte.
//! Invariants: Empty statements (after trimming) are skipped; a trailing unterminated
//! statement is still emitted, including one with dangling quotes.
//! Invariants: Single pass, byte oriented; multi-byte UTF-8 never matches the ASCII
//! delimiters, so statement bodies are passed through byte for byte.
use crate::core::error::{Error, Result};
use std::io::{BufRead, BufReader, Read};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Statement(Vec<u8>);

impl Statement {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn first_line(&self) -> String {
        let end = self
            .0
            .iter()
            .position(|byte| *byte == b'\n')
            .unwrap_or(self.0.len());
        String::from_utf8_lossy(&self.0[..end]).trim().to_string()
    }
}

#[derive(Default)]
struct QuoteState {
    single: bool,
    double: bool,
    backtick: bool,
    escaped: bool,
}

impl QuoteState {
    fn quoted(&self) -> bool {
        self.single || self.double || self.backtick
    }

    /// Returns `true` when `byte` terminates the current statement.
    fn advance(&mut self, byte: u8) -> bool {
        if self.escaped {
            self.escaped = false;
            return false;
        }
        match byte {
            b'\\' => self.escaped = true,
            b'\'' if !self.double && !self.backtick => self.single = !self.single,
            b'"' if !self.single && !self.backtick => self.double = !self.double,
            b'`' if !self.single && !self.double => self.backtick = !self.backtick,
            b';' if !self.quoted() => return true,
            _ => {}
        }
        false
    }
}

pub struct StatementReader<R> {
    reader: BufReader<R>,
    state: QuoteState,
    buffer: Vec<u8>,
    finished: bool,
}

impl<R: Read> StatementReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            state: QuoteState::default(),
            buffer: Vec::new(),
            finished: false,
        }
    }

    fn take_statement(&mut self) -> Option<Statement> {
        let statement = self.buffer.trim_ascii().to_vec();
        self.buffer.clear();
        self.state = QuoteState::default();
        if statement.is_empty() {
            None
        } else {
            Some(Statement(statement))
        }
    }

    fn next_statement(&mut self) -> Result<Option<Statement>> {
        loop {
            let chunk = self
                .reader
                .fill_buf()
                .map_err(|err| Error::from_io("failed to read statement stream", err))?;
            if chunk.is_empty() {
                self.finished = true;
                return Ok(self.take_statement());
            }

            let mut consumed = 0;
            let mut terminated = false;
            for &byte in chunk {
                consumed += 1;
                if self.state.advance(byte) {
                    terminated = true;
                    break;
                }
                self.buffer.push(byte);
            }
            self.reader.consume(consumed);

            if terminated {
                if let Some(statement) = self.take_statement() {
                    return Ok(Some(statement));
                }
            }
        }
    }
}

impl<R: Read> Iterator for StatementReader<R> {
    type Item = Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_statement() {
            Ok(Some(statement)) => Some(Ok(statement)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
