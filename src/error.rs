use std::io;
use std::path::Path;
use thiserror::Error;

/// Errors raised while reading an ARPA model or compiling it.
///
/// Public functions return `anyhow::Result`; when one of these is the
/// cause it can be recovered with `err.downcast_ref::<ArpaError>()`.
#[derive(Debug, Error)]
pub enum ArpaError {
    /// Structural violation in the ARPA text (header, section order, fields).
    #[error("line {line} [{text}]: {reason}")]
    MalformedArpa {
        line: usize,
        text: String,
        reason: String,
    },
    /// Declared and actual number of n-grams in a section differ.
    #[error("header said there would be {declared} n-grams of order {order}, but the file has {actual}")]
    CountMismatch {
        order: usize,
        declared: usize,
        actual: usize,
    },
    #[error("malformed symbol table {location}: {reason}")]
    MalformedSymbolTable { location: String, reason: String },
    /// A token is missing from a frozen (externally supplied) symbol table.
    #[error("symbol '{symbol}' not found in symbol table {table}")]
    UnknownSymbol { symbol: String, table: String },
    #[error("I/O error on {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl ArpaError {
    pub(crate) fn malformed(line: usize, text: &str, reason: impl Into<String>) -> Self {
        ArpaError::MalformedArpa {
            line,
            text: text.to_string(),
            reason: reason.into(),
        }
    }

    /// Adapter for `map_err` on I/O performed against `path`.
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| ArpaError::Io {
            location: path.display().to_string(),
            source,
        }
    }
}
