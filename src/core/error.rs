use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// On-disk state that cannot be right: bad signature, impossible page
    /// type, out-of-range key offset, posting list that fails to decode.
    Corruption,
    /// A broken caller contract: zero doc-nr, unsorted posting list,
    /// over-long key, storing into a closed databank.
    InvariantViolation,
    NotFound,
    Io,
    Parse,
    Cancelled,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
    /// Byte position in the query string for parse errors.
    pub position: Option<usize>,
}

impl Error {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Error { kind, context: context.into(), position: None }
    }

    pub fn corruption(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Corruption, context)
    }

    pub fn invariant(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvariantViolation, context)
    }

    pub fn not_found(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, context)
    }

    pub fn parse(position: usize, context: impl Into<String>) -> Self {
        Error { kind: ErrorKind::Parse, context: context.into(), position: Some(position) }
    }

    pub fn cancelled() -> Self {
        Error::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn io(err: std::io::Error, context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Io, format!("{}: {}", context.into(), err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.position {
            Some(pos) => write!(f, "{:?} at {}: {}", self.kind, pos, self.context),
            None => write!(f, "{:?}: {}", self.kind, self.context),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Parse, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
