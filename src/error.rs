use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    NotFound(String),
    IllegalState(String),
    Corruption(String),
    ResourceExhausted(String),
    AlreadyPresent(String),
    InvalidArgument(String),
    Encoding(String),
    Frozen,
    MutexPoisoned,
}

impl Error {
    /// True for the "store cannot serve this snapshot" outcome, which callers
    /// are expected to handle rather than report.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            Error::Corruption(msg) => write!(f, "Corruption: {}", msg),
            Error::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Error::AlreadyPresent(msg) => write!(f, "Already present: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            Error::Frozen => write!(f, "Delta store is frozen"),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
        }
    }
}

impl std::error::Error for Error {}
