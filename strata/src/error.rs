use std::fmt;

/// Result alias used across the engine.
pub type CResult<T> = Result<T, Error>;

/// Engine-wide error taxonomy.
///
/// Storage primitives surface `Io` and `Corrupt` unchanged; higher layers
/// translate them into domain errors once the affected object is known.
/// Request handlers never mask an error: every variant maps to a stable
/// numeric status code carried in the response message.
#[derive(Debug)]
pub enum Error {
    /// Database, table, column, user, token or session does not exist.
    NotFound(String),

    /// Creation collided with an existing object.
    AlreadyExists(String),

    /// Caller lacks the required permission bits.
    PermissionDenied(String),

    /// Name format, out-of-range value, too-long record and similar.
    InvalidArgument(String),

    /// An on-disk record fails a structural invariant.
    Corrupt(String),

    /// Underlying read/write/open/stat failed.
    Io(std::io::Error),

    /// Authentication failed before a session was opened.
    Unauthenticated(String),

    /// Duplicate name, rejected next-TRID, duplicate column in a row.
    Conflict(String),

    /// The request was aborted because the engine is shutting down.
    Cancelled,
}

impl Error {
    /// Stable numeric status code; `0` is reserved for success.
    pub fn status_code(&self) -> u32 {
        match self {
            Error::NotFound(_) => 2,
            Error::AlreadyExists(_) => 3,
            Error::PermissionDenied(_) => 4,
            Error::InvalidArgument(_) => 5,
            Error::Corrupt(_) => 6,
            Error::Io(_) => 7,
            Error::Unauthenticated(_) => 8,
            Error::Conflict(_) => 9,
            Error::Cancelled => 10,
        }
    }

    /// OS error code for I/O failures, 0 otherwise.
    pub fn os_error_code(&self) -> i32 {
        match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::AlreadyExists(msg) => write!(f, "already exists: {}", msg),
            Error::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::Corrupt(msg) => write!(f, "corrupt data: {}", msg),
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::Unauthenticated(msg) => write!(f, "{}", msg),
            Error::Conflict(msg) => write!(f, "conflict: {}", msg),
            Error::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
