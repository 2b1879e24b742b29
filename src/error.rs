use std::{fmt, io, result::Result as StdResult};

pub type Result<T> = StdResult<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// An OS-level failure, usually from registering or deregistering a
    /// descriptor with the polling instance.
    Io(io::Error),
    /// A descriptor was added with an interest mask containing neither
    /// read nor write readiness.
    InvalidInterest,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO Error: {}", e),
            Error::InvalidInterest => {
                write!(f, "interest mask must include read or write readiness")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::InvalidInterest => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
