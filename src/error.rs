//! Error kinds shared by every stage of the image builder.

use std::error;
use std::fmt;
use std::io;

/// Result alias used across the builder.
pub type Result<T> = std::result::Result<T, Error>;

/// The classes of failure the builder distinguishes.
#[derive(Debug)]
pub enum Error {
    /// Geometry or option combination that violates an invariant.
    InvalidArgument(String),
    /// Requested metadata does not fit into the volume.
    OutOfSpace(String),
    /// A device operation failed or transferred short.
    Io(io::Error),
    /// The device is mounted or holds something the user did not force over.
    DeviceState(String),
    /// An internal invariant did not hold.
    Internal(String),
}

impl Error {
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn no_space<S: Into<String>>(msg: S) -> Self {
        Error::OutOfSpace(msg.into())
    }

    pub fn device<S: Into<String>>(msg: S) -> Self {
        Error::DeviceState(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(fmt, "invalid argument: {msg}"),
            Error::OutOfSpace(msg) => write!(fmt, "out of space: {msg}"),
            Error::Io(err) => write!(fmt, "I/O error: {err}"),
            Error::DeviceState(msg) => write!(fmt, "device state: {msg}"),
            Error::Internal(msg) => write!(fmt, "internal error: {msg}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_carries_the_kind() {
        let err = Error::invalid("page size 100 is not a power of two");
        assert!(format!("{err}").starts_with("invalid argument:"));

        let err = Error::from(io::Error::new(io::ErrorKind::Other, "short write"));
        assert!(format!("{err}").starts_with("I/O error:"));
    }
}
