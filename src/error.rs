use std::error;
use std::fmt;
use std::io::{self, ErrorKind};

pub type Result<T> = std::result::Result<T, Error>;

/// An error returned by a connection core operation.
#[derive(Debug)]
pub enum Error {
    /// An argument was invalid (empty send buffer, malformed address, etc.).
    Invalid,
    /// The core has been shut down.
    NotInit,
    /// The handle does not correspond to a live connection.
    NotFound,
    /// The connection is already started or connected.
    IsConn,
    /// The connection has not completed the RDMnet handshake.
    NotConn,
    /// The operation cannot be performed while a connection is in progress.
    Busy,
    /// The connection limit has been reached.
    NoMem,
    /// The operation was disabled by the core configuration.
    NotImpl,
    /// An internal library or system call error occurred.
    Sys,
    /// A non-blocking operation could not complete without waiting.
    WouldBlock,
    /// A socket operation timed out.
    TimedOut,
    /// The connection was refused at the TCP level.
    ConnRefused,
    /// The peer violated the RDMnet framing rules.
    Protocol(&'static str),
    /// An unclassified I/O error.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Io(ref error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        match error.kind() {
            ErrorKind::WouldBlock => Error::WouldBlock,
            ErrorKind::ConnectionRefused => Error::ConnRefused,
            ErrorKind::TimedOut => Error::TimedOut,
            _ => Error::Io(error),
        }
    }
}
