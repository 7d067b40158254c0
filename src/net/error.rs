use std::io;

use quinn::{ConnectError, ConnectionError, ReadExactError, WriteError};

/// Why a call to a peer did not produce a response.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no peer answers on {0}")]
    Unreachable(String),
    #[error("peer did not answer in time")]
    TimedOut,
    #[error("cannot resolve address {0}")]
    BadAddress(String),
    #[error("connect failed: {0}")]
    Connect(ConnectError),
    #[error("connection failed: {0}")]
    Connection(ConnectionError),
    #[error("stream write failed: {0}")]
    Write(WriteError),
    #[error("stream read failed: {0}")]
    ReadExact(ReadExactError),
    #[error("i/o: {0}")]
    Io(io::Error),
    #[error("could not decode message")]
    CouldNotDecodeMessage,
    #[error("could not encode message")]
    CouldNotEncodeMessage,
    #[error("message length overflowed")]
    MessageLengthOverflowed,
    #[error("peer rejected the request: {0}")]
    Rejected(String),
    #[error("peer sent an unexpected response")]
    UnexpectedResponse,
}

impl From<ConnectError> for TransportError {
    fn from(error: ConnectError) -> Self {
        Self::Connect(error)
    }
}

impl From<ConnectionError> for TransportError {
    fn from(error: ConnectionError) -> Self {
        Self::Connection(error)
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WriteError> for TransportError {
    fn from(e: WriteError) -> Self {
        Self::Write(e)
    }
}

impl From<ReadExactError> for TransportError {
    fn from(e: ReadExactError) -> Self {
        Self::ReadExact(e)
    }
}

impl From<tokio::time::error::Elapsed> for TransportError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::TimedOut
    }
}
