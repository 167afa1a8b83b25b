//! Error types shared by the pipeline and its pluggable handles.

use std::io;

/// Errors produced by a connection or by the handle code it drives.
///
/// None of these cross a stage boundary: stages log them and keep going,
/// except a transport read failure, which closes the connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Read or write failure on the underlying byte stream.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// A packet could not be decoded from the stream.
    #[error("decode error: {0}")]
    Decode(String),

    /// A packet could not be turned into bytes.
    #[error("encode error: {0}")]
    Encode(String),

    /// Application handler reported a failure.
    #[error("handler error: {0}")]
    Handler(String),

    /// `run` was called on a connection whose stages are already running.
    #[error("connection pipeline is already running")]
    AlreadyRunning,

    /// The connection has been closed.
    #[error("connection is closed")]
    Closed,
}

impl Error {
    /// True for errors that mean the transport is gone.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
