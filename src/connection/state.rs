//! Connection state record and timeout kinds.

use chrono::{DateTime, Local};
use std::fmt;

/// Which stage's deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Decoding an inbound packet took too long.
    Receive,
    /// Serializing or writing an outbound packet took too long.
    Send,
    /// The message handler took too long.
    Dispatch,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Receive => write!(f, "receive"),
            TimeoutKind::Send => write!(f, "send"),
            TimeoutKind::Dispatch => write!(f, "dispatch"),
        }
    }
}

/// Pipeline step whose callback panicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Receive,
    Open,
    Dispatch,
    Send,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Receive => write!(f, "receive"),
            Stage::Open => write!(f, "open"),
            Stage::Dispatch => write!(f, "dispatch"),
            Stage::Send => write!(f, "send"),
        }
    }
}

/// Lifecycle record of one connection.
///
/// Set at construction and stamped once when the connection closes.
/// `complete_time` stays `None` until then.
#[derive(Debug, Clone)]
pub struct ConnState {
    /// When the connection was wrapped.
    pub active_time: DateTime<Local>,
    /// Peer address of the transport.
    pub remote_addr: String,
    /// Terminal message, empty while open.
    pub message: String,
    /// When the connection closed.
    pub complete_time: Option<DateTime<Local>>,
}

impl ConnState {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            active_time: Local::now(),
            remote_addr: remote_addr.into(),
            message: String::new(),
            complete_time: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete_time.is_some()
    }

    /// How long the connection lived, once closed.
    pub fn lifetime(&self) -> Option<chrono::Duration> {
        self.complete_time.map(|done| done - self.active_time)
    }

    pub(crate) fn complete(&mut self, message: impl Into<String>) {
        self.message = message.into();
        self.complete_time = Some(Local::now());
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "remote={} active={}",
            self.remote_addr,
            self.active_time.format("%Y-%m-%d %H:%M:%S%.3f")
        )?;
        if let Some(done) = self.complete_time {
            write!(
                f,
                " complete={} message={:?}",
                done.format("%Y-%m-%d %H:%M:%S%.3f"),
                self.message
            )?;
        }
        Ok(())
    }
}
