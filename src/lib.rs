//! conn-pipeline: per-connection pipeline for stream-oriented servers.
//!
//! Each accepted byte stream is wrapped in a [`Connection`] that runs four
//! tasks:
//! - receive: decodes packets through the [`Handle`] under a deadline
//! - forward: announces the connection, then moves packets to dispatch
//! - dispatch: runs the handler for each packet under a deadline
//! - send: serializes and writes outbound [`Packet`]s under a deadline
//!
//! Stages are joined by bounded queues and stopped by one cancellation
//! token per connection. Deadlines notify the handle and never close the
//! connection; only a failed read or an explicit close does.

pub mod config;
pub mod connection;
pub mod echo;
pub mod error;
pub mod handle;
pub mod race;
pub mod server;

pub use config::{Config, ConfigError, PipelineConfig};
pub use connection::{ConnOptions, ConnState, Connection, Running, Stage, TimeoutKind};
pub use error::{Error, Result};
pub use handle::{Handle, Packet};
pub use race::{Race, Racer};
pub use server::Server;
