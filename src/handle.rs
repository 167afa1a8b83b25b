//! Capabilities the pipeline drives: the application `Handle` and the
//! outbound `Packet`.
//!
//! One `Handle` value is shared by every connection of a server, so
//! implementations must tolerate concurrent calls from many connections.
//! The pipeline does no locking around it.

use crate::connection::{ConnState, Connection, Stage, TimeoutKind};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// A unit of application data that can be turned into bytes.
#[async_trait]
pub trait Packet: Send + Sync + 'static {
    /// Produce the wire bytes.
    ///
    /// `token` is cancelled if the send deadline passes or the connection
    /// closes; long-running serializers should stop when it fires.
    async fn serialize(&self, token: &CancellationToken) -> Result<Bytes>;
}

#[async_trait]
impl Packet for Bytes {
    async fn serialize(&self, _token: &CancellationToken) -> Result<Bytes> {
        Ok(self.clone())
    }
}

#[async_trait]
impl Packet for Vec<u8> {
    async fn serialize(&self, _token: &CancellationToken) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self))
    }
}

/// Application callbacks invoked by a connection's pipeline stages.
#[async_trait]
pub trait Handle: Sized + Send + Sync + 'static {
    type Packet: Packet;

    /// Read one packet from the connection.
    ///
    /// `token` is the connection's cancellation token. An error ends this
    /// attempt only; the receive stage logs it and tries again. To end the
    /// connection, close it (a failed `Connection::read` already does).
    async fn decode(&self, token: CancellationToken, conn: &Connection<Self>)
        -> Result<Self::Packet>;

    /// Handle one inbound packet. Called in receive order.
    async fn on_message(&self, conn: &Connection<Self>, packet: Self::Packet) -> Result<()>;

    /// Called once before any packet is dispatched.
    async fn on_open(&self, _conn: &Connection<Self>) {}

    /// Called once when the connection closes, with the stamped state.
    fn on_close(&self, _state: &ConnState) {}

    /// Called whenever a stage's deadline passes before its callback finishes.
    fn on_timeout(&self, _conn: &Connection<Self>, _kind: TimeoutKind) {}

    /// Called when a callback run by `stage` panicked. The stage carries on
    /// with its next item.
    fn on_panic(&self, _conn: &Connection<Self>, _stage: Stage) {}
}
