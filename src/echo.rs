//! Echo handle: replies to every chunk read with the same bytes.
//!
//! Packets are raw reads of up to `CHUNK_SIZE` bytes; there is no framing.
//! Useful for exercising the pipeline end to end.

use crate::connection::{ConnState, Connection, Stage, TimeoutKind};
use crate::error::{Error, Result};
use crate::handle::Handle;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Maximum bytes taken from the stream per packet.
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandle;

#[async_trait]
impl Handle for EchoHandle {
    type Packet = Bytes;

    async fn decode(&self, _token: CancellationToken, conn: &Connection<Self>) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        let n = conn.read_buf(&mut buf).await?;
        if n == 0 {
            // read_buf already closed the connection
            return Err(Error::Closed);
        }
        Ok(buf.freeze())
    }

    async fn on_message(&self, conn: &Connection<Self>, packet: Bytes) -> Result<()> {
        debug!(len = packet.len(), "echo");
        conn.send(packet).await;
        Ok(())
    }

    async fn on_open(&self, conn: &Connection<Self>) {
        info!(peer = conn.remote_addr(), "client connected");
    }

    fn on_close(&self, state: &ConnState) {
        info!(state = %state, "client disconnected");
    }

    fn on_timeout(&self, conn: &Connection<Self>, kind: TimeoutKind) {
        debug!(peer = conn.remote_addr(), kind = %kind, "stage timeout");
    }

    fn on_panic(&self, conn: &Connection<Self>, stage: Stage) {
        error!(peer = conn.remote_addr(), stage = %stage, "callback panicked");
    }
}
