//! Pipeline stages of a connection.
//!
//! Each stage is a long-lived task owning its queue ends. Queue closure
//! follows ownership: the receive stage drops the receive queue sender on
//! exit, the forwarder drops the dispatch queue sender and then closes the
//! send queue, in that order.

use super::{Connection, Stage, TimeoutKind};
use crate::error::{Error, Result};
use crate::handle::{Handle, Packet};
use crate::race::{Completion, Lost, Race};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, warn};

impl<H: Handle> Connection<H> {
    /// Decode packets and push them onto the receive queue.
    ///
    /// A decode that outlives the receive timeout is reported through
    /// `on_timeout` and then waited on again, so a slow packet is still
    /// delivered and only one decode reads the transport at a time.
    pub(super) async fn receive_stage(self: Arc<Self>, queue: mpsc::Sender<H::Packet>) {
        let mut pending: Option<Completion<Result<H::Packet>>> = None;

        loop {
            let deadline = Instant::now() + self.options.recv_timeout;
            let mut decode = match pending.take() {
                Some(decode) => decode,
                None => {
                    let conn = Arc::clone(&self);
                    let started = self
                        .racer
                        .start(deadline, async move {
                            let token = conn.token();
                            conn.options.handle.decode(token, &conn).await
                        })
                        .await;
                    match started {
                        Ok(decode) => decode,
                        Err(Lost::Cancelled) => break,
                        Err(Lost::Elapsed) => {
                            self.options.handle.on_timeout(&self, TimeoutKind::Receive);
                            continue;
                        }
                    }
                }
            };

            match decode.race(deadline, &self.token).await {
                Race::Completed(Ok(packet)) => {
                    self.trace("read a packet");
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => break,
                        res = queue.send(packet) => {
                            if res.is_err() {
                                break;
                            }
                        }
                    }
                }
                Race::Completed(Err(Error::Closed)) if self.is_closed() => break,
                Race::Completed(Err(e)) => warn!(error = %e, "decode failed"),
                Race::Elapsed => {
                    self.options.handle.on_timeout(&self, TimeoutKind::Receive);
                    pending = Some(decode);
                }
                Race::Cancelled => break,
                Race::Panicked => {
                    error!("decode panicked");
                    self.options.handle.on_panic(&self, Stage::Receive);
                }
            }
        }

        drop(queue);
        self.trace("receive queue closed");
        self.trace("receive stage exit");
    }

    /// Announce the connection, then move packets from the receive queue to
    /// the dispatch queue until cancelled.
    pub(super) async fn forward_stage(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<H::Packet>,
        outbound: mpsc::Sender<H::Packet>,
    ) {
        let conn = Arc::clone(&self);
        let opened = self
            .racer
            .race(self.options.send_timeout, async move {
                conn.options.handle.on_open(&conn).await
            })
            .await;
        match opened {
            Race::Elapsed => warn!("on_open did not finish within the send timeout"),
            Race::Panicked => {
                error!("on_open panicked");
                self.options.handle.on_panic(&self, Stage::Open);
            }
            Race::Completed(()) | Race::Cancelled => {}
        }

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                item = inbound.recv() => {
                    let Some(packet) = item else {
                        error!("receive queue closed");
                        break;
                    };
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => break,
                        res = outbound.send(packet) => {
                            if res.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        drop(outbound);
        self.trace("dispatch queue closed");
        self.close_send_queue().await;
        self.trace("send queue closed");
        self.trace("forward stage exit");
    }

    /// Run `on_message` for each packet on the dispatch queue.
    pub(super) async fn dispatch_stage(self: Arc<Self>, mut queue: mpsc::Receiver<H::Packet>) {
        loop {
            let packet = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                item = queue.recv() => match item {
                    Some(packet) => packet,
                    None => {
                        error!("dispatch queue closed");
                        break;
                    }
                },
            };

            let conn = Arc::clone(&self);
            let handled = self
                .racer
                .race(self.options.dispatch_timeout, async move {
                    conn.options.handle.on_message(&conn, packet).await
                })
                .await;
            match handled {
                Race::Completed(Ok(())) => self.trace("handled a packet"),
                Race::Completed(Err(e)) => warn!(error = %e, "message handler failed"),
                Race::Elapsed => self.options.handle.on_timeout(&self, TimeoutKind::Dispatch),
                Race::Cancelled => break,
                Race::Panicked => {
                    error!("message handler panicked");
                    self.options.handle.on_panic(&self, Stage::Dispatch);
                }
            }
        }

        self.trace("dispatch stage exit");
    }

    /// Serialize and write each packet on the send queue.
    ///
    /// Stops without draining on cancellation. A failed packet is logged and
    /// skipped.
    pub(super) async fn send_stage(self: Arc<Self>, mut queue: mpsc::Receiver<H::Packet>) {
        loop {
            let packet = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                item = queue.recv() => match item {
                    Some(packet) => packet,
                    None => {
                        self.trace("send queue drained after close");
                        break;
                    }
                },
            };

            // Cancelled when this packet's deadline passes.
            let scope = self.token.child_token();
            let conn = Arc::clone(&self);
            let op_scope = scope.clone();
            let sent = self
                .racer
                .race(self.options.send_timeout, async move {
                    let data: Bytes = packet.serialize(&op_scope).await?;
                    if op_scope.is_cancelled() {
                        return Ok(false);
                    }
                    conn.write_all(&data).await?;
                    Ok::<_, Error>(true)
                })
                .await;
            match sent {
                Race::Completed(Ok(true)) => self.trace("sent a packet"),
                Race::Completed(Ok(false)) => {}
                Race::Completed(Err(Error::Closed)) if self.is_closed() => break,
                Race::Completed(Err(e)) => warn!(error = %e, "send failed"),
                Race::Elapsed => {
                    scope.cancel();
                    self.options.handle.on_timeout(&self, TimeoutKind::Send);
                }
                Race::Cancelled => break,
                Race::Panicked => {
                    error!("packet serializer panicked");
                    self.options.handle.on_panic(&self, Stage::Send);
                }
            }
        }

        self.trace("send stage exit");
    }
}
