//! Connection wrapper: one accepted byte stream driven by a
//! receive / forward / dispatch / send pipeline.
//!
//! ```text
//!  transport ──decode──▶ [recv queue] ──forward──▶ [dispatch queue] ──on_message
//!  send() ──────────────▶ [send queue] ──serialize + write──▶ transport
//! ```
//!
//! Every stage and every queue hand-off observes the connection's
//! cancellation token. `close()` (or a failed read) cancels it; the stages
//! then wind down and the forwarder closes the dispatch queue followed by
//! the send queue.

mod options;
mod pipeline;
mod state;

#[cfg(test)]
mod testing;

pub use options::{
    ConnOptions, DEFAULT_DISPATCH_QUEUE, DEFAULT_MAX_STALLED, DEFAULT_RECV_QUEUE,
    DEFAULT_SEND_QUEUE, DEFAULT_TIMEOUT,
};
pub use state::{ConnState, Stage, TimeoutKind};

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::race::Racer;
use bytes::BytesMut;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info_span, Instrument, Span};

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Terminal message for an explicit close.
const CLOSED_MESSAGE: &str = "conn is closed";

/// Queue ends handed to the stage tasks by `run`.
struct Pipes<P> {
    recv_tx: mpsc::Sender<P>,
    recv_rx: mpsc::Receiver<P>,
    dispatch_tx: mpsc::Sender<P>,
    dispatch_rx: mpsc::Receiver<P>,
    send_rx: mpsc::Receiver<P>,
}

/// One accepted connection and its pipeline.
pub struct Connection<H: Handle> {
    reader: Mutex<Reader>,
    writer: Mutex<Writer>,
    remote_addr: String,
    options: ConnOptions<H>,
    state: StdMutex<ConnState>,
    token: CancellationToken,
    racer: Racer,
    closing: AtomicBool,
    /// Producer side of the send queue. `send` holds a read guard while
    /// enqueueing; the forwarder takes the write guard to close it.
    send_tx: RwLock<Option<mpsc::Sender<H::Packet>>>,
    pipes: StdMutex<Option<Pipes<H::Packet>>>,
    span: Span,
}

/// Stage tasks of a running connection.
pub struct Running {
    tracker: TaskTracker,
}

impl Running {
    /// Wait until every stage has exited.
    pub async fn join(&self) {
        self.tracker.wait().await;
    }

    /// Number of stages still running.
    pub fn active_stages(&self) -> usize {
        self.tracker.len()
    }
}

impl<H: Handle> Connection<H> {
    /// Wrap an established byte stream.
    pub fn new<S>(stream: S, remote_addr: impl Into<String>, options: ConnOptions<H>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(Box::new(reader), Box::new(writer), remote_addr.into(), options)
    }

    /// Wrap an accepted TCP stream.
    pub fn from_tcp(stream: TcpStream, options: ConnOptions<H>) -> io::Result<Arc<Self>> {
        let remote_addr = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(
            Box::new(reader),
            Box::new(writer),
            remote_addr,
            options,
        ))
    }

    fn from_parts(
        reader: Reader,
        writer: Writer,
        remote_addr: String,
        options: ConnOptions<H>,
    ) -> Arc<Self> {
        let token = CancellationToken::new();
        let (recv_tx, recv_rx) = mpsc::channel(options.recv_queue.max(1));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(options.dispatch_queue.max(1));
        let (send_tx, send_rx) = mpsc::channel(options.send_queue.max(1));

        Arc::new(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            state: StdMutex::new(ConnState::new(remote_addr.clone())),
            racer: Racer::new(token.clone(), options.max_stalled),
            span: info_span!("conn", peer = %remote_addr),
            remote_addr,
            options,
            token,
            closing: AtomicBool::new(false),
            send_tx: RwLock::new(Some(send_tx)),
            pipes: StdMutex::new(Some(Pipes {
                recv_tx,
                recv_rx,
                dispatch_tx,
                dispatch_rx,
                send_rx,
            })),
        })
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn options(&self) -> &ConnOptions<H> {
        &self.options
    }

    pub fn handle(&self) -> &H {
        &self.options.handle
    }

    /// Snapshot of the connection state.
    pub fn state(&self) -> ConnState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The connection's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// True once the connection has started closing.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Start the pipeline stages.
    pub fn run(self: &Arc<Self>) -> Result<Running> {
        let pipes = self
            .pipes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::AlreadyRunning)?;

        let tracker = TaskTracker::new();
        tracker.spawn(
            Arc::clone(self)
                .receive_stage(pipes.recv_tx)
                .instrument(self.span.clone()),
        );
        tracker.spawn(
            Arc::clone(self)
                .forward_stage(pipes.recv_rx, pipes.dispatch_tx)
                .instrument(self.span.clone()),
        );
        tracker.spawn(
            Arc::clone(self)
                .dispatch_stage(pipes.dispatch_rx)
                .instrument(self.span.clone()),
        );
        tracker.spawn(
            Arc::clone(self)
                .send_stage(pipes.send_rx)
                .instrument(self.span.clone()),
        );
        tracker.close();

        Ok(Running { tracker })
    }

    /// Read from the transport.
    ///
    /// A read error or end of stream closes the connection. End of stream
    /// is reported as `Ok(0)`; reads on a closed connection fail with
    /// `Error::Closed`.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let res = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(Error::Closed),
            res = async {
                let mut reader = self.reader.lock().await;
                reader.read(buf).await
            } => res,
        };
        self.after_read(res, buf.is_empty()).await
    }

    /// Read from the transport into `buf`. Same close rules as `read`.
    pub async fn read_buf(&self, buf: &mut BytesMut) -> Result<usize> {
        let res = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(Error::Closed),
            res = async {
                let mut reader = self.reader.lock().await;
                reader.read_buf(buf).await
            } => res,
        };
        self.after_read(res, false).await
    }

    async fn after_read(&self, res: io::Result<usize>, empty: bool) -> Result<usize> {
        match res {
            Ok(0) if !empty => {
                self.close_with("connection closed by peer").await;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                error!(error = %e, "transport read failed");
                self.close_with(&format!("read failed: {e}")).await;
                Err(e.into())
            }
        }
    }

    /// Write all of `data` to the transport. Write failures leave the
    /// connection open.
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Closed),
            res = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(data).await?;
                writer.flush().await
            } => res.map_err(Error::from),
        }
    }

    /// Queue a packet for sending.
    ///
    /// `None` is rejected with an error log. If the connection closes
    /// before the packet is queued it is dropped silently.
    pub async fn send(&self, packet: impl Into<Option<H::Packet>>) {
        let Some(packet) = packet.into() else {
            error!("packet is none, nothing to send");
            return;
        };

        let producer = tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            guard = self.send_tx.read() => guard,
        };
        let Some(tx) = producer.as_ref() else {
            return;
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                self.trace("send cancelled, packet dropped");
            }
            res = tx.send(packet) => {
                if res.is_err() {
                    self.trace("send queue receiver gone, packet dropped");
                }
            }
        }
    }

    /// Close the connection.
    ///
    /// Runs once: later or concurrent calls return immediately. Stamps the
    /// state, notifies the handle, cancels the pipeline and shuts the
    /// transport down.
    pub async fn close(&self) {
        self.close_with(CLOSED_MESSAGE).await;
    }

    async fn close_with(&self, message: &str) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let state = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.complete(message);
            state.clone()
        };
        self.options.handle.on_close(&state);
        self.token.cancel();

        // In-flight writes observe the token and release the writer.
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(self.options.send_timeout, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "transport shutdown failed"),
            Err(_) => debug!("transport shutdown timed out"),
        }
        self.trace("connection closed");
    }

    /// Close the producer side of the send queue once no `send` holds it.
    async fn close_send_queue(&self) {
        self.send_tx.write().await.take();
    }

    fn trace(&self, event: &str) {
        if self.options.debug {
            debug!("{event}");
        }
    }
}
