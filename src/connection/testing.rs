//! Scripted handle, packets and transports for pipeline tests.

use super::{ConnOptions, ConnState, Connection, Stage, TimeoutKind};
use crate::error::{Error, Result};
use crate::handle::{Handle, Packet};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// One scripted decode result.
pub(crate) enum Step {
    Packet { name: String, delay: Duration },
    Fail(String),
}

impl Step {
    pub(crate) fn packet(name: &str) -> Self {
        Self::delayed(name, Duration::ZERO)
    }

    pub(crate) fn delayed(name: &str, delay: Duration) -> Self {
        Step::Packet {
            name: name.to_string(),
            delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Open,
    Message(String),
    Timeout(TimeoutKind),
    Panic(Stage),
    Close,
}

pub(crate) enum TestPacket {
    Data(Bytes),
    Slow(Bytes, Duration),
    Broken,
}

impl TestPacket {
    pub(crate) fn data(s: &str) -> Self {
        TestPacket::Data(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub(crate) fn slow(s: &str, delay: Duration) -> Self {
        TestPacket::Slow(Bytes::copy_from_slice(s.as_bytes()), delay)
    }

    fn name(&self) -> String {
        match self {
            TestPacket::Data(b) | TestPacket::Slow(b, _) => String::from_utf8_lossy(b).into_owned(),
            TestPacket::Broken => "broken".to_string(),
        }
    }
}

#[async_trait]
impl Packet for TestPacket {
    async fn serialize(&self, token: &CancellationToken) -> Result<Bytes> {
        match self {
            TestPacket::Data(b) => Ok(b.clone()),
            TestPacket::Slow(b, delay) => tokio::select! {
                _ = token.cancelled() => Err(Error::Encode("cancelled".into())),
                _ = sleep(*delay) => Ok(b.clone()),
            },
            TestPacket::Broken => Err(Error::Encode("broken packet".into())),
        }
    }
}

/// Handle that decodes from a script and records every callback.
pub(crate) struct ScriptHandle {
    script: Mutex<VecDeque<Step>>,
    events: Mutex<Vec<Event>>,
    entered: Mutex<Vec<String>>,
    closed: Mutex<Vec<ConnState>>,
    handler_delays: HashMap<String, Duration>,
    gated: Option<String>,
    gate: Semaphore,
    panicking: Option<String>,
    open_delay: Duration,
}

impl ScriptHandle {
    pub(crate) fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            events: Mutex::new(Vec::new()),
            entered: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            handler_delays: HashMap::new(),
            gated: None,
            gate: Semaphore::new(0),
            panicking: None,
            open_delay: Duration::ZERO,
        }
    }

    /// Make `on_message` for `name` sleep before finishing.
    pub(crate) fn with_handler_delay(mut self, name: &str, delay: Duration) -> Self {
        self.handler_delays.insert(name.to_string(), delay);
        self
    }

    /// Make `on_message` for `name` block until `open_gate`.
    pub(crate) fn with_gate(mut self, name: &str) -> Self {
        self.gated = Some(name.to_string());
        self
    }

    /// Make `on_message` for `name` panic.
    pub(crate) fn with_panic(mut self, name: &str) -> Self {
        self.panicking = Some(name.to_string());
        self
    }

    /// Make `on_open` sleep before recording.
    pub(crate) fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub(crate) fn open_gate(&self) {
        self.gate.add_permits(1);
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Completed `on_message` calls, in completion order.
    pub(crate) fn messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Message(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Started `on_message` calls, in start order.
    pub(crate) fn entered(&self) -> Vec<String> {
        self.entered.lock().unwrap().clone()
    }

    pub(crate) fn closed_states(&self) -> Vec<ConnState> {
        self.closed.lock().unwrap().clone()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Handle for ScriptHandle {
    type Packet = TestPacket;

    async fn decode(
        &self,
        token: CancellationToken,
        _conn: &Connection<Self>,
    ) -> Result<TestPacket> {
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Packet { name, delay }) => {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                Ok(TestPacket::data(&name))
            }
            Some(Step::Fail(msg)) => Err(Error::Decode(msg)),
            None => {
                token.cancelled().await;
                Err(Error::Closed)
            }
        }
    }

    async fn on_message(&self, _conn: &Connection<Self>, packet: TestPacket) -> Result<()> {
        let name = packet.name();
        self.entered.lock().unwrap().push(name.clone());
        if self.panicking.as_deref() == Some(name.as_str()) {
            panic!("handler for {name} blew up");
        }
        if self.gated.as_deref() == Some(name.as_str()) {
            let _ = self.gate.acquire().await;
        }
        if let Some(delay) = self.handler_delays.get(&name) {
            sleep(*delay).await;
        }
        self.record(Event::Message(name));
        Ok(())
    }

    async fn on_open(&self, _conn: &Connection<Self>) {
        if !self.open_delay.is_zero() {
            sleep(self.open_delay).await;
        }
        self.record(Event::Open);
    }

    fn on_close(&self, state: &ConnState) {
        self.closed.lock().unwrap().push(state.clone());
        self.record(Event::Close);
    }

    fn on_timeout(&self, _conn: &Connection<Self>, kind: TimeoutKind) {
        self.record(Event::Timeout(kind));
    }

    fn on_panic(&self, _conn: &Connection<Self>, stage: Stage) {
        self.record(Event::Panic(stage));
    }
}

#[derive(Default)]
struct Recorded {
    written: Vec<u8>,
    shut_down: bool,
    late_writes: usize,
}

/// Transport that never yields inbound data and records outbound bytes,
/// counting any write that arrives after shutdown.
#[derive(Clone, Default)]
pub(crate) struct RecordingTransport {
    inner: Arc<Mutex<Recorded>>,
    stalled: bool,
}

impl RecordingTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A transport whose writes never complete.
    pub(crate) fn stalled() -> Self {
        Self {
            stalled: true,
            ..Self::default()
        }
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.inner.lock().unwrap().written.clone()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.inner.lock().unwrap().shut_down
    }

    pub(crate) fn late_writes(&self) -> usize {
        self.inner.lock().unwrap().late_writes
    }
}

impl AsyncRead for RecordingTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for RecordingTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.stalled {
            return Poll::Pending;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.shut_down {
            inner.late_writes += 1;
        }
        inner.written.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.lock().unwrap().shut_down = true;
        Poll::Ready(Ok(()))
    }
}

pub(crate) fn quick_options(handle: ScriptHandle) -> ConnOptions<ScriptHandle> {
    ConnOptions::new(handle)
        .with_timeouts(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .with_debug(true)
}

pub(crate) fn duplex_conn<F>(
    handle: ScriptHandle,
    options: F,
) -> (Arc<Connection<ScriptHandle>>, DuplexStream)
where
    F: FnOnce(ScriptHandle) -> ConnOptions<ScriptHandle>,
{
    duplex_conn_with(options(handle))
}

pub(crate) fn duplex_conn_with(
    options: ConnOptions<ScriptHandle>,
) -> (Arc<Connection<ScriptHandle>>, DuplexStream) {
    let (local, peer) = tokio::io::duplex(1024);
    (Connection::new(local, "test-peer", options), peer)
}

/// Await `fut`, failing the test if it hangs.
pub(crate) async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation hung")
}

pub(crate) async fn wait_until(cond: impl Fn() -> bool) {
    within(async {
        while !cond() {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
}
