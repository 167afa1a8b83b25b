//! Per-connection options, fixed once the connection is built.

use crate::handle::Handle;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_RECV_QUEUE: usize = 16;
pub const DEFAULT_DISPATCH_QUEUE: usize = 1;
pub const DEFAULT_SEND_QUEUE: usize = 16;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_STALLED: usize = 64;

/// Options for one connection's pipeline.
///
/// Queue depths below one are raised to one.
pub struct ConnOptions<H> {
    /// Depth of the queue between the receive stage and the forwarder.
    pub recv_queue: usize,
    /// Depth of the queue feeding the dispatch stage.
    pub dispatch_queue: usize,
    /// Depth of the outbound queue feeding the send stage.
    pub send_queue: usize,
    pub recv_timeout: Duration,
    pub send_timeout: Duration,
    pub dispatch_timeout: Duration,
    /// Cap on raced callbacks that may still be running after losing.
    pub max_stalled: usize,
    /// Emit framework-internal debug events.
    pub debug: bool,
    pub handle: Arc<H>,
}

impl<H: Handle> ConnOptions<H> {
    pub fn new(handle: H) -> Self {
        Self::with_shared_handle(Arc::new(handle))
    }

    /// Options around a handle shared by many connections.
    pub fn with_shared_handle(handle: Arc<H>) -> Self {
        Self {
            recv_queue: DEFAULT_RECV_QUEUE,
            dispatch_queue: DEFAULT_DISPATCH_QUEUE,
            send_queue: DEFAULT_SEND_QUEUE,
            recv_timeout: DEFAULT_TIMEOUT,
            send_timeout: DEFAULT_TIMEOUT,
            dispatch_timeout: DEFAULT_TIMEOUT,
            max_stalled: DEFAULT_MAX_STALLED,
            debug: false,
            handle,
        }
    }

    pub fn with_queue_depths(mut self, recv: usize, dispatch: usize, send: usize) -> Self {
        self.recv_queue = recv;
        self.dispatch_queue = dispatch;
        self.send_queue = send;
        self
    }

    pub fn with_timeouts(mut self, recv: Duration, send: Duration, dispatch: Duration) -> Self {
        self.recv_timeout = recv;
        self.send_timeout = send;
        self.dispatch_timeout = dispatch;
        self
    }

    pub fn with_max_stalled(mut self, max_stalled: usize) -> Self {
        self.max_stalled = max_stalled;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl<H> Clone for ConnOptions<H> {
    fn clone(&self) -> Self {
        Self {
            recv_queue: self.recv_queue,
            dispatch_queue: self.dispatch_queue,
            send_queue: self.send_queue,
            recv_timeout: self.recv_timeout,
            send_timeout: self.send_timeout,
            dispatch_timeout: self.dispatch_timeout,
            max_stalled: self.max_stalled,
            debug: self.debug,
            handle: Arc::clone(&self.handle),
        }
    }
}
