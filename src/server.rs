//! TCP server that wraps each accepted socket in a pipeline `Connection`.

use crate::config::Config;
use crate::connection::Connection;
use crate::handle::Handle;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Listen backlog for the server socket
const LISTEN_BACKLOG: i32 = 1024;

/// Server instance
pub struct Server<H: Handle> {
    config: Config,
    handle: Arc<H>,
    connection_limit: Arc<Semaphore>,
}

impl<H: Handle> Server<H> {
    /// Create a new server instance
    pub fn new(config: Config, handle: H) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Server {
            config,
            handle: Arc::new(handle),
            connection_limit,
        }
    }

    /// Bind the listening socket
    pub fn bind(&self) -> io::Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        TcpListener::from_std(socket.into())
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> io::Result<()> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` is cancelled.
    ///
    /// Open connections are closed when the server shuts down, and this
    /// returns once every one of them has finished.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        info!(address = %listener.local_addr()?, "Server listening");
        let connections = TaskTracker::new();

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let options = self.config.pipeline.options(Arc::clone(&self.handle));
                    let conn = match Connection::from_tcp(stream, options) {
                        Ok(conn) => conn,
                        Err(e) => {
                            debug!(peer = %addr, error = %e, "Failed to wrap connection");
                            continue;
                        }
                    };
                    let running = match conn.run() {
                        Ok(running) => running,
                        Err(e) => {
                            error!(peer = %addr, error = %e, "Failed to start connection");
                            continue;
                        }
                    };

                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        tokio::select! {
                            _ = running.join() => {}
                            _ = shutdown.cancelled() => {
                                conn.close().await;
                                running.join().await;
                            }
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!(open = connections.len(), "Server stopped accepting connections");
        connections.close();
        connections.wait().await;
        info!("Server stopped");
        Ok(())
    }

    /// Number of connection slots currently free
    pub fn available_slots(&self) -> usize {
        self.connection_limit.available_permits()
    }
}
