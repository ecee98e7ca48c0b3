//! TCP listener and per-connection frame loop.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::{RequestHandler, ServiceRegistry};
use crate::metrics::Metrics;
use highway_protocol::{Decoder, ProtocolError, SchemaRegistry, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Runtime settings of a [`Server`].
#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// A connection silent for this long is closed.
    pub idle_timeout: Duration,
    pub max_connections: usize,
    /// Largest accepted frame, header plus body.
    pub max_frame_size: usize,
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("max_frame_size", &self.max_frame_size)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Runtime settings from the loaded file/env configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            max_frame_size: config.network.max_frame_size,
            metrics: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size.min(MAX_FRAME_SIZE);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Counters kept whether or not Prometheus metrics are enabled.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    /// Connections that ended with an error.
    pub errors_total: AtomicU64,
}

/// Accounts for one open connection; released on drop.
struct ConnectionSlot {
    stats: Arc<ServerStats>,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionSlot {
    fn open(stats: Arc<ServerStats>, metrics: Option<Arc<Metrics>>) -> Self {
        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }
        Self { stats, metrics }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.connections_active.dec();
        }
    }
}

/// TCP server for highway providers.
pub struct Server {
    config: ServerConfig,
    handler: Arc<RequestHandler>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a server answering for the operations in `schemas` with the
    /// handlers in `services`.
    pub fn new(
        config: ServerConfig,
        schemas: Arc<SchemaRegistry>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        let mut handler = RequestHandler::new(schemas, services);
        if let Some(metrics) = &config.metrics {
            handler = handler.with_metrics(Arc::clone(metrics));
        }
        Self {
            config,
            handler: Arc::new(handler),
            stats: Arc::default(),
            shutdown: broadcast::channel(1).0,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!("accept error: {}", e);
                        continue;
                    }
                },
                _ = shutdown.recv() => break,
            };

            let active = self.stats.connections_active.load(Ordering::Relaxed);
            if active >= self.config.max_connections as u64 {
                tracing::warn!(active, "connection limit reached, rejecting {}", addr);
                continue;
            }
            self.spawn_connection(stream, addr);
        }

        tracing::info!("server shutting down");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let slot = ConnectionSlot::open(self.stats.clone(), self.config.metrics.clone());
        let task = ConnectionTask {
            stream,
            addr,
            handler: self.handler.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
        };
        let shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            tracing::info!("client connected: {}", addr);
            if let Err(e) = task.run(shutdown).await {
                tracing::debug!("connection {} ended: {}", addr, e);
                slot.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
            drop(slot);
            tracing::info!("client disconnected: {}", addr);
        });
    }

    /// Signals the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Receiver notified when [`Server::shutdown`] is called.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// One accepted connection: reads request frames, writes one response each.
///
/// Requests are handled inline, so responses leave in the order their
/// requests completed; consumers match them up by message id.
struct ConnectionTask {
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<RequestHandler>,
    config: ServerConfig,
    stats: Arc<ServerStats>,
}

impl ConnectionTask {
    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServerError> {
        let mut decoder = Decoder::with_max_frame_size(self.config.max_frame_size);
        let mut buf = vec![0u8; 8192];
        let idle = self.config.idle_timeout;

        loop {
            let read = tokio::select! {
                read = tokio::time::timeout(idle, self.stream.read(&mut buf)) => read,
                _ = shutdown.recv() => return Err(ServerError::ShuttingDown),
            };
            let n = match read {
                Err(_) => {
                    tracing::debug!("[{}] idle timeout", self.addr);
                    return Ok(());
                }
                Ok(Ok(0)) => {
                    tracing::debug!("[{}] closed by peer", self.addr);
                    return Ok(());
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(ServerError::Io(e)),
            };
            tracing::trace!("[{}] received {} bytes", self.addr, n);
            decoder.extend(&buf[..n]);

            // Oversized frames fail here once their prefix is buffered.
            while let Some(frame) = decoder.decode_frame().map_err(|e| self.fatal(e))? {
                self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
                let response = self.handler.handle_frame(&frame).map_err(|e| self.fatal(e))?;
                tracing::trace!(
                    msg_id = frame.msg_id,
                    "[{}] writing {} bytes",
                    self.addr,
                    response.len()
                );
                self.stream.write_all(&response).await?;
            }
        }
    }

    /// Logs a connection-fatal codec error before the connection is dropped.
    fn fatal(&self, e: ProtocolError) -> ServerError {
        tracing::warn!(kind = %e.kind(), "[{}] closing connection: {}", self.addr, e);
        ServerError::Protocol(e)
    }
}
