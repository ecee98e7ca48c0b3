//! Connection management.
//!
//! One TCP connection carries many outstanding requests. Each request gets
//! a message id from an atomic counter and parks a oneshot waiter in the
//! pending map; [`Connection::read_loop`] hands every inbound frame to the
//! waiter registered under its id.

use crate::error::ClientError;
use bytes::Bytes;
use dashmap::DashMap;
use highway_protocol::{
    status, Decoder, Frame, FrameWriter, MsgType, RequestHeader, ResponseHeader,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// A multiplexed connection to a highway server.
pub struct Connection {
    config: ConnectionConfig,
    /// Write half of the stream (for sending requests).
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Read half, taken over by the read loop.
    reader: Mutex<Option<OwnedReadHalf>>,
    /// Waiters for outstanding requests, keyed by message id.
    pending: DashMap<u64, oneshot::Sender<Frame>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    /// Connects to the server.
    ///
    /// Responses are only delivered once [`Connection::read_loop`] runs.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("connecting to {}", self.config.addr);

        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("connection failed: {}", e);
            ClientError::Io(e)
        })?;

        tcp_stream.set_nodelay(true).ok();

        let (read_half, write_half) = tcp_stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        self.connected.store(true, Ordering::SeqCst);

        Ok(())
    }

    /// Allocates a message id unique among outstanding requests.
    pub fn next_msg_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends an encoded frame tagged `msg_id` and waits for the frame
    /// answering it.
    ///
    /// On timeout the waiter is removed, so a late answer is dropped by the
    /// read loop.
    pub async fn request(&self, msg_id: u64, frame: Bytes) -> Result<Frame, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let rx = self.park_waiter(msg_id)?;

        if let Err(e) = self.send_raw(&frame).await {
            self.pending.remove(&msg_id);
            return Err(e);
        }
        tracing::trace!(msg_id, bytes = frame.len(), "request sent");

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => {
                tracing::debug!(msg_id, "waiter dropped, connection closed");
                Err(ClientError::ConnectionClosed)
            }
            Err(_) => {
                self.pending.remove(&msg_id);
                tracing::debug!(msg_id, "request timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    /// Registers the waiter for `msg_id`.
    ///
    /// The connection state is checked again after the insert: the read loop
    /// may have torn down and cleared the map in between, and a waiter added
    /// after that would never be released.
    fn park_waiter(&self, msg_id: u64) -> Result<oneshot::Receiver<Frame>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(msg_id, tx);
        if !self.is_connected() {
            self.pending.remove(&msg_id);
            return Err(ClientError::ConnectionClosed);
        }
        Ok(rx)
    }

    /// Marks the connection closed and drops every waiter, which then sees
    /// [`ClientError::ConnectionClosed`].
    fn release_waiters(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let outstanding = self.pending.len();
        self.pending.clear();
        tracing::debug!(outstanding, "released pending requests");
    }

    /// Writes raw bytes to the connection.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(bytes).await.map_err(ClientError::Io)
    }

    /// Sends the login frame and checks the server accepted it.
    pub async fn login(&self) -> Result<(), ClientError> {
        let msg_id = self.next_msg_id();
        let header = RequestHeader {
            msg_type: MsgType::Login,
            ..Default::default()
        };
        let mut writer = FrameWriter::new(msg_id);
        writer.write_header(|buf| header.encode_into(buf));
        let frame = self.request(msg_id, writer.finish()?).await?;

        let response = ResponseHeader::decode(&frame.header)?;
        if response.status_code != status::OK {
            return Err(ClientError::LoginRejected {
                status: response.status_code,
                reason: response.reason_phrase,
            });
        }
        tracing::debug!("login accepted by {}", self.config.addr);
        Ok(())
    }

    /// Reads frames and hands each to its waiter (run in a background task).
    ///
    /// A frame nobody waits for, such as the late answer to a timed-out
    /// request, is logged and dropped. Returns when the connection closes or
    /// the byte stream becomes undecodable; every outstanding waiter is then
    /// released with [`ClientError::ConnectionClosed`].
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(ClientError::NotConnected)?;
        let result = self.dispatch_frames(&mut reader).await;
        self.release_waiters();
        result
    }

    async fn dispatch_frames(&self, reader: &mut OwnedReadHalf) -> Result<(), ClientError> {
        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                tracing::debug!("read_loop: connection closed");
                return Err(ClientError::ConnectionClosed);
            }
            decoder.extend(&buf[..n]);

            loop {
                let frame = match decoder.decode_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(kind = %e.kind(), "read_loop: undecodable stream: {}", e);
                        return Err(ClientError::Protocol(e));
                    }
                };

                let msg_id = frame.msg_id;
                match self.pending.remove(&msg_id) {
                    Some((_, tx)) => {
                        if tx.send(frame).is_err() {
                            tracing::debug!(msg_id, "read_loop: waiter gone");
                        }
                    }
                    None => tracing::debug!(msg_id, "read_loop: no waiter, dropping frame"),
                }
            }
        }
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let _ = self.reader.lock().await.take();

        self.release_waiters();
        Ok(())
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use highway_protocol::{assemble_response, split_frame};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:7070".parse().unwrap());
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config =
            ConnectionConfig::new("127.0.0.1:7070".parse().unwrap()).with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new("127.0.0.1:7070".parse().unwrap())
            .with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_msg_ids_are_unique() {
        let conn = Connection::new(ConnectionConfig::new("127.0.0.1:7070".parse().unwrap()));
        let ids: std::collections::HashSet<_> = (0..100).map(|_| conn.next_msg_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn test_request_when_not_connected() {
        let conn = Connection::new(ConnectionConfig::new("127.0.0.1:7070".parse().unwrap()));
        let err = conn.request(1, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_waiter_parked_after_teardown_is_released() {
        let conn = Connection::new(ConnectionConfig::new("127.0.0.1:7070".parse().unwrap()));
        conn.connected.store(true, Ordering::SeqCst);
        let mut first = conn.park_waiter(1).unwrap();
        assert_eq!(conn.pending_count(), 1);

        // Read loop ends between the caller's connected check and its insert.
        conn.release_waiters();
        assert!(first.try_recv().is_err());

        let err = conn.park_waiter(2).unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert_eq!(conn.pending_count(), 0);
    }

    /// Accepts one connection and answers each frame with its message id.
    /// Only the first answer is held back by `delay`.
    async fn echo_server(delay: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = Decoder::new();
            let mut buf = [0u8; 1024];
            let mut delay = delay;
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Some(frame) = decoder.decode_frame().unwrap() {
                    tokio::time::sleep(std::mem::take(&mut delay)).await;
                    let header = ResponseHeader::new(status::OK, "OK").encode();
                    let reply = assemble_response(frame.msg_id, &header, &[]).unwrap();
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        });
        addr
    }

    async fn connected(addr: SocketAddr, timeout: Duration) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(
            ConnectionConfig::new(addr).with_request_timeout(timeout),
        ));
        conn.connect().await.unwrap();
        let reader = conn.clone();
        tokio::spawn(async move { reader.read_loop().await });
        conn
    }

    fn empty_request(msg_id: u64) -> Bytes {
        let mut writer = FrameWriter::new(msg_id);
        writer.write_header(|buf| RequestHeader::default().encode_into(buf));
        writer.finish().unwrap()
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let addr = echo_server(Duration::ZERO).await;
        let conn = connected(addr, Duration::from_secs(5)).await;

        let msg_id = conn.next_msg_id();
        let frame = conn.request(msg_id, empty_request(msg_id)).await.unwrap();
        assert_eq!(frame.msg_id, msg_id);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_login() {
        let addr = echo_server(Duration::ZERO).await;
        let conn = connected(addr, Duration::from_secs(5)).await;
        conn.login().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_then_late_frame_is_dropped() {
        let addr = echo_server(Duration::from_millis(150)).await;
        let conn = connected(addr, Duration::from_millis(50)).await;

        let first = conn.next_msg_id();
        let err = conn.request(first, empty_request(first)).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(conn.pending_count(), 0);

        // The late answer arrives with no waiter and must not break the loop.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(conn.is_connected());

        let second = conn.next_msg_id();
        let frame = conn.request(second, empty_request(second)).await.unwrap();
        assert_eq!(frame.msg_id, second);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(stream);
        });

        let conn = connected(addr, Duration::from_secs(5)).await;
        let msg_id = conn.next_msg_id();
        let err = conn.request(msg_id, empty_request(msg_id)).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_response_frame_splits() {
        let addr = echo_server(Duration::ZERO).await;
        let conn = connected(addr, Duration::from_secs(5)).await;
        let msg_id = conn.next_msg_id();
        let frame = conn.request(msg_id, empty_request(msg_id)).await.unwrap();

        let raw = frame.encode().unwrap();
        assert_eq!(split_frame(&raw).unwrap(), frame);
    }
}
