//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use highway_protocol::{Decoder, Encoder, Invocation, Response, SchemaRegistry};
use std::sync::Arc;

/// High-level client for highway services.
///
/// Request bodies are encoded and response bodies decoded against the
/// schemas in the shared [`SchemaRegistry`].
pub struct Client {
    conn: Arc<Connection>,
    schemas: Arc<SchemaRegistry>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig, schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
            schemas,
        }
    }

    /// Connects, starts the background read loop and logs in.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await?;

        let conn = Arc::clone(&self.conn);
        tokio::spawn(async move {
            if let Err(e) = conn.read_loop().await {
                tracing::debug!("read loop ended: {}", e);
            }
        });

        self.conn.login().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Sends `invocation` and waits for its response.
    ///
    /// Context returned by the provider is merged into `invocation`. A
    /// non-OK status is not an error here; inspect [`Response::status`].
    pub async fn invoke(&self, invocation: &mut Invocation) -> Result<Response, ClientError> {
        let schema = self.schemas.lookup(invocation.operation())?;
        let msg_id = self.conn.next_msg_id();
        let request = Encoder::encode_request(msg_id, invocation, &schema)?;

        tracing::trace!(msg_id, operation = %invocation.operation(), "invoking");
        let frame = self.conn.request(msg_id, request).await?;

        let response = Decoder::decode_response(invocation, &schema, &frame)?;
        tracing::trace!(msg_id, status = response.status, "response received");
        Ok(response)
    }
}
