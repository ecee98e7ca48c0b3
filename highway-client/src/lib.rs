//! # highway-client
//!
//! Client library for highway services.
//!
//! A [`Client`] multiplexes concurrent invocations over one TCP connection,
//! matching responses to requests by message id.

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
