//! # highway-server
//!
//! TCP server for highway providers.
//!
//! This crate provides:
//! - Connection handling with async I/O and frame reassembly
//! - Dispatch of decoded invocations to registered operation handlers
//! - File and environment configuration
//! - Prometheus metrics endpoint

pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig};
pub use error::{ServerError, ServiceError};
pub use handler::{Handler, RequestHandler, ServiceRegistry};
pub use metrics::{run_metrics_server, Metrics};
pub use server::{Server, ServerConfig, ServerStats};
