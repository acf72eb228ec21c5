//! Downstream dependency connections
//!
//! Every dependency the service reports on goes through three traits:
//! - `Probe` - the ping capability handed to the health aggregator
//! - `Connection` - a probe that can also be closed, owned by the lifecycle manager
//! - `Connector` - factory that opens a `Connection` at startup
//!
//! Production code uses `PrimaryConnector` (MongoDB `ping` command through the
//! `mongodb` driver) and `CacheConnector` (Redis `PING` through the `redis`
//! client). Tests use `MockConnector`.

pub mod cache;
pub mod primary;

pub use cache::{CacheConnection, CacheConnector};
pub use primary::{PrimaryConnection, PrimaryConnector};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

/// Errors returned by dependency connect, ping, and close operations
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("deadline exceeded")]
    Timeout,

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected reply: {0}")]
    Protocol(String),

    #[error("{0}")]
    Primary(#[from] mongodb::error::Error),

    #[error("{0}")]
    Cache(#[from] redis::RedisError),

    #[error("connection closed")]
    Closed,
}

/// Point-in-time connectivity check
///
/// Implementations must return no later than `deadline`, and must not retry.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn ping(&self, deadline: Instant) -> Result<(), DependencyError>;
}

/// Long-lived connection to a dependency
///
/// `close` is called exactly once, by the owner, during shutdown.
#[async_trait]
pub trait Connection: Probe {
    async fn close(&self, deadline: Instant) -> Result<(), DependencyError>;
}

/// Opens a named dependency connection
#[async_trait]
pub trait Connector: Send + Sync {
    /// Name reported in health output (e.g. "primary", "cache")
    fn name(&self) -> &str;

    async fn connect(&self, deadline: Instant) -> Result<Arc<dyn Connection>, DependencyError>;
}

/// Ping-only view of a connection
///
/// The lifecycle manager keeps the owning `Arc<dyn Connection>` and closes it;
/// the aggregator only ever receives this handle.
#[derive(Clone)]
pub struct PingHandle {
    connection: Arc<dyn Connection>,
}

impl PingHandle {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Probe for PingHandle {
    async fn ping(&self, deadline: Instant) -> Result<(), DependencyError> {
        self.connection.ping(deadline).await
    }
}

/// Run `fut` until `deadline`, mapping expiry to `DependencyError::Timeout`
pub(crate) async fn within<T, F>(deadline: Instant, fut: F) -> Result<T, DependencyError>
where
    F: std::future::Future<Output = Result<T, DependencyError>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(DependencyError::Timeout),
    }
}
