//! Service lifecycle: startup, run loop, and graceful shutdown
//!
//! ```text
//! Initializing --start()--> Running --cancel / listener failure--> ShuttingDown --> Stopped
//! ```
//!
//! Startup connects dependencies in registration order, then binds the
//! listener. Shutdown stops the listener first (bounded drain), then closes
//! every dependency in registration order. Close failures are logged only.
//! A drain that overruns the shutdown timeout aborts the accept loop, which
//! also aborts every connection it still owns.

use crate::config::ServiceConfig;
use crate::dependency::{
    within, CacheConnector, Connection, Connector, DependencyError, PingHandle, PrimaryConnector,
};
use crate::health::HealthAggregator;
use crate::server::health::serve_health;
use crate::server::shutdown::{shutdown_channel, ShutdownController, ShutdownSignal};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Bound for establishing each dependency connection at startup
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle states; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Errors that end startup, the run loop, or shutdown
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to connect to {name}: {source}")]
    Connect {
        name: String,
        #[source]
        source: DependencyError,
    },

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("listener failed: {0}")]
    Listener(#[source] std::io::Error),

    #[error("listener did not drain within {0:?}")]
    DrainTimeout(Duration),

    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
}

/// Production dependencies: the primary store, then the cache store
pub fn default_connectors(config: &ServiceConfig) -> Vec<Box<dyn Connector>> {
    vec![
        Box::new(PrimaryConnector::new(
            "primary",
            &config.primary_uri,
            &config.primary_database,
        )),
        Box::new(CacheConnector::new("cache", &config.cache_addr)),
    ]
}

/// Running accept loop
struct Listener {
    local_addr: SocketAddr,
    stop: ShutdownController,
    task: JoinHandle<Result<(), std::io::Error>>,
}

/// Map how the accept loop ended into the run loop's terminal error
fn listener_failure(joined: Result<Result<(), std::io::Error>, JoinError>) -> LifecycleError {
    let err = match joined {
        Ok(Ok(())) => std::io::Error::other("listener stopped unexpectedly"),
        Ok(Err(e)) => e,
        Err(e) => std::io::Error::other(format!("listener task failed: {}", e)),
    };
    LifecycleError::Listener(err)
}

/// Owns the listener and the dependency connections
pub struct LifecycleManager {
    config: ServiceConfig,
    bind_ip: IpAddr,
    connectors: Vec<Box<dyn Connector>>,
    /// Open connections in registration order
    connections: Vec<(String, Arc<dyn Connection>)>,
    listener: Option<Listener>,
    state: LifecycleState,
}

impl LifecycleManager {
    /// Create a manager for the given dependencies (connected in this order)
    pub fn new(config: ServiceConfig, connectors: Vec<Box<dyn Connector>>) -> Self {
        Self {
            config,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connectors,
            connections: Vec::new(),
            listener: None,
            state: LifecycleState::Initializing,
        }
    }

    /// Create a manager with the production primary and cache connectors
    pub fn from_config(config: ServiceConfig) -> Self {
        let connectors = default_connectors(&config);
        Self::new(config, connectors)
    }

    /// Bind to a specific interface instead of all interfaces
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Address the listener is bound to (once running)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr)
    }

    fn transition(&mut self, next: LifecycleState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        info!(from = ?self.state, to = ?next, "Lifecycle transition");
        self.state = next;
    }

    /// Connect dependencies, bind the listener, and start serving
    ///
    /// Returns once the listener is accepting. On any failure, connections
    /// opened so far are closed and the manager ends up `Stopped`.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        self.start_with(serve_health).await
    }

    /// `start` with a custom accept loop in place of `serve_health`
    pub(crate) async fn start_with<S, F>(&mut self, serve: S) -> Result<(), LifecycleError>
    where
        S: FnOnce(TcpListener, HealthAggregator, ShutdownSignal) -> F,
        F: Future<Output = Result<(), std::io::Error>> + Send + 'static,
    {
        if self.state != LifecycleState::Initializing {
            return Err(LifecycleError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        let connectors = std::mem::take(&mut self.connectors);
        for connector in &connectors {
            let name = connector.name().to_string();
            let deadline = Instant::now() + CONNECT_TIMEOUT;

            match within(deadline, connector.connect(deadline)).await {
                Ok(connection) => self.connections.push((name, connection)),
                Err(source) => {
                    error!(dependency = %name, error = %source, "Failed to connect dependency");
                    self.abort_startup().await;
                    return Err(LifecycleError::Connect { name, source });
                }
            }
        }

        let addr = SocketAddr::new(self.bind_ip, self.config.port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(address = %addr, error = %source, "Failed to bind listener");
                self.abort_startup().await;
                return Err(LifecycleError::Bind { addr, source });
            }
        };
        let local_addr = listener.local_addr().unwrap_or(addr);

        let mut aggregator = HealthAggregator::new();
        for (name, connection) in &self.connections {
            aggregator.register(name.clone(), Arc::new(PingHandle::new(connection.clone())));
        }

        let (stop, signal) = shutdown_channel();
        let task = tokio::spawn(serve(listener, aggregator, signal));
        self.listener = Some(Listener {
            local_addr,
            stop,
            task,
        });

        self.transition(LifecycleState::Running);
        info!(address = %local_addr, dependencies = self.connections.len(), "Service started");
        Ok(())
    }

    async fn abort_startup(&mut self) {
        self.close_dependencies(Instant::now() + CONNECT_TIMEOUT).await;
        self.transition(LifecycleState::Stopped);
    }

    /// Serve until `cancel` fires or the listener fails, then shut down
    ///
    /// Returns `Ok(())` after a cancellation-triggered shutdown and the
    /// listener's error if it stopped on its own.
    pub async fn run(&mut self, mut cancel: ShutdownSignal) -> Result<(), LifecycleError> {
        let state = self.state;
        let listener = match self.listener.as_mut() {
            Some(listener) if state == LifecycleState::Running => listener,
            _ => {
                return Err(LifecycleError::InvalidState {
                    operation: "run",
                    state,
                })
            }
        };

        let failure = tokio::select! {
            _ = cancel.wait() => None,
            joined = &mut listener.task => Some(listener_failure(joined)),
        };

        match failure {
            None => {
                info!("Cancellation requested, shutting down");
                self.shutdown().await
            }
            Some(err) => {
                error!(error = %err, "Listener failed, shutting down");
                // The accept loop is already gone; nothing to drain
                self.listener = None;
                if let Err(e) = self.shutdown().await {
                    warn!(error = %e, "Shutdown after listener failure reported an error");
                }
                Err(err)
            }
        }
    }

    /// Stop the listener, drain within `shutdown_timeout`, then close dependencies
    ///
    /// Only a listener that fails to drain in time is reported as an error;
    /// dependency close failures are logged. No-op once stopped.
    pub async fn shutdown(&mut self) -> Result<(), LifecycleError> {
        if self.state == LifecycleState::Stopped {
            return Ok(());
        }
        if self.state != LifecycleState::ShuttingDown {
            self.transition(LifecycleState::ShuttingDown);
        }

        let timeout = self.config.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        let mut result = Ok(());

        if let Some(mut listener) = self.listener.take() {
            listener.stop.shutdown();
            match tokio::time::timeout_at(deadline, &mut listener.task).await {
                Ok(Ok(Ok(()))) => info!("Listener drained"),
                Ok(Ok(Err(e))) => warn!(error = %e, "Listener exited with error while draining"),
                Ok(Err(e)) => warn!(error = %e, "Listener task failed while draining"),
                Err(_) => {
                    warn!(timeout = ?timeout, "Drain timed out, terminating listener");
                    listener.task.abort();
                    // Wait for the abort so open connections are gone before closes
                    let _ = (&mut listener.task).await;
                    result = Err(LifecycleError::DrainTimeout(timeout));
                }
            }
        }

        self.close_dependencies(deadline).await;
        self.transition(LifecycleState::Stopped);
        info!("Service stopped");
        result
    }

    /// Close every open connection in registration order, best-effort
    async fn close_dependencies(&mut self, deadline: Instant) {
        for (name, connection) in self.connections.drain(..) {
            match within(deadline, connection.close(deadline)).await {
                Ok(()) => info!(dependency = %name, "Dependency closed"),
                Err(e) => warn!(dependency = %name, error = %e, "Dependency close failed"),
            }
        }
    }
}
