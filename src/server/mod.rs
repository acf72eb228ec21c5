//! HTTP surface and service lifecycle
//!
//! - `/health` - aggregated dependency health (see `crate::health`)
//! - `LifecycleManager` - ordered startup and graceful shutdown
//! - Shutdown signalling for SIGTERM/SIGINT

mod health;
pub mod lifecycle;
pub mod shutdown;

pub use health::{build_router, serve_health, HealthResponse};
pub use lifecycle::{default_connectors, LifecycleError, LifecycleManager, LifecycleState};
pub use shutdown::{shutdown_channel, ShutdownController, ShutdownSignal, TerminationSignals};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;

#[cfg(test)]
#[path = "lifecycle_test.rs"]
mod lifecycle_tests;
