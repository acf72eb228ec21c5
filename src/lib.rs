//! Dependency health endpoint with graceful lifecycle management
//!
//! Probes a primary store and a cache store concurrently, reports the
//! aggregate on `GET /health`, and shuts the listener down cleanly before
//! closing dependency connections.

pub mod config;
pub mod dependency;
pub mod health;
pub mod server;
