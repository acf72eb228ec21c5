//! Dependency health aggregation
//!
//! `HealthAggregator::check_all` pings every registered dependency in its own
//! task under one shared deadline and folds the outcomes into a `HealthReport`.
//! Probe failures never escape as errors; they only change the report.

use crate::dependency::{within, Probe};
use axum::http::StatusCode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upper bound for a single health check
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Overall status derived from dependency outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Derive status from the number of failing dependencies out of `total`
    ///
    /// All failing is unhealthy even when `total` is 1, so a single
    /// dependency can never be degraded.
    pub fn from_counts(failing: usize, total: usize) -> Self {
        if failing == 0 {
            HealthStatus::Ok
        } else if failing == total {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    }

    /// HTTP status code for this health status
    ///
    /// Degraded still answers 200 so partial dependency loss does not fail
    /// external health checks.
    pub fn http_status(&self) -> StatusCode {
        match self {
            HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Result of probing one dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyOutcome {
    pub name: String,
    pub connected: bool,
    /// Empty when connected
    pub detail: String,
}

impl DependencyOutcome {
    pub fn connected(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: true,
            detail: String::new(),
        }
    }

    pub fn failed(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: false,
            detail: detail.into(),
        }
    }

    /// Wire form: "connected" or "error: <detail>"
    pub fn summary(&self) -> String {
        if self.connected {
            "connected".to_string()
        } else {
            format!("error: {}", self.detail)
        }
    }
}

/// Point-in-time health of all registered dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    status: HealthStatus,
    outcomes: BTreeMap<String, DependencyOutcome>,
}

impl HealthReport {
    /// Build a report; the status is always derived from `outcomes`
    pub fn from_outcomes(outcomes: BTreeMap<String, DependencyOutcome>) -> Self {
        let failing = outcomes.values().filter(|o| !o.connected).count();
        Self {
            status: HealthStatus::from_counts(failing, outcomes.len()),
            outcomes,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn outcomes(&self) -> &BTreeMap<String, DependencyOutcome> {
        &self.outcomes
    }

    pub fn http_status(&self) -> StatusCode {
        self.status.http_status()
    }
}

/// Registered dependency probe
#[derive(Clone)]
struct Registered {
    name: String,
    probe: Arc<dyn Probe>,
}

/// Probes all registered dependencies concurrently
#[derive(Clone, Default)]
pub struct HealthAggregator {
    probes: Vec<Registered>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependency under `name`; a repeated name replaces the earlier probe
    pub fn register(&mut self, name: impl Into<String>, probe: Arc<dyn Probe>) {
        let name = name.into();
        self.probes.retain(|r| r.name != name);
        self.probes.push(Registered { name, probe });
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Probe every dependency and derive the report
    ///
    /// The effective deadline is `PROBE_TIMEOUT` from now, or `parent` if that
    /// is sooner. Every dependency gets an outcome; a probe that panics or
    /// overruns the deadline is recorded as failed.
    pub async fn check_all(&self, parent: Option<Instant>) -> HealthReport {
        let mut deadline = Instant::now() + PROBE_TIMEOUT;
        if let Some(parent) = parent {
            deadline = deadline.min(parent);
        }

        let outcomes: Arc<Mutex<BTreeMap<String, DependencyOutcome>>> =
            Arc::new(Mutex::new(BTreeMap::new()));
        let mut tasks = JoinSet::new();

        for registered in &self.probes {
            let name = registered.name.clone();
            let probe = registered.probe.clone();
            let outcomes = outcomes.clone();

            tasks.spawn(async move {
                // Bound the probe even if it ignores its own deadline
                let outcome = match within(deadline, probe.ping(deadline)).await {
                    Ok(()) => {
                        debug!(dependency = %name, "Dependency connected");
                        DependencyOutcome::connected(&name)
                    }
                    Err(e) => {
                        warn!(dependency = %name, error = %e, "Dependency probe failed");
                        DependencyOutcome::failed(&name, e.to_string())
                    }
                };

                outcomes
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(name, outcome);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Dependency probe task aborted");
            }
        }

        let mut outcomes = match Arc::try_unwrap(outcomes) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(|p| p.into_inner()),
            Err(shared) => shared
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
        };

        // Tasks that panicked never wrote an outcome
        for registered in &self.probes {
            outcomes
                .entry(registered.name.clone())
                .or_insert_with(|| DependencyOutcome::failed(&registered.name, "probe panicked"));
        }

        HealthReport::from_outcomes(outcomes)
    }
}
