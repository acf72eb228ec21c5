//! Primary store connection
//!
//! Uses the `mongodb` driver. Connectivity is checked with the server's
//! `ping` command against the configured database, so only a live store
//! counts as connected.

use super::{within, Connection, Connector, DependencyError, Probe};
use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use mongodb::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Factory for the primary store connection
pub struct PrimaryConnector {
    name: String,
    uri: String,
    database: String,
}

impl PrimaryConnector {
    pub fn new(name: impl Into<String>, uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            database: database.into(),
        }
    }
}

/// Time left until `deadline`, never zero (the driver reads zero as "no timeout")
fn remaining(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1))
}

#[async_trait]
impl Connector for PrimaryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, deadline: Instant) -> Result<Arc<dyn Connection>, DependencyError> {
        let client = within(deadline, async {
            let mut options = ClientOptions::parse(&self.uri).await?;
            options.app_name = Some("healthgate".to_string());
            // Keep driver-side waits inside the startup bound
            options.connect_timeout = Some(remaining(deadline));
            options.server_selection_timeout = Some(remaining(deadline));
            Ok(Client::with_options(options)?)
        })
        .await?;

        let connection = PrimaryConnection::new(client, self.database.clone());
        connection.ping(deadline).await?;

        info!(
            dependency = %self.name,
            database = %self.database,
            "Connected to primary store"
        );
        Ok(Arc::new(connection))
    }
}

/// Handle to the primary store
pub struct PrimaryConnection {
    client: Mutex<Option<Client>>,
    database: String,
}

impl PrimaryConnection {
    pub fn new(client: Client, database: String) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            database,
        }
    }
}

#[async_trait]
impl Probe for PrimaryConnection {
    async fn ping(&self, deadline: Instant) -> Result<(), DependencyError> {
        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or(DependencyError::Closed)?;

        within(deadline, async move {
            client
                .database(&self.database)
                .run_command(doc! { "ping": 1 })
                .await?;
            debug!(database = %self.database, "Primary store answered ping");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Connection for PrimaryConnection {
    async fn close(&self, deadline: Instant) -> Result<(), DependencyError> {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            within(deadline, async move {
                client.shutdown().await;
                Ok(())
            })
            .await?;
            debug!("Primary store client shut down");
        }
        Ok(())
    }
}
