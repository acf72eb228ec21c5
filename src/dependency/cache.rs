//! Cache store connection
//!
//! Opens one `redis` multiplexed connection at startup and checks it with
//! `PING`. Closing drops the connection; later pings report `Closed`.

use super::{within, Connection, Connector, DependencyError, Probe};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Client URL for a cache address given as `host:port` or a full `redis://` URL
pub fn cache_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{}", address)
    }
}

/// Factory for the cache store connection
pub struct CacheConnector {
    name: String,
    address: String,
}

impl CacheConnector {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for CacheConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, deadline: Instant) -> Result<Arc<dyn Connection>, DependencyError> {
        let client = redis::Client::open(cache_url(&self.address).as_str())?;
        let multiplexed = within(deadline, async {
            Ok(client.get_multiplexed_async_connection().await?)
        })
        .await?;

        let connection = CacheConnection::new(multiplexed);
        connection.ping(deadline).await?;

        info!(dependency = %self.name, address = %self.address, "Connected to cache store");
        Ok(Arc::new(connection))
    }
}

/// Handle to the cache store
pub struct CacheConnection {
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl CacheConnection {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self {
            connection: Mutex::new(Some(connection)),
        }
    }
}

#[async_trait]
impl Probe for CacheConnection {
    async fn ping(&self, deadline: Instant) -> Result<(), DependencyError> {
        // Clones share the same underlying socket
        let mut connection = self
            .connection
            .lock()
            .await
            .clone()
            .ok_or(DependencyError::Closed)?;

        within(deadline, async move {
            let reply: String = redis::cmd("PING").query_async(&mut connection).await?;
            if reply != "PONG" {
                return Err(DependencyError::Protocol(reply));
            }
            debug!("Cache store answered PING");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Connection for CacheConnection {
    async fn close(&self, _deadline: Instant) -> Result<(), DependencyError> {
        if self.connection.lock().await.take().is_some() {
            debug!("Cache store connection released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Pop the first complete command off `pending`, returning its name
    fn take_command(pending: &mut Vec<u8>) -> Option<String> {
        let text = String::from_utf8_lossy(pending).into_owned();
        let mut lines = text.split_inclusive("\r\n");

        let header = lines.next().filter(|l| l.ends_with("\r\n"))?;
        let count: usize = header.strip_prefix('*')?.trim_end().parse().ok()?;
        let mut consumed = header.len();
        let mut name = None;
        for _ in 0..count {
            let length = lines.next().filter(|l| l.ends_with("\r\n"))?;
            let arg = lines.next().filter(|l| l.ends_with("\r\n"))?;
            consumed += length.len() + arg.len();
            name.get_or_insert_with(|| arg.trim_end().to_uppercase());
        }

        pending.drain(..consumed);
        name
    }

    /// Cache server stand-in answering PING with `pong` and anything else with +OK
    async fn spawn_cache_server(pong: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut pending = Vec::new();
                    let mut buf = [0u8; 512];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => pending.extend_from_slice(&buf[..n]),
                        }
                        while let Some(command) = take_command(&mut pending) {
                            let reply: &[u8] = if command == "PING" { pong } else { b"+OK\r\n" };
                            if socket.write_all(reply).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn test_cache_url_accepts_bare_address_or_url() {
        assert_eq!(cache_url("localhost:6379"), "redis://localhost:6379");
        assert_eq!(cache_url("redis://cache:6380/2"), "redis://cache:6380/2");
    }

    #[tokio::test]
    async fn test_connect_and_ping_with_pong() {
        let addr = spawn_cache_server(b"+PONG\r\n").await;
        let connector = CacheConnector::new("cache", addr);
        let deadline = Instant::now() + Duration::from_secs(2);

        let conn = connector.connect(deadline).await.expect("should connect");
        assert!(conn.ping(deadline).await.is_ok());
        assert!(conn.ping(deadline).await.is_ok(), "connection should be reused");
    }

    #[tokio::test]
    async fn test_error_reply_fails_connect() {
        let addr = spawn_cache_server(b"-ERR busy loading\r\n").await;
        let connector = CacheConnector::new("cache", addr);
        let deadline = Instant::now() + Duration::from_secs(2);

        match connector.connect(deadline).await {
            Err(DependencyError::Cache(_)) => {}
            Err(other) => panic!("expected cache error, got {:?}", other),
            Ok(_) => panic!("error reply must not count as connected"),
        }
    }

    #[tokio::test]
    async fn test_unexpected_reply_is_protocol_error() {
        let addr = spawn_cache_server(b"+HELLO\r\n").await;
        let connector = CacheConnector::new("cache", addr);
        let deadline = Instant::now() + Duration::from_secs(2);

        match connector.connect(deadline).await {
            Err(DependencyError::Protocol(reply)) => assert_eq!(reply, "HELLO"),
            Err(other) => panic!("expected protocol error, got {:?}", other),
            Ok(_) => panic!("unexpected reply must not count as connected"),
        }
    }

    #[tokio::test]
    async fn test_silent_server_times_out_at_deadline() {
        // Accepts connections but never replies
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let connector = CacheConnector::new("cache", addr);
        let started = std::time::Instant::now();
        let deadline = Instant::now() + Duration::from_millis(100);

        assert!(matches!(
            connector.connect(deadline).await,
            Err(DependencyError::Timeout)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_fails_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = CacheConnector::new("cache", addr);
        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(connector.connect(deadline).await.is_err());
    }

    #[tokio::test]
    async fn test_ping_after_close_reports_closed() {
        let addr = spawn_cache_server(b"+PONG\r\n").await;
        let connector = CacheConnector::new("cache", addr);
        let deadline = Instant::now() + Duration::from_secs(2);

        let conn = connector.connect(deadline).await.expect("should connect");
        conn.close(deadline).await.unwrap();

        assert!(matches!(conn.ping(deadline).await, Err(DependencyError::Closed)));
    }
}
