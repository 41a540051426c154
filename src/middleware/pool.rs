//! Small Redis connection pool. Borrowed connections that sat idle for a
//! minute or more are pinged before reuse and dropped when the ping fails.

use std::time::{Duration, Instant};

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult};
use tokio::sync::Mutex;

const IDLE_PING_AFTER: Duration = Duration::from_secs(60);

struct ParkedConnection {
    connection: MultiplexedConnection,
    parked_at: Instant,
}

pub struct RedisPool {
    client: Client,
    idle: Mutex<Vec<ParkedConnection>>,
}

fn connection_url(host: &str, port: u16, database: i64, password: &str) -> String {
    if password.is_empty() {
        format!("redis://{}:{}/{}", host, port, database)
    } else {
        format!("redis://:{}@{}:{}/{}", password, host, port, database)
    }
}

impl RedisPool {
    pub fn new(host: &str, port: u16, database: i64, password: &str) -> RedisResult<Self> {
        let client = Client::open(connection_url(host, port, database, password))?;
        Ok(Self {
            client,
            idle: Mutex::new(Vec::new()),
        })
    }

    /// Borrows a connection, dialing a fresh one when the idle list is empty.
    pub async fn get(&self) -> RedisResult<MultiplexedConnection> {
        loop {
            let parked = self.idle.lock().await.pop();
            let Some(parked) = parked else { break };

            if parked.parked_at.elapsed() < IDLE_PING_AFTER {
                return Ok(parked.connection);
            }

            // Test-on-borrow for connections that have been sitting a while.
            let mut connection = parked.connection;
            let ping: RedisResult<String> = redis::cmd("PING").query_async(&mut connection).await;
            match ping {
                Ok(_) => return Ok(connection),
                Err(e) => log::debug!("Dropping stale Redis connection: {}", e),
            }
        }

        self.client.get_multiplexed_async_connection().await
    }

    /// Returns a borrowed connection after a successful operation. Failed
    /// connections are simply dropped instead.
    pub async fn put(&self, connection: MultiplexedConnection) {
        self.idle.lock().await.push(ParkedConnection {
            connection,
            parked_at: Instant::now(),
        });
    }

    pub async fn ping(&self) -> RedisResult<()> {
        let mut connection = self.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        self.put(connection).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_without_password_omits_auth() {
        assert_eq!(
            connection_url("localhost", 6379, 0, ""),
            "redis://localhost:6379/0"
        );
    }

    #[test]
    fn url_with_password_uses_auth_segment() {
        assert_eq!(
            connection_url("cache.internal", 6380, 2, "hunter2"),
            "redis://:hunter2@cache.internal:6380/2"
        );
    }
}
