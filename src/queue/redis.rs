//! Redis list-backed queues (`BLPOP` / `RPUSH`).

use std::collections::HashMap;
use std::time::Duration;

use ::redis::Value;
use ::redis::aio::MultiplexedConnection;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::QueueError;
use crate::queue::JobQueue;

/// Queue adapter over a Redis server.
///
/// A blocking `BLPOP` stalls every other command pipelined on the same
/// connection, so each queue being popped gets its own connection. Pushes share
/// one separate connection.
pub struct RedisQueue {
    client: ::redis::Client,
    commands: MultiplexedConnection,
    blocking: Mutex<HashMap<String, MultiplexedConnection>>,
    pop_timeout: Duration,
}

impl RedisQueue {
    /// Connect to the server at `url`.
    pub async fn connect(url: &str, pop_timeout: Duration) -> Result<Self, QueueError> {
        let client =
            ::redis::Client::open(url).map_err(|e| QueueError::Connection(e.to_string()))?;
        let commands = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            commands,
            blocking: Mutex::new(HashMap::new()),
            pop_timeout,
        })
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn blocking_conn(&self, queue: &str) -> Result<MultiplexedConnection, QueueError> {
        if let Some(conn) = self.blocking.lock().await.remove(queue) {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn pop(&self, queue: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.blocking_conn(queue).await?;
        let reply: Value = ::redis::cmd("BLPOP")
            .arg(queue)
            .arg(self.pop_timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        // Only a healthy connection goes back into the pool; an error above
        // drops it and the next pop reconnects.
        self.blocking.lock().await.insert(queue.to_string(), conn);

        normalize_pop_reply(reply)
    }

    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        let _: i64 = ::redis::cmd("RPUSH")
            .arg(queue)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Reduce a `BLPOP` reply to the popped payload.
///
/// Depending on protocol version and client, the reply is nil (timeout), a
/// `[key, value]` array, a `{key: value}` map, or the bare value.
pub fn normalize_pop_reply(reply: Value) -> Result<Option<String>, QueueError> {
    match reply {
        Value::Nil => Ok(None),
        Value::Array(items) => match <[Value; 2]>::try_from(items) {
            Ok([_key, value]) => value_to_string(value).map(Some),
            Err(items) if items.is_empty() => Ok(None),
            Err(items) => Err(QueueError::Decode(format!(
                "expected [key, value], got {} elements",
                items.len()
            ))),
        },
        Value::Map(mut pairs) => match pairs.pop() {
            Some((_key, value)) if pairs.is_empty() => value_to_string(value).map(Some),
            Some(_) => Err(QueueError::Decode(format!(
                "expected a single key, got {}",
                pairs.len() + 1
            ))),
            None => Ok(None),
        },
        other => value_to_string(other).map(Some),
    }
}

fn value_to_string(value: Value) -> Result<String, QueueError> {
    match value {
        Value::BulkString(bytes) => {
            String::from_utf8(bytes).map_err(|e| QueueError::Decode(e.to_string()))
        }
        Value::SimpleString(s) => Ok(s),
        Value::VerbatimString { text, .. } => Ok(text),
        other => Err(QueueError::Decode(format!(
            "unexpected payload type: {other:?}"
        ))),
    }
}
