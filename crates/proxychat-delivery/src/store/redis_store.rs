//! Redis implementation of [`KeyValueStore`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{KeyValueStore, PublishedMessage, PublishedStream};
use crate::Result;

/// Redis-backed store shared by every server instance.
///
/// Commands go through a `ConnectionManager`, which reconnects on its own.
/// Each pattern subscription opens a dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to a Redis server.
    ///
    /// Supports both redis:// and rediss:// (TLS) URLs.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!("Connected to Redis");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn list_push_head(&self, key: &str, value: &str) -> Result<()> {
        let _: () = self.conn().lpush(key, value).await?;
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.conn().lrange(key, 0, -1).await?)
    }

    async fn list_take_all(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let (items, _deleted): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(key, 0, -1)
            .del(key)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _: () = self.conn().del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        // EXPIRE has whole-second resolution; never round a TTL down to zero.
        let seconds = ttl.as_secs().max(1) as i64;
        let _: () = self.conn().expire(key, seconds).await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = self.conn().sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.conn().sismember(key, member).await?)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: () = self.conn().hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        let _: () = self.conn().hdel(key, field).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let receivers: i64 = self.conn().publish(channel, payload).await?;
        debug!(channel = %channel, receivers = receivers, "Published message");
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<PublishedStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        info!(pattern = %pattern, "Subscribed to Redis pattern");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(PublishedMessage { channel, payload }),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Failed to read Pub/Sub payload");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
