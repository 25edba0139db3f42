use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::{AsyncCommands, Client, Script};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::fanout::Fanout;
use crate::{scripts, Cache, CacheError, CacheResult, LockGuard, Release, Subscription, SubscriptionId};

const LOCK_TTL: Duration = Duration::from_secs(10);
const LOCK_ATTEMPTS: u32 = 100;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);
const SUBSCRIBER_BUFFER: usize = 64;

struct Scripts {
    lock: Script,
    unlock: Script,
    set_session_control: Script,
    remove_session_control: Script,
}

/// [`Cache`] backed by a redis server so several processes share state.
/// One pubsub connection serves every local subscriber.
pub struct RedisCache {
    conn: ConnectionManager,
    sink: Mutex<PubSubSink>,
    fanout: Arc<Fanout>,
    scripts: Arc<Scripts>,
    listener: JoinHandle<()>,
}

impl RedisCache {
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let (sink, mut stream) = client.get_async_pubsub().await?.split();

        let fanout = Arc::new(Fanout::default());
        let listener = {
            let fanout = Arc::clone(&fanout);
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    let channel = message.get_channel_name().to_string();
                    let payload = Bytes::copy_from_slice(message.get_payload_bytes());
                    for sender in fanout.senders(&channel) {
                        match sender.try_send(payload.clone()) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!(channel = %channel, "subscriber queue full; dropping message");
                            }
                            Err(TrySendError::Closed(_)) => {
                                trace!(channel = %channel, "subscriber closed");
                            }
                        }
                    }
                }
                error!("redis pubsub stream ended");
            })
        };

        Ok(Self {
            conn,
            sink: Mutex::new(sink),
            fanout,
            scripts: Arc::new(Scripts {
                lock: Script::new(scripts::LOCK),
                unlock: Script::new(scripts::UNLOCK),
                set_session_control: Script::new(scripts::SET_SESSION_CONTROL),
                remove_session_control: Script::new(scripts::REMOVE_SESSION_CONTROL),
            }),
            listener,
        })
    }
}

impl Drop for RedisCache {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

struct RedisLock {
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
    key: String,
    secret: String,
    released: bool,
}

impl RedisLock {
    async fn unlock(
        mut conn: ConnectionManager,
        scripts: &Scripts,
        key: &str,
        secret: &str,
    ) -> CacheResult<()> {
        let released: i64 = scripts
            .unlock
            .key(key)
            .arg(secret)
            .invoke_async(&mut conn)
            .await?;
        if released == 1 {
            Ok(())
        } else {
            Err(CacheError::LockMismatch {
                key: key.to_string(),
            })
        }
    }
}

#[async_trait]
impl Release for RedisLock {
    async fn release(&mut self) -> CacheResult<()> {
        self.released = true;
        Self::unlock(self.conn.clone(), &self.scripts, &self.key, &self.secret).await
    }
}

impl Drop for RedisLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped without unlock (panic or early return); the TTL is the backstop.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let conn = self.conn.clone();
        let scripts = Arc::clone(&self.scripts);
        let key = std::mem::take(&mut self.key);
        let secret = std::mem::take(&mut self.secret);
        runtime.spawn(async move {
            if let Err(err) = RedisLock::unlock(conn, &scripts, &key, &secret).await {
                warn!(key = %key, error = %err, "failed to release dropped lock");
            }
        });
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_string(
        &self,
        key: &str,
        value: &str,
        expires: Option<Duration>,
    ) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        match expires {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64, expires: Option<Duration>) -> CacheResult<i64> {
        let mut conn = self.conn.clone();
        match expires {
            Some(ttl) => {
                let (value,): (i64,) = redis::pipe()
                    .atomic()
                    .incr(key, by)
                    .expire(key, ttl.as_secs().max(1) as i64)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok(value)
            }
            None => Ok(conn.incr(key, by).await?),
        }
    }

    async fn remove(&self, keys: &[String]) -> CacheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, expires: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, expires.as_secs().max(1) as i64)
            .await?;
        Ok(())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> CacheResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hash_increment(&self, key: &str, field: &str, by: i64) -> CacheResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, by).await?)
    }

    async fn hash_remove(&self, key: &str, fields: &[&str]) -> CacheResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: i64) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn sorted_set_pop_range(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> CacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let (members,): (Vec<String>,) = redis::pipe()
            .atomic()
            .zrangebyscore(key, min, max)
            .zrembyscore(key, min, max)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CacheResult<Subscription> {
        let (subscription, first) = self.fanout.add(channel, SUBSCRIBER_BUFFER);
        if first {
            if let Err(err) = self.sink.lock().await.subscribe(channel).await {
                self.fanout.remove(subscription.id);
                return Err(err.into());
            }
            debug!(channel, "redis channel subscribed");
        }
        Ok(subscription)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> CacheResult<()> {
        if let Some((channel, true)) = self.fanout.remove(id) {
            self.sink.lock().await.unsubscribe(&channel).await?;
            debug!(channel = %channel, "redis channel unsubscribed");
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: Bytes) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, message.as_ref()).await?;
        Ok(())
    }

    async fn lock(&self, key: &str) -> CacheResult<LockGuard> {
        let mut conn = self.conn.clone();
        let secret = Uuid::new_v4().to_string();
        for _ in 0..LOCK_ATTEMPTS {
            let acquired: i64 = self
                .scripts
                .lock
                .key(key)
                .arg(&secret)
                .arg(LOCK_TTL.as_secs())
                .invoke_async(&mut conn)
                .await?;
            if acquired == 1 {
                let held = RedisLock {
                    conn,
                    scripts: Arc::clone(&self.scripts),
                    key: key.to_string(),
                    secret,
                    released: false,
                };
                return Ok(LockGuard::new(key, Box::new(held)));
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
        Err(CacheError::LockExhausted {
            key: key.to_string(),
            attempts: LOCK_ATTEMPTS,
        })
    }

    async fn set_session_control(
        &self,
        session_key: &str,
        controls_key: &str,
        control_id: &str,
        control_json: &str,
        max_size: usize,
    ) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .scripts
            .set_session_control
            .key(session_key)
            .key(controls_key)
            .arg(max_size)
            .arg(control_id)
            .arg(control_json)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn remove_session_control(
        &self,
        session_key: &str,
        controls_key: &str,
        control_id: &str,
    ) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .scripts
            .remove_session_control
            .key(session_key)
            .key(controls_key)
            .arg(control_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
