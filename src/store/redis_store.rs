use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{redis, redis::AsyncCommands, Config as PoolConfig, Pool, Runtime};
use tracing::warn;

use super::OrderStore;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::order::{Order, OrderRecord};

const PENDING_ORDERS_KEY: &str = "pending_orders";

fn order_key(id: &str) -> String {
    format!("order:{id}")
}

fn lock_key(id: &str) -> String {
    format!("lock:order:{id}")
}

/// `OrderStore` backed by Redis, matching the persisted key layout operators
/// rely on: `order:{id}` (JSON record, TTL = time-to-expiry), `pending_orders`
/// (sorted set scored by `scheduled_instant` seconds), `lock:order:{id}`
/// (advisory lock, TTL = `lock_ttl`).
pub struct RedisOrderStore {
    pool: Pool,
}

impl RedisOrderStore {
    pub fn connect(config: &StoreConfig) -> anyhow::Result<Self> {
        let pool_config = PoolConfig::from_url(build_url(config));
        let pool = pool_config.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self { pool })
    }

    async fn evict_if_stale(&self, id: &str, record: Option<OrderRecord>, now: DateTime<Utc>) -> Result<Option<Order>, StoreError> {
        match record {
            Some(record) if record.is_expired(now) => {
                self.remove(id).await?;
                Ok(None)
            }
            Some(record) if record.is_due(now) => Ok(Some(record.order)),
            Some(_) => Ok(None),
            None => {
                // due-index entry with no backing record: self-healing, drop it.
                self.remove(id).await?;
                Ok(None)
            }
        }
    }
}

fn build_url(config: &StoreConfig) -> String {
    match &config.password {
        Some(password) if !password.is_empty() => {
            format!("redis://:{password}@{}/{}", config.address, config.database)
        }
        _ => format!("redis://{}/{}", config.address, config.database),
    }
}

#[async_trait]
impl OrderStore for RedisOrderStore {
    async fn insert(&self, order: Order, expiry_instant: DateTime<Utc>) -> Result<(), StoreError> {
        let now = Utc::now();
        if expiry_instant <= now {
            return Err(StoreError::Expired(order.id));
        }
        let ttl_seconds = (expiry_instant - now).num_seconds().max(1) as u64;
        let id = order.id.clone();
        let score = order.scheduled_instant.timestamp();
        let record = OrderRecord {
            order,
            expiry_instant,
            inserted_instant: now,
        };
        let payload = serde_json::to_string(&record)?;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        conn.set_ex::<_, _, ()>(order_key(&id), payload, ttl_seconds)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.zadd::<_, _, _, ()>(PENDING_ORDERS_KEY, &id, score)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        let ids: Vec<String> = conn
            .zrangebyscore(PENDING_ORDERS_KEY, 0, now.timestamp())
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut due_orders = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn
                .get(order_key(&id))
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let record = match raw {
                Some(raw) => Some(serde_json::from_str::<OrderRecord>(&raw)?),
                None => None,
            };
            if let Some(order) = self.evict_if_stale(&id, record, now).await? {
                due_orders.push(order);
            }
        }
        Ok(due_orders)
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        conn.del::<_, ()>(order_key(id))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.zrem::<_, _, ()>(PENDING_ORDERS_KEY, id)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn try_lock(&self, id: &str, ttl: StdDuration) -> Result<bool, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        let ok: Option<String> = redis::cmd("SET")
            .arg(lock_key(id))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(ok.is_some())
    }

    async fn unlock(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        conn.del::<_, ()>(lock_key(id))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn health(&self) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if pong != "PONG" {
            warn!(%pong, "unexpected PING reply from store backend");
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<OrderRecord>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        let raw: Option<String> = conn
            .get(order_key(id))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }
}
