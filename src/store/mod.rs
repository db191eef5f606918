mod memory;
mod redis_store;

pub use memory::InMemoryOrderStore;
pub use redis_store::RedisOrderStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::order::{Order, OrderRecord};

/// Shared, time-indexed store of pending orders with per-order TTL, a
/// due-query over a time-sorted index, and an atomic per-order execution
/// lock. All mutations are per-key atomic; no multi-key transactions are
/// required or used. Implementations must be safe to share across processes.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts or replaces the record for `order.id`. Idempotent: a second
    /// insert under the same id replaces the record and due-index entry in
    /// place, never duplicating the due-index. Fails if `expiry_instant` is
    /// already in the past.
    async fn insert(&self, order: Order, expiry_instant: DateTime<Utc>) -> Result<(), StoreError>;

    /// Orders whose `scheduled_instant <= now` and `expiry_instant > now`,
    /// in non-decreasing `scheduled_instant` order. Expired entries
    /// encountered along the way are evicted in passing.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Order>, StoreError>;

    /// Drops the record and its due-index entry. Idempotent.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Atomic set-if-absent with TTL. `true` establishes exclusivity for `ttl`.
    async fn try_lock(&self, id: &str, ttl: std::time::Duration) -> Result<bool, StoreError>;

    /// Best-effort lock release; never errors on an already-absent lock.
    async fn unlock(&self, id: &str) -> Result<(), StoreError>;

    async fn health(&self) -> Result<(), StoreError>;

    /// Test/diagnostic helper, not part of the core contract: fetch a single
    /// record by id without consulting the due-index.
    async fn get(&self, id: &str) -> Result<Option<OrderRecord>, StoreError>;
}
