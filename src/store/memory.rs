use std::collections::{BTreeMap, HashMap};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::OrderStore;
use crate::error::StoreError;
use crate::order::{Order, OrderRecord};

struct Inner {
    records: HashMap<String, OrderRecord>,
    // (scheduled_instant seconds, insertion sequence) -> id, breaking ties by
    // insertion order as the contract requires.
    due_index: BTreeMap<(i64, u64), String>,
    sequence: HashMap<String, u64>,
    next_sequence: u64,
    locks: HashMap<String, DateTime<Utc>>,
}

/// Process-local `OrderStore`, useful for tests and single-process demos.
/// Provides no cross-process exclusivity and is therefore not a production
/// backend — `RedisOrderStore` is.
pub struct InMemoryOrderStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                due_index: BTreeMap::new(),
                sequence: HashMap::new(),
                next_sequence: 0,
                locks: HashMap::new(),
            }),
        }
    }

    fn remove_locked(inner: &mut Inner, id: &str) {
        if let Some(seq) = inner.sequence.remove(id) {
            if let Some(record) = inner.records.remove(id) {
                inner
                    .due_index
                    .remove(&(record.order.scheduled_instant.timestamp(), seq));
            }
        } else {
            inner.records.remove(id);
        }
        inner.locks.remove(id);
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, order: Order, expiry_instant: DateTime<Utc>) -> Result<(), StoreError> {
        if expiry_instant <= Utc::now() {
            return Err(StoreError::Expired(order.id));
        }
        let mut inner = self.inner.lock();
        let id = order.id.clone();

        if let Some(old_seq) = inner.sequence.remove(&id) {
            if let Some(old) = inner.records.remove(&id) {
                inner
                    .due_index
                    .remove(&(old.order.scheduled_instant.timestamp(), old_seq));
            }
        }

        let seq = inner.next_sequence;
        inner.next_sequence += 1;
        inner.sequence.insert(id.clone(), seq);
        inner
            .due_index
            .insert((order.scheduled_instant.timestamp(), seq), id.clone());
        inner.records.insert(
            id,
            OrderRecord {
                order,
                expiry_instant,
                inserted_instant: Utc::now(),
            },
        );
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        let mut inner = self.inner.lock();
        let due_keys: Vec<(i64, u64)> = inner
            .due_index
            .range(..=(now.timestamp(), u64::MAX))
            .map(|(k, _)| *k)
            .collect();

        let mut due_orders = Vec::new();
        let mut to_evict = Vec::new();
        for key in due_keys {
            let Some(id) = inner.due_index.get(&key).cloned() else {
                continue;
            };
            match inner.records.get(&id) {
                Some(record) if record.is_expired(now) => to_evict.push(id),
                Some(record) if record.is_due(now) => due_orders.push(record.order.clone()),
                None => to_evict.push(id),
                _ => {}
            }
        }
        for id in to_evict {
            Self::remove_locked(&mut inner, &id);
        }
        Ok(due_orders)
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        Self::remove_locked(&mut inner, id);
        Ok(())
    }

    async fn try_lock(&self, id: &str, ttl: StdDuration) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        if let Some(expiry) = inner.locks.get(id) {
            if *expiry > now {
                return Ok(false);
            }
        }
        inner.locks.insert(
            id.to_string(),
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
        );
        Ok(true)
    }

    async fn unlock(&self, id: &str) -> Result<(), StoreError> {
        self.inner.lock().locks.remove(id);
        Ok(())
    }

    async fn health(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<OrderRecord>, StoreError> {
        Ok(self.inner.lock().records.get(id).cloned())
    }
}
