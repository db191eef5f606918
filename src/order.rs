use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DispatchErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variety {
    Regular,
    Amo,
}

/// The unit of work: one instruction to place a single order at a scheduled instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub exchange: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: u32,
    pub scheduled_instant: DateTime<Utc>,
    pub is_amo: bool,
    pub created_instant: DateTime<Utc>,
}

impl Order {
    /// Deterministic id from (symbol, exchange, scheduled_instant, lot_index) so
    /// re-ingesting the same source row yields the same identity.
    pub fn derive_id(symbol: &str, exchange: &str, scheduled_instant: DateTime<Utc>, lot_index: u32) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        symbol.hash(&mut hasher);
        exchange.hash(&mut hasher);
        scheduled_instant.timestamp().hash(&mut hasher);
        lot_index.hash(&mut hasher);
        format!("{symbol}-{:016x}", hasher.finish())
    }

    pub fn variety(&self) -> Variety {
        if self.is_amo {
            Variety::Amo
        } else {
            Variety::Regular
        }
    }
}

/// Store entry: the order plus its eviction bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order: Order,
    pub expiry_instant: DateTime<Utc>,
    pub inserted_instant: DateTime<Utc>,
}

impl OrderRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_instant <= now
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.order.scheduled_instant <= now && !self.is_expired(now)
    }
}

/// Per-attempt timing, surfaced alongside every outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DispatchProfile {
    pub scheduler_delay_ms: i64,
    pub broker_call_latency_ms: i64,
    pub total_latency_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub id: String,
    pub success: bool,
    pub broker_reference: Option<String>,
    pub executed_instant: DateTime<Utc>,
    pub error_kind: Option<DispatchErrorKind>,
    pub error_detail: Option<String>,
    pub profile: DispatchProfile,
}

/// Split a parent row's total quantity across `lots` suborders. The first
/// `total % lots` lots carry `total / lots + 1`; the rest carry `total / lots`.
/// Sums to `total` exactly.
pub fn split_lots(total: u32, lots: u32) -> Vec<u32> {
    assert!(lots >= 1, "lots must be at least 1");
    let base = total / lots;
    let remainder = total % lots;
    (0..lots)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}
