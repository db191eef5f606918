mod kite;
mod mock;

pub use kite::KiteBrokerClient;
pub use mock::MockBrokerClient;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::order::Order;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolStatus {
    Known,
    Unknown,
}

/// Broker transport contract. Adapters MUST NOT crash on `Auth` failure;
/// they report it classified, per the error taxonomy in `BrokerError`.
///
/// `place_regular`/`place_amo` are cancellable suspension points: adapters
/// race the in-flight call against `cancel` so a shutdown signal aborts the
/// request rather than waiting out the full call deadline.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn place_regular(&self, order: &Order, cancel: &CancellationToken) -> Result<String, BrokerError>;
    async fn place_amo(&self, order: &Order, cancel: &CancellationToken) -> Result<String, BrokerError>;
    async fn health(&self) -> Result<(), BrokerError>;
    async fn validate_symbol(&self, exchange: &str, symbol: &str) -> Result<SymbolStatus, BrokerError>;
}
