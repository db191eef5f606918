use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::{BrokerClient, SymbolStatus};
use crate::error::{BrokerError, BrokerErrorKind};
use crate::order::Order;

/// In-process broker double, configurable to fail deterministically. Mirrors
/// the dry-run flag pattern used for paper-trading execution, adapted from a
/// single boolean into a pluggable failure hook for test scenarios.
pub struct MockBrokerClient {
    next_reference: AtomicU64,
    fail_next: RwLock<Option<BrokerErrorKind>>,
}

impl Default for MockBrokerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrokerClient {
    pub fn new() -> Self {
        Self {
            next_reference: AtomicU64::new(1),
            fail_next: RwLock::new(None),
        }
    }

    /// Arranges for the next placement call to fail with `kind`.
    pub fn fail_next_with(&self, kind: BrokerErrorKind) {
        *self.fail_next.write() = Some(kind);
    }

    fn maybe_fail(&self) -> Option<BrokerError> {
        self.fail_next
            .write()
            .take()
            .map(|kind| BrokerError::new(kind, "mock broker configured to fail"))
    }

    fn next_reference(&self) -> String {
        format!("MOCK-{}", self.next_reference.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    async fn place_regular(&self, _order: &Order, _cancel: &CancellationToken) -> Result<String, BrokerError> {
        if let Some(err) = self.maybe_fail() {
            return Err(err);
        }
        Ok(self.next_reference())
    }

    async fn place_amo(&self, _order: &Order, _cancel: &CancellationToken) -> Result<String, BrokerError> {
        if let Some(err) = self.maybe_fail() {
            return Err(err);
        }
        Ok(self.next_reference())
    }

    async fn health(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn validate_symbol(&self, _exchange: &str, _symbol: &str) -> Result<SymbolStatus, BrokerError> {
        Ok(SymbolStatus::Known)
    }
}
