use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy for the order store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("order {0} already expired at insert time")]
    Expired(String),
    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Broker error taxonomy, per the wire-format contract every adapter must honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    Network,
    Auth,
    RateLimited,
    Invalid,
    Server,
    Unknown,
}

#[derive(Debug, Error)]
#[error("broker error ({kind:?}): {detail}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub detail: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Terminal outcome classification surfaced at the dispatcher layer, a superset
/// of `BrokerErrorKind` that also covers conditions the broker never sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchErrorKind {
    Network,
    Auth,
    RateLimited,
    Invalid,
    Server,
    Unknown,
    Expired,
    Cancelled,
}

impl From<BrokerErrorKind> for DispatchErrorKind {
    fn from(kind: BrokerErrorKind) -> Self {
        match kind {
            BrokerErrorKind::Network => DispatchErrorKind::Network,
            BrokerErrorKind::Auth => DispatchErrorKind::Auth,
            BrokerErrorKind::RateLimited => DispatchErrorKind::RateLimited,
            BrokerErrorKind::Invalid => DispatchErrorKind::Invalid,
            BrokerErrorKind::Server => DispatchErrorKind::Server,
            BrokerErrorKind::Unknown => DispatchErrorKind::Unknown,
        }
    }
}

#[derive(Debug, Error)]
#[error("dispatch error ({kind:?}): {detail}")]
pub struct DispatchError {
    pub kind: DispatchErrorKind,
    pub detail: String,
}

impl DispatchError {
    pub fn new(kind: DispatchErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}
