//! Typed error taxonomy shared across the core.
//!
//! Leaf components return one of these enums; the Trading Loop is the
//! only place that converts a category into a state transition.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("normalized lot {lot} below minimum lot {min_lot}")]
    LotTooSmall { lot: f64, min_lot: f64 },
    #[error("stop-loss {sl} is not on the correct side of entry {entry} for {side:?}")]
    InvalidStopLoss { entry: f64, sl: f64, side: crate::types::Side },
    #[error("insufficient margin: required {required}, free {free}")]
    InsufficientMargin { required: f64, free: f64 },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger file corrupt: {0}")]
    Corrupt(String),
    #[error("no OPEN record found for ticket {0}")]
    NotFound(u64),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("command timed out waiting for a reply")]
    CommandTimeout,
    #[error("no EA connection is currently established")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error("close exhausted all retries for ticket {ticket}; position REQUIRES_MANUAL")]
    CloseFailed { ticket: u64 },
}

#[derive(Debug, Error)]
pub enum SarError {
    #[error("need at least {needed} bars to compute SAR, have {have}")]
    InsufficientBars { needed: usize, have: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
