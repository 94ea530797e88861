//! Wire and domain types shared across the core.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trend {
    Uptrend,
    Downtrend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
}

/// Which signal kinds the Trading Loop is allowed to act on (config surface `trading.desired_signal`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DesiredSignal {
    Buy,
    Sell,
    Both,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Signal {
    pub kind: SignalKind,
    pub reason: String,
    pub timestamp: i64,
}

/// Instantaneous market snapshot. Latest-wins in the Market-Data Cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub spread: i32,
    pub time: String,
    pub point: f64,
    pub digits: i32,
    pub contract_size: f64,
    pub min_lot: f64,
    pub max_lot: f64,
    pub lot_step: f64,
    /// Local receipt time (seconds since epoch), used for `fresh_within`.
    #[serde(skip, default)]
    pub received_at: i64,
}

/// Account fields embedded in the same `market_data` payload as the Tick.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub profit: f64,
    pub leverage: f64,
    pub open_positions: i32,
    #[serde(skip, default)]
    pub received_at: i64,
}

/// One OHLC + tick-volume period.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Output of the Parabolic SAR Engine over a bar window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SarState {
    pub sar: f64,
    pub trend: Trend,
    pub distance: f64,
    pub flipped_at_last_bar: bool,
}

#[derive(Clone, Debug)]
pub struct OpenOrderRequest {
    pub side: Side,
    pub volume: f64,
    pub sl: f64,
    pub tp: f64,
    pub comment: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    RequiresManual,
}

#[derive(Clone, Debug)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub sl: f64,
    pub tp: f64,
    /// Monetary exposure per unit of price move per lot.
    /// Carried on the position itself since realized P/L must use the
    /// contract size in effect when the position was opened, not whatever
    /// the cache's latest tick happens to report at close time.
    pub contract_size: f64,
    pub unrealized_pl: f64,
    pub open_time: i64,
    pub comment: Option<String>,
    pub status: PositionStatus,
}

impl Position {
    /// Applies a trailing-stop MODIFY in place. The caller already verified
    /// monotonicity; this only updates the in-memory mirror.
    pub fn apply_new_sl(&mut self, new_sl: f64) {
        self.sl = new_sl;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    TpHit,
    SlHit,
    SarReversal,
    EmergencySl,
    Manual,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::TpHit => "TP_HIT",
            CloseReason::SlHit => "SL_HIT",
            CloseReason::SarReversal => "SAR_REVERSAL",
            CloseReason::EmergencySl => "EMERGENCY_SL",
            CloseReason::Manual => "MANUAL",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TradeStatus {
    Open,
    Closed,
}

/// Append-only ledger entry, written at open and updated at close.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ticket: u64,
    pub entry_time: i64,
    pub side: Side,
    pub entry_price: f64,
    pub sl: f64,
    pub tp: f64,
    pub volume: f64,
    pub account_balance_at_entry: f64,
    pub status: TradeStatusWire,
    pub exit_price: Option<f64>,
    pub exit_time: Option<i64>,
    pub realized_pl: Option<f64>,
    pub close_reason: Option<String>,
}

/// Serializable mirror of `TradeStatus` (kept distinct so the domain enum
/// can grow variants without touching the on-disk schema carelessly).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatusWire {
    Open,
    Closed,
}

impl From<TradeStatus> for TradeStatusWire {
    fn from(s: TradeStatus) -> Self {
        match s {
            TradeStatus::Open => TradeStatusWire::Open,
            TradeStatus::Closed => TradeStatusWire::Closed,
        }
    }
}

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Listening,
    Connected,
    Degraded,
    Closed,
}

/// Events the notifier sink consumes; the core never calls an external
/// service directly, it only ever pushes one of these.
#[derive(Clone, Debug)]
pub enum NotificationEvent {
    PauseEngaged { reason: String, until: chrono::DateTime<chrono::Utc> },
    TradeOpened { symbol: String, side: Side, volume: f64, entry: f64, sl: f64, tp: f64 },
    TradeClosed { symbol: String, side: Side, entry: f64, exit: f64, pnl: f64, reason: CloseReason },
    RiskAlert { message: String },
    BridgeStateChanged { from: ConnectionState, to: ConnectionState },
}
