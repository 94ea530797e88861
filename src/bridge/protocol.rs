//! Wire schemas for the EA<->Bridge channel.
//!
//! Every inbound frame is a UTF-8 JSON object tagged by `type`; every
//! outbound frame is tagged by `action`. Unknown `type` is a protocol
//! error, not a silent pass-through.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize)]
pub struct RateBar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    MarketData {
        symbol: String,
        bid: f64,
        ask: f64,
        spread: i32,
        time: String,
        point: f64,
        digits: i32,
        contract_size: f64,
        min_lot: f64,
        max_lot: f64,
        lot_step: f64,
        balance: f64,
        equity: f64,
        margin: f64,
        free_margin: f64,
        profit: f64,
        leverage: f64,
        open_positions: i32,
    },
    Position {
        ticket: u64,
        symbol: String,
        pos_type: String,
        volume: f64,
        price_open: f64,
        price_current: f64,
        sl: f64,
        tp: f64,
        profit: f64,
        #[serde(default)]
        comment: Option<String>,
    },
    Rates {
        data: Vec<RateBar>,
    },
    OrderResult {
        success: bool,
        action: String,
        ticket: Option<u64>,
        volume: Option<f64>,
        price: Option<f64>,
        sl: Option<f64>,
        tp: Option<f64>,
    },
    Response {
        status: String,
        #[serde(default)]
        message: Option<String>,
    },
    Heartbeat {
        time: String,
        status: String,
    },
}

impl InboundMessage {
    /// `true` for the message types the dispatcher correlates against an
    /// outstanding command (order_result, response).
    pub fn is_command_reply(&self) -> bool {
        matches!(
            self,
            InboundMessage::OrderResult { .. } | InboundMessage::Response { .. } | InboundMessage::Rates { .. }
        )
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "action", rename_all = "UPPERCASE")]
pub enum OutboundCommand {
    Buy { volume: f64, sl: f64, tp: f64, comment: Option<String> },
    Sell { volume: f64, sl: f64, tp: f64, comment: Option<String> },
    Close { ticket: u64 },
    Modify { ticket: u64, sl: f64, tp: f64 },
    #[serde(rename = "GET_POSITIONS")]
    GetPositions,
    #[serde(rename = "GET_RATES")]
    GetRates { count: u32, timeframe: String },
}

impl OutboundCommand {
    /// Commands that expect a correlated reply (everything except
    /// fire-and-forget queries handled out of band).
    pub fn expects_reply(&self) -> bool {
        true
    }
}
