//! Position Monitor.
//!
//! Pure decision function over the current position, the latest SAR
//! state, and the latest tick. Exit conditions are checked in a fixed
//! order so only one `MonitorAction` is ever produced per cycle: a
//! reversal always wins over trailing, an emergency stop always wins
//! over a reversal that hasn't been acted on yet.

use crate::types::{CloseReason, Position, SarState, Side, Tick};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorAction {
    Hold,
    TrailStopTo(f64),
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// A MODIFY is only sent when the new stop differs from the current
    /// one by more than this many points, so trailing does not spam the
    /// bridge on every tick.
    pub min_trail_step_points: f64,
    /// Extra tolerance, in points beyond the position's own SL, required
    /// before the monitor force-closes. Zero matches the literal `bid <= SL`
    /// / `ask >= SL` trigger; a small positive value can be used
    /// operationally to ride out quote noise right at the line without
    /// weakening the gap-protection guarantee the emergency stop exists for.
    pub emergency_buffer_points: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig { min_trail_step_points: 1.0, emergency_buffer_points: 0.0 }
    }
}

/// Current market price for the side that determines adverse/favorable
/// excursion: a BUY is stopped out on the bid, a SELL on the ask.
pub(crate) fn marked_price(side: Side, tick: &Tick) -> f64 {
    match side {
        Side::Buy => tick.bid,
        Side::Sell => tick.ask,
    }
}

pub fn evaluate(
    position: &Position,
    sar: &SarState,
    tick: &Tick,
    cfg: &MonitorConfig,
) -> MonitorAction {
    let price = marked_price(position.side, tick);
    let point = tick.point.max(f64::EPSILON);

    let against_position = match position.side {
        Side::Buy => sar.trend == crate::types::Trend::Downtrend,
        Side::Sell => sar.trend == crate::types::Trend::Uptrend,
    };
    if against_position && sar.flipped_at_last_bar {
        return MonitorAction::Close(CloseReason::SarReversal);
    }

    let emergency_breached = match position.side {
        Side::Buy => price <= position.sl - cfg.emergency_buffer_points * point,
        Side::Sell => price >= position.sl + cfg.emergency_buffer_points * point,
    };
    if emergency_breached {
        return MonitorAction::Close(CloseReason::EmergencySl);
    }

    trailing_action(position, sar, cfg, point)
}

/// Trails the stop to the latest SAR value, but only in the direction
/// that improves the position (never loosens the stop) and only when
/// the move clears `min_trail_step_points`.
fn trailing_action(position: &Position, sar: &SarState, cfg: &MonitorConfig, point: f64) -> MonitorAction {
    let candidate = sar.sar;
    let min_step = cfg.min_trail_step_points * point;

    let improves = match position.side {
        Side::Buy => candidate > position.sl && candidate - position.sl >= min_step,
        Side::Sell => candidate < position.sl && position.sl - candidate >= min_step,
    };

    if improves {
        MonitorAction::TrailStopTo(candidate)
    } else {
        MonitorAction::Hold
    }
}
