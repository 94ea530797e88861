//! Risk Calculator.
//!
//! Pure functions over plain numbers — no cache/ledger dependency — so
//! they are trivially unit-testable.

use crate::error::RiskError;
use crate::types::Side;

pub struct LotParams {
    pub contract_size: f64,
    pub min_lot: f64,
    pub max_lot: f64,
    pub lot_step: f64,
}

/// Raw lot = (balance * r/100) / (|entry - sl| * contract_size), normalized
/// by flooring to the nearest lot_step multiple and clamping to [min_lot, max_lot].
pub fn calculate_lot_size(
    balance: f64,
    risk_percentage: f64,
    entry: f64,
    sl: f64,
    params: &LotParams,
) -> Result<f64, RiskError> {
    let risk_amount = balance * risk_percentage / 100.0;
    let per_unit_risk = (entry - sl).abs() * params.contract_size;
    let raw_lot = if per_unit_risk > 0.0 { risk_amount / per_unit_risk } else { 0.0 };

    let stepped = (raw_lot / params.lot_step).floor() * params.lot_step;
    let normalized = stepped.clamp(0.0, params.max_lot);

    if normalized < params.min_lot {
        return Err(RiskError::LotTooSmall { lot: normalized, min_lot: params.min_lot });
    }

    Ok(normalized)
}

/// TP = entry + 2*(entry - sl) for BUY, entry - 2*(sl - entry) for SELL.
/// Validates SL is on the correct side of entry for the requested side.
pub fn derive_take_profit(side: Side, entry: f64, sl: f64) -> Result<f64, RiskError> {
    match side {
        Side::Buy => {
            if sl >= entry {
                return Err(RiskError::InvalidStopLoss { entry, sl, side });
            }
            Ok(entry + 2.0 * (entry - sl))
        }
        Side::Sell => {
            if sl <= entry {
                return Err(RiskError::InvalidStopLoss { entry, sl, side });
            }
            Ok(entry - 2.0 * (sl - entry))
        }
    }
}

/// Margin sanity check: required margin for `volume` lots at `entry`,
/// compared against the account's free margin. `InsufficientMargin` is
/// inferred locally from the account snapshot rather than reported
/// directly by the EA.
pub fn check_margin(volume: f64, entry: f64, contract_size: f64, leverage: f64, free_margin: f64) -> Result<(), RiskError> {
    if leverage <= 0.0 {
        return Ok(());
    }
    let required = (volume * contract_size * entry) / leverage;
    if required > free_margin {
        return Err(RiskError::InsufficientMargin { required, free: free_margin });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> LotParams {
        LotParams { contract_size: 100.0, min_lot: 0.01, max_lot: 100.0, lot_step: 0.01 }
    }

    #[test]
    fn scenario_clean_buy_lifecycle_lot_and_tp() {
        // balance=10000, r=1%, entry=2223.57, sar/sl=2195.23
        let lot = calculate_lot_size(10_000.0, 1.0, 2223.57, 2195.23, &params()).unwrap();
        assert!((lot - 0.03).abs() < 1e-6, "expected ~0.03 lot, got {lot}");

        let tp = derive_take_profit(Side::Buy, 2223.57, 2195.23).unwrap();
        assert!((tp - 2280.25).abs() < 1e-6, "expected TP 2280.25, got {tp}");
    }

    #[test]
    fn lot_too_small_when_risk_amount_tiny() {
        let err = calculate_lot_size(10.0, 0.01, 2223.57, 2195.23, &params()).unwrap_err();
        assert!(matches!(err, RiskError::LotTooSmall { .. }));
    }

    #[test]
    fn invalid_stop_loss_on_wrong_side() {
        let err = derive_take_profit(Side::Buy, 2223.57, 2230.0).unwrap_err();
        assert!(matches!(err, RiskError::InvalidStopLoss { .. }));
        let err = derive_take_profit(Side::Sell, 2223.57, 2210.0).unwrap_err();
        assert!(matches!(err, RiskError::InvalidStopLoss { .. }));
    }

    #[test]
    fn sell_take_profit_direction() {
        let tp = derive_take_profit(Side::Sell, 2223.57, 2251.91).unwrap();
        assert!(tp < 2223.57);
    }
}
