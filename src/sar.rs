//! Parabolic SAR Engine.
//!
//! Pure and stateless at the call boundary: given a bar window, returns
//! the SAR value, trend, and flip status at the last bar. No I/O, no
//! logging.

use crate::error::SarError;
use crate::types::{Bar, SarState, Trend};

pub const DEFAULT_ACCELERATION: f64 = 0.02;
pub const DEFAULT_MAXIMUM: f64 = 0.2;
pub const MIN_WARMUP_BARS: usize = 50;

struct Step {
    sar: f64,
    trend: Trend,
    ep: f64,
    accel: f64,
}

/// Computes Parabolic SAR over the full bar window and returns the state
/// at the last bar plus whether the trend flipped between the last two bars.
///
/// `bars` must be ascending by time. Fewer than `MIN_WARMUP_BARS` bars
/// returns `SarError::InsufficientBars` — the engine is accurate but not
/// yet stable below that warm-up window.
pub fn compute(bars: &[Bar], acceleration: f64, maximum: f64) -> Result<SarState, SarError> {
    if bars.len() < MIN_WARMUP_BARS {
        return Err(SarError::InsufficientBars { needed: MIN_WARMUP_BARS, have: bars.len() });
    }

    let mut steps: Vec<Step> = Vec::with_capacity(bars.len());

    let initial_trend = if bars[1].close >= bars[0].close { Trend::Uptrend } else { Trend::Downtrend };
    let initial_ep = match initial_trend {
        Trend::Uptrend => bars[0].high,
        Trend::Downtrend => bars[0].low,
    };
    let initial_sar = match initial_trend {
        Trend::Uptrend => bars[0].low,
        Trend::Downtrend => bars[0].high,
    };
    steps.push(Step { sar: initial_sar, trend: initial_trend, ep: initial_ep, accel: acceleration });

    for i in 1..bars.len() {
        let prev = &steps[i - 1];
        let mut tentative = prev.sar + prev.accel * (prev.ep - prev.sar);

        let next = match prev.trend {
            Trend::Uptrend => {
                let low1 = bars[i - 1].low;
                let low2 = if i >= 2 { bars[i - 2].low } else { low1 };
                tentative = tentative.min(low1).min(low2);

                if bars[i].low <= tentative {
                    Step { sar: prev.ep, trend: Trend::Downtrend, ep: bars[i].low, accel: acceleration }
                } else if bars[i].high > prev.ep {
                    Step {
                        sar: tentative,
                        trend: Trend::Uptrend,
                        ep: bars[i].high,
                        accel: (prev.accel + acceleration).min(maximum),
                    }
                } else {
                    Step { sar: tentative, trend: Trend::Uptrend, ep: prev.ep, accel: prev.accel }
                }
            }
            Trend::Downtrend => {
                let high1 = bars[i - 1].high;
                let high2 = if i >= 2 { bars[i - 2].high } else { high1 };
                tentative = tentative.max(high1).max(high2);

                if bars[i].high >= tentative {
                    Step { sar: prev.ep, trend: Trend::Uptrend, ep: bars[i].high, accel: acceleration }
                } else if bars[i].low < prev.ep {
                    Step {
                        sar: tentative,
                        trend: Trend::Downtrend,
                        ep: bars[i].low,
                        accel: (prev.accel + acceleration).min(maximum),
                    }
                } else {
                    Step { sar: tentative, trend: Trend::Downtrend, ep: prev.ep, accel: prev.accel }
                }
            }
        };
        steps.push(next);
    }

    let last = steps.last().expect("at least MIN_WARMUP_BARS steps pushed");
    let prev_trend = steps[steps.len() - 2].trend;
    let last_close = bars.last().expect("non-empty").close;

    Ok(SarState {
        sar: last.sar,
        trend: last.trend,
        distance: (last_close - last.sar).abs(),
        flipped_at_last_bar: last.trend != prev_trend,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(i: usize, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar { time: i as i64 * 900, open, high, low, close, volume: 100.0 }
    }

    /// A clean uptrend: each bar's high/low steps up monotonically.
    fn uptrend_bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let base = 2000.0 + i as f64 * 1.0;
                bar(i, base, base + 2.0, base - 1.0, base + 1.5)
            })
            .collect()
    }

    #[test]
    fn insufficient_bars_errors() {
        let bars = uptrend_bars(10);
        let err = compute(&bars, DEFAULT_ACCELERATION, DEFAULT_MAXIMUM).unwrap_err();
        matches!(err, SarError::InsufficientBars { .. });
    }

    #[test]
    fn clean_uptrend_detects_uptrend_and_no_flip() {
        let bars = uptrend_bars(60);
        let state = compute(&bars, DEFAULT_ACCELERATION, DEFAULT_MAXIMUM).unwrap();
        assert_eq!(state.trend, Trend::Uptrend);
        assert!(!state.flipped_at_last_bar);
        assert!(state.sar < bars.last().unwrap().close);
    }

    #[test]
    fn deterministic_across_repeated_calls() {
        let bars = uptrend_bars(60);
        let a = compute(&bars, DEFAULT_ACCELERATION, DEFAULT_MAXIMUM).unwrap();
        let b = compute(&bars, DEFAULT_ACCELERATION, DEFAULT_MAXIMUM).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn reversal_flips_trend() {
        let mut bars = uptrend_bars(55);
        // Sharp drop at the end should eventually flip the trend to DOWNTREND.
        for i in 0..5 {
            let base = bars.last().unwrap().close - (i as f64 + 1.0) * 10.0;
            bars.push(bar(bars.len(), base, base + 1.0, base - 2.0, base - 1.5));
        }
        let state = compute(&bars, DEFAULT_ACCELERATION, DEFAULT_MAXIMUM).unwrap();
        assert_eq!(state.trend, Trend::Downtrend);
    }
}
