//! Circuit Breaker.
//!
//! Evaluated before every intended open, after every close, and on
//! bridge startup. State is persisted as a single JSON document,
//! rewritten atomically via temp-file + rename.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ledger::TradeLedger;
use crate::types::NotificationEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub pause_end_time: Option<DateTime<Utc>>,
    pub consecutive_losses: u32,
    pub total_pause_count: u32,
    pub last_reset_date: NaiveDate,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        CircuitBreakerState {
            is_paused: false,
            pause_reason: None,
            pause_end_time: None,
            consecutive_losses: 0,
            total_pause_count: 0,
            last_reset_date: Local::now().date_naive(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProtectionConfig {
    pub daily_loss_enabled: bool,
    pub max_daily_loss_percentage: f64,
    pub max_daily_loss_dollars: f64,
    pub use_percentage: bool,
    pub tier1_threshold: u32,
    pub tier1_pause: ChronoDuration,
    pub tier2_threshold: u32,
    pub tier2_pause: ChronoDuration,
    pub rolling_window: usize,
    pub rolling_loss_rate_threshold: f64,
    pub rolling_pause: ChronoDuration,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        ProtectionConfig {
            daily_loss_enabled: true,
            max_daily_loss_percentage: 10.0,
            max_daily_loss_dollars: 1_000.0,
            use_percentage: true,
            tier1_threshold: 5,
            tier1_pause: ChronoDuration::hours(3),
            tier2_threshold: 8,
            tier2_pause: ChronoDuration::hours(5),
            rolling_window: 10,
            rolling_loss_rate_threshold: 0.7,
            rolling_pause: ChronoDuration::hours(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allow,
    Deny { reason: String },
}

pub struct CircuitBreaker {
    state: Mutex<CircuitBreakerState>,
    path: PathBuf,
    cfg: ProtectionConfig,
}

impl CircuitBreaker {
    pub fn load(state_path: impl AsRef<Path>, cfg: ProtectionConfig) -> std::io::Result<Self> {
        let path = state_path.as_ref().to_path_buf();
        let state = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text).unwrap_or_default()
        } else {
            CircuitBreakerState::default()
        };
        Ok(CircuitBreaker { state: Mutex::new(state), path, cfg })
    }

    fn persist(&self, state: &CircuitBreakerState) -> std::io::Result<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(state)?;
        let mut file = File::create(&tmp_path)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.state.lock().clone()
    }

    /// Gate 1: daily rollover. Clears any pause and resets the loss
    /// streak when the local date has moved on.
    fn maybe_rollover(&self, state: &mut CircuitBreakerState, today: NaiveDate) {
        if state.last_reset_date != today {
            state.is_paused = false;
            state.pause_reason = None;
            state.pause_end_time = None;
            state.consecutive_losses = 0;
            state.last_reset_date = today;
        }
    }

    /// Gates 1–3: rollover, active pause, daily loss limit. Called before
    /// every intended open and on bridge startup.
    pub fn evaluate_before_open(
        &self,
        ledger: &TradeLedger,
        current_balance: f64,
        now: DateTime<Utc>,
        notifier: &mut dyn FnMut(NotificationEvent),
    ) -> Result<GateDecision, crate::error::LedgerError> {
        let today = now.with_timezone(&Local).date_naive();
        let mut state = self.state.lock();
        self.maybe_rollover(&mut state, today);

        if state.is_paused {
            if let Some(end) = state.pause_end_time {
                if now < end {
                    let reason = state.pause_reason.clone().unwrap_or_default();
                    let _ = self.persist(&state);
                    return Ok(GateDecision::Deny { reason });
                }
            }
            state.is_paused = false;
            state.pause_reason = None;
            state.pause_end_time = None;
        }

        if self.cfg.daily_loss_enabled {
            let anchor = ledger.first_trade_balance(today)?.unwrap_or(current_balance);
            let agg = ledger.daily_aggregate(today)?;
            let realized_pl = agg.total_realized_pl;
            if realized_pl < 0.0 {
                let threshold = if self.cfg.use_percentage {
                    anchor * self.cfg.max_daily_loss_percentage / 100.0
                } else {
                    self.cfg.max_daily_loss_dollars
                };
                if realized_pl.abs() >= threshold {
                    let until = next_local_midnight_utc(today);
                    let reason = "daily loss limit".to_string();
                    self.engage(&mut state, reason.clone(), until, notifier);
                    self.persist(&state).ok();
                    return Ok(GateDecision::Deny { reason });
                }
            }
        }

        self.persist(&state).ok();
        Ok(GateDecision::Allow)
    }

    /// Gates 4–6, plus loss-streak recompute. Called after every close.
    pub fn on_trade_closed(
        &self,
        ledger: &TradeLedger,
        now: DateTime<Utc>,
        notifier: &mut dyn FnMut(NotificationEvent),
    ) -> Result<(), crate::error::LedgerError> {
        let today = now.with_timezone(&Local).date_naive();
        let agg = ledger.daily_aggregate(today)?;

        let mut state = self.state.lock();
        self.maybe_rollover(&mut state, today);
        state.consecutive_losses = agg.consecutive_losses_from_end;

        if state.consecutive_losses >= self.cfg.tier2_threshold {
            let base = state.pause_end_time.filter(|&e| e > now).unwrap_or(now);
            let until = base + self.cfg.tier2_pause;
            self.engage_if_longer(&mut state, "consecutive losses tier 2".to_string(), until, notifier);
        } else if state.consecutive_losses >= self.cfg.tier1_threshold {
            let until = now + self.cfg.tier1_pause;
            self.engage_if_longer(&mut state, "consecutive losses tier 1".to_string(), until, notifier);
        }

        if agg.last_n_results.len() >= self.cfg.rolling_window {
            let losses = agg.last_n_results.iter().filter(|&&l| l).count();
            let rate = losses as f64 / agg.last_n_results.len() as f64;
            if rate >= self.cfg.rolling_loss_rate_threshold {
                let until = now + self.cfg.rolling_pause;
                self.engage_if_longer(&mut state, "rolling loss rate".to_string(), until, notifier);
            }
        }

        self.persist(&state).ok();
        Ok(())
    }

    fn engage(
        &self,
        state: &mut CircuitBreakerState,
        reason: String,
        until: DateTime<Utc>,
        notifier: &mut dyn FnMut(NotificationEvent),
    ) {
        let was_paused = state.is_paused;
        state.is_paused = true;
        state.pause_reason = Some(reason.clone());
        state.pause_end_time = Some(until);
        if !was_paused {
            state.total_pause_count += 1;
            notifier(NotificationEvent::PauseEngaged { reason, until });
        }
    }

    /// Only extends the pause when `until` is strictly later than any
    /// pause already in effect, so a shorter tier never shortens a
    /// longer one already active (e.g. the daily-loss-limit pause).
    fn engage_if_longer(
        &self,
        state: &mut CircuitBreakerState,
        reason: String,
        until: DateTime<Utc>,
        notifier: &mut dyn FnMut(NotificationEvent),
    ) {
        let currently_longer = state.is_paused && state.pause_end_time.map(|e| e >= until).unwrap_or(false);
        if currently_longer {
            return;
        }
        self.engage(state, reason, until, notifier);
    }
}

fn next_local_midnight_utc(today: NaiveDate) -> DateTime<Utc> {
    let next_day = today.succ_opt().unwrap_or(today);
    let naive_midnight = next_day.and_hms_opt(0, 0, 0).expect("valid midnight");
    Local
        .from_local_datetime(&naive_midnight)
        .single()
        .unwrap_or_else(|| Local::now())
        .with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn cb_at(dir: &std::path::Path, cfg: ProtectionConfig) -> CircuitBreaker {
        CircuitBreaker::load(dir.join("circuit_breaker_state.json"), cfg).unwrap()
    }

    #[test]
    fn never_trips_with_zero_closed_trades() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(dir.path()).unwrap();
        let cb = cb_at(dir.path(), ProtectionConfig::default());
        let mut events = vec![];
        let decision = cb
            .evaluate_before_open(&ledger, 10_000.0, Utc::now(), &mut |e| events.push(e))
            .unwrap();
        assert_eq!(decision, GateDecision::Allow);
        assert!(events.is_empty());
    }

    #[test]
    fn daily_loss_limit_trips_and_denies() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(dir.path()).unwrap();
        let now = Utc::now();
        for (i, pl) in [-300.0, -500.0, -250.0].into_iter().enumerate() {
            let ticket = i as u64 + 1;
            ledger.log_open(ticket, Side::Buy, now, 100.0, 95.0, 110.0, 0.1, 10_000.0).unwrap();
            ledger.log_close(ticket, 100.0 + pl, now, pl, crate::types::CloseReason::SlHit).unwrap();
        }
        let cb = cb_at(dir.path(), ProtectionConfig::default());
        let mut events = vec![];
        let decision = cb.evaluate_before_open(&ledger, 10_000.0, now, &mut |e| events.push(e)).unwrap();
        assert!(matches!(decision, GateDecision::Deny { .. }));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn consecutive_losses_tier1_pauses_three_hours() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(dir.path()).unwrap();
        let now = Utc::now();
        for i in 0..5u64 {
            ledger.log_open(i + 1, Side::Buy, now, 100.0, 95.0, 110.0, 0.1, 10_000.0).unwrap();
            ledger.log_close(i + 1, 99.0, now, -1.0, crate::types::CloseReason::SlHit).unwrap();
        }
        let cb = cb_at(dir.path(), ProtectionConfig::default());
        let mut events = vec![];
        cb.on_trade_closed(&ledger, now, &mut |e| events.push(e)).unwrap();
        let state = cb.snapshot();
        assert!(state.is_paused);
        assert_eq!(state.pause_reason.as_deref(), Some("consecutive losses tier 1"));
        let remaining = state.pause_end_time.unwrap() - now;
        assert!(remaining <= ChronoDuration::hours(3) && remaining > ChronoDuration::hours(2));
    }

    #[test]
    fn sixth_close_a_win_resets_streak_without_clearing_pause() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(dir.path()).unwrap();
        let now = Utc::now();
        for i in 0..5u64 {
            ledger.log_open(i + 1, Side::Buy, now, 100.0, 95.0, 110.0, 0.1, 10_000.0).unwrap();
            ledger.log_close(i + 1, 99.0, now, -1.0, crate::types::CloseReason::SlHit).unwrap();
        }
        let cb = cb_at(dir.path(), ProtectionConfig::default());
        let mut events = vec![];
        cb.on_trade_closed(&ledger, now, &mut |e| events.push(e)).unwrap();
        let pause_end_before = cb.snapshot().pause_end_time.unwrap();

        ledger.log_open(6, Side::Buy, now, 100.0, 95.0, 110.0, 0.1, 10_000.0).unwrap();
        ledger.log_close(6, 110.0, now, 10.0, crate::types::CloseReason::TpHit).unwrap();
        cb.on_trade_closed(&ledger, now, &mut |e| events.push(e)).unwrap();

        let state = cb.snapshot();
        assert_eq!(state.consecutive_losses, 0);
        // remaining pause window is not shortened by the win
        assert_eq!(state.pause_end_time.unwrap(), pause_end_before);
    }
}
