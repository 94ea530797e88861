//! Trading Loop.
//!
//! A single explicit state machine, `step()`-driven so it is callable
//! from a test harness without a live bridge connection. At most one
//! position is tracked at a time, so the Position Monitor folds into
//! the `Monitoring` state here rather than running as a separate
//! worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::bridge::BridgeServer;
use crate::cache::MarketDataCache;
use crate::circuit_breaker::{CircuitBreaker, GateDecision};
use crate::error::ExecutorError;
use crate::executor::OrderExecutor;
use crate::ledger::TradeLedger;
use crate::monitor::{self, MonitorConfig};
use crate::risk::{self, LotParams};
use crate::sar;
use crate::types::{CloseReason, DesiredSignal, NotificationEvent, OpenOrderRequest, Position, Side, Trend};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoopState {
    WaitingForSignal,
    Monitoring { ticket: u64 },
}

#[derive(Debug, Clone)]
pub struct TradingLoopConfig {
    pub symbol: String,
    pub timeframe: String,
    pub sar_acceleration: f64,
    pub sar_maximum: f64,
    pub risk_percentage: f64,
    pub desired_signal: DesiredSignal,
    pub tick_max_age: Duration,
    pub account_max_age: Duration,
    /// How long a ticket may go without a fresh `position` push before the
    /// monitor assumes the broker closed it out from under us (TP/SL hit).
    pub position_stale_after: Duration,
    pub monitor: MonitorConfig,
    /// When set, signals are logged but no BUY/SELL/CLOSE is ever sent.
    pub dry_run: bool,
}

pub struct TradingLoop {
    cache: MarketDataCache,
    bridge: Arc<BridgeServer>,
    ledger: Arc<TradeLedger>,
    circuit_breaker: Arc<CircuitBreaker>,
    notifier: tokio::sync::mpsc::Sender<NotificationEvent>,
    cfg: TradingLoopConfig,
    state: LoopState,
}

impl TradingLoop {
    pub fn new(
        cache: MarketDataCache,
        bridge: Arc<BridgeServer>,
        ledger: Arc<TradeLedger>,
        circuit_breaker: Arc<CircuitBreaker>,
        notifier: tokio::sync::mpsc::Sender<NotificationEvent>,
        cfg: TradingLoopConfig,
    ) -> Self {
        TradingLoop { cache, bridge, ledger, circuit_breaker, notifier, cfg, state: LoopState::WaitingForSignal }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn notify(&self, event: NotificationEvent) {
        let _ = self.notifier.try_send(event);
    }

    /// Runs one decision cycle. Errors are non-fatal by design: they are
    /// logged and the loop stays in its current state for the next tick
    /// (the caller drives the cadence via `tokio::time::interval`).
    pub async fn step(&mut self) {
        match self.state {
            LoopState::WaitingForSignal => self.step_waiting().await,
            LoopState::Monitoring { ticket } => self.step_monitoring(ticket).await,
        }
    }

    /// Closes the position being monitored, if any, as part of process
    /// shutdown — routed through the same ledger/circuit-breaker/notify
    /// accounting as a normal close rather than a bare executor call, so a
    /// clean shutdown still leaves an accurate ledger record. Returns
    /// `true` if a position required manual intervention (closed with no
    /// open position, or the EA never confirmed within `grace`).
    pub async fn shutdown_close(&mut self, grace: Duration) -> bool {
        let LoopState::Monitoring { ticket } = self.state else { return false };
        let Some(position) = self.cache.position(ticket) else { return false };
        let Some(dispatcher) = self.bridge.dispatcher() else { return false };

        let executor = OrderExecutor::new(&dispatcher);
        match tokio::time::timeout(grace, self.close_position(&position, CloseReason::Manual, &executor)).await {
            Ok(()) => matches!(self.state, LoopState::Monitoring { .. }),
            Err(_) => {
                log::error!("trading_loop: ticket {ticket} did not confirm close within shutdown grace period, REQUIRES_MANUAL");
                self.notify(NotificationEvent::RiskAlert {
                    message: format!("ticket {ticket} requires manual close (shutdown grace period exceeded)"),
                });
                self.cache.upsert_position({
                    let mut p = position.clone();
                    p.status = crate::types::PositionStatus::RequiresManual;
                    p
                });
                true
            }
        }
    }

    /// Pulls the latest bar window over the bridge and stores it in the
    /// cache. Run on its own cadence, independent of `step()`'s decision
    /// cadence.
    pub async fn refresh_bars(&self, count: u32) {
        let Some(dispatcher) = self.bridge.dispatcher() else { return };
        let command = crate::bridge::protocol::OutboundCommand::GetRates {
            count,
            timeframe: self.cfg.timeframe.clone(),
        };
        match dispatcher.send_and_await(command, None).await {
            Ok(crate::bridge::protocol::InboundMessage::Rates { data }) => {
                let bars: Vec<crate::types::Bar> = data
                    .into_iter()
                    .map(|r| crate::types::Bar { time: r.time, open: r.open, high: r.high, low: r.low, close: r.close, volume: r.volume })
                    .collect();
                self.cache.store_bars(&self.cfg.symbol, &self.cfg.timeframe, bars);
            }
            Ok(_) => log::warn!("trading_loop: unexpected reply to GET_RATES"),
            Err(e) => log::debug!("trading_loop: GET_RATES failed: {e}"),
        }
    }

    async fn step_waiting(&mut self) {
        let Some(tick) = self.cache.latest_tick() else { return };
        let Some(account) = self.cache.latest_account() else { return };
        if !self.cache.tick_fresh_within(self.cfg.tick_max_age) || !self.cache.account_fresh_within(self.cfg.account_max_age) {
            log::debug!("trading_loop: stale market data, holding");
            return;
        }

        let decision = self.circuit_breaker.evaluate_before_open(
            &self.ledger,
            account.balance,
            Utc::now(),
            &mut |e| self.notify(e),
        );
        let decision = match decision {
            Ok(d) => d,
            Err(e) => {
                log::error!("trading_loop: circuit breaker evaluation failed: {e}");
                return;
            }
        };
        if let GateDecision::Deny { reason } = decision {
            log::debug!("trading_loop: circuit breaker denies open: {reason}");
            return;
        }

        let Some(bars) = self.cache.bars(&self.cfg.symbol, &self.cfg.timeframe) else { return };
        let sar_state = match sar::compute(&bars, self.cfg.sar_acceleration, self.cfg.sar_maximum) {
            Ok(s) => s,
            Err(e) => {
                log::debug!("trading_loop: {e}");
                return;
            }
        };

        if !sar_state.flipped_at_last_bar {
            return;
        }

        let Some(side) = desired_side_for_trend(sar_state.trend, self.cfg.desired_signal) else {
            return;
        };

        let entry = match side {
            Side::Buy => tick.ask,
            Side::Sell => tick.bid,
        };
        let sl = sar_state.sar;

        let tp = match risk::derive_take_profit(side, entry, sl) {
            Ok(tp) => tp,
            Err(e) => {
                log::warn!("trading_loop: invalid stop-loss from SAR, skipping signal: {e}");
                return;
            }
        };

        let lot_params = LotParams {
            contract_size: tick.contract_size,
            min_lot: tick.min_lot,
            max_lot: tick.max_lot,
            lot_step: tick.lot_step,
        };
        let volume = match risk::calculate_lot_size(account.balance, self.cfg.risk_percentage, entry, sl, &lot_params) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("trading_loop: {e}");
                self.notify(NotificationEvent::RiskAlert { message: e.to_string() });
                return;
            }
        };

        if let Err(e) = risk::check_margin(volume, entry, tick.contract_size, account.leverage, account.free_margin) {
            log::warn!("trading_loop: {e}");
            self.notify(NotificationEvent::RiskAlert { message: e.to_string() });
            return;
        }

        if self.cfg.dry_run {
            log::info!("trading_loop: dry-run would open {side:?} {volume} lots @ {entry:.5} sl={sl:.5} tp={tp:.5}");
            return;
        }

        let Some(dispatcher) = self.bridge.dispatcher() else {
            log::debug!("trading_loop: no EA connection, holding signal");
            return;
        };
        let request = OpenOrderRequest { side, volume, sl, tp, comment: Some("sar_bridge".to_string()) };
        let executor = OrderExecutor::new(&dispatcher);
        match executor.open(&request).await {
            Ok(fill) => {
                if let Err(e) = self.ledger.log_open(fill.ticket, side, Utc::now(), fill.fill_price, sl, tp, volume, account.balance) {
                    log::error!("trading_loop: ledger write failed after open: {e}");
                }
                self.cache.upsert_position(Position {
                    ticket: fill.ticket,
                    symbol: self.cfg.symbol.clone(),
                    side,
                    volume,
                    open_price: fill.fill_price,
                    current_price: fill.fill_price,
                    sl,
                    tp,
                    contract_size: tick.contract_size,
                    unrealized_pl: 0.0,
                    open_time: Utc::now().timestamp(),
                    comment: request.comment.clone(),
                    status: crate::types::PositionStatus::Open,
                });
                self.notify(NotificationEvent::TradeOpened { symbol: self.cfg.symbol.clone(), side, volume, entry: fill.fill_price, sl, tp });
                self.state = LoopState::Monitoring { ticket: fill.ticket };
            }
            Err(e) => {
                log::warn!("trading_loop: open failed: {e}");
            }
        }
    }

    async fn step_monitoring(&mut self, ticket: u64) {
        let Some(position) = self.cache.position(ticket) else {
            // The EA no longer reports this ticket at all: its own TP/SL fired.
            self.reconcile_externally_closed_position(ticket, None).await;
            return;
        };
        if !self.cache.position_seen_within(ticket, self.cfg.position_stale_after) {
            // Still present in the cache, but no fresh push in a while: the
            // broker closed it and nothing is going to refresh this entry
            // again, so reconcile from the last-known state instead of
            // waiting on a `position` push that will never arrive.
            self.reconcile_externally_closed_position(ticket, Some(position)).await;
            return;
        }

        let Some(tick) = self.cache.latest_tick() else { return };
        let Some(bars) = self.cache.bars(&self.cfg.symbol, &self.cfg.timeframe) else { return };
        let sar_state = match sar::compute(&bars, self.cfg.sar_acceleration, self.cfg.sar_maximum) {
            Ok(s) => s,
            Err(e) => {
                log::debug!("trading_loop: {e}");
                return;
            }
        };

        let action = monitor::evaluate(&position, &sar_state, &tick, &self.cfg.monitor);
        let Some(dispatcher) = self.bridge.dispatcher() else {
            log::debug!("trading_loop: no EA connection, deferring monitor action");
            return;
        };
        let executor = OrderExecutor::new(&dispatcher);

        match action {
            monitor::MonitorAction::Hold => {}
            monitor::MonitorAction::TrailStopTo(new_sl) => {
                if self.cfg.dry_run {
                    log::info!("trading_loop: dry-run would trail ticket {ticket} to sl={new_sl:.5}");
                    return;
                }
                match executor.modify(ticket, new_sl, position.tp).await {
                    Ok(()) => {
                        let mut updated = position;
                        updated.apply_new_sl(new_sl);
                        self.cache.upsert_position(updated);
                    }
                    Err(e) => log::warn!("trading_loop: trail failed: {e}"),
                }
            }
            monitor::MonitorAction::Close(reason) => {
                if self.cfg.dry_run {
                    log::info!("trading_loop: dry-run would close ticket {ticket} reason={}", reason.as_str());
                    return;
                }
                self.close_position(&position, reason, &executor).await;
            }
        }
    }

    /// The CLOSE ack carries no price (it's the generic `response`, not an
    /// `order_result`), so the exit price is marked off the latest tick the
    /// same way the monitor marks adverse excursion — bid for a BUY, ask for
    /// a SELL — falling back to the position's last-known price if no tick
    /// has arrived since.
    async fn close_position(&mut self, position: &Position, reason: CloseReason, executor: &OrderExecutor<'_>) {
        match executor.close(position.ticket).await {
            Ok(()) => {
                let exit_price = self
                    .cache
                    .latest_tick()
                    .map(|tick| monitor::marked_price(position.side, &tick))
                    .unwrap_or(position.current_price);
                let pnl = realized_pnl(position, exit_price);
                if let Err(e) = self.ledger.log_close(position.ticket, exit_price, Utc::now(), pnl, reason) {
                    log::error!("trading_loop: ledger write failed after close: {e}");
                }
                self.cache.remove_position(position.ticket);
                self.notify(NotificationEvent::TradeClosed {
                    symbol: position.symbol.clone(),
                    side: position.side,
                    entry: position.open_price,
                    exit: exit_price,
                    pnl,
                    reason,
                });
                if let Err(e) = self.circuit_breaker.on_trade_closed(&self.ledger, Utc::now(), &mut |e| self.notify(e)) {
                    log::error!("trading_loop: circuit breaker update failed: {e}");
                }
                self.state = LoopState::WaitingForSignal;
            }
            Err(ExecutorError::CloseFailed { ticket }) => {
                log::error!("trading_loop: ticket {ticket} REQUIRES_MANUAL, leaving Trading Loop halted on this position");
                self.notify(NotificationEvent::RiskAlert { message: format!("ticket {ticket} requires manual close") });
                self.cache.upsert_position({
                    let mut p = position.clone();
                    p.status = crate::types::PositionStatus::RequiresManual;
                    p
                });
            }
            Err(e) => log::warn!("trading_loop: close attempt errored: {e}"),
        }
    }

    /// The EA's `position` pushes are the only signal that a position is
    /// still open; once a ticket stops being refreshed, the broker has
    /// already closed it (TP/SL hit) with no CLOSE command from us. There
    /// is nothing left to command, only to reconcile: the close reason is
    /// inferred from the last-known price against SL/TP (nearer to TP ⇒
    /// TP_HIT, nearer to SL ⇒ SL_HIT) and the exit price is that same
    /// last-known price, since the broker's own fill price is never
    /// reported back to us for an unsolicited close.
    async fn reconcile_externally_closed_position(&mut self, ticket: u64, last_known: Option<Position>) {
        let Some(position) = last_known else {
            log::warn!("trading_loop: ticket {ticket} vanished with no last-known state, cannot reconcile");
            self.notify(NotificationEvent::RiskAlert {
                message: format!("ticket {ticket} closed by broker with no last-known state; ledger record left OPEN pending manual reconciliation"),
            });
            self.state = LoopState::WaitingForSignal;
            return;
        };

        let dist_to_tp = (position.current_price - position.tp).abs();
        let dist_to_sl = (position.current_price - position.sl).abs();
        let reason = if dist_to_tp <= dist_to_sl { CloseReason::TpHit } else { CloseReason::SlHit };
        let exit_price = position.current_price;
        let pnl = realized_pnl(&position, exit_price);

        log::warn!(
            "trading_loop: ticket {ticket} no longer reported by EA; inferring broker-side close reason={} exit={exit_price:.5}",
            reason.as_str()
        );
        if let Err(e) = self.ledger.log_close(position.ticket, exit_price, Utc::now(), pnl, reason) {
            log::error!("trading_loop: ledger write failed after broker-side close: {e}");
        }
        self.cache.remove_position(ticket);
        self.notify(NotificationEvent::TradeClosed {
            symbol: position.symbol.clone(),
            side: position.side,
            entry: position.open_price,
            exit: exit_price,
            pnl,
            reason,
        });
        if let Err(e) = self.circuit_breaker.on_trade_closed(&self.ledger, Utc::now(), &mut |e| self.notify(e)) {
            log::error!("trading_loop: circuit breaker update failed: {e}");
        }
        self.state = LoopState::WaitingForSignal;
    }
}

fn desired_side_for_trend(trend: Trend, desired: DesiredSignal) -> Option<Side> {
    match (trend, desired) {
        (Trend::Uptrend, DesiredSignal::Buy | DesiredSignal::Both) => Some(Side::Buy),
        (Trend::Downtrend, DesiredSignal::Sell | DesiredSignal::Both) => Some(Side::Sell),
        _ => None,
    }
}

fn realized_pnl(position: &Position, exit_price: f64) -> f64 {
    let direction = match position.side {
        Side::Buy => 1.0,
        Side::Sell => -1.0,
    };
    direction * (exit_price - position.open_price) * position.volume * position.contract_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_side_filters_by_config() {
        assert_eq!(desired_side_for_trend(Trend::Uptrend, DesiredSignal::Sell), None);
        assert_eq!(desired_side_for_trend(Trend::Uptrend, DesiredSignal::Buy), Some(Side::Buy));
        assert_eq!(desired_side_for_trend(Trend::Downtrend, DesiredSignal::Both), Some(Side::Sell));
    }

    #[test]
    fn realized_pnl_is_positive_for_winning_buy() {
        let pos = Position {
            ticket: 1,
            symbol: "XAUUSD".into(),
            side: Side::Buy,
            volume: 0.03,
            open_price: 2223.57,
            current_price: 2223.57,
            sl: 2195.23,
            tp: 2280.25,
            contract_size: 100.0,
            unrealized_pl: 0.0,
            open_time: 0,
            comment: None,
            status: crate::types::PositionStatus::Open,
        };
        let pnl = realized_pnl(&pos, 2250.0);
        assert!(pnl > 0.0);
    }

    fn test_config() -> TradingLoopConfig {
        TradingLoopConfig {
            symbol: "XAUUSD".to_string(),
            timeframe: "M15".to_string(),
            sar_acceleration: sar::DEFAULT_ACCELERATION,
            sar_maximum: sar::DEFAULT_MAXIMUM,
            risk_percentage: 1.0,
            desired_signal: DesiredSignal::Both,
            tick_max_age: Duration::from_secs(30),
            account_max_age: Duration::from_secs(30),
            position_stale_after: Duration::from_millis(20),
            monitor: MonitorConfig::default(),
            dry_run: false,
        }
    }

    /// A ticket that stops being refreshed by `position` pushes, while
    /// still sitting in the cache, must be reconciled as a broker-side
    /// close: TP/SL_HIT inferred from the last-known price, ledger
    /// CLOSED, circuit breaker updated, state back to WAITING_FOR_SIGNAL —
    /// with no live bridge connection required to get there.
    #[tokio::test]
    async fn stale_position_is_reconciled_as_broker_side_tp_hit() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(crate::ledger::TradeLedger::new(dir.path()).unwrap());
        let circuit_breaker = Arc::new(
            crate::circuit_breaker::CircuitBreaker::load(
                dir.path().join("circuit_breaker_state.json"),
                crate::circuit_breaker::ProtectionConfig::default(),
            )
            .unwrap(),
        );
        let cache = crate::cache::MarketDataCache::new();
        let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move { while notify_rx.recv().await.is_some() {} });
        let bridge = crate::bridge::BridgeServer::new(cache.clone(), notify_tx.clone());

        let ticket = 55u64;
        ledger
            .log_open(ticket, Side::Buy, Utc::now(), 2223.57, 2195.23, 2280.25, 0.03, 10_000.0)
            .unwrap();
        cache.upsert_position(Position {
            ticket,
            symbol: "XAUUSD".into(),
            side: Side::Buy,
            volume: 0.03,
            open_price: 2223.57,
            // Parked one point off TP and far from SL: must infer TP_HIT.
            current_price: 2280.20,
            sl: 2195.23,
            tp: 2280.25,
            contract_size: 100.0,
            unrealized_pl: 0.0,
            open_time: 0,
            comment: None,
            status: crate::types::PositionStatus::Open,
        });

        let mut trading_loop =
            TradingLoop::new(cache.clone(), bridge, ledger.clone(), circuit_breaker, notify_tx, test_config());
        trading_loop.state = LoopState::Monitoring { ticket };

        tokio::time::sleep(Duration::from_millis(30)).await;
        trading_loop.step().await;

        assert_eq!(trading_loop.state(), LoopState::WaitingForSignal);
        assert!(!cache.has_position(ticket));

        let agg = ledger.daily_aggregate(crate::ledger::TradeLedger::today()).unwrap();
        assert_eq!(agg.trade_count, 1);
        let expected_pnl = (2280.20 - 2223.57) * 0.03 * 100.0;
        assert!((agg.total_realized_pl - expected_pnl).abs() < 1e-6);
    }
}
