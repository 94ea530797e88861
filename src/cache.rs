//! Market-Data Cache.
//!
//! Single-writer-from-bridge-thread, many-readers. Each field gets its
//! own lock — writers are single-threaded, so per-field locking is
//! sufficient — using `parking_lot::Mutex` since this is the crate's
//! hottest shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::types::{AccountSnapshot, Bar, Position, Tick};

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[derive(Clone, Default)]
pub struct MarketDataCache {
    latest_tick: Arc<Mutex<Option<Tick>>>,
    latest_account: Arc<Mutex<Option<AccountSnapshot>>>,
    positions_by_ticket: Arc<Mutex<HashMap<u64, Position>>>,
    /// Last time each ticket was refreshed by an inbound `position` push.
    /// A ticket that stops being refreshed while still present in
    /// `positions_by_ticket` means the EA has stopped reporting it — the
    /// broker closed it (TP/SL hit) without a bot-initiated CLOSE.
    position_seen_at: Arc<Mutex<HashMap<u64, i64>>>,
    bars_by_timeframe: Arc<Mutex<HashMap<(String, String), Vec<Bar>>>>,
    /// The symbol alias the EA actually reports, once resolved from
    /// `symbols.priority_list`. Locked in on the first matching tick for
    /// the life of the process so a broker that echoes a slightly
    /// different alias mid-session (e.g. a swap from "XAUUSD" to
    /// "XAUUSD.m") doesn't cause the bridge to silently track two symbols.
    resolved_symbol: Arc<Mutex<Option<String>>>,
}

impl MarketDataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_tick(&self, mut tick: Tick) {
        tick.received_at = now_secs();
        *self.latest_tick.lock() = Some(tick);
    }

    pub fn update_account(&self, mut account: AccountSnapshot) {
        account.received_at = now_secs();
        *self.latest_account.lock() = Some(account);
    }

    pub fn latest_tick(&self) -> Option<Tick> {
        self.latest_tick.lock().clone()
    }

    pub fn latest_account(&self) -> Option<AccountSnapshot> {
        self.latest_account.lock().clone()
    }

    /// Rejects a stale tick so the Trading Loop can defer decisions.
    pub fn tick_fresh_within(&self, ttl: Duration) -> bool {
        match self.latest_tick.lock().as_ref() {
            Some(t) => now_secs() - t.received_at <= ttl.as_secs() as i64,
            None => false,
        }
    }

    pub fn account_fresh_within(&self, ttl: Duration) -> bool {
        match self.latest_account.lock().as_ref() {
            Some(a) => now_secs() - a.received_at <= ttl.as_secs() as i64,
            None => false,
        }
    }

    pub fn upsert_position(&self, position: Position) {
        let ticket = position.ticket;
        self.positions_by_ticket.lock().insert(ticket, position);
        self.position_seen_at.lock().insert(ticket, now_secs());
    }

    pub fn remove_position(&self, ticket: u64) -> Option<Position> {
        self.position_seen_at.lock().remove(&ticket);
        self.positions_by_ticket.lock().remove(&ticket)
    }

    /// `false` once a ticket has gone longer than `ttl` without a fresh
    /// `position` push, even though it is still present in the map —
    /// the signal the Position Monitor uses to infer a broker-side close.
    pub fn position_seen_within(&self, ticket: u64, ttl: Duration) -> bool {
        match self.position_seen_at.lock().get(&ticket) {
            Some(&seen) => now_secs() - seen <= ttl.as_secs() as i64,
            None => false,
        }
    }

    pub fn position(&self, ticket: u64) -> Option<Position> {
        self.positions_by_ticket.lock().get(&ticket).cloned()
    }

    pub fn has_position(&self, ticket: u64) -> bool {
        self.positions_by_ticket.lock().contains_key(&ticket)
    }

    pub fn store_bars(&self, symbol: &str, timeframe: &str, bars: Vec<Bar>) {
        self.bars_by_timeframe
            .lock()
            .insert((symbol.to_string(), timeframe.to_string()), bars);
    }

    pub fn bars(&self, symbol: &str, timeframe: &str) -> Option<Vec<Bar>> {
        self.bars_by_timeframe
            .lock()
            .get(&(symbol.to_string(), timeframe.to_string()))
            .cloned()
    }

    /// Resolves the tracked symbol against `aliases` (tried in the
    /// configured priority order). The first incoming symbol that matches
    /// any alias locks in the tracked symbol for the rest of the process;
    /// once resolved, only ticks reporting that same symbol are accepted.
    /// Returns `None` when `candidate` matches no configured alias, or
    /// matches a different symbol than the one already resolved.
    pub fn resolve_symbol(&self, candidate: &str, aliases: &[String]) -> Option<String> {
        let mut resolved = self.resolved_symbol.lock();
        if let Some(sym) = resolved.as_ref() {
            return if sym.eq_ignore_ascii_case(candidate) { Some(sym.clone()) } else { None };
        }
        let matched = aliases.iter().find(|a| a.eq_ignore_ascii_case(candidate))?;
        *resolved = Some(matched.clone());
        Some(matched.clone())
    }

    pub fn resolved_symbol(&self) -> Option<String> {
        self.resolved_symbol.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            bid: 2223.50,
            ask: 2223.57,
            spread: 7,
            time: "2026-07-28 10:00:00".to_string(),
            point: 0.01,
            digits: 2,
            contract_size: 100.0,
            min_lot: 0.01,
            max_lot: 100.0,
            lot_step: 0.01,
            received_at: 0,
        }
    }

    #[test]
    fn fresh_tick_is_fresh_immediately() {
        let cache = MarketDataCache::new();
        cache.update_tick(tick("XAUUSD"));
        assert!(cache.tick_fresh_within(Duration::from_secs(10)));
    }

    #[test]
    fn no_tick_ever_is_never_fresh() {
        let cache = MarketDataCache::new();
        assert!(!cache.tick_fresh_within(Duration::from_secs(10)));
    }

    #[test]
    fn positions_upsert_and_remove() {
        let cache = MarketDataCache::new();
        let p = Position {
            ticket: 1,
            symbol: "XAUUSD".into(),
            side: crate::types::Side::Buy,
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
        cache.upsert_position(p);
        assert!(cache.has_position(1));
        cache.remove_position(1);
        assert!(!cache.has_position(1));
    }

    #[test]
    fn resolve_symbol_locks_in_first_match_and_rejects_others() {
        let cache = MarketDataCache::new();
        let aliases = vec!["XAUUSD".to_string(), "GOLD".to_string(), "XAUUSD.m".to_string()];

        assert_eq!(cache.resolve_symbol("GOLD", &aliases), Some("GOLD".to_string()));
        assert_eq!(cache.resolved_symbol(), Some("GOLD".to_string()));

        // A different, still-configured alias no longer matches once locked in.
        assert_eq!(cache.resolve_symbol("XAUUSD", &aliases), None);
        // The same resolved symbol keeps matching.
        assert_eq!(cache.resolve_symbol("GOLD", &aliases), Some("GOLD".to_string()));
    }

    #[test]
    fn resolve_symbol_rejects_unconfigured_alias() {
        let cache = MarketDataCache::new();
        let aliases = vec!["XAUUSD".to_string()];
        assert_eq!(cache.resolve_symbol("EURUSD", &aliases), None);
        assert_eq!(cache.resolved_symbol(), None);
    }

    #[test]
    fn position_seen_within_is_fresh_right_after_upsert_and_false_once_removed() {
        let cache = MarketDataCache::new();
        let p = Position {
            ticket: 9,
            symbol: "XAUUSD".into(),
            side: crate::types::Side::Buy,
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
        cache.upsert_position(p);
        assert!(cache.position_seen_within(9, Duration::from_secs(10)));
        cache.remove_position(9);
        assert!(!cache.position_seen_within(9, Duration::from_secs(10)));
    }
}
