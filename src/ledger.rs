//! Trade Ledger.
//!
//! Append-only, one JSON file per local calendar date under
//! `<logs_dir>/trade_logs/trades_YYYY_MM_DD.json`. Every write is
//! durable (fsync'd) before the call returns, and rewritten atomically
//! via temp-file + rename.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, Utc};
use parking_lot::Mutex;

use crate::error::LedgerError;
use crate::types::{CloseReason, Side, TradeRecord, TradeStatusWire};

#[derive(Debug, Clone, Default)]
pub struct DailyAggregate {
    pub total_realized_pl: f64,
    pub trade_count: usize,
    pub consecutive_losses_from_end: u32,
    /// Most recent results first: `true` = loss (realized_pl < 0).
    pub last_n_results: Vec<bool>,
}

pub struct TradeLedger {
    dir: PathBuf,
    /// ticket -> date opened, so `log_close` can find the file without
    /// scanning every date. Rebuilt at startup from whatever is on disk.
    open_index: Mutex<HashMap<u64, NaiveDate>>,
}

impl TradeLedger {
    pub fn new(logs_dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let dir = logs_dir.as_ref().join("trade_logs");
        std::fs::create_dir_all(&dir)?;
        let ledger = TradeLedger { dir, open_index: Mutex::new(HashMap::new()) };
        ledger.rebuild_open_index()?;
        Ok(ledger)
    }

    fn rebuild_open_index(&self) -> Result<(), LedgerError> {
        let mut index = self.open_index.lock();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(date) = Self::date_from_path(&path) else { continue };
            for record in self.read_records(date)? {
                if record.status == TradeStatusWire::Open {
                    index.insert(record.ticket, date);
                }
            }
        }
        Ok(())
    }

    fn date_from_path(path: &Path) -> Option<NaiveDate> {
        let stem = path.file_stem()?.to_str()?;
        let digits = stem.strip_prefix("trades_")?;
        NaiveDate::parse_from_str(digits, "%Y_%m_%d").ok()
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("trades_{}.json", date.format("%Y_%m_%d")))
    }

    fn read_records(&self, date: NaiveDate) -> Result<Vec<TradeRecord>, LedgerError> {
        let path = self.path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|e| LedgerError::Corrupt(format!("{}: {e}", path.display())))
    }

    /// Atomic rewrite: write to a sibling temp file, fsync, then rename.
    fn write_records(&self, date: NaiveDate, records: &[TradeRecord]) -> Result<(), LedgerError> {
        let path = self.path_for(date);
        let tmp_path = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(records)
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;

        let mut file = File::create(&tmp_path)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// today() is derived from the local clock; `Local` mirrors the
    /// EA's wall-clock timestamps used throughout the wire protocol.
    pub fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    pub fn log_open(
        &self,
        ticket: u64,
        side: Side,
        entry_time: DateTime<Utc>,
        entry_price: f64,
        sl: f64,
        tp: f64,
        volume: f64,
        account_balance_at_entry: f64,
    ) -> Result<(), LedgerError> {
        let date = entry_time.with_timezone(&Local).date_naive();
        let mut records = self.read_records(date)?;
        records.push(TradeRecord {
            ticket,
            entry_time: entry_time.timestamp(),
            side,
            entry_price,
            sl,
            tp,
            volume,
            account_balance_at_entry,
            status: TradeStatusWire::Open,
            exit_price: None,
            exit_time: None,
            realized_pl: None,
            close_reason: None,
        });
        self.write_records(date, &records)?;
        self.open_index.lock().insert(ticket, date);
        log::info!("ledger: opened ticket {ticket} on {date} at {entry_price:.5}");
        Ok(())
    }

    /// Idempotent on ticket: a second call with the same ticket after the
    /// record is already CLOSED is a no-op.
    pub fn log_close(
        &self,
        ticket: u64,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        realized_pl: f64,
        reason: CloseReason,
    ) -> Result<(), LedgerError> {
        let date = match self.open_index.lock().get(&ticket).copied() {
            Some(d) => d,
            None => exit_time.with_timezone(&Local).date_naive(),
        };
        let mut records = self.read_records(date)?;
        let Some(rec) = records.iter_mut().find(|r| r.ticket == ticket) else {
            return Err(LedgerError::NotFound(ticket));
        };
        if rec.status == TradeStatusWire::Closed {
            return Ok(());
        }
        rec.status = TradeStatusWire::Closed;
        rec.exit_price = Some(exit_price);
        rec.exit_time = Some(exit_time.timestamp());
        rec.realized_pl = Some(realized_pl);
        rec.close_reason = Some(reason.as_str().to_string());
        self.write_records(date, &records)?;
        self.open_index.lock().remove(&ticket);
        log::info!("ledger: closed ticket {ticket} on {date} pnl={realized_pl:.2} reason={}", reason.as_str());
        Ok(())
    }

    pub fn daily_aggregate(&self, date: NaiveDate) -> Result<DailyAggregate, LedgerError> {
        let records = self.read_records(date)?;
        let mut closed: Vec<&TradeRecord> = records
            .iter()
            .filter(|r| r.status == TradeStatusWire::Closed)
            .collect();
        closed.sort_by_key(|r| r.exit_time.unwrap_or(r.entry_time));

        let total_realized_pl = closed.iter().filter_map(|r| r.realized_pl).sum();

        let mut consecutive_losses_from_end = 0u32;
        for r in closed.iter().rev() {
            match r.realized_pl {
                Some(pl) if pl < 0.0 => consecutive_losses_from_end += 1,
                _ => break,
            }
        }

        let last_n_results: Vec<bool> = closed
            .iter()
            .rev()
            .take(10)
            .map(|r| r.realized_pl.unwrap_or(0.0) < 0.0)
            .collect();

        Ok(DailyAggregate {
            total_realized_pl,
            trade_count: records.len(),
            consecutive_losses_from_end,
            last_n_results,
        })
    }

    pub fn first_trade_balance(&self, date: NaiveDate) -> Result<Option<f64>, LedgerError> {
        let records = self.read_records(date)?;
        Ok(records
            .iter()
            .min_by_key(|r| r.entry_time)
            .map(|r| r.account_balance_at_entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ledger() -> (TradeLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (TradeLedger::new(dir.path()).unwrap(), dir)
    }

    fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn open_then_close_roundtrips_and_aggregates() {
        let (ledger, _dir) = ledger();
        let t = ts(2026, 7, 28, 10);
        ledger.log_open(1, Side::Buy, t, 2223.57, 2195.23, 2280.25, 0.03, 10_000.0).unwrap();
        ledger.log_close(1, 2250.0, ts(2026, 7, 28, 12), 79.29, CloseReason::SarReversal).unwrap();

        let date = t.with_timezone(&Local).date_naive();
        let agg = ledger.daily_aggregate(date).unwrap();
        assert_eq!(agg.trade_count, 1);
        assert!((agg.total_realized_pl - 79.29).abs() < 1e-6);
        assert_eq!(agg.consecutive_losses_from_end, 0);
    }

    #[test]
    fn zero_closed_trades_never_trips_aggregate() {
        let (ledger, _dir) = ledger();
        let date = TradeLedger::today();
        let agg = ledger.daily_aggregate(date).unwrap();
        assert_eq!(agg.total_realized_pl, 0.0);
        assert_eq!(agg.trade_count, 0);
    }

    #[test]
    fn log_close_is_idempotent() {
        let (ledger, _dir) = ledger();
        let t = ts(2026, 7, 28, 9);
        ledger.log_open(5, Side::Sell, t, 100.0, 105.0, 90.0, 1.0, 5_000.0).unwrap();
        ledger.log_close(5, 95.0, ts(2026, 7, 28, 11), 5.0, CloseReason::TpHit).unwrap();
        // second call is a no-op, not an error
        ledger.log_close(5, 95.0, ts(2026, 7, 28, 11), 5.0, CloseReason::TpHit).unwrap();
        let agg = ledger.daily_aggregate(t.with_timezone(&Local).date_naive()).unwrap();
        assert!((agg.total_realized_pl - 5.0).abs() < 1e-6);
    }

    #[test]
    fn consecutive_losses_counts_from_end() {
        let (ledger, _dir) = ledger();
        let t = ts(2026, 7, 28, 8);
        for (i, pl) in [10.0, -5.0, -7.0, -3.0].into_iter().enumerate() {
            let ticket = i as u64 + 1;
            ledger.log_open(ticket, Side::Buy, t, 100.0, 95.0, 110.0, 0.1, 10_000.0).unwrap();
            ledger
                .log_close(ticket, 100.0 + pl, ts(2026, 7, 28, 9 + i as u32), pl, CloseReason::SlHit)
                .unwrap();
        }
        let agg = ledger.daily_aggregate(t.with_timezone(&Local).date_naive()).unwrap();
        assert_eq!(agg.consecutive_losses_from_end, 3);
    }

    #[test]
    fn first_trade_balance_is_earliest_entry() {
        let (ledger, _dir) = ledger();
        let t = ts(2026, 7, 28, 6);
        ledger.log_open(1, Side::Buy, t, 100.0, 95.0, 110.0, 0.1, 9_900.0).unwrap();
        ledger.log_open(2, Side::Buy, ts(2026, 7, 28, 7), 101.0, 96.0, 111.0, 0.1, 9_950.0).unwrap();
        let balance = ledger.first_trade_balance(t.with_timezone(&Local).date_naive()).unwrap();
        assert_eq!(balance, Some(9_900.0));
    }
}
