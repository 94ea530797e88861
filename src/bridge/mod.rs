//! Bridge Server.
//!
//! TCP listen on a configured host:port. At most one EA connection at a
//! time; a new connection supersedes a stale one. Newline-framed JSON,
//! heartbeat-monitored, feeding the Market-Data Cache and correlating
//! outgoing commands with their replies.

pub mod dispatcher;
pub mod framing;
pub mod protocol;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::cache::MarketDataCache;
use crate::types::{AccountSnapshot, ConnectionState, NotificationEvent, Position, Side, Tick};

use dispatcher::{route_reply, Dispatcher};
use framing::{FrameOutcome, FrameReader, FrameWriter};
use protocol::InboundMessage;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_TIMEOUT_MULTIPLIER: u32 = 3;

pub struct BridgeServer {
    cache: MarketDataCache,
    notifier: mpsc::Sender<NotificationEvent>,
    state: SyncMutex<ConnectionState>,
    dispatcher: SyncMutex<Option<Dispatcher>>,
    active_connection: AsyncMutex<Option<JoinHandle<()>>>,
    heartbeat_interval: Duration,
    /// Optional last-writer-wins mirror of the latest AccountSnapshot, for
    /// an external dashboard to read. Passive output only — never read
    /// back by the core itself.
    account_mirror_path: SyncMutex<Option<PathBuf>>,
    /// `symbols.priority_list`: accepted symbol aliases. The first one the
    /// EA actually reports is locked in via `MarketDataCache::resolve_symbol`;
    /// `market_data` frames for any other symbol are dropped as a protocol
    /// mismatch rather than silently tracked alongside it.
    symbol_aliases: Vec<String>,
}

impl BridgeServer {
    pub fn new(cache: MarketDataCache, notifier: mpsc::Sender<NotificationEvent>) -> Arc<Self> {
        Self::with_symbol_aliases(cache, notifier, Vec::new())
    }

    /// `aliases` empty means "accept whatever symbol the EA reports" (no
    /// priority list configured); otherwise only frames matching one of
    /// the configured aliases update the cache.
    pub fn with_symbol_aliases(
        cache: MarketDataCache,
        notifier: mpsc::Sender<NotificationEvent>,
        aliases: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(BridgeServer {
            cache,
            notifier,
            state: SyncMutex::new(ConnectionState::Listening),
            dispatcher: SyncMutex::new(None),
            active_connection: AsyncMutex::new(None),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            account_mirror_path: SyncMutex::new(None),
            symbol_aliases: aliases,
        })
    }

    /// Enables the `account_info.json` dashboard mirror at `<logs_dir>/account_info.json`.
    pub fn with_account_mirror(self: Arc<Self>, path: PathBuf) -> Arc<Self> {
        *self.account_mirror_path.lock() = Some(path);
        self
    }

    fn write_account_mirror(&self, account: &AccountSnapshot) {
        let Some(path) = self.account_mirror_path.lock().clone() else { return };
        let Ok(body) = serde_json::to_string_pretty(account) else { return };
        let tmp_path = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp_path, body).and_then(|_| std::fs::rename(&tmp_path, &path)) {
            log::warn!("bridge: account_info.json mirror write failed: {e}");
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn dispatcher(&self) -> Option<Dispatcher> {
        self.dispatcher.lock().clone()
    }

    fn transition(&self, to: ConnectionState) {
        let from = {
            let mut guard = self.state.lock();
            let from = *guard;
            *guard = to;
            from
        };
        if from != to {
            log::info!("bridge: {from:?} -> {to:?}");
            let _ = self.notifier.try_send(NotificationEvent::BridgeStateChanged { from, to });
        }
    }

    /// Accepts connections forever. Each new connection supersedes the
    /// previous one (its task is aborted).
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("bridge: listening on {addr}");
        self.transition(ConnectionState::Listening);

        loop {
            let (socket, peer) = listener.accept().await?;
            log::info!("bridge: EA connected from {peer}");

            let mut slot = self.active_connection.lock().await;
            if let Some(old) = slot.take() {
                old.abort();
            }
            let server = self.clone();
            let handle = tokio::spawn(async move {
                server.clone().handle_connection(socket).await;
                server.transition(ConnectionState::Closed);
                server.transition(ConnectionState::Listening);
            });
            *slot = Some(handle);
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: tokio::net::TcpStream) {
        let (read_half, write_half) = socket.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let (to_writer_tx, mut to_writer_rx) = mpsc::channel(32);
        let (dispatcher, waiters) = Dispatcher::new(to_writer_tx);
        *self.dispatcher.lock() = Some(dispatcher);
        self.transition(ConnectionState::Connected);

        let write_task = tokio::spawn(async move {
            while let Some(command) = to_writer_rx.recv().await {
                if let Err(e) = writer.send(&command).await {
                    log::error!("bridge: write failed: {e}");
                    break;
                }
            }
        });

        let timeout = self.heartbeat_interval * DEFAULT_HEARTBEAT_TIMEOUT_MULTIPLIER;
        let mut last_frame = tokio::time::Instant::now();
        let mut degraded = false;
        let mut ticker = tokio::time::interval(self.heartbeat_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let silence = last_frame.elapsed();
                    if silence >= timeout {
                        log::warn!("bridge: heartbeat timeout after {silence:?}, closing connection");
                        break;
                    } else if silence >= self.heartbeat_interval && !degraded {
                        degraded = true;
                        self.transition(ConnectionState::Degraded);
                    }
                }
                frame = reader.next_frame() => {
                    match frame {
                        Ok(FrameOutcome::Eof) => {
                            log::warn!("bridge: connection closed by peer");
                            break;
                        }
                        Ok(FrameOutcome::Malformed(reason)) => {
                            log::warn!("bridge: dropped malformed frame: {reason}");
                        }
                        Ok(FrameOutcome::Message(message)) => {
                            last_frame = tokio::time::Instant::now();
                            if degraded {
                                degraded = false;
                                self.transition(ConnectionState::Connected);
                            }
                            self.handle_message(message, &waiters).await;
                        }
                        Err(e) => {
                            log::error!("bridge: {e}");
                            break;
                        }
                    }
                }
            }
        }

        write_task.abort();
        *self.dispatcher.lock() = None;
    }

    async fn handle_message(
        &self,
        message: InboundMessage,
        waiters: &Arc<AsyncMutex<VecDeque<tokio::sync::oneshot::Sender<InboundMessage>>>>,
    ) {
        if message.is_command_reply() {
            route_reply(waiters, message).await;
            return;
        }

        match message {
            InboundMessage::MarketData {
                symbol, bid, ask, spread, time, point, digits, contract_size,
                min_lot, max_lot, lot_step, balance, equity, margin, free_margin,
                profit, leverage, open_positions,
            } => {
                let symbol = if self.symbol_aliases.is_empty() {
                    symbol
                } else {
                    match self.cache.resolve_symbol(&symbol, &self.symbol_aliases) {
                        Some(resolved) => resolved,
                        None => {
                            log::debug!(
                                "bridge: dropping market_data for {symbol:?}, not in symbols.priority_list"
                            );
                            return;
                        }
                    }
                };
                self.cache.update_tick(Tick {
                    symbol, bid, ask, spread, time, point, digits, contract_size,
                    min_lot, max_lot, lot_step, received_at: 0,
                });
                let account = AccountSnapshot {
                    balance, equity, margin, free_margin, profit, leverage, open_positions, received_at: 0,
                };
                self.write_account_mirror(&account);
                self.cache.update_account(account);
            }
            InboundMessage::Position {
                ticket, symbol, pos_type, volume, price_open, price_current, sl, tp, profit, comment,
            } => {
                let side = if pos_type.eq_ignore_ascii_case("buy") { Side::Buy } else { Side::Sell };
                // Preserve whatever contract_size the position already carries in the
                // cache (set at open time by the Trading Loop); only fall back to the
                // latest tick for a position the bridge is seeing for the first time
                // (e.g. reconciliation after a restart via GET_POSITIONS).
                let contract_size = self
                    .cache
                    .position(ticket)
                    .map(|p| p.contract_size)
                    .or_else(|| self.cache.latest_tick().map(|t| t.contract_size))
                    .unwrap_or(100.0);
                self.cache.upsert_position(Position {
                    ticket,
                    symbol,
                    side,
                    volume,
                    open_price: price_open,
                    current_price: price_current,
                    sl,
                    tp,
                    contract_size,
                    unrealized_pl: profit,
                    open_time: Utc::now().timestamp(),
                    comment,
                    status: crate::types::PositionStatus::Open,
                });
            }
            InboundMessage::Heartbeat { .. } => {
                log::debug!("bridge: heartbeat received");
            }
            InboundMessage::OrderResult { .. } | InboundMessage::Response { .. } | InboundMessage::Rates { .. } => {
                unreachable!("command replies are routed above")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::OutboundCommand;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn market_data_frame_updates_cache() {
        let cache = MarketDataCache::new();
        let (tx, _rx) = mpsc::channel(8);
        let server = BridgeServer::new(cache.clone(), tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let srv = server.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            srv.handle_connection(socket).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let frame = serde_json::json!({
            "type": "market_data", "symbol": "XAUUSD", "bid": 2223.50, "ask": 2223.57,
            "spread": 7, "time": "2026-07-28 10:00:00", "point": 0.01, "digits": 2,
            "contract_size": 100.0, "min_lot": 0.01, "max_lot": 100.0, "lot_step": 0.01,
            "balance": 10000.0, "equity": 10000.0, "margin": 0.0, "free_margin": 10000.0,
            "profit": 0.0, "leverage": 100.0, "open_positions": 0
        });
        client.write_all(format!("{}\n", frame).as_bytes()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.latest_tick().is_some());
        assert!(cache.latest_account().is_some());
    }

    #[tokio::test]
    async fn market_data_for_unconfigured_symbol_is_dropped() {
        let cache = MarketDataCache::new();
        let (tx, _rx) = mpsc::channel(8);
        let server = BridgeServer::with_symbol_aliases(cache.clone(), tx, vec!["XAUUSD".to_string(), "GOLD".to_string()]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let srv = server.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            srv.handle_connection(socket).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let frame = serde_json::json!({
            "type": "market_data", "symbol": "EURUSD", "bid": 1.08, "ask": 1.081,
            "spread": 2, "time": "2026-07-28 10:00:00", "point": 0.0001, "digits": 5,
            "contract_size": 100000.0, "min_lot": 0.01, "max_lot": 100.0, "lot_step": 0.01,
            "balance": 10000.0, "equity": 10000.0, "margin": 0.0, "free_margin": 10000.0,
            "profit": 0.0, "leverage": 100.0, "open_positions": 0
        });
        client.write_all(format!("{}\n", frame).as_bytes()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.latest_tick().is_none());
        assert!(cache.resolved_symbol().is_none());
    }

    #[tokio::test]
    async fn market_data_resolves_configured_alias_and_normalizes_symbol() {
        let cache = MarketDataCache::new();
        let (tx, _rx) = mpsc::channel(8);
        let server = BridgeServer::with_symbol_aliases(cache.clone(), tx, vec!["XAUUSD".to_string(), "GOLD".to_string()]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let srv = server.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            srv.handle_connection(socket).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let frame = serde_json::json!({
            "type": "market_data", "symbol": "GOLD", "bid": 2223.50, "ask": 2223.57,
            "spread": 7, "time": "2026-07-28 10:00:00", "point": 0.01, "digits": 2,
            "contract_size": 100.0, "min_lot": 0.01, "max_lot": 100.0, "lot_step": 0.01,
            "balance": 10000.0, "equity": 10000.0, "margin": 0.0, "free_margin": 10000.0,
            "profit": 0.0, "leverage": 100.0, "open_positions": 0
        });
        client.write_all(format!("{}\n", frame).as_bytes()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.latest_tick().map(|t| t.symbol), Some("GOLD".to_string()));
        assert_eq!(cache.resolved_symbol(), Some("GOLD".to_string()));
    }

    #[tokio::test]
    async fn market_data_frame_writes_account_mirror_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mirror_path = dir.path().join("account_info.json");
        let cache = MarketDataCache::new();
        let (tx, _rx) = mpsc::channel(8);
        let server = BridgeServer::new(cache.clone(), tx).with_account_mirror(mirror_path.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let srv = server.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            srv.handle_connection(socket).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let frame = serde_json::json!({
            "type": "market_data", "symbol": "XAUUSD", "bid": 2223.50, "ask": 2223.57,
            "spread": 7, "time": "2026-07-28 10:00:00", "point": 0.01, "digits": 2,
            "contract_size": 100.0, "min_lot": 0.01, "max_lot": 100.0, "lot_step": 0.01,
            "balance": 12345.0, "equity": 12345.0, "margin": 0.0, "free_margin": 12345.0,
            "profit": 0.0, "leverage": 100.0, "open_positions": 0
        });
        client.write_all(format!("{}\n", frame).as_bytes()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let body = std::fs::read_to_string(&mirror_path).unwrap();
        assert!(body.contains("12345"));
    }

    #[tokio::test]
    async fn command_round_trip_through_dispatcher() {
        let cache = MarketDataCache::new();
        let (tx, _rx) = mpsc::channel(8);
        let server = BridgeServer::new(cache, tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let srv = server.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            srv.handle_connection(socket).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let dispatcher = server.dispatcher().expect("dispatcher set after connect");

        let send_task = tokio::spawn(async move {
            dispatcher
                .send_and_await(OutboundCommand::GetPositions, Some(Duration::from_secs(2)))
                .await
        });

        // Read the command the client received, then reply.
        let mut buf = vec![0u8; 256];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("GET_POSITIONS"));

        client
            .write_all(b"{\"type\":\"response\",\"status\":\"SUCCESS\"}\n")
            .await
            .unwrap();

        let result = send_task.await.unwrap();
        assert!(result.is_ok());
    }
}
