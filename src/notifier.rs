//! Notification sink: the core never calls an external service
//! directly, it only pushes a `NotificationEvent`.
//!
//! Console-always, webhook-optional: every event is logged, and
//! forwarded as a JSON POST to a configured webhook URL when one is
//! set.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::NotificationEvent;

#[derive(Serialize)]
struct WebhookPayload<'a> {
    kind: &'a str,
    message: String,
}

pub struct Notifier {
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Notifier { webhook_url, http: reqwest::Client::new() }
    }

    /// Drains `rx` until the sender side is dropped (shutdown).
    pub async fn run(self, mut rx: mpsc::Receiver<NotificationEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        log::info!("notifier: channel closed, shutting down");
    }

    async fn handle(&self, event: NotificationEvent) {
        let (kind, message) = describe(&event);
        match &event {
            NotificationEvent::RiskAlert { .. } => log::warn!("notify[{kind}]: {message}"),
            _ => log::info!("notify[{kind}]: {message}"),
        }

        let Some(url) = &self.webhook_url else { return };
        let payload = WebhookPayload { kind, message };
        if let Err(e) = self.http.post(url).json(&payload).send().await {
            log::error!("notifier: webhook delivery failed: {e}");
        }
    }
}

fn describe(event: &NotificationEvent) -> (&'static str, String) {
    match event {
        NotificationEvent::PauseEngaged { reason, until } => {
            ("pause_engaged", format!("trading paused ({reason}) until {until}"))
        }
        NotificationEvent::TradeOpened { symbol, side, volume, entry, sl, tp } => (
            "trade_opened",
            format!("{side:?} {volume} {symbol} @ {entry:.5} sl={sl:.5} tp={tp:.5}"),
        ),
        NotificationEvent::TradeClosed { symbol, side, entry, exit, pnl, reason } => (
            "trade_closed",
            format!(
                "{side:?} {symbol} entry={entry:.5} exit={exit:.5} pnl={pnl:.2} reason={}",
                reason.as_str()
            ),
        ),
        NotificationEvent::RiskAlert { message } => ("risk_alert", message.clone()),
        NotificationEvent::BridgeStateChanged { from, to } => {
            ("bridge_state_changed", format!("{from:?} -> {to:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CloseReason, ConnectionState, Side};

    #[test]
    fn trade_closed_message_includes_reason() {
        let (_, message) = describe(&NotificationEvent::TradeClosed {
            symbol: "XAUUSD".into(),
            side: Side::Buy,
            entry: 2223.57,
            exit: 2250.0,
            pnl: 79.29,
            reason: CloseReason::SarReversal,
        });
        assert!(message.contains("SAR_REVERSAL"));
    }

    #[test]
    fn bridge_state_changed_message_shows_transition() {
        let (_, message) = describe(&NotificationEvent::BridgeStateChanged {
            from: ConnectionState::Connected,
            to: ConnectionState::Degraded,
        });
        assert!(message.contains("Connected"));
        assert!(message.contains("Degraded"));
    }
}
