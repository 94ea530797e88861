//! Command dispatcher: serializes outgoing commands and correlates
//! replies by arrival order.
//!
//! There is no explicit request ID in the wire protocol, so replies are
//! matched FIFO: the next incoming `order_result`/`response` is handed
//! to the oldest pending waiter. A given command completes (ack or
//! timeout) before the next is sent, preserving correlation.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::bridge::protocol::{InboundMessage, OutboundCommand};
use crate::error::BridgeError;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

struct OutgoingCommand {
    command: OutboundCommand,
    reply_tx: Option<oneshot::Sender<InboundMessage>>,
}

/// Handle held by callers (Order Executor) to send a command and await
/// its correlated reply.
#[derive(Clone)]
pub struct Dispatcher {
    to_writer: mpsc::Sender<OutboundCommand>,
    waiters: std::sync::Arc<Mutex<VecDeque<oneshot::Sender<InboundMessage>>>>,
}

impl Dispatcher {
    /// `to_writer` feeds the bridge's single writer task; `waiters` is
    /// shared with the reader task so incoming replies can be routed.
    pub fn new(to_writer: mpsc::Sender<OutboundCommand>) -> (Self, std::sync::Arc<Mutex<VecDeque<oneshot::Sender<InboundMessage>>>>) {
        let waiters = std::sync::Arc::new(Mutex::new(VecDeque::new()));
        (Dispatcher { to_writer, waiters: waiters.clone() }, waiters)
    }

    /// Sends a command and waits up to `timeout` for its correlated reply.
    pub async fn send_and_await(
        &self,
        command: OutboundCommand,
        timeout: Option<Duration>,
    ) -> Result<InboundMessage, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.push_back(tx);

        self.to_writer
            .send(command)
            .await
            .map_err(|_| BridgeError::NotConnected)?;

        let wait = timeout.unwrap_or(DEFAULT_REPLY_TIMEOUT);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(BridgeError::NotConnected),
            Err(_) => Err(BridgeError::CommandTimeout),
        }
    }

    /// Fire-and-forget send with no correlated reply expected.
    pub async fn send(&self, command: OutboundCommand) -> Result<(), BridgeError> {
        self.to_writer.send(command).await.map_err(|_| BridgeError::NotConnected)
    }
}

/// Routes one incoming reply to the oldest pending waiter, if any.
/// Called by the reader task whenever `InboundMessage::is_command_reply()`.
pub async fn route_reply(
    waiters: &std::sync::Arc<Mutex<VecDeque<oneshot::Sender<InboundMessage>>>>,
    message: InboundMessage,
) {
    let mut queue = waiters.lock().await;
    if let Some(tx) = queue.pop_front() {
        let _ = tx.send(message);
    }
    // No pending waiter: an unsolicited reply (e.g. a stale retry from
    // the EA). Dropped — there is nobody left to correlate it to.
}

pub const DEFAULT_TIMEOUT: Duration = DEFAULT_REPLY_TIMEOUT;
