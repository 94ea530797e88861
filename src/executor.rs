//! Order Executor.
//!
//! Translates a trade intent into bridge commands and retries `CLOSE`
//! with exponential backoff, since a stuck open position is the worst
//! outcome the crate can produce. Ledger writes are the Trading Loop's
//! job, not the executor's: this module only knows how to talk to the
//! bridge and report what happened.

use std::time::Duration;

use crate::bridge::dispatcher::Dispatcher;
use crate::bridge::protocol::{InboundMessage, OutboundCommand};
use crate::error::ExecutorError;
use crate::types::{OpenOrderRequest, Side};

/// Backoff delays between CLOSE retries, in seconds; the last entry
/// repeats once the sequence is exhausted, capped at 10s.
const CLOSE_BACKOFF_SECS: [u64; 4] = [1, 2, 4, 10];
const CLOSE_MAX_ATTEMPTS: u32 = 10;

/// Result of a successful OPEN: what the EA actually filled at.
#[derive(Debug, Clone, Copy)]
pub struct OpenFill {
    pub ticket: u64,
    pub fill_price: f64,
}

pub struct OrderExecutor<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> OrderExecutor<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        OrderExecutor { dispatcher }
    }

    /// Single-shot: a rejected open just means no trade happened this
    /// cycle, the Trading Loop will re-evaluate on the next signal. On a
    /// `CommandTimeout` the reply may simply have been lost, not the
    /// order — one `GET_POSITIONS` is issued to reconcile before the
    /// failure is reported.
    pub async fn open(&self, request: &OpenOrderRequest) -> Result<OpenFill, ExecutorError> {
        let command = match request.side {
            Side::Buy => OutboundCommand::Buy {
                volume: request.volume,
                sl: request.sl,
                tp: request.tp,
                comment: request.comment.clone(),
            },
            Side::Sell => OutboundCommand::Sell {
                volume: request.volume,
                sl: request.sl,
                tp: request.tp,
                comment: request.comment.clone(),
            },
        };

        let reply = match self.dispatcher.send_and_await(command, None).await {
            Ok(reply) => reply,
            Err(crate::error::BridgeError::CommandTimeout) => {
                log::warn!("executor: open command timed out, reconciling with GET_POSITIONS before failing");
                let _ = self.dispatcher.send_and_await(OutboundCommand::GetPositions, None).await;
                return Err(ExecutorError::Bridge(crate::error::BridgeError::CommandTimeout));
            }
            Err(e) => return Err(e.into()),
        };
        match reply {
            InboundMessage::OrderResult { success: true, ticket: Some(ticket), price: Some(price), .. } => {
                log::info!("executor: opened {:?} ticket {ticket} at {price:.5}", request.side);
                Ok(OpenFill { ticket, fill_price: price })
            }
            other => {
                log::warn!("executor: open rejected for {:?}: {other:?}", request.side);
                Err(ExecutorError::Bridge(crate::error::BridgeError::Transport(
                    "order_result did not confirm a fill".to_string(),
                )))
            }
        }
    }

    /// Retries CLOSE until the EA confirms or the attempt budget is
    /// exhausted. Exhaustion returns `CloseFailed`; the caller marks the
    /// position `REQUIRES_MANUAL` and stops touching it.
    ///
    /// CLOSE is acked with the generic `response` (`status`), not an
    /// `order_result` — the wire protocol only puts a fill price on
    /// `order_result` for BUY/SELL. There is no exit price to read off
    /// this ack; the caller must derive it from the cache (latest tick or
    /// last-known position price) once this returns successfully.
    pub async fn close(&self, ticket: u64) -> Result<(), ExecutorError> {
        for attempt in 0..CLOSE_MAX_ATTEMPTS {
            let reply = self
                .dispatcher
                .send_and_await(OutboundCommand::Close { ticket }, None)
                .await;

            match reply {
                Ok(InboundMessage::Response { status, .. }) if status == "SUCCESS" => {
                    log::info!("executor: closed ticket {ticket}");
                    return Ok(());
                }
                Ok(other) => {
                    log::warn!("executor: close attempt {attempt} for ticket {ticket} got unexpected reply: {other:?}");
                }
                Err(e) => {
                    log::warn!("executor: close attempt {attempt} for ticket {ticket} failed: {e}");
                }
            }

            let delay = CLOSE_BACKOFF_SECS[(attempt as usize).min(CLOSE_BACKOFF_SECS.len() - 1)];
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        log::error!("executor: ticket {ticket} REQUIRES_MANUAL after {CLOSE_MAX_ATTEMPTS} close attempts");
        Err(ExecutorError::CloseFailed { ticket })
    }

    /// Adjusts SL/TP on an open position. Single attempt: a failed modify
    /// just means the trailing stop stays where it was. Acked with the
    /// generic `response`, same as CLOSE/GET_POSITIONS.
    pub async fn modify(&self, ticket: u64, sl: f64, tp: f64) -> Result<(), ExecutorError> {
        let reply = self
            .dispatcher
            .send_and_await(OutboundCommand::Modify { ticket, sl, tp }, None)
            .await?;
        match reply {
            InboundMessage::Response { status, .. } if status == "SUCCESS" => {
                log::info!("executor: modified ticket {ticket} sl={sl:.5} tp={tp:.5}");
                Ok(())
            }
            other => {
                log::warn!("executor: modify rejected for ticket {ticket}: {other:?}");
                Err(ExecutorError::Bridge(crate::error::BridgeError::Transport(
                    "modify rejected".to_string(),
                )))
            }
        }
    }
}
