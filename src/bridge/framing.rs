//! Newline-delimited JSON framing.
//!
//! The receiver buffers partial data until it finds `\n` and parses the
//! preceding bytes as one message. Malformed frames are logged and
//! dropped; the connection itself is only torn down after `MAX_MALFORMED_FRAMES`
//! consecutive bad frames.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::bridge::protocol::{InboundMessage, OutboundCommand};
use crate::error::BridgeError;

pub const MAX_MALFORMED_FRAMES: u32 = 10;

pub struct FrameReader {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    consecutive_malformed: u32,
}

/// Outcome of reading one frame off the wire.
pub enum FrameOutcome {
    Message(InboundMessage),
    /// The frame was not valid JSON or not a recognized message `type`;
    /// the connection stays open unless this crosses the malformed threshold.
    Malformed(String),
    /// The peer closed the socket or a read error occurred.
    Eof,
}

impl FrameReader {
    pub fn new(read_half: OwnedReadHalf) -> Self {
        FrameReader { lines: BufReader::new(read_half).lines(), consecutive_malformed: 0 }
    }

    /// Reads one newline-terminated frame. Returns `Err` only when the
    /// consecutive-malformed-frame budget is exhausted.
    pub async fn next_frame(&mut self) -> Result<FrameOutcome, BridgeError> {
        match self.lines.next_line().await {
            Ok(None) => Ok(FrameOutcome::Eof),
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    return Ok(FrameOutcome::Malformed("empty frame".into()));
                }
                match serde_json::from_str::<InboundMessage>(&line) {
                    Ok(msg) => {
                        self.consecutive_malformed = 0;
                        Ok(FrameOutcome::Message(msg))
                    }
                    Err(e) => {
                        self.consecutive_malformed += 1;
                        if self.consecutive_malformed >= MAX_MALFORMED_FRAMES {
                            return Err(BridgeError::MalformedFrame(format!(
                                "{MAX_MALFORMED_FRAMES} consecutive malformed frames, last error: {e}"
                            )));
                        }
                        Ok(FrameOutcome::Malformed(e.to_string()))
                    }
                }
            }
            Err(e) => Err(BridgeError::Transport(e.to_string())),
        }
    }
}

pub struct FrameWriter {
    write_half: OwnedWriteHalf,
}

impl FrameWriter {
    pub fn new(write_half: OwnedWriteHalf) -> Self {
        FrameWriter { write_half }
    }

    pub async fn send(&mut self, command: &OutboundCommand) -> Result<(), BridgeError> {
        let mut body = serde_json::to_string(command).map_err(|e| BridgeError::Transport(e.to_string()))?;
        body.push('\n');
        self.write_half
            .write_all(body.as_bytes())
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }
}
