//! Network exchange contract
//!
//! The pipeline only consumes receive semantics: a blocking
//! [`MessageReceiver::get_message`] keyed by the query's context token and a
//! message token. The physical transport behind it is pluggable.

use query_cache::HostTable;
use query_core::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Build the message token that identifies one exchange channel of a query
pub fn message_token(message_id: &str, communication_token: &str) -> String {
    format!("{}_{}", message_id, communication_token)
}

/// Batch received from a remote node
#[derive(Debug)]
pub struct ReceivedHostMessage {
    /// Ordinal of the node that sent the batch
    pub sender_node: usize,
    /// Shuffle routing key
    pub partition_id: u32,
    /// IPC-encoded batch
    pub table: HostTable,
}

/// Result of one receive attempt
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A data message arrived
    Message(ReceivedHostMessage),
    /// One remote sender has no more messages for this channel
    SenderFinished { sender_node: usize },
    /// Nothing arrived within the timeout; the caller may retry
    TimedOut,
}

/// Blocking receive side of a cross-node exchange
pub trait MessageReceiver: Send + Sync {
    /// Wait up to `timeout` for the next message on a channel
    fn get_message(
        &self,
        context_token: u32,
        message_token: &str,
        timeout: Duration,
    ) -> Result<ReceiveOutcome>;
}

/// One unit on the wire
#[derive(Debug, Serialize, Deserialize)]
pub enum ExchangeFrame {
    /// A batch for the receiving channel
    Data {
        sender_node: usize,
        partition_id: u32,
        table: HostTable,
    },
    /// Sender is done with this channel
    EndOfStream { sender_node: usize },
}

impl ExchangeFrame {
    /// Encode for a byte-oriented transport
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QueryError::SerializationError(e.to_string()))
    }

    /// Decode a frame produced by [`ExchangeFrame::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| QueryError::SerializationError(e.to_string()))
    }

    pub fn sender_node(&self) -> usize {
        match self {
            ExchangeFrame::Data { sender_node, .. } => *sender_node,
            ExchangeFrame::EndOfStream { sender_node } => *sender_node,
        }
    }
}

impl From<ExchangeFrame> for ReceiveOutcome {
    fn from(frame: ExchangeFrame) -> Self {
        match frame {
            ExchangeFrame::Data {
                sender_node,
                partition_id,
                mut table,
            } => {
                table.set_partition_id(partition_id);
                ReceiveOutcome::Message(ReceivedHostMessage {
                    sender_node,
                    partition_id,
                    table,
                })
            }
            ExchangeFrame::EndOfStream { sender_node } => {
                ReceiveOutcome::SenderFinished { sender_node }
            }
        }
    }
}
