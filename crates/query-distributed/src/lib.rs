//! Cross-node exchange for the batch pipeline
//!
//! Remote batches reach a query through a [`MessageReceiver`]: the receiving
//! side blocks on a channel identified by the query's context token and a
//! message token, and gets back either a host-resident batch or a
//! per-sender end-of-stream signal.
//!
//! # Modules
//!
//! - [`network`]: Receive contract and wire frames
//! - [`exchange`]: In-process exchange used by single-process runs

pub mod exchange;
pub mod network;

pub use exchange::InProcessExchange;
pub use network::{
    message_token, ExchangeFrame, MessageReceiver, ReceiveOutcome, ReceivedHostMessage,
};
