//! In-process exchange
//!
//! Mailboxes keyed by `(context_token, message_token)`. Senders enqueue
//! frames, the receiving listener blocks on the mailbox's condition variable.
//! Used for single-process runs and tests of multi-node pipelines.

use crate::network::{ExchangeFrame, MessageReceiver, ReceiveOutcome};
use arrow::record_batch::RecordBatch;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use query_cache::HostTable;
use query_core::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

#[derive(Default)]
struct Mailbox {
    frames: Mutex<VecDeque<ExchangeFrame>>,
    ready: Condvar,
}

impl Mailbox {
    fn push(&self, frame: ExchangeFrame) {
        self.frames.lock().push_back(frame);
        self.ready.notify_one();
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<ExchangeFrame> {
        let mut frames = self.frames.lock();
        if frames.is_empty() {
            self.ready.wait_for(&mut frames, timeout);
        }
        frames.pop_front()
    }
}

/// Exchange whose senders and receivers live in the same process
#[derive(Default)]
pub struct InProcessExchange {
    mailboxes: DashMap<(u32, String), Arc<Mailbox>>,
}

impl InProcessExchange {
    pub fn new() -> Self {
        Self::default()
    }

    fn mailbox(&self, context_token: u32, message_token: &str) -> Arc<Mailbox> {
        self.mailboxes
            .entry((context_token, message_token.to_string()))
            .or_default()
            .clone()
    }

    /// Enqueue a frame as a remote transport would deliver it
    pub fn deliver(&self, context_token: u32, message_token: &str, frame: ExchangeFrame) {
        trace!(
            "Delivering frame from node {} to {}:{}",
            frame.sender_node(),
            context_token,
            message_token
        );
        self.mailbox(context_token, message_token).push(frame);
    }

    /// Send one batch from `sender_node` with the given routing key
    pub fn send(
        &self,
        context_token: u32,
        message_token: &str,
        sender_node: usize,
        partition_id: u32,
        batch: &RecordBatch,
    ) -> Result<()> {
        let table = HostTable::from_batch(batch)?;
        self.send_table(context_token, message_token, sender_node, partition_id, table);
        Ok(())
    }

    pub fn send_table(
        &self,
        context_token: u32,
        message_token: &str,
        sender_node: usize,
        partition_id: u32,
        table: HostTable,
    ) {
        self.deliver(
            context_token,
            message_token,
            ExchangeFrame::Data {
                sender_node,
                partition_id,
                table,
            },
        );
    }

    /// Tell the receiver that `sender_node` has nothing more for this channel
    pub fn send_end_of_stream(&self, context_token: u32, message_token: &str, sender_node: usize) {
        self.deliver(
            context_token,
            message_token,
            ExchangeFrame::EndOfStream { sender_node },
        );
    }

    /// Frames waiting in a channel
    pub fn pending(&self, context_token: u32, message_token: &str) -> usize {
        self.mailboxes
            .get(&(context_token, message_token.to_string()))
            .map(|mailbox| mailbox.frames.lock().len())
            .unwrap_or(0)
    }

    /// Drop every channel belonging to a query
    pub fn remove_query(&self, context_token: u32) {
        self.mailboxes.retain(|(token, _), _| *token != context_token);
    }
}

impl MessageReceiver for InProcessExchange {
    fn get_message(
        &self,
        context_token: u32,
        message_token: &str,
        timeout: Duration,
    ) -> Result<ReceiveOutcome> {
        let mailbox = self.mailbox(context_token, message_token);
        Ok(match mailbox.pop_timeout(timeout) {
            Some(frame) => frame.into(),
            None => ReceiveOutcome::TimedOut,
        })
    }
}

impl std::fmt::Debug for InProcessExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessExchange")
            .field("channels", &self.mailboxes.len())
            .finish()
    }
}
