//! Sequence over batches sent by remote nodes
//!
//! A listener thread receives messages for one exchange channel and lands
//! them in a [`HostCacheMachine`]. Every remote node ends its part of the
//! stream with one end-of-stream signal; after `total_nodes - 1` of them the
//! listener finishes the host cache and exits. A listener that gives up early
//! (remote timeout, receive failure) records why, and the sequence reports
//! that error once the batches received so far have been read.

use crate::config::EngineConfig;
use query_cache::{HostCacheMachine, HostTable};
use query_core::{Context, QueryError, Result};
use query_distributed::{message_token, MessageReceiver, ReceiveOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

pub struct ExternalBatchColumnDataSequence {
    host_cache: Arc<HostCacheMachine>,
    failure: Arc<Mutex<Option<QueryError>>>,
    shutdown: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

struct Listener {
    context: Arc<Context>,
    receiver: Arc<dyn MessageReceiver>,
    host_cache: Arc<HostCacheMachine>,
    failure: Arc<Mutex<Option<QueryError>>>,
    shutdown: Arc<AtomicBool>,
    message_token: String,
    poll_interval: Duration,
    remote_timeout: Option<Duration>,
}

impl Listener {
    fn run(self) {
        let mut remaining = self.context.remote_nodes();
        let mut last_activity = Instant::now();

        while remaining > 0 && !self.shutdown.load(Ordering::Acquire) {
            let outcome = self.receiver.get_message(
                self.context.context_token(),
                &self.message_token,
                self.poll_interval,
            );
            match outcome {
                Ok(ReceiveOutcome::Message(msg)) => {
                    last_activity = Instant::now();
                    let mut table = msg.table;
                    table.set_partition_id(msg.partition_id);
                    if let Err(e) = self.host_cache.add_to_cache(table) {
                        warn!(
                            query_id = self.context.context_token(),
                            "Dropping remote batch for {}: {}", self.message_token, e
                        );
                        self.fail(e);
                        break;
                    }
                }
                Ok(ReceiveOutcome::SenderFinished { sender_node }) => {
                    last_activity = Instant::now();
                    remaining -= 1;
                    debug!(
                        query_id = self.context.context_token(),
                        "Node {} finished sending on {}, {} remaining",
                        sender_node,
                        self.message_token,
                        remaining
                    );
                }
                Ok(ReceiveOutcome::TimedOut) => {
                    if let Some(limit) = self.remote_timeout {
                        if last_activity.elapsed() >= limit {
                            let err = QueryError::RemoteTimeout(limit.as_millis() as u64);
                            error!(
                                query_id = self.context.context_token(),
                                "{} on {} with {} senders outstanding",
                                err,
                                self.message_token,
                                remaining
                            );
                            self.fail(err);
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(
                        query_id = self.context.context_token(),
                        "Receiving on {} failed: {}", self.message_token, e
                    );
                    self.fail(e);
                    break;
                }
            }
        }

        self.host_cache.finish();
    }

    fn fail(&self, err: QueryError) {
        self.failure.lock().get_or_insert(err);
    }
}

impl ExternalBatchColumnDataSequence {
    /// Start listening for `message_id` on this query's communication channel
    pub fn new(
        context: Arc<Context>,
        message_id: &str,
        receiver: Arc<dyn MessageReceiver>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let token = message_token(message_id, context.communication_token());
        let host_cache = Arc::new(HostCacheMachine::new(format!("external-{}", token)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(Mutex::new(None));

        let listener = Listener {
            context,
            receiver,
            host_cache: Arc::clone(&host_cache),
            failure: Arc::clone(&failure),
            shutdown: Arc::clone(&shutdown),
            message_token: token,
            poll_interval: config.listener_poll_interval(),
            remote_timeout: config.remote_timeout(),
        };
        let handle = thread::Builder::new()
            .name(format!("exchange-{}", message_id))
            .spawn(move || listener.run())?;

        Ok(Self {
            host_cache,
            failure,
            shutdown,
            listener: Some(handle),
        })
    }

    pub fn host_cache(&self) -> &Arc<HostCacheMachine> {
        &self.host_cache
    }

    /// Next remote batch, stamped with its partition id.
    ///
    /// After the last buffered batch, returns the error that stopped the
    /// listener, if any, instead of end-of-stream.
    pub fn next(&mut self) -> Result<Option<HostTable>> {
        match self.host_cache.pull_from_cache()? {
            Some(table) => Ok(Some(table)),
            None => match self.failure.lock().take() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    pub fn wait_for_next(&self) -> bool {
        self.host_cache.wait_for_next()
    }

    pub fn has_next_now(&self) -> bool {
        self.host_cache.has_next_now()
    }
}

impl Drop for ExternalBatchColumnDataSequence {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.listener.take() {
            if handle.join().is_err() {
                error!("Exchange listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for ExternalBatchColumnDataSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalBatchColumnDataSequence")
            .field("host_cache", &self.host_cache.name())
            .field("listening", &self.listener.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use query_core::ContextBuilder;
    use query_distributed::InProcessExchange;

    fn create_test_batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn cluster_context(total_nodes: usize) -> Arc<Context> {
        Arc::new(
            ContextBuilder::new(11)
                .total_nodes(total_nodes)
                .node_index(0)
                .communication_token("comm")
                .build(),
        )
    }

    fn fast_config() -> EngineConfig {
        EngineConfig::default().with_listener_poll_interval_ms(5)
    }

    #[test]
    fn test_single_node_finishes_immediately() {
        let exchange = Arc::new(InProcessExchange::new());
        let mut seq =
            ExternalBatchColumnDataSequence::new(cluster_context(1), "4_1", exchange, &fast_config())
                .unwrap();
        assert!(!seq.wait_for_next());
        assert!(seq.next().unwrap().is_none());
    }

    #[test]
    fn test_finishes_after_every_remote_sender() {
        let exchange = Arc::new(InProcessExchange::new());
        let token = message_token("4_2", "comm");
        let mut seq = ExternalBatchColumnDataSequence::new(
            cluster_context(4),
            "4_2",
            Arc::clone(&exchange) as Arc<dyn MessageReceiver>,
            &fast_config(),
        )
        .unwrap();

        exchange.send(11, &token, 1, 0, &create_test_batch(vec![1, 2])).unwrap();
        exchange.send_end_of_stream(11, &token, 1);
        exchange.send(11, &token, 2, 5, &create_test_batch(vec![3])).unwrap();
        exchange.send_end_of_stream(11, &token, 2);

        let mut rows = 0;
        let mut partitions = Vec::new();
        // Two of three senders are done; the third still has to report.
        for _ in 0..2 {
            assert!(seq.wait_for_next());
            let table = seq.next().unwrap().unwrap();
            rows += table.num_rows();
            partitions.push(table.partition_id());
        }
        assert_eq!(rows, 3);
        assert_eq!(partitions, vec![Some(0), Some(5)]);
        assert!(!seq.host_cache().is_finished());

        exchange.send_end_of_stream(11, &token, 3);
        assert!(!seq.wait_for_next());
        assert!(seq.host_cache().is_finished());
    }

    #[test]
    fn test_remote_timeout_reported_after_buffered_batches() {
        let exchange = Arc::new(InProcessExchange::new());
        let token = message_token("4_3", "comm");
        exchange.send(11, &token, 1, 0, &create_test_batch(vec![1, 2])).unwrap();

        let config = fast_config().with_remote_timeout_ms(30);
        let mut seq = ExternalBatchColumnDataSequence::new(
            cluster_context(2),
            "4_3",
            Arc::clone(&exchange) as Arc<dyn MessageReceiver>,
            &config,
        )
        .unwrap();

        assert!(seq.wait_for_next());
        assert_eq!(seq.next().unwrap().unwrap().num_rows(), 2);
        assert!(!seq.wait_for_next());
        assert!(matches!(seq.next(), Err(QueryError::RemoteTimeout(30))));
        // Reported once
        assert!(seq.next().unwrap().is_none());
    }

    #[test]
    fn test_complete_exchange_ends_without_error() {
        let exchange = Arc::new(InProcessExchange::new());
        let token = message_token("4_5", "comm");
        exchange.send_end_of_stream(11, &token, 1);
        let mut seq = ExternalBatchColumnDataSequence::new(
            cluster_context(2),
            "4_5",
            Arc::clone(&exchange) as Arc<dyn MessageReceiver>,
            &fast_config().with_remote_timeout_ms(30),
        )
        .unwrap();
        assert!(!seq.wait_for_next());
        assert!(seq.next().unwrap().is_none());
    }

    #[test]
    fn test_drop_stops_listener() {
        let exchange = Arc::new(InProcessExchange::new());
        let seq = ExternalBatchColumnDataSequence::new(cluster_context(3), "4_4", exchange, &fast_config())
            .unwrap();
        let cache = Arc::clone(seq.host_cache());
        drop(seq);
        assert!(cache.is_finished());
    }
}
