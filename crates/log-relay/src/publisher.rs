// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fire-and-forget publishing of routed messages.
//!
//! [`Publisher::publish`] never waits on the broker: messages go through a bounded queue to a
//! single [`PublisherService`] task, and a full queue drops the message. Delivery failures are
//! queued for the [`PublishErrorReporter`], which logs and counts them.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, trace};

use crate::errors::PublishError;
use crate::message::Message;
use crate::partition::{InconsistentHashPartitioner, Partitioner};
use crate::stats::{StatsSink, PRODUCE_ERRORS};
use crate::transport::{PublishFailure, Record, Transport};

/// Cheap handle queueing messages for the [`PublisherService`].
#[derive(Clone)]
pub struct Publisher {
    queue: mpsc::Sender<Message>,
    stats: Arc<dyn StatsSink>,
}

impl Publisher {
    /// Creates a publisher keyed by `key`, holding at most `capacity` undelivered messages.
    /// An empty key spreads records randomly.
    pub fn new<T: Transport>(
        transport: T,
        key: Vec<u8>,
        capacity: usize,
        stats: Arc<dyn StatsSink>,
    ) -> (Self, PublisherService<T>, PublishErrorReporter) {
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let publisher = Publisher {
            queue: queue_tx,
            stats: stats.clone(),
        };
        let service = PublisherService {
            transport,
            partitioner: InconsistentHashPartitioner,
            key,
            rx: queue_rx,
            errors: errors_tx,
        };
        let reporter = PublishErrorReporter {
            rx: errors_rx,
            stats,
        };
        (publisher, service, reporter)
    }

    /// Queues `message` for delivery to its topic without waiting.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the delivery queue is full and `Closed` once the service has stopped.
    /// The message is dropped and counted as a produce error in both cases.
    pub fn publish(&self, message: Message) -> Result<(), PublishError> {
        let error = match self.queue.try_send(message) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(_)) => PublishError::QueueFull,
            Err(TrySendError::Closed(_)) => PublishError::Closed,
        };
        self.stats.incr(PRODUCE_ERRORS, 1, 1.0);
        Err(error)
    }
}

/// Delivers queued messages one at a time. Ends once every [`Publisher`] handle is dropped.
pub struct PublisherService<T: Transport> {
    transport: T,
    partitioner: InconsistentHashPartitioner,
    key: Vec<u8>,
    rx: mpsc::Receiver<Message>,
    errors: mpsc::UnboundedSender<PublishFailure>,
}

impl<T: Transport> PublisherService<T> {
    pub async fn run(mut self) {
        debug!("Publisher started");
        while let Some(message) = self.rx.recv().await {
            if let Err(failure) = self.deliver(message).await {
                // the reporter is gone only during shutdown
                if self.errors.send(failure).is_err() {
                    debug!("Publish error reporter stopped, dropping failure");
                }
            }
        }
        debug!("Publisher stopped");
    }

    async fn deliver(&self, message: Message) -> Result<(), PublishFailure> {
        let value = message.to_bytes();
        let topic = message.topic;
        let fail = |record: Option<Record>, error: PublishError| PublishFailure {
            topic: topic.clone(),
            record,
            error,
        };

        let value = value.map_err(|e| fail(None, e))?;
        let partitions = self
            .transport
            .partition_count(&topic)
            .await
            .map_err(|e| fail(None, e))?;
        let key = (!self.key.is_empty()).then_some(&self.key[..]);
        let partition = self
            .partitioner
            .partition(key, partitions)
            .map_err(|e| fail(None, PublishError::from(e)))?;

        let record = Record {
            topic: topic.clone(),
            partition,
            key: self.key.clone(),
            value,
        };
        trace!(
            "Publishing {} bytes to {}/{}",
            record.value.len(),
            topic,
            partition
        );
        self.transport
            .send(record.clone())
            .await
            .map_err(|e| fail(Some(record), e))
    }
}

/// Drains the publisher's error channel. Ends once the [`PublisherService`] stops.
pub struct PublishErrorReporter {
    rx: mpsc::UnboundedReceiver<PublishFailure>,
    stats: Arc<dyn StatsSink>,
}

impl PublishErrorReporter {
    pub async fn run(mut self) {
        debug!("Publish error reporter started");
        while let Some(failure) = self.rx.recv().await {
            self.stats.incr(PRODUCE_ERRORS, 1, 1.0);
            error!(
                "Failed to publish message to {}: {}",
                failure.topic, failure.error
            );
        }
        debug!("Publish error reporter stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::wrap_msg;
    use crate::partition::fnv1a_32;
    use crate::stats::CountingStats;
    use crate::transport::InMemoryTransport;
    use async_trait::async_trait;
    use tracing_test::traced_test;

    fn message(topic: &str, text: &str) -> Message {
        let mut message = Message::new(text.as_bytes().to_vec(), wrap_msg(text));
        message.topic = topic.to_string();
        message
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn partition_count(&self, _topic: &str) -> Result<i32, PublishError> {
            Ok(2)
        }

        async fn send(&self, _record: Record) -> Result<(), PublishError> {
            Err(PublishError::Transport("broker unavailable".to_string()))
        }
    }

    /// Accepts partition lookups but never completes a send.
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn partition_count(&self, _topic: &str) -> Result<i32, PublishError> {
            Ok(1)
        }

        async fn send(&self, _record: Record) -> Result<(), PublishError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_publish_delivers_record() {
        let (transport, mut rx) = InMemoryTransport::new(8, 4);
        let stats = Arc::new(CountingStats::new());
        let (publisher, service, _reporter) =
            Publisher::new(transport, b"relay-host".to_vec(), 4, stats.clone());
        let service = tokio::spawn(service.run());

        publisher.publish(message("service.api", "hello")).unwrap();
        drop(publisher);
        service.await.unwrap();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.topic, "service.api");
        assert_eq!(record.key, b"relay-host");
        assert_eq!(record.value, br#"{"msg":"hello"}"#);
        assert_eq!(
            record.partition,
            ((fnv1a_32(b"relay-host") as i32).unsigned_abs() % 8) as i32
        );
        assert_eq!(stats.get(PRODUCE_ERRORS), 0);
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let (transport, mut rx) = InMemoryTransport::new(16, 16);
        let stats = Arc::new(CountingStats::new());
        let (publisher, service, _reporter) =
            Publisher::new(transport, b"k".to_vec(), 8, stats);

        for i in 0..5 {
            publisher
                .publish(message("service.api", &format!("line {i}")))
                .unwrap();
        }
        drop(publisher);
        service.run().await;

        let first = rx.recv().await.unwrap().partition;
        for _ in 0..4 {
            assert_eq!(rx.recv().await.unwrap().partition, first);
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_send_failures_are_reported_and_counted() {
        let stats = Arc::new(CountingStats::new());
        let (publisher, service, reporter) =
            Publisher::new(FailingTransport, b"k".to_vec(), 4, stats.clone());

        publisher.publish(message("service.api", "lost")).unwrap();
        drop(publisher);
        service.run().await;
        reporter.run().await;

        assert_eq!(stats.get(PRODUCE_ERRORS), 1);
        assert!(logs_contain("Failed to publish message to service.api"));
        assert!(logs_contain("broker unavailable"));
    }

    #[tokio::test]
    async fn test_invalid_partition_count_is_reported() {
        let (transport, _rx) = InMemoryTransport::new(0, 1);
        let stats = Arc::new(CountingStats::new());
        let (publisher, service, reporter) =
            Publisher::new(transport, Vec::new(), 4, stats.clone());

        publisher.publish(message("service.api", "nowhere")).unwrap();
        drop(publisher);
        service.run().await;
        reporter.run().await;

        assert_eq!(stats.get(PRODUCE_ERRORS), 1);
    }

    #[tokio::test]
    async fn test_stalled_transport_bounds_pending_messages() {
        let stats = Arc::new(CountingStats::new());
        let (publisher, service, _reporter) =
            Publisher::new(StalledTransport, b"k".to_vec(), 4, stats.clone());
        let service = tokio::spawn(service.run());

        let mut dropped = 0;
        for i in 0..100 {
            if let Err(e) = publisher.publish(message("service.api", &format!("line {i}"))) {
                assert!(matches!(e, PublishError::QueueFull));
                dropped += 1;
            }
            tokio::task::yield_now().await;
        }

        // one message is stuck in the transport, the queue holds four more
        assert!((95..=96).contains(&dropped), "dropped {dropped}");
        assert_eq!(stats.get(PRODUCE_ERRORS), dropped);
        assert!(!service.is_finished());
        service.abort();
    }

    #[tokio::test]
    async fn test_publish_after_service_stopped() {
        let (transport, _rx) = InMemoryTransport::new(1, 1);
        let stats = Arc::new(CountingStats::new());
        let (publisher, service, _reporter) =
            Publisher::new(transport, b"k".to_vec(), 4, stats.clone());
        drop(service);

        let result = publisher.publish(message("service.api", "late"));
        assert!(matches!(result, Err(PublishError::Closed)));
        assert_eq!(stats.get(PRODUCE_ERRORS), 1);
    }
}
