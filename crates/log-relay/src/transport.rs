// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Broker client abstraction used by the publisher.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::PublishError;

/// One message ready to be written to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    /// Partitioning key, shared by every record of a process
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A message that could not be published.
#[derive(Debug, Clone)]
pub struct PublishFailure {
    pub topic: String,
    /// Absent when the failure happened before a record was built
    pub record: Option<Record>,
    pub error: PublishError,
}

/// An asynchronous broker client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Number of partitions of `topic`, as known by the broker.
    async fn partition_count(&self, topic: &str) -> Result<i32, PublishError>;

    /// Hands `record` to the broker. Delivery may still fail after this returns.
    async fn send(&self, record: Record) -> Result<(), PublishError>;
}

/// Delivers records to a channel. Used when no broker is configured, and in tests.
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    default_partitions: i32,
    partitions: HashMap<String, i32>,
    tx: mpsc::Sender<Record>,
}

impl InMemoryTransport {
    /// Creates a transport where every topic has `default_partitions` partitions.
    #[must_use]
    pub fn new(default_partitions: i32, capacity: usize) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            InMemoryTransport {
                default_partitions,
                partitions: HashMap::new(),
                tx,
            },
            rx,
        )
    }

    /// Overrides the partition count of a single topic.
    #[must_use]
    pub fn with_topic(mut self, topic: &str, partitions: i32) -> Self {
        self.partitions.insert(topic.to_string(), partitions);
        self
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn partition_count(&self, topic: &str) -> Result<i32, PublishError> {
        Ok(self
            .partitions
            .get(topic)
            .copied()
            .unwrap_or(self.default_partitions))
    }

    async fn send(&self, record: Record) -> Result<(), PublishError> {
        self.tx.send(record).await.map_err(|_| PublishError::Closed)
    }
}
