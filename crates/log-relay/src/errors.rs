// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors produced while decoding a single datagram. None of them are fatal to a listener.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed priority: {0}")]
    MalformedPriority(&'static str),

    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    #[error("malformed tag: expected 4 '/' separated segments, got {0}")]
    MalformedTag(usize),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("malformed chunk header: {0}")]
    MalformedChunkHeader(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::MalformedPayload(e.to_string())
    }
}

/// Errors raised while publishing a message to the broker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("failed to serialize message: {0}")]
    Serialization(String),

    #[error("unable to resolve partitions for topic {0}")]
    UnknownTopic(String),

    #[error("partitioning failed: {0}")]
    Partition(#[from] PartitionError),

    #[error("transport closed")]
    Closed,

    #[error("publish queue is full")]
    QueueFull,

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("invalid partition count {0}")]
    InvalidPartitionCount(i32),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
