// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! GELF decoding and chunk reassembly.
//!
//! A GELF datagram is either a bare JSON object or one chunk of a larger message:
//!
//! ```text
//! [0-1]  magic 0x1e 0x0f
//! [2-9]  message id
//! [10]   sequence number, starting at 0
//! [11]   sequence count
//! [12..] payload fragment
//! ```
//!
//! Chunks are kept in a table keyed by message id until every fragment has arrived. Sets
//! that never complete are dropped by a cleanup pass that piggybacks on incoming traffic.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use fnv::FnvBuildHasher;
use tracing::{debug, trace};

use crate::errors::DecodeError;
use crate::listener::Decoder;
use crate::message::{parse_object, Message};
use crate::normalize::normalize_gelf;
use crate::stats::INVALID_GELF_MESSAGES;

pub const CHUNK_MAGIC: [u8; 2] = [0x1e, 0x0f];
const CHUNK_HEADER_LEN: usize = 12;

/// How long a partially received message is kept.
pub const CHUNK_EXPIRATION: Duration = Duration::from_secs(5);
/// Minimum time between two cleanup passes.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

pub type MessageId = [u8; 8];

/// Reassembly state for one chunked message.
#[derive(Debug)]
pub struct ChunkSet {
    slots: Vec<Vec<u8>>,
    received: usize,
    received_bytes: usize,
    expiration: Instant,
}

impl ChunkSet {
    fn new(total: usize, expiration: Instant) -> Self {
        ChunkSet {
            slots: vec![Vec::new(); total],
            received: 0,
            received_bytes: 0,
            expiration,
        }
    }

    fn store(&mut self, sequence: usize, fragment: &[u8]) -> Result<(), DecodeError> {
        let total = self.total();
        let slot = self.slots.get_mut(sequence).ok_or_else(|| {
            DecodeError::MalformedChunkHeader(format!(
                "sequence number {sequence} out of range for {total} chunks"
            ))
        })?;
        // A duplicate replaces the earlier fragment and still counts as received
        self.received_bytes = self.received_bytes - slot.len() + fragment.len();
        *slot = fragment.to_vec();
        self.received += 1;
        Ok(())
    }

    fn assemble(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.received_bytes);
        for slot in self.slots {
            buf.extend_from_slice(&slot);
        }
        buf
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn received(&self) -> usize {
        self.received
    }

    #[must_use]
    pub fn received_bytes(&self) -> usize {
        self.received_bytes
    }

    #[must_use]
    pub fn slot(&self, sequence: usize) -> Option<&[u8]> {
        self.slots.get(sequence).map(Vec::as_slice)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received >= self.slots.len()
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expiration
    }
}

/// Decodes GELF datagrams and owns the reassembly table of one listener.
#[derive(Debug, Default)]
pub struct GelfDecoder {
    chunks: HashMap<MessageId, ChunkSet, FnvBuildHasher>,
    last_cleanup: Option<Instant>,
}

impl GelfDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one datagram. Returns a message when the datagram completed one.
    pub fn handle(&mut self, buf: &[u8]) -> Result<Option<Message>, DecodeError> {
        self.handle_at(buf, Instant::now())
    }

    /// Same as [`GelfDecoder::handle`] with an explicit clock reading.
    pub fn handle_at(&mut self, buf: &[u8], now: Instant) -> Result<Option<Message>, DecodeError> {
        match buf {
            [] => Ok(None),
            [b'{', ..] => decode_document(buf.to_vec()).map(Some),
            _ if buf.starts_with(&CHUNK_MAGIC) => {
                let result = self.handle_chunk(buf, now);
                self.maybe_cleanup(now);
                result
            }
            _ => Err(DecodeError::MalformedChunkHeader(
                "datagram is neither a JSON document nor a GELF chunk".to_string(),
            )),
        }
    }

    fn handle_chunk(&mut self, buf: &[u8], now: Instant) -> Result<Option<Message>, DecodeError> {
        if buf.len() < CHUNK_HEADER_LEN {
            return Err(DecodeError::MalformedChunkHeader(format!(
                "chunk of {} bytes is shorter than its header",
                buf.len()
            )));
        }

        let mut id: MessageId = [0; 8];
        id.copy_from_slice(&buf[2..10]);
        let sequence = usize::from(buf[10]);
        let total = usize::from(buf[11]);
        let fragment = &buf[CHUNK_HEADER_LEN..];

        let chunk_set = match self.chunks.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if sequence >= total {
                    return Err(DecodeError::MalformedChunkHeader(format!(
                        "sequence number {sequence} out of range for {total} chunks"
                    )));
                }
                entry.insert(ChunkSet::new(total, now + CHUNK_EXPIRATION))
            }
        };
        chunk_set.store(sequence, fragment)?;
        trace!(
            "Stored chunk {}/{} of message {:02x?}",
            sequence + 1,
            chunk_set.total(),
            id
        );

        if !chunk_set.is_complete() {
            return Ok(None);
        }

        match self.chunks.remove(&id) {
            Some(chunk_set) => decode_document(chunk_set.assemble()).map(Some),
            None => Ok(None),
        }
    }

    fn maybe_cleanup(&mut self, now: Instant) {
        let due = match self.last_cleanup {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= CLEANUP_INTERVAL,
        };
        if due {
            self.last_cleanup = Some(now);
            self.cleanup(now);
        }
    }

    /// Drops every chunk set whose expiration has passed.
    pub fn cleanup(&mut self, now: Instant) {
        let before = self.chunks.len();
        self.chunks.retain(|_, chunk_set| !chunk_set.is_expired(now));
        let dropped = before - self.chunks.len();
        if dropped > 0 {
            debug!("Dropped {} incomplete GELF messages", dropped);
        }
    }

    /// Number of messages waiting for more chunks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn chunk_set(&self, id: &MessageId) -> Option<&ChunkSet> {
        self.chunks.get(id)
    }
}

impl Decoder for GelfDecoder {
    const PROTOCOL: &'static str = "GELF";
    const INVALID_COUNTER: &'static str = INVALID_GELF_MESSAGES;

    fn decode(&mut self, datagram: &[u8]) -> Result<Option<Message>, DecodeError> {
        self.handle(datagram)
    }
}

fn decode_document(raw: Vec<u8>) -> Result<Message, DecodeError> {
    let mut document = parse_object(&raw)?;
    normalize_gelf(&mut document);
    Ok(Message::new(raw, document))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ID: MessageId = [0x00, 0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef];

    fn chunk(id: MessageId, sequence: u8, total: u8, fragment: &str) -> Vec<u8> {
        let mut buf = CHUNK_MAGIC.to_vec();
        buf.extend_from_slice(&id);
        buf.push(sequence);
        buf.push(total);
        buf.extend_from_slice(fragment.as_bytes());
        buf
    }

    const FIRST_HALF: &str =
        r#"{"version":"1.1","host":"delivery-staging-us-east-1b-asg-general","test":"foobar""#;

    #[test]
    fn test_single_document() {
        let mut decoder = GelfDecoder::new();
        let message = decoder
            .handle(br#"{"version":"1.1","short_message":"main.main()","level":3}"#)
            .unwrap()
            .unwrap();

        assert_eq!(message.get_str("msg"), Some("main.main()"));
        assert_eq!(message.get_str("level"), Some("ERROR"));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_single_document_invalid_json() {
        let mut decoder = GelfDecoder::new();
        assert!(matches!(
            decoder.handle(b"{\"version\":"),
            Err(DecodeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_first_chunk_is_stored() {
        let mut decoder = GelfDecoder::new();
        let result = decoder.handle(&chunk(ID, 0, 2, FIRST_HALF)).unwrap();
        assert!(result.is_none());

        let chunk_set = decoder.chunk_set(&ID).unwrap();
        assert_eq!(chunk_set.received(), 1);
        assert_eq!(chunk_set.total(), 2);
        assert_eq!(chunk_set.slot(0).unwrap()[0], b'{');
        assert_eq!(chunk_set.received_bytes(), FIRST_HALF.len());
    }

    #[test]
    fn test_second_chunk_is_stored_at_its_sequence() {
        let mut decoder = GelfDecoder::new();
        decoder
            .handle(&chunk(ID, 1, 2, r#","test2":"hello"}"#))
            .unwrap();

        let chunk_set = decoder.chunk_set(&ID).unwrap();
        assert_eq!(chunk_set.received(), 1);
        assert_eq!(chunk_set.total(), 2);
        assert!(chunk_set.slot(0).unwrap().is_empty());
        assert_eq!(&chunk_set.slot(1).unwrap()[..2], b",\"");
    }

    #[test]
    fn test_complete_reassembly() {
        let mut decoder = GelfDecoder::new();
        let first = format!("{FIRST_HALF},\"level\":7");
        assert!(decoder.handle(&chunk(ID, 0, 2, &first)).unwrap().is_none());
        assert_eq!(decoder.pending(), 1);

        let message = decoder
            .handle(&chunk(ID, 1, 2, r#","test2":"hello"}"#))
            .unwrap()
            .unwrap();

        assert_eq!(message.get_str("test"), Some("foobar"));
        assert_eq!(message.get_str("test2"), Some("hello"));
        assert_eq!(message.get_str("level"), Some("DEBUG"));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut decoder = GelfDecoder::new();
        assert!(decoder
            .handle(&chunk(ID, 1, 2, r#","test2":"hello"}"#))
            .unwrap()
            .is_none());
        let message = decoder
            .handle(&chunk(ID, 0, 2, FIRST_HALF))
            .unwrap()
            .unwrap();

        assert_eq!(message.get_str("test"), Some("foobar"));
        assert_eq!(message.get_str("test2"), Some("hello"));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_interleaved_messages_are_isolated() {
        let other: MessageId = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut decoder = GelfDecoder::new();

        assert!(decoder.handle(&chunk(ID, 0, 2, r#"{"a":"#)).unwrap().is_none());
        assert!(decoder
            .handle(&chunk(other, 0, 2, r#"{"b":"#))
            .unwrap()
            .is_none());
        let first = decoder.handle(&chunk(other, 1, 2, "2}")).unwrap().unwrap();
        let second = decoder.handle(&chunk(ID, 1, 2, "1}")).unwrap().unwrap();

        assert_eq!(first.document["b"], 2);
        assert_eq!(second.document["a"], 1);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_single_chunk_message() {
        let mut decoder = GelfDecoder::new();
        let message = decoder
            .handle(&chunk(ID, 0, 1, r#"{"short_message":"hi"}"#))
            .unwrap()
            .unwrap();
        assert_eq!(message.get_str("msg"), Some("hi"));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_invalid_reassembled_json_removes_entry() {
        let mut decoder = GelfDecoder::new();
        decoder.handle(&chunk(ID, 0, 2, "{\"a\":")).unwrap();
        assert!(matches!(
            decoder.handle(&chunk(ID, 1, 2, "oops")),
            Err(DecodeError::MalformedPayload(_))
        ));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_sequence_out_of_range() {
        let mut decoder = GelfDecoder::new();
        assert!(matches!(
            decoder.handle(&chunk(ID, 2, 2, "{}")),
            Err(DecodeError::MalformedChunkHeader(_))
        ));
        assert_eq!(decoder.pending(), 0);

        decoder.handle(&chunk(ID, 0, 2, "{")).unwrap();
        assert!(matches!(
            decoder.handle(&chunk(ID, 7, 2, "}")),
            Err(DecodeError::MalformedChunkHeader(_))
        ));
        assert_eq!(decoder.chunk_set(&ID).unwrap().received(), 1);
    }

    #[test]
    fn test_zero_total_count() {
        let mut decoder = GelfDecoder::new();
        assert!(matches!(
            decoder.handle(&chunk(ID, 0, 0, "{}")),
            Err(DecodeError::MalformedChunkHeader(_))
        ));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_truncated_chunk_header() {
        let mut decoder = GelfDecoder::new();
        assert!(matches!(
            decoder.handle(&[0x1e, 0x0f, 0, 0, 0]),
            Err(DecodeError::MalformedChunkHeader(_))
        ));
    }

    #[test]
    fn test_unknown_frame() {
        let mut decoder = GelfDecoder::new();
        assert!(decoder.handle(b"").unwrap().is_none());
        assert!(matches!(
            decoder.handle(b"plain text"),
            Err(DecodeError::MalformedChunkHeader(_))
        ));
    }

    #[test]
    fn test_cleanup_removes_expired_sets() {
        let now = Instant::now();
        let mut decoder = GelfDecoder::new();
        decoder.handle_at(&chunk(ID, 0, 2, FIRST_HALF), now).unwrap();

        decoder.cleanup(now);
        assert_eq!(decoder.pending(), 1);

        decoder.cleanup(now + Duration::from_secs(6));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_cleanup_runs_at_most_every_five_seconds() {
        let now = Instant::now();
        let second: MessageId = [0, 0, 0, 0, 0xde, 0xad, 0, 0];
        let third: MessageId = [0, 0, 0, 0, 0, 0xad, 0xbe, 0xef];
        let fourth: MessageId = [9, 9, 9, 9, 9, 9, 9, 9];
        let mut decoder = GelfDecoder::new();

        // the first packet always triggers a pass
        decoder.handle_at(&chunk(ID, 0, 2, FIRST_HALF), now).unwrap();
        // five seconds later another pass runs, the first set expires right at this instant
        decoder
            .handle_at(&chunk(second, 0, 2, FIRST_HALF), now + CLEANUP_INTERVAL)
            .unwrap();
        assert_eq!(decoder.pending(), 2);

        // the first set is now expired, but the last pass was too recent
        decoder
            .handle_at(&chunk(third, 0, 2, FIRST_HALF), now + Duration::from_secs(6))
            .unwrap();
        assert_eq!(decoder.pending(), 3);
        assert!(decoder.chunk_set(&ID).is_some());

        // the next pass collects only the expired set
        decoder
            .handle_at(&chunk(fourth, 0, 2, FIRST_HALF), now + Duration::from_secs(10))
            .unwrap();
        assert_eq!(decoder.pending(), 3);
        assert!(decoder.chunk_set(&ID).is_none());
    }

    #[test]
    fn test_single_document_does_not_trigger_cleanup() {
        let now = Instant::now();
        let mut decoder = GelfDecoder::new();
        decoder.handle_at(&chunk(ID, 0, 2, FIRST_HALF), now).unwrap();

        decoder
            .handle_at(br#"{"short_message":"x"}"#, now + Duration::from_secs(30))
            .unwrap();
        assert_eq!(decoder.pending(), 1);
    }
}
