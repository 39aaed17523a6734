// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog frame decoding.
//!
//! Docker's syslog logging driver sends one datagram per log line, either with a legacy
//! BSD timestamp (`<27>Aug  7 18:33:19 HOST docker/name/id/image[pid]: text`) or with an
//! ISO-8601 timestamp (`<27>2016-06-09T04:47:45Z HOST docker/name/id/image[pid]: text`).
//! The tag carries the container metadata and the payload may itself be a JSON document.

use tracing::trace;

use crate::errors::DecodeError;
use crate::listener::Decoder;
use crate::message::{parse_object, wrap_msg, Document, Message};
use crate::normalize::apply_syslog_tag;
use crate::stats::INVALID_SYSLOG_MESSAGES;

// Splitting the header never needs more than this many fields
const MAX_HEADER_FIELDS: usize = 7;
// Legacy header: month, day (possibly empty when padded), time, host, tag, payload
const MIN_LEGACY_FIELDS: usize = 6;
// Longest priority is 3 digits, so '>' must appear at index 4 at the latest
const MAX_PRIORITY_END: usize = 5;

/// Priority value from the `<N>` header, split into facility and severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub priority: u16,
    pub facility: u16,
    pub severity: u16,
}

impl Priority {
    #[must_use]
    pub fn new(priority: u16) -> Self {
        Priority {
            priority,
            facility: priority / 8,
            severity: priority % 8,
        }
    }
}

/// Reads the leading `<N>` token. Returns the priority and the offset of the first byte after `>`.
pub fn extract_priority(buf: &[u8]) -> Result<(Priority, usize), DecodeError> {
    if buf.first() != Some(&b'<') {
        return Err(DecodeError::MalformedPriority("no priority start character"));
    }

    let mut value: u16 = 0;
    for (i, &c) in buf.iter().enumerate().skip(1) {
        if i >= MAX_PRIORITY_END {
            return Err(DecodeError::MalformedPriority(
                "no priority end character or priority too long",
            ));
        }
        match c {
            b'>' if i == 1 => return Err(DecodeError::MalformedPriority("priority too short")),
            b'>' => return Ok((Priority::new(value), i + 1)),
            b'0'..=b'9' => value = value * 10 + u16::from(c - b'0'),
            _ => return Err(DecodeError::MalformedPriority("priority was not a valid digit")),
        }
    }

    Err(DecodeError::MalformedPriority("no priority end character"))
}

/// The `docker/<name>/<id>/<image>[<pid>]:` syslog tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTag<'a> {
    pub marker: &'a str,
    pub container_name: &'a str,
    pub container_id: &'a str,
    pub image: &'a str,
}

impl<'a> ParsedTag<'a> {
    pub fn parse(field: &'a str) -> Result<Self, DecodeError> {
        let segments: Vec<&str> = field.splitn(4, '/').collect();
        match segments[..] {
            [marker, container_name, container_id, image] => Ok(ParsedTag {
                marker,
                container_name,
                container_id,
                image,
            }),
            _ => Err(DecodeError::MalformedTag(segments.len())),
        }
    }

    /// Image reference without the trailing `[pid]:` annotation.
    #[must_use]
    pub fn docker_image(&self) -> &'a str {
        match self.image.find('[') {
            Some(n) => &self.image[..n],
            None => self.image,
        }
    }
}

/// Decodes one syslog datagram into a canonical message.
pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
    let (_priority, cursor) = extract_priority(buf)?;
    let text = String::from_utf8_lossy(&buf[cursor..]);
    let parts: Vec<&str> = text.splitn(MAX_HEADER_FIELDS, ' ').collect();

    let (tag_field, payload) = if is_iso8601(parts[0]) {
        if parts.len() < 3 {
            return Err(DecodeError::MalformedHeader(
                "too few fields, assuming ISO8601 date format",
            ));
        }
        let payload = text.splitn(4, ' ').nth(3).unwrap_or_default();
        (parts[2], payload)
    } else {
        if parts.len() < MIN_LEGACY_FIELDS {
            return Err(DecodeError::MalformedHeader(
                "too few fields, assuming legacy date format",
            ));
        }
        (parts[5], parts.get(6).copied().unwrap_or_default())
    };

    let tag = ParsedTag::parse(tag_field)?;
    trace!("Syslog tag {:?}, payload {}", tag, payload);

    let mut document = parse_payload(payload);
    apply_syslog_tag(&mut document, &tag);

    Ok(Message::new(buf.to_vec(), document))
}

/// Listener-side decoder. Syslog messages always fit in one datagram.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyslogDecoder;

impl Decoder for SyslogDecoder {
    const PROTOCOL: &'static str = "syslog";
    const INVALID_COUNTER: &'static str = INVALID_SYSLOG_MESSAGES;

    fn decode(&mut self, datagram: &[u8]) -> Result<Option<Message>, DecodeError> {
        decode(datagram).map(Some)
    }
}

fn is_iso8601(field: &str) -> bool {
    field.len() > 18 && field.as_bytes()[10] == b'T'
}

/// Interprets the payload as JSON when it looks like JSON, falling back to a plain `msg`.
fn parse_payload(payload: &str) -> Document {
    let bytes = payload.as_bytes();

    let json = if bytes.first() == Some(&b'{') {
        Some(bytes)
    } else if bytes.len() > 25 && bytes[10] == b'T' && bytes[24] == b'{' {
        // ISO-8601 timestamp directly followed by a JSON document
        Some(&bytes[24..])
    } else {
        None
    };

    match json.map(parse_object) {
        Some(Ok(document)) => document,
        _ => wrap_msg(payload),
    }
}
