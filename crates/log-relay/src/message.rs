// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The canonical log message passed from the decoders to the router and publisher.

use serde_json::{Map, Value};

use crate::errors::PublishError;

/// Canonical JSON document. Always an object at top level.
pub type Document = Map<String, Value>;

/// A decoded log record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Bytes the document was decoded from
    pub raw: Vec<u8>,
    pub document: Document,
    /// Destination topic, empty until the router assigns one
    pub topic: String,
}

impl Message {
    #[must_use]
    pub fn new(raw: Vec<u8>, document: Document) -> Self {
        Message {
            raw,
            document,
            topic: String::new(),
        }
    }

    /// Returns the string value of a top-level field, if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.document.get(key).and_then(Value::as_str)
    }

    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) {
        self.document.insert(key.to_string(), value.into());
    }

    /// Serializes the document into the bytes published to the broker.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PublishError> {
        serde_json::to_vec(&self.document).map_err(|e| PublishError::Serialization(e.to_string()))
    }
}

/// Wraps a raw string as the `msg` field of a fresh document.
pub(crate) fn wrap_msg(text: &str) -> Document {
    let mut document = Document::new();
    document.insert("msg".to_string(), Value::String(text.to_string()));
    document
}

/// Parses `bytes` as a JSON object. Arrays and scalars are rejected.
pub(crate) fn parse_object(bytes: &[u8]) -> Result<Document, serde_json::Error> {
    serde_json::from_slice::<Document>(bytes)
}
