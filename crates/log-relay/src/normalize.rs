// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Field normalization rules, one ruleset per source protocol.
//!
//! Both rulesets leave the document with the canonical `container_name`, `container_id`,
//! `docker_image`, `msg` and string `level` fields whenever the source carried them.

use serde_json::Value;

use crate::message::{parse_object, Document};
use crate::syslog::ParsedTag;

/// Overlays the container metadata from a syslog tag, replacing same-named payload fields.
pub fn apply_syslog_tag(document: &mut Document, tag: &ParsedTag<'_>) {
    document.insert(
        "container_name".to_string(),
        Value::String(tag.container_name.to_string()),
    );
    document.insert(
        "container_id".to_string(),
        Value::String(tag.container_id.to_string()),
    );
    document.insert(
        "docker_image".to_string(),
        Value::String(tag.docker_image().to_string()),
    );
}

/// Maps a numeric GELF level to its label.
#[must_use]
pub fn level_label(level: f64) -> &'static str {
    if level.fract() != 0.0 {
        return "UNKNOWN";
    }
    match level as i64 {
        3 => "ERROR",
        4 => "WARN",
        6 => "INFO",
        7 => "DEBUG",
        _ => "UNKNOWN",
    }
}

/// Converts a parsed GELF document into the canonical schema.
pub fn normalize_gelf(document: &mut Document) {
    canonicalize_fields(document);

    match document.remove("short_message") {
        Some(Value::String(short_message)) => {
            if merge_embedded_json(document, &short_message) {
                // the embedded object can bring the raw GELF fields back
                canonicalize_fields(document);
            } else {
                document.insert("msg".to_string(), Value::String(short_message));
            }
        }
        Some(other) => {
            document.insert("msg".to_string(), Value::String(other.to_string()));
        }
        None => {}
    }

    resolve_tag(document);

    if !matches!(document.get("docker_image"), Some(Value::String(_))) {
        if let Some(image_name) = document.get("_image_name").and_then(Value::as_str) {
            let image = image_name.replacen("@sha256", "", 1);
            document.insert("docker_image".to_string(), Value::String(image));
        }
    }
}

/// Renames `_container_name`, labels numeric levels and drops the GELF timestamp.
fn canonicalize_fields(document: &mut Document) {
    if let Some(Value::String(name)) = document.remove("_container_name") {
        document.insert("container_name".to_string(), Value::String(name));
    }

    if let Some(level) = document.get("level").and_then(Value::as_f64) {
        document.insert(
            "level".to_string(),
            Value::String(level_label(level).to_string()),
        );
    }

    // A canonical timestamp is assigned later by the router
    document.remove("timestamp");
}

/// Merges `short_message` into the document when it holds a JSON object.
fn merge_embedded_json(document: &mut Document, short_message: &str) -> bool {
    if !short_message.trim_start().starts_with('{') {
        return false;
    }
    let Ok(mut embedded) = parse_object(short_message.as_bytes()) else {
        return false;
    };

    // only one level of embedding is unwrapped
    if let Some(nested) = embedded.remove("short_message") {
        if !embedded.contains_key("msg") {
            let msg = match nested {
                Value::String(text) => text,
                other => other.to_string(),
            };
            embedded.insert("msg".to_string(), Value::String(msg));
        }
    }
    document.extend(embedded);
    true
}

/// Expands `_tag` values of the form `key1=value1,key2=value2` into top-level fields.
fn resolve_tag(document: &mut Document) {
    let Some(tag) = document
        .get("_tag")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return;
    };

    let mut replaced = false;
    for part in tag.split(',') {
        let kv: Vec<&str> = part.split('=').collect();
        if let [key, value] = kv[..] {
            document.insert(key.to_string(), Value::String(value.to_string()));
            replaced = true;
        }
    }

    if replaced {
        document.remove("_tag");
    }
}
