// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Completes the envelope of decoded messages and picks their topic.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::message::{wrap_msg, Message};
use crate::publisher::Publisher;
use crate::stats::{StatsSink, APP_LOG_MESSAGES, UNKNOWN_SERVICE};

const VALID_LEVELS: [&str; 4] = ["DEBUG", "INFO", "WARN", "ERROR"];

/// Announces a relay start through the pipeline, as a log line of `service`.
#[must_use]
pub fn startup_message(service: &str) -> Message {
    startup_message_at(service, Utc::now())
}

/// Same as [`startup_message`] with an explicit clock reading.
#[must_use]
pub fn startup_message_at(service: &str, now: DateTime<Utc>) -> Message {
    let text = format!(
        "{service} starting at {}",
        now.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    let mut document = wrap_msg(&text);
    document.insert("service".to_string(), Value::String(service.to_string()));
    document.insert("level".to_string(), Value::String("INFO".to_string()));
    Message::new(text.into_bytes(), document)
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Reported as `host` when the message has none
    pub hostname: String,
    pub server_ip: Option<String>,
    pub topic_prefix: String,
    /// Used in place of the service name when the message has none
    pub default_topic: String,
}

pub struct Router {
    config: RouterConfig,
    stats: Arc<dyn StatsSink>,
}

impl Router {
    #[must_use]
    pub fn new(config: RouterConfig, stats: Arc<dyn StatsSink>) -> Self {
        Router { config, stats }
    }

    pub fn route(&self, message: &mut Message) {
        self.route_at(message, Utc::now());
    }

    /// Same as [`Router::route`] with an explicit clock reading.
    pub fn route_at(&self, message: &mut Message, now: DateTime<Utc>) {
        let document = &mut message.document;

        if !document.contains_key("ts") {
            let ts = now.to_rfc3339_opts(SecondsFormat::Nanos, true);
            document.insert("ts".to_string(), Value::String(ts));
        }
        if !document.contains_key("host") {
            document.insert(
                "host".to_string(),
                Value::String(self.config.hostname.clone()),
            );
        }
        if let Some(server_ip) = &self.config.server_ip {
            if !document.contains_key("server_ip") {
                document.insert("server_ip".to_string(), Value::String(server_ip.clone()));
            }
        }
        let valid_level = match document.get("level") {
            None => true,
            Some(Value::String(level)) => VALID_LEVELS.contains(&level.as_str()),
            Some(_) => false,
        };
        if !valid_level {
            document.insert("level".to_string(), Value::String("UNKNOWN".to_string()));
        }

        let service = match message.get_str("service") {
            Some(service) if !service.is_empty() => {
                self.count_level(service, message.get_str("level"));
                service
            }
            _ => {
                self.stats.incr(UNKNOWN_SERVICE, 1, 1.0);
                self.config.default_topic.as_str()
            }
        };
        message.topic = format!("{}.{}", self.config.topic_prefix, service);
        trace!("Routed message to {}", message.topic);
    }

    /// Counts messages per service and level. Debug lines are sampled more sparsely.
    fn count_level(&self, service: &str, level: Option<&str>) {
        let (level, rate) = match level {
            Some("DEBUG") => ("DEBUG", 0.1),
            Some(level) => (level, 1.0),
            None => ("OTHER", 0.4),
        };
        let name = format!("{APP_LOG_MESSAGES},service={service},level={level}");
        self.stats.incr(&name, 1, rate);
    }

    /// Routes and publishes everything received on `rx` until the channel closes.
    pub async fn run(self, mut rx: mpsc::Receiver<Message>, publisher: Publisher) {
        debug!("Router started");
        while let Some(mut message) = rx.recv().await {
            self.route(&mut message);
            let topic = message.topic.clone();
            // already counted by the publisher
            if let Err(e) = publisher.publish(message) {
                debug!("Dropped message for {topic}: {e}");
            }
        }
        debug!("Router stopped");
    }
}
