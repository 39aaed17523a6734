// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters reported by the pipeline. Emission is up to the sink implementation.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub const INVALID_SYSLOG_MESSAGES: &str = "log_relay.invalid_syslog_messages";
pub const INVALID_GELF_MESSAGES: &str = "log_relay.invalid_gelf_messages";
pub const PRODUCE_ERRORS: &str = "log_relay.produce_errors";
pub const UNKNOWN_SERVICE: &str = "log_relay.unknown_service";
pub const APP_STARTED: &str = "log_relay.app.started";
/// Prefix of the per-service counters, tagged as `,service=<name>,level=<level>`
pub const APP_LOG_MESSAGES: &str = "app.log.messages";

/// Anything able to count events, e.g. a statsd client.
pub trait StatsSink: Send + Sync {
    /// Increments counter `name` by `value`, sampled at `rate`.
    fn incr(&self, name: &str, value: i64, rate: f32);
}

/// Discards every counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn incr(&self, _name: &str, _value: i64, _rate: f32) {}
}

/// Keeps counters in memory. Sample rates are ignored.
#[derive(Debug, Default)]
pub struct CountingStats {
    counters: Mutex<HashMap<String, i64>>,
}

impl CountingStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> i64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Returns a sorted copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let mut counters: Vec<(String, i64)> = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        counters.sort();
        counters
    }
}

impl StatsSink for CountingStats {
    fn incr(&self, name: &str, value: i64, _rate: f32) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(name.to_string()).or_default() += value;
    }
}
