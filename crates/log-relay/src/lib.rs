// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP log ingestion for container platforms.
//!
//! Two listeners accept syslog and GELF datagrams emitted by the Docker logging drivers,
//! decode them into a canonical JSON document, and hand the result to a [`router::Router`]
//! that completes the envelope and forwards it to a [`publisher::Publisher`]. GELF messages
//! split over several datagrams are reassembled by [`gelf::GelfDecoder`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod errors;
pub mod gelf;
pub mod listener;
pub mod message;
pub mod normalize;
pub mod partition;
pub mod publisher;
pub mod router;
pub mod stats;
pub mod syslog;
pub mod transport;

pub use config::ServerConfig;
pub use errors::{ConfigError, DecodeError, PartitionError, PublishError};
pub use listener::{Decoder, Listener, ListenerConfig};
pub use message::{Document, Message};
