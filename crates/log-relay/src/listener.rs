// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP listener shared by the syslog and GELF inputs.
//!
//! Each listener owns its socket and its decoder. The receive call waits at most
//! [`RECV_DEADLINE`] so the loop can notice cancellation between datagrams. Decoded messages
//! are sent on a bounded channel; when the consumer falls behind the listener waits for it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::errors::DecodeError;
use crate::message::Message;
use crate::stats::StatsSink;

// Largest possible UDP payload, so datagrams are never truncated
const BUFFER_SIZE: usize = 65_507;

/// Upper bound on a single receive call before the cancellation token is checked again.
pub const RECV_DEADLINE: Duration = Duration::from_millis(100);

/// Turns datagrams into messages. Implementations may keep state across datagrams.
pub trait Decoder: Send {
    /// Protocol name used in logs.
    const PROTOCOL: &'static str;
    /// Counter incremented for every datagram that fails to decode.
    const INVALID_COUNTER: &'static str;

    /// Returns `Ok(None)` when the datagram was valid but did not complete a message.
    fn decode(&mut self, datagram: &[u8]) -> Result<Option<Message>, DecodeError>;
}

/// Address a listener binds to.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Host to bind UDP socket to (e.g., "0.0.0.0")
    pub host: String,
    /// Port to bind UDP socket to, 0 picks a free one
    pub port: u16,
}

enum BufferReader {
    UdpSocket {
        socket: tokio::net::UdpSocket,
        buf: Vec<u8>,
    },

    /// Replays queued datagrams, for tests
    #[allow(dead_code)]
    MirrorTest(VecDeque<Vec<u8>>, SocketAddr),
}

impl BufferReader {
    /// Returns `Ok(None)` when nothing arrived before the deadline.
    async fn read(&mut self) -> std::io::Result<Option<(Vec<u8>, SocketAddr)>> {
        match self {
            BufferReader::UdpSocket { socket, buf } => {
                match tokio::time::timeout(RECV_DEADLINE, socket.recv_from(buf)).await {
                    Err(_elapsed) => Ok(None),
                    Ok(Ok((amt, src))) => Ok(Some((buf[..amt].to_owned(), src))),
                    Ok(Err(e)) => Err(e),
                }
            }
            BufferReader::MirrorTest(datagrams, src) => {
                Ok(datagrams.pop_front().map(|datagram| (datagram, *src)))
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BufferReader::UdpSocket { socket, .. } => socket.local_addr().ok(),
            BufferReader::MirrorTest(..) => None,
        }
    }
}

/// Receives datagrams for one protocol and forwards decoded messages.
pub struct Listener<D: Decoder> {
    cancel_token: CancellationToken,
    buffer_reader: BufferReader,
    decoder: D,
    output: mpsc::Sender<Message>,
    stats: Arc<dyn StatsSink>,
}

impl<D: Decoder> Listener<D> {
    /// Binds the UDP socket described by `config`.
    pub async fn new(
        config: &ListenerConfig,
        decoder: D,
        output: mpsc::Sender<Message>,
        stats: Arc<dyn StatsSink>,
        cancel_token: CancellationToken,
    ) -> std::io::Result<Listener<D>> {
        let addr = format!("{}:{}", config.host, config.port);
        let socket = tokio::net::UdpSocket::bind(addr).await?;

        Ok(Listener {
            cancel_token,
            buffer_reader: BufferReader::UdpSocket {
                socket,
                buf: vec![0; BUFFER_SIZE],
            },
            decoder,
            output,
            stats,
        })
    }

    /// Address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.buffer_reader.local_addr()
    }

    /// Receives until the cancellation token fires or the output channel is closed.
    pub async fn spin(mut self) {
        debug!("{} listener started", D::PROTOCOL);
        while !self.cancel_token.is_cancelled() {
            if !self.consume().await {
                break;
            }
        }
        debug!("{} listener stopped", D::PROTOCOL);
    }

    /// Handles at most one datagram. Returns false once the listener should stop.
    async fn consume(&mut self) -> bool {
        let (buf, src) = match self.buffer_reader.read().await {
            Ok(Some(datagram)) => datagram,
            Ok(None) => return true,
            Err(e) => {
                warn!("{} listener failed to receive datagram: {}", D::PROTOCOL, e);
                return true;
            }
        };
        trace!("Received {} bytes from {}", buf.len(), src);

        let message = match self.decoder.decode(&buf) {
            Ok(Some(message)) => message,
            Ok(None) => return true,
            Err(e) => {
                self.stats.incr(D::INVALID_COUNTER, 1, 0.1);
                error!("Failed to decode {} message from {}: {}", D::PROTOCOL, src, e);
                return true;
            }
        };

        tokio::select! {
            sent = self.output.send(message) => {
                if sent.is_err() {
                    debug!("{} listener output closed", D::PROTOCOL);
                    return false;
                }
                true
            }
            _ = self.cancel_token.cancelled() => false,
        }
    }
}
