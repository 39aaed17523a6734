// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use log_relay::{
    gelf::GelfDecoder,
    publisher::Publisher,
    router::{startup_message, Router, RouterConfig},
    stats::{CountingStats, StatsSink, APP_STARTED},
    syslog::SyslogDecoder,
    transport::InMemoryTransport,
    Decoder, Listener, ListenerConfig, Message, ServerConfig,
};

const APP_NAME: &str = "log-relay";

#[tokio::main]
pub async fn main() {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            // logging is not set up yet
            eprintln!("Error loading log relay configuration: {e}");
            return;
        }
    };

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Setting default subscriber failed: {e}");
        return;
    }

    debug!("Logging subsystem enabled");

    let hostname = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            error!("Unable to resolve hostname, shutting down: {e}");
            return;
        }
    };
    let partition_key = config
        .partition_key
        .clone()
        .unwrap_or_else(|| hostname.clone());

    let stats = Arc::new(CountingStats::new());
    let cancel_token = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<Message>(config.channel_capacity);

    stats.incr(APP_STARTED, 1, 1.0);
    // picked up by the router once it starts
    if tx.send(startup_message(APP_NAME)).await.is_err() {
        error!("Unable to queue startup message");
    }

    let syslog_handle = match start_listener(
        &config,
        config.syslog_port,
        SyslogDecoder,
        tx.clone(),
        stats.clone(),
        cancel_token.clone(),
    )
    .await
    {
        Some(handle) => handle,
        None => return,
    };
    let gelf_handle = match start_listener(
        &config,
        config.gelf_port,
        GelfDecoder::new(),
        tx,
        stats.clone(),
        cancel_token.clone(),
    )
    .await
    {
        Some(handle) => handle,
        None => {
            cancel_token.cancel();
            return;
        }
    };

    let (transport, mut records) =
        InMemoryTransport::new(config.partitions, config.channel_capacity);
    let (publisher, publisher_service, reporter) = Publisher::new(
        transport,
        partition_key.into_bytes(),
        config.channel_capacity,
        stats.clone(),
    );
    let router = Router::new(
        RouterConfig {
            hostname,
            server_ip: config.server_ip.clone(),
            topic_prefix: config.topic_prefix.clone(),
            default_topic: config.default_topic.clone(),
        },
        stats.clone(),
    );

    let router_handle = tokio::spawn(router.run(rx, publisher));
    let publisher_handle = tokio::spawn(publisher_service.run());
    let reporter_handle = tokio::spawn(reporter.run());
    // No broker client is linked in, records go to stdout
    let drain_handle = tokio::spawn(async move {
        while let Some(record) = records.recv().await {
            println!("{}", String::from_utf8_lossy(&record.value));
        }
    });

    info!(
        "log relay started, syslog on {}:{}, GELF on {}:{}",
        config.host, config.syslog_port, config.host, config.gelf_port
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }
    info!("Shutting down log relay");
    cancel_token.cancel();

    for handle in [
        syslog_handle,
        gelf_handle,
        router_handle,
        publisher_handle,
        reporter_handle,
        drain_handle,
    ] {
        if let Err(e) = handle.await {
            error!("Task failed during shutdown: {e}");
        }
    }

    for (name, value) in stats.snapshot() {
        debug!("{name}: {value}");
    }
}

async fn start_listener<D: Decoder + 'static>(
    config: &ServerConfig,
    port: u16,
    decoder: D,
    output: mpsc::Sender<Message>,
    stats: Arc<dyn StatsSink>,
    cancel_token: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    let listener_config = ListenerConfig {
        host: config.host.clone(),
        port,
    };
    match Listener::new(&listener_config, decoder, output, stats, cancel_token).await {
        Ok(listener) => {
            info!("{}: starting to listen on port {}", D::PROTOCOL, port);
            Some(tokio::spawn(listener.spin()))
        }
        Err(e) => {
            error!("Unable to bind {} listener on port {}: {e}", D::PROTOCOL, port);
            None
        }
    }
}
