//! discod — Disco peer-discovery daemon.
//!
//! Usage: `discod [port]`
//!
//! Configuration comes from the config file, then DISCO_* environment
//! variables, then the optional port argument. Logging is controlled with
//! RUST_LOG, e.g. `RUST_LOG=discod=debug,disco_services=info`.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;

use disco_core::config::ConfigOverrides;
use disco_services::{Disco, DiscoEvent, MulticastTransport};

/// How often the membership view is logged.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let overrides = ConfigOverrides::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ConfigOverrides::default()
    });
    let overrides = match std::env::args().nth(1) {
        Some(arg) => {
            let port: u16 = arg
                .parse()
                .with_context(|| format!("invalid port argument {arg:?}"))?;
            overrides.layered(port.into())
        }
        None => overrides,
    };

    let mut disco = Disco::multicast(overrides).context("failed to set up discovery")?;
    tracing::info!(
        id = %disco.id(),
        port = disco.config().port,
        group = %disco.config().multicast_membership,
        host = ?disco.local_peer().host,
        "discod starting"
    );

    let mut events = disco.subscribe();
    disco
        .start()
        .await
        .with_context(|| format!("failed to start on port {}", disco.config().port))?;

    let mut snapshot = tokio::time::interval(SNAPSHOT_INTERVAL);
    snapshot.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to listen for ctrl-c");
                }
                tracing::info!("shutting down");
                break;
            }
            _ = snapshot.tick() => log_snapshot(&disco),
            event = events.recv() => match event {
                Ok(DiscoEvent::Message { topic, message }) => tracing::debug!(
                    topic = %topic,
                    sender = %message.node.id,
                    payload = ?message.payload,
                    "message received"
                ),
                Ok(DiscoEvent::Started | DiscoEvent::Stopped) => {
                    tracing::info!(status = %disco.status(), "status changed");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    disco.stop().await;
    Ok(())
}

fn log_snapshot(disco: &Disco<MulticastTransport>) {
    let peers = disco.snapshot_peers();
    tracing::info!(count = peers.len(), "membership");
    for peer in &peers {
        tracing::info!(
            peer = %peer.id(),
            host = peer.host.as_deref().unwrap_or("-"),
            port = ?peer.port,
            local = peer.id() == disco.id(),
            suspicion = %format!("{:.2}", peer.suspicion_score()),
            "  member"
        );
    }
}
