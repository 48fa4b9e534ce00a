//! Disco integration test harness.
//!
//! Tests here run real coordinators over UDP multicast on the loopback
//! path of this host. Each test picks its own random port, so tests can
//! run in parallel without hearing each other.
//!
//!   cargo test --test integration
//!
//! Hosts without multicast (some containers, sandboxes) make the
//! network tests print SKIP and pass.

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{sleep, timeout, Instant};

use disco_core::config::{random_port, ConfigOverrides};
use disco_services::{Disco, DiscoEvent, MulticastTransport};

mod discovery;
mod encryption;
mod failures;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Overrides for a fast-announcing instance on `port`.
pub fn fast(port: u16) -> ConfigOverrides {
    ConfigOverrides {
        port: Some(port),
        discovery_interval_ms: Some(50),
        default_interval_ms: Some(100),
        ..Default::default()
    }
}

/// Check whether multicast loopback works here.
///
/// Starts a throwaway instance on `port` and waits for it to hear its own
/// discovery announcement.
pub async fn multicast_available(port: u16) -> bool {
    let Ok(mut candidate) = Disco::multicast(fast(port)) else {
        return false;
    };
    let mut events = candidate.subscribe();
    if candidate.start().await.is_err() {
        return false;
    }

    let id = candidate.id().to_string();
    let heard = timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(DiscoEvent::Message { message, .. }) if message.node.id == id => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    candidate.stop().await;
    heard
}

/// A fresh port for one test, plus whether the network tests can run on it.
pub async fn test_port() -> Option<u16> {
    let port = random_port();
    if multicast_available(port).await {
        Some(port)
    } else {
        None
    }
}

/// Poll `check` every 20ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + limit;
    while !check() {
        if Instant::now() >= deadline {
            bail!("condition not met within {limit:?}");
        }
        sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Sorted peer ids known to `disco`.
pub fn peer_ids(disco: &Disco<MulticastTransport>) -> Vec<String> {
    let mut ids: Vec<String> = disco
        .snapshot_peers()
        .iter()
        .map(|p| p.id().to_string())
        .collect();
    ids.sort();
    ids
}

/// Messages buffered for an observer, as `(topic, sender id, payload)`.
pub fn drain_messages(
    rx: &mut tokio::sync::broadcast::Receiver<DiscoEvent>,
) -> Vec<(String, String, Option<serde_json::Value>)> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(DiscoEvent::Message { topic, message }) => {
                out.push((topic, message.node.id, message.payload))
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(_) => return out,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Verify a lone instance hears its own announcements.
#[tokio::test]
async fn test_multicast_loopback() {
    let port = random_port();
    if !multicast_available(port).await {
        eprintln!("SKIP: multicast loopback not available on this host");
        return;
    }
    println!("multicast loopback works on port {port}");
}
