use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use disco_services::{Disco, Payload, Transport};

use crate::*;

#[tokio::test]
async fn test_two_instances_register_each_other() -> Result<()> {
    let Some(port) = test_port().await else {
        eprintln!("SKIP: multicast not available");
        return Ok(());
    };

    let mut a = Disco::multicast(fast(port))?;
    let mut b = Disco::multicast(fast(port))?;
    assert_ne!(a.id(), b.id());

    a.start().await?;
    b.start().await?;
    wait_until(Duration::from_secs(5), || {
        a.snapshot_peers().len() == 2 && b.snapshot_peers().len() == 2
    })
    .await?;

    assert_eq!(peer_ids(&a), peer_ids(&b));

    let b_at_a = a.peers().find(b.id()).expect("a should know b");
    assert_eq!(b_at_a.port, Some(port));
    assert!(b_at_a.host.is_some());

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_custom_broadcast_reaches_other_instance() -> Result<()> {
    let Some(port) = test_port().await else {
        eprintln!("SKIP: multicast not available");
        return Ok(());
    };

    let mut a = Disco::multicast(fast(port))?;
    let mut b = Disco::multicast(fast(port))?;
    a.register_custom_broadcast("disco:announce", None, Payload::value("hello"), None);

    let mut rx = b.subscribe();
    a.start().await?;
    b.start().await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let announces: Vec<_> = drain_messages(&mut rx)
        .into_iter()
        .filter(|(topic, _, _)| topic == "disco:announce")
        .collect();
    assert!(!announces.is_empty(), "b never heard a's announcement");
    for (_, sender, payload) in &announces {
        assert_eq!(sender, a.id());
        assert_eq!(payload, &Some(json!("hello")));
    }

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_restart_rejoins_group() -> Result<()> {
    let Some(port) = test_port().await else {
        eprintln!("SKIP: multicast not available");
        return Ok(());
    };

    let mut a = Disco::multicast(fast(port))?;
    for _ in 0..3 {
        a.start().await?;
        assert_eq!(a.transport().listener_count(), 1);
        a.stop().await;
        assert_eq!(a.transport().listener_count(), 0);
        assert_eq!(a.armed_count(), 0);
        assert!(a.transport().local_addr().is_none());
    }

    let mut rx = a.subscribe();
    a.start().await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        drain_messages(&mut rx).iter().any(|(_, sender, _)| sender == a.id()),
        "restarted instance should hear itself"
    );
    a.stop().await;
    Ok(())
}
