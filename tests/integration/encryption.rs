use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use disco_core::config::{ConfigOverrides, EncryptOverride, EncryptionOverrides};
use disco_services::{Disco, Payload};

use crate::*;

fn encrypted(port: u16, key: &str) -> ConfigOverrides {
    fast(port).layered(ConfigOverrides {
        encrypt: Some(EncryptOverride::Settings(EncryptionOverrides {
            key: Some(key.into()),
            context: None,
        })),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_encrypted_instances_see_each_other() -> Result<()> {
    let Some(port) = test_port().await else {
        eprintln!("SKIP: multicast not available");
        return Ok(());
    };

    let mut a = Disco::multicast(encrypted(port, "qwqweqweqweq"))?;
    let mut b = Disco::multicast(encrypted(port, "qwqweqweqweq"))?;
    assert!(a.transport().is_encrypted());

    for d in [&mut a, &mut b] {
        d.register_custom_broadcast(
            "message",
            Some(Duration::from_millis(100)),
            Payload::value("default discovery message"),
            None,
        );
    }
    let mut rx = a.subscribe();

    a.start().await?;
    b.start().await?;
    wait_until(Duration::from_secs(5), || {
        a.snapshot_peers().len() == 2 && b.snapshot_peers().len() == 2
    })
    .await?;

    let from_b: Vec<_> = drain_messages(&mut rx)
        .into_iter()
        .filter(|(topic, sender, _)| topic == "message" && sender == b.id())
        .collect();
    assert!(!from_b.is_empty());
    assert!(from_b
        .iter()
        .all(|(_, _, p)| p == &Some(json!("default discovery message"))));

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_different_keys_do_not_interfere() -> Result<()> {
    let Some(port) = test_port().await else {
        eprintln!("SKIP: multicast not available");
        return Ok(());
    };

    let mut sealed = Disco::multicast(encrypted(port, "one key"))?;
    let mut other = Disco::multicast(encrypted(port, "another key"))?;
    let mut plain = Disco::multicast(fast(port))?;

    sealed.start().await?;
    other.start().await?;
    plain.start().await?;
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(peer_ids(&sealed), vec![sealed.id().to_string()]);
    assert_eq!(peer_ids(&other), vec![other.id().to_string()]);
    assert_eq!(peer_ids(&plain), vec![plain.id().to_string()]);

    sealed.stop().await;
    other.stop().await;
    plain.stop().await;
    Ok(())
}
