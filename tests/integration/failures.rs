use std::net::UdpSocket;

use anyhow::Result;

use disco_services::{Disco, DiscoError, Status, Transport, TransportError};

/// A port held by a socket without SO_REUSEADDR cannot be shared, so
/// start must fail, leave the instance stopped and clean, and be retryable.
#[tokio::test]
async fn test_start_fails_when_port_is_taken() -> Result<()> {
    let holder = UdpSocket::bind("0.0.0.0:0")?;
    let port = holder.local_addr()?.port();

    let mut disco = Disco::multicast(port)?;
    let err = disco.start().await.expect_err("bind should conflict");
    assert!(
        matches!(err, DiscoError::Transport(TransportError::Bind(_))),
        "unexpected error: {err}"
    );
    assert_eq!(disco.status(), Status::Stopped);
    assert_eq!(disco.transport().listener_count(), 0);
    assert_eq!(disco.armed_count(), 0);

    // Still stopped and still retryable after a second failure.
    assert!(disco.start().await.is_err());
    assert_eq!(disco.status(), Status::Stopped);

    drop(holder);
    Ok(())
}

#[tokio::test]
async fn test_stop_without_start_is_a_no_op() -> Result<()> {
    let mut disco = Disco::multicast(0u16)?;
    let mut rx = disco.subscribe();
    disco.stop().await;
    assert_eq!(disco.status(), Status::Stopped);
    assert!(rx.try_recv().is_err());
    Ok(())
}
