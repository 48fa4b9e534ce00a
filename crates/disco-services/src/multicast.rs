//! UDP IPv4 multicast transport.
//!
//! Every member binds the same port with SO_REUSEADDR and joins the
//! configured group, so several instances can share one host. Outbound
//! announcements are sent to `group:port`; a receive loop decodes inbound
//! datagrams and hands them to the topic listeners.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use disco_core::config::DiscoConfig;
use disco_core::crypto::AnnounceCipher;
use disco_core::wire::{encode_packet, Envelope, Message, PacketDecoder, MAX_DATAGRAM};

use crate::transport::{Inbound, Listener, TopicListeners, Transport, TransportError};

/// Multicast group membership for one coordinator.
pub struct MulticastTransport {
    config: Arc<DiscoConfig>,
    cipher: Option<Arc<AnnounceCipher>>,
    listeners: TopicListeners,
    running: Mutex<Option<Running>>,
}

struct Running {
    socket: Arc<UdpSocket>,
    receiver: JoinHandle<()>,
}

impl MulticastTransport {
    /// Build the transport. Fails only if encryption is configured and the
    /// cipher cannot be set up. No socket is opened until `begin`.
    pub fn new(config: Arc<DiscoConfig>) -> Result<Self, TransportError> {
        let cipher = match &config.encrypt {
            Some(settings) => {
                let cipher = AnnounceCipher::new(settings)?;
                tracing::debug!(key = %cipher.fingerprint(), "announcement encryption enabled");
                Some(Arc::new(cipher))
            }
            None => None,
        };
        Ok(Self {
            config,
            cipher,
            listeners: TopicListeners::new(),
            running: Mutex::new(None),
        })
    }

    /// Destination of every announcement.
    pub fn group_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.config.multicast_membership, self.config.port)
    }

    /// Bound address while begun.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running()
            .as_ref()
            .and_then(|r| r.socket.local_addr().ok())
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.running().as_ref().map(|r| r.socket.clone())
    }
}

impl Transport for MulticastTransport {
    async fn begin(&self) -> Result<(), TransportError> {
        if self.running().is_some() {
            return Ok(());
        }

        let socket = make_group_socket(&self.config)?;
        let socket = Arc::new(UdpSocket::from_std(socket).map_err(TransportError::Bind)?);

        let receiver = tokio::spawn(receive_loop(
            socket.clone(),
            self.listeners.clone(),
            self.cipher.clone(),
        ));

        tracing::info!(
            group = %self.group_addr(),
            bind = %SocketAddrV4::new(self.config.address, self.config.port),
            ttl = self.config.multicast_ttl,
            loopback = self.config.multicast_loopback,
            encrypted = self.is_encrypted(),
            "multicast transport started"
        );

        let previous = self.running().replace(Running { socket, receiver });
        if let Some(previous) = previous {
            previous.receiver.abort();
        }
        Ok(())
    }

    async fn end(&self) {
        let running = self.running().take();
        if let Some(running) = running {
            running.receiver.abort();
            tracing::info!(group = %self.group_addr(), "multicast transport stopped");
        }
    }

    fn subscribe(&self, topic: &str, listener: Listener) {
        self.listeners.subscribe(topic, listener);
    }

    fn unsubscribe_all(&self, topic: &str) {
        self.listeners.unsubscribe_all(topic);
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        let socket = self.socket().ok_or(TransportError::NotStarted)?;
        let envelope = Envelope {
            topic: topic.to_string(),
            message,
        };
        let packet = encode_packet(&envelope, self.cipher.as_deref())?;

        let sent = socket
            .send_to(&packet, SocketAddr::V4(self.group_addr()))
            .await
            .map_err(TransportError::Send)?;
        tracing::trace!(topic, bytes = sent, "announcement sent");
        Ok(())
    }

    fn listener_count(&self) -> usize {
        self.listeners.count()
    }

    fn local_host(&self) -> Option<String> {
        if !self.config.address.is_unspecified() {
            return Some(self.config.address.to_string());
        }
        outbound_ipv4(self.group_addr()).map(|ip| ip.to_string())
    }
}

impl Drop for MulticastTransport {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.receiver.abort();
        }
    }
}

impl std::fmt::Debug for MulticastTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastTransport")
            .field("group", &self.group_addr())
            .field("encrypted", &self.is_encrypted())
            .field("listeners", &self.listeners.count())
            .field("running", &self.running().is_some())
            .finish()
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

/// Decode datagrams and hand them to the topic listeners.
///
/// Replay state lives for one `begin`/`end` cycle. Runs until aborted by `end`.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    listeners: TopicListeners,
    cipher: Option<Arc<AnnounceCipher>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut decoder = PacketDecoder::new(cipher);

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };

        match decoder.decode(&buf[..len]) {
            Ok(envelope) => {
                let inbound = Inbound {
                    topic: envelope.topic,
                    message: envelope.message,
                };
                let delivered = listeners.deliver(&inbound);
                tracing::trace!(
                    from = %from,
                    topic = %inbound.topic,
                    sender = %inbound.message.node.id,
                    delivered,
                    "announcement received"
                );
            }
            Err(e) => {
                tracing::trace!(from = %from, bytes = len, error = %e, "dropping datagram");
            }
        }
    }
}

// ── Socket setup ──────────────────────────────────────────────────────────────

/// Create a UDP socket bound to `address:port` and joined to the group.
fn make_group_socket(config: &DiscoConfig) -> Result<std::net::UdpSocket, TransportError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(TransportError::Bind)?;

    socket.set_reuse_address(true).map_err(TransportError::Bind)?;
    socket.set_nonblocking(true).map_err(TransportError::Bind)?;

    let bind_addr = SocketAddrV4::new(config.address, config.port);
    socket
        .bind(&bind_addr.into())
        .map_err(TransportError::Bind)?;

    let interface = config.multicast_interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket
        .join_multicast_v4(&config.multicast_membership, &interface)
        .map_err(TransportError::Join)?;
    if let Some(interface) = config.multicast_interface {
        socket
            .set_multicast_if_v4(&interface)
            .map_err(TransportError::Join)?;
    }
    socket
        .set_multicast_loop_v4(config.multicast_loopback)
        .map_err(TransportError::Join)?;
    socket
        .set_multicast_ttl_v4(config.multicast_ttl)
        .map_err(TransportError::Join)?;

    Ok(socket.into())
}

/// The local IPv4 address the OS would use to reach `dest`.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn outbound_ipv4(dest: SocketAddrV4) -> Option<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    probe.connect(dest).ok()?;
    match probe.local_addr().ok()? {
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() => Some(*v4.ip()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disco_core::config::{ConfigOverrides, EncryptOverride, EncryptionOverrides};
    use disco_core::wire::PeerInfo;

    fn config(overrides: ConfigOverrides) -> Arc<DiscoConfig> {
        Arc::new(DiscoConfig::resolve(overrides))
    }

    #[test]
    fn group_addr_uses_membership_and_port() {
        let transport = MulticastTransport::new(config(ConfigOverrides {
            port: Some(50_500),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(
            transport.group_addr(),
            SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 50_500)
        );
        assert!(!transport.is_encrypted());
        assert!(transport.local_addr().is_none());
    }

    #[test]
    fn encryption_settings_build_a_cipher() {
        let transport = MulticastTransport::new(config(ConfigOverrides {
            encrypt: Some(EncryptOverride::Settings(EncryptionOverrides {
                key: Some("qwqweqweqweq".into()),
                context: None,
            })),
            ..Default::default()
        }))
        .unwrap();
        assert!(transport.is_encrypted());
    }

    #[test]
    fn explicit_bind_address_is_the_local_host() {
        let transport = MulticastTransport::new(config(ConfigOverrides {
            address: Some(Ipv4Addr::new(10, 1, 2, 3)),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(transport.local_host().as_deref(), Some("10.1.2.3"));
    }

    #[tokio::test]
    async fn publish_before_begin_is_refused() {
        let transport = MulticastTransport::new(config(ConfigOverrides::default())).unwrap();
        let result = transport
            .publish(
                "discovery",
                Message {
                    node: PeerInfo::new("a"),
                    payload: None,
                },
            )
            .await;
        assert!(matches!(result, Err(TransportError::NotStarted)));
    }

    #[tokio::test]
    async fn end_without_begin_is_a_no_op() {
        let transport = MulticastTransport::new(config(ConfigOverrides::default())).unwrap();
        transport.end().await;
        transport.end().await;
        assert!(transport.local_addr().is_none());
    }
}
