//! Group-communication transport: the publish/subscribe channel announcements ride on.
//!
//! The coordinator talks to a `Transport` only through this trait. Two
//! implementations ship: `MulticastTransport` (UDP IPv4 multicast, in
//! `multicast.rs`) and `MemoryHub`, an in-process group used by tests.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use disco_core::crypto::CryptoError;
use disco_core::wire::{Message, WireError};

/// A message delivered to a listener, tagged with its topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub topic: String,
    pub message: Message,
}

/// Listener half handed to `Transport::subscribe`.
pub type Listener = mpsc::UnboundedSender<Inbound>;

/// A best-effort publish/subscribe group.
///
/// Methods take `&self`: the coordinator shares the transport with its
/// timer tasks behind an `Arc`.
pub trait Transport: Send + Sync + 'static {
    /// Join the group. Resolves once the transport can publish and receive.
    fn begin(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Leave the group and release the socket. Idempotent.
    fn end(&self) -> impl Future<Output = ()> + Send;

    /// Deliver every inbound message on `topic` to `listener`.
    fn subscribe(&self, topic: &str, listener: Listener);

    /// Drop every listener on `topic`.
    fn unsubscribe_all(&self, topic: &str);

    /// Send `message` to every member on `topic`. Best effort.
    fn publish(
        &self,
        topic: &str,
        message: Message,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Listeners currently registered, across all topics.
    fn listener_count(&self) -> usize;

    /// Address peers should use to reach this instance, if known.
    fn local_host(&self) -> Option<String> {
        None
    }
}

// ── Listener table ────────────────────────────────────────────────────────────

/// Topic → listeners. Shared by both transports.
#[derive(Debug, Clone, Default)]
pub struct TopicListeners {
    topics: Arc<DashMap<String, Vec<Listener>>>,
}

impl TopicListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, listener: Listener) {
        self.topics.entry(topic.to_string()).or_default().push(listener);
    }

    pub fn unsubscribe_all(&self, topic: &str) {
        self.topics.remove(topic);
    }

    pub fn clear(&self) {
        self.topics.clear();
    }

    pub fn count(&self) -> usize {
        self.topics.iter().map(|t| t.value().len()).sum()
    }

    /// Hand `inbound` to every listener on its topic.
    ///
    /// Listeners whose receiver is gone are pruned. Returns how many got it.
    pub fn deliver(&self, inbound: &Inbound) -> usize {
        let Some(mut listeners) = self.topics.get_mut(&inbound.topic) else {
            return 0;
        };
        listeners.retain(|l| l.send(inbound.clone()).is_ok());
        listeners.len()
    }
}

// ── In-process hub ────────────────────────────────────────────────────────────

/// An in-process group. Every transport handed out by one hub sees every
/// other's publishes once begun, including its own (like multicast loopback).
///
/// Delivery is synchronous, so under tokio's paused clock a test observes
/// exactly the publishes its timers produced.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    members: Arc<DashMap<u64, TopicListeners>>,
    next_member: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, not yet begun member of this hub.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            member: self.next_member.fetch_add(1, Ordering::Relaxed),
            listeners: TopicListeners::new(),
            begun: AtomicBool::new(false),
            refuse_begin: AtomicBool::new(false),
        }
    }

    /// Members currently begun.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    fn broadcast(&self, inbound: &Inbound) -> usize {
        self.members
            .iter()
            .map(|member| member.value().deliver(inbound))
            .sum()
    }
}

/// One member of a `MemoryHub`.
#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    member: u64,
    listeners: TopicListeners,
    begun: AtomicBool,
    refuse_begin: AtomicBool,
}

impl MemoryTransport {
    /// While set, `begin` fails with an address-in-use bind error.
    pub fn refuse_begin(&self, refuse: bool) {
        self.refuse_begin.store(refuse, Ordering::SeqCst);
    }

    pub fn is_begun(&self) -> bool {
        self.begun.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    async fn begin(&self) -> Result<(), TransportError> {
        if self.refuse_begin.load(Ordering::SeqCst) {
            return Err(TransportError::Bind(std::io::Error::from(
                std::io::ErrorKind::AddrInUse,
            )));
        }
        if !self.begun.swap(true, Ordering::SeqCst) {
            self.hub.members.insert(self.member, self.listeners.clone());
            tracing::trace!(member = self.member, "memory transport joined hub");
        }
        Ok(())
    }

    async fn end(&self) {
        if self.begun.swap(false, Ordering::SeqCst) {
            self.hub.members.remove(&self.member);
            tracing::trace!(member = self.member, "memory transport left hub");
        }
    }

    fn subscribe(&self, topic: &str, listener: Listener) {
        self.listeners.subscribe(topic, listener);
    }

    fn unsubscribe_all(&self, topic: &str) {
        self.listeners.unsubscribe_all(topic);
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        if !self.is_begun() {
            return Err(TransportError::NotStarted);
        }
        let delivered = self.hub.broadcast(&Inbound {
            topic: topic.to_string(),
            message,
        });
        tracing::trace!(member = self.member, topic, delivered, "memory publish");
        Ok(())
    }

    fn listener_count(&self) -> usize {
        self.listeners.count()
    }

    fn local_host(&self) -> Option<String> {
        Some("127.0.0.1".into())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind group socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("failed to join multicast group: {0}")]
    Join(#[source] std::io::Error),
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error("transport not started")]
    NotStarted,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
