//! Discovery coordinator: lifecycle and wiring.
//!
//! A `Disco` owns the resolved configuration, the local identity, the peer
//! and task registries and one transport. `start` subscribes a listener per
//! task topic, begins the transport and arms every timer; `stop` undoes all
//! three. Inbound messages from every topic funnel into a single dispatcher
//! task and are handled strictly one at a time:
//!
//!   merge sender into peers → custom handler (if any) → observers
//!
//! Observers receive `DiscoEvent`s over a tokio broadcast channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use disco_core::config::{ConfigOverrides, DiscoConfig};
use disco_core::wire::{Message, PeerInfo, DISCOVERY_TOPIC};

use crate::broadcast::{BroadcastTask, MessageHandler, Payload, TaskRegistry, TickFn};
use crate::liveness::{LivenessFactory, PhiAccrualFactory};
use crate::multicast::MulticastTransport;
use crate::peer::{MergeOutcome, Peer, PeerError, PeerRegistry};
use crate::transport::{Inbound, MemoryHub, MemoryTransport, Transport, TransportError};

/// Buffered observer events before slow subscribers start lagging.
pub const EVENT_CAPACITY: usize = 1024;

// ── Status & events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Started,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Stopped => "stopped",
            Status::Started => "started",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications delivered to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoEvent {
    Started,
    Stopped,
    /// A message received on a subscribed topic, after the registry merge
    /// and any custom handler.
    Message { topic: String, message: Message },
}

// ── Coordinator ───────────────────────────────────────────────────────────────

pub struct Disco<T: Transport> {
    config: Arc<DiscoConfig>,
    local: PeerInfo,
    transport: Arc<T>,
    peers: PeerRegistry,
    tasks: TaskRegistry,
    status: Status,
    events: broadcast::Sender<DiscoEvent>,
    /// Sender handed to the transport for every topic while started.
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Disco<MulticastTransport> {
    /// Resolve `overrides` (a bare port or a partial configuration) and
    /// build a coordinator on UDP multicast.
    pub fn multicast(overrides: impl Into<ConfigOverrides>) -> Result<Self, DiscoError> {
        Self::new(DiscoConfig::resolve(overrides), MulticastTransport::new)
    }
}

impl Disco<MemoryTransport> {
    /// Build a coordinator that is a member of an in-process hub.
    pub fn in_memory(
        hub: &MemoryHub,
        overrides: impl Into<ConfigOverrides>,
    ) -> Result<Self, DiscoError> {
        Self::new(DiscoConfig::resolve(overrides), |_| Ok(hub.transport()))
    }
}

impl<T: Transport> Disco<T> {
    /// Build a coordinator. An unset port or id in `config` is filled in
    /// first, and `transport` is built from that same resolved snapshot, so
    /// the socket binds the port the instance announces.
    pub fn new<F>(config: DiscoConfig, transport: F) -> Result<Self, DiscoError>
    where
        F: FnOnce(Arc<DiscoConfig>) -> Result<T, TransportError>,
    {
        let config = Arc::new(config.resolved());
        let liveness = Arc::new(PhiAccrualFactory::new(config.liveness.clone()));
        let transport = transport(config.clone())?;
        Self::assemble(config, transport, liveness)
    }

    /// Like `new`, with a caller-supplied liveness tracker per peer.
    pub fn with_liveness<F>(
        config: DiscoConfig,
        transport: F,
        liveness: Arc<dyn LivenessFactory>,
    ) -> Result<Self, DiscoError>
    where
        F: FnOnce(Arc<DiscoConfig>) -> Result<T, TransportError>,
    {
        let config = Arc::new(config.resolved());
        let transport = transport(config.clone())?;
        Self::assemble(config, transport, liveness)
    }

    fn assemble(
        config: Arc<DiscoConfig>,
        transport: T,
        liveness: Arc<dyn LivenessFactory>,
    ) -> Result<Self, DiscoError> {
        let local = PeerInfo {
            id: config.id.clone(),
            host: transport.local_host(),
            port: Some(config.port),
            info: None,
        };
        let self_peer = Peer::from_info(&local, liveness.create())?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut disco = Self {
            peers: PeerRegistry::with_self(self_peer, liveness),
            tasks: TaskRegistry::new(),
            transport: Arc::new(transport),
            status: Status::Stopped,
            inbound: None,
            dispatcher: None,
            events,
            local,
            config,
        };
        disco.set_discovery_probe(Payload::none(), None);

        tracing::debug!(id = %disco.local.id, port = disco.config.port, "disco instance created");
        Ok(disco)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.local.id
    }

    pub fn config(&self) -> &Arc<DiscoConfig> {
        &self.config
    }

    /// What this instance announces about itself.
    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Shared handle to the peer registry, e.g. for use inside custom handlers.
    pub fn peers(&self) -> PeerRegistry {
        self.peers.clone()
    }

    /// Known peers, self included, in the order they were first seen.
    pub fn snapshot_peers(&self) -> Vec<Peer> {
        self.peers.snapshot()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Registered broadcast task names, sorted.
    pub fn broadcasts(&self) -> Vec<String> {
        self.tasks.names()
    }

    /// Broadcast timers currently running.
    pub fn armed_count(&self) -> usize {
        self.tasks.armed_count()
    }

    /// A new observer. Receives every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoEvent> {
        self.events.subscribe()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Start broadcasting and listening. A no-op if already started.
    ///
    /// If the transport fails to begin the error is returned, every
    /// listener is removed again and the status stays `Stopped`.
    pub async fn start(&mut self) -> Result<(), DiscoError> {
        if self.status == Status::Started {
            tracing::debug!(id = %self.local.id, "start ignored, already started");
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let topics = self.tasks.names();
        for topic in &topics {
            self.transport.subscribe(topic, tx.clone());
        }

        if let Err(e) = self.transport.begin().await {
            for topic in &topics {
                self.transport.unsubscribe_all(topic);
            }
            tracing::warn!(id = %self.local.id, error = %e, "transport failed to start");
            return Err(e.into());
        }

        self.dispatcher = Some(tokio::spawn(dispatch_loop(
            rx,
            self.peers.clone(),
            self.tasks.clone(),
            self.events.clone(),
        )));
        self.inbound = Some(tx);
        self.tasks.arm_all(self.tick_fn());

        self.set_status(Status::Started);
        tracing::info!(
            id = %self.local.id,
            port = self.config.port,
            topics = ?topics,
            "disco started"
        );
        Ok(())
    }

    /// Stop broadcasting and listening. A no-op if already stopped.
    ///
    /// Messages still queued for the dispatcher are dropped.
    pub async fn stop(&mut self) {
        if self.status == Status::Stopped {
            tracing::debug!(id = %self.local.id, "stop ignored, already stopped");
            return;
        }

        for topic in self.tasks.names() {
            self.transport.unsubscribe_all(&topic);
        }
        let disarmed = self.tasks.disarm_all();
        self.inbound = None;
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        self.transport.end().await;

        self.set_status(Status::Stopped);
        tracing::info!(id = %self.local.id, disarmed, "disco stopped");
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
        let event = match status {
            Status::Started => DiscoEvent::Started,
            Status::Stopped => DiscoEvent::Stopped,
        };
        // No observers is fine.
        let _ = self.events.send(event);
    }

    /// Publish `{sender: self, payload}` on the task's topic.
    fn tick_fn(&self) -> TickFn {
        let transport = self.transport.clone();
        let node = self.local.clone();
        Arc::new(move |topic: String, payload: Option<serde_json::Value>| {
            let transport = transport.clone();
            let message = Message {
                node: node.clone(),
                payload,
            };
            async move {
                if let Err(e) = transport.publish(&topic, message).await {
                    tracing::debug!(topic = %topic, error = %e, "publish failed");
                }
            }
            .boxed()
        })
    }

    // ── Broadcasts ────────────────────────────────────────────────────────────

    /// Schedule `payload` to be published on `name` every `interval`
    /// (default: the configured default interval).
    ///
    /// Replaces any broadcast of the same name, cancelling its timer. If the
    /// coordinator is started the new broadcast is armed right away.
    pub fn register_custom_broadcast(
        &mut self,
        name: impl Into<String>,
        interval: Option<Duration>,
        payload: Payload,
        handler: Option<MessageHandler>,
    ) {
        let interval = interval.unwrap_or_else(|| self.config.default_interval());
        self.install(BroadcastTask::new(name, interval, payload, handler));
    }

    /// Replace the discovery probe's payload and custom handler.
    ///
    /// The sender of every discovery message is merged into the peer
    /// registry before `handler` runs, so the handler can rely on it.
    pub fn set_discovery_probe(&mut self, payload: Payload, handler: Option<MessageHandler>) {
        let interval = self.config.discovery_interval();
        self.install(BroadcastTask::new(DISCOVERY_TOPIC, interval, payload, handler));
    }

    /// Remove a custom broadcast. The discovery probe cannot be removed.
    pub fn unregister_broadcast(&mut self, name: &str) -> bool {
        if name == DISCOVERY_TOPIC {
            tracing::warn!("the discovery probe cannot be unregistered");
            return false;
        }
        if !self.tasks.unregister(name) {
            return false;
        }
        if self.status == Status::Started {
            self.transport.unsubscribe_all(name);
        }
        true
    }

    fn install(&mut self, task: BroadcastTask) {
        let name = task.name().to_string();
        let replaced = self.tasks.register(task);

        if self.status == Status::Started {
            if !replaced {
                if let Some(tx) = &self.inbound {
                    self.transport.subscribe(&name, tx.clone());
                }
            }
            self.tasks.arm(&name, self.tick_fn());
        }
    }

    // ── Peers ─────────────────────────────────────────────────────────────────

    /// Register a peer that has not been heard from.
    ///
    /// Returns false without changes if the id is already known.
    pub fn add_peer(&self, info: &PeerInfo) -> Result<bool, DiscoError> {
        let added = self.peers.insert_new(info)?;
        if added {
            tracing::info!(peer = %info.id, "peer added");
        }
        Ok(added)
    }

    /// Remove a peer. The local entry cannot be removed.
    pub fn remove_peer(&self, id: &str) -> Result<Option<Peer>, DiscoError> {
        if id == self.local.id {
            return Err(DiscoError::LocalPeer);
        }
        let removed = self.peers.remove(id);
        if removed.is_some() {
            tracing::info!(peer = %id, "peer removed");
        }
        Ok(removed)
    }
}

impl<T: Transport> Drop for Disco<T> {
    fn drop(&mut self) {
        self.tasks.disarm_all();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

impl<T: Transport> fmt::Debug for Disco<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disco")
            .field("id", &self.local.id)
            .field("status", &self.status)
            .field("peers", &self.peers.len())
            .field("tasks", &self.tasks)
            .finish()
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// Handle inbound messages one at a time until every sender is gone.
async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    peers: PeerRegistry,
    tasks: TaskRegistry,
    events: broadcast::Sender<DiscoEvent>,
) {
    while let Some(inbound) = rx.recv().await {
        dispatch(&peers, &tasks, &events, inbound);
    }
    tracing::trace!("dispatcher finished");
}

fn dispatch(
    peers: &PeerRegistry,
    tasks: &TaskRegistry,
    events: &broadcast::Sender<DiscoEvent>,
    Inbound { topic, message }: Inbound,
) {
    match peers.merge(&message.node) {
        Ok(MergeOutcome::Joined) => tracing::info!(
            peer = %message.node.id,
            host = ?message.node.host,
            port = ?message.node.port,
            "peer joined"
        ),
        Ok(MergeOutcome::Updated) => {
            tracing::trace!(peer = %message.node.id, topic = %topic, "peer heard from")
        }
        Err(e) => {
            tracing::debug!(topic = %topic, error = %e, "dropping message without sender id");
            return;
        }
    }

    if let Some(handler) = tasks.handler(&topic) {
        handler(&message);
    }

    let _ = events.send(DiscoEvent::Message { topic, message });
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DiscoError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("the local peer cannot be removed")]
    LocalPeer,
}
