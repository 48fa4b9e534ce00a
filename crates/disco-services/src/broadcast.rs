//! Scheduled broadcasts: named periodic tasks and their timers.
//!
//! Each task owns an independent tokio timer while armed. There is no
//! shared tick: two tasks' relative phase is undefined. Within one task,
//! ticks never overlap; if a tick's work outlives the interval the missed
//! ticks are skipped rather than queued.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use disco_core::wire::Message;

/// Shortest interval a timer will run at. Zero would spin.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Callback run for every message received on a task's topic.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Work performed on every tick: `(task name, evaluated payload)`.
pub type TickFn = Arc<dyn Fn(String, Option<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

// ── Payload ───────────────────────────────────────────────────────────────────

/// What a task broadcasts.
#[derive(Clone)]
pub enum Payload {
    /// The same value on every tick.
    Static(Option<Value>),
    /// Invoked fresh on every tick.
    Generator(Arc<dyn Fn() -> Option<Value> + Send + Sync>),
}

impl Payload {
    pub fn none() -> Self {
        Payload::Static(None)
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Payload::Static(Some(value.into()))
    }

    pub fn generator<F>(f: F) -> Self
    where
        F: Fn() -> Option<Value> + Send + Sync + 'static,
    {
        Payload::Generator(Arc::new(f))
    }

    /// The payload for one tick.
    pub fn evaluate(&self) -> Option<Value> {
        match self {
            Payload::Static(value) => value.clone(),
            Payload::Generator(f) => f(),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::none()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Payload::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

// ── Task ──────────────────────────────────────────────────────────────────────

/// A named periodic broadcast.
pub struct BroadcastTask {
    name: String,
    interval: Duration,
    payload: Payload,
    handler: Option<MessageHandler>,
    timer: Option<JoinHandle<()>>,
}

impl BroadcastTask {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        payload: Payload,
        handler: Option<MessageHandler>,
    ) -> Self {
        let name = name.into();
        if interval < MIN_INTERVAL {
            tracing::warn!(task = %name, ?interval, "interval too short, clamping to 1ms");
        }
        Self {
            name,
            interval: interval.max(MIN_INTERVAL),
            payload,
            handler,
            timer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn handler(&self) -> Option<&MessageHandler> {
        self.handler.as_ref()
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Start the timer, replacing any running one. Needs a tokio runtime.
    fn arm(&mut self, tick: TickFn) {
        self.disarm();

        let name = self.name.clone();
        let payload = self.payload.clone();
        let period = self.interval;

        self.timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick(name.clone(), payload.evaluate()).await;
            }
        }));
        tracing::trace!(task = %self.name, interval_ms = period.as_millis() as u64, "task armed");
    }

    /// Cancel the timer. Returns false if it was not armed.
    fn disarm(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.abort();
                tracing::trace!(task = %self.name, "task disarmed");
                true
            }
            None => false,
        }
    }
}

impl Drop for BroadcastTask {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl fmt::Debug for BroadcastTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("payload", &self.payload)
            .field("custom_handler", &self.handler.is_some())
            .field("armed", &self.is_armed())
            .finish()
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Tasks keyed by name. At most one task per name.
///
/// Cloning yields a handle to the same registry, so the coordinator's
/// dispatcher can look handlers up while the owner registers tasks.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<DashMap<String, BroadcastTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `task`, replacing any task of the same name.
    ///
    /// The replaced task's timer is cancelled. The new task is not armed.
    /// Returns true if a task was replaced.
    pub fn register(&self, task: BroadcastTask) -> bool {
        let name = task.name.clone();
        match self.tasks.insert(name.clone(), task) {
            Some(mut previous) => {
                let was_armed = previous.disarm();
                tracing::debug!(task = %name, was_armed, "task replaced");
                true
            }
            None => {
                tracing::debug!(task = %name, "task registered");
                false
            }
        }
    }

    /// Disarm and remove a task. Returns false if no such task.
    pub fn unregister(&self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some((_, mut task)) => {
                task.disarm();
                tracing::debug!(task = %name, "task unregistered");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// The custom handler registered for `name`, if any.
    pub fn handler(&self, name: &str) -> Option<MessageHandler> {
        self.tasks.get(name).and_then(|t| t.handler.clone())
    }

    pub fn for_each(&self, mut f: impl FnMut(&BroadcastTask)) {
        for task in self.tasks.iter() {
            f(task.value());
        }
    }

    /// Disarm then arm every task with its own timer.
    pub fn arm_all(&self, tick: TickFn) {
        for mut task in self.tasks.iter_mut() {
            task.arm(tick.clone());
        }
    }

    /// Arm a single task. Returns false if no such task.
    pub fn arm(&self, name: &str, tick: TickFn) -> bool {
        match self.tasks.get_mut(name) {
            Some(mut task) => {
                task.arm(tick);
                true
            }
            None => false,
        }
    }

    /// Cancel every timer. Idempotent. Returns how many were armed.
    pub fn disarm_all(&self) -> usize {
        let mut cancelled = 0;
        for mut task in self.tasks.iter_mut() {
            if task.disarm() {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn armed_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_armed()).count()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .field("armed", &self.armed_count())
            .finish()
    }
}
