//! Per-peer liveness tracking with a phi-accrual suspicion detector.
//!
//! Every peer in a registry carries a `LivenessHandle`. The registry reports
//! a heartbeat each time the peer is heard from; callers read a suspicion
//! score that is near zero right after a heartbeat and rises with silence.
//! Peers are never evicted on the score; what counts as "dead" is the
//! caller's policy.
//!
//! Time comes from `tokio::time::Instant`, so a paused test clock drives
//! the detector deterministically.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use disco_core::config::LivenessConfig;

/// Liveness signal for one peer.
pub trait Liveness: Send + Sync + fmt::Debug {
    /// Record that the peer was just heard from.
    fn report_heartbeat(&self);

    /// Current suspicion score. 0.0 before the first heartbeat.
    fn suspicion_score(&self) -> f64;
}

/// Shared handle stored on a peer. Cloned peers share one tracker.
pub type LivenessHandle = Arc<dyn Liveness>;

/// Creates a fresh tracker for each newly observed peer.
pub trait LivenessFactory: Send + Sync {
    fn create(&self) -> LivenessHandle;
}

impl<F> LivenessFactory for F
where
    F: Fn() -> LivenessHandle + Send + Sync,
{
    fn create(&self) -> LivenessHandle {
        self()
    }
}

// ── Phi accrual ───────────────────────────────────────────────────────────────

/// Phi-accrual failure detector (Hayashibara et al.).
///
/// Keeps a bounded window of heartbeat inter-arrival times and reports
/// `phi = -log10(1 - F(elapsed))`, where F is the normal CDF fitted to the
/// window. phi = 1 means roughly a 10% chance the silence is still normal,
/// phi = 3 roughly 0.1%.
#[derive(Debug)]
pub struct PhiAccrualDetector {
    config: LivenessConfig,
    history: Mutex<HeartbeatHistory>,
}

#[derive(Debug, Default)]
struct HeartbeatHistory {
    last: Option<Instant>,
    intervals_ms: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl HeartbeatHistory {
    fn push(&mut self, interval_ms: f64, window: usize) {
        if self.intervals_ms.len() >= window.max(1) {
            if let Some(old) = self.intervals_ms.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.intervals_ms.push_back(interval_ms);
        self.sum += interval_ms;
        self.sum_sq += interval_ms * interval_ms;
    }

    fn mean(&self) -> f64 {
        self.sum / self.intervals_ms.len() as f64
    }

    fn std_dev(&self) -> f64 {
        let mean = self.mean();
        let variance = self.sum_sq / self.intervals_ms.len() as f64 - mean * mean;
        variance.max(0.0).sqrt()
    }
}

impl PhiAccrualDetector {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HeartbeatHistory::default()),
        }
    }

    fn phi_at(&self, now: Instant) -> f64 {
        let history = match self.history.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(last) = history.last else {
            return 0.0;
        };
        if history.intervals_ms.is_empty() {
            return 0.0;
        }

        let elapsed_ms = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
        let mean = history.mean() + self.config.acceptable_pause_ms as f64;
        let std_dev = history.std_dev().max(self.config.min_std_dev_ms.max(1) as f64);

        phi(elapsed_ms, mean, std_dev)
    }
}

impl Liveness for PhiAccrualDetector {
    fn report_heartbeat(&self) {
        let now = Instant::now();
        let mut history = match self.history.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };

        match history.last {
            Some(last) => {
                let interval = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
                history.push(interval, self.config.window_size);
            }
            None => {
                // Seed with the estimate ± a quarter so the first silence is
                // judged against something sensible.
                let estimate = self.config.first_heartbeat_estimate_ms as f64;
                let spread = estimate / 4.0;
                history.push(estimate - spread, self.config.window_size);
                history.push(estimate + spread, self.config.window_size);
            }
        }
        history.last = Some(now);
    }

    fn suspicion_score(&self) -> f64 {
        self.phi_at(Instant::now())
    }
}

/// Logistic approximation of the normal CDF, as used by Cassandra and Akka.
fn phi(elapsed_ms: f64, mean: f64, std_dev: f64) -> f64 {
    let y = (elapsed_ms - mean) / std_dev;
    let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
    let p = if elapsed_ms > mean {
        -(e / (1.0 + e)).log10()
    } else {
        -(1.0 - 1.0 / (1.0 + e)).log10()
    };
    p.max(0.0)
}

/// Builds a `PhiAccrualDetector` per peer from shared tuning.
#[derive(Debug, Clone)]
pub struct PhiAccrualFactory {
    config: LivenessConfig,
}

impl PhiAccrualFactory {
    pub fn new(config: LivenessConfig) -> Self {
        Self { config }
    }
}

impl LivenessFactory for PhiAccrualFactory {
    fn create(&self) -> LivenessHandle {
        Arc::new(PhiAccrualDetector::new(self.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> LivenessConfig {
        LivenessConfig {
            window_size: 100,
            min_std_dev_ms: 10,
            acceptable_pause_ms: 0,
            first_heartbeat_estimate_ms: 100,
        }
    }

    #[test]
    fn phi_is_small_at_mean_and_grows_past_it() {
        let at_mean = phi(100.0, 100.0, 10.0);
        assert!((at_mean - 0.30103).abs() < 0.001, "got {at_mean}");
        assert!(phi(50.0, 100.0, 10.0) < 0.01);
        assert!(phi(150.0, 100.0, 10.0) > 3.0);
        assert!(phi(130.0, 100.0, 10.0) < phi(150.0, 100.0, 10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn score_is_zero_before_first_heartbeat() {
        let detector = PhiAccrualDetector::new(config());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(detector.suspicion_score(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn regular_heartbeats_keep_score_low() {
        let detector = PhiAccrualDetector::new(config());
        for _ in 0..20 {
            detector.report_heartbeat();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // 100ms since the last heartbeat, right on schedule.
        assert!(detector.suspicion_score() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_raises_score_and_heartbeat_resets_it() {
        let detector = PhiAccrualDetector::new(config());
        for _ in 0..20 {
            detector.report_heartbeat();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let on_time = detector.suspicion_score();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let silent = detector.suspicion_score();
        assert!(silent > on_time);
        assert!(silent > 8.0, "got {silent}");

        detector.report_heartbeat();
        assert!(detector.suspicion_score() < 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn acceptable_pause_delays_suspicion() {
        let strict = PhiAccrualDetector::new(config());
        let lenient = PhiAccrualDetector::new(LivenessConfig {
            acceptable_pause_ms: 500,
            ..config()
        });
        for _ in 0..10 {
            strict.report_heartbeat();
            lenient.report_heartbeat();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(strict.suspicion_score() > 3.0);
        assert!(lenient.suspicion_score() < 0.1);
    }

    #[test]
    fn window_is_bounded() {
        let mut history = HeartbeatHistory::default();
        for i in 0..10 {
            history.push(i as f64, 4);
        }
        assert_eq!(history.intervals_ms.len(), 4);
        assert!((history.mean() - 7.5).abs() < 1e-9);
    }

    #[test]
    fn factory_hands_out_independent_trackers() {
        let factory = PhiAccrualFactory::new(config());
        let a = factory.create();
        let b = factory.create();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
