//! Resource monitor: samples CPU/memory utilization and classifies them
//! against configurable thresholds, notifying subscribers on state
//! transitions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// One CPU/memory reading taken at a point in time.
///
/// `load_average_*` is carried for diagnostic logging only — classification
/// in [`Thresholds::classify`] reads `cpu_utilization`/`memory_utilization`
/// exclusively, since load average isn't comparable across machines with
/// different core counts the way a utilization fraction is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceSample {
    pub timestamp_unix_ms: i64,
    /// Fraction in [0, 1].
    pub cpu_utilization: f32,
    /// Fraction in [0, 1].
    pub memory_utilization: f32,
    pub free_memory_bytes: u64,
    /// 1/5/15-minute load averages, `None` on platforms that don't expose one.
    pub load_average_1m: Option<f64>,
    pub load_average_5m: Option<f64>,
    pub load_average_15m: Option<f64>,
}

impl Default for ResourceSample {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            cpu_utilization: 0.0,
            memory_utilization: 0.0,
            free_memory_bytes: 0,
            load_average_1m: None,
            load_average_5m: None,
            load_average_15m: None,
        }
    }
}

/// Derived classification of a single resource's utilization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Normal,
    Warning,
    Critical,
}

/// Warning/critical thresholds for one resource, both fractions in (0, 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub warning: f32,
    pub critical: f32,
}

impl Thresholds {
    pub fn new(warning: f32, critical: f32) -> Self {
        assert!(
            critical > warning,
            "critical threshold must exceed warning threshold"
        );
        Self { warning, critical }
    }

    pub fn classify(&self, utilization: f32) -> ResourceState {
        if utilization >= self.critical {
            ResourceState::Critical
        } else if utilization >= self.warning {
            ResourceState::Warning
        } else {
            ResourceState::Normal
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: 0.78,
            critical: 0.90,
        }
    }
}

/// Worst of the two per-resource classifications; the scheduler uses this.
pub fn worst_of(a: ResourceState, b: ResourceState) -> ResourceState {
    use ResourceState::*;
    match (a, b) {
        (Critical, _) | (_, Critical) => Critical,
        (Warning, _) | (_, Warning) => Warning,
        _ => Normal,
    }
}

/// Snapshot returned by `Current()`: the sample plus its derived states.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceStateSnapshot {
    pub sample: ResourceSample,
    pub cpu_state: ResourceState,
    pub memory_state: ResourceState,
    pub stale: bool,
}

impl ResourceStateSnapshot {
    pub fn worst_state(&self) -> ResourceState {
        worst_of(self.cpu_state, self.memory_state)
    }
}

struct Inner {
    sample: ResourceSample,
    cpu_thresholds: Thresholds,
    memory_thresholds: Thresholds,
    last_cpu_state: ResourceState,
    last_memory_state: ResourceState,
}

/// Samples host CPU/memory on an interval and classifies the readings,
/// notifying subscribers only on edge transitions into a named state.
pub struct ResourceMonitor {
    inner: Arc<RwLock<Inner>>,
    sample_interval: Duration,
    subscribers: Arc<RwLock<Vec<(ResourceState, mpsc::UnboundedSender<ResourceState>)>>>,
    handle: RwLock<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(sample_interval: Duration) -> Self {
        let sample_interval = if sample_interval < Duration::from_secs(1) {
            Duration::from_secs(1)
        } else {
            sample_interval
        };

        Self {
            inner: Arc::new(RwLock::new(Inner {
                sample: ResourceSample::default(),
                cpu_thresholds: Thresholds::default(),
                memory_thresholds: Thresholds::default(),
                last_cpu_state: ResourceState::Normal,
                last_memory_state: ResourceState::Normal,
            })),
            sample_interval,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            handle: RwLock::new(None),
        }
    }

    pub async fn set_thresholds_cpu(&self, warning: f32, critical: f32) {
        self.inner.write().await.cpu_thresholds = Thresholds::new(warning, critical);
    }

    pub async fn set_thresholds_memory(&self, warning: f32, critical: f32) {
        self.inner.write().await.memory_thresholds = Thresholds::new(warning, critical);
    }

    /// Begin periodic sampling. Idempotent: calling twice without `stop()`
    /// replaces the previous background task.
    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut sys = sysinfo::System::new();
            loop {
                let sample = sample_once(&mut sys);
                this.apply_sample(sample).await;
                tokio::time::sleep(this.sample_interval).await;
            }
        });
        *self.handle.write().await = Some(handle);
    }

    /// Halt sampling. Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.handle.write().await.take() {
            handle.abort();
        }
    }

    async fn apply_sample(&self, sample: ResourceSample) {
        let mut inner = self.inner.write().await;
        inner.sample = sample;

        let cpu_state = inner.cpu_thresholds.classify(sample.cpu_utilization);
        let memory_state = inner.memory_thresholds.classify(sample.memory_utilization);

        let cpu_transitioned = cpu_state != inner.last_cpu_state;
        let memory_transitioned = memory_state != inner.last_memory_state;
        inner.last_cpu_state = cpu_state;
        inner.last_memory_state = memory_state;
        drop(inner);

        if cpu_transitioned || memory_transitioned {
            let worst = worst_of(cpu_state, memory_state);
            self.notify(worst).await;
        }
    }

    async fn notify(&self, state: ResourceState) {
        let subs = self.subscribers.read().await;
        for (target, tx) in subs.iter() {
            if *target == state {
                let _ = tx.send(state);
            }
        }
    }

    /// Returns the most recent sample and its derived classification. A
    /// sample older than two sampling intervals is marked stale but still
    /// returned.
    pub async fn current(&self) -> ResourceStateSnapshot {
        let inner = self.inner.read().await;
        let now_ms = now_unix_ms();
        let age_ms = (now_ms - inner.sample.timestamp_unix_ms).max(0) as u64;
        let stale = age_ms > (self.sample_interval.as_millis() as u64 * 2);

        ResourceStateSnapshot {
            sample: inner.sample,
            cpu_state: inner.last_cpu_state,
            memory_state: inner.last_memory_state,
            stale,
        }
    }

    /// Registers a callback channel fired on each edge-triggered transition
    /// into `state`. Drop the returned receiver (or the sender side stored
    /// here) to unsubscribe.
    pub async fn subscribe(&self, state: ResourceState) -> mpsc::UnboundedReceiver<ResourceState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.push((state, tx));
        rx
    }
}

fn sample_once(sys: &mut sysinfo::System) -> ResourceSample {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_utilization = (sys.global_cpu_usage() / 100.0).clamp(0.0, 1.0);

    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let memory_utilization = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64) as f32
    } else {
        0.0
    };
    let free_memory_bytes = total_memory.saturating_sub(used_memory);

    let load_avg = sysinfo::System::load_average();
    let non_negative = |v: f64| if v >= 0.0 { Some(v) } else { None };

    ResourceSample {
        timestamp_unix_ms: now_unix_ms(),
        cpu_utilization,
        memory_utilization,
        free_memory_bytes,
        load_average_1m: non_negative(load_avg.one),
        load_average_5m: non_negative(load_avg.five),
        load_average_15m: non_negative(load_avg.fifteen),
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_thresholds_classify_boundaries() {
        let t = Thresholds::new(0.7, 0.9);
        assert_eq!(t.classify(0.0), ResourceState::Normal);
        assert_eq!(t.classify(0.69), ResourceState::Normal);
        assert_eq!(t.classify(0.7), ResourceState::Warning);
        assert_eq!(t.classify(0.89), ResourceState::Warning);
        assert_eq!(t.classify(0.9), ResourceState::Critical);
        assert_eq!(t.classify(1.0), ResourceState::Critical);
    }

    #[test]
    #[should_panic(expected = "critical threshold must exceed warning threshold")]
    fn test_thresholds_reject_inverted() {
        Thresholds::new(0.9, 0.7);
    }

    #[test]
    fn test_worst_of() {
        use ResourceState::*;
        assert_eq!(worst_of(Normal, Normal), Normal);
        assert_eq!(worst_of(Normal, Warning), Warning);
        assert_eq!(worst_of(Warning, Critical), Critical);
        assert_eq!(worst_of(Critical, Normal), Critical);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_classify_respects_ordering(
            warning in 0.01f32..0.98,
            critical_offset in 0.01f32..0.5,
            utilization in 0.0f32..1.0,
        ) {
            let critical = (warning + critical_offset).min(0.999);
            prop_assume!(critical > warning);
            let t = Thresholds::new(warning, critical);
            let state = t.classify(utilization);

            match state {
                ResourceState::Critical => prop_assert!(utilization >= critical),
                ResourceState::Warning => prop_assert!(utilization >= warning && utilization < critical),
                ResourceState::Normal => prop_assert!(utilization < warning),
            }
        }

        #[test]
        fn prop_worst_of_is_commutative(
            a in prop_oneof![Just(ResourceState::Normal), Just(ResourceState::Warning), Just(ResourceState::Critical)],
            b in prop_oneof![Just(ResourceState::Normal), Just(ResourceState::Warning), Just(ResourceState::Critical)],
        ) {
            prop_assert_eq!(worst_of(a, b), worst_of(b, a));
        }
    }

    #[tokio::test]
    async fn test_current_before_any_sample_is_stale_or_default() {
        let monitor = ResourceMonitor::new(Duration::from_secs(1));
        let snapshot = monitor.current().await;
        assert_eq!(snapshot.sample.cpu_utilization, 0.0);
    }

    #[tokio::test]
    async fn test_subscribe_receives_transition() {
        let monitor = Arc::new(ResourceMonitor::new(Duration::from_secs(1)));
        monitor.set_thresholds_cpu(0.5, 0.9).await;
        let mut rx = monitor.subscribe(ResourceState::Warning).await;

        monitor
            .apply_sample(ResourceSample {
                timestamp_unix_ms: now_unix_ms(),
                cpu_utilization: 0.6,
                memory_utilization: 0.1,
                free_memory_bytes: 1_000_000,
                ..Default::default()
            })
            .await;

        let received = rx.try_recv();
        assert_eq!(received, Ok(ResourceState::Warning));
    }

    #[tokio::test]
    async fn test_no_notification_without_transition() {
        let monitor = Arc::new(ResourceMonitor::new(Duration::from_secs(1)));
        monitor.set_thresholds_cpu(0.5, 0.9).await;
        let mut rx = monitor.subscribe(ResourceState::Normal).await;

        // Starts at Normal already; re-applying a Normal sample should not
        // fire a transition callback (it's the initial state, not an edge).
        monitor
            .apply_sample(ResourceSample {
                timestamp_unix_ms: now_unix_ms(),
                cpu_utilization: 0.1,
                memory_utilization: 0.1,
                free_memory_bytes: 1_000_000,
                ..Default::default()
            })
            .await;

        assert!(rx.try_recv().is_err());
    }
}
