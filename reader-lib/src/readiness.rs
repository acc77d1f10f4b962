use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Receives the head of the stream each time a block is forwarded.
pub trait HeadObserver: Send + Sync {
    fn set_last_block_seen(&self, block_num: u64, block_time: SystemTime);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Head {
    number: u64,
    time: SystemTime,
}

/// A snapshot of the reader metrics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ReaderMetricsSnapshot {
    /// Number of the most recently observed block
    pub head_block_number: Option<u64>,
    /// Seconds between wall clock and the head block time
    pub head_block_time_drift_secs: Option<u64>,
    /// Number of blocks observed since start
    pub blocks_observed: u64,
    pub ready: bool,
}

impl Display for ReaderMetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Reader Metrics Snapshot:")?;
        writeln!(f, "  Head block number: {:?}", self.head_block_number)?;
        writeln!(
            f,
            "  Head block time drift: {:?}s",
            self.head_block_time_drift_secs
        )?;
        writeln!(f, "  Blocks observed: {}", self.blocks_observed)?;
        writeln!(f, "  Ready: {}", self.ready)
    }
}

/// Head tracking and the readiness signal derived from it.
///
/// Readiness is a pure function of the last observation and the injected
/// clock, evaluated on demand.
pub struct MetricsAndReadinessManager {
    head: ArcSwapOption<Head>,
    blocks_observed: AtomicU64,
    max_latency: Duration,
    clock: Arc<dyn Clock>,
}

impl MetricsAndReadinessManager {
    pub fn new(max_latency: Duration) -> Self {
        Self::with_clock(max_latency, Arc::new(SystemClock))
    }

    pub fn with_clock(max_latency: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            head: ArcSwapOption::empty(),
            blocks_observed: AtomicU64::new(0),
            max_latency,
            clock,
        }
    }

    pub fn observe(&self, block_num: u64, block_time: SystemTime) {
        self.head.store(Some(Arc::new(Head {
            number: block_num,
            time: block_time,
        })));
        self.blocks_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn head_block_number(&self) -> Option<u64> {
        self.head.load().as_ref().map(|head| head.number)
    }

    /// Zero when the head block is timestamped in the future.
    pub fn head_block_time_drift(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.head
            .load()
            .as_ref()
            .map(|head| now.duration_since(head.time).unwrap_or_default())
    }

    pub fn is_ready(&self) -> bool {
        self.head_block_time_drift()
            .is_some_and(|drift| drift <= self.max_latency)
    }

    pub fn max_latency(&self) -> Duration {
        self.max_latency
    }

    pub fn snapshot(&self) -> ReaderMetricsSnapshot {
        let drift = self.head_block_time_drift();
        ReaderMetricsSnapshot {
            head_block_number: self.head_block_number(),
            head_block_time_drift_secs: drift.map(|d| d.as_secs()),
            blocks_observed: self.blocks_observed.load(Ordering::Relaxed),
            ready: drift.is_some_and(|d| d <= self.max_latency),
        }
    }
}

impl HeadObserver for MetricsAndReadinessManager {
    fn set_last_block_seen(&self, block_num: u64, block_time: SystemTime) {
        self.observe(block_num, block_time);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::UNIX_EPOCH;

    pub(crate) struct ManualClock(Mutex<SystemTime>);

    impl ManualClock {
        pub(crate) fn at(time: SystemTime) -> Arc<Self> {
            Arc::new(Self(Mutex::new(time)))
        }

        pub(crate) fn set(&self, time: SystemTime) {
            *self.0.lock() = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> SystemTime {
            *self.0.lock()
        }
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_not_ready_without_observation() {
        let manager = MetricsAndReadinessManager::with_clock(
            Duration::from_secs(30),
            ManualClock::at(at(1_000)),
        );
        assert!(!manager.is_ready());
        assert_eq!(manager.head_block_number(), None);
        assert_eq!(manager.snapshot(), ReaderMetricsSnapshot::default());
    }

    #[test]
    fn test_readiness_follows_latency_threshold() {
        let clock = ManualClock::at(at(1_000));
        let manager =
            MetricsAndReadinessManager::with_clock(Duration::from_secs(30), clock.clone());

        // (now, block time, expected)
        let cases = [
            (1_000, 1_000, true),
            (1_030, 1_000, true),
            (1_031, 1_000, false),
            (5_000, 1_000, false),
            (1_000, 1_010, true),
            (1_000, 0, false),
        ];
        for (now, block_time, expected) in cases {
            clock.set(at(now));
            manager.observe(1, at(block_time));
            assert_eq!(
                manager.is_ready(),
                expected,
                "now={now} block_time={block_time}"
            );
        }
    }

    #[test]
    fn test_snapshot_tracks_head() {
        let clock = ManualClock::at(at(2_000));
        let manager = MetricsAndReadinessManager::with_clock(Duration::from_secs(10), clock);
        manager.set_last_block_seen(41, at(1_990));
        manager.set_last_block_seen(42, at(1_995));

        assert_eq!(
            manager.snapshot(),
            ReaderMetricsSnapshot {
                head_block_number: Some(42),
                head_block_time_drift_secs: Some(5),
                blocks_observed: 2,
                ready: true,
            }
        );
    }
}
