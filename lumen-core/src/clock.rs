use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// The clock capability injected into every engine.
///
/// `now_instant` backs all deadlines (retransmit, update, pmin/pmax,
/// suspension); `now_system_ms` backs LwM2M `time` resources and the
/// 24-hour confirmable-notification rule.
pub trait TimeProvider: Send + Sync + Debug {
    fn now_instant(&self) -> Instant;
    fn now_system_ms(&self) -> i64;
}

/// Wall-clock provider used outside tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_system_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A manual time provider for deterministic simulations.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: RwLock<Instant>,
    system_ms: RwLock<i64>,
}

impl ManualTimeProvider {
    pub fn new(instant: Instant, system_ms: i64) -> Self {
        Self {
            instant: RwLock::new(instant),
            system_ms: RwLock::new(system_ms),
        }
    }

    pub fn start_now() -> Self {
        Self::new(Instant::now(), 0)
    }

    pub fn set_time(&self, instant: Instant, system_ms: i64) {
        *self.instant.write().unwrap() = instant;
        *self.system_ms.write().unwrap() = system_ms;
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write().unwrap() += duration;
        *self.system_ms.write().unwrap() += duration.as_millis() as i64;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        *self.instant.read().unwrap()
    }

    fn now_system_ms(&self) -> i64 {
        *self.system_ms.read().unwrap()
    }
}
