//! Shared motion state fed by the sensor (MQTT) and by on-frame face detection.
//!
//! The state is one guarded value object. Activity is derived on read from the
//! last trigger time; there is no timer thread.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_EXPIRY_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_SENSOR_PRIORITY_WINDOW: Duration = Duration::from_secs(5);

/// Where the most recent motion trigger came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MotionSource {
    #[default]
    None,
    Sensor,
    Vision,
}

impl std::fmt::Display for MotionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Sensor => write!(f, "sensor"),
            Self::Vision => write!(f, "vision"),
        }
    }
}

/// Point-in-time view of the motion state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionSnapshot {
    pub active: bool,
    /// Source of the last trigger; `None` once the trigger has expired.
    pub source: MotionSource,
    pub last_trigger: Option<Instant>,
}

#[derive(Default)]
struct MotionInner {
    last_trigger: Option<Instant>,
    source: MotionSource,
}

/// Thread-safe motion state. Clones share the same underlying value.
#[derive(Clone)]
pub struct MotionState {
    inner: Arc<Mutex<MotionInner>>,
    expiry_window: Duration,
    sensor_priority_window: Duration,
}

impl Default for MotionState {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRY_WINDOW, DEFAULT_SENSOR_PRIORITY_WINDOW)
    }
}

impl MotionState {
    pub fn new(expiry_window: Duration, sensor_priority_window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MotionInner::default())),
            expiry_window,
            sensor_priority_window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MotionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn report_sensor_motion(&self) {
        self.report_sensor_motion_at(Instant::now());
    }

    pub fn report_sensor_motion_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.last_trigger = Some(now);
        inner.source = MotionSource::Sensor;
    }

    /// Record motion seen by face detection.
    ///
    /// Returns `false` when a fresh sensor trigger takes precedence and the
    /// state was left untouched.
    pub fn report_vision_motion(&self) -> bool {
        self.report_vision_motion_at(Instant::now())
    }

    pub fn report_vision_motion_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.source == MotionSource::Sensor {
            if let Some(last) = inner.last_trigger {
                if now.saturating_duration_since(last) < self.sensor_priority_window {
                    return false;
                }
            }
        }
        inner.last_trigger = Some(now);
        inner.source = MotionSource::Vision;
        true
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Instant::now())
    }

    pub fn is_active_at(&self, now: Instant) -> bool {
        self.snapshot_at(now).active
    }

    pub fn snapshot(&self) -> MotionSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> MotionSnapshot {
        let inner = self.lock();
        let active = inner
            .last_trigger
            .is_some_and(|last| now.saturating_duration_since(last) <= self.expiry_window);
        MotionSnapshot {
            active,
            source: if active {
                inner.source
            } else {
                MotionSource::None
            },
            last_trigger: inner.last_trigger,
        }
    }

    pub fn expiry_window(&self) -> Duration {
        self.expiry_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_inactive() {
        let motion = MotionState::default();
        let snap = motion.snapshot();
        assert!(!snap.active);
        assert_eq!(snap.source, MotionSource::None);
        assert!(snap.last_trigger.is_none());
    }

    #[test]
    fn fresh_sensor_trigger_is_not_overridden_by_vision() {
        let motion = MotionState::default();
        let t0 = Instant::now();
        motion.report_sensor_motion_at(t0);

        let applied = motion.report_vision_motion_at(t0 + Duration::from_secs(2));
        assert!(!applied);

        let snap = motion.snapshot_at(t0 + Duration::from_secs(2));
        assert!(snap.active);
        assert_eq!(snap.source, MotionSource::Sensor);
        assert_eq!(snap.last_trigger, Some(t0));
    }

    #[test]
    fn stale_sensor_trigger_yields_to_vision() {
        let motion = MotionState::default();
        let t0 = Instant::now();
        motion.report_sensor_motion_at(t0);

        assert!(motion.report_vision_motion_at(t0 + Duration::from_secs(6)));
        let snap = motion.snapshot_at(t0 + Duration::from_secs(6));
        assert_eq!(snap.source, MotionSource::Vision);
    }

    #[test]
    fn sensor_always_overrides_vision() {
        let motion = MotionState::default();
        let t0 = Instant::now();
        motion.report_vision_motion_at(t0);
        motion.report_sensor_motion_at(t0 + Duration::from_secs(1));
        let snap = motion.snapshot_at(t0 + Duration::from_secs(1));
        assert_eq!(snap.source, MotionSource::Sensor);
    }

    #[test]
    fn expires_after_window() {
        let motion = MotionState::default();
        let t0 = Instant::now();
        motion.report_sensor_motion_at(t0);

        assert!(motion.is_active_at(t0 + Duration::from_secs(10)));
        assert!(!motion.is_active_at(t0 + Duration::from_secs(11)));
        assert_eq!(
            motion.snapshot_at(t0 + Duration::from_secs(11)).source,
            MotionSource::None
        );
    }

    #[test]
    fn clones_share_state_across_threads() {
        let motion = MotionState::default();
        let writer = motion.clone();
        std::thread::spawn(move || writer.report_sensor_motion())
            .join()
            .unwrap();
        assert!(motion.is_active());
    }
}
