use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_PER_IDENTITY_GAP: Duration = Duration::from_secs(5);
pub const DEFAULT_GLOBAL_COOLDOWN: Duration = Duration::from_secs(1);

/// Rate limiter for identity notifications.
///
/// A publish is allowed when the same identity has not been published within
/// `per_identity_gap` and nothing at all has been published within
/// `global_cooldown`. Granting a publish records it against both limits.
#[derive(Debug)]
pub struct PublishGate {
    per_identity_gap: Duration,
    global_cooldown: Duration,
    last_seen: HashMap<String, Instant>,
    last_publish: Option<Instant>,
}

impl Default for PublishGate {
    fn default() -> Self {
        Self::new(DEFAULT_PER_IDENTITY_GAP, DEFAULT_GLOBAL_COOLDOWN)
    }
}

impl PublishGate {
    pub fn new(per_identity_gap: Duration, global_cooldown: Duration) -> Self {
        Self {
            per_identity_gap,
            global_cooldown,
            last_seen: HashMap::new(),
            last_publish: None,
        }
    }

    pub fn try_acquire(&mut self, identity_id: &str, now: Instant) -> bool {
        if let Some(last) = self.last_publish {
            if now.saturating_duration_since(last) < self.global_cooldown {
                return false;
            }
        }
        if let Some(last) = self.last_seen.get(identity_id) {
            if now.saturating_duration_since(*last) < self.per_identity_gap {
                return false;
            }
        }
        self.last_seen.insert(identity_id.to_string(), now);
        self.last_publish = Some(now);
        true
    }
}
