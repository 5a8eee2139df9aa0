//! 进度上报节流。

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

/// Rate-limiter for one job's raw progress reports.
///
/// A report passes when at least `min_interval` has elapsed since the last
/// forwarded one, or when it is a boundary value (0 or >= 100).
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    last_forward: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            last_forward: None,
            min_interval,
        }
    }

    pub fn should_forward(&mut self, progress: f64) -> bool {
        self.should_forward_at(progress, Instant::now())
    }

    pub fn should_forward_at(&mut self, progress: f64, now: Instant) -> bool {
        let boundary = progress <= 0.0 || progress >= 100.0;
        let due = match self.last_forward {
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
            None => true,
        };
        if boundary || due {
            self.last_forward = Some(now);
            true
        } else {
            false
        }
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_INTERVAL)
    }
}

/// Per-key last-update timestamps (the coordinator keys it by job id).
#[derive(Debug)]
pub struct KeyedThrottle<K> {
    last: HashMap<K, Instant>,
    min_interval: Duration,
}

impl<K: Eq + Hash + Copy> KeyedThrottle<K> {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last: HashMap::new(),
            min_interval,
        }
    }

    pub fn should_emit_at(&mut self, key: K, now: Instant) -> bool {
        match self.last.get(&key) {
            Some(last) if now.saturating_duration_since(*last) < self.min_interval => false,
            _ => {
                self.last.insert(key, now);
                true
            }
        }
    }

    pub fn forget(&mut self, key: &K) {
        self.last.remove(key);
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.last.retain(|k, _| keep(k));
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.last.contains_key(key)
    }
}
