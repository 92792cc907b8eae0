// Sliding-window protocol error tracking per producer identity.
//
// A producer that keeps sending corrupt frames is almost always a buggy
// client stuck in a retry loop; blocking it for the rest of the window stops
// it from burning broker cycles on streams that will never parse.
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_ERRORS_PER_WINDOW: u32 = 10;

struct ErrorState {
    count: u32,
    first_seen: Instant,
    last_seen: Instant,
    blocked: bool,
}

/// Counts protocol errors per producer key (`room:name:remote_addr`) in a
/// sliding window and flags producers that exceed the threshold.
pub struct ProducerErrorTracker {
    window: Duration,
    max_errors: u32,
    states: RwLock<HashMap<String, ErrorState>>,
}

impl ProducerErrorTracker {
    pub fn new(window: Duration, max_errors: u32) -> Self {
        Self {
            window,
            max_errors,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Record one error for `key`. Returns true when this error crossed the
    /// threshold and the producer is now blocked.
    pub fn record_error(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut states = self.states.write().expect("tracker lock");
        let Some(state) = states.get_mut(key) else {
            states.insert(
                key.to_string(),
                ErrorState {
                    count: 1,
                    first_seen: now,
                    last_seen: now,
                    blocked: false,
                },
            );
            return false;
        };

        if now.duration_since(state.first_seen) > self.window {
            state.count = 1;
            state.first_seen = now;
            state.last_seen = now;
            state.blocked = false;
            return false;
        }

        state.count += 1;
        state.last_seen = now;
        if state.count > self.max_errors {
            state.blocked = true;
            return true;
        }
        false
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        let states = self.states.read().expect("tracker lock");
        let Some(state) = states.get(key) else {
            return false;
        };
        // Blocks expire with the window; no explicit unblock call needed.
        if state.first_seen.elapsed() > self.window {
            return false;
        }
        state.blocked
    }

    /// Drop entries idle for more than twice the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut states = self.states.write().expect("tracker lock");
        states.retain(|_, state| now.duration_since(state.last_seen) <= self.window * 2);
    }
}

impl Default for ProducerErrorTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_WINDOW, DEFAULT_MAX_ERRORS_PER_WINDOW)
    }
}
