use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(50);

/// Leading-edge, drop-style rate limiter.
///
/// An offer made less than `interval` after the last forward is dropped, never queued.
#[derive(Debug, Clone)]
pub struct UpdateThrottle {
    interval: Duration,
    last_forward: Option<Instant>,
}

impl Default for UpdateThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_INTERVAL)
    }
}

impl UpdateThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_forward: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        let open = self
            .last_forward
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if open {
            self.last_forward = Some(now);
        }
        open
    }

    /// Records a forced forward so the next window starts from `now`.
    pub fn mark(&mut self, now: Instant) {
        self.last_forward = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_forward = None;
    }
}

/// Applies an [`UpdateThrottle`] in front of a callback.
pub struct Throttled<F> {
    throttle: UpdateThrottle,
    forward: F,
}

impl<F> Throttled<F> {
    pub fn new(interval: Duration, forward: F) -> Self {
        Self {
            throttle: UpdateThrottle::new(interval),
            forward,
        }
    }

    /// Forwards `value` if the window is open; returns whether it was forwarded.
    pub fn offer<T>(&mut self, value: T) -> bool
    where
        F: FnMut(T),
    {
        if !self.throttle.admit(Instant::now()) {
            return false;
        }
        (self.forward)(value);
        true
    }

    /// Forwards unconditionally, used for the final state of a stream.
    pub fn flush<T>(&mut self, value: T)
    where
        F: FnMut(T),
    {
        self.throttle.mark(Instant::now());
        (self.forward)(value);
    }

    pub fn reset(&mut self) {
        self.throttle.reset();
    }
}
