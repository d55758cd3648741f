//! Trailing-edge debounce and confirmation cooldown timers.
//!
//! Both are plain state machines driven by explicit instants; the
//! recognition session owns the clock and sleeps until [`Debouncer::deadline`]
//! or [`Cooldown::deadline`].

use std::time::Duration;
use tokio::time::Instant;

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Default confirmation banner cooldown.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(5000);

/// What happened to an offered detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Scheduled; nothing was pending.
    Scheduled,
    /// Scheduled, replacing an earlier pending detection.
    Rescheduled,
    /// Dropped because an attempt is in flight.
    Ignored,
}

struct Pending<T> {
    due: Instant,
    item: T,
}

/// Trailing-edge debouncer: every offer restarts the window, and only the
/// most recent item is ever released. Offers made while an attempt is in
/// flight are ignored without rescheduling.
pub struct Debouncer<T> {
    window: Duration,
    pending: Option<Pending<T>>,
    recognizing: bool,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            recognizing: false,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn offer(&mut self, item: T, now: Instant) -> Admission {
        if self.recognizing {
            return Admission::Ignored;
        }
        let replaced = self
            .pending
            .replace(Pending {
                due: now + self.window,
                item,
            })
            .is_some();
        if replaced {
            Admission::Rescheduled
        } else {
            Admission::Scheduled
        }
    }

    /// When the pending item becomes due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.due)
    }

    /// Release the pending item if its window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some(p) if p.due <= now => self.pending.take().map(|p| p.item),
            _ => None,
        }
    }

    /// Mark an attempt as in flight.
    pub fn begin(&mut self) {
        self.recognizing = true;
    }

    /// Mark the in-flight attempt as complete.
    pub fn finish(&mut self) {
        self.recognizing = false;
    }

    pub fn is_recognizing(&self) -> bool {
        self.recognizing
    }

    /// Drop any pending item. Returns true if one was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }
}

/// Fixed-length cooldown, re-armed by each confirmation.
pub struct Cooldown {
    period: Duration,
    until: Option<Instant>,
}

impl Cooldown {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            until: None,
        }
    }

    pub fn arm(&mut self, now: Instant) {
        self.until = Some(now + self.period);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.until
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.until.is_some_and(|t| now < t)
    }

    /// Clear the cooldown if it has run out. Returns true when it expired
    /// on this call.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.until {
            Some(t) if t <= now => {
                self.until = None;
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.until = None;
    }
}
