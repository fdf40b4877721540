//! Trigger policy and the live accumulator driving delivery decisions.

use serde::{Deserialize, Serialize};

/// Configured trigger policy for an observer.
///
/// A threshold of zero (or below) disables that dimension. The lifecycle
/// flags request an immediate fire on the matching signal, provided at least
/// one row has accumulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerCondition {
    /// Fire after this many recorded events.
    #[serde(default)]
    pub row: i32,
    /// Fire after this many accumulated event bytes.
    #[serde(default)]
    pub size: i32,
    /// Fire after this many elapsed timer ticks.
    #[serde(default)]
    pub timeout: i32,
    /// Fire on the startup lifecycle signal.
    #[serde(default)]
    pub on_startup: bool,
    /// Fire on the background lifecycle signal.
    #[serde(default)]
    pub on_background: bool,
}

impl TriggerCondition {
    pub fn with_row(mut self, row: i32) -> Self {
        self.row = row;
        self
    }

    pub fn with_size(mut self, size: i32) -> Self {
        self.size = size;
        self
    }

    pub fn with_timeout(mut self, timeout: i32) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Counters passed to the trigger sink at the moment of a fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSnapshot {
    pub row: i32,
    pub size: i32,
}

/// Live accumulator, reset to zero on every fire.
///
/// Callers guard a `TriggerState` with the observer's accumulator mutex;
/// the methods themselves are plain state transitions so that mutation and
/// fire-check form one critical section at the call site.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerState {
    pub row: i32,
    pub size: i32,
    pub timeout: i32,
}

fn meets_threshold(current: i32, max: i32) -> bool {
    max > 0 && current >= max
}

impl TriggerState {
    /// Account one recorded event; returns a fire snapshot when a row or
    /// size threshold is crossed, resetting the accumulator.
    pub fn record(&mut self, event_size: usize, cond: &TriggerCondition) -> Option<TriggerSnapshot> {
        self.row += 1;
        self.size = self.size.saturating_add(event_size as i32);
        if meets_threshold(self.row, cond.row) || meets_threshold(self.size, cond.size) {
            return Some(self.take_snapshot());
        }
        None
    }

    /// Advance the timeout counter; a timeout with zero accumulated rows
    /// never fires, to avoid spurious empty deliveries.
    pub fn tick(&mut self, step: i32, cond: &TriggerCondition) -> Option<TriggerSnapshot> {
        self.timeout = self.timeout.saturating_add(step);
        if meets_threshold(self.timeout, cond.timeout) && self.row > 0 {
            return Some(self.take_snapshot());
        }
        None
    }

    /// Startup lifecycle signal.
    pub fn on_startup(&mut self, cond: &TriggerCondition) -> Option<TriggerSnapshot> {
        if cond.on_startup && self.row > 0 {
            return Some(self.take_snapshot());
        }
        None
    }

    /// Background lifecycle signal.
    pub fn on_background(&mut self, cond: &TriggerCondition) -> Option<TriggerSnapshot> {
        if cond.on_background && self.row > 0 {
            return Some(self.take_snapshot());
        }
        None
    }

    fn take_snapshot(&mut self) -> TriggerSnapshot {
        let snapshot = TriggerSnapshot {
            row: self.row,
            size: self.size,
        };
        self.row = 0;
        self.size = 0;
        self.timeout = 0;
        snapshot
    }
}
