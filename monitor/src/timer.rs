//! Process timer: hold the oven at a setpoint, buzz when time is up

use std::time::{Duration, Instant};

/// Counts down to an absolute deadline. An absolute timestamp is immune
/// to the polling loop stalling; there is no per-tick decrement to skew.
pub struct ProcessTimer {
    deadline: Option<Instant>,
    buzzer_fired: bool,
}

impl ProcessTimer {
    pub fn new() -> Self {
        Self {
            deadline: None,
            buzzer_fired: false,
        }
    }

    pub fn start(&mut self, minutes: f64) {
        self.deadline = Instant::now().checked_add(Duration::from_secs_f64(minutes * 60.0));
        self.buzzer_fired = false;
    }

    pub fn stop(&mut self) {
        self.deadline = None;
        self.buzzer_fired = false;
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn remaining_s(&self) -> u64 {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).as_secs(),
            None => 0,
        }
    }

    /// True exactly once, on the first check past the deadline
    pub fn check(&mut self) -> bool {
        let expired = match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).is_zero(),
            None => false,
        };

        if expired && !self.buzzer_fired {
            self.buzzer_fired = true;
            return true;
        }

        false
    }
}

impl Default for ProcessTimer {
    fn default() -> Self {
        Self::new()
    }
}
