//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use tokio::time::Instant;

// Two-timer debouncer: work fires `min` after the most recent event,
// but no later than `max` after the first event of the pending burst.
#[derive(Debug)]
pub struct Debouncer {
    min: Duration,
    max: Duration,
    first: Option<Instant>,
    deadline: Option<Instant>,
}

// ===== impl Debouncer =====

impl Debouncer {
    pub fn new(min: Duration, max: Duration) -> Debouncer {
        Debouncer {
            min,
            max,
            first: None,
            deadline: None,
        }
    }

    // Registers an event, scheduling or extending the deadline.
    pub fn push(&mut self) {
        let now = Instant::now();
        let first = *self.first.get_or_insert(now);
        self.deadline = Some(std::cmp::min(now + self.min, first + self.max));
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline.unwrap_or_else(Instant::now)
    }

    pub fn reset(&mut self) {
        self.first = None;
        self.deadline = None;
    }
}
