//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;

// Sliding-window statistics over wall-clock time. Samples older than the
// window are discarded; `count`/`avg` only consider live samples.
#[derive(Clone, Debug)]
pub struct WindowedStats {
    window_ms: i64,
    samples: VecDeque<(i64, i64)>,
}

// ===== impl WindowedStats =====

impl WindowedStats {
    pub fn new(window: Duration) -> WindowedStats {
        WindowedStats {
            window_ms: window.as_millis() as i64,
            samples: VecDeque::new(),
        }
    }

    // Standard 60-second window used by the exported counters.
    pub fn new_60s() -> WindowedStats {
        WindowedStats::new(Duration::from_secs(60))
    }

    pub fn add(&mut self, value: i64) {
        let now = Utc::now().timestamp_millis();
        self.samples.push_back((now, value));
        let cutoff = now - self.window_ms;
        while let Some((ts, _)) = self.samples.front() {
            if *ts >= cutoff {
                break;
            }
            self.samples.pop_front();
        }
    }

    pub fn count(&self) -> i64 {
        let cutoff = Utc::now().timestamp_millis() - self.window_ms;
        self.samples.iter().filter(|(ts, _)| *ts >= cutoff).count() as i64
    }

    pub fn sum(&self) -> i64 {
        let cutoff = Utc::now().timestamp_millis() - self.window_ms;
        self.samples
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, value)| value)
            .sum()
    }

    pub fn avg(&self) -> i64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        self.sum() / count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windowed_stats() {
        let mut stats = WindowedStats::new_60s();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.avg(), 0);

        stats.add(100);
        stats.add(200);
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.sum(), 300);
        assert_eq!(stats.avg(), 150);
    }

    #[test]
    fn test_windowed_stats_expiry() {
        // A zero-length window retains nothing observable.
        let mut stats = WindowedStats::new(Duration::from_millis(0));
        stats.add(100);
        assert!(stats.count() <= 1);
    }
}
