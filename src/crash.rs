use std::collections::VecDeque;
use std::time::{Duration, Instant};

// Trailing time span over which repeated abnormal exits count toward
// disabling a module.
pub const CRASH_WINDOW: Duration = Duration::from_secs(60);

pub const DEFAULT_CRASH_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    // relaunch immediately, the module stays in the registry
    Restart,
    // crash loop: remove the module for the rest of the session
    Disable,
}

// Per-module ordered sequence of crash timestamps, newest first. Entries older
// than CRASH_WINDOW are pruned on every append, so the verdict only ever looks
// at the trailing window. The prune rule is explicit rather than an accident
// of insertion order: drop from the back while stale.
pub struct CrashWindow {
    threshold: usize,
    crashes: VecDeque<Instant>,
}

impl CrashWindow {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            crashes: VecDeque::new(),
        }
    }

    /*
        @@@
        @record();
        . Prepends the crash timestamp, prunes entries older than 60s from the back,
          then decides restart vs. disable against the configured threshold.
        . Disabling removes the whole window with the module, so the list never
          grows past the threshold.
    */
    pub fn record(&mut self, now: Instant) -> CrashVerdict {
        self.crashes.push_front(now);
        while let Some(oldest) = self.crashes.back() {
            if now.duration_since(*oldest) > CRASH_WINDOW {
                self.crashes.pop_back();
            } else {
                break;
            }
        }

        if self.crashes.len() >= self.threshold {
            CrashVerdict::Disable
        } else {
            CrashVerdict::Restart
        }
    }

    pub fn len(&self) -> usize {
        self.crashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crashes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_trips_on_fifth_crash_in_window() {
        let base = Instant::now();
        let mut w = CrashWindow::new(DEFAULT_CRASH_THRESHOLD);
        for i in 0..4 {
            assert_eq!(
                w.record(base + Duration::from_secs(i)),
                CrashVerdict::Restart
            );
        }
        assert_eq!(w.record(base + Duration::from_secs(10)), CrashVerdict::Disable);
        assert_eq!(w.len(), 5);
    }

    #[test]
    fn stale_crashes_are_pruned() {
        let base = Instant::now();
        let mut w = CrashWindow::new(DEFAULT_CRASH_THRESHOLD);
        for i in 0..4 {
            w.record(base + Duration::from_secs(i));
        }
        // 90s later the first burst is stale, so this one only counts alone
        assert_eq!(w.record(base + Duration::from_secs(93)), CrashVerdict::Restart);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn entries_exactly_at_the_window_edge_survive() {
        let base = Instant::now();
        let mut w = CrashWindow::new(2);
        w.record(base);
        assert_eq!(w.record(base + CRASH_WINDOW), CrashVerdict::Disable);
    }

    #[test]
    fn raised_threshold_variant() {
        let base = Instant::now();
        let mut w = CrashWindow::new(50);
        for i in 0..49 {
            assert_eq!(
                w.record(base + Duration::from_millis(i)),
                CrashVerdict::Restart
            );
        }
        assert_eq!(
            w.record(base + Duration::from_millis(49)),
            CrashVerdict::Disable
        );
    }
}
