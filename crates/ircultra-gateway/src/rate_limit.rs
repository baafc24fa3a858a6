//! Per-session sliding-window rate limiter. Each session owns its window,
//! so the check runs under the session's own event ordering and two
//! sessions can never race each other's counters.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateWindow {
    max_count: usize,
    window: Duration,
    hits: Vec<Instant>,
}

impl RateWindow {
    pub fn new(max_count: usize, window: Duration) -> Self {
        Self {
            max_count,
            window,
            hits: Vec::new(),
        }
    }

    /// Preset for the session-multiplexed endpoint: 25 events / 5 s.
    pub fn native() -> Self {
        Self::new(25, Duration::from_millis(5000))
    }

    /// Preset for the classical-wire endpoint: 10 events / 5 s.
    pub fn wire() -> Self {
        Self::new(10, Duration::from_millis(5000))
    }

    /// Returns `true` if the event is admitted. Prunes expired entries,
    /// refuses at the cap, records the hit otherwise.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> bool {
        self.hits
            .retain(|t| now.duration_since(*t) < self.window);
        if self.hits.len() >= self.max_count {
            return false;
        }
        self.hits.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_cap_then_refuses() {
        let mut window = RateWindow::native();
        let now = Instant::now();
        for _ in 0..25 {
            assert!(window.check_at(now));
        }
        assert!(!window.check_at(now), "26th event in the window refused");
    }

    #[test]
    fn window_slides_forward() {
        let mut window = RateWindow::new(2, Duration::from_millis(100));
        let start = Instant::now();
        assert!(window.check_at(start));
        assert!(window.check_at(start));
        assert!(!window.check_at(start));
        // Past the window the old hits expire.
        assert!(window.check_at(start + Duration::from_millis(150)));
    }

    #[test]
    fn wire_preset_is_tighter() {
        let mut window = RateWindow::wire();
        let now = Instant::now();
        for _ in 0..10 {
            assert!(window.check_at(now));
        }
        assert!(!window.check_at(now));
    }
}
