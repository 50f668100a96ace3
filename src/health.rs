//! In-memory per-provider health tracking: a recent-error window that
//! penalizes a provider's routing weight. Structured after the teacher
//! crate's `EwmaTracker` (`routing.rs`) — a `parking_lot`-guarded map keyed
//! by name — but tracks discrete penalizing events in a window rather than
//! an exponential moving average of latency.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Recent-error retention window.
pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct ErrorEvent {
    at: Instant,
    status: u16,
}

fn penalty_for(status: u16) -> Option<f64> {
    if status == 429 {
        Some(5.0)
    } else if (500..600).contains(&status) {
        Some(3.0)
    } else {
        None
    }
}

#[derive(Debug, Default)]
struct ProviderHealth {
    events: VecDeque<ErrorEvent>,
}

impl ProviderHealth {
    fn compact(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.events.front() {
            if now.duration_since(front.at) >= window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Snapshot returned by [`HealthTracker::stats`].
#[derive(Debug, Clone)]
pub struct HealthStats {
    pub recent_error_count: usize,
    pub window: Duration,
    pub last_status: Option<u16>,
}

/// Process-wide singleton (owned by the root context and passed explicitly,
/// per the teacher's convention of threading shared state through
/// `AppState` rather than relying on statics).
#[derive(Debug)]
pub struct HealthTracker {
    providers: RwLock<HashMap<String, ProviderHealth>>,
    window: Duration,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            window: WINDOW,
        }
    }

    /// Construct with a custom retention window. Used by tests that need to
    /// observe decay without sleeping for the full 60s production window.
    pub fn with_window(window: Duration) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            window,
        }
    }

    /// No-op unless `status` is `429` or in `[500, 600)`.
    pub fn record_error(&self, name: &str, status: u16) {
        let Some(_) = penalty_for(status) else {
            return;
        };
        let now = Instant::now();
        let mut providers = self.providers.write();
        let entry = providers.entry(name.to_string()).or_default();
        entry.events.push_back(ErrorEvent { at: now, status });
        entry.compact(now, self.window);
    }

    /// Effective weight for `name` given `base`: compacts first, then
    /// divides `base` by the product of per-event penalties still in window.
    pub fn weight(&self, name: &str, base: f64) -> f64 {
        let now = Instant::now();
        let mut providers = self.providers.write();
        let Some(entry) = providers.get_mut(name) else {
            return base;
        };
        entry.compact(now, self.window);
        if entry.events.is_empty() {
            return base;
        }
        let penalty: f64 = entry
            .events
            .iter()
            .filter_map(|e| penalty_for(e.status))
            .product();
        base / penalty
    }

    pub fn stats(&self, name: &str) -> HealthStats {
        let now = Instant::now();
        let mut providers = self.providers.write();
        let Some(entry) = providers.get_mut(name) else {
            return HealthStats {
                recent_error_count: 0,
                window: self.window,
                last_status: None,
            };
        };
        entry.compact(now, self.window);
        HealthStats {
            recent_error_count: entry.events.len(),
            window: self.window,
            last_status: entry.events.back().map(|e| e.status),
        }
    }

    /// Clear a single provider's recent-error deque.
    pub fn reset(&self, name: &str) {
        self.providers.write().remove(name);
    }

    /// Clear every tracked provider.
    pub fn reset_all(&self) {
        self.providers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_with_no_errors_is_base() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.weight("p", 1000.0), 1000.0);
    }

    #[test]
    fn single_429_applies_5x_penalty() {
        let tracker = HealthTracker::new();
        tracker.record_error("p", 429);
        assert_eq!(tracker.weight("p", 1000.0), 200.0);
    }

    #[test]
    fn single_5xx_applies_3x_penalty() {
        let tracker = HealthTracker::new();
        tracker.record_error("p", 503);
        assert_eq!(tracker.weight("p", 900.0), 300.0);
    }

    #[test]
    fn two_429s_compound_to_25x() {
        let tracker = HealthTracker::new();
        tracker.record_error("p", 429);
        tracker.record_error("p", 429);
        assert_eq!(tracker.weight("p", 1000.0), 40.0);
    }

    #[test]
    fn non_penalizing_status_is_ignored() {
        let tracker = HealthTracker::new();
        tracker.record_error("p", 400);
        tracker.record_error("p", 404);
        assert_eq!(tracker.weight("p", 1000.0), 1000.0);
        assert_eq!(tracker.stats("p").recent_error_count, 0);
    }

    #[test]
    fn reset_clears_single_provider() {
        let tracker = HealthTracker::new();
        tracker.record_error("p", 429);
        tracker.record_error("q", 500);
        tracker.reset("p");
        assert_eq!(tracker.weight("p", 1000.0), 1000.0);
        assert_eq!(tracker.weight("q", 900.0), 300.0);
    }

    #[test]
    fn reset_all_clears_everything() {
        let tracker = HealthTracker::new();
        tracker.record_error("p", 429);
        tracker.record_error("q", 500);
        tracker.reset_all();
        assert_eq!(tracker.weight("p", 1000.0), 1000.0);
        assert_eq!(tracker.weight("q", 900.0), 900.0);
    }

    #[test]
    fn stats_reports_last_status() {
        let tracker = HealthTracker::new();
        tracker.record_error("p", 429);
        tracker.record_error("p", 503);
        let stats = tracker.stats("p");
        assert_eq!(stats.recent_error_count, 2);
        assert_eq!(stats.last_status, Some(503));
        assert_eq!(stats.window, WINDOW);
    }

    #[test]
    fn weight_recovers_after_window_elapses() {
        let tracker = HealthTracker::with_window(Duration::from_millis(20));
        tracker.record_error("p", 429);
        assert_eq!(tracker.weight("p", 1000.0), 200.0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(tracker.weight("p", 1000.0), 1000.0);
    }

    #[test]
    fn unknown_provider_has_empty_stats() {
        let tracker = HealthTracker::new();
        let stats = tracker.stats("nobody");
        assert_eq!(stats.recent_error_count, 0);
        assert_eq!(stats.last_status, None);
    }
}
