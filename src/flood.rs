//! Per-IP sliding-window flood counter.
//!
//! Hub sessions keep one counter for incoming connect-to-me requests and one
//! for incoming searches. Each request is recorded with its arrival time; the
//! verdict compares the number of requests from that address inside the window
//! against a minor and a severe limit. `hit_limit` is true only on the exact
//! request that crossed a threshold, so a backlog of queued messages can't
//! trigger repeated kicks.
//!
//! Time is passed in by the caller in milliseconds, which keeps verdicts fully
//! deterministic for a given `(time, limits, address)` sequence.

use std::collections::HashMap;

/// Flood verdict grade
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloodKind {
    /// Within limits
    Ok,
    /// Minor limit reached: worth a status note, not a disconnect
    Minor,
    /// Severe limit reached: disconnect and back off
    Severe,
}

/// Verdict for one request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FloodResult {
    /// Grade of the current request
    pub kind: FloodKind,
    /// True exactly when this request crossed the corresponding limit
    pub hit_limit: bool,
}

/// Request-count limits for one window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FloodLimits {
    /// Requests per window before the minor verdict
    pub minor_count: usize,
    /// Requests per window before the severe verdict
    pub severe_count: usize,
}

/// Sliding-window request counter keyed by peer address
#[derive(Debug)]
pub struct FloodCounter {
    period_ms: u64,
    requests: HashMap<String, Vec<u64>>,
}

impl FloodCounter {
    /// Create a counter with the given window length in seconds
    pub fn new(period_secs: u64) -> Self {
        Self {
            period_ms: period_secs * 1000,
            requests: HashMap::new(),
        }
    }

    /// Record a request and return the verdict computed *before* recording.
    ///
    /// The verdict therefore grades the request itself: the Nth request from
    /// an address sees a count of N-1 prior requests.
    pub fn handle_request(&mut self, ip: &str, limits: FloodLimits, now_ms: u64) -> FloodResult {
        let result = self.status(ip, limits, now_ms);
        self.add_request(ip, now_ms);
        result
    }

    /// Verdict for an address without recording anything
    pub fn status(&mut self, ip: &str, limits: FloodLimits, now_ms: u64) -> FloodResult {
        self.prune(now_ms);

        let count = self.requests.get(ip).map_or(0, Vec::len);
        if count >= limits.severe_count {
            FloodResult {
                kind: FloodKind::Severe,
                hit_limit: count == limits.severe_count,
            }
        } else if count >= limits.minor_count {
            FloodResult {
                kind: FloodKind::Minor,
                hit_limit: count == limits.minor_count,
            }
        } else {
            FloodResult {
                kind: FloodKind::Ok,
                hit_limit: false,
            }
        }
    }

    /// Record one request from an address
    pub fn add_request(&mut self, ip: &str, now_ms: u64) {
        self.requests.entry(ip.to_string()).or_default().push(now_ms);
    }

    /// Requests per minute currently recorded for an address
    pub fn rate(&self, ip: &str) -> usize {
        let count = self.requests.get(ip).map_or(0, Vec::len);
        if self.period_ms >= 60_000 {
            count * 60_000 / self.period_ms as usize
        } else {
            count
        }
    }

    /// Append the observed request rate to a status message
    pub fn append_rate(&self, ip: &str, message: &str) -> String {
        format!("{} ({} requests/minute)", message, self.rate(ip))
    }

    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.period_ms);
        self.requests.retain(|ip, times| {
            times.retain(|&t| t > cutoff);
            if times.is_empty() {
                tracing::trace!(ip, "expired flood window");
                false
            } else {
                true
            }
        });
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: FloodLimits = FloodLimits {
        minor_count: 3,
        severe_count: 5,
    };

    #[test]
    fn verdict_sequence_is_deterministic() {
        let run = || {
            let mut c = FloodCounter::new(60);
            (0..7)
                .map(|i| c.handle_request("10.0.0.1", LIMITS, 1000 + i * 10))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run(), "same inputs must yield the same verdicts");
    }

    #[test]
    fn grades_escalate_at_exact_thresholds() {
        let mut c = FloodCounter::new(60);
        let kinds: Vec<_> = (0..7)
            .map(|i| c.handle_request("ip", LIMITS, 1000 + i))
            .collect();

        // Requests 1-3 OK (counts 0,1,2), 4th hits minor (count 3),
        // 5th still minor, 6th hits severe (count 5), 7th severe.
        assert_eq!(kinds[2].kind, FloodKind::Ok);
        assert_eq!(kinds[3].kind, FloodKind::Minor);
        assert!(kinds[3].hit_limit, "exact minor crossing");
        assert_eq!(kinds[4].kind, FloodKind::Minor);
        assert!(!kinds[4].hit_limit, "already past minor");
        assert_eq!(kinds[5].kind, FloodKind::Severe);
        assert!(kinds[5].hit_limit, "exact severe crossing");
        assert_eq!(kinds[6].kind, FloodKind::Severe);
        assert!(!kinds[6].hit_limit, "backlog must not re-report the hit");
    }

    #[test]
    fn addresses_are_counted_independently() {
        let mut c = FloodCounter::new(60);
        for i in 0..4 {
            c.handle_request("a", LIMITS, 1000 + i);
        }
        let fresh = c.handle_request("b", LIMITS, 2000);
        assert_eq!(fresh.kind, FloodKind::Ok, "other addresses are unaffected");
    }

    #[test]
    fn requests_expire_after_the_window() {
        let mut c = FloodCounter::new(60);
        for i in 0..5 {
            c.handle_request("ip", LIMITS, 1000 + i);
        }
        assert_eq!(c.status("ip", LIMITS, 1010).kind, FloodKind::Severe);

        // 61 seconds later the window is clear
        let later = c.handle_request("ip", LIMITS, 1010 + 61_000);
        assert_eq!(later.kind, FloodKind::Ok);
    }

    #[test]
    fn hub_ctm_limits_trip_on_the_forty_first_request() {
        // Hub CTM limits: minor 15, severe 40. The 41st request within the
        // window must grade severe with hit_limit exactly once (on the 41st,
        // which sees a prior count of 40).
        let limits = FloodLimits {
            minor_count: 15,
            severe_count: 40,
        };
        let mut c = FloodCounter::new(60);
        let mut results = Vec::new();
        for i in 0..41 {
            results.push(c.handle_request("peer", limits, 1000 + i * 100));
        }
        assert_eq!(results[15].kind, FloodKind::Minor);
        assert!(results[15].hit_limit);
        assert_eq!(results[39].kind, FloodKind::Minor);
        assert_eq!(results[40].kind, FloodKind::Severe);
        assert!(results[40].hit_limit);
        let severe_hits = results
            .iter()
            .filter(|r| r.kind == FloodKind::Severe && r.hit_limit)
            .count();
        assert_eq!(severe_hits, 1, "severe hit reported exactly once");
    }

    #[test]
    fn rate_normalises_to_requests_per_minute() {
        let mut c = FloodCounter::new(120);
        for i in 0..10 {
            c.add_request("ip", 1000 + i);
        }
        assert_eq!(c.rate("ip"), 5, "10 requests over 2 minutes = 5/min");
        assert_eq!(
            c.append_rate("ip", "connect request spam"),
            "connect request spam (5 requests/minute)"
        );
    }
}
