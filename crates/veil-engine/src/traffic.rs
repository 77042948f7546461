//! Log-derived traffic counters
//!
//! Some engine builds print per-interval byte deltas in their log output
//! (`rx: 1200 tx: 340`, `downlink=...`). Scanning for them is a heuristic
//! with no guarantee the log format matches; the stats API is authoritative
//! whenever it is being polled.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};

static RX_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:rx|down(?:link)?)\s*[:=]?\s*(\d+)").ok());
static TX_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:tx|up(?:link)?)\s*[:=]?\s*(\d+)").ok());

fn capture(pattern: &Lazy<Option<Regex>>, line: &str) -> u64 {
    pattern
        .as_ref()
        .and_then(|re| re.captures(line))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Extract `(rx, tx)` byte deltas from a log line
///
/// Returns `None` unless at least one positive delta is present.
pub fn parse_traffic_delta(line: &str) -> Option<(u64, u64)> {
    let rx = capture(&RX_PATTERN, line);
    let tx = capture(&TX_PATTERN, line);
    (rx > 0 || tx > 0).then_some((rx, tx))
}

/// Running receive/transmit totals, shared between the log readers and
/// whoever reports traffic
#[derive(Debug, Default)]
pub struct TrafficCounters {
    rx: AtomicU64,
    tx: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add deltas, returning the new totals
    pub fn add(&self, rx: u64, tx: u64) -> (u64, u64) {
        let rx_total = self.rx.fetch_add(rx, Ordering::Relaxed) + rx;
        let tx_total = self.tx.fetch_add(tx, Ordering::Relaxed) + tx;
        (rx_total, tx_total)
    }

    /// Current `(rx, tx)` totals
    pub fn totals(&self) -> (u64, u64) {
        (self.rx.load(Ordering::Relaxed), self.tx.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.rx.store(0, Ordering::Relaxed);
        self.tx.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        assert!(RX_PATTERN.is_some());
        assert!(TX_PATTERN.is_some());
    }

    #[test]
    fn test_parse_traffic_delta() {
        assert_eq!(parse_traffic_delta("stats rx: 1200 tx: 340"), Some((1200, 340)));
        assert_eq!(parse_traffic_delta("Downlink=512"), Some((512, 0)));
        assert_eq!(parse_traffic_delta("UP 64"), Some((0, 64)));
        assert_eq!(parse_traffic_delta("uplink=0 downlink=0"), None);
        assert_eq!(parse_traffic_delta("accepted tcp:1.1.1.1:443"), None);
    }

    #[test]
    fn test_word_boundaries() {
        // "backup" and "proxy" must not trigger the up/rx patterns
        assert_eq!(parse_traffic_delta("backup 100 proxy 5"), None);
    }

    #[test]
    fn test_counters() {
        let counters = TrafficCounters::new();
        assert_eq!(counters.add(10, 5), (10, 5));
        assert_eq!(counters.add(1, 0), (11, 5));
        assert_eq!(counters.totals(), (11, 5));
        counters.reset();
        assert_eq!(counters.totals(), (0, 0));
    }
}
