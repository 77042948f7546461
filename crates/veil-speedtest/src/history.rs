//! Rolling speed-test history

use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

/// Entries kept before the oldest is dropped
pub const HISTORY_CAPACITY: usize = 20;

/// Outcome of one completed run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedTestResult {
    pub ping_ms: u64,
    /// Peak download throughput
    pub download_mbps: f64,
    /// Peak upload throughput
    pub upload_mbps: f64,
    /// Measured through the local proxy rather than the direct path
    pub via_proxy: bool,
}

impl SpeedTestResult {
    /// `Done: ping <n> ms, down <x> Mbps, up <y> Mbps`
    pub fn summary(&self) -> String {
        format!(
            "Done: ping {} ms, down {:.2} Mbps, up {:.2} Mbps",
            self.ping_ms, self.download_mbps, self.upload_mbps
        )
    }

    pub fn route_label(&self) -> &'static str {
        if self.via_proxy {
            "via proxy"
        } else {
            "direct"
        }
    }
}

impl fmt::Display for SpeedTestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.summary(), self.route_label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub result: SpeedTestResult,
    pub finished_at: SystemTime,
    /// Display text, e.g. `Done: ping 20 ms, down 93.10 Mbps, up 40.00 Mbps (via proxy)`
    pub text: String,
}

/// Bounded, oldest-first list of results
#[derive(Debug, Clone)]
pub struct SpeedHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl Default for SpeedHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl SpeedHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, result: SpeedTestResult) -> &HistoryEntry {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            result,
            finished_at: SystemTime::now(),
            text: result.to_string(),
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(ping_ms: u64) -> SpeedTestResult {
        SpeedTestResult {
            ping_ms,
            download_mbps: 93.1,
            upload_mbps: 40.0,
            via_proxy: true,
        }
    }

    #[test]
    fn test_summary_format() {
        let r = result(20);
        assert_eq!(r.summary(), "Done: ping 20 ms, down 93.10 Mbps, up 40.00 Mbps");
        assert_eq!(r.to_string(), "Done: ping 20 ms, down 93.10 Mbps, up 40.00 Mbps (via proxy)");

        let direct = SpeedTestResult {
            via_proxy: false,
            ..r
        };
        assert!(direct.to_string().ends_with("(direct)"));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = SpeedHistory::with_capacity(3);
        for ping in 1..=5 {
            history.push(result(ping));
        }
        assert_eq!(history.len(), 3);
        let pings: Vec<u64> = history.iter().map(|e| e.result.ping_ms).collect();
        assert_eq!(pings, vec![3, 4, 5]);
        assert_eq!(history.latest().unwrap().result.ping_ms, 5);
    }
}
