//! Stats API query
//!
//! Traffic totals come from `engine api statsquery`, which prints the
//! per-outbound counters either as JSON or, on older builds, as protobuf
//! text. Both are accepted; JSON is tried first.

use crate::binary::EngineBinary;
use crate::compiler::tags;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::io;
use std::time::Duration;

/// Bound on one stats query
pub const STATS_QUERY_TIMEOUT: Duration = Duration::from_millis(1500);

const COUNTER_PREFIX: &str = "outbound>>>";

/// `name: "outbound>>>proxy>>>traffic>>>uplink"` followed by `value: 123`
static TEXT_COUNTER: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"name:\s*"outbound>>>([^>"]+)>>>traffic>>>(uplink|downlink)"\s*value:\s*(\d+)"#)
        .ok()
});

/// Uplink/downlink byte totals across all user-facing outbounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    pub uplink: u64,
    pub downlink: u64,
}

impl TrafficTotals {
    fn record(&mut self, tag: &str, direction: &str, value: u64) {
        if tag == tags::API {
            return;
        }
        match direction {
            "uplink" => self.uplink = self.uplink.saturating_add(value),
            "downlink" => self.downlink = self.downlink.saturating_add(value),
            _ => {}
        }
    }
}

/// Stats query errors
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("Stats query failed to run: {0}")]
    Io(#[from] io::Error),

    #[error("Stats query exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Unrecognized stats output: {0}")]
    Unparsable(String),
}

#[derive(Deserialize)]
struct StatsResponse {
    #[serde(default)]
    stat: Vec<StatEntry>,
}

#[derive(Deserialize)]
struct StatEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: Value,
}

/// Query outbound traffic through the engine's stats API on `api_port`
pub async fn query_traffic(
    engine: &EngineBinary,
    api_port: u16,
    timeout: Duration,
) -> Result<TrafficTotals, StatsError> {
    let server = format!("--server=127.0.0.1:{}", api_port);
    let output = engine
        .output(&["api", "statsquery", &server, "-pattern", COUNTER_PREFIX], timeout)
        .await?;

    if !output.status.success() {
        return Err(StatsError::Failed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_stats_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `statsquery` output, JSON first, protobuf text second
pub fn parse_stats_output(text: &str) -> Result<TrafficTotals, StatsError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(TrafficTotals::default());
    }

    if let Ok(response) = serde_json::from_str::<StatsResponse>(text) {
        let mut totals = TrafficTotals::default();
        for entry in response.stat {
            if let Some((tag, direction)) = split_counter_name(&entry.name) {
                totals.record(tag, direction, counter_value(&entry.value));
            }
        }
        return Ok(totals);
    }

    let Some(re) = TEXT_COUNTER.as_ref() else {
        return Err(StatsError::Unparsable(text.to_string()));
    };
    let mut totals = TrafficTotals::default();
    let mut matched = false;
    for caps in re.captures_iter(text) {
        matched = true;
        let value = caps[3].parse().unwrap_or(0);
        totals.record(&caps[1], &caps[2], value);
    }

    if matched {
        Ok(totals)
    } else {
        Err(StatsError::Unparsable(truncate(text, 120)))
    }
}

/// `outbound>>>TAG>>>traffic>>>DIRECTION` → `(TAG, DIRECTION)`
fn split_counter_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(COUNTER_PREFIX)?;
    let mut parts = rest.split(">>>");
    let tag = parts.next()?;
    if parts.next()? != "traffic" {
        return None;
    }
    let direction = parts.next()?;
    Some((tag, direction))
}

/// Counters arrive as numbers or as decimal strings (int64 in proto JSON)
fn counter_value(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
