//! TCP latency probe
//!
//! Measures how long a plain TCP connect to a profile's endpoint takes.
//! This says nothing about whether the proxy protocol works, only whether
//! the server is reachable and how far away it is.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound for a single probe
pub const PING_TIMEOUT: Duration = Duration::from_millis(3200);

/// Recorded when the probe fails or times out
pub const PING_UNKNOWN: i64 = -1;

/// Delay between consecutive probes when pinging every profile
pub const PING_STAGGER: Duration = Duration::from_millis(80);

/// Connect to `address:port` and return the elapsed milliseconds
///
/// Returns [`PING_UNKNOWN`] on failure or timeout.
pub async fn tcp_ping(address: &str, port: u16, timeout: Duration) -> i64 {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
        Ok(Ok(_stream)) => {
            let ms = start.elapsed().as_millis() as i64;
            debug!("Ping {}:{} -> {} ms", address, port, ms);
            ms
        }
        Ok(Err(e)) => {
            debug!("Ping {}:{} failed: {}", address, port, e);
            PING_UNKNOWN
        }
        Err(_) => {
            debug!("Ping {}:{} timed out", address, port);
            PING_UNKNOWN
        }
    }
}

/// Start delay for the probe of `row` in a batch
pub fn stagger_delay(row: usize) -> Duration {
    PING_STAGGER * row as u32
}
