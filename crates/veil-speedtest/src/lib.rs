//! Veil Speed Test - latency and throughput measurement
//!
//! Measures ping, download and upload either directly or through the local
//! mixed proxy while a session is connected.
//!
//! # Architecture
//!
//! ```text
//! SpeedTestEngine::run
//!        │
//!        ├── Ping      ── SpeedClient::ping      (204 endpoints)
//!        ├── Download  ── SpeedClient::download  (counting body reads)
//!        └── Upload    ── SpeedClient::upload    (CountingBody)
//!                                │
//!                                ▼
//!                  HttpClient ── direct, or CONNECT via proxy
//! ```
//!
//! Completed runs land in a bounded [`SpeedHistory`].

mod engine;
mod history;
mod http;

pub use engine::{
    SpeedClient, SpeedTestConfig, SpeedTestEngine, SpeedTestError, SpeedTestPhase, SpeedTestState,
};
pub use history::{HistoryEntry, SpeedHistory, SpeedTestResult, HISTORY_CAPACITY};
pub use http::{
    http_connect, is_ok_status_line, CountingBody, HttpClient, HttpClientConfig, HttpError,
};
