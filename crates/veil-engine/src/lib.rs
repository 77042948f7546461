//! Veil Engine - proxy-engine configuration and supervision
//!
//! The proxy engine (an Xray-compatible binary) is treated as a black box:
//! this crate compiles its configuration document, writes it to disk,
//! runs the engine as a child process and reads traffic counters back out.
//!
//! # Architecture
//!
//! ```text
//! ServerProfile + RoutingOptions
//!            │
//!            ▼
//!      compiler::build ──▶ ConfigDocument ──▶ config_file::write_config
//!                                                     │
//!                                                     ▼
//!   SupervisorEvent ◀── ProcessSupervisor ──▶ `engine run -config <path>`
//!        (log lines, traffic, exit)                   │
//!                                                     ▼
//!                          stats::query_traffic ◀── `engine api statsquery`
//! ```

mod binary;
mod compiler;
mod config_file;
mod platform;
mod routing;
mod stats;
mod supervisor;
mod traffic;
mod version;

pub use binary::EngineBinary;
pub use compiler::{build, build_for, tags, ConfigDocument};
pub use config_file::{write_config, ConfigFileError};
pub use platform::{detect_platform, platform_for, LinuxPlatform, MacOsPlatform, PlatformProvider, WindowsPlatform};
pub use routing::{
    DefaultPolicy, RoutingOptions, RuleKind, RuleList, TunOptions, DEFAULT_API_PORT,
    DEFAULT_SOCKS_PORT,
};
pub use stats::{parse_stats_output, query_traffic, StatsError, TrafficTotals, STATS_QUERY_TIMEOUT};
pub use supervisor::{
    ExitKind, LineBuffer, LogStream, ProcessSupervisor, RunEvent, SupervisorError,
    SupervisorEvent, SupervisorState, DEFAULT_CLEANUP_GRACE, DEFAULT_STOP_TIMEOUT,
};
pub use traffic::{parse_traffic_delta, TrafficCounters};
pub use version::{
    probe_version, EngineVersion, ProcessRoutingProbe, MIN_PROCESS_ROUTING_VERSION,
    VERSION_PROBE_TIMEOUT,
};
