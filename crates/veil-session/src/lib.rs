//! Veil Session - connection lifecycle orchestration
//!
//! Ties profiles, the engine and the speed test together behind one actor.
//! Front ends hold a [`SessionHandle`], send commands through it and watch
//! [`SessionEvent`]s on a crossbeam receiver.
//!
//! # Architecture
//!
//! ```text
//!   SessionHandle ──Command──▶ SessionOrchestrator ──▶ ProcessSupervisor
//!        ▲                      │    │    │                  │
//!        │                      │    │    └── SettingsStore   │ RunEvent
//!   EventBus ◀──SessionEvent────┘    │                        ▼
//!                                    └── stats / ping / self-test tasks
//! ```

mod event;
mod orchestrator;
mod settings;
mod system_proxy;
mod tun_helper;

pub use event::{ConnectionState, EventBus, SessionEvent, SessionSnapshot, TrafficSource};
pub use orchestrator::{
    SessionError, SessionHandle, SessionOrchestrator, SessionTimings, STATS_POLL_INTERVAL,
};
pub use self_test::{
    run_self_test, SelfTestError, SELF_TEST_DELAY, SELF_TEST_TARGET, SELF_TEST_TIMEOUT,
};
pub use settings::{
    MemorySettingsStore, Settings, SettingsError, SettingsStore, TomlSettingsStore,
    DEFAULT_HTTP_PORT,
};
pub use system_proxy::{NoopSystemProxy, SystemProxy, SystemProxyError};
pub use tun_helper::{HelperAction, HelperError, HelperResponse, TunHelperClient, HELPER_TIMEOUT};
