//! Session events and the observer channel
//!
//! Observers subscribe to a [`EventBus`] and get their own unbounded
//! crossbeam receiver. Publishing never blocks the session; subscribers
//! whose receiver was dropped are pruned on the next publish.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::sync::Mutex;
use std::time::SystemTime;
use veil_engine::LogStream;
use veil_speedtest::{SpeedTestResult, SpeedTestState};

/// Connection state owned by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Where the current traffic figures come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrafficSource {
    #[default]
    None,
    /// Engine stats API (authoritative)
    Api,
    /// Byte deltas scraped from engine log lines
    Log,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    /// Identifier of the profile the engine was started with
    pub active_profile: Option<String>,
    pub selected_row: Option<usize>,
    pub engine_pid: Option<u32>,
    pub connected_since: Option<SystemTime>,
    pub rx_total: u64,
    pub tx_total: u64,
    /// Bytes per second since the previous sample
    pub rx_rate: u64,
    pub tx_rate: u64,
    pub traffic_source: TrafficSource,
    pub speedtest: SpeedTestState,
}

/// Something observers may want to react to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        state: ConnectionState,
        error: Option<String>,
    },
    EngineLog {
        stream: LogStream,
        line: String,
    },
    TrafficUpdated {
        rx_total: u64,
        tx_total: u64,
        rx_rate: u64,
        tx_rate: u64,
        source: TrafficSource,
    },
    /// Profile list changed shape (insert, remove, reload)
    ProfilesChanged,
    /// One row changed in place (merge on import, ping result)
    ProfileUpdated {
        row: usize,
        id: String,
        ping_ms: i64,
    },
    SelfTest {
        passed: bool,
        message: String,
    },
    SpeedTestProgress(SpeedTestState),
    SpeedTestFinished(Result<SpeedTestResult, String>),
}

/// Fan-out of [`SessionEvent`]s to any number of observers
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn publish(&self, event: SessionEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
