//! Session Orchestrator
//!
//! Owns the profile list, the engine supervisor and everything tied to a
//! live connection. Runs as a single task: commands from [`SessionHandle`]s,
//! supervisor events, timer ticks and background results are handled one at
//! a time, so state transitions never interleave.
//!
//! # State machine
//!
//! ```text
//!                 connect
//! Disconnected ────────────▶ Connecting ──Started──▶ Connected
//!      ▲                         │                      │
//!      │                   start failed          Stopped / disconnect
//!      │                         ▼                      │
//!      └──── disconnect ──── Error ◀──── crash ─────────┘
//! ```
//!
//! Background work (stats queries, pings, the self-test, speed tests) runs in
//! spawned tasks and reports back tagged with the engine run it belongs to;
//! results for a superseded run are dropped.

use crate::event::{ConnectionState, EventBus, SessionEvent, SessionSnapshot, TrafficSource};
use crate::self_test::{
    run_self_test, SelfTestError, SELF_TEST_DELAY, SELF_TEST_TARGET, SELF_TEST_TIMEOUT,
};
use crate::settings::{Settings, SettingsError, SettingsStore};
use crate::system_proxy::SystemProxy;
use crate::tun_helper::{HelperError, TunHelperClient};
use crossbeam_channel::Receiver;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use veil_engine::{
    build, query_traffic, write_config, ConfigFileError, EngineBinary, ExitKind,
    ProcessRoutingProbe, ProcessSupervisor, RoutingOptions, RuleKind, RunEvent, StatsError,
    SupervisorError, SupervisorEvent, TrafficTotals, DEFAULT_CLEANUP_GRACE, DEFAULT_STOP_TIMEOUT,
    STATS_QUERY_TIMEOUT,
};
use veil_profile::{
    parse, reselect_after_removal, stagger_delay, tcp_ping, ParseError, ProfileStore,
    ServerProfile, StoreChange, StoreError, PING_TIMEOUT,
};
use veil_speedtest::{
    HistoryEntry, HttpClient, SpeedTestConfig, SpeedTestEngine, SpeedTestError, SpeedTestResult,
    SpeedTestState,
};

/// Traffic poll period while connected
pub const STATS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A failing stats query is logged on the first failure and every Nth after
const STATS_FAILURE_LOG_EVERY: u32 = 30;

const COMMAND_QUEUE: usize = 32;

/// Timers and bounds used by the session
#[derive(Debug, Clone)]
pub struct SessionTimings {
    pub stats_interval: Duration,
    pub stats_timeout: Duration,
    pub stop_timeout: Duration,
    /// Extra wait for the engine to confirm it exited
    pub stop_grace: Duration,
    pub self_test_delay: Duration,
    pub self_test_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            stats_interval: STATS_POLL_INTERVAL,
            stats_timeout: STATS_QUERY_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            stop_grace: DEFAULT_CLEANUP_GRACE,
            self_test_delay: SELF_TEST_DELAY,
            self_test_timeout: SELF_TEST_TIMEOUT,
        }
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("No profile selected")]
    NoSelection,

    #[error("No profile at row {0}")]
    NoProfile(usize),

    #[error("Engine is still running after stop")]
    StillRunning,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigFileError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    SpeedTest(#[from] SpeedTestError),

    #[error(transparent)]
    Helper(#[from] HelperError),
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Connect { row: Option<usize>, reply: Reply<()> },
    Disconnect { reply: Reply<()> },
    Import { link: String, reply: Reply<StoreChange> },
    Remove { row: usize, reply: Reply<ServerProfile> },
    Select { row: usize, reply: Reply<()> },
    SetRouting { routing: RoutingOptions, reply: Reply<()> },
    PingAll { reply: oneshot::Sender<usize> },
    SpeedTest { reply: Reply<SpeedTestResult> },
    CancelSpeedTest,
    Profiles { reply: oneshot::Sender<Vec<ServerProfile>> },
    Snapshot { reply: oneshot::Sender<SessionSnapshot> },
    Settings { reply: oneshot::Sender<Settings> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Results coming back from spawned work
enum Internal {
    Stats {
        run: u64,
        result: Result<TrafficTotals, StatsError>,
    },
    Ping {
        id: String,
        ms: i64,
    },
    SelfTest {
        run: u64,
        result: Result<(), SelfTestError>,
    },
    SpeedTestDone {
        generation: u64,
    },
}

enum Wake {
    Command(Option<Command>),
    Supervisor(Option<RunEvent>),
    Internal(Option<Internal>),
    StatsTick,
}

/// Running totals plus per-second rates between samples
#[derive(Debug, Default)]
struct TrafficMeter {
    rx_total: u64,
    tx_total: u64,
    rx_rate: u64,
    tx_rate: u64,
    source: TrafficSource,
    sampled_at: Option<Instant>,
}

impl TrafficMeter {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn record(&mut self, rx_total: u64, tx_total: u64, source: TrafficSource, now: Instant) {
        let elapsed = self
            .sampled_at
            .filter(|_| self.source == source)
            .map(|at| now.saturating_duration_since(at).as_secs_f64())
            .unwrap_or(0.0);

        if elapsed > 0.0 {
            self.rx_rate = (rx_total.saturating_sub(self.rx_total) as f64 / elapsed) as u64;
            self.tx_rate = (tx_total.saturating_sub(self.tx_total) as f64 / elapsed) as u64;
        } else {
            self.rx_rate = 0;
            self.tx_rate = 0;
        }

        self.rx_total = rx_total;
        self.tx_total = tx_total;
        self.source = source;
        self.sampled_at = Some(now);
    }
}

fn should_log_stats_failure(consecutive: u32) -> bool {
    consecutive == 1 || consecutive % STATS_FAILURE_LOG_EVERY == 0
}

fn has_process_rules(options: &RoutingOptions) -> bool {
    RuleKind::ALL
        .into_iter()
        .any(|kind| kind.is_process() && !options.rule_list(kind).is_empty())
}

async fn stats_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// The session actor
pub struct SessionOrchestrator {
    settings: Settings,
    settings_store: Arc<dyn SettingsStore>,
    system_proxy: Arc<dyn SystemProxy>,
    profiles: ProfileStore,
    selected: Option<usize>,

    supervisor: ProcessSupervisor,
    supervisor_rx: mpsc::UnboundedReceiver<RunEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    probe: ProcessRoutingProbe,
    events: Arc<EventBus>,
    timings: SessionTimings,

    state: ConnectionState,
    last_error: Option<String>,
    active_profile: Option<String>,
    connected_since: Option<SystemTime>,
    /// Engine run whose events are current
    run: u64,

    stats_timer: Option<Interval>,
    stats_in_flight: bool,
    stats_failures: u32,
    traffic: TrafficMeter,
    self_test: Option<JoinHandle<()>>,
    /// The TUN helper acknowledged `start_tun` for the current run
    tun_active: bool,

    speedtest: SpeedTestEngine,
    speed_cancel: Option<CancellationToken>,
    speed_generation: u64,
}

impl SessionOrchestrator {
    /// Load settings and profiles and prepare a stopped session
    pub fn new(
        settings_store: Arc<dyn SettingsStore>,
        system_proxy: Arc<dyn SystemProxy>,
    ) -> Result<Self, SessionError> {
        let settings = settings_store.load()?;
        let profiles = ProfileStore::load(&settings.profiles_path)?;
        let selected = settings
            .selected_profile
            .as_deref()
            .and_then(|id| profiles.index_of(id))
            .or_else(|| (!profiles.is_empty()).then_some(0));

        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let mut supervisor = ProcessSupervisor::new(supervisor_tx);
        supervisor.set_working_dir(settings.engine_working_dir.clone());

        Ok(Self {
            settings,
            settings_store,
            system_proxy,
            profiles,
            selected,
            supervisor,
            supervisor_rx,
            internal_tx,
            internal_rx,
            probe: ProcessRoutingProbe::default(),
            events: Arc::new(EventBus::new()),
            timings: SessionTimings::default(),
            state: ConnectionState::Disconnected,
            last_error: None,
            active_profile: None,
            connected_since: None,
            run: 0,
            stats_timer: None,
            stats_in_flight: false,
            stats_failures: 0,
            traffic: TrafficMeter::default(),
            self_test: None,
            tun_active: false,
            speedtest: SpeedTestEngine::default(),
            speed_cancel: None,
            speed_generation: 0,
        })
    }

    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.supervisor.set_cleanup_grace(timings.stop_grace);
        self.timings = timings;
        self
    }

    pub fn with_speedtest_config(mut self, config: SpeedTestConfig) -> Self {
        self.speedtest = SpeedTestEngine::new(config);
        self
    }

    /// Start the actor; must be called from within a Tokio runtime
    pub fn spawn(self) -> SessionHandle {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = SessionHandle {
            commands,
            events: self.events.clone(),
            speedtest: self.speedtest.clone(),
        };
        tokio::spawn(self.run_loop(rx));
        handle
    }

    async fn run_loop(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Session started ({} profiles)", self.profiles.len());
        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                event = self.supervisor_rx.recv() => Wake::Supervisor(event),
                message = self.internal_rx.recv() => Wake::Internal(message),
                _ = stats_tick(&mut self.stats_timer) => Wake::StatsTick,
            };

            match wake {
                Wake::Command(Some(command)) => {
                    if !self.handle_command(command).await {
                        return;
                    }
                }
                Wake::Command(None) => break,
                Wake::Supervisor(Some(event)) => self.handle_supervisor(event),
                Wake::Internal(Some(message)) => self.handle_internal(message),
                Wake::Supervisor(None) | Wake::Internal(None) => break,
                Wake::StatsTick => self.poll_stats(),
            }
        }
        self.shutdown().await;
    }

    /// Returns false once the session should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { row, reply } => {
                let _ = reply.send(self.connect(row).await);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(self.disconnect().await);
            }
            Command::Import { link, reply } => {
                let _ = reply.send(self.import(&link));
            }
            Command::Remove { row, reply } => {
                let _ = reply.send(self.remove(row));
            }
            Command::Select { row, reply } => {
                let _ = reply.send(self.select(row));
            }
            Command::SetRouting { routing, reply } => {
                self.settings.routing = routing;
                let _ = reply.send(self.save_settings());
            }
            Command::PingAll { reply } => {
                let _ = reply.send(self.ping_all());
            }
            Command::SpeedTest { reply } => self.start_speedtest(reply),
            Command::CancelSpeedTest => self.cancel_speedtest(),
            Command::Profiles { reply } => {
                let _ = reply.send(self.profiles.profiles().to_vec());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Settings { reply } => {
                let _ = reply.send(self.settings.clone());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("Session state: {} -> {}", self.state, state);
        self.state = state;
        let error = match state {
            ConnectionState::Error => self.last_error.clone(),
            _ => None,
        };
        self.events
            .publish(SessionEvent::StateChanged { state, error });
    }

    fn set_error(&mut self, message: String) {
        error!("Session error: {}", message);
        self.last_error = Some(message.clone());
        self.state = ConnectionState::Error;
        self.events.publish(SessionEvent::StateChanged {
            state: ConnectionState::Error,
            error: Some(message),
        });
    }

    fn fail<T>(&mut self, error: SessionError) -> Result<T, SessionError> {
        self.set_error(error.to_string());
        Err(error)
    }

    fn engine(&self) -> EngineBinary {
        EngineBinary::new(self.settings.engine_path.clone())
            .with_working_dir(self.settings.engine_working_dir.clone())
    }

    async fn connect(&mut self, row: Option<usize>) -> Result<(), SessionError> {
        if self.state == ConnectionState::Connecting {
            info!("Connect ignored: already connecting");
            return Ok(());
        }
        if self.supervisor.is_running() && self.state != ConnectionState::Connected {
            warn!("Engine is running while session is {}; treating as connected", self.state);
            self.set_state(ConnectionState::Connected);
            return Ok(());
        }

        let row = row.or(self.selected).ok_or(SessionError::NoSelection)?;
        let profile = self
            .profiles
            .get(row)
            .cloned()
            .ok_or(SessionError::NoProfile(row))?;

        if self.state == ConnectionState::Connected
            && self.active_profile.as_deref() == Some(profile.id.as_str())
        {
            debug!("Already connected to {}", profile.display_name());
            return Ok(());
        }

        let executable = self.settings.engine_path.clone();
        if executable.as_os_str().is_empty() {
            return self.fail(SupervisorError::EmptyExecutable.into());
        }
        if !executable.exists() {
            return self.fail(SupervisorError::NotFound(executable).into());
        }

        if self.supervisor.is_running() {
            info!("Switching to {}", profile.display_name());
            self.stop_tun().await;
            self.teardown();
            if let Err(e) = self.supervisor.stop(self.timings.stop_timeout).await {
                return self.fail(e.into());
            }
        }

        let mut options = self.settings.routing.clone();
        if has_process_rules(&options) {
            let engine = self.engine();
            options.process_routing = self.probe.supported(&engine).await;
        }
        let document = build(&profile, &options);
        if let Err(e) = write_config(&self.settings.config_path, &document) {
            return self.fail(e.into());
        }

        self.remember_selection(row);
        self.supervisor.reset_traffic();
        self.traffic.reset();
        self.stats_failures = 0;
        self.last_error = None;
        self.active_profile = Some(profile.id.clone());
        self.set_state(ConnectionState::Connecting);

        info!(
            "Connecting to {} ({}:{})",
            profile.display_name(),
            profile.address,
            profile.port
        );
        if options.tun.enabled {
            if let Err(e) = self.start_tun(&executable).await {
                self.active_profile = None;
                return self.fail(e);
            }
        }

        self.supervisor
            .set_working_dir(self.settings.engine_working_dir.clone());
        match self
            .supervisor
            .start(&executable, &self.settings.config_path)
        {
            Ok(_) => {
                self.run = self.supervisor.current_run();
                Ok(())
            }
            Err(e) => {
                self.active_profile = None;
                self.teardown();
                self.fail(e.into())
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        self.stop_tun().await;
        self.teardown();

        if self.supervisor.is_running() {
            info!("Disconnecting");
            match self.supervisor.stop(self.timings.stop_timeout).await {
                Ok(()) if !self.supervisor.is_running() => {}
                Ok(()) | Err(SupervisorError::StopTimedOut) => {
                    return self.fail(SessionError::StillRunning)
                }
                Err(e) => return self.fail(e.into()),
            }
        }

        self.release_system_proxy();
        self.connected_since = None;
        self.active_profile = None;
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.stop_tun().await;
        self.teardown();
        if self.supervisor.is_running() {
            if let Err(e) = self.supervisor.stop(self.timings.stop_timeout).await {
                warn!("Engine did not stop cleanly: {}", e);
            }
        }
        self.release_system_proxy();
        info!("Session closed");
    }

    /// Stop everything tied to the current connection
    ///
    /// A TUN session still up at this point is released in the background;
    /// async callers await [`Self::stop_tun`] first.
    fn teardown(&mut self) {
        self.stats_timer = None;
        self.stats_in_flight = false;
        self.cancel_speedtest();
        if let Some(task) = self.self_test.take() {
            task.abort();
        }
        if std::mem::take(&mut self.tun_active) {
            if let Some(helper) = self.tun_helper() {
                tokio::spawn(async move {
                    if let Err(e) = helper.stop_tun().await {
                        warn!("Failed to stop TUN: {}", e);
                    }
                });
            }
        }
    }

    fn tun_helper(&self) -> Option<TunHelperClient> {
        self.settings
            .tun_helper_addr
            .map(|addr| TunHelperClient::new(addr, self.settings.tun_helper_token.clone()))
    }

    async fn start_tun(&mut self, executable: &Path) -> Result<(), SessionError> {
        let Some(helper) = self.tun_helper() else {
            warn!("TUN mode enabled but no helper is configured; the engine needs its own privileges");
            return Ok(());
        };
        helper
            .start_tun(executable, &self.settings.config_path)
            .await?;
        info!("TUN helper brought the tunnel up");
        self.tun_active = true;
        Ok(())
    }

    async fn stop_tun(&mut self) {
        if !std::mem::take(&mut self.tun_active) {
            return;
        }
        let Some(helper) = self.tun_helper() else {
            return;
        };
        match helper.stop_tun().await {
            Ok(()) => info!("TUN helper took the tunnel down"),
            Err(e) => warn!("Failed to stop TUN: {}", e),
        }
    }

    fn release_system_proxy(&mut self) {
        if self.settings.auto_disable_system_proxy && self.system_proxy.is_enabled() {
            if let Err(e) = self.system_proxy.disable(false) {
                warn!("Failed to clear system proxy: {}", e);
            }
        }
    }

    fn handle_supervisor(&mut self, RunEvent { run, event }: RunEvent) {
        if run != self.run {
            debug!("Dropping event from engine run {}", run);
            return;
        }

        match event {
            SupervisorEvent::Started { pid } => self.on_started(pid),
            SupervisorEvent::Log { stream, line } => {
                debug!(target: "engine", "{}", line);
                self.events.publish(SessionEvent::EngineLog { stream, line });
            }
            SupervisorEvent::TrafficChanged { rx_total, tx_total } => {
                // The stats API is authoritative while it is being polled
                if self.stats_timer.is_none() {
                    self.record_traffic(rx_total, tx_total, TrafficSource::Log);
                }
            }
            SupervisorEvent::Stopped { exit_code, kind } => self.on_stopped(exit_code, kind),
            SupervisorEvent::Error { message } => {
                self.teardown();
                self.set_error(message);
            }
        }
    }

    fn on_started(&mut self, pid: u32) {
        info!("Connected (engine pid {})", pid);
        self.connected_since = Some(SystemTime::now());
        self.set_state(ConnectionState::Connected);

        if self.settings.enable_system_proxy {
            let socks = self.settings.routing.socks_port;
            if let Err(e) = self.system_proxy.enable(socks, self.settings.http_port) {
                warn!("Failed to set system proxy: {}", e);
            }
        }

        if self.settings.routing.stats_port().is_some() {
            let mut timer = tokio::time::interval(self.timings.stats_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.stats_timer = Some(timer);
        }

        self.spawn_self_test();
    }

    fn on_stopped(&mut self, exit_code: Option<i32>, kind: ExitKind) {
        self.teardown();
        self.release_system_proxy();
        self.connected_since = None;
        self.active_profile = None;

        match kind {
            ExitKind::Crashed => {
                let message = match exit_code {
                    Some(code) => format!("Engine exited unexpectedly (code {})", code),
                    None => "Engine was terminated by a signal".to_string(),
                };
                self.set_error(message);
            }
            ExitKind::Requested | ExitKind::Exited => {
                info!("Engine stopped");
                if self.state != ConnectionState::Error {
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Stats { run, result } => self.on_stats(run, result),
            Internal::Ping { id, ms } => {
                if let Some(row) = self.profiles.record_ping(&id, ms) {
                    self.events.publish(SessionEvent::ProfileUpdated {
                        row,
                        id,
                        ping_ms: ms,
                    });
                }
            }
            Internal::SelfTest { run, result } => self.on_self_test(run, result),
            Internal::SpeedTestDone { generation } => {
                if generation == self.speed_generation {
                    self.speed_cancel = None;
                }
            }
        }
    }

    fn poll_stats(&mut self) {
        let Some(port) = self.settings.routing.stats_port() else {
            return;
        };
        if self.stats_in_flight {
            return;
        }
        self.stats_in_flight = true;

        let engine = self.engine();
        let tx = self.internal_tx.clone();
        let run = self.run;
        let timeout = self.timings.stats_timeout;
        tokio::spawn(async move {
            let result = query_traffic(&engine, port, timeout).await;
            let _ = tx.send(Internal::Stats { run, result });
        });
    }

    fn on_stats(&mut self, run: u64, result: Result<TrafficTotals, StatsError>) {
        if run != self.run || self.stats_timer.is_none() {
            return;
        }
        self.stats_in_flight = false;

        match result {
            Ok(totals) => {
                if self.stats_failures > 0 {
                    info!("Stats query recovered after {} failures", self.stats_failures);
                }
                self.stats_failures = 0;
                self.record_traffic(totals.downlink, totals.uplink, TrafficSource::Api);
            }
            Err(e) => {
                self.stats_failures += 1;
                if should_log_stats_failure(self.stats_failures) {
                    warn!("Stats query failed ({} in a row): {}", self.stats_failures, e);
                } else {
                    debug!("Stats query failed: {}", e);
                }
            }
        }
    }

    fn record_traffic(&mut self, rx_total: u64, tx_total: u64, source: TrafficSource) {
        self.traffic.record(rx_total, tx_total, source, Instant::now());
        self.events.publish(SessionEvent::TrafficUpdated {
            rx_total,
            tx_total,
            rx_rate: self.traffic.rx_rate,
            tx_rate: self.traffic.tx_rate,
            source,
        });
    }

    fn spawn_self_test(&mut self) {
        let port = self.settings.routing.socks_port;
        let run = self.run;
        let tx = self.internal_tx.clone();
        let delay = self.timings.self_test_delay;
        let timeout = self.timings.self_test_timeout;

        if let Some(previous) = self.self_test.take() {
            previous.abort();
        }
        self.self_test = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = run_self_test(port, SELF_TEST_TARGET, timeout).await;
            let _ = tx.send(Internal::SelfTest { run, result });
        }));
    }

    fn on_self_test(&mut self, run: u64, result: Result<(), SelfTestError>) {
        if run != self.run || !self.state.is_connected() {
            return;
        }
        self.self_test = None;

        let (host, port) = SELF_TEST_TARGET;
        let (passed, message) = match result {
            Ok(()) => {
                let message = format!("CONNECT {}:{} through the local proxy succeeded", host, port);
                info!("Proxy self-test passed: {}", message);
                (true, message)
            }
            Err(e) => {
                let message = format!("{}; {}", e, e.hint());
                warn!("Proxy self-test failed: {}", message);
                (false, message)
            }
        };
        self.events.publish(SessionEvent::SelfTest { passed, message });
    }

    fn ping_all(&mut self) -> usize {
        let targets: Vec<(usize, String, String, u16)> = self
            .profiles
            .profiles()
            .iter()
            .enumerate()
            .map(|(row, p)| (row, p.id.clone(), p.address.clone(), p.port))
            .collect();

        for (row, id, address, port) in &targets {
            self.profiles.set_ping_in_progress(*row, true);
            let tx = self.internal_tx.clone();
            let (row, id, address, port) = (*row, id.clone(), address.clone(), *port);
            tokio::spawn(async move {
                tokio::time::sleep(stagger_delay(row)).await;
                let ms = tcp_ping(&address, port, PING_TIMEOUT).await;
                let _ = tx.send(Internal::Ping { id, ms });
            });
        }

        debug!("Pinging {} profiles", targets.len());
        targets.len()
    }

    fn start_speedtest(&mut self, reply: Reply<SpeedTestResult>) {
        if self.speed_cancel.is_some() || self.speedtest.is_running() {
            let _ = reply.send(Err(SpeedTestError::AlreadyRunning.into()));
            return;
        }

        let client = if self.state.is_connected() {
            let proxy = SocketAddr::from(([127, 0, 0, 1], self.settings.routing.socks_port));
            info!("Speed test through local proxy {}", proxy);
            HttpClient::via_proxy(proxy)
        } else {
            info!("Speed test over the direct path (not connected)");
            HttpClient::direct()
        };

        let token = CancellationToken::new();
        self.speed_generation += 1;
        self.speed_cancel = Some(token.clone());

        let generation = self.speed_generation;
        let engine = self.speedtest.clone();
        let events = self.events.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let progress = events.clone();
            let result = engine
                .run(&client, &token, move |state| {
                    progress.publish(SessionEvent::SpeedTestProgress(state.clone()))
                })
                .await;

            events.publish(SessionEvent::SpeedTestFinished(
                result.clone().map_err(|e| e.to_string()),
            ));
            let _ = tx.send(Internal::SpeedTestDone { generation });
            let _ = reply.send(result.map_err(SessionError::from));
        });
    }

    fn cancel_speedtest(&mut self) {
        if let Some(token) = self.speed_cancel.take() {
            debug!("Cancelling speed test");
            token.cancel();
        }
    }

    fn import(&mut self, link: &str) -> Result<StoreChange, SessionError> {
        let profile = parse(link)?;
        let name = profile.display_name();

        // Nothing changes in memory unless the new list reached disk
        let mut next = self.profiles.clone();
        let change = next.add(profile)?;
        next.save(&self.settings.profiles_path)?;
        self.profiles = next;

        match change {
            StoreChange::Updated(row) => {
                info!("Updated profile {} (row {})", name, row);
                if let Some(p) = self.profiles.get(row) {
                    self.events.publish(SessionEvent::ProfileUpdated {
                        row,
                        id: p.id.clone(),
                        ping_ms: p.last_ping_ms,
                    });
                }
            }
            _ => {
                info!("Imported profile {}", name);
                if self.selected.is_none() {
                    self.selected = Some(0);
                }
                self.events.publish(SessionEvent::ProfilesChanged);
            }
        }
        Ok(change)
    }

    fn remove(&mut self, row: usize) -> Result<ServerProfile, SessionError> {
        let mut next = self.profiles.clone();
        let removed = next.remove(row)?;
        next.save(&self.settings.profiles_path)?;
        self.profiles = next;
        info!("Removed profile {}", removed.display_name());

        self.selected = reselect_after_removal(self.selected, row, self.profiles.len());
        self.settings.selected_profile = self
            .selected
            .and_then(|row| self.profiles.get(row))
            .map(|p| p.id.clone());
        self.save_settings()?;

        self.events.publish(SessionEvent::ProfilesChanged);
        Ok(removed)
    }

    fn select(&mut self, row: usize) -> Result<(), SessionError> {
        if self.profiles.get(row).is_none() {
            return Err(SessionError::NoProfile(row));
        }
        self.remember_selection(row);
        self.save_settings()
    }

    /// Point the selection at `row` and persist it, logging failures
    fn remember_selection(&mut self, row: usize) {
        let id = self.profiles.get(row).map(|p| p.id.clone());
        if self.selected == Some(row) && self.settings.selected_profile == id {
            return;
        }
        self.selected = Some(row);
        self.settings.selected_profile = id;
        if let Err(e) = self.save_settings() {
            warn!("Failed to save selection: {}", e);
        }
    }

    fn save_settings(&self) -> Result<(), SessionError> {
        self.settings_store.save(&self.settings)?;
        Ok(())
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            last_error: self.last_error.clone(),
            active_profile: self.active_profile.clone(),
            selected_row: self.selected,
            engine_pid: self.supervisor.pid(),
            connected_since: self.connected_since,
            rx_total: self.traffic.rx_total,
            tx_total: self.traffic.tx_total,
            rx_rate: self.traffic.rx_rate,
            tx_rate: self.traffic.tx_rate,
            traffic_source: self.traffic.source,
            speedtest: self.speedtest.state(),
        }
    }
}

/// Cloneable front door to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: Arc<EventBus>,
    speedtest: SpeedTestEngine,
}

impl SessionHandle {
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn speedtest_state(&self) -> SpeedTestState {
        self.speedtest.state()
    }

    pub fn speedtest_history(&self) -> Vec<HistoryEntry> {
        self.speedtest.history()
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Connect to the profile at `row`
    pub async fn connect(&self, row: usize) -> Result<(), SessionError> {
        self.call(|reply| Command::Connect {
            row: Some(row),
            reply,
        })
        .await?
    }

    /// Connect to the selected profile
    pub async fn connect_selected(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::Connect { row: None, reply })
            .await?
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::Disconnect { reply }).await?
    }

    /// Import a share link; re-imports update the existing row
    pub async fn import(&self, link: impl Into<String>) -> Result<StoreChange, SessionError> {
        let link = link.into();
        self.call(|reply| Command::Import { link, reply }).await?
    }

    pub async fn remove(&self, row: usize) -> Result<ServerProfile, SessionError> {
        self.call(|reply| Command::Remove { row, reply }).await?
    }

    pub async fn select(&self, row: usize) -> Result<(), SessionError> {
        self.call(|reply| Command::Select { row, reply }).await?
    }

    /// Replace routing options; applied on the next connect
    pub async fn set_routing(&self, routing: RoutingOptions) -> Result<(), SessionError> {
        self.call(|reply| Command::SetRouting { routing, reply })
            .await?
    }

    /// Probe every profile; results arrive as `ProfileUpdated` events
    pub async fn ping_all(&self) -> Result<usize, SessionError> {
        self.call(|reply| Command::PingAll { reply }).await
    }

    /// Run a speed test, through the local proxy when connected
    pub async fn speedtest(&self) -> Result<SpeedTestResult, SessionError> {
        self.call(|reply| Command::SpeedTest { reply }).await?
    }

    pub async fn cancel_speedtest(&self) -> Result<(), SessionError> {
        self.commands
            .send(Command::CancelSpeedTest)
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub async fn profiles(&self) -> Result<Vec<ServerProfile>, SessionError> {
        self.call(|reply| Command::Profiles { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    pub async fn settings(&self) -> Result<Settings, SessionError> {
        self.call(|reply| Command::Settings { reply }).await
    }

    /// Stop the engine and end the session task
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_failure_logging_is_rate_limited() {
        let logged: Vec<u32> = (1..=90).filter(|n| should_log_stats_failure(*n)).collect();
        assert_eq!(logged, vec![1, 30, 60, 90]);
    }

    #[test]
    fn test_traffic_meter_rates() {
        let mut meter = TrafficMeter::default();
        let start = Instant::now();

        meter.record(1_000, 100, TrafficSource::Api, start);
        assert_eq!((meter.rx_rate, meter.tx_rate), (0, 0));

        meter.record(3_000, 600, TrafficSource::Api, start + Duration::from_secs(2));
        assert_eq!((meter.rx_rate, meter.tx_rate), (1_000, 250));

        // Switching source restarts the rate baseline
        meter.record(50, 10, TrafficSource::Log, start + Duration::from_secs(3));
        assert_eq!((meter.rx_rate, meter.tx_rate), (0, 0));
        assert_eq!(meter.source, TrafficSource::Log);

        meter.reset();
        assert_eq!(meter.rx_total, 0);
        assert_eq!(meter.source, TrafficSource::None);
    }

    #[test]
    fn test_process_rule_detection() {
        let mut options = RoutingOptions::default();
        options.direct_domains.add("example.com");
        assert!(!has_process_rules(&options));
        options.block_processes.add("torrent.exe");
        assert!(has_process_rules(&options));
    }

    #[cfg(unix)]
    mod engine {
        use super::*;
        use crate::settings::MemorySettingsStore;
        use crate::system_proxy::NoopSystemProxy;
        use serde_json::Value;
        use std::path::{Path, PathBuf};
        use tempfile::TempDir;
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;
        use veil_speedtest::SpeedTestPhase;

        const LINK: &str = "vless://user-1@host.example:443?type=ws&security=tls&path=abc#First";
        const OTHER: &str = "vless://user-2@other.example:8443?security=reality&pbk=key&sid=ab#Second";
        const LONG_RUN: &str = "echo 'engine up'\nexec sleep 30\n";

        struct Fixture {
            dir: TempDir,
            handle: SessionHandle,
            proxy: Arc<NoopSystemProxy>,
            store: Arc<MemorySettingsStore>,
        }

        impl Fixture {
            fn config_path(&self) -> PathBuf {
                self.dir.path().join("runtime").join("config.json")
            }
        }

        fn timings() -> SessionTimings {
            SessionTimings {
                stats_interval: Duration::from_millis(100),
                stats_timeout: Duration::from_secs(1),
                stop_timeout: Duration::from_secs(2),
                stop_grace: Duration::from_secs(2),
                self_test_delay: Duration::from_secs(60),
                self_test_timeout: Duration::from_secs(1),
            }
        }

        /// A session whose engine is `/bin/sh` running the `run` script
        fn fixture(run_script: &str, tweak: impl FnOnce(&Path, &mut Settings)) -> Fixture {
            fixture_with(run_script, tweak, |session| session)
        }

        fn fixture_with(
            run_script: &str,
            tweak: impl FnOnce(&Path, &mut Settings),
            build: impl FnOnce(SessionOrchestrator) -> SessionOrchestrator,
        ) -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("run"), run_script).unwrap();

            let mut settings = Settings {
                engine_path: PathBuf::from("/bin/sh"),
                engine_working_dir: Some(dir.path().to_path_buf()),
                config_path: dir.path().join("runtime").join("config.json"),
                profiles_path: dir.path().join("profiles.json"),
                ..Default::default()
            };
            settings.routing.api_port = None;
            tweak(dir.path(), &mut settings);

            let store = Arc::new(MemorySettingsStore::new(settings));
            let proxy = Arc::new(NoopSystemProxy::new());
            let session = SessionOrchestrator::new(store.clone(), proxy.clone())
                .unwrap()
                .with_timings(timings());
            let handle = build(session).spawn();

            Fixture {
                dir,
                handle,
                proxy,
                store,
            }
        }

        async fn wait_for(
            handle: &SessionHandle,
            what: impl Fn(&SessionSnapshot) -> bool,
        ) -> SessionSnapshot {
            for _ in 0..250 {
                let snapshot = handle.snapshot().await.unwrap();
                if what(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("condition not reached: {:?}", handle.snapshot().await.unwrap());
        }

        async fn wait_for_log(events: &Receiver<SessionEvent>, wanted: &str) {
            for _ in 0..250 {
                let seen = events.try_iter().any(|event| {
                    matches!(event, SessionEvent::EngineLog { ref line, .. } if line == wanted)
                });
                if seen {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("engine never logged {:?}", wanted);
        }

        /// Loopback TUN helper answering every request with `reply`
        async fn fake_helper(
            reply: &'static str,
        ) -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let mut reader = BufReader::new(stream);
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.is_err() {
                        continue;
                    }
                    let _ = tx.send(serde_json::from_str::<Value>(&line).unwrap());
                    let _ = reader.get_mut().write_all(reply.as_bytes()).await;
                }
            });
            (addr, rx)
        }

        fn states(events: &Receiver<SessionEvent>) -> Vec<ConnectionState> {
            events
                .try_iter()
                .filter_map(|event| match event {
                    SessionEvent::StateChanged { state, .. } => Some(state),
                    _ => None,
                })
                .collect()
        }

        #[tokio::test]
        async fn test_connect_and_disconnect() {
            let fx = fixture(LONG_RUN, |_, s| s.enable_system_proxy = true);
            let events = fx.handle.subscribe();

            fx.handle.import(LINK).await.unwrap();
            fx.handle.connect(0).await.unwrap();
            let connected = wait_for(&fx.handle, |s| s.state == ConnectionState::Connected).await;

            let profiles = fx.handle.profiles().await.unwrap();
            assert_eq!(connected.active_profile.as_deref(), Some(profiles[0].id.as_str()));
            assert!(connected.engine_pid.is_some());
            assert!(connected.connected_since.is_some());
            assert!(fx.proxy.is_enabled());

            let config = std::fs::read_to_string(fx.config_path()).unwrap();
            assert!(config.contains("\"tag\": \"proxy\""));
            assert!(config.contains("host.example"));

            // Same profile again is a no-op
            fx.handle.connect(0).await.unwrap();
            let again = fx.handle.snapshot().await.unwrap();
            assert_eq!(again.engine_pid, connected.engine_pid);

            fx.handle.disconnect().await.unwrap();
            let snapshot = fx.handle.snapshot().await.unwrap();
            assert_eq!(snapshot.state, ConnectionState::Disconnected);
            assert_eq!(snapshot.engine_pid, None);
            assert_eq!(snapshot.active_profile, None);
            assert!(!fx.proxy.is_enabled());

            assert_eq!(
                states(&events),
                vec![
                    ConnectionState::Connecting,
                    ConnectionState::Connected,
                    ConnectionState::Disconnected,
                ]
            );
            assert_eq!(
                fx.store.current().selected_profile.as_deref(),
                Some(profiles[0].id.as_str())
            );
            fx.handle.shutdown().await.unwrap();
        }

        #[tokio::test]
        async fn test_crash_sets_error() {
            let fx = fixture("sleep 0.2\nexit 3\n", |_, _| {});
            fx.handle.import(LINK).await.unwrap();
            fx.handle.connect(0).await.unwrap();

            let snapshot = wait_for(&fx.handle, |s| s.state == ConnectionState::Error).await;
            let error = snapshot.last_error.unwrap();
            assert!(error.contains("code 3"), "unexpected error: {}", error);
            assert_eq!(snapshot.active_profile, None);

            // Nothing left to stop
            fx.handle.disconnect().await.unwrap();
            assert_eq!(
                fx.handle.snapshot().await.unwrap().state,
                ConnectionState::Disconnected
            );
        }

        #[tokio::test]
        async fn test_missing_engine_fails_before_writing_config() {
            let fx = fixture(LONG_RUN, |dir, s| s.engine_path = dir.join("missing-xray"));
            fx.handle.import(LINK).await.unwrap();

            let err = fx.handle.connect(0).await.unwrap_err();
            assert!(matches!(
                err,
                SessionError::Supervisor(SupervisorError::NotFound(_))
            ));

            let snapshot = fx.handle.snapshot().await.unwrap();
            assert_eq!(snapshot.state, ConnectionState::Error);
            assert!(snapshot.last_error.unwrap().contains("not found"));
            assert!(!fx.config_path().exists());
        }

        #[tokio::test]
        async fn test_connect_without_profile() {
            let fx = fixture(LONG_RUN, |_, _| {});

            assert!(matches!(
                fx.handle.connect(0).await.unwrap_err(),
                SessionError::NoProfile(0)
            ));
            assert!(matches!(
                fx.handle.connect_selected().await.unwrap_err(),
                SessionError::NoSelection
            ));
            assert_eq!(
                fx.handle.snapshot().await.unwrap().state,
                ConnectionState::Disconnected
            );
        }

        #[tokio::test]
        async fn test_switching_profiles_restarts_engine() {
            let fx = fixture(LONG_RUN, |_, _| {});
            fx.handle.import(LINK).await.unwrap();
            fx.handle.import(OTHER).await.unwrap();
            let profiles = fx.handle.profiles().await.unwrap();

            fx.handle.connect(0).await.unwrap();
            let first = wait_for(&fx.handle, |s| s.state == ConnectionState::Connected).await;

            fx.handle.connect(1).await.unwrap();
            let second = wait_for(&fx.handle, |s| {
                s.state == ConnectionState::Connected
                    && s.active_profile.as_deref() == Some(profiles[1].id.as_str())
            })
            .await;
            assert_ne!(first.engine_pid, second.engine_pid);
            assert_eq!(second.selected_row, Some(1));

            // The old run's exit must not knock the new one over
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(
                fx.handle.snapshot().await.unwrap().state,
                ConnectionState::Connected
            );

            let config = std::fs::read_to_string(fx.config_path()).unwrap();
            assert!(config.contains("\"tag\": \"fragment\""));
            fx.handle.shutdown().await.unwrap();
        }

        #[tokio::test]
        async fn test_log_traffic_without_stats_api() {
            let fx = fixture("echo 'rx: 100 tx: 40'\nexec sleep 30\n", |_, _| {});
            fx.handle.import(LINK).await.unwrap();
            fx.handle.connect(0).await.unwrap();

            let snapshot = wait_for(&fx.handle, |s| s.rx_total == 100).await;
            assert_eq!(snapshot.tx_total, 40);
            assert_eq!(snapshot.traffic_source, TrafficSource::Log);
            fx.handle.shutdown().await.unwrap();
        }

        #[tokio::test]
        async fn test_stats_api_takes_priority() {
            let fx = fixture("echo 'rx: 5 tx: 5'\nexec sleep 30\n", |dir, s| {
                std::fs::write(
                    dir.join("api"),
                    "echo '{\"stat\":[\
                     {\"name\":\"outbound>>>proxy>>>traffic>>>uplink\",\"value\":\"300\"},\
                     {\"name\":\"outbound>>>proxy>>>traffic>>>downlink\",\"value\":\"900\"}]}'\n",
                )
                .unwrap();
                s.routing.api_port = Some(10813);
            });
            fx.handle.import(LINK).await.unwrap();
            fx.handle.connect(0).await.unwrap();

            let snapshot = wait_for(&fx.handle, |s| s.rx_total == 900).await;
            assert_eq!(snapshot.tx_total, 300);
            assert_eq!(snapshot.traffic_source, TrafficSource::Api);

            tokio::time::sleep(Duration::from_millis(300)).await;
            let later = fx.handle.snapshot().await.unwrap();
            assert_eq!(later.traffic_source, TrafficSource::Api);
            assert_eq!(later.rx_total, 900);
            fx.handle.shutdown().await.unwrap();
        }

        #[tokio::test]
        async fn test_import_merge_and_remove() {
            let fx = fixture(LONG_RUN, |_, _| {});

            assert_eq!(fx.handle.import(LINK).await.unwrap(), StoreChange::Inserted(0));
            assert_eq!(fx.handle.import(LINK).await.unwrap(), StoreChange::Updated(0));
            assert!(matches!(
                fx.handle.import("ss://nope").await.unwrap_err(),
                SessionError::Parse(ParseError::UnsupportedFormat)
            ));
            assert_eq!(fx.handle.profiles().await.unwrap().len(), 1);

            let removed = fx.handle.remove(0).await.unwrap();
            assert_eq!(removed.name, "First");
            assert!(fx.handle.profiles().await.unwrap().is_empty());
            assert_eq!(fx.handle.snapshot().await.unwrap().selected_row, None);

            let saved = std::fs::read_to_string(fx.dir.path().join("profiles.json")).unwrap();
            assert_eq!(saved.trim(), "[]");
        }

        #[tokio::test]
        async fn test_ping_all_reports_latency() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let fx = fixture(LONG_RUN, |_, _| {});
            let events = fx.handle.subscribe();

            fx.handle
                .import(format!("vless://local@127.0.0.1:{}#Local", port))
                .await
                .unwrap();
            assert_eq!(fx.handle.ping_all().await.unwrap(), 1);

            let mut pinged = None;
            for _ in 0..250 {
                let profiles = fx.handle.profiles().await.unwrap();
                if profiles[0].has_ping() {
                    pinged = Some(profiles[0].clone());
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let profile = pinged.unwrap();
            assert!(!profile.ping_in_progress);

            let updated = events.try_iter().any(|event| {
                matches!(event, SessionEvent::ProfileUpdated { row: 0, ping_ms, .. } if ping_ms >= 0)
            });
            assert!(updated);
        }

        #[tokio::test]
        async fn test_tun_mode_goes_through_helper() {
            let (addr, mut requests) = fake_helper("{\"ok\":true}\n").await;
            let fx = fixture(LONG_RUN, |_, s| {
                s.routing.tun.enabled = true;
                s.tun_helper_addr = Some(addr);
                s.tun_helper_token = "secret".into();
            });
            fx.handle.import(LINK).await.unwrap();

            fx.handle.connect(0).await.unwrap();
            let start = requests.try_recv().unwrap();
            assert_eq!(start["action"], "start_tun");
            assert_eq!(start["token"], "secret");
            assert_eq!(start["engine"], "/bin/sh");
            assert_eq!(start["config"].as_str(), fx.config_path().to_str());
            wait_for(&fx.handle, |s| s.state == ConnectionState::Connected).await;

            fx.handle.disconnect().await.unwrap();
            let stop = requests.try_recv().unwrap();
            assert_eq!(stop["action"], "stop_tun");
            assert!(requests.try_recv().is_err());
            fx.handle.shutdown().await.unwrap();
        }

        #[tokio::test]
        async fn test_helper_refusal_sets_error() {
            let (addr, mut requests) =
                fake_helper("{\"ok\":false,\"error\":\"denied\"}\n").await;
            let fx = fixture(LONG_RUN, |_, s| {
                s.routing.tun.enabled = true;
                s.tun_helper_addr = Some(addr);
            });
            fx.handle.import(LINK).await.unwrap();

            let err = fx.handle.connect(0).await.unwrap_err();
            assert!(matches!(
                err,
                SessionError::Helper(HelperError::Refused { .. })
            ));

            let snapshot = fx.handle.snapshot().await.unwrap();
            assert_eq!(snapshot.state, ConnectionState::Error);
            assert!(snapshot.last_error.unwrap().contains("denied"));
            assert_eq!(snapshot.engine_pid, None);
            assert_eq!(snapshot.active_profile, None);

            assert_eq!(requests.try_recv().unwrap()["action"], "start_tun");
            assert!(requests.try_recv().is_err());
        }

        #[tokio::test]
        async fn test_failed_import_save_keeps_memory_unchanged() {
            let fx = fixture(LONG_RUN, |dir, s| {
                // A regular file where the profile directory should be
                std::fs::write(dir.join("blocker"), "").unwrap();
                s.profiles_path = dir.join("blocker").join("profiles.json");
            });
            let events = fx.handle.subscribe();

            assert!(matches!(
                fx.handle.import(LINK).await.unwrap_err(),
                SessionError::Store(StoreError::Io(_))
            ));
            assert!(fx.handle.profiles().await.unwrap().is_empty());
            assert_eq!(fx.handle.snapshot().await.unwrap().selected_row, None);
            assert!(!events
                .try_iter()
                .any(|event| matches!(event, SessionEvent::ProfilesChanged)));
        }

        #[tokio::test]
        async fn test_disconnect_fails_while_engine_lingers() {
            // The shell ignores TERM and its orphaned sleep holds the output
            // pipes, so exit is not confirmed within the stop window
            let fx = fixture_with(
                "trap '' TERM\necho 'engine up'\nsleep 3\n",
                |_, _| {},
                |session| {
                    session.with_timings(SessionTimings {
                        stop_timeout: Duration::from_millis(100),
                        stop_grace: Duration::from_millis(50),
                        ..timings()
                    })
                },
            );
            let events = fx.handle.subscribe();
            fx.handle.import(LINK).await.unwrap();
            fx.handle.connect(0).await.unwrap();
            wait_for_log(&events, "engine up").await;

            assert!(matches!(
                fx.handle.disconnect().await.unwrap_err(),
                SessionError::StillRunning
            ));
            let snapshot = fx.handle.snapshot().await.unwrap();
            assert_eq!(snapshot.state, ConnectionState::Error);
            assert!(snapshot.last_error.unwrap().contains("still running"));

            // The late exit report keeps the error; a later disconnect clears it
            tokio::time::sleep(Duration::from_secs(3)).await;
            assert_eq!(
                fx.handle.snapshot().await.unwrap().state,
                ConnectionState::Error
            );
            fx.handle.disconnect().await.unwrap();
            assert_eq!(
                fx.handle.snapshot().await.unwrap().state,
                ConnectionState::Disconnected
            );
        }

        #[tokio::test]
        async fn test_teardown_cancels_speedtest_without_history() {
            // Accepts connections but never answers
            let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}/generate_204", silent.local_addr().unwrap());
            let config = SpeedTestConfig {
                ping_urls: vec![url.clone()],
                download_urls: vec![url.clone()],
                upload_urls: vec![url],
                ping_timeout: Duration::from_secs(30),
                ..Default::default()
            };
            let fx = fixture_with(LONG_RUN, |_, _| {}, |session| {
                session.with_speedtest_config(config)
            });

            let running = {
                let handle = fx.handle.clone();
                tokio::spawn(async move { handle.speedtest().await })
            };
            for _ in 0..250 {
                if fx.handle.speedtest_state().phase == SpeedTestPhase::Ping {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert_eq!(fx.handle.speedtest_state().phase, SpeedTestPhase::Ping);

            fx.handle.disconnect().await.unwrap();
            let outcome = tokio::time::timeout(Duration::from_secs(5), running)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(
                outcome,
                Err(SessionError::SpeedTest(SpeedTestError::Cancelled))
            ));
            assert!(fx.handle.speedtest_history().is_empty());
            assert_eq!(fx.handle.speedtest_state().phase, SpeedTestPhase::Idle);
            drop(silent);
        }
    }
}
