//! Speed Test Engine
//!
//! Three phases per run, each cancellable:
//!
//! ```text
//! Ping ──▶ Download ──▶ Upload ──▶ Done
//!  │          │           │
//!  └──────────┴───────────┴──▶ Error (no samples / no data)
//!                              Idle  (cancelled)
//! ```
//!
//! Ping cycles through lightweight `204` endpoints until it has enough samples
//! or hits its attempt ceiling. Download and upload each run for a fixed
//! window, keep one request in flight at a time, and sample throughput on a
//! short tick; the phase result is the larger of the best tick and the
//! whole-window average.

use crate::history::{HistoryEntry, SpeedHistory, SpeedTestResult};
use crate::http::{HttpClient, HttpError};
use async_trait::async_trait;
use hyper::body::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transport used by the engine; implemented by [`HttpClient`]
#[async_trait]
pub trait SpeedClient: Send + Sync {
    /// Whether requests go through the local proxy
    fn via_proxy(&self) -> bool;

    async fn ping(&self, url: &str) -> Result<Duration, HttpError>;

    /// Download `url`, adding bytes to `received` as they arrive
    async fn download(&self, url: &str, received: Arc<AtomicU64>) -> Result<u64, HttpError>;

    /// Upload `payload` to `url`, adding bytes to `sent` as they leave
    async fn upload(&self, url: &str, payload: Bytes, sent: Arc<AtomicU64>) -> Result<u64, HttpError>;
}

#[async_trait]
impl SpeedClient for HttpClient {
    fn via_proxy(&self) -> bool {
        self.proxy().is_some()
    }

    async fn ping(&self, url: &str) -> Result<Duration, HttpError> {
        HttpClient::ping(self, url).await
    }

    async fn download(&self, url: &str, received: Arc<AtomicU64>) -> Result<u64, HttpError> {
        HttpClient::download(self, url, &received).await
    }

    async fn upload(&self, url: &str, payload: Bytes, sent: Arc<AtomicU64>) -> Result<u64, HttpError> {
        HttpClient::upload(self, url, payload, sent).await
    }
}

/// Speed test tuning
#[derive(Debug, Clone)]
pub struct SpeedTestConfig {
    pub ping_urls: Vec<String>,
    pub download_urls: Vec<String>,
    pub upload_urls: Vec<String>,
    /// Successful pings needed to finish the phase
    pub ping_samples: u32,
    /// Ping attempts before giving up
    pub ping_attempts: u32,
    pub ping_timeout: Duration,
    /// Length of the download and upload windows
    pub phase_duration: Duration,
    /// Throughput sampling interval
    pub tick_interval: Duration,
    /// Requests per transfer phase before giving up
    pub request_attempts: u32,
    /// Size of the synthetic upload payload
    pub upload_size: usize,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            ping_urls: vec![
                "http://www.gstatic.com/generate_204".into(),
                "http://cp.cloudflare.com/generate_204".into(),
                "http://connectivitycheck.gstatic.com/generate_204".into(),
            ],
            download_urls: vec![
                "https://speed.cloudflare.com/__down?bytes=25000000".into(),
                "http://cachefly.cachefly.net/10mb.test".into(),
            ],
            upload_urls: vec![
                "https://speed.cloudflare.com/__up".into(),
                "http://httpbin.org/post".into(),
            ],
            ping_samples: 5,
            ping_attempts: 10,
            ping_timeout: Duration::from_secs(3),
            phase_duration: Duration::from_secs(8),
            tick_interval: Duration::from_millis(250),
            request_attempts: 32,
            upload_size: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeedTestPhase {
    #[default]
    Idle,
    Ping,
    Download,
    Upload,
    Done,
    Error,
}

impl fmt::Display for SpeedTestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpeedTestPhase::Idle => "Idle",
            SpeedTestPhase::Ping => "Ping",
            SpeedTestPhase::Download => "Download",
            SpeedTestPhase::Upload => "Upload",
            SpeedTestPhase::Done => "Done",
            SpeedTestPhase::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Live view of a run
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpeedTestState {
    pub phase: SpeedTestPhase,
    /// Bytes moved in the current transfer phase
    pub phase_bytes: u64,
    pub phase_elapsed: Duration,
    pub current_mbps: f64,
    pub peak_mbps: f64,
    pub ping_samples: u32,
    pub ping_total_ms: u64,
    pub ping_ms: Option<u64>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub via_proxy: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpeedTestError {
    #[error("Speed test already running")]
    AlreadyRunning,

    #[error("No {0} endpoints configured")]
    NoEndpoints(SpeedTestPhase),

    #[error("No ping replies after {attempts} attempts")]
    NoPingSamples { attempts: u32 },

    #[error("{phase} transferred no data after {attempts} requests")]
    NoData { phase: SpeedTestPhase, attempts: u32 },

    #[error("Speed test cancelled")]
    Cancelled,
}

type Request<'a> = Pin<Box<dyn Future<Output = Result<u64, HttpError>> + Send + 'a>>;
type Progress<'a> = dyn FnMut(&SpeedTestState) + Send + 'a;

struct Shared {
    state: SpeedTestState,
    history: SpeedHistory,
    running: bool,
}

/// Resets a run that was dropped before finishing
struct RunGuard<'a> {
    shared: &'a Mutex<Shared>,
    finished: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.running = false;
            shared.state = SpeedTestState::default();
        }
    }
}

/// Phased throughput/latency tester with a bounded result history
#[derive(Clone)]
pub struct SpeedTestEngine {
    config: Arc<SpeedTestConfig>,
    shared: Arc<Mutex<Shared>>,
}

impl Default for SpeedTestEngine {
    fn default() -> Self {
        Self::new(SpeedTestConfig::default())
    }
}

impl SpeedTestEngine {
    pub fn new(config: SpeedTestConfig) -> Self {
        Self {
            config: Arc::new(config),
            shared: Arc::new(Mutex::new(Shared {
                state: SpeedTestState::default(),
                history: SpeedHistory::default(),
                running: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SpeedTestState {
        self.lock().state.clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    fn update(&self, f: impl FnOnce(&mut SpeedTestState)) -> SpeedTestState {
        let mut shared = self.lock();
        f(&mut shared.state);
        shared.state.clone()
    }

    /// Run all three phases
    ///
    /// `on_progress` sees every state change. A successful run appends one
    /// history entry; a failed or cancelled run leaves the history untouched.
    pub async fn run<F>(
        &self,
        client: &dyn SpeedClient,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<SpeedTestResult, SpeedTestError>
    where
        F: FnMut(&SpeedTestState) + Send,
    {
        let via_proxy = client.via_proxy();
        {
            let mut shared = self.lock();
            if shared.running {
                return Err(SpeedTestError::AlreadyRunning);
            }
            shared.running = true;
            shared.state = SpeedTestState {
                via_proxy,
                ..Default::default()
            };
        }
        let mut guard = RunGuard {
            shared: &self.shared,
            finished: false,
        };

        info!(
            "Speed test started ({})",
            if via_proxy { "via proxy" } else { "direct" }
        );
        let outcome = self.run_phases(client, cancel, &mut on_progress).await;

        let snapshot = {
            let mut shared = self.lock();
            shared.running = false;
            match &outcome {
                Ok(result) => {
                    shared.state.phase = SpeedTestPhase::Done;
                    let entry = shared.history.push(*result);
                    info!("{}", entry.text);
                }
                Err(SpeedTestError::Cancelled) => {
                    info!("Speed test cancelled");
                    shared.state = SpeedTestState::default();
                }
                Err(e) => {
                    warn!("Speed test failed: {}", e);
                    shared.state.phase = SpeedTestPhase::Error;
                    shared.state.error = Some(e.to_string());
                }
            }
            shared.state.clone()
        };
        guard.finished = true;

        on_progress(&snapshot);
        outcome
    }

    async fn run_phases(
        &self,
        client: &dyn SpeedClient,
        cancel: &CancellationToken,
        on_progress: &mut Progress<'_>,
    ) -> Result<SpeedTestResult, SpeedTestError> {
        let ping_ms = self.ping_phase(client, cancel, on_progress).await?;
        let download_mbps = self
            .transfer_phase(SpeedTestPhase::Download, client, cancel, on_progress)
            .await?;
        let upload_mbps = self
            .transfer_phase(SpeedTestPhase::Upload, client, cancel, on_progress)
            .await?;

        Ok(SpeedTestResult {
            ping_ms,
            download_mbps,
            upload_mbps,
            via_proxy: client.via_proxy(),
        })
    }

    fn enter(&self, phase: SpeedTestPhase, on_progress: &mut Progress<'_>) {
        debug!("Speed test phase: {}", phase);
        let snapshot = self.update(|s| {
            s.phase = phase;
            s.phase_bytes = 0;
            s.phase_elapsed = Duration::ZERO;
            s.current_mbps = 0.0;
            s.peak_mbps = 0.0;
        });
        on_progress(&snapshot);
    }

    async fn ping_phase(
        &self,
        client: &dyn SpeedClient,
        cancel: &CancellationToken,
        on_progress: &mut Progress<'_>,
    ) -> Result<u64, SpeedTestError> {
        let urls = &self.config.ping_urls;
        if urls.is_empty() {
            return Err(SpeedTestError::NoEndpoints(SpeedTestPhase::Ping));
        }
        self.enter(SpeedTestPhase::Ping, on_progress);

        let mut attempts = 0u32;
        let mut samples = 0u32;
        let mut total_ms = 0u64;

        while samples < self.config.ping_samples && attempts < self.config.ping_attempts {
            let url = &urls[attempts as usize % urls.len()];
            attempts += 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(SpeedTestError::Cancelled),
                r = tokio::time::timeout(self.config.ping_timeout, client.ping(url)) => r,
            };

            match outcome {
                Ok(Ok(rtt)) => {
                    samples += 1;
                    total_ms += rtt.as_millis() as u64;
                    let average = rounded_average(total_ms, samples);
                    let snapshot = self.update(|s| {
                        s.ping_samples = samples;
                        s.ping_total_ms = total_ms;
                        s.ping_ms = Some(average);
                    });
                    on_progress(&snapshot);
                }
                Ok(Err(e)) => debug!("Ping {} failed: {}", url, e),
                Err(_) => debug!("Ping {} timed out", url),
            }
        }

        if samples == 0 {
            return Err(SpeedTestError::NoPingSamples { attempts });
        }
        Ok(rounded_average(total_ms, samples))
    }

    async fn transfer_phase(
        &self,
        phase: SpeedTestPhase,
        client: &dyn SpeedClient,
        cancel: &CancellationToken,
        on_progress: &mut Progress<'_>,
    ) -> Result<f64, SpeedTestError> {
        let urls = match phase {
            SpeedTestPhase::Upload => &self.config.upload_urls,
            _ => &self.config.download_urls,
        };
        if urls.is_empty() {
            return Err(SpeedTestError::NoEndpoints(phase));
        }
        self.enter(phase, on_progress);

        let payload = match phase {
            SpeedTestPhase::Upload => Bytes::from(vec![0u8; self.config.upload_size]),
            _ => Bytes::new(),
        };
        let counter = Arc::new(AtomicU64::new(0));
        let tick = self.config.tick_interval;
        let start = Instant::now();
        let deadline = tokio::time::sleep_until(start + self.config.phase_duration);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval_at(start + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut attempts = 0u32;
        let mut request: Option<Request<'_>> = None;
        let mut last_bytes = 0u64;
        let mut last_tick = start;
        let mut peak = 0.0f64;

        enum Step {
            Cancelled,
            Deadline,
            Tick,
            Finished(Result<u64, HttpError>),
        }

        loop {
            if request.is_none() {
                if attempts >= self.config.request_attempts {
                    debug!("{} stopped after {} requests", phase, attempts);
                    break;
                }
                let url = &urls[attempts as usize % urls.len()];
                attempts += 1;
                request = Some(match phase {
                    SpeedTestPhase::Upload => client.upload(url, payload.clone(), counter.clone()),
                    _ => client.download(url, counter.clone()),
                });
            }

            let step = {
                let in_flight = async {
                    match request.as_mut() {
                        Some(fut) => fut.await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => Step::Cancelled,
                    _ = &mut deadline => Step::Deadline,
                    _ = ticker.tick() => Step::Tick,
                    r = in_flight => Step::Finished(r),
                }
            };

            match step {
                // Dropping `request` on return aborts the transfer
                Step::Cancelled => return Err(SpeedTestError::Cancelled),
                Step::Deadline => break,
                Step::Tick => {
                    let now = Instant::now();
                    let bytes = counter.load(Ordering::Relaxed);
                    let current = mbps(bytes.saturating_sub(last_bytes), now - last_tick);
                    peak = peak.max(current);
                    last_bytes = bytes;
                    last_tick = now;
                    let snapshot = self.update(|s| {
                        s.phase_bytes = bytes;
                        s.phase_elapsed = now - start;
                        s.current_mbps = current;
                        s.peak_mbps = peak;
                    });
                    on_progress(&snapshot);
                }
                Step::Finished(result) => {
                    request = None;
                    if let Err(e) = result {
                        debug!("{} request failed: {}", phase, e);
                    }
                }
            }
        }
        drop(request);

        let total = counter.load(Ordering::Relaxed);
        if total == 0 {
            return Err(SpeedTestError::NoData { phase, attempts });
        }

        let average = mbps(total, start.elapsed());
        let result = peak.max(average);
        let snapshot = self.update(|s| {
            s.phase_bytes = total;
            s.peak_mbps = peak;
            match phase {
                SpeedTestPhase::Upload => s.upload_mbps = Some(result),
                _ => s.download_mbps = Some(result),
            }
        });
        on_progress(&snapshot);
        Ok(result)
    }
}

fn rounded_average(total: u64, count: u32) -> u64 {
    let count = u64::from(count.max(1));
    (total + count / 2) / count
}

/// Megabits per second for `bytes` moved in `elapsed`
fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / secs / 1_000_000.0
}
