//! Veil: proxy-engine session manager
//!
//! Command-line front end over the session actor. Initializes the global
//! allocator, sets up logging and dispatches one subcommand.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use veil_engine::build;
use veil_profile::{ProfileStore, ServerProfile, PING_STAGGER, PING_TIMEOUT};
use veil_session::{
    ConnectionState, NoopSystemProxy, SessionEvent, SessionHandle, SessionOrchestrator,
    SettingsStore, TomlSettingsStore,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_SETTINGS_FILE: &str = "veil.toml";

#[derive(Parser)]
#[command(name = "veil")]
#[command(about = "Proxy-engine session manager")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Settings file path
    #[arg(short, long, default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import one or more share links
    Import { links: Vec<String> },
    /// List stored profiles
    List,
    /// Remove the profile at ROW
    Remove { row: usize },
    /// Measure TCP latency to every profile
    Ping,
    /// Connect and stay connected until Ctrl-C
    Connect {
        /// Profile row; defaults to the selected profile
        row: Option<usize>,
    },
    /// Run a speed test, through the proxy if connected
    Speedtest {
        /// Connect to this profile first
        #[arg(long)]
        via: Option<usize>,
    },
    /// Print the engine config compiled for a profile
    Config { row: Option<usize> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();

    let store = Arc::new(TomlSettingsStore::new(&cli.settings));

    // Compiling a config needs no running session
    if let Command::Config { row } = cli.command {
        return print_config(store.as_ref(), row);
    }

    let session = SessionOrchestrator::new(store.clone(), Arc::new(NoopSystemProxy::new()))
        .with_context(|| format!("Failed to load session from {}", cli.settings.display()))?
        .spawn();

    let outcome = run(&session, cli.command).await;
    session.shutdown().await.ok();
    outcome
}

async fn run(session: &SessionHandle, command: Command) -> Result<()> {
    match command {
        Command::Import { links } => {
            for link in links {
                match session.import(link.as_str()).await {
                    Ok(change) => info!("{:?}", change),
                    Err(e) => warn!("Skipped link: {}", e),
                }
            }
            list(session).await
        }
        Command::List => list(session).await,
        Command::Remove { row } => {
            let removed = session.remove(row).await?;
            println!("Removed {}", removed.display_name());
            Ok(())
        }
        Command::Ping => ping(session).await,
        Command::Connect { row } => connect(session, row).await,
        Command::Speedtest { via } => {
            if let Some(row) = via {
                session.connect(row).await?;
                wait_connected(session).await?;
            }
            let result = session.speedtest().await?;
            println!("{} ({})", result.summary(), result.route_label());
            Ok(())
        }
        Command::Config { .. } => Ok(()),
    }
}

fn print_row(row: usize, profile: &ServerProfile, selected: bool) {
    let marker = if selected { '*' } else { ' ' };
    let ping = if profile.has_ping() {
        format!("{} ms", profile.last_ping_ms)
    } else {
        "-".to_string()
    };
    println!(
        "{}{:>3}  {:<6} {:<32} {}:{}  {}",
        marker,
        row,
        profile.protocol.as_str(),
        profile.display_name(),
        profile.address,
        profile.port,
        ping
    );
}

async fn list(session: &SessionHandle) -> Result<()> {
    let selected = session.snapshot().await?.selected_row;
    let profiles = session.profiles().await?;
    if profiles.is_empty() {
        println!("No profiles; import a vmess:// or vless:// link first");
    }
    for (row, profile) in profiles.iter().enumerate() {
        print_row(row, profile, selected == Some(row));
    }
    Ok(())
}

async fn ping(session: &SessionHandle) -> Result<()> {
    let count = session.ping_all().await?;
    let deadline =
        tokio::time::Instant::now() + PING_TIMEOUT + PING_STAGGER * count as u32 + Duration::from_secs(1);

    while tokio::time::Instant::now() < deadline {
        let profiles = session.profiles().await?;
        if profiles.iter().all(|p| !p.ping_in_progress) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    list(session).await
}

async fn wait_connected(session: &SessionHandle) -> Result<()> {
    loop {
        let snapshot = session.snapshot().await?;
        match snapshot.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Error => bail!(
                "Connection failed: {}",
                snapshot.last_error.unwrap_or_default()
            ),
            ConnectionState::Disconnected => bail!("Engine stopped before connecting"),
            ConnectionState::Connecting => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
}

async fn connect(session: &SessionHandle, row: Option<usize>) -> Result<()> {
    let events = session.subscribe();
    std::thread::spawn(move || {
        for event in events.iter() {
            match event {
                SessionEvent::StateChanged { state, error } => match error {
                    Some(error) => println!("[state] {} ({})", state, error),
                    None => println!("[state] {}", state),
                },
                SessionEvent::SelfTest { passed, message } => {
                    println!("[self-test] {}: {}", if passed { "ok" } else { "failed" }, message)
                }
                SessionEvent::TrafficUpdated {
                    rx_rate, tx_rate, ..
                } if rx_rate > 0 || tx_rate > 0 => {
                    println!("[traffic] down {} B/s, up {} B/s", rx_rate, tx_rate)
                }
                _ => {}
            }
        }
    });

    match row {
        Some(row) => session.connect(row).await?,
        None => session.connect_selected().await?,
    }
    wait_connected(session).await?;
    info!("Connected; press Ctrl-C to disconnect");

    let mut watchdog = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = watchdog.tick() => {
                let snapshot = session.snapshot().await?;
                if snapshot.state == ConnectionState::Error {
                    bail!("Session failed: {}", snapshot.last_error.unwrap_or_default());
                }
                if snapshot.state == ConnectionState::Disconnected {
                    info!("Engine stopped");
                    return Ok(());
                }
            }
        }
    }

    session.disconnect().await?;
    Ok(())
}

fn print_config(store: &dyn SettingsStore, row: Option<usize>) -> Result<()> {
    let settings = store.load()?;
    let profiles = ProfileStore::load(&settings.profiles_path).with_context(|| {
        format!("Failed to load profiles from {}", settings.profiles_path.display())
    })?;

    let row = row
        .or_else(|| {
            settings
                .selected_profile
                .as_deref()
                .and_then(|id| profiles.index_of(id))
        })
        .unwrap_or(0);
    let profile = profiles
        .get(row)
        .with_context(|| format!("No profile at row {}", row))?;

    println!("{}", build(profile, &settings.routing).to_pretty_string());
    Ok(())
}
