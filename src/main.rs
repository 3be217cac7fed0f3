use anyhow::Context;
use clap::Parser;
use kinetic_pulse::application::{MotionListener, MotionOrchestrator};
use kinetic_pulse::domain::classifier::{ActivityClassifier, ClassifierConfig};
use kinetic_pulse::domain::clock::SystemClock;
use kinetic_pulse::domain::models::{ConnectionState, MotionSnapshot, SensorMode};
use kinetic_pulse::domain::pose::{PoseConfig, PoseEngine};
use kinetic_pulse::domain::settings::SettingsService;
use kinetic_pulse::infrastructure::bluetooth::connection::ConnectionConfig;
use kinetic_pulse::infrastructure::bluetooth::replay::ReplayTransport;
use kinetic_pulse::infrastructure::bluetooth::service;
use kinetic_pulse::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use kinetic_pulse::infrastructure::logging;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Host companion for the ESP32 motion peripheral")]
struct Cli {
    /// Replay a captured newline-delimited JSON log instead of using the radio
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Delay between replayed notification chunks
    #[arg(long, default_value_t = 20, value_name = "MS")]
    chunk_interval_ms: u64,

    /// Settings file to use instead of the per-user one
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level filter, overrides the settings file
    #[arg(long)]
    log_level: Option<String>,

    /// Detect movement from the host gyroscope instead of the peripheral
    #[arg(long)]
    phone_gyro: bool,
}

type TransportParts = (
    Box<dyn BleTransport>,
    mpsc::UnboundedReceiver<TransportEvent>,
);

#[cfg(windows)]
fn platform_transport() -> anyhow::Result<TransportParts> {
    let (transport, events) =
        kinetic_pulse::infrastructure::bluetooth::winrt::WinRtTransport::new();
    Ok((Box::new(transport), events))
}

#[cfg(not(windows))]
fn platform_transport() -> anyhow::Result<TransportParts> {
    anyhow::bail!("No Bluetooth backend on this platform, use --replay <FILE>")
}

/// Writes movement and calibration callbacks to the log.
struct ConsoleListener;

impl MotionListener for ConsoleListener {
    fn on_left(&mut self) {
        info!("<< LEFT");
    }
    fn on_right(&mut self) {
        info!(">> RIGHT");
    }
    fn on_forward(&mut self) {
        info!("^^ FORWARD");
    }
    fn on_back(&mut self) {
        info!("vv BACK");
    }
    fn on_calibration_phase(&mut self, text: &str, _color: u32) {
        info!("Calibration: {}", text);
    }
}

async fn report_snapshots(mut snapshots: watch::Receiver<MotionSnapshot>) {
    let mut shown = snapshots.borrow_and_update().clone();
    while snapshots.changed().await.is_ok() {
        let current = snapshots.borrow_and_update().clone();
        if current.connection_state != shown.connection_state {
            info!("Link: {}", current.connection_state);
        }
        let counts = |s: &MotionSnapshot| {
            (s.left_count, s.right_count, s.forward_count, s.back_count)
        };
        if counts(&current) != counts(&shown) {
            info!(
                "Counts L={} R={} F={} B={}",
                current.left_count, current.right_count, current.forward_count, current.back_count
            );
        }
        if current.ai_activity != shown.ai_activity {
            if let Some(direction) = current.ai_activity {
                info!(
                    "Activity hint: {} ({:.0}%)",
                    direction.as_str(),
                    current.ai_confidence * 100.0
                );
            }
        }
        shown = current;
    }
}

/// Resolves once a replayed link has come up and gone down again.
async fn replay_finished(mut state: watch::Receiver<ConnectionState>) {
    if state.wait_for(ConnectionState::is_connected).await.is_err() {
        return;
    }
    let _ = state.wait_for(|s| !s.is_busy()).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings_service = match &cli.config {
        Some(path) => SettingsService::load_from(path),
        None => SettingsService::new().context("Failed to load settings")?,
    };
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings, cli.log_level.as_deref())
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting motion host ({})", settings_service.path().display());

    let (transport, transport_events) = match &cli.replay {
        Some(path) => {
            let (transport, events) =
                ReplayTransport::from_file(path, Duration::from_millis(cli.chunk_interval_ms))?;
            (Box::new(transport) as Box<dyn BleTransport>, events)
        }
        None => platform_transport()?,
    };

    let (link, link_events) = service::spawn(
        transport,
        transport_events,
        ConnectionConfig::from(&settings.ble),
    );
    if cli.replay.is_some() {
        let link = link.clone();
        tokio::spawn(async move {
            replay_finished(link.subscribe()).await;
            info!("Replay complete");
            // Queued link events still reach the orchestrator before it stops.
            link.close();
        });
    }

    let pose = PoseEngine::new(
        PoseConfig::from(&settings.pose),
        Box::new(SystemClock::new()),
    );
    // No bundled model: activity hints stay off.
    let classifier = ActivityClassifier::new(None, ClassifierConfig::from(&settings.classifier));

    let mut orchestrator = MotionOrchestrator::new(
        link,
        pose,
        classifier,
        Box::new(ConsoleListener),
        &settings,
    );
    tokio::spawn(report_snapshots(orchestrator.subscribe()));

    if cli.phone_gyro {
        warn!("No host gyroscope source is attached; only calibration prompts will run");
        orchestrator.set_sensor_mode(SensorMode::HostGyro);
    }

    // Held open so the pose branch stays idle rather than closed.
    let (_pose_samples_tx, pose_samples) = mpsc::unbounded_channel();

    orchestrator.connect();

    tokio::select! {
        _ = orchestrator.run(link_events, pose_samples) => {
            info!("Link actor stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    let summary = orchestrator.snapshot();
    info!(
        "Final counts L={} R={} F={} B={}",
        summary.left_count, summary.right_count, summary.forward_count, summary.back_count
    );
    orchestrator.close();

    Ok(())
}
