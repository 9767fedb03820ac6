use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use beepbeep::audio::device::{self, CpalAudio, DuplexAudio};
use beepbeep::audio::simulated::{DevicePlacement, RoomConfig, SimulatedRoom};
use beepbeep::comms::channel::CommChannel;
use beepbeep::comms::memory::MemoryChannel;
use beepbeep::comms::tcp::{TcpChannel, TcpCommListener};
use beepbeep::config::{Calibration, Config, Mode, RangingConfig};
use beepbeep::ranging::distance::one_way_distance;
use beepbeep::ranging::engine::{RangingEngine, RangingEvent};
use beepbeep::ranging::history::History;
use beepbeep::ranging::session::RangingSession;
use beepbeep::ranging::state::Role;
use beepbeep::ranging::stats::StatisticsSnapshot;

#[derive(Parser)]
#[command(name = "beepbeep", about = "Acoustic distance measurement between two devices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a target to connect and answer its ranging requests
    Anchor {
        /// TCP port to listen on (defaults to BEEPBEEP_LISTEN_PORT)
        #[arg(short, long)]
        port: Option<u16>,
        /// Serve a single connection, then exit
        #[arg(long)]
        once: bool,
    },
    /// Connect to an anchor and measure the distance to it
    Target {
        /// Anchor address (defaults to BEEPBEEP_ANCHOR_ADDR)
        #[arg(short, long)]
        anchor: Option<String>,
        /// Stop after this many results
        #[arg(short, long)]
        count: Option<u64>,
        /// Take a single measurement
        #[arg(long)]
        once: bool,
        /// Write the results to this file as JSON lines
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Range between two simulated devices in one process
    Simulate {
        /// Distance between the two devices in meters
        #[arg(short, long, default_value = "1.5")]
        distance: f64,
        /// Number of results to collect
        #[arg(short, long, default_value = "10")]
        count: u64,
        /// Standard deviation of the room noise
        #[arg(long, default_value = "0.01")]
        noise: f32,
        /// Write the results to this file as JSON lines
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// List available audio devices
    ListDevices,
    /// Play a chirp and find it again in the microphone signal
    SelfTest,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Set up logging: stderr + a log file in log_dir named after the device
    let log_dir = &config.log_dir;
    std::fs::create_dir_all(log_dir)?;

    // Clear the previous log file so each run starts fresh
    let log_file_name = format!("{}.log", config.device_name);
    let log_file_path = format!("{}/{}", log_dir, log_file_name);
    let _ = std::fs::write(&log_file_path, b"");

    let file_appender = tracing_appender::rolling::never(log_dir, &log_file_name);
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("beepbeep=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        device_name = %config.device_name,
        log_file = %log_file_path,
        "Starting beepbeep"
    );
    tracing::info!(
        response_delay_ms = config.ranging.timing.response_delay_secs * 1000.0,
        latency_budget_ms = config.ranging.echo_latency_budget_secs() * 1000.0,
        "Exchange schedule"
    );

    match cli.command {
        Commands::Anchor { port, once } => {
            run_anchor(&config, port.unwrap_or(config.listen_port), once).await?;
        }
        Commands::Target {
            anchor,
            count,
            once,
            export,
        } => {
            let addr = anchor.unwrap_or_else(|| config.anchor_addr.clone());
            let limit = if once { Some(1) } else { count };
            run_target(&config, addr, limit, export.as_deref()).await?;
        }
        Commands::Simulate {
            distance,
            count,
            noise,
            export,
        } => {
            simulate(&config, distance, count, noise, export.as_deref()).await?;
        }
        Commands::ListDevices => {
            device::list_devices(config.ranging.chirp.sample_rate_hz)?;
        }
        Commands::SelfTest => {
            self_test(&config)?;
        }
    }

    Ok(())
}

fn new_session(role: Role, ranging: RangingConfig, calibration: Calibration) -> Result<RangingSession> {
    let history = Arc::new(RwLock::new(History::new(
        ranging.history_capacity,
        ranging.outlier,
        ranging.smoothing,
    )));
    let session = RangingSession::new(role, Uuid::new_v4(), ranging, calibration, history)
        .context("Invalid ranging configuration")?;
    Ok(session)
}

/// How a session run ended, from the command's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Finished,
    Interrupted,
}

/// Drive one session to its end, printing results as they arrive.
async fn run_session(
    session: RangingSession,
    audio: Arc<dyn DuplexAudio>,
    channel: Arc<dyn CommChannel>,
    limit: Option<u64>,
    export: Option<&Path>,
) -> Result<RunEnd> {
    let (handle, mut events) = RangingEngine::spawn(session, audio, channel);
    let mut received = 0u64;
    let mut end = RunEnd::Finished;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RangingEvent::Result(result)) => {
                    received += 1;
                    let smoothed = result
                        .smoothed_meters
                        .map(|m| format!(" (smoothed {:.3} m)", m))
                        .unwrap_or_default();
                    let flag = result
                        .outlier
                        .map(|f| format!(" [outlier: {:?}]", f))
                        .unwrap_or_default();
                    println!(
                        "#{:<5} {:>8.3} m{}{}  rtt {:.0} ms",
                        result.sequence_number,
                        result.distance_meters,
                        smoothed,
                        flag,
                        result.round_trip_latency.as_secs_f64() * 1000.0
                    );
                    if limit.is_some_and(|n| received >= n) {
                        handle.stop();
                    }
                }
                Ok(RangingEvent::Abandoned { seq, reason }) => {
                    println!("#{:<5} no measurement: {}", seq, reason);
                }
                Ok(RangingEvent::Degraded { consecutive_failures }) => {
                    println!("Ranging degraded: {} consecutive failures", consecutive_failures);
                }
                Ok(RangingEvent::Recovered) => println!("Ranging recovered"),
                Ok(RangingEvent::StateChanged(state)) => {
                    tracing::debug!(%state, "Session state");
                }
                Ok(RangingEvent::Stopped(_)) => break,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Event receiver lagged by {} messages", n);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if end == RunEnd::Finished => {
                tracing::info!("Interrupted, stopping session");
                end = RunEnd::Interrupted;
                handle.stop();
            }
        }
    }

    print_summary(&handle.snapshot());
    if let Some(path) = export {
        export_history(&handle.history(), path)?;
    }
    if let Some(err) = handle.join().await? {
        if err.is_fatal() && end == RunEnd::Finished {
            return Err(err).context("Ranging session failed");
        }
    }
    Ok(end)
}

fn print_summary(snapshot: &StatisticsSnapshot) {
    let accepted = &snapshot.accepted;
    println!(
        "\n{} attempts, {} results ({} accepted), success rate {:.0}%",
        snapshot.attempts,
        snapshot.all.count,
        accepted.count,
        snapshot.success_rate * 100.0
    );
    if let (Some(mean), Some(std), Some(min), Some(max)) =
        (accepted.mean, accepted.std_dev, accepted.min, accepted.max)
    {
        println!(
            "mean {:.3} m, std {:.3} m, min {:.3} m, max {:.3} m, {:.2} results/s",
            mean, std, min, max, snapshot.rate_hz
        );
    }
}

fn export_history(history: &RwLock<History>, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let history = history.read().map_err(|e| anyhow::anyhow!("{}", e))?;
    history
        .export_json_lines(std::io::BufWriter::new(file))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Exported {} results to {}", history.len(), path.display());
    Ok(())
}

async fn run_anchor(config: &Config, port: u16, once: bool) -> Result<()> {
    let listener = TcpCommListener::bind(port)?;
    let audio: Arc<dyn DuplexAudio> = Arc::new(CpalAudio::open(config.ranging.chirp.sample_rate_hz)?);
    tracing::info!(addr = %listener.local_addr()?, audio = %audio.description(), "Anchor waiting for a target");

    loop {
        let channel = match listener.try_accept()? {
            Some(channel) => channel,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        };

        let session = new_session(Role::Responder, config.ranging, config.calibration)?;
        let end = run_session(session, audio.clone(), Arc::new(channel), None, None).await?;
        if once || end == RunEnd::Interrupted {
            break;
        }
        tracing::info!("Target gone, waiting for the next one");
    }
    Ok(())
}

async fn run_target(config: &Config, addr: String, limit: Option<u64>, export: Option<&Path>) -> Result<()> {
    let mut ranging = config.ranging;
    if limit == Some(1) {
        ranging.mode = Mode::SingleShot;
    }
    let audio: Arc<dyn DuplexAudio> = Arc::new(CpalAudio::open(ranging.chirp.sample_rate_hz)?);
    let channel = tokio::task::spawn_blocking(move || TcpChannel::connect(&addr)).await??;

    let session = new_session(Role::Initiator, ranging, config.calibration)?;
    run_session(session, audio, Arc::new(channel), limit, export).await?;
    Ok(())
}

async fn simulate(
    config: &Config,
    distance: f64,
    count: u64,
    noise: f32,
    export: Option<&Path>,
) -> Result<()> {
    let ranging = config.ranging;
    let room = SimulatedRoom::new(RoomConfig {
        sample_rate: ranging.chirp.sample_rate_hz,
        speed_of_sound: ranging.speed_of_sound,
        noise_std: noise,
        ..RoomConfig::default()
    });

    let anchor_place = DevicePlacement::at(0.0);
    // Unrelated clocks on the two devices
    let target_place = DevicePlacement {
        clock_offset_samples: 7_654_321,
        output_latency_samples: 96,
        ..DevicePlacement::at(distance)
    };
    let anchor_audio = room.add_device(anchor_place);
    let target_audio = room.add_device(target_place);
    println!(
        "Simulated room: true distance {:.3} m",
        room.true_distance(&target_audio, &anchor_audio)
    );

    let (anchor_end, target_end) = MemoryChannel::pair();
    let anchor = new_session(
        Role::Responder,
        ranging,
        Calibration {
            speaker_to_mic_distance_m: anchor_place.speaker_to_mic_m,
        },
    )?;
    let target = new_session(
        Role::Initiator,
        ranging,
        Calibration {
            speaker_to_mic_distance_m: target_place.speaker_to_mic_m,
        },
    )?;

    let (anchor_handle, _anchor_events) =
        RangingEngine::spawn(anchor, Arc::new(anchor_audio), Arc::new(anchor_end));
    let outcome = run_session(
        target,
        Arc::new(target_audio),
        Arc::new(target_end),
        Some(count),
        export,
    )
    .await;
    anchor_handle.shutdown().await?;
    outcome.map(|_| ())
}

fn self_test(config: &Config) -> Result<()> {
    let ranging = &config.ranging;
    let audio = CpalAudio::open(ranging.chirp.sample_rate_hz)?;
    println!("Audio: {}", audio.description());

    let report = device::self_test(&audio, &ranging.chirp, ranging.detector)?;
    let delay = report.loop_delay_secs();
    println!(
        "Chirp {}: score {:.3}, loop delay {:.2} ms (~{:.2} m of sound, calibrated speaker-to-mic {:.2} m)",
        if report.valid { "detected" } else { "NOT detected" },
        report.correlation_score,
        delay * 1000.0,
        one_way_distance(ranging.speed_of_sound, delay),
        config.calibration.speaker_to_mic_distance_m
    );
    if !report.valid {
        anyhow::bail!("Self-test failed: chirp not found in the microphone signal");
    }
    Ok(())
}
