//! CLI Entry Point for autoclave_daq
//!
//! Provides command-line interface for:
//! - Running a curing cycle (preview panel plus recording)
//! - Running the live preview panel only
//! - Writing the configured setpoints to the controllers
//! - Checking a configuration file
//!
//! # Usage
//!
//! Record a cycle from the field bus:
//! ```bash
//! autoclave_daq --config config/autoclave.toml run
//! ```
//!
//! Replay a recorded sequence for 20 samples:
//! ```bash
//! autoclave_daq run --demo demos/cure_profile.csv --samples 20
//! ```

use anyhow::{Context, Result};
use autoclave_daq::acquisition::{LoopKind, LoopOptions, LoopState};
use autoclave_daq::config::Settings;
use autoclave_daq::logging;
use autoclave_daq::notify::{recv_change, Change, Notification, Notifier};
use autoclave_daq::session::{CycleSession, SourceKind};
use autoclave_daq::source::DemoSequence;
use autoclave_daq::transport::RtuTransport;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "autoclave_daq")]
#[command(about = "Autoclave curing-cycle data acquisition", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/autoclave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SourceArgs {
    /// Replay this headerless CSV instead of polling the field bus
    #[arg(long)]
    demo: Option<PathBuf>,

    /// Stop after this many samples
    #[arg(long)]
    samples: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a curing cycle: live preview plus recording until Ctrl-C
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Do not run the preview loop alongside the recording
        #[arg(long)]
        no_preview: bool,
    },

    /// Run the live panel only
    Preview {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Write every active channel's setpoint to its controller
    WriteSetpoints,

    /// Validate the configuration and print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    settings.validate()?;
    logging::init_from_settings(&settings)?;
    let settings = Arc::new(settings);

    match cli.command {
        Commands::Run { source, no_preview } => run_cycle(settings, source, !no_preview).await,
        Commands::Preview { source } => run_preview(settings, source).await,
        Commands::WriteSetpoints => write_setpoints(settings),
        Commands::CheckConfig => {
            check_config(&settings);
            Ok(())
        }
    }
}

fn open_session(settings: &Arc<Settings>, demo: Option<&PathBuf>) -> Result<CycleSession> {
    let source = match demo {
        Some(path) => SourceKind::Demo(
            DemoSequence::from_csv(path)
                .with_context(|| format!("loading demo sequence {}", path.display()))?,
        ),
        None => SourceKind::Live(Box::new(RtuTransport::new(settings.link.clone()))),
    };
    let notifier = Notifier::new(settings.acquisition.notify_capacity);
    CycleSession::open(Arc::clone(settings), source, notifier).map_err(|err| {
        if err.is_fatal() {
            error!(error = %err, "Cannot start cycle");
        } else {
            warn!(error = %err, "Cycle not started");
        }
        err.into()
    })
}

fn with_limit(options: LoopOptions, samples: Option<u64>) -> LoopOptions {
    match samples {
        Some(n) => options.with_tick_limit(n),
        None => options,
    }
}

async fn run_cycle(settings: Arc<Settings>, args: SourceArgs, preview: bool) -> Result<()> {
    let mut session = open_session(&settings, args.demo.as_ref())?;
    let mut rx = session.subscribe();

    if preview {
        session.start_preview()?;
    }
    session.start_recording_with(with_limit(LoopOptions::recording(&settings), args.samples))?;
    info!(
        period = ?settings.acquisition.sample_period(),
        channels = ?settings.active_channels(),
        demo = session.is_demo(),
        "Recording started"
    );

    let mut next_row = 0;
    let mut recheck = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted, stopping cycle");
                break;
            }
            change = recv_change(&mut rx) => match change {
                Change::Signal(Notification::FatalAcquisitionError(message)) => {
                    error!(%message, "Acquisition aborted");
                    break;
                }
                Change::Signal(Notification::BatchReady { kind: LoopKind::Preview, .. }) => {}
                Change::Closed => break,
                Change::Signal(Notification::BatchReady { .. }) | Change::Lagged(_) => {
                    next_row = report_rows(&session, next_row);
                }
            },
            _ = recheck.tick() => {}
        }
        if session.recording_state() == Some(LoopState::Stopped) {
            next_row = report_rows(&session, next_row);
            break;
        }
    }

    let report = session.stop()?;
    let events = session.events();
    info!(
        rows = next_row,
        recording = ?report.recording,
        dwell_minutes = ?events.dwell_minutes,
        release_temperature = ?events.release_temperature,
        "Cycle finished"
    );
    Ok(())
}

/// Log every row appended since `start`; returns the next unseen index.
fn report_rows(session: &CycleSession, start: usize) -> usize {
    let rows = session.store().rows_from(start);
    let Some(last) = rows.last().map(|row| row.index + 1) else {
        return start;
    };
    let events = session.events();
    for row in rows {
        info!(
            row = row.index,
            minutes = row.elapsed_minutes,
            time = %row.timestamp.format("%H:%M:%S"),
            values = ?row.values,
            dwell = ?events.dwell_minutes,
            release = ?events.release_temperature,
            "Sample"
        );
    }
    last
}

async fn run_preview(settings: Arc<Settings>, args: SourceArgs) -> Result<()> {
    let mut session = open_session(&settings, args.demo.as_ref())?;
    let mut rx = session.subscribe();
    session.start_preview_with(with_limit(LoopOptions::preview(&settings), args.samples))?;

    let mut recheck = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            change = recv_change(&mut rx) => match change {
                Change::Signal(Notification::FatalAcquisitionError(_)) | Change::Closed => break,
                Change::Signal(_) | Change::Lagged(_) => {
                    if let Some(latest) = session.latest() {
                        info!(
                            time = %latest.timestamp.format("%H:%M:%S"),
                            values = ?latest.values,
                            "Live values"
                        );
                    }
                }
            },
            _ = recheck.tick() => {}
        }
        if session.preview_state() == Some(LoopState::Stopped) {
            break;
        }
    }

    session.stop()?;
    Ok(())
}

fn write_setpoints(settings: Arc<Settings>) -> Result<()> {
    let session = open_session(&settings, None)?;
    match session.write_setpoints() {
        Ok(written) => {
            println!("Wrote {written} setpoint(s) on {}", settings.link.port);
            Ok(())
        }
        Err(err) => {
            warn!(error = %err, "Setpoint write aborted");
            Err(err.into())
        }
    }
}

fn check_config(settings: &Settings) {
    println!("Configuration OK: {}", settings.application.name);
    println!(
        "  link: {} @ {} baud, {:?} registers",
        settings.link.port, settings.link.baud_rate, settings.link.register_kind
    );
    println!(
        "  periods: record {:?}, panel {:?}",
        settings.acquisition.sample_period(),
        settings.acquisition.panel_period()
    );
    println!(
        "  core channel {}, pressure channel {}, setpoint {}",
        settings.acquisition.core_temp_channel,
        settings.acquisition.pressure_channel,
        settings.acquisition.core_temp_setpoint
    );
    for (i, channel) in settings.channels.iter().enumerate() {
        println!(
            "  [{:>2}] {:<16} dev {:>3} pv {:#06x} sv {:#06x} {}",
            i + 1,
            channel.label,
            channel.device_address,
            channel.process_register,
            channel.setpoint_register,
            if channel.active { "active" } else { "inactive" }
        );
    }
}
