//! `stc-daq` command-line entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_driver_stc::CounterId;
use stc_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use stc_daq::logging;
use stc_daq::scenarios::{
    acquire, count_events, generate_pulses, AcquireRequest, CountRequest, PulseRequest,
    SimulatedRig,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "stc-daq")]
#[command(about = "DAQ-STC driver core on simulated boards", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count edges on a PFI pin
    Count {
        #[arg(long, default_value_t = 0)]
        minor: u32,
        /// Counter number (0 or 1)
        #[arg(long, default_value_t = 0)]
        counter: u32,
        #[arg(long, default_value_t = 0)]
        pfi: u8,
        /// Edges produced by the simulated signal
        #[arg(long, default_value_t = 1000)]
        edges: u32,
        /// Gate the count with a pulse of this many 20 MHz ticks from the
        /// other counter
        #[arg(long)]
        gate_ticks: Option<u32>,
    },

    /// Generate pulses and step through terminal counts
    Pulses {
        #[arg(long, default_value_t = 0)]
        minor: u32,
        #[arg(long, default_value_t = 0)]
        counter: u32,
        #[arg(long, default_value_t = 10_000)]
        low: u32,
        #[arg(long, default_value_t = 10_000)]
        high: u32,
        #[arg(long, default_value_t = 2)]
        delay: u32,
        /// Single pulse instead of a continuous train
        #[arg(long)]
        single: bool,
        /// Program disarmed and arm in a separate step
        #[arg(long)]
        delay_start: bool,
        #[arg(long, default_value_t = 2)]
        tc_events: u32,
    },

    /// Run a finite buffered acquisition
    Acquire {
        #[arg(long, default_value_t = 0)]
        minor: u32,
        #[arg(long, value_delimiter = ',', default_value = "0,1")]
        channels: Vec<u8>,
        #[arg(long, default_value_t = 10)]
        scans: u32,
        #[arg(long, default_value_t = 20_000)]
        interval_ticks: u32,
        /// Simulated milliseconds between scans
        #[arg(long, default_value_t = 2)]
        period_ms: u64,
        /// Bytes per read call
        #[arg(long, default_value_t = 64)]
        chunk: usize,
    },

    /// Validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;
    info!(
        name = %config.application.name,
        boards = config.driver.boards.len(),
        "configuration loaded"
    );

    if let Commands::CheckConfig = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let rig = Arc::new(SimulatedRig::new(config.driver.clone())?);

    // Ctrl-C interrupts whichever driver call is blocked
    let signal = rig.signal().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received");
            signal.raise();
        }
    });

    let command = cli.command;
    tokio::task::spawn_blocking(move || run(&rig, command))
        .await
        .context("scenario task panicked")?
}

fn run(rig: &SimulatedRig, command: Commands) -> Result<()> {
    match command {
        Commands::Count {
            minor,
            counter,
            pfi,
            edges,
            gate_ticks,
        } => {
            let report = count_events(
                rig,
                &CountRequest {
                    minor,
                    counter: CounterId::from_index(counter)?,
                    source_pfi: pfi,
                    edges,
                    gate_ticks,
                },
            )?;
            let mode = if report.gated { "gated" } else { "live" };
            println!("{}: {} edges ({mode})", report.counter, report.count);
        }
        Commands::Pulses {
            minor,
            counter,
            low,
            high,
            delay,
            single,
            delay_start,
            tc_events,
        } => {
            let report = generate_pulses(
                rig,
                &PulseRequest {
                    minor,
                    counter: CounterId::from_index(counter)?,
                    low_ticks: low,
                    high_ticks: high,
                    delay_ticks: delay,
                    continuous: !single,
                    delay_start,
                    tc_events,
                },
            )?;
            println!(
                "{}: {:.3} Hz, load A={} B={}",
                report.counter, report.frequency_hz, report.load_registers.0, report.load_registers.1
            );
            for (step, phase) in report.phases.iter().enumerate() {
                println!("  step {step}: {phase:?}");
            }
            println!("  armed at end: {}", report.armed_at_end);
        }
        Commands::Acquire {
            minor,
            channels,
            scans,
            interval_ticks,
            period_ms,
            chunk,
        } => {
            let width = channels.len().max(1);
            let report = acquire(
                rig,
                &AcquireRequest {
                    minor,
                    channels,
                    scans,
                    scan_interval_ticks: interval_ticks,
                    period: Duration::from_millis(period_ms),
                    read_chunk: chunk,
                },
            )?;
            println!(
                "{} scans, {} samples in {} reads",
                report.scans_produced,
                report.samples.len(),
                report.reads
            );
            for (scan, row) in report.samples.chunks(width).enumerate() {
                println!("  scan {scan:>4}: {row:?}");
            }
        }
        Commands::CheckConfig => {}
    }
    Ok(())
}
