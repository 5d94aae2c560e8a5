//! CLI entry point for sweep_daq
//!
//! Runs one experiment against the configured instruments and writes the samples as CSV.
//!
//! ```bash
//! sweep_daq --simulate iv --start 0 --stop 1 --steps 11 --output iv.csv
//! sweep_daq --config bench.toml log --value 0.5 --interval-ms 100 --duration-ms 5000
//! ```
//!
//! Ctrl+C cancels the run at its next point boundary; the output is switched off and the
//! samples recorded so far are still written.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

use sweep_daq::config::{EngineConfig, InstrumentDefinition};
use sweep_daq::dialect::{InstrumentFamily, InstrumentKind};
use sweep_daq::experiment::{
    Experiment, ExperimentOrchestrator, ExperimentRequest, InstrumentRegistry,
    OrchestratorSettings, RunReport,
};
use sweep_daq::measurement::{MeasureType, SourceSpec};
use sweep_daq::poller::{PollerHandle, Telemetry, TemperaturePoller};
use sweep_daq::run::{RunEvent, RunStatus};
use sweep_daq::stabilizer::StabilizationTarget;
use sweep_daq::sweep::{SweepDirection, SweepPlan};
use sweep_daq::validator::ResponseValidator;
use sweep_daq::{export, logging};

#[derive(Parser)]
#[command(name = "sweep_daq")]
#[command(about = "Sweep and logging experiments on source-measure units", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use simulated instruments instead of VISA
    #[arg(long, global = true)]
    simulate: bool,

    /// Print run events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// DC I-V sweep (voltage source, current measure)
    Iv {
        /// First setpoint in V
        #[arg(long)]
        start: f64,
        /// Last setpoint in V
        #[arg(long)]
        stop: f64,
        #[arg(long, default_value_t = 11)]
        steps: usize,
        #[arg(long, default_value_t = 1)]
        cycles: usize,
        /// Sweep back down after each forward pass
        #[arg(long)]
        bidirectional: bool,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        gate: GateArgs,
        /// CSV output path
        #[arg(long, short, default_value = "iv.csv")]
        output: PathBuf,
    },
    /// Log current at a fixed source voltage
    Log {
        /// Source voltage in V
        #[arg(long, default_value_t = 0.0)]
        value: f64,
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
        #[arg(long, default_value_t = 10_000)]
        duration_ms: u64,
        #[command(flatten)]
        source: SourceArgs,
        /// CSV output path
        #[arg(long, short, default_value = "log.csv")]
        output: PathBuf,
    },
    /// List configured instruments
    List,
}

#[derive(Args)]
struct SourceArgs {
    /// Source-measure unit id (defaults to the first one configured)
    #[arg(long)]
    smu: Option<String>,
    /// Current compliance in A
    #[arg(long, default_value_t = 0.01)]
    compliance: f64,
    /// Wait between setting a level and measuring, in ms
    #[arg(long, default_value_t = 100)]
    delay_ms: u64,
}

#[derive(Args)]
struct GateArgs {
    /// Wait for this temperature in °C before sweeping
    #[arg(long)]
    gate_temperature: Option<f64>,
    #[arg(long, default_value_t = 0.5)]
    gate_tolerance: f64,
    #[arg(long, default_value_t = 600)]
    gate_timeout_s: u64,
    /// Temperature controller id (defaults to the first one configured)
    #[arg(long)]
    controller: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::load().context("loading configuration")?,
    };
    logging::init_from_config(&config).context("initializing logging")?;

    if cli.simulate && config.instruments.is_empty() {
        config.instruments = simulated_bench();
    }

    if let Commands::List = cli.command {
        for instrument in &config.instruments {
            println!(
                "{:<12} {:<16} {:<28} {}",
                instrument.id,
                instrument.kind,
                instrument.resource,
                if instrument.enabled { "enabled" } else { "disabled" }
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    let registry = InstrumentRegistry::connect(&config, cli.simulate)
        .await
        .context("connecting instruments")?;
    let poller = start_poller(&config, &registry)?;
    let orchestrator = ExperimentOrchestrator::new(registry, OrchestratorSettings::from(&config))
        .context("building orchestrator")?;

    let (request, output) = build_request(cli.command, orchestrator.registry())?;
    let report = run(&orchestrator, request, cli.json).await?;

    if let Some(poller) = poller {
        let stats = poller.shutdown().await?;
        info!(readings = stats.readings, skipped = stats.skipped, "telemetry summary");
    }

    export::save_csv(&output, &report.samples)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("{} samples written to {}", report.samples.len(), output.display());

    Ok(match report.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Cancelled => {
            eprintln!("run cancelled");
            ExitCode::from(130)
        }
        RunStatus::Failed { cause } => {
            eprintln!("run failed: {cause}");
            ExitCode::FAILURE
        }
    })
}

/// One instrument of each supported family, for `--simulate` without a config file.
fn simulated_bench() -> Vec<InstrumentDefinition> {
    [
        ("smu", InstrumentKind::Keithley2450),
        ("cryo", InstrumentKind::LakeShore335),
        ("lockin", InstrumentKind::Sr830),
    ]
    .into_iter()
    .map(|(id, kind)| InstrumentDefinition {
        id: id.to_string(),
        kind,
        resource: format!("SIM::{}", id.to_uppercase()),
        channel: None,
        enabled: true,
    })
    .collect()
}

fn start_poller(
    config: &EngineConfig,
    registry: &InstrumentRegistry,
) -> Result<Option<PollerHandle>> {
    let Some(id) = registry.first_of(InstrumentFamily::TemperatureController) else {
        return Ok(None);
    };
    let session = registry.get(id)?.session.clone();
    let poller = TemperaturePoller::new(
        session,
        ResponseValidator::new(config.recovery_policy())?,
        &config.poller.input,
        Duration::from_millis(config.poller.interval_ms),
    )?;
    let handle = poller.spawn();

    let mut updates = handle.subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let telemetry = updates.borrow_and_update().clone();
            match telemetry {
                Telemetry::Reading { celsius, .. } => info!(celsius, "temperature"),
                Telemetry::Unavailable { reason } => warn!(%reason, "temperature unavailable"),
                Telemetry::Skipped { .. } | Telemetry::Pending => {}
            }
        }
    });
    Ok(Some(handle))
}

fn resolve(
    requested: Option<String>,
    registry: &InstrumentRegistry,
    family: InstrumentFamily,
) -> Result<String> {
    requested
        .or_else(|| registry.first_of(family).map(str::to_string))
        .ok_or_else(|| anyhow!("no {family:?} instrument configured"))
}

fn source_spec(value: f64, args: &SourceArgs) -> SourceSpec {
    SourceSpec::voltage(value, args.compliance).with_delay(Duration::from_millis(args.delay_ms))
}

fn build_request(
    command: Commands,
    registry: &InstrumentRegistry,
) -> Result<(ExperimentRequest, PathBuf)> {
    match command {
        Commands::Iv {
            start,
            stop,
            steps,
            cycles,
            bidirectional,
            source,
            gate,
            output,
        } => {
            let direction = if bidirectional {
                SweepDirection::Bidirectional
            } else {
                SweepDirection::Forward
            };
            let plan = SweepPlan::new(start, stop, steps)
                .with_cycles(cycles)
                .with_direction(direction);
            let mut request = ExperimentRequest::new(Experiment::IvSweep {
                smu: resolve(source.smu.clone(), registry, InstrumentFamily::SourceMeter)?,
                plan,
                source: source_spec(start, &source),
            });
            if let Some(temperature) = gate.gate_temperature {
                let controller = resolve(
                    gate.controller,
                    registry,
                    InstrumentFamily::TemperatureController,
                )?;
                request = request.with_temperature_gate(
                    controller,
                    StabilizationTarget::new(
                        temperature,
                        gate.gate_tolerance,
                        Duration::from_secs(gate.gate_timeout_s),
                    ),
                );
            }
            Ok((request, output))
        }
        Commands::Log {
            value,
            interval_ms,
            duration_ms,
            source,
            output,
        } => {
            let request = ExperimentRequest::new(Experiment::TimeLogging {
                smu: resolve(source.smu.clone(), registry, InstrumentFamily::SourceMeter)?,
                source: source_spec(value, &source),
                measure: MeasureType::Current,
                interval: Duration::from_millis(interval_ms),
                duration: Duration::from_millis(duration_ms),
            });
            Ok((request, output))
        }
        Commands::List => Err(anyhow!("list does not run an experiment")),
    }
}

async fn run(
    orchestrator: &ExperimentOrchestrator,
    request: ExperimentRequest,
    json: bool,
) -> Result<RunReport> {
    let mut handle = orchestrator.spawn(request);
    let cancel = handle.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling run...");
            cancel.cancel();
        }
    });

    while let Some(event) = handle.next_event().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }
        match event {
            RunEvent::Sample { sample, .. } => match sample.y {
                Some(y) => println!("{:>6}  {:>14.6e}  {:>14.6e}", sample.index, sample.x, y),
                None => println!("{:>6}  {:>14.6e}  {:>14}", sample.index, sample.x, "None"),
            },
            RunEvent::StateChanged { state, .. } => info!(%state, "run state"),
            RunEvent::Finished { .. } => {}
        }
    }
    Ok(handle.join().await?)
}
