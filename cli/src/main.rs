//! Driver CLI for the particle transport engine
//!
//! Two subcommands:
//! - `run`: drive the reference sphere-leakage problem through the engine,
//!   with checkpoint/resume support
//! - `report`: load a rendezvous file and write a per-estimator CSV of
//!   energy bin upper bounds, means and relative errors
//!
//! The driver consumes only the engine's read-only statistical views; it
//! performs no accumulation itself.

use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use particle_simulator_core_rs::{
    Checkpoint, EstimatorConfig, EstimatorKind, RendezvousConfig, RendezvousFileMode,
    RendezvousPolicy, SimulationConfig, SimulationManager, SimulationReport, SphereLeakageKernel,
};

#[derive(Parser, Debug)]
#[command(name = "particle-sim", about = "Monte Carlo particle transport driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run (or resume) a simulation of the reference sphere problem.
    Run(RunArgs),
    /// Write a CSV results report from a rendezvous file.
    Report(ReportArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Simulation name; prefixes checkpoint and report files.
    #[arg(long, default_value = "sphere")]
    sim_name: String,

    /// Total number of particle histories.
    #[arg(long, default_value_t = 1_000_000)]
    histories: u64,

    /// Source energy in MeV.
    #[arg(long, default_value_t = 1.0)]
    source_energy: f64,

    /// Energy bin boundaries in MeV, comma separated, strictly increasing.
    #[arg(long, default_value = "0,0.5,1", value_delimiter = ',')]
    energy_bins: Vec<f64>,

    /// Master seed for the run.
    #[arg(long, default_value_t = 463_546_384)]
    seed: u64,

    /// Worker threads (1 selects the interruptible single-worker mode).
    #[arg(long, default_value_t = num_cpus::get())]
    threads: usize,

    /// Histories per dispatched batch.
    #[arg(long, default_value_t = 10_000)]
    batch_size: u64,

    /// Completed histories between rendezvous.
    #[arg(long, default_value_t = 100_000)]
    rendezvous_stride: u64,

    /// Keep every rendezvous file instead of overwriting one.
    #[arg(long)]
    multiple_rendezvous_files: bool,

    /// Directory for rendezvous files.
    #[arg(long, default_value = "rendezvous")]
    checkpoint_dir: PathBuf,

    /// Resume from the latest rendezvous in the checkpoint directory.
    #[arg(long, conflicts_with = "start_at")]
    resume: bool,

    /// Start the run at an arbitrary history index.
    #[arg(long)]
    start_at: Option<u64>,
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// The rendezvous file to load.
    #[arg(long)]
    rendezvous_file: PathBuf,

    /// The number of particles corresponding to the results; used only to
    /// name the output file.
    #[arg(long)]
    nps: String,

    /// Simulation name; prefixes the report file.
    #[arg(long, default_value = "sphere")]
    sim_name: String,
}

/// Estimator 1 scores surface current, estimator 2 surface flux, both on
/// the sphere surface (entity 1) — the layout of the reference problem.
fn estimator_configs(energy_bins: &[f64]) -> Vec<EstimatorConfig> {
    vec![
        EstimatorConfig {
            id: 1,
            kind: EstimatorKind::SurfaceCurrent,
            energy_bin_boundaries: energy_bins.to_vec(),
            entity_ids: vec![1],
        },
        EstimatorConfig {
            id: 2,
            kind: EstimatorKind::SurfaceFlux { surface_area: 1.0 },
            energy_bin_boundaries: energy_bins.to_vec(),
            entity_ids: vec![1],
        },
    ]
}

fn simulation_config(args: &RunArgs) -> SimulationConfig {
    SimulationConfig {
        total_histories: args.histories,
        max_batch_size: args.batch_size,
        master_seed: args.seed,
        estimators: estimator_configs(&args.energy_bins),
        geometry_model_id: format!("{}.h5m", args.sim_name),
        material_ids: vec!["H1".to_string(), "O16".to_string()],
        rendezvous: RendezvousConfig {
            directory: args.checkpoint_dir.clone(),
            basename: args.sim_name.clone(),
            policy: RendezvousPolicy::HistoryStride {
                stride: args.rendezvous_stride,
            },
            file_mode: if args.multiple_rendezvous_files {
                RendezvousFileMode::MultipleFiles
            } else {
                RendezvousFileMode::SingleLatest
            },
            max_write_attempts: 3,
            retry_backoff: Duration::from_millis(250),
        },
        min_number_of_rendezvous: None,
        max_rendezvous_batch_size: None,
        worker_deadline: Duration::from_secs(600),
        max_batch_reissues: 3,
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let config = simulation_config(&args);
    let kernel = SphereLeakageKernel::new(args.source_energy, 1, 2, 1);

    let mut manager = if args.resume {
        SimulationManager::resume_or_new(config)?
    } else if let Some(offset) = args.start_at {
        SimulationManager::with_resume_offset(config, offset)?
    } else {
        SimulationManager::new(config)?
    };

    println!(
        "run {}: {} histories, starting at {}, {} thread(s)",
        manager.run_state().run_id(),
        args.histories,
        manager.run_state().completed_histories(),
        args.threads
    );

    let report = if args.threads == 1 {
        let interrupt = AtomicBool::new(false);
        manager.run_interruptible_simulation(&kernel, &interrupt)?
    } else {
        manager.run_simulation(&kernel, args.threads)?
    };

    print_summary(&report, &manager);
    Ok(())
}

fn print_summary(report: &SimulationReport, manager: &SimulationManager) {
    println!(
        "completed {}/{} histories, {} rendezvous written, {} batch(es) reissued",
        report.completed_histories,
        report.total_histories,
        report.checkpoints_written,
        report.batches_reissued
    );
    if let Some(path) = manager.run_state().latest_checkpoint() {
        println!("latest rendezvous: {}", path.display());
    }
    if report.interrupted {
        println!("run interrupted; resume with --resume");
    }
    if report.durability_degraded {
        eprintln!(
            "warning: one or more rendezvous writes were abandoned; \
             a crash would resume from an older checkpoint"
        );
    }
}

fn report(args: ReportArgs) -> Result<(), Box<dyn Error>> {
    let checkpoint = Checkpoint::load(&args.rendezvous_file)?;

    let file_name = format!("{}_results_{}.csv", args.sim_name, args.nps);
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(&file_name)?;

    for estimator in &checkpoint.event_handler.estimators {
        let label = estimator.kind().label();
        writer.write_record([format!("{} results", label)])?;
        writer.write_record([
            "energy bin upper bound".to_string(),
            format!("{} mean", label),
            format!("{} RE", label),
        ])?;

        for &entity in estimator.entity_ids() {
            for bin in 0..estimator.num_bins() {
                let upper = estimator.energy_boundaries()[bin + 1];
                let mean = estimator.mean(entity, bin)?;
                let relative_error = estimator.relative_error(entity, bin)?;
                writer.write_record([
                    upper.to_string(),
                    mean.to_string(),
                    relative_error.to_string(),
                ])?;
            }
        }
    }
    writer.flush()?;

    println!(
        "wrote {} ({} histories completed)",
        file_name, checkpoint.completed_histories
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run(args) => run(args),
        Command::Report(args) => report(args),
    };
    if let Err(err) = outcome {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}
