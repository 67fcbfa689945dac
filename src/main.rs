//! mirt-train: offline EM trainer for a multidimensional IRT model.
//!
//! Reads a line-oriented attempt log, alternates posterior ability sampling
//! and bounded L-BFGS coupling updates for a fixed number of epochs, and
//! checkpoints the coupling matrix after every epoch. A failed run is meant
//! to be restarted by hand from the last checkpoint; there is no retry logic.

use std::path::PathBuf;

use clap::Parser;

use mirt_em::{
    load_training_data, logging, DiffusionSampler, EmTrainer, ExerciseIndexer, FileCheckpoint,
    TrainConfig, TrainError, WorkerPool,
};

#[derive(Parser)]
#[command(name = "mirt-train")]
#[command(about = "Train a multidimensional item response theory model with EM")]
struct Args {
    /// Number of latent ability dimensions
    #[arg(short = 'a', long, default_value = "1")]
    num_abilities: usize,

    /// Sampling steps per ability draw
    #[arg(short = 's', long, default_value = "50")]
    sampling_num_steps: usize,

    /// Length scale for sampling update proposals
    #[arg(short = 'l', long, default_value = "0.1")]
    sampling_epsilon: f64,

    /// Number of EM epochs
    #[arg(short = 'n', long, default_value = "10000")]
    num_epochs: usize,

    /// Number of copies of the data to train on. Increase when training data
    /// is scarce; a persistently large coupling update norm is the usual sign.
    #[arg(short = 'q', long, default_value = "1")]
    num_replicas: usize,

    /// Cap on L-BFGS objective/gradient evaluations per EM epoch
    #[arg(short = 'm', long, default_value = "5")]
    max_lbfgs_evals: usize,

    /// L2 regularization weight. Can be very small; it only keeps couplings
    /// from running away in weakly constrained directions.
    #[arg(short = 'p', long, default_value = "1e-5")]
    regularization: f64,

    /// Worker threads; 0 runs single-threaded for easier debugging
    #[arg(short = 'w', long, default_value = "6")]
    workers: usize,

    /// Source data file
    #[arg(short = 'f', long, default_value = "user_assessment.responses")]
    file: PathBuf,

    /// Root filename for checkpoints; defaults to a name derived from the
    /// input file and dimensionality
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// Base seed for all random streams
    #[arg(long, default_value = "0")]
    seed: u64,
}

fn run(args: Args) -> Result<(), TrainError> {
    let config = TrainConfig {
        num_abilities: args.num_abilities,
        num_epochs: args.num_epochs,
        sampling_num_steps: args.sampling_num_steps,
        sampling_epsilon: args.sampling_epsilon,
        num_replicas: args.num_replicas,
        max_lbfgs_evals: args.max_lbfgs_evals,
        regularization: args.regularization,
        workers: args.workers,
        seed: args.seed,
        ..TrainConfig::default()
    };
    let output = args.output.unwrap_or_else(|| {
        format!(
            "mirt_file={}_abilities={}",
            args.file.display(),
            config.num_abilities
        )
    });

    tracing::info!(file = %args.file.display(), "loading data");
    let mut indexer = ExerciseIndexer::new();
    let (users, couplings) = load_training_data(&args.file, &config, &mut indexer)?;
    tracing::info!(
        users = users.len(),
        exercises = indexer.len(),
        replicas = config.num_replicas,
        "ingestion complete"
    );

    let pool = WorkerPool::new(config.workers, config.chunk_size)?;
    let sampler = DiffusionSampler::new(config.sampling_num_steps, config.sampling_epsilon);
    let sink = FileCheckpoint::new(&output);

    let mut trainer = EmTrainer::new(config, users, couplings);
    trainer.run(&sampler, &pool, &indexer, &sink)?;
    tracing::info!(output = %output, "training complete");
    Ok(())
}

fn main() {
    let args = Args::parse();
    logging::init_tracing("info");
    if let Err(err) = run(args) {
        tracing::error!(error = %err, "training aborted");
        std::process::exit(1);
    }
}
