//! # mirt-em - multidimensional item response theory trainer
//!
//! Trains a MIRT model over learner attempt logs: each learner carries a
//! latent ability vector, each exercise a coupling row (per-dimension weights
//! plus a bias), and a logistic link turns their dot product into the
//! probability of a correct answer.
//!
//! Training alternates two steps per epoch:
//!
//! - **E-step** - each learner's ability vector is redrawn from the Bayesian
//!   posterior given the current couplings (Metropolis-Hastings diffusion
//!   sampling), in parallel across learners.
//! - **M-step** - the coupling matrix is updated by a bounded L-BFGS pass on
//!   the population-averaged negative log-likelihood plus L2 regularization.
//!
//! ## Module structure
//!
//! - [`ingest`] - attempt-log parsing and exercise index assignment
//! - [`model`] - likelihood and gradient of the coupling matrix
//! - [`sampler`] - posterior ability sampling (E-step capability)
//! - [`optim`] - bounded L-BFGS solver
//! - [`parallel`] - worker pool with a deterministic reduction contract
//! - [`train`] - the EM epoch loop
//! - [`checkpoint`] - per-epoch snapshot and report writing
//! - [`types`] - shared types and constants

pub mod checkpoint;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod optim;
pub mod parallel;
pub mod sampler;
pub mod train;
pub mod types;

pub use checkpoint::{CheckpointSink, FileCheckpoint, NoopCheckpoint, Snapshot};
pub use error::TrainError;
pub use ingest::{load_training_data, ExerciseIndexer};
pub use model::{nll_grad_batch, nll_grad_single_user, sigmoid};
pub use optim::{Lbfgs, SolveResult, SolveStatus};
pub use parallel::WorkerPool;
pub use sampler::{AbilitySampler, DiffusionSampler, SampleOutcome};
pub use train::{EmTrainer, EpochStats};
pub use types::{CouplingMatrix, TrainConfig, UserState};
