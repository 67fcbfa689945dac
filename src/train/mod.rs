//! EM Orchestration
//!
//! The epoch loop alternating the E-step (posterior ability sampling, one
//! parallel dispatch over users) and the M-step (bounded L-BFGS over the
//! coupling matrix, one parallel dispatch per objective evaluation). Runs
//! exactly the configured number of epochs; there is no convergence check.
//!
//! The coupling matrix is owned here. Workers only ever see it as a read-only
//! snapshot; it is replaced between epochs with the M-step's solution. Each
//! M-step starts a fresh solver from the current matrix: redrawing ability
//! samples reshapes the objective every epoch, so carrying quasi-Newton
//! history across epochs would chase a surface that no longer exists.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::checkpoint::CheckpointSink;
use crate::error::TrainError;
use crate::ingest::ExerciseIndexer;
use crate::model::nll_grad_batch;
use crate::optim::{Lbfgs, SolveStatus};
use crate::parallel::WorkerPool;
use crate::sampler::{stream_seed, AbilitySampler};
use crate::types::{CouplingMatrix, TrainConfig, UserState, LN_2};

/// L-BFGS history size for the M-step
const LBFGS_HISTORY: usize = 100;

/// Diagnostics gathered for one epoch. Logging only; nothing reads these for
/// control flow.
#[derive(Clone, Debug)]
pub struct EpochStats {
    pub epoch: usize,
    /// Mean sampling energy across users, in nats
    pub mean_energy: f64,
    /// Per-dimension mean of the ability samples
    pub ability_mean: Vec<f64>,
    /// Per-dimension second moment of the ability samples
    pub ability_second_moment: Vec<f64>,
    /// M-step objective at the returned couplings
    pub objective: f64,
    pub coupling_norm: f64,
    /// Frobenius norm of the coupling change this epoch
    pub coupling_delta_norm: f64,
    /// Objective/gradient evaluations the bounded M-step consumed
    pub lbfgs_evals: usize,
}

pub struct EmTrainer {
    config: TrainConfig,
    users: Vec<UserState>,
    couplings: CouplingMatrix,
}

impl EmTrainer {
    pub fn new(config: TrainConfig, users: Vec<UserState>, couplings: CouplingMatrix) -> Self {
        Self {
            config,
            users,
            couplings,
        }
    }

    pub fn couplings(&self) -> &CouplingMatrix {
        &self.couplings
    }

    pub fn users(&self) -> &[UserState] {
        &self.users
    }

    /// Runs the configured number of epochs, checkpointing after each one.
    pub fn run(
        &mut self,
        sampler: &dyn AbilitySampler,
        pool: &WorkerPool,
        indexer: &ExerciseIndexer,
        sink: &dyn CheckpointSink,
    ) -> Result<Vec<EpochStats>, TrainError> {
        let mut stats = Vec::with_capacity(self.config.num_epochs);
        for epoch in 0..self.config.num_epochs {
            stats.push(self.run_epoch(epoch, sampler, pool, indexer, sink)?);
        }
        Ok(stats)
    }

    /// One E-step + M-step cycle plus diagnostics and a checkpoint.
    pub fn run_epoch(
        &mut self,
        epoch: usize,
        sampler: &dyn AbilitySampler,
        pool: &WorkerPool,
        indexer: &ExerciseIndexer,
        sink: &dyn CheckpointSink,
    ) -> Result<EpochStats, TrainError> {
        let mean_energy = self.e_step(epoch, sampler, pool);
        let (ability_mean, ability_second_moment) = self.ability_moments();
        tracing::info!(
            epoch,
            e_joint_log_l = -mean_energy / LN_2,
            ability_mean = ?ability_mean,
            ability_second_moment = ?ability_second_moment,
            "E-step complete"
        );

        let old_couplings = self.couplings.clone();
        let (objective, lbfgs_evals) = self.m_step(pool)?;
        let coupling_norm = self.couplings.norm();
        let coupling_delta_norm = self.couplings.delta_norm(&old_couplings);
        tracing::info!(
            epoch,
            m_conditional_log_l = -objective,
            coupling_norm,
            coupling_delta_norm,
            lbfgs_evals,
            "M-step complete"
        );

        sink.write(epoch, &self.couplings, indexer)?;

        Ok(EpochStats {
            epoch,
            mean_energy,
            ability_mean,
            ability_second_moment,
            objective,
            coupling_norm,
            coupling_delta_norm,
            lbfgs_evals,
        })
    }

    /// Redraws every user's ability sample from the posterior under the
    /// current couplings. Returns the mean sampling energy.
    fn e_step(&mut self, epoch: usize, sampler: &dyn AbilitySampler, pool: &WorkerPool) -> f64 {
        let couplings = &self.couplings;
        let seed = self.config.seed;

        let outcomes = pool.map(&self.users, |user_index, state| {
            // Explicit per-(epoch, user) seed: streams are independent across
            // workers and the run replays exactly at any worker count.
            let mut rng =
                ChaCha8Rng::seed_from_u64(stream_seed(seed, epoch as u64, user_index as u64));
            sampler.sample(
                couplings,
                state.exercise_ind(),
                state.correct(),
                &state.abilities,
                &mut rng,
            )
        });

        let n = self.users.len() as f64;
        let mut mean_energy = 0.0;
        for (state, outcome) in self.users.iter_mut().zip(outcomes) {
            state.abilities = outcome.abilities;
            mean_energy += outcome.energy / n;
        }
        mean_energy
    }

    /// Per-dimension mean and second moment of the current ability samples.
    fn ability_moments(&self) -> (Vec<f64>, Vec<f64>) {
        let dims = self.config.num_abilities;
        let n = self.users.len() as f64;
        let mut mean = vec![0.0; dims];
        let mut second = vec![0.0; dims];
        for state in &self.users {
            for (d, &a) in state.abilities.iter().enumerate() {
                mean[d] += a / n;
                second[d] += a * a / n;
            }
        }
        (mean, second)
    }

    /// One bounded optimization pass over the couplings with abilities fixed.
    fn m_step(&mut self, pool: &WorkerPool) -> Result<(f64, usize), TrainError> {
        let rows = self.couplings.rows();
        let cols = self.couplings.cols();
        let users = &self.users;
        let regularization = self.config.regularization;

        // The solver wants plain (value, gradient); a batch failure is stashed
        // here and surfaced once the solver bails on the NaNs we feed it.
        let mut batch_err: Option<TrainError> = None;
        let mut solver = Lbfgs::new(self.config.max_lbfgs_evals, LBFGS_HISTORY);
        let result = solver.minimize(
            |flat| {
                let snapshot = CouplingMatrix::from_flat(flat.to_vec(), rows, cols);
                match nll_grad_batch(&snapshot, users, regularization, pool) {
                    Ok(v) => v,
                    Err(e) => {
                        batch_err = Some(e);
                        (f64::NAN, vec![f64::NAN; flat.len()])
                    }
                }
            },
            self.couplings.as_slice().to_vec(),
        );

        if let Some(err) = batch_err {
            return Err(err);
        }
        if result.status == SolveStatus::NumericalError {
            return Err(TrainError::non_finite("M-step optimization"));
        }
        self.couplings = CouplingMatrix::from_flat(result.x, rows, cols);
        Ok((result.objective, result.evals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::NoopCheckpoint;
    use crate::sampler::{posterior_energy, SampleOutcome};

    /// Sampler stub: echoes back the current abilities, untouched.
    struct IdentitySampler;

    impl AbilitySampler for IdentitySampler {
        fn sample(
            &self,
            couplings: &CouplingMatrix,
            exercise_ind: &[usize],
            correct: &[bool],
            abilities: &[f64],
            _rng: &mut ChaCha8Rng,
        ) -> SampleOutcome {
            SampleOutcome {
                abilities: abilities.to_vec(),
                energy: posterior_energy(couplings, exercise_ind, correct, abilities),
            }
        }
    }

    fn scenario() -> (TrainConfig, Vec<UserState>, CouplingMatrix, ExerciseIndexer) {
        // 2 users, 3 exercises, 1 ability dimension; exercise 2 never
        // attempted. User 1 answers exercise 0 correctly, user 2 answers
        // exercise 1 incorrectly.
        let config = TrainConfig {
            num_abilities: 1,
            num_epochs: 1,
            max_lbfgs_evals: 5,
            regularization: 0.0,
            workers: 0,
            ..TrainConfig::default()
        };
        let users = vec![
            UserState::new(vec![true], vec![0], vec![0.5]),
            UserState::new(vec![false], vec![1], vec![-0.5]),
        ];
        let couplings = CouplingMatrix::zeros(3, 2);
        let mut indexer = ExerciseIndexer::new();
        indexer.assign("ex_0");
        indexer.assign("ex_1");
        indexer.assign("ex_2");
        indexer.freeze();
        (config, users, couplings, indexer)
    }

    #[test]
    fn test_one_epoch_moves_couplings_with_likelihood() {
        let (config, users, couplings, indexer) = scenario();
        let pool = WorkerPool::new(0, 1).unwrap();
        let mut trainer = EmTrainer::new(config, users, couplings);

        let stats = trainer
            .run(&IdentitySampler, &pool, &indexer, &NoopCheckpoint)
            .unwrap();
        assert_eq!(stats.len(), 1);
        assert!(stats[0].lbfgs_evals <= 5);

        let c = trainer.couplings();
        // Exercise 0 was answered correctly: bias moves up. Exercise 1 was
        // answered incorrectly: bias moves down. Exercise 2 was never
        // attempted and started at zero: it must stay exactly zero.
        assert!(c.bias(0) > 0.0);
        assert!(c.bias(1) < 0.0);
        assert_eq!(c.row(2), &[0.0, 0.0]);
    }

    #[test]
    fn test_epoch_stats_track_coupling_motion() {
        let (config, users, couplings, indexer) = scenario();
        let pool = WorkerPool::new(0, 1).unwrap();
        let mut trainer = EmTrainer::new(config, users, couplings);

        let stats = trainer
            .run(&IdentitySampler, &pool, &indexer, &NoopCheckpoint)
            .unwrap();
        let s = &stats[0];
        assert!(s.mean_energy.is_finite());
        assert!(s.coupling_norm > 0.0);
        assert!((s.coupling_delta_norm - s.coupling_norm).abs() < 1e-12); // started from zero
        assert_eq!(s.ability_mean, vec![0.0]); // 0.5 and -0.5 average out
        assert!((s.ability_second_moment[0] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_run_is_deterministic_across_worker_counts() {
        let make = |workers: usize| {
            let (mut config, _, couplings, indexer) = scenario();
            config.num_epochs = 3;
            config.workers = workers;
            // Enough users that the parallel path actually splits work.
            let users: Vec<UserState> = (0..64)
                .map(|i| {
                    UserState::new(
                        vec![i % 2 == 0, i % 3 == 0],
                        vec![i % 3, (i + 1) % 3],
                        vec![0.0],
                    )
                })
                .collect();
            let pool = WorkerPool::new(workers, 4).unwrap();
            let sampler = crate::sampler::DiffusionSampler::new(10, 0.1);
            let mut trainer = EmTrainer::new(config, users, couplings);
            trainer
                .run(&sampler, &pool, &indexer, &NoopCheckpoint)
                .unwrap();
            trainer.couplings().clone()
        };

        let serial = make(0);
        for workers in [1, 4] {
            let parallel = make(workers);
            let same = serial
                .as_slice()
                .iter()
                .zip(parallel.as_slice())
                .all(|(a, b)| a.to_bits() == b.to_bits());
            assert!(same, "couplings diverged at {workers} workers");
        }
    }

    #[test]
    fn test_large_regularization_shrinks_coupling_norm() {
        let (mut config, users, _, indexer) = scenario();
        config.num_epochs = 4;
        config.regularization = 10.0;
        config.max_lbfgs_evals = 10;
        // Start well away from zero so shrinkage is visible.
        let couplings = CouplingMatrix::from_flat(vec![2.0, 1.5, -1.0, 2.5, 1.0, -2.0], 3, 2);
        let start_norm = couplings.norm();

        let pool = WorkerPool::new(0, 1).unwrap();
        let mut trainer = EmTrainer::new(config, users, couplings);
        let stats = trainer
            .run(&IdentitySampler, &pool, &indexer, &NoopCheckpoint)
            .unwrap();

        assert!(stats.last().unwrap().coupling_norm < start_norm);
        // Monotone-ish decrease epoch over epoch under heavy regularization.
        assert!(stats.last().unwrap().coupling_norm <= stats[0].coupling_norm);
    }

    #[test]
    fn test_fresh_solver_each_epoch_runs_fixed_epoch_count() {
        let (mut config, users, couplings, indexer) = scenario();
        config.num_epochs = 5;
        let pool = WorkerPool::new(0, 1).unwrap();
        let mut trainer = EmTrainer::new(config, users, couplings);
        let stats = trainer
            .run(&IdentitySampler, &pool, &indexer, &NoopCheckpoint)
            .unwrap();
        // No early stopping: exactly the configured number of epochs.
        assert_eq!(stats.len(), 5);
        assert_eq!(stats.last().unwrap().epoch, 4);
    }
}
