//! Common Types and Constants
//!
//! Shared data structures used across the trainer modules.

use serde::{Deserialize, Serialize};

// ==================== Constants ====================

/// Numerical stability epsilon
pub const EPSILON: f64 = 1e-10;

/// Floor applied to per-attempt outcome probabilities before taking logs.
/// Keeps the gradient factor Z*(1-Z)/p finite when a prediction saturates
/// against an observed outcome.
pub const PROB_FLOOR: f64 = 1e-12;

/// ln(2), used to express likelihoods in log-base-2 units
pub const LN_2: f64 = std::f64::consts::LN_2;

/// Default chunk size for parallel dispatch
pub const DEFAULT_CHUNK_SIZE: usize = 100;

// ==================== Run Configuration ====================

/// Immutable configuration for a training run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Number of latent ability dimensions
    pub num_abilities: usize,
    /// Number of EM epochs to run (no early stopping)
    pub num_epochs: usize,
    /// Metropolis-Hastings steps per ability sample
    pub sampling_num_steps: usize,
    /// Proposal step size for ability sampling
    pub sampling_epsilon: f64,
    /// How many times the input data is replayed during ingestion
    pub num_replicas: usize,
    /// Cap on objective/gradient evaluations per M-step
    pub max_lbfgs_evals: usize,
    /// L2 regularization weight on the flattened coupling matrix
    pub regularization: f64,
    /// Worker threads for parallel dispatch; 0 runs synchronously
    pub workers: usize,
    /// Minimum items per parallel chunk
    pub chunk_size: usize,
    /// Base seed for all random streams in the run
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_abilities: 1,
            num_epochs: 10,
            sampling_num_steps: 50,
            sampling_epsilon: 0.1,
            num_replicas: 1,
            max_lbfgs_evals: 5,
            regularization: 1e-5,
            workers: 6,
            chunk_size: DEFAULT_CHUNK_SIZE,
            seed: 0,
        }
    }
}

impl TrainConfig {
    /// Coupling matrix column count: one weight per ability dimension plus a bias.
    pub fn num_couplings(&self) -> usize {
        self.num_abilities + 1
    }
}

// ==================== User State ====================

/// Per-learner training state.
///
/// The attempt history (`correct`, `exercise_ind`) is fixed at construction;
/// only the ability sample is overwritten, once per epoch, by the E-step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserState {
    correct: Vec<bool>,
    exercise_ind: Vec<usize>,
    /// Current posterior ability sample, length = number of ability dimensions
    pub abilities: Vec<f64>,
}

impl UserState {
    /// Creates a user state from parallel correctness / exercise-index vectors.
    ///
    /// # Panics
    ///
    /// Panics if the two attempt vectors differ in length.
    pub fn new(correct: Vec<bool>, exercise_ind: Vec<usize>, abilities: Vec<f64>) -> Self {
        assert_eq!(
            correct.len(),
            exercise_ind.len(),
            "correctness and exercise-index vectors must be parallel"
        );
        Self {
            correct,
            exercise_ind,
            abilities,
        }
    }

    pub fn correct(&self) -> &[bool] {
        &self.correct
    }

    pub fn exercise_ind(&self) -> &[usize] {
        &self.exercise_ind
    }

    pub fn num_attempts(&self) -> usize {
        self.correct.len()
    }
}

// ==================== Coupling Matrix ====================

/// Per-exercise item parameters: one row per exercise, one column per ability
/// dimension plus a trailing bias column. Stored row-major in a flat buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CouplingMatrix {
    data: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl CouplingMatrix {
    /// All-zero matrix with `rows` exercises and `cols` parameters per exercise.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    /// Rebuilds a matrix from a flattened parameter vector.
    ///
    /// # Panics
    ///
    /// Panics if `flat.len()` is not `rows * cols`.
    pub fn from_flat(flat: Vec<f64>, rows: usize, cols: usize) -> Self {
        assert_eq!(flat.len(), rows * cols, "flat length must match shape");
        Self {
            data: flat,
            rows,
            cols,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Bias term for exercise `i` (last column).
    pub fn bias(&self, i: usize) -> f64 {
        self.data[i * self.cols + self.cols - 1]
    }

    /// Frobenius norm of the full matrix.
    pub fn norm(&self) -> f64 {
        self.data.iter().map(|&v| v * v).sum::<f64>().sqrt()
    }

    /// Frobenius norm of the elementwise difference with `other`.
    ///
    /// # Panics
    ///
    /// Panics if shapes differ.
    pub fn delta_norm(&self, other: &CouplingMatrix) -> f64 {
        assert_eq!(self.rows, other.rows);
        assert_eq!(self.cols, other.cols);
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }
}

// ==================== Shared math helpers ====================

/// Vector dot product over f64 slices.
pub fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coupling_matrix_shape_and_rows() {
        let m = CouplingMatrix::zeros(3, 2);
        assert_eq!(m.rows(), 3);
        assert_eq!(m.cols(), 2);
        assert_eq!(m.row(1), &[0.0, 0.0]);
        assert_eq!(m.as_slice().len(), 6);
    }

    #[test]
    fn test_coupling_matrix_from_flat_and_bias() {
        let m = CouplingMatrix::from_flat(vec![1.0, 2.0, 3.0, 4.0], 2, 2);
        assert_eq!(m.row(0), &[1.0, 2.0]);
        assert_eq!(m.bias(0), 2.0);
        assert_eq!(m.bias(1), 4.0);
    }

    #[test]
    fn test_coupling_matrix_norms() {
        let a = CouplingMatrix::from_flat(vec![3.0, 4.0], 1, 2);
        assert!((a.norm() - 5.0).abs() < 1e-12);

        let b = CouplingMatrix::zeros(1, 2);
        assert!((a.delta_norm(&b) - 5.0).abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "parallel")]
    fn test_user_state_mismatched_lengths_panics() {
        UserState::new(vec![true], vec![0, 1], vec![0.0]);
    }

    #[test]
    fn test_dot_product() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];
        assert!((dot_product(&a, &b) - 32.0).abs() < 1e-10);
    }
}
