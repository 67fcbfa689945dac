//! MIRT Likelihood and Gradient
//!
//! Correctness probability for one attempt is a logistic transform of the dot
//! product between the exercise's coupling row and the learner's
//! bias-augmented ability vector:
//!
//! - Z = sigmoid(W_e . [a, 1])
//! - p = y*Z + (1-y)*(1-Z)   (probability of the observed outcome)
//! - per-user negative log-likelihood, in log-base-2 units: -sum log2(p)
//! - dL/dY = (2y-1) * Z * (1-Z) / p, propagated to the coupling row through
//!   an outer product with the augmented ability vector
//!
//! The batch objective averages per-user terms over the population (so its
//! scale is independent of user count) and adds L2 regularization over the
//! flattened coupling matrix. Coupling rows never touched by any attempt
//! receive exactly zero gradient.

use crate::error::TrainError;
use crate::parallel::WorkerPool;
use crate::types::{dot_product, CouplingMatrix, UserState, LN_2, PROB_FLOOR};

/// Numerically stable logistic function; never overflows for any finite input.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Per-user likelihood contribution: the negative log-likelihood plus one
/// sparse gradient row per attempt, keyed by exercise index.
#[derive(Clone, Debug)]
pub struct UserNll {
    pub nll: f64,
    pub grad_rows: Vec<(usize, Vec<f64>)>,
}

/// Negative log-likelihood (log2 units) and coupling gradient for one user,
/// with the ability sample held fixed.
pub fn nll_grad_single_user(couplings: &CouplingMatrix, state: &UserState) -> UserNll {
    // Bias-augmented ability vector: [a_0 .. a_{k-1}, 1]
    let mut aug = state.abilities.clone();
    aug.push(1.0);

    let mut nll = 0.0;
    let mut grad_rows = Vec::with_capacity(state.num_attempts());

    for (&exercise_ind, &correct) in state.exercise_ind().iter().zip(state.correct()) {
        let row = couplings.row(exercise_ind);
        let z = sigmoid(dot_product(row, &aug));
        let p = if correct { z } else { 1.0 - z };
        // The floor keeps log(p) and the /p in the gradient finite when a
        // prediction saturates against the observed outcome.
        let p = p.max(PROB_FLOOR);
        nll -= p.log2();

        let sign = if correct { 1.0 } else { -1.0 };
        let dldy = sign * z * (1.0 - z) / p / LN_2;
        let grad_row: Vec<f64> = aug.iter().map(|&a| -dldy * a).collect();
        grad_rows.push((exercise_ind, grad_row));
    }

    UserNll { nll, grad_rows }
}

/// Batch objective: population-averaged negative log-likelihood plus L2
/// regularization, with its gradient over the flattened coupling matrix.
///
/// Per-user work is dispatched through the worker pool; the reduction runs
/// sequentially in user order, so the result is bit-identical for any worker
/// count or chunk size. A non-finite objective or gradient entry aborts the
/// run before it can corrupt the coupling matrix.
pub fn nll_grad_batch(
    couplings: &CouplingMatrix,
    users: &[UserState],
    regularization: f64,
    pool: &WorkerPool,
) -> Result<(f64, Vec<f64>), TrainError> {
    let cols = couplings.cols();
    let n = users.len() as f64;

    let per_user = pool.map(users, |_, state| nll_grad_single_user(couplings, state));

    let mut objective = 0.0;
    let mut grad = vec![0.0; couplings.rows() * cols];
    for user in &per_user {
        objective += user.nll / n;
        for (exercise_ind, row) in &user.grad_rows {
            let base = exercise_ind * cols;
            for (j, &g) in row.iter().enumerate() {
                grad[base + j] += g / n;
            }
        }
    }

    if regularization != 0.0 {
        for (g, &w) in grad.iter_mut().zip(couplings.as_slice()) {
            objective += regularization * w * w;
            *g += 2.0 * regularization * w;
        }
    }

    if !objective.is_finite() || grad.iter().any(|g| !g.is_finite()) {
        return Err(TrainError::non_finite("coupling gradient computation"));
    }
    Ok((objective, grad))
}
