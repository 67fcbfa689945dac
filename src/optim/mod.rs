//! Bounded L-BFGS
//!
//! Limited-memory quasi-Newton minimizer over flat `f64` parameter vectors.
//! The solver takes a single closure producing objective value and gradient
//! together, because the trainer computes both in one parallel pass over the
//! user population.
//!
//! The evaluation budget (`max_evals`) caps combined value/gradient
//! evaluations, line search included. The M-step deliberately runs a partial
//! optimization: the E-step redraws ability samples every epoch, reshaping
//! the objective, so driving any single M-step to convergence would be wasted
//! work. A fresh solver is constructed per epoch; no history survives between
//! epochs.

/// Terminal state of one `minimize` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveStatus {
    /// Gradient norm dropped below tolerance
    Converged,
    /// Evaluation budget exhausted (the expected outcome for an M-step)
    EvalBudget,
    /// Line search could not make progress
    Stalled,
    /// Objective or gradient produced a non-finite value
    NumericalError,
}

#[derive(Clone, Debug)]
pub struct SolveResult {
    /// Best parameter vector found
    pub x: Vec<f64>,
    /// Objective value at `x`
    pub objective: f64,
    /// Combined value/gradient evaluations consumed
    pub evals: usize,
    pub status: SolveStatus,
}

/// Limited-memory BFGS with backtracking (Armijo) line search.
pub struct Lbfgs {
    max_evals: usize,
    history: usize,
    tol: f64,
    c1: f64,
    rho: f64,
    s_history: Vec<Vec<f64>>,
    y_history: Vec<Vec<f64>>,
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}

impl Lbfgs {
    /// Creates a solver with an evaluation cap and history size.
    pub fn new(max_evals: usize, history: usize) -> Self {
        Self {
            max_evals,
            history,
            tol: 1e-8,
            c1: 1e-4,
            rho: 0.5,
            s_history: Vec::with_capacity(history),
            y_history: Vec::with_capacity(history),
        }
    }

    /// Two-loop recursion: approximates -H^{-1} * grad from stored
    /// position/gradient differences. Falls back to steepest descent with no
    /// history.
    fn direction(&self, grad: &[f64]) -> Vec<f64> {
        let k = self.s_history.len();
        let mut q: Vec<f64> = grad.iter().map(|&g| -g).collect();
        if k == 0 {
            return q;
        }

        let mut alpha = vec![0.0; k];
        let mut rho = vec![0.0; k];
        for i in (0..k).rev() {
            let s = &self.s_history[i];
            let y = &self.y_history[i];
            rho[i] = 1.0 / dot(y, s);
            alpha[i] = rho[i] * dot(s, &q);
            for (qj, &yj) in q.iter_mut().zip(y) {
                *qj -= alpha[i] * yj;
            }
        }

        // Initial Hessian scale from the most recent pair
        let s_last = &self.s_history[k - 1];
        let y_last = &self.y_history[k - 1];
        let gamma = dot(s_last, y_last) / dot(y_last, y_last);
        for qj in q.iter_mut() {
            *qj *= gamma;
        }

        for i in 0..k {
            let s = &self.s_history[i];
            let y = &self.y_history[i];
            let beta = rho[i] * dot(y, &q);
            for (qj, &sj) in q.iter_mut().zip(s) {
                *qj += sj * (alpha[i] - beta);
            }
        }
        q
    }

    /// Minimizes `f` starting from `x0`, stopping at the evaluation budget.
    ///
    /// `f` returns the objective value and its gradient in one call.
    pub fn minimize<F>(&mut self, mut f: F, x0: Vec<f64>) -> SolveResult
    where
        F: FnMut(&[f64]) -> (f64, Vec<f64>),
    {
        self.s_history.clear();
        self.y_history.clear();

        let n = x0.len();
        let mut evals = 0usize;

        let mut x = x0;
        let (mut fx, mut grad) = f(&x);
        evals += 1;
        if !fx.is_finite() || grad.iter().any(|g| !g.is_finite()) {
            return SolveResult {
                x,
                objective: fx,
                evals,
                status: SolveStatus::NumericalError,
            };
        }

        loop {
            if norm(&grad) < self.tol {
                return SolveResult {
                    x,
                    objective: fx,
                    evals,
                    status: SolveStatus::Converged,
                };
            }
            if evals >= self.max_evals {
                return SolveResult {
                    x,
                    objective: fx,
                    evals,
                    status: SolveStatus::EvalBudget,
                };
            }

            let d = self.direction(&grad);
            let slope = dot(&grad, &d);

            // Backtracking line search under the Armijo condition, spending
            // from the shared evaluation budget.
            let mut alpha = 1.0;
            let mut accepted: Option<(Vec<f64>, f64, Vec<f64>)> = None;
            while evals < self.max_evals {
                let x_new: Vec<f64> = x.iter().zip(&d).map(|(&xi, &di)| xi + alpha * di).collect();
                let (fx_new, grad_new) = f(&x_new);
                evals += 1;
                if !fx_new.is_finite() || grad_new.iter().any(|g| !g.is_finite()) {
                    return SolveResult {
                        x,
                        objective: fx,
                        evals,
                        status: SolveStatus::NumericalError,
                    };
                }
                if fx_new <= fx + self.c1 * alpha * slope {
                    accepted = Some((x_new, fx_new, grad_new));
                    break;
                }
                alpha *= self.rho;
                if alpha < 1e-12 {
                    return SolveResult {
                        x,
                        objective: fx,
                        evals,
                        status: SolveStatus::Stalled,
                    };
                }
            }

            let Some((x_new, fx_new, grad_new)) = accepted else {
                return SolveResult {
                    x,
                    objective: fx,
                    evals,
                    status: SolveStatus::EvalBudget,
                };
            };

            let mut s_k = vec![0.0; n];
            let mut y_k = vec![0.0; n];
            for i in 0..n {
                s_k[i] = x_new[i] - x[i];
                y_k[i] = grad_new[i] - grad[i];
            }

            // Curvature guard: only store pairs with y.s > 0, otherwise the
            // inverse-Hessian approximation loses positive definiteness.
            if dot(&y_k, &s_k) > 1e-10 {
                if self.s_history.len() >= self.history {
                    self.s_history.remove(0);
                    self.y_history.remove(0);
                }
                self.s_history.push(s_k);
                self.y_history.push(y_k);
            }

            x = x_new;
            fx = fx_new;
            grad = grad_new;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadratic_converges() {
        let mut solver = Lbfgs::new(100, 10);
        let result = solver.minimize(
            |x| {
                let v = (x[0] - 5.0) * (x[0] - 5.0);
                (v, vec![2.0 * (x[0] - 5.0)])
            },
            vec![0.0],
        );
        assert_eq!(result.status, SolveStatus::Converged);
        assert!((result.x[0] - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_rosenbrock_converges() {
        let mut solver = Lbfgs::new(2000, 10);
        let result = solver.minimize(
            |x| {
                let (a, b) = (x[0], x[1]);
                let v = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
                let g = vec![
                    -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
                    200.0 * (b - a * a),
                ];
                (v, g)
            },
            vec![0.0, 0.0],
        );
        assert_eq!(result.status, SolveStatus::Converged);
        assert!((result.x[0] - 1.0).abs() < 1e-3);
        assert!((result.x[1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_eval_budget_is_respected() {
        let mut solver = Lbfgs::new(5, 10);
        let mut calls = 0usize;
        let result = solver.minimize(
            |x| {
                calls += 1;
                ((x[0] - 3.0).powi(2), vec![2.0 * (x[0] - 3.0)])
            },
            vec![100.0],
        );
        assert!(calls <= 5);
        assert_eq!(result.evals, calls);
        assert!(matches!(
            result.status,
            SolveStatus::EvalBudget | SolveStatus::Converged
        ));
        // Even a truncated pass must make progress from x0.
        assert!(result.objective < (100.0_f64 - 3.0).powi(2));
    }

    #[test]
    fn test_nan_objective_reports_numerical_error() {
        let mut solver = Lbfgs::new(50, 5);
        let result = solver.minimize(|_| (f64::NAN, vec![0.0]), vec![1.0]);
        assert_eq!(result.status, SolveStatus::NumericalError);
    }

    #[test]
    fn test_descends_on_multidim_quadratic() {
        let targets = [1.0, -2.0, 3.0, 0.5];
        let mut solver = Lbfgs::new(200, 3);
        let result = solver.minimize(
            |x| {
                let v = x
                    .iter()
                    .zip(&targets)
                    .map(|(&xi, &t)| (xi - t) * (xi - t))
                    .sum();
                let g = x.iter().zip(&targets).map(|(&xi, &t)| 2.0 * (xi - t)).collect();
                (v, g)
            },
            vec![0.0; 4],
        );
        assert_eq!(result.status, SolveStatus::Converged);
        for (xi, t) in result.x.iter().zip(&targets) {
            assert!((xi - t).abs() < 1e-3);
        }
    }
}
