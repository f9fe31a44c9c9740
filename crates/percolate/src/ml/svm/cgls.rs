//! Conjugate gradient for the regularized least squares subproblem over the
//! active examples. Updates `weights` in place, along with `outputs` for the
//! active examples only.

use super::Problem;

/// Returns `true` if the relative residual dropped below `epsilon` before
/// `max_iter` iterations were spent
pub(super) fn solve(
    problem: &Problem,
    active: &[usize],
    weights: &mut [f64],
    outputs: &mut [f64],
    epsilon: f64,
    max_iter: usize,
) -> bool {
    let n = weights.len();
    let lambda = problem.lambda;

    let mut z = active
        .iter()
        .map(|&i| problem.cost[i] * (problem.label(i) - outputs[i]))
        .collect::<Vec<_>>();
    let mut q = vec![0.0; active.len()];

    let residual = |z: &[f64], beta: &[f64]| {
        let mut r = vec![0.0; n];
        for (&i, &z) in active.iter().zip(z) {
            problem.accumulate(i, z, &mut r);
        }
        r.iter_mut().zip(beta).for_each(|(r, b)| *r -= lambda * b);
        r
    };

    let mut r = residual(&z, weights);
    let mut p = r.clone();
    let mut omega1 = r.iter().map(|r| r * r).sum::<f64>();
    let mut omega_p = omega1;
    let epsilon2 = epsilon * epsilon;

    for _ in 0..max_iter {
        if omega1 == 0.0 {
            // Already at the minimizer of the subproblem
            return true;
        }

        let mut omega_q = 0.0;
        for (q, &i) in q.iter_mut().zip(active) {
            *q = problem.output(i, &p);
            omega_q += problem.cost[i] * *q * *q;
        }

        let gamma = omega1 / (lambda * omega_p + omega_q);
        let inv_omega2 = 1.0 / omega1;

        weights
            .iter_mut()
            .zip(&p)
            .for_each(|(w, p)| *w += gamma * p);

        let mut omega_z = 0.0;
        for ((z, q), &i) in z.iter_mut().zip(&q).zip(active) {
            outputs[i] += gamma * q;
            *z -= gamma * problem.cost[i] * q;
            omega_z += *z * *z;
        }

        r = residual(&z, weights);
        omega1 = r.iter().map(|r| r * r).sum::<f64>();
        if omega1 < epsilon2 * omega_z {
            return true;
        }

        let scale = omega1 * inv_omega2;
        omega_p = 0.0;
        for (p, r) in p.iter_mut().zip(&r) {
            *p = r + *p * scale;
            omega_p += *p * *p;
        }
    }
    false
}
