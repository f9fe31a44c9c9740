//! Exact line search along `w + delta * (w_bar - w)`.
//!
//! The objective is piecewise quadratic in `delta`; its derivative changes
//! slope only where an example enters or leaves the active set, so the
//! breakpoints are visited in increasing order until the derivative turns
//! non-negative.

use super::Problem;

struct Breakpoint {
    delta: f64,
    index: usize,
    /// -1 when the example leaves the active set, +1 when it enters
    sign: f64,
}

pub(super) fn search(problem: &Problem, w: &[f64], w_bar: &[f64], o: &[f64], o_bar: &[f64]) -> f64 {
    let lambda = problem.lambda;
    let (mut left, mut right) = w.iter().zip(w_bar).fold((0.0, 0.0), |(l, r), (w, w_bar)| {
        let diff = w_bar - w;
        (l + w * diff, r + w_bar * diff)
    });
    left *= lambda;
    right *= lambda;

    let mut breakpoints = Vec::new();
    for i in 0..problem.examples() {
        let y = problem.label(i);
        let diff = y * (o_bar[i] - o[i]);
        let active = y * o[i] < 1.0;
        if active {
            let d = problem.cost[i] * (o_bar[i] - o[i]);
            left += (o[i] - y) * d;
            right += (o_bar[i] - y) * d;
        }
        match (active, diff) {
            (true, diff) if diff > 0.0 => breakpoints.push(Breakpoint {
                delta: (1.0 - y * o[i]) / diff,
                index: i,
                sign: -1.0,
            }),
            (false, diff) if diff < 0.0 => breakpoints.push(Breakpoint {
                delta: (1.0 - y * o[i]) / diff,
                index: i,
                sign: 1.0,
            }),
            _ => {}
        }
    }
    breakpoints.sort_by(|a, b| a.delta.total_cmp(&b.delta));

    for bp in &breakpoints {
        if left + bp.delta * (right - left) >= 0.0 {
            break;
        }
        let i = bp.index;
        let y = problem.label(i);
        let d = bp.sign * problem.cost[i] * (o_bar[i] - o[i]);
        left += d * (o[i] - y);
        right += d * (o_bar[i] - y);
    }

    match -left / (right - left) {
        delta if delta.is_finite() => delta,
        // Flat direction: take the full Newton step
        _ => 1.0,
    }
}
