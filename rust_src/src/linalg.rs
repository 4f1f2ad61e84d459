//! Dense solves for the small Newton systems of the estimators.

use ndarray::{Array1, Array2};

use crate::error::{IrtError, IrtResult};
use crate::utils::PIVOT_EPSILON;

/// Lower-triangular Cholesky factor of a symmetric positive-definite matrix.
/// Returns `None` when a pivot is not strictly positive.
pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if !(diag.is_finite() && diag > PIVOT_EPSILON) {
            return None;
        }
        let diag = diag.sqrt();
        l[[j, j]] = diag;
        for i in j + 1..n {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / diag;
        }
    }
    Some(l)
}

/// Solves `L L^T x = b` given the Cholesky factor `L`.
pub fn cholesky_solve(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut s = b[i];
        for k in 0..i {
            s -= l[[i, k]] * y[k];
        }
        y[i] = s / l[[i, i]];
    }
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut s = y[i];
        for k in i + 1..n {
            s -= l[[k, i]] * x[k];
        }
        x[i] = s / l[[i, i]];
    }
    x
}

/// Gaussian elimination with partial pivoting.
pub fn solve(a: &Array2<f64>, b: &Array1<f64>) -> IrtResult<Array1<f64>> {
    let n = a.nrows();
    if a.ncols() != n || b.len() != n {
        return Err(IrtError::InvalidParameters(format!(
            "cannot solve {}x{} system with {} right-hand values",
            a.nrows(),
            a.ncols(),
            b.len()
        )));
    }
    let mut m = a.clone();
    let mut rhs = b.clone();
    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&i, &j| m[[i, col]].abs().total_cmp(&m[[j, col]].abs()))
            .unwrap_or(col);
        let pivot = m[[pivot_row, col]];
        if !(pivot.is_finite() && pivot.abs() > PIVOT_EPSILON) {
            return Err(IrtError::degenerate(format!("singular pivot {pivot} in column {col}")));
        }
        if pivot_row != col {
            for k in 0..n {
                m.swap([col, k], [pivot_row, k]);
            }
            rhs.swap(col, pivot_row);
        }
        for row in col + 1..n {
            let factor = m[[row, col]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                m[[row, k]] -= factor * m[[col, k]];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut s = rhs[i];
        for k in i + 1..n {
            s -= m[[i, k]] * x[k];
        }
        x[i] = s / m[[i, i]];
    }
    Ok(x)
}

/// Search direction for maximising a concave-ish objective.
#[derive(Debug, Clone)]
pub enum Direction {
    /// Full Newton step `-H^{-1} g`.
    Newton(Array1<f64>),
    /// Scaled gradient, used when the Hessian is not negative-definite.
    Gradient(Array1<f64>),
}

impl Direction {
    pub fn step(&self) -> &Array1<f64> {
        match self {
            Direction::Newton(d) | Direction::Gradient(d) => d,
        }
    }
}

/// Picks the ascent direction for `hessian * delta = -gradient`.
pub fn ascent_direction(hessian: &Array2<f64>, gradient: &Array1<f64>) -> IrtResult<Direction> {
    if gradient.iter().any(|g| !g.is_finite()) || hessian.iter().any(|h| !h.is_finite()) {
        return Err(IrtError::degenerate("non-finite gradient or Hessian"));
    }
    let neg_h = hessian.mapv(|h| -h);
    if let Some(l) = cholesky(&neg_h) {
        return Ok(Direction::Newton(cholesky_solve(&l, gradient)));
    }
    if let Ok(delta) = solve(&neg_h, gradient) {
        if delta.dot(gradient) > 0.0 {
            return Ok(Direction::Newton(delta));
        }
    }
    let scale = hessian
        .diag()
        .iter()
        .fold(1.0_f64, |acc, h| acc.max(h.abs()));
    Ok(Direction::Gradient(gradient.mapv(|g| g / scale)))
}
