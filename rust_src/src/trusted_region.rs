//! Trusted region for item parameters.
//!
//! Two mechanisms keep estimates stable:
//! - a hard projection (`project`) applied after every Newton step;
//! - a smooth log-penalty added to the objective whose gradient and Hessian
//!   (`log_jacobian`, `log_hessian`) enter the Newton system. Difficulties
//!   and thresholds get a Gaussian penalty, discrimination a logistic barrier
//!   near its lower bound. Guessing is only clamped.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{IrtError, IrtResult};
use crate::params::{ItemParameters, ParameterKind};
use crate::utils::{clip, log_sigmoid, sigmoid};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DifficultyRegion {
    pub mean: f64,
    pub sd: f64,
    /// Half-width of the hard clamp in units of `sd`.
    pub sd_ratio: f64,
}

impl Default for DifficultyRegion {
    fn default() -> Self {
        Self {
            mean: 0.0,
            sd: 2.0,
            sd_ratio: 3.0,
        }
    }
}

impl DifficultyRegion {
    pub fn lower(&self) -> f64 {
        self.mean - self.sd_ratio * self.sd
    }

    pub fn upper(&self) -> f64 {
        self.mean + self.sd_ratio * self.sd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminationRegion {
    /// Location of the logistic barrier, also the lower clamp.
    pub placement: f64,
    pub slope: f64,
    /// Upper clamp is `max_factor / difficulty.sd`.
    pub max_factor: f64,
}

impl Default for DiscriminationRegion {
    fn default() -> Self {
        Self {
            placement: 0.15,
            slope: 10.0,
            max_factor: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuessingRegion {
    pub max: f64,
}

impl Default for GuessingRegion {
    fn default() -> Self {
        Self { max: 0.5 }
    }
}

/// Bounds for one model, supplied by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustedRegionBounds {
    pub difficulty: DifficultyRegion,
    pub discrimination: DiscriminationRegion,
    pub guessing: GuessingRegion,
    /// Smallest spacing kept between consecutive graded-response thresholds.
    pub min_threshold_gap: f64,
}

impl Default for TrustedRegionBounds {
    fn default() -> Self {
        Self {
            difficulty: DifficultyRegion::default(),
            discrimination: DiscriminationRegion::default(),
            guessing: GuessingRegion::default(),
            min_threshold_gap: 0.01,
        }
    }
}

impl TrustedRegionBounds {
    pub fn max_discrimination(&self) -> f64 {
        self.discrimination.max_factor / self.difficulty.sd
    }

    pub fn validate(&self) -> IrtResult<()> {
        let d = &self.difficulty;
        if !(d.sd.is_finite() && d.sd > 0.0) {
            return Err(IrtError::Config(format!("difficulty sd must be positive, got {}", d.sd)));
        }
        if !(d.sd_ratio.is_finite() && d.sd_ratio > 0.0) || !d.mean.is_finite() {
            return Err(IrtError::Config("difficulty region must be finite and non-empty".into()));
        }
        let disc = &self.discrimination;
        if !(disc.placement.is_finite() && disc.slope.is_finite() && disc.slope > 0.0) {
            return Err(IrtError::Config("discrimination barrier must be finite".into()));
        }
        let max_disc = self.max_discrimination();
        if !(max_disc.is_finite() && max_disc > disc.placement) {
            return Err(IrtError::Config(format!(
                "discrimination upper bound {max_disc} is below placement {}",
                disc.placement
            )));
        }
        if !(0.0..1.0).contains(&self.guessing.max) {
            return Err(IrtError::Config(format!(
                "guessing max must be in [0, 1), got {}",
                self.guessing.max
            )));
        }
        if !(self.min_threshold_gap.is_finite() && self.min_threshold_gap >= 0.0) {
            return Err(IrtError::Config("min_threshold_gap must be non-negative".into()));
        }
        Ok(())
    }
}

/// Clamps every parameter into its region. Idempotent.
pub fn project(
    layout: &[ParameterKind],
    ip: &ItemParameters,
    bounds: &TrustedRegionBounds,
) -> ItemParameters {
    let mut out = ip.clone();
    let (lo, hi) = (bounds.difficulty.lower(), bounds.difficulty.upper());
    for kind in layout {
        match kind {
            ParameterKind::Difficulty => out.difficulty = clip(ip.difficulty, lo, hi),
            ParameterKind::Discrimination => {
                out.discrimination = clip(
                    ip.discrimination,
                    bounds.discrimination.placement,
                    bounds.max_discrimination(),
                )
            }
            ParameterKind::Guessing => out.guessing = clip(ip.guessing, 0.0, bounds.guessing.max),
            ParameterKind::Intercepts => {
                for i in 0..out.categories.len() {
                    let v = clip(out.categories.value(i), lo, hi);
                    out.categories.set_value(i, v);
                }
            }
            ParameterKind::Difficulties => {
                let ordered = project_ordered(&out.categories.values(), lo, hi, bounds.min_threshold_gap);
                for (i, v) in ordered.into_iter().enumerate() {
                    out.categories.set_value(i, v);
                }
            }
        }
    }
    out
}

/// Projects thresholds onto `lo <= x[0]`, `x[j] + gap <= x[j + 1]`, `x[m-1] <= hi`.
///
/// Each value is first clamped into the window that leaves room for its
/// neighbours, then a forward pass restores the gaps; feasible input is
/// returned unchanged.
fn project_ordered(values: &[f64], lo: f64, hi: f64, gap: f64) -> Vec<f64> {
    let m = values.len();
    if m == 0 {
        return Vec::new();
    }
    let gap = if m > 1 {
        gap.min((hi - lo) / (m - 1) as f64)
    } else {
        gap
    };
    let mut out: Vec<f64> = values
        .iter()
        .enumerate()
        .map(|(j, &v)| clip(v, lo + j as f64 * gap, hi - (m - 1 - j) as f64 * gap))
        .collect();
    for j in 1..m {
        out[j] = out[j].max(out[j - 1] + gap);
    }
    out
}

fn gaussian_penalty(x: f64, region: &DifficultyRegion) -> f64 {
    -(x - region.mean).powi(2) / (2.0 * region.sd * region.sd)
}

fn gaussian_gradient(x: f64, region: &DifficultyRegion) -> f64 {
    (region.mean - x) / (region.sd * region.sd)
}

fn gaussian_curvature(region: &DifficultyRegion) -> f64 {
    -1.0 / (region.sd * region.sd)
}

/// Log-penalty value of the current parameters.
pub fn log_penalty(layout: &[ParameterKind], ip: &ItemParameters, bounds: &TrustedRegionBounds) -> f64 {
    let region = &bounds.difficulty;
    let barrier = &bounds.discrimination;
    layout
        .iter()
        .map(|kind| match kind {
            ParameterKind::Difficulty => gaussian_penalty(ip.difficulty, region),
            ParameterKind::Discrimination => {
                log_sigmoid(barrier.slope * (ip.discrimination - barrier.placement))
            }
            ParameterKind::Guessing => 0.0,
            ParameterKind::Difficulties | ParameterKind::Intercepts => ip
                .categories
                .iter()
                .map(|(_, v)| gaussian_penalty(v, region))
                .sum(),
        })
        .sum()
}

/// Gradient of [`log_penalty`] in vector order.
pub fn log_jacobian(
    layout: &[ParameterKind],
    ip: &ItemParameters,
    bounds: &TrustedRegionBounds,
) -> Array1<f64> {
    let region = &bounds.difficulty;
    let barrier = &bounds.discrimination;
    let mut out = Vec::new();
    for kind in layout {
        match kind {
            ParameterKind::Difficulty => out.push(gaussian_gradient(ip.difficulty, region)),
            ParameterKind::Discrimination => {
                let s = barrier.slope * (ip.discrimination - barrier.placement);
                out.push(barrier.slope * sigmoid(-s));
            }
            ParameterKind::Guessing => out.push(0.0),
            ParameterKind::Difficulties | ParameterKind::Intercepts => {
                out.extend(ip.categories.iter().map(|(_, v)| gaussian_gradient(v, region)))
            }
        }
    }
    Array1::from_vec(out)
}

/// Hessian of [`log_penalty`]; diagonal since every term is separable.
pub fn log_hessian(
    layout: &[ParameterKind],
    ip: &ItemParameters,
    bounds: &TrustedRegionBounds,
) -> Array2<f64> {
    let region = &bounds.difficulty;
    let barrier = &bounds.discrimination;
    let mut diag = Vec::new();
    for kind in layout {
        match kind {
            ParameterKind::Difficulty => diag.push(gaussian_curvature(region)),
            ParameterKind::Discrimination => {
                let s = barrier.slope * (ip.discrimination - barrier.placement);
                diag.push(-barrier.slope * barrier.slope * sigmoid(s) * sigmoid(-s));
            }
            ParameterKind::Guessing => diag.push(0.0),
            ParameterKind::Difficulties | ParameterKind::Intercepts => {
                diag.extend(std::iter::repeat_n(gaussian_curvature(region), ip.categories.len()))
            }
        }
    }
    Array2::from_diag(&Array1::from_vec(diag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CategoryThresholds;
    use approx::assert_relative_eq;

    const LAYOUT_3PL: [ParameterKind; 3] = [
        ParameterKind::Difficulty,
        ParameterKind::Discrimination,
        ParameterKind::Guessing,
    ];

    #[test]
    fn project_clamps_each_scalar() {
        let bounds = TrustedRegionBounds::default();
        let ip = ItemParameters::dichotomous(9.0, -1.0, 0.8);
        let p = project(&LAYOUT_3PL, &ip, &bounds);
        assert_eq!(p.difficulty, 6.0);
        assert_eq!(p.discrimination, 0.15);
        assert_eq!(p.guessing, 0.5);

        let ip = ItemParameters::dichotomous(0.0, 40.0, -0.2);
        let p = project(&LAYOUT_3PL, &ip, &bounds);
        assert_eq!(p.discrimination, 5.0);
        assert_eq!(p.guessing, 0.0);
    }

    #[test]
    fn ordered_projection_restores_gaps_and_is_idempotent() {
        let once = project_ordered(&[0.5, 0.2, 0.2, 7.0], -6.0, 6.0, 0.01);
        for pair in once.windows(2) {
            assert!(pair[1] >= pair[0] + 0.01 - 1e-12);
        }
        assert!(once[3] <= 6.0);
        let twice = project_ordered(&once, -6.0, 6.0, 0.01);
        assert_eq!(once, twice);
    }

    #[test]
    fn jacobian_matches_penalty_difference() {
        let bounds = TrustedRegionBounds::default();
        let layout = [ParameterKind::Difficulties, ParameterKind::Discrimination];
        let cats = CategoryThresholds::new(vec![(0.5, -1.3), (1.0, 2.2)]).unwrap();
        let ip = ItemParameters::polytomous(cats, 0.3);
        let jac = log_jacobian(&layout, &ip, &bounds);
        let fractions = ip.categories.fractions();
        let base = ip.to_vector(&layout);
        let h = 1e-6;
        for i in 0..base.len() {
            let mut plus = base.clone();
            let mut minus = base.clone();
            plus[i] += h;
            minus[i] -= h;
            let ip_plus = ItemParameters::from_vector(&layout, &fractions, plus.as_slice().unwrap()).unwrap();
            let ip_minus = ItemParameters::from_vector(&layout, &fractions, minus.as_slice().unwrap()).unwrap();
            let fd = (log_penalty(&layout, &ip_plus, &bounds) - log_penalty(&layout, &ip_minus, &bounds))
                / (2.0 * h);
            assert_relative_eq!(jac[i], fd, epsilon = 1e-6);
        }
        let hess = log_hessian(&layout, &ip, &bounds);
        assert_eq!(hess.shape(), &[3, 3]);
        assert!(hess[[2, 2]] < 0.0);
    }

    #[test]
    fn validate_rejects_inverted_discrimination_window() {
        let mut bounds = TrustedRegionBounds::default();
        assert!(bounds.validate().is_ok());
        bounds.discrimination.max_factor = 0.1;
        assert!(bounds.validate().is_err());
        bounds = TrustedRegionBounds::default();
        bounds.guessing.max = 1.0;
        assert!(bounds.validate().is_err());
    }
}
