//! Graded response models.
//!
//! The probability of reaching category `k` or above is
//! `P*(k) = sigmoid(a * (ability - difficulties[k - 1]))`, with `P*(0) = 1`
//! and `P*(m + 1) = 0`. The category likelihood is `P*(k) - P*(k + 1)`.
//! [`Grm`] fixes `a = 1`; [`GrmGeneralized`] estimates it.

use ndarray::{Array1, Array2};

use super::{ItemResponseModel, ModelKind, ensure_finite, polytomous_category, spaced_thresholds};
use crate::error::{IrtError, IrtResult};
use crate::params::{CategoryThresholds, ItemParameters, ParameterKind};
use crate::utils::{log_sigmoid, sigmoid, sigmoid_difference};

const LAYOUT: [ParameterKind; 1] = [ParameterKind::Difficulties];
const LAYOUT_GENERALIZED: [ParameterKind; 2] =
    [ParameterKind::Difficulties, ParameterKind::Discrimination];

#[derive(Debug, Clone, Copy, Default)]
pub struct Grm;

#[derive(Debug, Clone, Copy, Default)]
pub struct GrmGeneralized;

/// Cumulative curve at one boundary, divided by the category likelihood.
#[derive(Debug, Clone, Copy, Default)]
struct Boundary {
    /// Position of the threshold in the parameter vector.
    index: usize,
    /// `ability - threshold`.
    offset: f64,
    /// `w / L` where `w = P*(1 - P*)`.
    w: f64,
    /// `w (1 - 2P*) / L`.
    v: f64,
}

/// Everything needed for derivatives of one category's log-likelihood.
struct CategoryTerms {
    a: f64,
    upper: Option<Boundary>,
    lower: Option<Boundary>,
}

fn slope(ip: &ItemParameters, generalized: bool) -> f64 {
    if generalized { ip.discrimination } else { 1.0 }
}

fn likelihood(ability: f64, ip: &ItemParameters, frac: f64, generalized: bool) -> IrtResult<f64> {
    let k = polytomous_category(frac, ip)?;
    let m = ip.categories.len();
    let a = slope(ip, generalized);
    let cats = &ip.categories;

    let l = if k == 0 {
        sigmoid(a * (cats.value(0) - ability))
    } else if k == m {
        sigmoid(a * (ability - cats.value(m - 1)))
    } else {
        sigmoid_difference(
            a * (ability - cats.value(k - 1)),
            a * (ability - cats.value(k)),
        )
    };
    if !(l.is_finite() && l > 0.0) {
        return Err(IrtError::degenerate(format!(
            "graded response category {k} has likelihood {l}"
        )));
    }
    Ok(l)
}

fn log_likelihood(ability: f64, ip: &ItemParameters, frac: f64, generalized: bool) -> IrtResult<f64> {
    let k = polytomous_category(frac, ip)?;
    let m = ip.categories.len();
    let a = slope(ip, generalized);
    if k == 0 {
        Ok(log_sigmoid(a * (ip.categories.value(0) - ability)))
    } else if k == m {
        Ok(log_sigmoid(a * (ability - ip.categories.value(m - 1))))
    } else {
        Ok(likelihood(ability, ip, frac, generalized)?.ln())
    }
}

fn category_terms(
    ability: f64,
    ip: &ItemParameters,
    frac: f64,
    generalized: bool,
) -> IrtResult<CategoryTerms> {
    let k = polytomous_category(frac, ip)?;
    let m = ip.categories.len();
    let a = slope(ip, generalized);
    let cats = &ip.categories;

    let boundary = |index: usize| {
        let offset = ability - cats.value(index);
        let p = sigmoid(a * offset);
        (offset, p)
    };

    let terms = if k == 0 {
        // L = 1 - P*(1): w / L = P*, v / L = P*(1 - 2P*)
        let (offset, p) = boundary(0);
        CategoryTerms {
            a,
            upper: None,
            lower: Some(Boundary {
                index: 0,
                offset,
                w: p,
                v: p * (1.0 - 2.0 * p),
            }),
        }
    } else if k == m {
        // L = P*(m): w / L = 1 - P*, v / L = (1 - P*)(1 - 2P*)
        let (offset, p) = boundary(m - 1);
        CategoryTerms {
            a,
            upper: Some(Boundary {
                index: m - 1,
                offset,
                w: 1.0 - p,
                v: (1.0 - p) * (1.0 - 2.0 * p),
            }),
            lower: None,
        }
    } else {
        let l = likelihood(ability, ip, frac, generalized)?;
        let scaled = |index: usize| {
            let (offset, p) = boundary(index);
            let w = p * (1.0 - p);
            Boundary {
                index,
                offset,
                w: w / l,
                v: w * (1.0 - 2.0 * p) / l,
            }
        };
        CategoryTerms {
            a,
            upper: Some(scaled(k - 1)),
            lower: Some(scaled(k)),
        }
    };
    Ok(terms)
}

impl CategoryTerms {
    fn upper_or_zero(&self) -> Boundary {
        self.upper.unwrap_or_default()
    }

    fn lower_or_zero(&self) -> Boundary {
        self.lower.unwrap_or_default()
    }

    fn d_ability(&self) -> f64 {
        self.a * (self.upper_or_zero().w - self.lower_or_zero().w)
    }

    fn d2_ability(&self) -> f64 {
        let d1 = self.d_ability();
        self.a * self.a * (self.upper_or_zero().v - self.lower_or_zero().v) - d1 * d1
    }

    /// Gradient and Hessian of `L` divided by `L`, in parameter order.
    fn scaled_derivatives(&self, n_thresholds: usize, generalized: bool) -> (Array1<f64>, Array2<f64>) {
        let n = n_thresholds + usize::from(generalized);
        let a_idx = n_thresholds;
        let a = self.a;
        let mut g = Array1::zeros(n);
        let mut h = Array2::zeros((n, n));

        // The upper boundary enters L with sign +1, the lower with -1.
        for (sign, boundary) in [(1.0, self.upper), (-1.0, self.lower)] {
            let Some(b) = boundary else { continue };
            g[b.index] += -sign * a * b.w;
            h[[b.index, b.index]] += sign * a * a * b.v;
            if generalized {
                g[a_idx] += sign * b.offset * b.w;
                h[[a_idx, a_idx]] += sign * b.offset * b.offset * b.v;
                let cross = -sign * (b.w + a * b.offset * b.v);
                h[[b.index, a_idx]] += cross;
                h[[a_idx, b.index]] += cross;
            }
        }
        (g, h)
    }

    /// Log-likelihood gradient and Hessian with respect to the item parameters.
    fn log_derivatives(&self, n_thresholds: usize, generalized: bool) -> (Array1<f64>, Array2<f64>) {
        let (g, scaled_h) = self.scaled_derivatives(n_thresholds, generalized);
        let n = g.len();
        let mut h = scaled_h;
        for i in 0..n {
            for j in 0..=i {
                let value = h[[i, j]] - g[i] * g[j];
                h[[i, j]] = value;
                h[[j, i]] = value;
            }
        }
        (g, h)
    }
}

fn default_parameters(boundaries: &[f64]) -> IrtResult<ItemParameters> {
    if boundaries.is_empty() {
        return Err(IrtError::InvalidParameters(
            "graded response model needs at least one category boundary".into(),
        ));
    }
    let start = spaced_thresholds(boundaries.len());
    let categories = CategoryThresholds::from_fn(boundaries, |i| start[i])?;
    Ok(ItemParameters::polytomous(categories, 1.0))
}

macro_rules! graded_model {
    ($model:ty, $kind:expr, $layout:expr, $generalized:expr) => {
        impl ItemResponseModel for $model {
            fn kind(&self) -> ModelKind {
                $kind
            }

            fn layout(&self) -> &'static [ParameterKind] {
                &$layout
            }

            fn is_polytomous(&self) -> bool {
                true
            }

            fn default_parameters(&self, boundaries: &[f64]) -> IrtResult<ItemParameters> {
                default_parameters(boundaries)
            }

            fn likelihood(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64> {
                likelihood(ability, ip, frac, $generalized)
            }

            fn log_likelihood(
                &self,
                ability: f64,
                ip: &ItemParameters,
                frac: f64,
            ) -> IrtResult<f64> {
                log_likelihood(ability, ip, frac, $generalized)
            }

            fn log_likelihood_ability(
                &self,
                ability: f64,
                ip: &ItemParameters,
                frac: f64,
            ) -> IrtResult<f64> {
                let terms = category_terms(ability, ip, frac, $generalized)?;
                ensure_finite(terms.d_ability(), "graded response score")
            }

            fn log_likelihood_ability_ability(
                &self,
                ability: f64,
                ip: &ItemParameters,
                frac: f64,
            ) -> IrtResult<f64> {
                let terms = category_terms(ability, ip, frac, $generalized)?;
                ensure_finite(terms.d2_ability(), "graded response curvature")
            }

            fn gradient_ip(
                &self,
                ability: f64,
                ip: &ItemParameters,
                frac: f64,
            ) -> IrtResult<Array1<f64>> {
                let terms = category_terms(ability, ip, frac, $generalized)?;
                Ok(terms.log_derivatives(ip.categories.len(), $generalized).0)
            }

            fn hessian_ip(
                &self,
                ability: f64,
                ip: &ItemParameters,
                frac: f64,
            ) -> IrtResult<Array2<f64>> {
                let terms = category_terms(ability, ip, frac, $generalized)?;
                Ok(terms.log_derivatives(ip.categories.len(), $generalized).1)
            }
        }
    };
}

graded_model!(Grm, ModelKind::Grm, LAYOUT, false);
graded_model!(GrmGeneralized, ModelKind::GrmGeneralized, LAYOUT_GENERALIZED, true);
