//! Partial credit models.
//!
//! Category `k` has the cumulative logit
//! `eta(k) = sum_{j < k} a * (ability - intercepts[j])` with `eta(0) = 0`, and
//! the likelihood is the softmax of `eta` over all categories. [`Pcm`] fixes
//! `a = 1`; [`PcmGeneralized`] estimates it. All moments are taken in log
//! space so large logits do not overflow.

use ndarray::{Array1, Array2};

use super::{ItemResponseModel, ModelKind, ensure_finite, polytomous_category, spaced_thresholds};
use crate::error::{IrtError, IrtResult};
use crate::params::{CategoryThresholds, ItemParameters, ParameterKind};
use crate::utils::logsumexp;

const LAYOUT: [ParameterKind; 1] = [ParameterKind::Intercepts];
const LAYOUT_GENERALIZED: [ParameterKind; 2] =
    [ParameterKind::Intercepts, ParameterKind::Discrimination];

#[derive(Debug, Clone, Copy, Default)]
pub struct Pcm;

#[derive(Debug, Clone, Copy, Default)]
pub struct PcmGeneralized;

/// Category distribution of one item at one ability.
struct Softmax {
    a: f64,
    /// Observed category.
    k: usize,
    /// Category probabilities, `m + 1` entries.
    probs: Vec<f64>,
    /// `d eta(h) / d a`, i.e. `h * ability - sum_{j < h} intercepts[j]`.
    t: Vec<f64>,
    log_prob: f64,
}

fn softmax(ability: f64, ip: &ItemParameters, frac: f64, generalized: bool) -> IrtResult<Softmax> {
    let k = polytomous_category(frac, ip)?;
    let a = if generalized { ip.discrimination } else { 1.0 };
    let m = ip.categories.len();

    let mut t = Vec::with_capacity(m + 1);
    t.push(0.0);
    for (_, intercept) in ip.categories.iter() {
        let prev = t[t.len() - 1];
        t.push(prev + ability - intercept);
    }
    let eta: Vec<f64> = t.iter().map(|&x| a * x).collect();
    let log_norm = logsumexp(&eta);
    if !log_norm.is_finite() {
        return Err(IrtError::degenerate("partial credit normaliser is not finite"));
    }
    let probs = eta.iter().map(|&e| (e - log_norm).exp()).collect();
    Ok(Softmax {
        a,
        k,
        probs,
        t,
        log_prob: eta[k] - log_norm,
    })
}

impl Softmax {
    fn expected_category(&self) -> f64 {
        self.probs.iter().enumerate().map(|(h, p)| h as f64 * p).sum()
    }

    fn category_variance(&self) -> f64 {
        let mean = self.expected_category();
        self.probs
            .iter()
            .enumerate()
            .map(|(h, p)| (h as f64 - mean).powi(2) * p)
            .sum()
    }

    /// `P(h > j)`: probability that intercept `j` contributes to the logit.
    fn survival(&self) -> Vec<f64> {
        let m = self.probs.len() - 1;
        let mut s = vec![0.0; m];
        let mut acc = 0.0;
        for j in (0..m).rev() {
            acc += self.probs[j + 1];
            s[j] = acc;
        }
        s
    }

    fn derivatives(&self, generalized: bool) -> (Array1<f64>, Array2<f64>) {
        let m = self.probs.len() - 1;
        let n = m + usize::from(generalized);
        let a = self.a;
        let s = self.survival();
        let mut g = Array1::zeros(n);
        let mut h = Array2::zeros((n, n));

        for i in 0..m {
            let indicator = if self.k > i { 1.0 } else { 0.0 };
            g[i] = -a * (indicator - s[i]);
            for j in 0..=i {
                // P(h > max(i, j)) - P(h > i) P(h > j); i >= j here.
                let value = -a * a * (s[i] - s[i] * s[j]);
                h[[i, j]] = value;
                h[[j, i]] = value;
            }
        }

        if generalized {
            let mean_t: f64 = self.probs.iter().zip(&self.t).map(|(p, t)| p * t).sum();
            let var_t: f64 = self
                .probs
                .iter()
                .zip(&self.t)
                .map(|(p, t)| p * (t - mean_t).powi(2))
                .sum();
            g[m] = self.t[self.k] - mean_t;
            h[[m, m]] = -var_t;
            for j in 0..m {
                let upper_t: f64 = (j + 1..=m).map(|h| self.probs[h] * self.t[h]).sum();
                let cov = upper_t - s[j] * mean_t;
                let indicator = if self.k > j { 1.0 } else { 0.0 };
                let value = -(indicator - s[j]) + a * cov;
                h[[j, m]] = value;
                h[[m, j]] = value;
            }
        }
        (g, h)
    }
}

fn default_parameters(boundaries: &[f64]) -> IrtResult<ItemParameters> {
    if boundaries.is_empty() {
        return Err(IrtError::InvalidParameters(
            "partial credit model needs at least one category boundary".into(),
        ));
    }
    let start = spaced_thresholds(boundaries.len());
    let categories = CategoryThresholds::from_fn(boundaries, |i| start[i])?;
    Ok(ItemParameters::polytomous(categories, 1.0))
}

macro_rules! partial_credit_model {
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
                let sm = softmax(ability, ip, frac, $generalized)?;
                Ok(sm.probs[sm.k])
            }

            fn log_likelihood(
                &self,
                ability: f64,
                ip: &ItemParameters,
                frac: f64,
            ) -> IrtResult<f64> {
                let sm = softmax(ability, ip, frac, $generalized)?;
                ensure_finite(sm.log_prob, "partial credit log-likelihood")
            }

            fn log_likelihood_ability(
                &self,
                ability: f64,
                ip: &ItemParameters,
                frac: f64,
            ) -> IrtResult<f64> {
                let sm = softmax(ability, ip, frac, $generalized)?;
                Ok(sm.a * (sm.k as f64 - sm.expected_category()))
            }

            fn log_likelihood_ability_ability(
                &self,
                ability: f64,
                ip: &ItemParameters,
                frac: f64,
            ) -> IrtResult<f64> {
                let sm = softmax(ability, ip, frac, $generalized)?;
                Ok(-sm.a * sm.a * sm.category_variance())
            }

            fn gradient_ip(
                &self,
                ability: f64,
                ip: &ItemParameters,
                frac: f64,
            ) -> IrtResult<Array1<f64>> {
                let sm = softmax(ability, ip, frac, $generalized)?;
                Ok(sm.derivatives($generalized).0)
            }

            fn hessian_ip(
                &self,
                ability: f64,
                ip: &ItemParameters,
                frac: f64,
            ) -> IrtResult<Array2<f64>> {
                let sm = softmax(ability, ip, frac, $generalized)?;
                Ok(sm.derivatives($generalized).1)
            }

            fn fisher_information(&self, ability: f64, ip: &ItemParameters) -> IrtResult<f64> {
                let sm = softmax(ability, ip, 0.0, $generalized)?;
                Ok(sm.a * sm.a * sm.category_variance())
            }
        }
    };
}

partial_credit_model!(Pcm, ModelKind::Pcm, LAYOUT, false);
partial_credit_model!(PcmGeneralized, ModelKind::PcmGeneralized, LAYOUT_GENERALIZED, true);

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn item() -> ItemParameters {
        let cats =
            CategoryThresholds::new(vec![(1.0 / 3.0, -0.5), (2.0 / 3.0, 0.4), (1.0, 1.1)]).unwrap();
        ItemParameters::polytomous(cats, 0.8)
    }

    #[test]
    fn categories_sum_to_one() {
        let ip = item();
        let total: f64 = PcmGeneralized
            .get_fractions(&ip)
            .into_iter()
            .map(|f| PcmGeneralized.likelihood(0.3, &ip, f).unwrap())
            .sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn information_matches_category_sum() {
        let ip = item();
        let closed = PcmGeneralized.fisher_information(-0.4, &ip).unwrap();
        let mut summed = 0.0;
        for f in PcmGeneralized.get_fractions(&ip) {
            summed += PcmGeneralized.category_information(-0.4, &ip, f).unwrap()
                * PcmGeneralized.likelihood(-0.4, &ip, f).unwrap();
        }
        assert_relative_eq!(closed, summed, epsilon = 1e-12);
    }

    #[test]
    fn huge_ability_does_not_overflow() {
        let ip = item();
        let p = Pcm.likelihood(800.0, &ip, 1.0).unwrap();
        assert_relative_eq!(p, 1.0, epsilon = 1e-12);
    }
}
