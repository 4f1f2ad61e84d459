//! Three-parameter logistic (mixed Rasch-Birnbaum) model with a guessing floor.
//!
//! `P(correct) = guessing + (1 - guessing) * sigmoid(discrimination * (ability - difficulty))`

use ndarray::{Array1, Array2, array};

use super::{ItemResponseModel, ModelKind, dichotomous_outcome};
use crate::error::{IrtError, IrtResult};
use crate::params::{ItemParameters, ParameterKind};
use crate::utils::{log_sigmoid, sigmoid};

const LAYOUT: [ParameterKind; 3] = [
    ParameterKind::Difficulty,
    ParameterKind::Discrimination,
    ParameterKind::Guessing,
];

#[derive(Debug, Clone, Copy, Default)]
pub struct MixedRaschBirnbaum;

/// Log-likelihood derivatives with respect to the logit `z` and guessing `c`.
struct LogitTerms {
    g_z: f64,
    h_zz: f64,
    g_c: f64,
    h_cc: f64,
    h_zc: f64,
}

fn logit_terms(ability: f64, ip: &ItemParameters, k: f64) -> IrtResult<LogitTerms> {
    let c = ip.guessing;
    let p_star = sigmoid(ip.discrimination * (ability - ip.difficulty));
    let w = p_star * (1.0 - p_star);

    if k == 1.0 {
        let p = c + (1.0 - c) * p_star;
        let p2 = p * p;
        if !p2.is_normal() {
            return Err(IrtError::degenerate(format!(
                "3PL probability of a correct response is {p}"
            )));
        }
        Ok(LogitTerms {
            g_z: (1.0 - c) * w / p,
            h_zz: (1.0 - c) * w * ((1.0 - 2.0 * p_star) * p - (1.0 - c) * w) / p2,
            g_c: (1.0 - p_star) / p,
            h_cc: -(1.0 - p_star) * (1.0 - p_star) / p2,
            h_zc: -w / p2,
        })
    } else {
        let q = 1.0 - c;
        if !(q * q).is_normal() {
            return Err(IrtError::degenerate("3PL guessing parameter reached 1"));
        }
        Ok(LogitTerms {
            g_z: -p_star,
            h_zz: -w,
            g_c: -1.0 / q,
            h_cc: -1.0 / (q * q),
            h_zc: 0.0,
        })
    }
}

impl ItemResponseModel for MixedRaschBirnbaum {
    fn kind(&self) -> ModelKind {
        ModelKind::MixedRaschBirnbaum
    }

    fn layout(&self) -> &'static [ParameterKind] {
        &LAYOUT
    }

    fn is_polytomous(&self) -> bool {
        false
    }

    fn default_parameters(&self, _boundaries: &[f64]) -> IrtResult<ItemParameters> {
        Ok(ItemParameters::dichotomous(0.0, 1.0, 0.1))
    }

    fn likelihood(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64> {
        let c = ip.guessing;
        let z = ip.discrimination * (ability - ip.difficulty);
        Ok(if dichotomous_outcome(frac)? == 1.0 {
            c + (1.0 - c) * sigmoid(z)
        } else {
            (1.0 - c) * sigmoid(-z)
        })
    }

    fn log_likelihood(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64> {
        let c = ip.guessing;
        let z = ip.discrimination * (ability - ip.difficulty);
        let ll = if dichotomous_outcome(frac)? == 1.0 {
            if c <= 0.0 {
                log_sigmoid(z)
            } else {
                (c + (1.0 - c) * sigmoid(z)).ln()
            }
        } else {
            (1.0 - c).ln() + log_sigmoid(-z)
        };
        super::ensure_finite(ll, "3PL log-likelihood")
    }

    fn log_likelihood_ability(
        &self,
        ability: f64,
        ip: &ItemParameters,
        frac: f64,
    ) -> IrtResult<f64> {
        let t = logit_terms(ability, ip, dichotomous_outcome(frac)?)?;
        Ok(ip.discrimination * t.g_z)
    }

    fn log_likelihood_ability_ability(
        &self,
        ability: f64,
        ip: &ItemParameters,
        frac: f64,
    ) -> IrtResult<f64> {
        let t = logit_terms(ability, ip, dichotomous_outcome(frac)?)?;
        let a = ip.discrimination;
        Ok(a * a * t.h_zz)
    }

    fn gradient_ip(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<Array1<f64>> {
        let t = logit_terms(ability, ip, dichotomous_outcome(frac)?)?;
        let d = ability - ip.difficulty;
        Ok(array![-ip.discrimination * t.g_z, d * t.g_z, t.g_c])
    }

    fn hessian_ip(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<Array2<f64>> {
        let t = logit_terms(ability, ip, dichotomous_outcome(frac)?)?;
        let a = ip.discrimination;
        let d = ability - ip.difficulty;

        let h_bb = a * a * t.h_zz;
        let h_aa = d * d * t.h_zz;
        let h_ba = -a * d * t.h_zz - t.g_z;
        let h_bc = -a * t.h_zc;
        let h_ac = d * t.h_zc;
        Ok(array![
            [h_bb, h_ba, h_bc],
            [h_ba, h_aa, h_ac],
            [h_bc, h_ac, t.h_cc]
        ])
    }
}
