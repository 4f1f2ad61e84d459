//! Two-parameter logistic (Rasch-Birnbaum) model.
//!
//! `P(correct) = 1 / (1 + exp(discrimination * (difficulty - ability)))`

use ndarray::{Array1, Array2, array};

use super::{ItemResponseModel, ModelKind, dichotomous_outcome};
use crate::error::IrtResult;
use crate::params::{ItemParameters, ParameterKind};
use crate::utils::{log_sigmoid, sigmoid};

const LAYOUT: [ParameterKind; 2] = [ParameterKind::Difficulty, ParameterKind::Discrimination];

#[derive(Debug, Clone, Copy, Default)]
pub struct Birnbaum;

#[inline]
fn logit(ability: f64, ip: &ItemParameters) -> f64 {
    ip.discrimination * (ability - ip.difficulty)
}

impl ItemResponseModel for Birnbaum {
    fn kind(&self) -> ModelKind {
        ModelKind::RaschBirnbaum
    }

    fn layout(&self) -> &'static [ParameterKind] {
        &LAYOUT
    }

    fn is_polytomous(&self) -> bool {
        false
    }

    fn default_parameters(&self, _boundaries: &[f64]) -> IrtResult<ItemParameters> {
        Ok(ItemParameters::dichotomous(0.0, 1.0, 0.0))
    }

    fn likelihood(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64> {
        let z = logit(ability, ip);
        Ok(if dichotomous_outcome(frac)? == 1.0 {
            sigmoid(z)
        } else {
            sigmoid(-z)
        })
    }

    fn log_likelihood(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64> {
        let z = logit(ability, ip);
        Ok(if dichotomous_outcome(frac)? == 1.0 {
            log_sigmoid(z)
        } else {
            log_sigmoid(-z)
        })
    }

    fn log_likelihood_ability(
        &self,
        ability: f64,
        ip: &ItemParameters,
        frac: f64,
    ) -> IrtResult<f64> {
        let k = dichotomous_outcome(frac)?;
        Ok(ip.discrimination * (k - sigmoid(logit(ability, ip))))
    }

    fn log_likelihood_ability_ability(
        &self,
        ability: f64,
        ip: &ItemParameters,
        frac: f64,
    ) -> IrtResult<f64> {
        dichotomous_outcome(frac)?;
        let p = sigmoid(logit(ability, ip));
        let a = ip.discrimination;
        Ok(-a * a * p * (1.0 - p))
    }

    fn gradient_ip(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<Array1<f64>> {
        let k = dichotomous_outcome(frac)?;
        let residual = k - sigmoid(logit(ability, ip));
        Ok(array![
            -ip.discrimination * residual,
            (ability - ip.difficulty) * residual
        ])
    }

    fn hessian_ip(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<Array2<f64>> {
        let k = dichotomous_outcome(frac)?;
        let p = sigmoid(logit(ability, ip));
        let w = p * (1.0 - p);
        let a = ip.discrimination;
        let d = ability - ip.difficulty;

        let h_bb = -w * a * a;
        let h_aa = -w * d * d;
        let h_ba = w * a * d - (k - p);
        Ok(array![[h_bb, h_ba], [h_ba, h_aa]])
    }

    fn fisher_information(&self, ability: f64, ip: &ItemParameters) -> IrtResult<f64> {
        let p = sigmoid(logit(ability, ip));
        let a = ip.discrimination;
        Ok(a * a * p * (1.0 - p))
    }
}
