//! One-parameter logistic (Rasch) model.
//!
//! `P(correct) = 1 / (1 + exp(difficulty - ability))`

use ndarray::{Array1, Array2, array};

use super::{ItemResponseModel, ModelKind, dichotomous_outcome};
use crate::error::IrtResult;
use crate::params::{ItemParameters, ParameterKind};
use crate::utils::{log_sigmoid, sigmoid};

const LAYOUT: [ParameterKind; 1] = [ParameterKind::Difficulty];

#[derive(Debug, Clone, Copy, Default)]
pub struct Rasch;

impl ItemResponseModel for Rasch {
    fn kind(&self) -> ModelKind {
        ModelKind::Rasch
    }

    fn layout(&self) -> &'static [ParameterKind] {
        &LAYOUT
    }

    fn is_polytomous(&self) -> bool {
        false
    }

    fn default_parameters(&self, _boundaries: &[f64]) -> IrtResult<ItemParameters> {
        Ok(ItemParameters::rasch(0.0))
    }

    fn likelihood(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64> {
        let z = ability - ip.difficulty;
        Ok(if dichotomous_outcome(frac)? == 1.0 {
            sigmoid(z)
        } else {
            sigmoid(-z)
        })
    }

    fn log_likelihood(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64> {
        let z = ability - ip.difficulty;
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
        Ok(k - sigmoid(ability - ip.difficulty))
    }

    fn log_likelihood_ability_ability(
        &self,
        ability: f64,
        ip: &ItemParameters,
        frac: f64,
    ) -> IrtResult<f64> {
        dichotomous_outcome(frac)?;
        let p = sigmoid(ability - ip.difficulty);
        Ok(-p * (1.0 - p))
    }

    fn gradient_ip(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<Array1<f64>> {
        let k = dichotomous_outcome(frac)?;
        Ok(array![sigmoid(ability - ip.difficulty) - k])
    }

    fn hessian_ip(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<Array2<f64>> {
        dichotomous_outcome(frac)?;
        let p = sigmoid(ability - ip.difficulty);
        Ok(array![[-p * (1.0 - p)]])
    }

    fn fisher_information(&self, ability: f64, ip: &ItemParameters) -> IrtResult<f64> {
        let p = sigmoid(ability - ip.difficulty);
        Ok(p * (1.0 - p))
    }
}
