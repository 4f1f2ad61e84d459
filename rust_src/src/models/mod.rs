//! IRT model family.
//!
//! Every model implements [`ItemResponseModel`]: likelihood, analytic
//! derivatives with respect to ability and item parameters, Fisher
//! information, and the trusted-region terms used by the item estimator.
//! [`ModelKind`] is the closed set of models with enum dispatch, so hot loops
//! can either stay generic over a concrete model or match once per call.
//!
//! Outcomes are fractions in `[0, 1]`. A fraction maps to the category whose
//! boundary is the last one `<=` the fraction; dichotomous models use the
//! boundaries `[0, 1]`.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2};

use crate::error::{IrtError, IrtResult};
use crate::params::{ItemParameters, ParameterKind, vector_len};
use crate::trusted_region::{self, TrustedRegionBounds};

pub mod birnbaum;
pub mod grm;
pub mod mixed;
pub mod pcm;
pub mod rasch;

pub use birnbaum::Birnbaum;
pub use grm::{Grm, GrmGeneralized};
pub use mixed::MixedRaschBirnbaum;
pub use pcm::{Pcm, PcmGeneralized};
pub use rasch::Rasch;

/// Decimal places kept on estimated parameters.
pub const PRECISION: i32 = 4;

/// Category boundaries of every dichotomous model.
pub const DICHOTOMOUS_FRACTIONS: [f64; 2] = [0.0, 1.0];

pub trait ItemResponseModel {
    fn kind(&self) -> ModelKind;

    /// Parameter slots in vector order.
    fn layout(&self) -> &'static [ParameterKind];

    fn is_polytomous(&self) -> bool;

    /// Starting values for the given category boundaries (without 0).
    fn default_parameters(&self, boundaries: &[f64]) -> IrtResult<ItemParameters>;

    fn likelihood(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64>;

    fn log_likelihood(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64>;

    /// First derivative of the log-likelihood with respect to ability.
    fn log_likelihood_ability(&self, ability: f64, ip: &ItemParameters, frac: f64)
    -> IrtResult<f64>;

    /// Second derivative of the log-likelihood with respect to ability.
    fn log_likelihood_ability_ability(
        &self,
        ability: f64,
        ip: &ItemParameters,
        frac: f64,
    ) -> IrtResult<f64>;

    /// Log-likelihood gradient with respect to the item parameters.
    fn gradient_ip(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<Array1<f64>>;

    /// Log-likelihood Hessian with respect to the item parameters.
    fn hessian_ip(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<Array2<f64>>;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn parameter_names(&self) -> Vec<&'static str> {
        self.layout().iter().map(|k| k.name()).collect()
    }

    /// Number of item-parameter values plus one for ability.
    fn dimension(&self, ip: &ItemParameters) -> usize {
        vector_len(self.layout(), ip.categories.len()) + 1
    }

    fn precision(&self) -> i32 {
        PRECISION
    }

    /// Sorted category boundaries, starting with the implicit 0.
    fn get_fractions(&self, ip: &ItemParameters) -> Vec<f64> {
        if self.is_polytomous() {
            std::iter::once(0.0)
                .chain(ip.categories.iter().map(|(f, _)| f))
                .collect()
        } else {
            DICHOTOMOUS_FRACTIONS.to_vec()
        }
    }

    /// `-log_likelihood_ability_ability` for one outcome.
    fn category_information(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64> {
        Ok(-self.log_likelihood_ability_ability(ability, ip, frac)?)
    }

    /// Expected information over all categories.
    fn fisher_information(&self, ability: f64, ip: &ItemParameters) -> IrtResult<f64> {
        let mut info = 0.0;
        for frac in self.get_fractions(ip) {
            info += self.category_information(ability, ip, frac)?
                * self.likelihood(ability, ip, frac)?;
        }
        Ok(ensure_finite(info, "Fisher information")?.max(0.0))
    }

    fn trusted_region_project(
        &self,
        ip: &ItemParameters,
        bounds: &TrustedRegionBounds,
    ) -> ItemParameters {
        trusted_region::project(self.layout(), ip, bounds)
    }

    /// Log-penalty added to the estimation objective.
    fn trusted_region_log_penalty(&self, ip: &ItemParameters, bounds: &TrustedRegionBounds) -> f64 {
        trusted_region::log_penalty(self.layout(), ip, bounds)
    }

    fn trusted_region_log_jacobian(
        &self,
        ip: &ItemParameters,
        bounds: &TrustedRegionBounds,
    ) -> Array1<f64> {
        trusted_region::log_jacobian(self.layout(), ip, bounds)
    }

    fn trusted_region_log_hessian(
        &self,
        ip: &ItemParameters,
        bounds: &TrustedRegionBounds,
    ) -> Array2<f64> {
        trusted_region::log_hessian(self.layout(), ip, bounds)
    }
}

/// Index of the category `frac` falls into: the last boundary `<= frac`.
pub fn get_category(frac: f64, fractions: &[f64]) -> IrtResult<usize> {
    if !(0.0..=1.0).contains(&frac) {
        return Err(IrtError::InvalidFraction(frac));
    }
    Ok(fractions
        .iter()
        .rposition(|&boundary| boundary <= frac)
        .unwrap_or(0))
}

/// Category index for a polytomous item whose stored boundaries exclude 0.
pub(crate) fn polytomous_category(frac: f64, ip: &ItemParameters) -> IrtResult<usize> {
    if ip.categories.is_empty() {
        return Err(IrtError::InvalidParameters(
            "polytomous model without category thresholds".into(),
        ));
    }
    if !(0.0..=1.0).contains(&frac) {
        return Err(IrtError::InvalidFraction(frac));
    }
    Ok(ip.categories.iter().take_while(|&(b, _)| b <= frac).count())
}

/// `1` for the upper dichotomous outcome, `0` otherwise.
pub(crate) fn dichotomous_outcome(frac: f64) -> IrtResult<f64> {
    Ok(get_category(frac, &DICHOTOMOUS_FRACTIONS)? as f64)
}

/// Evenly spaced starting thresholds in `[-1, 1]`.
pub(crate) fn spaced_thresholds(n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => (0..n)
            .map(|i| -1.0 + 2.0 * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

pub(crate) fn ensure_finite(value: f64, context: &str) -> IrtResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(IrtError::degenerate(format!("{context} is {value}")))
    }
}

/// The closed set of supported models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelKind {
    Rasch,
    RaschBirnbaum,
    MixedRaschBirnbaum,
    Grm,
    GrmGeneralized,
    Pcm,
    PcmGeneralized,
}

impl ModelKind {
    pub const ALL: [ModelKind; 7] = [
        ModelKind::Rasch,
        ModelKind::RaschBirnbaum,
        ModelKind::MixedRaschBirnbaum,
        ModelKind::Grm,
        ModelKind::GrmGeneralized,
        ModelKind::Pcm,
        ModelKind::PcmGeneralized,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::Rasch => "rasch",
            ModelKind::RaschBirnbaum => "raschbirnbaum",
            ModelKind::MixedRaschBirnbaum => "mixedraschbirnbaum",
            ModelKind::Grm => "grm",
            ModelKind::GrmGeneralized => "grmgeneralized",
            ModelKind::Pcm => "pcm",
            ModelKind::PcmGeneralized => "pcmgeneralized",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = IrtError;

    fn from_str(s: &str) -> IrtResult<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        ModelKind::ALL
            .into_iter()
            .find(|m| m.name() == wanted)
            .ok_or_else(|| IrtError::UnknownModel(s.to_string()))
    }
}

impl serde::Serialize for ModelKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> serde::Deserialize<'de> for ModelKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! dispatch {
    ($self:expr, $model:ident => $body:expr) => {
        match $self {
            ModelKind::Rasch => {
                let $model = Rasch;
                $body
            }
            ModelKind::RaschBirnbaum => {
                let $model = Birnbaum;
                $body
            }
            ModelKind::MixedRaschBirnbaum => {
                let $model = MixedRaschBirnbaum;
                $body
            }
            ModelKind::Grm => {
                let $model = Grm;
                $body
            }
            ModelKind::GrmGeneralized => {
                let $model = GrmGeneralized;
                $body
            }
            ModelKind::Pcm => {
                let $model = Pcm;
                $body
            }
            ModelKind::PcmGeneralized => {
                let $model = PcmGeneralized;
                $body
            }
        }
    };
}

impl ItemResponseModel for ModelKind {
    fn kind(&self) -> ModelKind {
        *self
    }

    fn layout(&self) -> &'static [ParameterKind] {
        dispatch!(self, m => m.layout())
    }

    fn is_polytomous(&self) -> bool {
        dispatch!(self, m => m.is_polytomous())
    }

    fn default_parameters(&self, boundaries: &[f64]) -> IrtResult<ItemParameters> {
        dispatch!(self, m => m.default_parameters(boundaries))
    }

    fn likelihood(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64> {
        dispatch!(self, m => m.likelihood(ability, ip, frac))
    }

    fn log_likelihood(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<f64> {
        dispatch!(self, m => m.log_likelihood(ability, ip, frac))
    }

    fn log_likelihood_ability(
        &self,
        ability: f64,
        ip: &ItemParameters,
        frac: f64,
    ) -> IrtResult<f64> {
        dispatch!(self, m => m.log_likelihood_ability(ability, ip, frac))
    }

    fn log_likelihood_ability_ability(
        &self,
        ability: f64,
        ip: &ItemParameters,
        frac: f64,
    ) -> IrtResult<f64> {
        dispatch!(self, m => m.log_likelihood_ability_ability(ability, ip, frac))
    }

    fn gradient_ip(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<Array1<f64>> {
        dispatch!(self, m => m.gradient_ip(ability, ip, frac))
    }

    fn hessian_ip(&self, ability: f64, ip: &ItemParameters, frac: f64) -> IrtResult<Array2<f64>> {
        dispatch!(self, m => m.hessian_ip(ability, ip, frac))
    }

    fn fisher_information(&self, ability: f64, ip: &ItemParameters) -> IrtResult<f64> {
        dispatch!(self, m => m.fisher_information(ability, ip))
    }
}

#[cfg(test)]
mod tests;
