//! Error types shared by the models and estimators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::ItemParameters;

/// Crate-wide result alias.
pub type IrtResult<T> = Result<T, IrtError>;

/// Which one-sided response pattern made an ability unidentifiable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtremePattern {
    /// Every response is in the lowest category.
    AllLowest,
    /// Every response is in the highest category.
    AllHighest,
}

#[derive(Debug, Error)]
pub enum IrtError {
    /// A denominator or pivot collapsed to zero.
    #[error("numeric degeneracy: {context}")]
    NumericDegeneracy { context: String },

    /// Fewer informative responses than free parameters.
    #[error("insufficient data: {observations} observations for {free_parameters} free parameters")]
    InsufficientData {
        observations: usize,
        free_parameters: usize,
    },

    /// Newton iteration could not make progress or ran out of iterations.
    #[error("estimation did not converge after {iterations} iterations: {reason}")]
    EstimationDivergence {
        last_best: Box<ItemParameters>,
        iterations: usize,
        reason: &'static str,
    },

    /// A uniform response pattern has no finite maximum-likelihood ability.
    #[error("ability is unidentifiable for pattern {pattern:?}, fallback {fallback}")]
    UnidentifiableAbility {
        fallback: f64,
        pattern: ExtremePattern,
    },

    #[error("invalid item parameters: {0}")]
    InvalidParameters(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Outcome fractions must lie in `[0, 1]`.
    #[error("invalid response fraction {0}")]
    InvalidFraction(f64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("estimation cancelled")]
    Cancelled,
}

impl IrtError {
    pub(crate) fn degenerate(context: impl Into<String>) -> Self {
        IrtError::NumericDegeneracy {
            context: context.into(),
        }
    }

    /// Returns `true` if a restart from a perturbed point may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, IrtError::NumericDegeneracy { .. })
    }

    /// The provisional estimate carried by a divergence, if any.
    pub fn last_best(&self) -> Option<&ItemParameters> {
        match self {
            IrtError::EstimationDivergence { last_best, .. } => Some(&**last_best),
            _ => None,
        }
    }
}

/// A per-item or per-person failure collected by a batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub message: String,
}

impl Warning {
    pub fn new(id: impl Into<String>, error: &IrtError) -> Self {
        Self {
            id: id.into(),
            message: error.to_string(),
        }
    }
}
