//! Run configuration loaded from TOML.
//!
//! Every section is optional; missing fields take the built-in defaults.
//!
//! ```toml
//! [trusted_region]
//! min_threshold_gap = 0.05
//!
//! [trusted_region.difficulty]
//! sd = 1.5
//!
//! [trusted_region.models.grmgeneralized.discrimination]
//! max_factor = 6.0
//!
//! [estimation]
//! max_iterations = 80
//!
//! [ability]
//! extreme_policy = "refuse"
//!
//! [calibration]
//! rounds = 4
//! models = ["rasch", "raschbirnbaum"]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationOptions;
use crate::error::{IrtError, IrtResult};
use crate::estimation::EstimationOptions;
use crate::models::ModelKind;
use crate::scoring::AbilityOptions;
use crate::trusted_region::TrustedRegionBounds;

/// Default bounds plus per-model overrides.
///
/// An override table replaces the defaults for that model entirely; fields it
/// leaves out take the built-in values, not the `[trusted_region]` ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustedRegionConfig {
    #[serde(flatten)]
    pub defaults: TrustedRegionBounds,
    #[serde(default)]
    pub models: BTreeMap<ModelKind, TrustedRegionBounds>,
}

impl TrustedRegionConfig {
    pub fn bounds_for(&self, model: ModelKind) -> &TrustedRegionBounds {
        self.models.get(&model).unwrap_or(&self.defaults)
    }

    pub fn validate(&self) -> IrtResult<()> {
        self.defaults.validate()?;
        for (model, bounds) in &self.models {
            bounds
                .validate()
                .map_err(|e| IrtError::Config(format!("trusted_region.models.{model}: {e}")))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatConfig {
    #[serde(default)]
    pub trusted_region: TrustedRegionConfig,
    #[serde(default)]
    pub estimation: EstimationOptions,
    #[serde(default)]
    pub ability: AbilityOptions,
    #[serde(default)]
    pub calibration: CalibrationOptions,
}

impl CatConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> IrtResult<Self> {
        let config: CatConfig =
            toml::from_str(s).map_err(|e| IrtError::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file; see [`CatConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> IrtResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| IrtError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        log::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> IrtResult<()> {
        self.trusted_region.validate()?;
        self.estimation.validate()?;
        self.ability.validate()?;
        self.calibration.validate()
    }

    pub fn bounds_for(&self, model: ModelKind) -> &TrustedRegionBounds {
        self.trusted_region.bounds_for(model)
    }
}
