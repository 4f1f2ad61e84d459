//! Item Response Theory for computerized adaptive testing.
//!
//! This crate provides:
//! - A closed family of IRT models (Rasch, 2PL, 3PL, graded response, partial
//!   credit) with analytic likelihood derivatives and Fisher information
//! - Trusted-region bounds that keep item parameters in a plausible range
//! - Item parameter estimation by damped Newton iteration
//! - Person ability estimation with detection of one-sided response patterns
//! - Joint calibration alternating item and person passes over immutable
//!   ability snapshots, parallelised with rayon
//! - CAT item selection pipelines and session simulation
//! - TOML configuration

pub mod utils;

pub mod calibration;
pub mod cat;
pub mod config;
pub mod error;
pub mod estimation;
pub mod likelihood;
pub mod linalg;
pub mod models;
pub mod params;
pub mod responses;
pub mod scoring;
pub mod trusted_region;

pub use calibration::{CalibrationOptions, CalibrationReport, calibrate, estimate_items};
pub use cat::{ItemPool, PoolItem, SelectionPipeline, SelectionStage, simulate_batch, simulate_session};
pub use config::CatConfig;
pub use error::{IrtError, IrtResult};
pub use estimation::{EstimationOptions, ItemEstimate, estimate_item_params};
pub use models::{ItemResponseModel, ModelKind};
pub use params::{CategoryThresholds, ItemParamRecord, ItemParameters};
pub use responses::{AbilitySnapshot, Observation, Response, ResponseMatrix};
pub use scoring::{
    AbilityEstimate, AbilityOptions, AbilityStatus, CalibratedItem, ItemBank, ScoredResponse,
    estimate_abilities, estimate_person_ability,
};
pub use trusted_region::TrustedRegionBounds;
