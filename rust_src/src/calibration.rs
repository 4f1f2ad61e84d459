//! Batch item fitting and joint calibration.
//!
//! [`estimate_items`] fits every item of a matrix against one ability
//! snapshot in parallel. [`calibrate`] alternates that with
//! [`estimate_abilities`] for a fixed number of rounds, starting from
//! raw-score abilities, so each pass reads a consistent snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::CatConfig;
use crate::error::{IrtError, IrtResult, Warning};
use crate::estimation::{EstimationOptions, ItemEstimate, estimate_item_params};
use crate::likelihood::matrix_log_likelihood;
use crate::models::{ItemResponseModel, ModelKind};
use crate::params::ItemParamRecord;
use crate::responses::{AbilitySnapshot, ItemId, PersonId, PruneReport, ResponseMatrix};
use crate::scoring::{AbilityEstimate, CalibratedItem, ItemBank, estimate_abilities};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationOptions {
    /// Alternating item/person passes.
    pub rounds: usize,
    /// Candidate models; each item keeps the compatible one with the lowest AIC.
    pub models: Vec<ModelKind>,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            rounds: 3,
            models: vec![ModelKind::RaschBirnbaum],
        }
    }
}

impl CalibrationOptions {
    pub fn validate(&self) -> IrtResult<()> {
        if self.rounds == 0 {
            return Err(IrtError::Config("calibration rounds must be positive".into()));
        }
        if self.models.is_empty() {
            return Err(IrtError::Config("calibration needs at least one model".into()));
        }
        Ok(())
    }
}

/// Stable per-item seed so restarts do not depend on thread scheduling.
fn item_seed(seed: u64, item: &str) -> u64 {
    // FNV-1a
    let hash = item.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    });
    seed ^ hash
}

/// Whether any response sits strictly between the extremes.
fn has_partial_credit(matrix: &ResponseMatrix, item: &str) -> bool {
    matrix
        .item_responses(item)
        .is_some_and(|row| row.values().any(|&f| f > 0.0 && f < 1.0))
}

/// Fits one item with every compatible candidate model and keeps the best.
pub fn fit_item(
    matrix: &ResponseMatrix,
    item: &str,
    abilities: &AbilitySnapshot,
    previous: Option<&CalibratedItem>,
    config: &CatConfig,
) -> IrtResult<ItemEstimate> {
    let observations = matrix.observations(item, abilities);
    let polytomous = has_partial_credit(matrix, item);
    let options = EstimationOptions {
        seed: item_seed(config.estimation.seed, item),
        ..config.estimation
    };

    let mut best: Option<ItemEstimate> = None;
    let mut last_error = None;
    for &model in config
        .calibration
        .models
        .iter()
        .filter(|m| m.is_polytomous() == polytomous)
    {
        let start = previous
            .filter(|p| p.model == model)
            .map(|p| &p.parameters);
        match estimate_item_params(&model, &observations, start, config.bounds_for(model), &options) {
            Ok(fit) => {
                log::debug!("{item}: {model} AIC {:.3}", fit.aic());
                if best.as_ref().is_none_or(|b| fit.aic() < b.aic()) {
                    best = Some(fit);
                }
            }
            Err(err) => last_error = Some(err),
        }
    }

    match (best, last_error) {
        (Some(fit), _) => Ok(fit),
        (None, Some(err)) => Err(err),
        (None, None) => Err(IrtError::Config(format!(
            "no {} candidate model for item {item}",
            if polytomous { "polytomous" } else { "dichotomous" }
        ))),
    }
}

/// Item fits of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemBatch {
    pub estimates: BTreeMap<ItemId, ItemEstimate>,
    pub warnings: Vec<Warning>,
}

/// Fits every item of `matrix` against a fixed ability snapshot.
///
/// `previous` provides start values. Failures are collected as warnings;
/// setting `cancel` stops the batch between items.
pub fn estimate_items(
    matrix: &ResponseMatrix,
    abilities: &AbilitySnapshot,
    previous: &ItemBank,
    config: &CatConfig,
    cancel: &AtomicBool,
) -> IrtResult<ItemBatch> {
    let items: Vec<&ItemId> = matrix.item_ids().collect();
    let results: Vec<(ItemId, IrtResult<ItemEstimate>)> = items
        .par_iter()
        .map(|&item| {
            if cancel.load(Ordering::Relaxed) {
                return (item.clone(), Err(IrtError::Cancelled));
            }
            let fit = fit_item(matrix, item, abilities, previous.get(item), config);
            (item.clone(), fit)
        })
        .collect();

    if cancel.load(Ordering::Relaxed) {
        return Err(IrtError::Cancelled);
    }

    let mut batch = ItemBatch::default();
    for (item, result) in results {
        match result {
            Ok(fit) => {
                batch.estimates.insert(item, fit);
            }
            Err(err) => {
                log::warn!("item {item}: {err}");
                batch.warnings.push(Warning::new(item, &err));
            }
        }
    }
    log::info!(
        "fitted {} items, {} failures",
        batch.estimates.len(),
        batch.warnings.len()
    );
    Ok(batch)
}

/// Outcome of [`calibrate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationReport {
    pub items: ItemBank,
    pub abilities: BTreeMap<PersonId, AbilityEstimate>,
    pub pruned: PruneReport,
    /// Failures of the final round.
    pub warnings: Vec<Warning>,
    pub rounds: usize,
    /// Total log-likelihood after the final round.
    pub log_likelihood: f64,
    pub item_failures: usize,
    pub person_failures: usize,
}

impl CalibrationReport {
    /// Storage records for every calibrated item.
    pub fn records(&self) -> IrtResult<BTreeMap<ItemId, ItemParamRecord>> {
        self.items
            .iter()
            .map(|(item, c)| Ok((item.clone(), c.parameters.to_record(c.model)?)))
            .collect()
    }

    pub fn snapshot(&self) -> AbilitySnapshot {
        self.abilities
            .iter()
            .map(|(person, est)| (person.clone(), est.ability))
            .collect()
    }
}

/// Joint calibration of item parameters and abilities.
pub fn calibrate(
    matrix: &ResponseMatrix,
    config: &CatConfig,
    cancel: &AtomicBool,
) -> IrtResult<CalibrationReport> {
    config.validate()?;
    let mut data = matrix.clone();
    let pruned = data.prune();
    if data.is_empty() {
        return Err(IrtError::InsufficientData {
            observations: 0,
            free_parameters: 1,
        });
    }

    let mut snapshot = AbilitySnapshot::initial_from_raw_scores(&data);
    let mut report = CalibrationReport {
        pruned,
        ..CalibrationReport::default()
    };

    for round in 1..=config.calibration.rounds {
        let items = estimate_items(&data, &snapshot, &report.items, config, cancel)?;
        for (item, fit) in items.estimates {
            report.items.insert(
                item,
                CalibratedItem {
                    model: fit.model,
                    parameters: fit.parameters,
                },
            );
        }

        let people = estimate_abilities(&data, &report.items, &snapshot, &config.ability, cancel)?;
        snapshot = snapshot
            .iter()
            .map(|(person, ability)| (person.clone(), ability))
            .chain(people.estimates.iter().map(|(p, e)| (p.clone(), e.ability)))
            .collect();

        report.log_likelihood = matrix_log_likelihood(&data, &report.items, &snapshot)?;
        log::info!(
            "calibration round {round}: log-likelihood {:.4}",
            report.log_likelihood
        );

        report.rounds = round;
        report.item_failures = items.warnings.len();
        report.person_failures = people.warnings.len();
        report.warnings = items.warnings;
        report.warnings.extend(people.warnings);
        report.abilities = people.estimates;
    }

    log::info!(
        "calibrated {} items and {} persons, {} warnings",
        report.items.len(),
        report.abilities.len(),
        report.warnings.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_seed_is_stable_and_item_specific() {
        assert_eq!(item_seed(7, "q1"), item_seed(7, "q1"));
        assert_ne!(item_seed(7, "q1"), item_seed(7, "q2"));
    }

    #[test]
    fn options_need_rounds_and_models() {
        assert!(CalibrationOptions::default().validate().is_ok());
        let none = CalibrationOptions {
            models: Vec::new(),
            ..CalibrationOptions::default()
        };
        assert!(none.validate().is_err());
    }

    #[test]
    fn partial_credit_detection() {
        let mut m = ResponseMatrix::new();
        m.insert("d", "p", 1.0).unwrap();
        m.insert("d", "q", 0.0).unwrap();
        m.insert("poly", "p", 0.5).unwrap();
        assert!(!has_partial_credit(&m, "d"));
        assert!(has_partial_credit(&m, "poly"));
    }

    #[test]
    fn missing_candidate_model_is_reported() {
        let mut m = ResponseMatrix::new();
        m.insert("poly", "p", 0.5).unwrap();
        m.insert("poly", "q", 1.0).unwrap();
        let snapshot: AbilitySnapshot =
            vec![("p".to_string(), 0.0), ("q".to_string(), 1.0)].into_iter().collect();
        let err = fit_item(&m, "poly", &snapshot, None, &CatConfig::default()).unwrap_err();
        assert!(err.to_string().contains("polytomous"));
    }

    #[test]
    fn pruned_to_nothing_is_insufficient() {
        let mut m = ResponseMatrix::new();
        m.insert("q", "p", 1.0).unwrap();
        let cancel = AtomicBool::new(false);
        assert!(matches!(
            calibrate(&m, &CatConfig::default(), &cancel),
            Err(IrtError::InsufficientData { .. })
        ));
    }
}
