//! Person ability estimation.
//!
//! Abilities are fitted by one-dimensional Newton iteration on the summed
//! score `sum d log L / d ability` of every answered item, with the item
//! parameters held fixed. A bisection on the score takes over whenever a
//! Newton step is unusable. One-sided response patterns are detected up
//! front since their likelihood has no finite maximum.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ExtremePattern, IrtError, IrtResult, Warning};
use crate::models::{ItemResponseModel, ModelKind, get_category};
use crate::params::ItemParameters;
use crate::responses::{AbilitySnapshot, ItemId, PersonId, ResponseMatrix};

/// What to do with an all-lowest or all-highest response pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtremePolicy {
    /// Return the configured bound, flagged as [`AbilityStatus::Extreme`].
    #[default]
    Pin,
    /// Fail with [`IrtError::UnidentifiableAbility`].
    Refuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbilityOptions {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub min_ability: f64,
    pub max_ability: f64,
    pub extreme_policy: ExtremePolicy,
}

impl Default for AbilityOptions {
    fn default() -> Self {
        Self {
            tolerance: 0.001,
            max_iterations: 100,
            min_ability: -5.0,
            max_ability: 5.0,
            extreme_policy: ExtremePolicy::Pin,
        }
    }
}

impl AbilityOptions {
    pub fn validate(&self) -> IrtResult<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(IrtError::Config("ability tolerance must be positive".into()));
        }
        if self.max_iterations == 0 {
            return Err(IrtError::Config("ability max_iterations must be positive".into()));
        }
        if !(self.min_ability.is_finite()
            && self.max_ability.is_finite()
            && self.min_ability < self.max_ability)
        {
            return Err(IrtError::Config(format!(
                "ability range [{}, {}] is empty",
                self.min_ability, self.max_ability
            )));
        }
        Ok(())
    }

    fn bound_for(&self, pattern: ExtremePattern) -> f64 {
        match pattern {
            ExtremePattern::AllLowest => self.min_ability,
            ExtremePattern::AllHighest => self.max_ability,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbilityStatus {
    Converged,
    /// One-sided pattern pinned to a bound.
    Extreme(ExtremePattern),
    /// The score has no root inside the ability range; the ability is the
    /// bound the likelihood increases towards.
    Bounded,
    /// Iteration cap reached; the ability is provisional.
    IterationLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbilityEstimate {
    pub ability: f64,
    /// `1 / sqrt(test information)`, infinite when there is no information.
    pub standard_error: f64,
    pub iterations: usize,
    pub status: AbilityStatus,
}

impl AbilityEstimate {
    pub fn is_converged(&self) -> bool {
        self.status == AbilityStatus::Converged
    }
}

/// One answered item as seen by the ability estimator.
#[derive(Debug, Clone, Copy)]
pub struct ScoredResponse<'a> {
    pub model: ModelKind,
    pub parameters: &'a ItemParameters,
    pub fraction: f64,
}

/// Calibrated item: its model and fixed parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedItem {
    pub model: ModelKind,
    pub parameters: ItemParameters,
}

pub type ItemBank = BTreeMap<ItemId, CalibratedItem>;

fn score_and_curvature(responses: &[ScoredResponse<'_>], ability: f64) -> IrtResult<(f64, f64)> {
    let mut score = 0.0;
    let mut curvature = 0.0;
    for r in responses {
        score += r.model.log_likelihood_ability(ability, r.parameters, r.fraction)?;
        curvature += r
            .model
            .log_likelihood_ability_ability(ability, r.parameters, r.fraction)?;
    }
    Ok((score, curvature))
}

/// Test information of the answered items.
pub fn test_information(responses: &[ScoredResponse<'_>], ability: f64) -> IrtResult<f64> {
    responses.iter().try_fold(0.0, |acc, r| {
        Ok(acc + r.model.fisher_information(ability, r.parameters)?)
    })
}

/// `1 / sqrt(test information)`, infinite without information.
pub fn standard_error(responses: &[ScoredResponse<'_>], ability: f64) -> IrtResult<f64> {
    let info = test_information(responses, ability)?;
    Ok(if info > 0.0 {
        1.0 / info.sqrt()
    } else {
        f64::INFINITY
    })
}

/// Detects all-lowest / all-highest patterns.
pub fn extreme_pattern(responses: &[ScoredResponse<'_>]) -> IrtResult<Option<ExtremePattern>> {
    let mut all_lowest = true;
    let mut all_highest = true;
    for r in responses {
        let fractions = r.model.get_fractions(r.parameters);
        let k = get_category(r.fraction, &fractions)?;
        all_lowest &= k == 0;
        all_highest &= k + 1 == fractions.len();
    }
    Ok(match (responses.is_empty(), all_lowest, all_highest) {
        (true, _, _) => None,
        (false, true, _) => Some(ExtremePattern::AllLowest),
        (false, _, true) => Some(ExtremePattern::AllHighest),
        _ => None,
    })
}

/// Fits one person's ability from their answered items.
///
/// `start` seeds the iteration, typically the person's previous ability or
/// the population mean.
pub fn estimate_person_ability(
    responses: &[ScoredResponse<'_>],
    start: f64,
    options: &AbilityOptions,
) -> IrtResult<AbilityEstimate> {
    if responses.is_empty() {
        return Err(IrtError::InsufficientData {
            observations: 0,
            free_parameters: 1,
        });
    }

    if let Some(pattern) = extreme_pattern(responses)? {
        let bound = options.bound_for(pattern);
        return match options.extreme_policy {
            ExtremePolicy::Refuse => Err(IrtError::UnidentifiableAbility {
                fallback: bound,
                pattern,
            }),
            ExtremePolicy::Pin => Ok(AbilityEstimate {
                ability: bound,
                standard_error: standard_error(responses, bound)?,
                iterations: 0,
                status: AbilityStatus::Extreme(pattern),
            }),
        };
    }

    let (lo, hi) = (options.min_ability, options.max_ability);
    let start = if start.is_finite() { start.clamp(lo, hi) } else { 0.0 };
    let mut ability = start;
    for iteration in 1..=options.max_iterations {
        let (score, curvature) = score_and_curvature(responses, ability)?;
        let delta = -score / curvature;
        let next = ability + delta;
        if !(curvature < 0.0 && next.is_finite() && (lo..=hi).contains(&next)) {
            log::debug!("ability Newton step unusable at {ability:.4}, bisecting");
            let (root, steps, at_bound) = bisect_score(responses, lo, hi, options)?;
            if at_bound {
                log::debug!("ability score keeps its sign on [{lo}, {hi}], pinned to {root}");
            }
            return Ok(AbilityEstimate {
                ability: root,
                standard_error: standard_error(responses, root)?,
                iterations: iteration + steps,
                status: if at_bound {
                    AbilityStatus::Bounded
                } else {
                    AbilityStatus::Converged
                },
            });
        }
        ability = next;
        if delta.abs() < options.tolerance {
            return Ok(AbilityEstimate {
                ability,
                standard_error: standard_error(responses, ability)?,
                iterations: iteration,
                status: AbilityStatus::Converged,
            });
        }
    }

    log::warn!(
        "ability did not converge in {} iterations, last value {ability:.4}",
        options.max_iterations
    );
    Ok(AbilityEstimate {
        ability,
        standard_error: standard_error(responses, ability)?,
        iterations: options.max_iterations,
        status: AbilityStatus::IterationLimit,
    })
}

/// Root of the score on `[lo, hi]` with the bisection step count. The flag
/// is set when the score does not change sign there and a bound is returned.
fn bisect_score(
    responses: &[ScoredResponse<'_>],
    mut lo: f64,
    mut hi: f64,
    options: &AbilityOptions,
) -> IrtResult<(f64, usize, bool)> {
    let score_at = |ability: f64| -> IrtResult<f64> { Ok(score_and_curvature(responses, ability)?.0) };
    if score_at(lo)? <= 0.0 {
        return Ok((lo, 0, true));
    }
    if score_at(hi)? >= 0.0 {
        return Ok((hi, 0, true));
    }
    let mut steps = 0;
    while hi - lo > options.tolerance && steps < 200 {
        let mid = 0.5 * (lo + hi);
        if score_at(mid)? > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        steps += 1;
    }
    Ok((0.5 * (lo + hi), steps, false))
}

/// Abilities for every person of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbilityBatch {
    pub estimates: BTreeMap<PersonId, AbilityEstimate>,
    pub warnings: Vec<Warning>,
}

impl AbilityBatch {
    /// Snapshot of the estimated abilities for the next item pass.
    pub fn snapshot(&self) -> AbilitySnapshot {
        self.estimates
            .iter()
            .map(|(person, est)| (person.clone(), est.ability))
            .collect()
    }
}

/// Re-estimates every person of `matrix` against fixed item parameters.
///
/// Each person starts from their ability in `previous`, or the snapshot mean
/// if unknown. Responses to items missing from `bank` are ignored. Failures
/// are collected as warnings; setting `cancel` stops the batch between
/// persons.
pub fn estimate_abilities(
    matrix: &ResponseMatrix,
    bank: &ItemBank,
    previous: &AbilitySnapshot,
    options: &AbilityOptions,
    cancel: &AtomicBool,
) -> IrtResult<AbilityBatch> {
    let seed = previous.mean();
    let people: Vec<_> = matrix.by_person().into_iter().collect();
    let results: Vec<(PersonId, IrtResult<AbilityEstimate>)> = people
        .par_iter()
        .map(|(person, answers)| {
            if cancel.load(Ordering::Relaxed) {
                return ((*person).clone(), Err(IrtError::Cancelled));
            }
            let responses: Vec<ScoredResponse<'_>> = answers
                .iter()
                .filter_map(|(item, fraction)| {
                    bank.get(item.as_str()).map(|c| ScoredResponse {
                        model: c.model,
                        parameters: &c.parameters,
                        fraction: *fraction,
                    })
                })
                .collect();
            let start = previous.get(person).unwrap_or(seed);
            (
                (*person).clone(),
                estimate_person_ability(&responses, start, options),
            )
        })
        .collect();

    if cancel.load(Ordering::Relaxed) {
        return Err(IrtError::Cancelled);
    }

    let mut batch = AbilityBatch::default();
    for (person, result) in results {
        match result {
            Ok(estimate) => {
                batch.estimates.insert(person, estimate);
            }
            Err(err) => {
                log::warn!("ability for {person}: {err}");
                batch.warnings.push(Warning::new(person, &err));
            }
        }
    }
    log::info!(
        "estimated {} abilities, {} failures",
        batch.estimates.len(),
        batch.warnings.len()
    );
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CategoryThresholds;
    use approx::assert_relative_eq;

    fn bank_2pl() -> Vec<ItemParameters> {
        [-1.5, -0.5, 0.0, 0.5, 1.5]
            .into_iter()
            .map(|b| ItemParameters::dichotomous(b, 1.2, 0.0))
            .collect()
    }

    fn scored<'a>(items: &'a [ItemParameters], fractions: &[f64]) -> Vec<ScoredResponse<'a>> {
        items
            .iter()
            .zip(fractions)
            .map(|(ip, &fraction)| ScoredResponse {
                model: ModelKind::RaschBirnbaum,
                parameters: ip,
                fraction,
            })
            .collect()
    }

    #[test]
    fn mixed_pattern_converges_to_score_root() {
        let items = bank_2pl();
        let responses = scored(&items, &[1.0, 1.0, 1.0, 0.0, 0.0]);
        let est = estimate_person_ability(&responses, 0.0, &AbilityOptions::default()).unwrap();
        assert!(est.is_converged());
        let (score, _) = score_and_curvature(&responses, est.ability).unwrap();
        assert!(score.abs() < 1e-3);
        assert!(est.standard_error.is_finite() && est.standard_error > 0.0);
    }

    #[test]
    fn symmetric_pattern_lands_near_zero() {
        let items: Vec<_> = [-1.0, 1.0]
            .into_iter()
            .map(|b| ItemParameters::dichotomous(b, 1.0, 0.0))
            .collect();
        let responses = scored(&items, &[1.0, 0.0]);
        let est = estimate_person_ability(&responses, 2.0, &AbilityOptions::default()).unwrap();
        assert_relative_eq!(est.ability, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn all_correct_is_pinned_or_refused() {
        let items = bank_2pl();
        let responses = scored(&items, &[1.0; 5]);
        let est = estimate_person_ability(&responses, 0.0, &AbilityOptions::default()).unwrap();
        assert_eq!(est.ability, 5.0);
        assert_eq!(
            est.status,
            AbilityStatus::Extreme(ExtremePattern::AllHighest)
        );

        let refuse = AbilityOptions {
            extreme_policy: ExtremePolicy::Refuse,
            ..AbilityOptions::default()
        };
        let responses = scored(&items, &[0.0; 5]);
        match estimate_person_ability(&responses, 0.0, &refuse) {
            Err(IrtError::UnidentifiableAbility { fallback, pattern }) => {
                assert_eq!(fallback, -5.0);
                assert_eq!(pattern, ExtremePattern::AllLowest);
            }
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn polytomous_top_category_counts_as_extreme() {
        let cats = CategoryThresholds::new(vec![(0.5, -0.5), (1.0, 0.5)]).unwrap();
        let ip = ItemParameters::polytomous(cats, 1.0);
        let responses = [ScoredResponse {
            model: ModelKind::Grm,
            parameters: &ip,
            fraction: 1.0,
        }];
        assert_eq!(
            extreme_pattern(&responses).unwrap(),
            Some(ExtremePattern::AllHighest)
        );
        let middle = [ScoredResponse {
            fraction: 0.5,
            ..responses[0]
        }];
        assert_eq!(extreme_pattern(&middle).unwrap(), None);
        let est = estimate_person_ability(&middle, 0.0, &AbilityOptions::default()).unwrap();
        assert_relative_eq!(est.ability, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn root_beyond_the_range_is_reported_as_bounded() {
        let items = vec![ItemParameters::dichotomous(3.0, 1.0, 0.0); 100];
        let mut fractions = vec![1.0; 100];
        fractions[0] = 0.0;
        let responses = scored(&items, &fractions);
        let est = estimate_person_ability(&responses, 0.0, &AbilityOptions::default()).unwrap();
        assert_eq!(est.ability, 5.0);
        assert_eq!(est.status, AbilityStatus::Bounded);
        assert!(!est.is_converged());
        assert!(est.standard_error.is_finite());
    }

    #[test]
    fn empty_responses_are_insufficient() {
        assert!(matches!(
            estimate_person_ability(&[], 0.0, &AbilityOptions::default()),
            Err(IrtError::InsufficientData { .. })
        ));
    }

    #[test]
    fn bisection_handles_a_far_start() {
        let items = bank_2pl();
        let responses = scored(&items, &[1.0, 0.0, 1.0, 0.0, 0.0]);
        let direct = estimate_person_ability(&responses, 0.0, &AbilityOptions::default()).unwrap();
        let far = estimate_person_ability(&responses, 4.99, &AbilityOptions::default()).unwrap();
        assert_relative_eq!(direct.ability, far.ability, epsilon = 2e-3);
    }

    #[test]
    fn batch_collects_estimates_and_warnings() {
        let mut matrix = ResponseMatrix::new();
        let mut bank = ItemBank::new();
        for (i, b) in [-1.0, 0.0, 1.0].into_iter().enumerate() {
            bank.insert(
                format!("q{i}"),
                CalibratedItem {
                    model: ModelKind::Rasch,
                    parameters: ItemParameters::rasch(b),
                },
            );
        }
        for (person, answers) in [("ana", [1.0, 1.0, 0.0]), ("bo", [1.0, 0.0, 0.0])] {
            for (i, f) in answers.into_iter().enumerate() {
                matrix.insert(format!("q{i}"), person, f).unwrap();
            }
        }
        matrix.insert("unknown", "cy", 1.0).unwrap();

        let cancel = AtomicBool::new(false);
        let batch = estimate_abilities(
            &matrix,
            &bank,
            &AbilitySnapshot::default(),
            &AbilityOptions::default(),
            &cancel,
        )
        .unwrap();
        assert!(batch.estimates["ana"].ability > batch.estimates["bo"].ability);
        assert_eq!(batch.warnings.len(), 1);
        assert_eq!(batch.warnings[0].id, "cy");
        assert_eq!(batch.snapshot().len(), 2);

        cancel.store(true, Ordering::Relaxed);
        assert!(matches!(
            estimate_abilities(
                &matrix,
                &bank,
                &AbilitySnapshot::default(),
                &AbilityOptions::default(),
                &cancel
            ),
            Err(IrtError::Cancelled)
        ));
    }
}
