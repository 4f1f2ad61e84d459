//! Computerized Adaptive Testing (CAT): item selection and session simulation.
//!
//! The next item is chosen by a [`SelectionPipeline`], an ordered list of
//! [`SelectionStage`]s that score, penalise, filter, and rank the candidates
//! still available in an [`ItemPool`]. After every response the ability is
//! re-estimated with [`estimate_person_ability`].

use std::collections::{HashMap, HashSet};

use rand::prelude::*;
use rand_pcg::Pcg64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ExtremePattern, IrtError, IrtResult};
use crate::models::{ItemResponseModel, ModelKind};
use crate::params::ItemParameters;
use crate::responses::ItemId;
use crate::scoring::{
    AbilityEstimate, AbilityOptions, AbilityStatus, ScoredResponse, estimate_person_ability,
    standard_error,
};

/// One selectable item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolItem {
    pub id: ItemId,
    pub model: ModelKind,
    pub parameters: ItemParameters,
    /// Scale the item contributes to, for quotas.
    #[serde(default)]
    pub scale: Option<String>,
    /// Seconds timestamp of the last time the respondent saw the item.
    #[serde(default)]
    pub last_played: Option<u64>,
}

impl PoolItem {
    pub fn new(id: impl Into<ItemId>, model: ModelKind, parameters: ItemParameters) -> Self {
        Self {
            id: id.into(),
            model,
            parameters,
            scale: None,
            last_played: None,
        }
    }

    pub fn with_scale(mut self, scale: impl Into<String>) -> Self {
        self.scale = Some(scale.into());
        self
    }

    pub fn with_last_played(mut self, timestamp: u64) -> Self {
        self.last_played = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPool {
    items: Vec<PoolItem>,
}

impl ItemPool {
    pub fn new(items: Vec<PoolItem>) -> Self {
        Self { items }
    }

    pub fn push(&mut self, item: PoolItem) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&PoolItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolItem> {
        self.items.iter()
    }

    /// Fisher information of every item at `ability`.
    pub fn information(&self, ability: f64) -> IrtResult<Vec<(&ItemId, f64)>> {
        self.items
            .iter()
            .map(|item| Ok((&item.id, item.model.fisher_information(ability, &item.parameters)?)))
            .collect()
    }
}

/// A candidate item and its running score.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub item: &'a PoolItem,
    pub score: f64,
}

/// State of the session a selection is made for.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub ability: f64,
    /// Seconds timestamp the recency penalty is measured against.
    pub now: u64,
    pub administered: HashSet<ItemId>,
    /// Items administered so far per scale.
    pub scale_counts: HashMap<String, usize>,
}

impl SelectionContext {
    pub fn new(ability: f64, now: u64) -> Self {
        Self {
            ability,
            now,
            ..Self::default()
        }
    }

    pub fn record(&mut self, item: &PoolItem) {
        self.administered.insert(item.id.clone());
        if let Some(scale) = &item.scale {
            *self.scale_counts.entry(scale.clone()).or_default() += 1;
        }
    }
}

pub trait SelectionStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply<'a>(
        &self,
        candidates: Vec<Candidate<'a>>,
        ctx: &SelectionContext,
    ) -> IrtResult<Vec<Candidate<'a>>>;
}

/// Adds `weight * information` at the current ability.
#[derive(Debug, Clone, Copy)]
pub struct FisherInformation {
    pub weight: f64,
}

impl Default for FisherInformation {
    fn default() -> Self {
        Self { weight: 1.0 }
    }
}

impl SelectionStage for FisherInformation {
    fn name(&self) -> &'static str {
        "fisher_information"
    }

    fn apply<'a>(
        &self,
        mut candidates: Vec<Candidate<'a>>,
        ctx: &SelectionContext,
    ) -> IrtResult<Vec<Candidate<'a>>> {
        for c in &mut candidates {
            c.score += self.weight * c.item.model.fisher_information(ctx.ability, &c.item.parameters)?;
        }
        Ok(candidates)
    }
}

/// Subtracts `penalty * 0.5^(elapsed / half_life)` from recently seen items.
#[derive(Debug, Clone, Copy)]
pub struct RecentlyPlayedPenalty {
    pub penalty: f64,
    /// Seconds after which the penalty has halved. Zero or less never decays.
    pub half_life: f64,
}

impl Default for RecentlyPlayedPenalty {
    fn default() -> Self {
        Self {
            penalty: 1.0,
            half_life: 86_400.0,
        }
    }
}

impl SelectionStage for RecentlyPlayedPenalty {
    fn name(&self) -> &'static str {
        "recently_played_penalty"
    }

    fn apply<'a>(
        &self,
        mut candidates: Vec<Candidate<'a>>,
        ctx: &SelectionContext,
    ) -> IrtResult<Vec<Candidate<'a>>> {
        for c in &mut candidates {
            if let Some(played) = c.item.last_played {
                let elapsed = ctx.now.saturating_sub(played) as f64;
                let decay = if self.half_life > 0.0 {
                    0.5f64.powf(elapsed / self.half_life)
                } else {
                    1.0
                };
                c.score -= self.penalty * decay;
            }
        }
        Ok(candidates)
    }
}

/// Drops candidates whose scale already reached its quota.
#[derive(Debug, Clone, Default)]
pub struct ScaleQuota {
    pub quotas: HashMap<String, usize>,
}

impl SelectionStage for ScaleQuota {
    fn name(&self) -> &'static str {
        "scale_quota"
    }

    fn apply<'a>(
        &self,
        candidates: Vec<Candidate<'a>>,
        ctx: &SelectionContext,
    ) -> IrtResult<Vec<Candidate<'a>>> {
        Ok(candidates
            .into_iter()
            .filter(|c| {
                let Some(scale) = &c.item.scale else {
                    return true;
                };
                match self.quotas.get(scale) {
                    Some(&quota) => ctx.scale_counts.get(scale).copied().unwrap_or(0) < quota,
                    None => true,
                }
            })
            .collect())
    }
}

/// Sorts by descending score and keeps the best `keep`.
#[derive(Debug, Clone, Copy)]
pub struct MaxScore {
    pub keep: usize,
}

impl Default for MaxScore {
    fn default() -> Self {
        Self { keep: 1 }
    }
}

impl SelectionStage for MaxScore {
    fn name(&self) -> &'static str {
        "max_score"
    }

    fn apply<'a>(
        &self,
        mut candidates: Vec<Candidate<'a>>,
        _ctx: &SelectionContext,
    ) -> IrtResult<Vec<Candidate<'a>>> {
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.item.id.cmp(&b.item.id)));
        candidates.truncate(self.keep);
        Ok(candidates)
    }
}

pub struct SelectionPipeline {
    stages: Vec<Box<dyn SelectionStage>>,
}

impl SelectionPipeline {
    pub fn new(stages: Vec<Box<dyn SelectionStage>>) -> Self {
        Self { stages }
    }

    /// Quota filter, information score, recency penalty, then the top item.
    pub fn standard(quotas: HashMap<String, usize>) -> Self {
        Self::new(vec![
            Box::new(ScaleQuota { quotas }),
            Box::new(FisherInformation::default()),
            Box::new(RecentlyPlayedPenalty::default()),
            Box::new(MaxScore::default()),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Best remaining item of `pool`, or `None` when nothing is left.
    pub fn select_next<'a>(
        &self,
        pool: &'a ItemPool,
        ctx: &SelectionContext,
    ) -> IrtResult<Option<&'a PoolItem>> {
        let mut candidates: Vec<Candidate<'a>> = pool
            .iter()
            .filter(|item| !ctx.administered.contains(&item.id))
            .map(|item| Candidate { item, score: 0.0 })
            .collect();
        for stage in &self.stages {
            candidates = stage.apply(candidates, ctx)?;
            if candidates.is_empty() {
                log::debug!("stage {} left no candidates", stage.name());
                return Ok(None);
            }
        }
        Ok(candidates
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score).then_with(|| b.item.id.cmp(&a.item.id)))
            .map(|c| c.item))
    }
}

impl Default for SelectionPipeline {
    fn default() -> Self {
        Self::standard(HashMap::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub max_items: usize,
    pub min_items: usize,
    /// Stop once the standard error drops to this value.
    pub se_threshold: f64,
    /// Ability move after a one-sided pattern, before any mixed response.
    pub extreme_step: f64,
    pub start_ability: f64,
    pub now: u64,
    pub ability: AbilityOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_items: 20,
            min_items: 5,
            se_threshold: 0.3,
            extreme_step: 1.0,
            start_ability: 0.0,
            now: 0,
            ability: AbilityOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub true_ability: f64,
    pub ability: f64,
    pub standard_error: f64,
    /// Administered items with the simulated outcome, in order.
    pub administered: Vec<(ItemId, f64)>,
}

/// Draws an outcome fraction from the model's category distribution.
pub fn simulate_response<R: Rng + ?Sized>(
    model: ModelKind,
    ip: &ItemParameters,
    ability: f64,
    rng: &mut R,
) -> IrtResult<f64> {
    let fractions = model.get_fractions(ip);
    let u: f64 = rng.random();
    let mut cumulative = 0.0;
    for &frac in &fractions {
        cumulative += model.likelihood(ability, ip, frac)?;
        if u < cumulative {
            return Ok(frac);
        }
    }
    fractions
        .last()
        .copied()
        .ok_or_else(|| IrtError::InvalidParameters("item has no categories".into()))
}

fn update_ability(
    responses: &[ScoredResponse<'_>],
    current: f64,
    options: &SessionOptions,
) -> IrtResult<(f64, f64)> {
    let step = |pattern: ExtremePattern| {
        let moved = match pattern {
            ExtremePattern::AllHighest => current + options.extreme_step,
            ExtremePattern::AllLowest => current - options.extreme_step,
        };
        moved.clamp(options.ability.min_ability, options.ability.max_ability)
    };
    let pattern = match estimate_person_ability(responses, current, &options.ability) {
        Ok(AbilityEstimate {
            status: AbilityStatus::Extreme(pattern),
            ..
        }) => pattern,
        Ok(estimate) => return Ok((estimate.ability, estimate.standard_error)),
        Err(IrtError::UnidentifiableAbility { pattern, .. }) => pattern,
        Err(err) => return Err(err),
    };
    let stepped = step(pattern);
    Ok((stepped, standard_error(responses, stepped)?))
}

/// Runs one adaptive session against a simulated respondent.
pub fn simulate_session(
    true_ability: f64,
    pool: &ItemPool,
    pipeline: &SelectionPipeline,
    options: &SessionOptions,
    rng: &mut Pcg64,
) -> IrtResult<SessionResult> {
    let mut ctx = SelectionContext::new(options.start_ability, options.now);
    let mut administered: Vec<(&PoolItem, f64)> = Vec::with_capacity(options.max_items);
    let mut standard_error = f64::INFINITY;

    while administered.len() < options.max_items {
        let Some(item) = pipeline.select_next(pool, &ctx)? else {
            break;
        };
        let outcome = simulate_response(item.model, &item.parameters, true_ability, rng)?;
        ctx.record(item);
        administered.push((item, outcome));

        let responses: Vec<ScoredResponse<'_>> = administered
            .iter()
            .map(|(item, fraction)| ScoredResponse {
                model: item.model,
                parameters: &item.parameters,
                fraction: *fraction,
            })
            .collect();
        (ctx.ability, standard_error) = update_ability(&responses, ctx.ability, options)?;

        if administered.len() >= options.min_items && standard_error <= options.se_threshold {
            break;
        }
    }

    Ok(SessionResult {
        true_ability,
        ability: ctx.ability,
        standard_error,
        administered: administered
            .into_iter()
            .map(|(item, outcome)| (item.id.clone(), outcome))
            .collect(),
    })
}

/// Runs `replications` sessions per true ability in parallel.
///
/// Each task seeds its own `Pcg64`, so results do not depend on scheduling.
pub fn simulate_batch(
    true_abilities: &[f64],
    replications: usize,
    pool: &ItemPool,
    pipeline: &SelectionPipeline,
    options: &SessionOptions,
    seed: u64,
) -> IrtResult<Vec<SessionResult>> {
    let tasks: Vec<(usize, usize)> = (0..true_abilities.len())
        .flat_map(|t| (0..replications).map(move |r| (t, r)))
        .collect();

    tasks
        .par_iter()
        .map(|&(ability_idx, rep)| {
            let task_seed = seed
                .wrapping_add(ability_idx as u64 * 1000)
                .wrapping_add(rep as u64);
            let mut rng = Pcg64::seed_from_u64(task_seed);
            simulate_session(true_abilities[ability_idx], pool, pipeline, options, &mut rng)
        })
        .collect()
}

/// Accuracy of simulated sessions at one true ability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConditionalSummary {
    pub true_ability: f64,
    pub bias: f64,
    pub mse: f64,
    pub mean_items: f64,
}

/// Bias, MSE, and test length per distinct true ability, in input order.
pub fn conditional_summary(results: &[SessionResult]) -> Vec<ConditionalSummary> {
    let mut order: Vec<f64> = Vec::new();
    let mut groups: HashMap<u64, Vec<&SessionResult>> = HashMap::new();
    for r in results {
        let key = r.true_ability.to_bits();
        if !groups.contains_key(&key) {
            order.push(r.true_ability);
        }
        groups.entry(key).or_default().push(r);
    }
    order
        .into_iter()
        .map(|true_ability| {
            let group = &groups[&true_ability.to_bits()];
            let n = group.len() as f64;
            let mean_est = group.iter().map(|r| r.ability).sum::<f64>() / n;
            ConditionalSummary {
                true_ability,
                bias: mean_est - true_ability,
                mse: group
                    .iter()
                    .map(|r| (r.ability - true_ability).powi(2))
                    .sum::<f64>()
                    / n,
                mean_items: group.iter().map(|r| r.administered.len() as f64).sum::<f64>() / n,
            }
        })
        .collect()
}
