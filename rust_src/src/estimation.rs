//! Item parameter estimation (damped Newton with a trusted region).
//!
//! For one item the objective is the summed log-likelihood of its responses,
//! each evaluated at the respondent's ability from a fixed snapshot, plus the
//! model's trusted-region log-penalty. Every iteration solves
//! `H delta = -g`, halves the step until the objective does not decrease, and
//! projects the result back into the trusted region.

use ndarray::{Array1, Array2};
use rand::prelude::*;
use rand_distr::Normal;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use crate::error::{IrtError, IrtResult};
use crate::linalg::{Direction, ascent_direction, cholesky, cholesky_solve};
use crate::models::{ItemResponseModel, ModelKind, polytomous_category};
use crate::params::{CategoryThresholds, ItemParameters, vector_len};
use crate::responses::Observation;
use crate::trusted_region::TrustedRegionBounds;

/// Relative slack when comparing objectives, so rounding noise at the
/// optimum does not count as a decrease.
const OBJECTIVE_SLACK: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationOptions {
    pub max_iterations: usize,
    /// Convergence threshold on the Euclidean norm of the applied step.
    pub tolerance: f64,
    /// Step halvings tried before an iteration is declared stuck.
    pub max_damping_steps: usize,
    /// Longest step taken in one iteration; longer directions are shortened.
    pub max_step: f64,
    /// Standard deviation of the restart perturbation.
    pub perturbation: f64,
    pub seed: u64,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-5,
            max_damping_steps: 8,
            max_step: 1.0,
            perturbation: 0.1,
            seed: 42,
        }
    }
}

impl EstimationOptions {
    pub fn validate(&self) -> IrtResult<()> {
        if self.max_iterations == 0 {
            return Err(IrtError::Config("max_iterations must be positive".into()));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(IrtError::Config(format!(
                "tolerance must be positive and finite, got {}",
                self.tolerance
            )));
        }
        if !(self.max_step.is_finite() && self.max_step > 0.0) {
            return Err(IrtError::Config("max_step must be positive".into()));
        }
        if !(self.perturbation.is_finite() && self.perturbation > 0.0) {
            return Err(IrtError::Config("perturbation must be positive".into()));
        }
        Ok(())
    }
}

/// Result of fitting one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemEstimate {
    pub model: ModelKind,
    /// Rounded to the model's precision.
    pub parameters: ItemParameters,
    /// Data log-likelihood at the estimate, without the penalty.
    pub log_likelihood: f64,
    pub iterations: usize,
    /// Asymptotic standard errors in vector order, when the curvature allows.
    pub standard_errors: Option<Vec<f64>>,
    /// Whether the fit needed the perturbed restart.
    pub restarted: bool,
    pub observations: usize,
}

impl ItemEstimate {
    pub fn free_parameters(&self) -> usize {
        vector_len(self.model.layout(), self.parameters.categories.len())
    }

    /// Akaike information criterion, lower is better.
    pub fn aic(&self) -> f64 {
        2.0 * self.free_parameters() as f64 - 2.0 * self.log_likelihood
    }
}

/// Fits one item's parameters.
///
/// `start` seeds the iteration; without it a start is derived from the
/// observed proportions. For polytomous models the category boundaries come
/// from `start` if given, otherwise from the distinct observed fractions.
pub fn estimate_item_params<M: ItemResponseModel + ?Sized>(
    model: &M,
    observations: &[Observation],
    start: Option<&ItemParameters>,
    bounds: &TrustedRegionBounds,
    options: &EstimationOptions,
) -> IrtResult<ItemEstimate> {
    let boundaries = category_boundaries(model, observations, start);
    let free = vector_len(model.layout(), boundaries.len());
    let informative = informative_count(model, observations, &boundaries)?;
    if informative == 0 || informative < free {
        return Err(IrtError::InsufficientData {
            observations: informative,
            free_parameters: free,
        });
    }

    let initial = match start {
        Some(ip) => ip.clone(),
        None => initial_parameters(model, observations, &boundaries)?,
    };
    let initial = model.trusted_region_project(&initial, bounds);

    let (fit, restarted) = match newton(model, observations, initial.clone(), &boundaries, bounds, options) {
        Ok(fit) => (fit, false),
        Err(err) if err.is_recoverable() => {
            log::debug!("{}: {err}; restarting from a perturbed point", model.name());
            let perturbed = perturb(model, &initial, &boundaries, bounds, options)?;
            let fit = newton(model, observations, perturbed, &boundaries, bounds, options)?;
            (fit, true)
        }
        Err(err) => return Err(err),
    };

    let standard_errors = standard_errors(model, observations, &fit.parameters, bounds);
    Ok(ItemEstimate {
        model: model.kind(),
        parameters: fit.parameters.rounded(model.precision()),
        log_likelihood: fit.log_likelihood,
        iterations: fit.iterations,
        standard_errors,
        restarted,
        observations: observations.len(),
    })
}

struct NewtonFit {
    parameters: ItemParameters,
    log_likelihood: f64,
    iterations: usize,
}

fn newton<M: ItemResponseModel + ?Sized>(
    model: &M,
    observations: &[Observation],
    start: ItemParameters,
    boundaries: &[f64],
    bounds: &TrustedRegionBounds,
    options: &EstimationOptions,
) -> IrtResult<NewtonFit> {
    let layout = model.layout();
    let precision = model.precision();
    let mut ip = start;
    let mut objective = data_log_likelihood(model, observations, &ip)?
        + model.trusted_region_log_penalty(&ip, bounds);

    for iteration in 1..=options.max_iterations {
        let (gradient, hessian) = accumulate(model, observations, &ip, bounds)?;
        let direction = ascent_direction(&hessian, &gradient)?;
        let step_norm = norm(direction.step());
        if step_norm < options.tolerance {
            return finish(model, observations, ip, iteration);
        }

        let x = ip.to_vector(layout);
        let mut scale = (options.max_step / step_norm).min(1.0);
        let mut accepted = None;
        for _ in 0..=options.max_damping_steps {
            let candidate_vec = &x + &(direction.step() * scale);
            let candidate = ItemParameters::from_vector(layout, boundaries, &candidate_vec.to_vec())?;
            let candidate = model.trusted_region_project(&candidate, bounds);
            match data_log_likelihood(model, observations, &candidate) {
                Ok(ll) => {
                    let value = ll + model.trusted_region_log_penalty(&candidate, bounds);
                    if value >= objective - OBJECTIVE_SLACK * (1.0 + objective.abs()) {
                        accepted = Some((candidate, value));
                        break;
                    }
                }
                Err(err) if err.is_recoverable() => {}
                Err(err) => return Err(err),
            }
            scale *= 0.5;
        }

        let Some((candidate, value)) = accepted else {
            return Err(IrtError::EstimationDivergence {
                last_best: Box::new(ip.rounded(precision)),
                iterations: iteration,
                reason: "no damped step increased the objective",
            });
        };

        let applied = norm(&(candidate.to_vector(layout) - &x));
        log::debug!(
            "{} iteration {iteration}: objective {value:.6}, step {applied:.2e}{}",
            model.name(),
            if matches!(direction, Direction::Gradient(_)) { " (gradient fallback)" } else { "" }
        );
        ip = candidate;
        objective = value;
        if applied < options.tolerance {
            return finish(model, observations, ip, iteration);
        }
    }

    Err(IrtError::EstimationDivergence {
        last_best: Box::new(ip.rounded(precision)),
        iterations: options.max_iterations,
        reason: "iteration limit reached",
    })
}

fn finish<M: ItemResponseModel + ?Sized>(
    model: &M,
    observations: &[Observation],
    parameters: ItemParameters,
    iterations: usize,
) -> IrtResult<NewtonFit> {
    let log_likelihood = data_log_likelihood(model, observations, &parameters)?;
    Ok(NewtonFit {
        parameters,
        log_likelihood,
        iterations,
    })
}

fn norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

/// Summed log-likelihood of all observations.
pub fn data_log_likelihood<M: ItemResponseModel + ?Sized>(
    model: &M,
    observations: &[Observation],
    ip: &ItemParameters,
) -> IrtResult<f64> {
    observations.iter().try_fold(0.0, |acc, obs| {
        Ok(acc + model.log_likelihood(obs.ability, ip, obs.fraction)?)
    })
}

/// Gradient and Hessian of the penalised objective.
fn accumulate<M: ItemResponseModel + ?Sized>(
    model: &M,
    observations: &[Observation],
    ip: &ItemParameters,
    bounds: &TrustedRegionBounds,
) -> IrtResult<(Array1<f64>, Array2<f64>)> {
    let mut gradient = model.trusted_region_log_jacobian(ip, bounds);
    let mut hessian = model.trusted_region_log_hessian(ip, bounds);
    for obs in observations {
        gradient += &model.gradient_ip(obs.ability, ip, obs.fraction)?;
        hessian += &model.hessian_ip(obs.ability, ip, obs.fraction)?;
    }
    Ok((gradient, hessian))
}

fn standard_errors<M: ItemResponseModel + ?Sized>(
    model: &M,
    observations: &[Observation],
    ip: &ItemParameters,
    bounds: &TrustedRegionBounds,
) -> Option<Vec<f64>> {
    let (_, hessian) = accumulate(model, observations, ip, bounds).ok()?;
    let l = cholesky(&hessian.mapv(|h| -h))?;
    let n = hessian.nrows();
    (0..n)
        .map(|i| {
            let mut e = Array1::zeros(n);
            e[i] = 1.0;
            let variance = cholesky_solve(&l, &e)[i];
            (variance > 0.0).then(|| variance.sqrt())
        })
        .collect()
}

/// Category boundaries (without 0) the fit is carried out over.
fn category_boundaries<M: ItemResponseModel + ?Sized>(
    model: &M,
    observations: &[Observation],
    start: Option<&ItemParameters>,
) -> Vec<f64> {
    if !model.is_polytomous() {
        return Vec::new();
    }
    if let Some(ip) = start.filter(|ip| !ip.categories.is_empty()) {
        return ip.categories.fractions();
    }
    let mut fractions: Vec<f64> = observations
        .iter()
        .map(|o| o.fraction)
        .filter(|&f| f > 0.0)
        .collect();
    fractions.sort_by(f64::total_cmp);
    fractions.dedup();
    fractions
}

fn category_of<M: ItemResponseModel + ?Sized>(
    model: &M,
    fraction: f64,
    probe: &ItemParameters,
) -> IrtResult<usize> {
    if model.is_polytomous() {
        polytomous_category(fraction, probe)
    } else {
        crate::models::get_category(fraction, &crate::models::DICHOTOMOUS_FRACTIONS)
    }
}

/// Observations count as informative unless all share one category.
fn informative_count<M: ItemResponseModel + ?Sized>(
    model: &M,
    observations: &[Observation],
    boundaries: &[f64],
) -> IrtResult<usize> {
    if model.is_polytomous() && boundaries.is_empty() {
        return Ok(0);
    }
    let probe = probe_parameters(boundaries)?;
    let mut first = None;
    let mut mixed = false;
    for obs in observations {
        let k = category_of(model, obs.fraction, &probe)?;
        match first {
            None => first = Some(k),
            Some(f) if f != k => mixed = true,
            _ => {}
        }
    }
    Ok(if mixed { observations.len() } else { 0 })
}

fn probe_parameters(boundaries: &[f64]) -> IrtResult<ItemParameters> {
    Ok(ItemParameters::polytomous(
        CategoryThresholds::from_fn(boundaries, |_| 0.0)?,
        1.0,
    ))
}

fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Start derived from observed proportions around the mean ability.
pub fn initial_parameters<M: ItemResponseModel + ?Sized>(
    model: &M,
    observations: &[Observation],
    boundaries: &[f64],
) -> IrtResult<ItemParameters> {
    let mut ip = model.default_parameters(boundaries)?;
    if observations.is_empty() {
        return Ok(ip);
    }
    let n = observations.len() as f64;
    let mean_ability = observations.iter().map(|o| o.ability).sum::<f64>() / n;

    if !model.is_polytomous() {
        let correct = observations
            .iter()
            .filter(|o| o.fraction >= 1.0)
            .count() as f64;
        let p = (correct / n).clamp(0.02, 0.98);
        ip.difficulty = mean_ability - logit(p);
        return Ok(ip);
    }

    let probe = probe_parameters(boundaries)?;
    let categories = observations
        .iter()
        .map(|o| polytomous_category(o.fraction, &probe))
        .collect::<IrtResult<Vec<_>>>()?;
    for j in 0..boundaries.len() {
        let reached = categories.iter().filter(|&&k| k > j).count() as f64;
        let p = (reached / n).clamp(0.02, 0.98);
        ip.categories.set_value(j, mean_ability - logit(p));
    }
    Ok(ip)
}

fn perturb<M: ItemResponseModel + ?Sized>(
    model: &M,
    ip: &ItemParameters,
    boundaries: &[f64],
    bounds: &TrustedRegionBounds,
    options: &EstimationOptions,
) -> IrtResult<ItemParameters> {
    let mut rng = Pcg64::seed_from_u64(options.seed);
    let noise = Normal::new(0.0, options.perturbation)
        .map_err(|e| IrtError::Config(format!("perturbation: {e}")))?;
    let layout = model.layout();
    let v: Vec<f64> = ip
        .to_vector(layout)
        .iter()
        .map(|x| x + rng.sample(noise))
        .collect();
    let perturbed = ItemParameters::from_vector(layout, boundaries, &v)?;
    Ok(model.trusted_region_project(&perturbed, bounds))
}
