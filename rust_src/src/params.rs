//! Item parameters, category maps, and their vector/record forms.

use std::collections::BTreeMap;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{IrtError, IrtResult};
use crate::models::{ItemResponseModel, ModelKind};
use crate::utils::round_to;

/// One named slot in a model's parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    Difficulty,
    Discrimination,
    Guessing,
    /// Per-boundary thresholds of a graded-response model.
    Difficulties,
    /// Per-boundary step intercepts of a partial-credit model.
    Intercepts,
}

impl ParameterKind {
    pub fn name(self) -> &'static str {
        match self {
            ParameterKind::Difficulty => "difficulty",
            ParameterKind::Discrimination => "discrimination",
            ParameterKind::Guessing => "guessing",
            ParameterKind::Difficulties => "difficulties",
            ParameterKind::Intercepts => "intercepts",
        }
    }

    pub fn is_categorical(self) -> bool {
        matches!(self, ParameterKind::Difficulties | ParameterKind::Intercepts)
    }
}

/// Ordered map from category-boundary fraction to a threshold value.
///
/// Keys are strictly increasing in `(0, 1]`; boundary `0` is implicit and
/// never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, f64>",
    into = "BTreeMap<String, f64>"
)]
pub struct CategoryThresholds {
    entries: Vec<(f64, f64)>,
}

impl CategoryThresholds {
    pub fn new(entries: Vec<(f64, f64)>) -> IrtResult<Self> {
        let mut prev = 0.0;
        for &(fraction, value) in &entries {
            if !(fraction > prev && fraction <= 1.0) {
                return Err(IrtError::InvalidParameters(format!(
                    "category boundary {fraction} must be in (0, 1] and follow {prev}"
                )));
            }
            if !value.is_finite() {
                return Err(IrtError::InvalidParameters(format!(
                    "threshold for boundary {fraction} is not finite"
                )));
            }
            prev = fraction;
        }
        Ok(Self { entries })
    }

    /// Builds a map over `fractions` with every threshold set by `f(index)`.
    pub fn from_fn(fractions: &[f64], f: impl Fn(usize) -> f64) -> IrtResult<Self> {
        Self::new(
            fractions
                .iter()
                .enumerate()
                .map(|(i, &frac)| (frac, f(i)))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.entries.iter().copied()
    }

    pub fn fractions(&self) -> Vec<f64> {
        self.entries.iter().map(|&(f, _)| f).collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.entries.iter().map(|&(_, v)| v).collect()
    }

    /// Threshold of the `index`-th boundary (0-based).
    pub fn value(&self, index: usize) -> f64 {
        self.entries[index].1
    }

    pub fn set_value(&mut self, index: usize, value: f64) {
        self.entries[index].1 = value;
    }
}

impl TryFrom<BTreeMap<String, f64>> for CategoryThresholds {
    type Error = IrtError;

    fn try_from(map: BTreeMap<String, f64>) -> IrtResult<Self> {
        let mut entries = map
            .into_iter()
            .map(|(key, value)| {
                key.trim()
                    .parse::<f64>()
                    .map(|frac| (frac, value))
                    .map_err(|_| IrtError::InvalidParameters(format!("bad boundary key {key:?}")))
            })
            .collect::<IrtResult<Vec<_>>>()?;
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self::new(entries)
    }
}

impl From<CategoryThresholds> for BTreeMap<String, f64> {
    fn from(thresholds: CategoryThresholds) -> Self {
        thresholds
            .entries
            .into_iter()
            .map(|(frac, value)| (frac.to_string(), value))
            .collect()
    }
}

fn default_discrimination() -> f64 {
    1.0
}

/// Parameters of a single item.
///
/// Which fields are meaningful depends on the model; unused scalars keep
/// their neutral values (`discrimination = 1`, `guessing = 0`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemParameters {
    #[serde(default)]
    pub difficulty: f64,
    #[serde(default = "default_discrimination")]
    pub discrimination: f64,
    #[serde(default)]
    pub guessing: f64,
    #[serde(default, skip_serializing_if = "CategoryThresholds::is_empty")]
    pub categories: CategoryThresholds,
}

impl Default for ItemParameters {
    fn default() -> Self {
        Self {
            difficulty: 0.0,
            discrimination: 1.0,
            guessing: 0.0,
            categories: CategoryThresholds::default(),
        }
    }
}

impl ItemParameters {
    pub fn rasch(difficulty: f64) -> Self {
        Self {
            difficulty,
            ..Self::default()
        }
    }

    pub fn dichotomous(difficulty: f64, discrimination: f64, guessing: f64) -> Self {
        Self {
            difficulty,
            discrimination,
            guessing,
            categories: CategoryThresholds::default(),
        }
    }

    pub fn polytomous(categories: CategoryThresholds, discrimination: f64) -> Self {
        Self {
            discrimination,
            categories,
            ..Self::default()
        }
    }

    /// Packs the parameters named by `layout` into a flat vector.
    pub fn to_vector(&self, layout: &[ParameterKind]) -> Array1<f64> {
        let mut out = Vec::with_capacity(layout.len() + self.categories.len());
        for kind in layout {
            match kind {
                ParameterKind::Difficulty => out.push(self.difficulty),
                ParameterKind::Discrimination => out.push(self.discrimination),
                ParameterKind::Guessing => out.push(self.guessing),
                ParameterKind::Difficulties | ParameterKind::Intercepts => {
                    out.extend(self.categories.iter().map(|(_, v)| v))
                }
            }
        }
        Array1::from_vec(out)
    }

    /// Inverse of [`ItemParameters::to_vector`]; `fractions` gives the
    /// category boundaries for categorical slots.
    pub fn from_vector(
        layout: &[ParameterKind],
        fractions: &[f64],
        vector: &[f64],
    ) -> IrtResult<Self> {
        let expected = vector_len(layout, fractions.len());
        if vector.len() != expected {
            return Err(IrtError::InvalidParameters(format!(
                "expected {expected} values, got {}",
                vector.len()
            )));
        }
        let mut ip = Self::default();
        let mut pos = 0;
        for kind in layout {
            match kind {
                ParameterKind::Difficulty => ip.difficulty = vector[pos],
                ParameterKind::Discrimination => ip.discrimination = vector[pos],
                ParameterKind::Guessing => ip.guessing = vector[pos],
                ParameterKind::Difficulties | ParameterKind::Intercepts => {
                    let values = &vector[pos..pos + fractions.len()];
                    ip.categories = CategoryThresholds::from_fn(fractions, |i| values[i])?;
                    pos += fractions.len();
                    continue;
                }
            }
            pos += 1;
        }
        Ok(ip)
    }

    /// Copy with every value rounded to `decimals` places.
    pub fn rounded(&self, decimals: i32) -> Self {
        let mut categories = self.categories.clone();
        for i in 0..categories.len() {
            categories.set_value(i, round_to(categories.value(i), decimals));
        }
        Self {
            difficulty: round_to(self.difficulty, decimals),
            discrimination: round_to(self.discrimination, decimals),
            guessing: round_to(self.guessing, decimals),
            categories,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.difficulty.is_finite()
            && self.discrimination.is_finite()
            && self.guessing.is_finite()
            && self.categories.iter().all(|(_, v)| v.is_finite())
    }

    /// Flattens into the storage record shape.
    pub fn to_record(&self, model: ModelKind) -> IrtResult<ItemParamRecord> {
        let json = if self.categories.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&self.categories)?)
        };
        Ok(ItemParamRecord {
            model: model.name().to_string(),
            difficulty: self.difficulty,
            discrimination: self.discrimination,
            guessing: self.guessing,
            json,
        })
    }

    pub fn from_record(record: &ItemParamRecord) -> IrtResult<(ModelKind, Self)> {
        let model: ModelKind = record.model.parse()?;
        let categories = match &record.json {
            Some(blob) => serde_json::from_str(blob)?,
            None => CategoryThresholds::default(),
        };
        if model.is_polytomous() && categories.is_empty() {
            return Err(IrtError::InvalidParameters(format!(
                "{model} record has no category thresholds"
            )));
        }
        Ok((
            model,
            Self {
                difficulty: record.difficulty,
                discrimination: record.discrimination,
                guessing: record.guessing,
                categories,
            },
        ))
    }
}

/// Number of scalar slots `layout` occupies with `n_boundaries` categories.
pub fn vector_len(layout: &[ParameterKind], n_boundaries: usize) -> usize {
    layout
        .iter()
        .map(|k| if k.is_categorical() { n_boundaries } else { 1 })
        .sum()
}

/// Flat storage shape of an item's parameters for one context version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemParamRecord {
    pub model: String,
    pub difficulty: f64,
    pub discrimination: f64,
    pub guessing: f64,
    /// Category thresholds as a JSON object keyed by boundary fraction.
    pub json: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn three_step() -> CategoryThresholds {
        CategoryThresholds::new(vec![(1.0 / 3.0, -1.0), (2.0 / 3.0, 0.2), (1.0, 1.4)]).unwrap()
    }

    #[test]
    fn thresholds_reject_unordered_boundaries() {
        assert!(CategoryThresholds::new(vec![(0.5, 0.0), (0.5, 1.0)]).is_err());
        assert!(CategoryThresholds::new(vec![(0.0, 0.0)]).is_err());
        assert!(CategoryThresholds::new(vec![(1.2, 0.0)]).is_err());
        assert!(CategoryThresholds::new(vec![(0.5, f64::NAN)]).is_err());
    }

    #[test]
    fn vector_round_trip_for_polytomous_layout() {
        let ip = ItemParameters::polytomous(three_step(), 1.7);
        let layout = [ParameterKind::Difficulties, ParameterKind::Discrimination];
        let v = ip.to_vector(&layout);
        assert_eq!(v.to_vec(), vec![-1.0, 0.2, 1.4, 1.7]);
        let back =
            ItemParameters::from_vector(&layout, &ip.categories.fractions(), v.as_slice().unwrap())
                .unwrap();
        assert_eq!(back, ip);
    }

    #[test]
    fn from_vector_checks_length() {
        let layout = [ParameterKind::Difficulty, ParameterKind::Discrimination];
        assert!(ItemParameters::from_vector(&layout, &[], &[0.1]).is_err());
    }

    #[test]
    fn record_round_trip_keeps_category_map() {
        let ip = ItemParameters::polytomous(three_step(), 0.9);
        let record = ip.to_record(ModelKind::GrmGeneralized).unwrap();
        assert_eq!(record.model, "grmgeneralized");
        let (model, back) = ItemParameters::from_record(&record).unwrap();
        assert_eq!(model, ModelKind::GrmGeneralized);
        assert_eq!(back.categories.len(), 3);
        for ((fa, va), (fb, vb)) in back.categories.iter().zip(ip.categories.iter()) {
            assert_relative_eq!(fa, fb, epsilon = 1e-15);
            assert_relative_eq!(va, vb, epsilon = 1e-15);
        }
    }

    #[test]
    fn polytomous_record_without_json_is_rejected() {
        let record = ItemParamRecord {
            model: "pcm".into(),
            difficulty: 0.0,
            discrimination: 1.0,
            guessing: 0.0,
            json: None,
        };
        assert!(ItemParameters::from_record(&record).is_err());
    }

    #[test]
    fn rounding_applies_to_categories() {
        let cats = CategoryThresholds::new(vec![(1.0, 0.123_456)]).unwrap();
        let ip = ItemParameters::polytomous(cats, 1.000_04).rounded(4);
        assert_eq!(ip.categories.value(0), 0.1235);
        assert_eq!(ip.discrimination, 1.0);
    }
}
