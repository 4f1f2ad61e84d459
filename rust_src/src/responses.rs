//! Response data: the sparse item × person matrix and ability snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{IrtError, IrtResult};

pub type ItemId = String;
pub type PersonId = String;

/// One observed outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub person: PersonId,
    pub item: ItemId,
    /// `0`/`1` for dichotomous items, a normalised category for polytomous ones.
    pub fraction: f64,
}

impl Response {
    pub fn new(person: impl Into<PersonId>, item: impl Into<ItemId>, fraction: f64) -> Self {
        Self {
            person: person.into(),
            item: item.into(),
            fraction,
        }
    }
}

/// A response joined with the respondent's current ability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub ability: f64,
    pub fraction: f64,
}

/// What [`ResponseMatrix::prune`] removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    pub removed_items: Vec<ItemId>,
    pub removed_persons: Vec<PersonId>,
    /// Number of passes until no uniform row was left.
    pub passes: usize,
}

/// Sparse responses keyed by item, then person.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMatrix {
    items: BTreeMap<ItemId, BTreeMap<PersonId, f64>>,
}

fn is_uniform<'a>(fractions: impl Iterator<Item = &'a f64>) -> bool {
    let mut all_low = true;
    let mut all_high = true;
    let mut any = false;
    for &f in fractions {
        any = true;
        all_low &= f == 0.0;
        all_high &= f == 1.0;
    }
    any && (all_low || all_high)
}

impl ResponseMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_responses(responses: impl IntoIterator<Item = Response>) -> IrtResult<Self> {
        let mut matrix = Self::new();
        for r in responses {
            matrix.insert(r.item, r.person, r.fraction)?;
        }
        Ok(matrix)
    }

    /// Records an outcome; a later response to the same pair replaces the earlier one.
    pub fn insert(
        &mut self,
        item: impl Into<ItemId>,
        person: impl Into<PersonId>,
        fraction: f64,
    ) -> IrtResult<()> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(IrtError::InvalidFraction(fraction));
        }
        self.items
            .entry(item.into())
            .or_default()
            .insert(person.into(), fraction);
        Ok(())
    }

    pub fn get(&self, item: &str, person: &str) -> Option<f64> {
        self.items.get(item).and_then(|row| row.get(person)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn response_count(&self) -> usize {
        self.items.values().map(BTreeMap::len).sum()
    }

    pub fn item_ids(&self) -> impl Iterator<Item = &ItemId> {
        self.items.keys()
    }

    pub fn person_ids(&self) -> BTreeSet<&PersonId> {
        self.items.values().flat_map(|row| row.keys()).collect()
    }

    /// All responses to one item.
    pub fn item_responses(&self, item: &str) -> Option<&BTreeMap<PersonId, f64>> {
        self.items.get(item)
    }

    /// All responses of one person, keyed by item.
    pub fn person_responses(&self, person: &str) -> BTreeMap<&ItemId, f64> {
        self.items
            .iter()
            .filter_map(|(item, row)| row.get(person).map(|&f| (item, f)))
            .collect()
    }

    /// Responses grouped by person, built in a single pass.
    pub fn by_person(&self) -> BTreeMap<&PersonId, Vec<(&ItemId, f64)>> {
        let mut out: BTreeMap<&PersonId, Vec<(&ItemId, f64)>> = BTreeMap::new();
        for (item, row) in &self.items {
            for (person, &f) in row {
                out.entry(person).or_default().push((item, f));
            }
        }
        out
    }

    /// Distinct non-zero outcome fractions seen for an item, ascending.
    pub fn fractions_for_item(&self, item: &str) -> Vec<f64> {
        let mut fractions: Vec<f64> = self
            .items
            .get(item)
            .map(|row| row.values().copied().filter(|&f| f > 0.0).collect())
            .unwrap_or_default();
        fractions.sort_by(f64::total_cmp);
        fractions.dedup();
        fractions
    }

    /// Joins an item's responses with a snapshot; respondents without an
    /// ability in the snapshot are skipped.
    pub fn observations(&self, item: &str, abilities: &AbilitySnapshot) -> Vec<Observation> {
        self.items
            .get(item)
            .map(|row| {
                row.iter()
                    .filter_map(|(person, &fraction)| {
                        abilities.get(person).map(|ability| Observation { ability, fraction })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes items and persons whose responses are all 0 or all 1,
    /// repeating until none are left.
    pub fn prune(&mut self) -> PruneReport {
        let mut report = PruneReport::default();
        loop {
            report.passes += 1;
            let uniform_items: Vec<ItemId> = self
                .items
                .iter()
                .filter(|(_, row)| is_uniform(row.values()))
                .map(|(item, _)| item.clone())
                .collect();
            for item in &uniform_items {
                self.items.remove(item);
            }

            let uniform_persons: Vec<PersonId> = self
                .by_person()
                .into_iter()
                .filter(|(_, answers)| is_uniform(answers.iter().map(|(_, f)| f)))
                .map(|(person, _)| person.clone())
                .collect();
            for person in &uniform_persons {
                for row in self.items.values_mut() {
                    row.remove(person);
                }
            }
            let emptied: Vec<ItemId> = self
                .items
                .iter()
                .filter(|(_, row)| row.is_empty())
                .map(|(item, _)| item.clone())
                .collect();
            for item in &emptied {
                self.items.remove(item);
            }

            let changed = !uniform_items.is_empty() || !uniform_persons.is_empty();
            report.removed_items.extend(uniform_items);
            report.removed_items.extend(emptied);
            report.removed_persons.extend(uniform_persons);
            if !changed {
                break;
            }
        }
        log::info!(
            "pruned {} items and {} persons in {} passes",
            report.removed_items.len(),
            report.removed_persons.len(),
            report.passes
        );
        report
    }
}

/// Immutable person → ability map read by a whole estimation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbilitySnapshot {
    abilities: HashMap<PersonId, f64>,
}

impl AbilitySnapshot {
    pub fn new(abilities: HashMap<PersonId, f64>) -> Self {
        Self { abilities }
    }

    pub fn get(&self, person: &str) -> Option<f64> {
        self.abilities.get(person).copied()
    }

    pub fn len(&self) -> usize {
        self.abilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.abilities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PersonId, f64)> {
        self.abilities.iter().map(|(p, &a)| (p, a))
    }

    /// Mean of the known abilities, `0.0` when there are none.
    pub fn mean(&self) -> f64 {
        if self.abilities.is_empty() {
            return 0.0;
        }
        self.abilities.values().sum::<f64>() / self.abilities.len() as f64
    }

    /// Starting abilities from raw scores: the logit of each person's mean
    /// outcome, clamped away from 0 and 1.
    pub fn initial_from_raw_scores(matrix: &ResponseMatrix) -> Self {
        let abilities = matrix
            .by_person()
            .into_iter()
            .map(|(person, answers)| {
                let mean = answers.iter().map(|(_, f)| f).sum::<f64>() / answers.len() as f64;
                let p = mean.clamp(0.01, 0.99);
                (person.clone(), (p / (1.0 - p)).ln())
            })
            .collect();
        Self { abilities }
    }
}

impl FromIterator<(PersonId, f64)> for AbilitySnapshot {
    fn from_iter<T: IntoIterator<Item = (PersonId, f64)>>(iter: T) -> Self {
        Self {
            abilities: iter.into_iter().collect(),
        }
    }
}
