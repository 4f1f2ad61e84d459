//! Log-likelihood of response data under calibrated items.

use std::collections::BTreeMap;

use ndarray::Array1;
use rayon::prelude::*;

use crate::error::IrtResult;
use crate::models::ItemResponseModel;
use crate::responses::{AbilitySnapshot, PersonId, ResponseMatrix};
use crate::scoring::{ItemBank, ScoredResponse};

/// Log-likelihood of one person's responses at each ability of `grid`.
pub fn log_likelihood_profile(
    responses: &[ScoredResponse<'_>],
    grid: &[f64],
) -> IrtResult<Array1<f64>> {
    let values = grid
        .iter()
        .map(|&ability| {
            responses.iter().try_fold(0.0, |acc, r| {
                Ok(acc + r.model.log_likelihood(ability, r.parameters, r.fraction)?)
            })
        })
        .collect::<IrtResult<Vec<f64>>>()?;
    Ok(Array1::from_vec(values))
}

/// Per-person log-likelihood at the snapshot abilities.
///
/// Persons without an ability and responses to items outside `bank` are
/// skipped.
pub fn person_log_likelihoods(
    matrix: &ResponseMatrix,
    bank: &ItemBank,
    abilities: &AbilitySnapshot,
) -> IrtResult<BTreeMap<PersonId, f64>> {
    let people: Vec<_> = matrix.by_person().into_iter().collect();
    people
        .par_iter()
        .filter_map(|(person, answers)| {
            abilities.get(person).map(|ability| (person, answers, ability))
        })
        .map(|(person, answers, ability)| {
            let mut ll = 0.0;
            for (item, fraction) in answers {
                if let Some(c) = bank.get(item.as_str()) {
                    ll += c.model.log_likelihood(ability, &c.parameters, *fraction)?;
                }
            }
            Ok(((*person).clone(), ll))
        })
        .collect()
}

/// Total log-likelihood of the matrix.
pub fn matrix_log_likelihood(
    matrix: &ResponseMatrix,
    bank: &ItemBank,
    abilities: &AbilitySnapshot,
) -> IrtResult<f64> {
    Ok(person_log_likelihoods(matrix, bank, abilities)?
        .values()
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelKind;
    use crate::params::ItemParameters;
    use crate::scoring::CalibratedItem;
    use approx::assert_relative_eq;

    #[test]
    fn profile_peaks_between_items_answered_differently() {
        let easy = ItemParameters::rasch(-1.0);
        let hard = ItemParameters::rasch(1.0);
        let responses = [
            ScoredResponse {
                model: ModelKind::Rasch,
                parameters: &easy,
                fraction: 1.0,
            },
            ScoredResponse {
                model: ModelKind::Rasch,
                parameters: &hard,
                fraction: 0.0,
            },
        ];
        let grid: Vec<f64> = (-20..=20).map(|i| i as f64 * 0.1).collect();
        let profile = log_likelihood_profile(&responses, &grid).unwrap();
        let best = profile
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| grid[i])
            .unwrap();
        assert_relative_eq!(best, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn matrix_total_sums_people() {
        let mut matrix = ResponseMatrix::new();
        matrix.insert("q", "a", 1.0).unwrap();
        matrix.insert("q", "b", 0.0).unwrap();
        matrix.insert("q", "c", 1.0).unwrap();
        let mut bank = ItemBank::new();
        bank.insert(
            "q".into(),
            CalibratedItem {
                model: ModelKind::Rasch,
                parameters: ItemParameters::rasch(0.0),
            },
        );
        let abilities: AbilitySnapshot =
            vec![("a".to_string(), 0.0), ("b".to_string(), 0.0)].into_iter().collect();
        let per_person = person_log_likelihoods(&matrix, &bank, &abilities).unwrap();
        assert_eq!(per_person.len(), 2);
        let total = matrix_log_likelihood(&matrix, &bank, &abilities).unwrap();
        assert_relative_eq!(total, 2.0 * 0.5f64.ln(), epsilon = 1e-12);
    }
}
