use approx::assert_relative_eq;
use rand::prelude::*;
use rand_pcg::Pcg64;

use super::*;
use crate::params::CategoryThresholds;

const STEP: f64 = 1e-5;

/// Random but well-conditioned parameters for `model`.
fn sample_parameters(model: ModelKind, rng: &mut Pcg64) -> ItemParameters {
    if model.is_polytomous() {
        let mut value = rng.random_range(-2.0..-1.0);
        let mut entries = Vec::new();
        for fraction in [0.25, 0.5, 0.75, 1.0] {
            entries.push((fraction, value));
            value += rng.random_range(0.3..1.2);
        }
        let categories = CategoryThresholds::new(entries).unwrap();
        return ItemParameters::polytomous(categories, rng.random_range(0.5..2.0));
    }
    ItemParameters::dichotomous(
        rng.random_range(-2.0..2.0),
        rng.random_range(0.5..2.5),
        rng.random_range(0.0..0.3),
    )
}

/// `(model, ability, parameters, fraction)` samples over every category.
fn samples(per_model: usize) -> Vec<(ModelKind, f64, ItemParameters, f64)> {
    let mut rng = Pcg64::seed_from_u64(2024);
    let mut out = Vec::new();
    for model in ModelKind::ALL {
        for _ in 0..per_model {
            let ip = sample_parameters(model, &mut rng);
            let ability = rng.random_range(-3.0..3.0);
            for frac in model.get_fractions(&ip) {
                out.push((model, ability, ip.clone(), frac));
            }
        }
    }
    out
}

fn shifted(model: ModelKind, ip: &ItemParameters, index: usize, delta: f64) -> ItemParameters {
    let layout = model.layout();
    let mut v = ip.to_vector(layout).to_vec();
    v[index] += delta;
    ItemParameters::from_vector(layout, &ip.categories.fractions(), &v).unwrap()
}

#[test]
fn category_likelihoods_sum_to_one() {
    for (model, ability, ip, _) in samples(20) {
        let total: f64 = model
            .get_fractions(&ip)
            .into_iter()
            .map(|f| model.likelihood(ability, &ip, f).unwrap())
            .sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }
}

#[test]
fn log_likelihood_matches_likelihood() {
    for (model, ability, ip, frac) in samples(10) {
        let l = model.likelihood(ability, &ip, frac).unwrap();
        let ll = model.log_likelihood(ability, &ip, frac).unwrap();
        assert_relative_eq!(ll, l.ln(), epsilon = 1e-9);
    }
}

#[test]
fn ability_derivatives_match_finite_differences() {
    for (model, ability, ip, frac) in samples(20) {
        let ll = |t: f64| model.log_likelihood(t, &ip, frac).unwrap();
        let numeric = (ll(ability + STEP) - ll(ability - STEP)) / (2.0 * STEP);
        let analytic = model.log_likelihood_ability(ability, &ip, frac).unwrap();
        assert!(
            (numeric - analytic).abs() < 1e-4,
            "{model} d/dability at {ability}: {analytic} vs {numeric}"
        );

        let d = |t: f64| model.log_likelihood_ability(t, &ip, frac).unwrap();
        let numeric = (d(ability + STEP) - d(ability - STEP)) / (2.0 * STEP);
        let analytic = model.log_likelihood_ability_ability(ability, &ip, frac).unwrap();
        assert!(
            (numeric - analytic).abs() < 1e-4,
            "{model} d2/dability2 at {ability}: {analytic} vs {numeric}"
        );
    }
}

#[test]
fn parameter_gradient_matches_finite_differences() {
    for (model, ability, ip, frac) in samples(15) {
        let gradient = model.gradient_ip(ability, &ip, frac).unwrap();
        assert_eq!(gradient.len(), model.dimension(&ip) - 1);
        for i in 0..gradient.len() {
            let up = model.log_likelihood(ability, &shifted(model, &ip, i, STEP), frac).unwrap();
            let down = model.log_likelihood(ability, &shifted(model, &ip, i, -STEP), frac).unwrap();
            let numeric = (up - down) / (2.0 * STEP);
            assert!(
                (numeric - gradient[i]).abs() < 1e-4,
                "{model} gradient[{i}]: {} vs {numeric}",
                gradient[i]
            );
        }
    }
}

#[test]
fn parameter_hessian_matches_gradient_differences() {
    for (model, ability, ip, frac) in samples(15) {
        let hessian = model.hessian_ip(ability, &ip, frac).unwrap();
        let n = hessian.nrows();
        for j in 0..n {
            let up = model.gradient_ip(ability, &shifted(model, &ip, j, STEP), frac).unwrap();
            let down = model.gradient_ip(ability, &shifted(model, &ip, j, -STEP), frac).unwrap();
            for i in 0..n {
                let numeric = (up[i] - down[i]) / (2.0 * STEP);
                assert!(
                    (numeric - hessian[[i, j]]).abs() < 1e-4 * (1.0 + numeric.abs()),
                    "{model} hessian[{i}, {j}]: {} vs {numeric}",
                    hessian[[i, j]]
                );
            }
        }
    }
}

#[test]
fn parameter_hessian_is_exactly_symmetric() {
    for (model, ability, ip, frac) in samples(20) {
        let h = model.hessian_ip(ability, &ip, frac).unwrap();
        assert_eq!(h, h.t());
    }
}

#[test]
fn fisher_information_is_non_negative() {
    let mut rng = Pcg64::seed_from_u64(7);
    for model in ModelKind::ALL {
        for _ in 0..50 {
            let ip = sample_parameters(model, &mut rng);
            let ability = rng.random_range(-8.0..8.0);
            assert!(model.fisher_information(ability, &ip).unwrap() >= 0.0);
        }
    }
}

#[test]
fn projection_is_idempotent() {
    let bounds = TrustedRegionBounds::default();
    let mut rng = Pcg64::seed_from_u64(99);
    for model in ModelKind::ALL {
        for _ in 0..50 {
            let mut ip = sample_parameters(model, &mut rng);
            ip.difficulty = rng.random_range(-20.0..20.0);
            ip.discrimination = rng.random_range(-1.0..20.0);
            ip.guessing = rng.random_range(-0.5..1.0);
            for i in 0..ip.categories.len() {
                ip.categories.set_value(i, rng.random_range(-10.0..10.0));
            }
            let once = model.trusted_region_project(&ip, &bounds);
            let twice = model.trusted_region_project(&once, &bounds);
            assert_eq!(once, twice, "{model}");
        }
    }
}

#[test]
fn vector_round_trip_for_every_model() {
    let mut rng = Pcg64::seed_from_u64(5);
    for model in ModelKind::ALL {
        let ip = sample_parameters(model, &mut rng).rounded(model.precision());
        let v = ip.to_vector(model.layout());
        let back =
            ItemParameters::from_vector(model.layout(), &ip.categories.fractions(), &v.to_vec())
                .unwrap();
        assert_eq!(back.to_vector(model.layout()), v);
    }
}

#[test]
fn rasch_ability_derivative_fixture() {
    let ip = ItemParameters::rasch(-2.5);
    let correct = Rasch.log_likelihood_ability(-3.0, &ip, 1.0).unwrap();
    let wrong = Rasch.log_likelihood_ability(-3.0, &ip, 0.0).unwrap();
    assert_relative_eq!(correct, 0.622459, epsilon = 1e-6);
    assert_relative_eq!(wrong, -0.377541, epsilon = 1e-6);
}

#[test]
fn birnbaum_ability_derivative_fixture() {
    let ip = ItemParameters::dichotomous(0.5, 2.5, 0.0);
    assert_relative_eq!(
        Birnbaum.log_likelihood_ability(0.5, &ip, 1.0).unwrap(),
        1.25,
        epsilon = 1e-12
    );
}

#[test]
fn guessing_sets_the_floor() {
    let ip = ItemParameters::dichotomous(0.0, 1.5, 0.2);
    let p = MixedRaschBirnbaum.likelihood(-30.0, &ip, 1.0).unwrap();
    assert_relative_eq!(p, 0.2, epsilon = 1e-9);
}

#[test]
fn boundary_fraction_belongs_to_its_own_category() {
    let fractions = [0.0, 0.5, 1.0];
    assert_eq!(get_category(0.5, &fractions).unwrap(), 1);
    assert_eq!(get_category(0.49, &fractions).unwrap(), 0);
    assert_eq!(get_category(1.0, &fractions).unwrap(), 2);
    assert_eq!(get_category(0.99, &DICHOTOMOUS_FRACTIONS).unwrap(), 0);
    assert!(matches!(
        get_category(1.5, &fractions),
        Err(IrtError::InvalidFraction(_))
    ));
}

#[test]
fn coinciding_thresholds_are_degenerate() {
    let cats = CategoryThresholds::new(vec![(0.5, 0.3), (1.0, 0.3)]).unwrap();
    let ip = ItemParameters::polytomous(cats, 1.0);
    let err = Grm.likelihood(0.0, &ip, 0.5).unwrap_err();
    assert!(err.is_recoverable());
}

#[test]
fn polytomous_model_requires_thresholds() {
    let ip = ItemParameters::rasch(0.0);
    assert!(matches!(
        Pcm.likelihood(0.0, &ip, 1.0),
        Err(IrtError::InvalidParameters(_))
    ));
    assert!(Grm.default_parameters(&[]).is_err());
}

#[test]
fn catalogue_names_and_dimensions() {
    assert_eq!("RaschBirnbaum".parse::<ModelKind>().unwrap(), ModelKind::RaschBirnbaum);
    assert_eq!(" pcm ".parse::<ModelKind>().unwrap(), ModelKind::Pcm);
    assert!(matches!(
        "irt4".parse::<ModelKind>(),
        Err(IrtError::UnknownModel(_))
    ));

    let dichotomous = ItemParameters::default();
    assert_eq!(ModelKind::Rasch.dimension(&dichotomous), 2);
    assert_eq!(ModelKind::MixedRaschBirnbaum.dimension(&dichotomous), 4);
    assert_eq!(
        ModelKind::MixedRaschBirnbaum.parameter_names(),
        vec!["difficulty", "discrimination", "guessing"]
    );

    let ip = ModelKind::GrmGeneralized
        .default_parameters(&[1.0 / 3.0, 2.0 / 3.0, 1.0])
        .unwrap();
    assert_eq!(ModelKind::GrmGeneralized.dimension(&ip), 5);
    assert_eq!(ModelKind::GrmGeneralized.get_fractions(&ip).len(), 4);
    for kind in ModelKind::ALL {
        assert_eq!(kind.to_string().parse::<ModelKind>().unwrap(), kind);
    }
}
