use std::sync::atomic::AtomicBool;

use catirt::models::ModelKind;
use catirt::{CatConfig, IrtError, ItemParameters, ItemResponseModel, ResponseMatrix, calibrate};
use rand::prelude::*;
use rand_distr::Normal;
use rand_pcg::Pcg64;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
    let va: f64 = a.iter().map(|x| (x - ma).powi(2)).sum();
    let vb: f64 = b.iter().map(|y| (y - mb).powi(2)).sum();
    cov / (va * vb).sqrt()
}

struct Simulated {
    matrix: ResponseMatrix,
    difficulties: Vec<f64>,
    abilities: Vec<f64>,
}

fn simulate(n_items: usize, n_persons: usize, seed: u64) -> Simulated {
    let mut rng = Pcg64::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let difficulties: Vec<f64> = (0..n_items)
        .map(|i| -2.0 + 4.0 * i as f64 / (n_items - 1) as f64)
        .collect();
    let abilities: Vec<f64> = (0..n_persons).map(|_| rng.sample(normal)).collect();
    let mut matrix = ResponseMatrix::new();
    for (j, &b) in difficulties.iter().enumerate() {
        let ip = ItemParameters::rasch(b);
        for (i, &theta) in abilities.iter().enumerate() {
            let p = ModelKind::Rasch.likelihood(theta, &ip, 1.0).unwrap();
            let outcome = if rng.random::<f64>() < p { 1.0 } else { 0.0 };
            matrix
                .insert(format!("item{j:02}"), format!("person{i:03}"), outcome)
                .unwrap();
        }
    }
    Simulated {
        matrix,
        difficulties,
        abilities,
    }
}

fn rasch_config() -> CatConfig {
    CatConfig::from_toml_str(
        r#"
        [calibration]
        rounds = 3
        models = ["rasch"]
        "#,
    )
    .unwrap()
}

#[test]
fn joint_calibration_recovers_item_and_person_order() {
    init_logging();
    let sim = simulate(25, 400, 17);
    let cancel = AtomicBool::new(false);
    let report = calibrate(&sim.matrix, &rasch_config(), &cancel).unwrap();

    assert_eq!(report.rounds, 3);
    assert!(report.log_likelihood.is_finite() && report.log_likelihood < 0.0);
    assert_eq!(report.item_failures, 0);

    let mut est_b = Vec::new();
    let mut true_b = Vec::new();
    for (j, b) in sim.difficulties.iter().enumerate() {
        if let Some(item) = report.items.get(&format!("item{j:02}")) {
            assert_eq!(item.model, ModelKind::Rasch);
            est_b.push(item.parameters.difficulty);
            true_b.push(*b);
        }
    }
    assert!(est_b.len() >= 20);
    assert!(correlation(&est_b, &true_b) > 0.95);

    let mut est_theta = Vec::new();
    let mut true_theta = Vec::new();
    for (i, theta) in sim.abilities.iter().enumerate() {
        if let Some(est) = report.abilities.get(&format!("person{i:03}")) {
            est_theta.push(est.ability);
            true_theta.push(*theta);
        }
    }
    assert!(correlation(&est_theta, &true_theta) > 0.8);

    for person in &report.pruned.removed_persons {
        assert!(!report.abilities.contains_key(person));
    }
}

#[test]
fn calibrated_items_serialize_to_records() {
    let sim = simulate(10, 150, 3);
    let cancel = AtomicBool::new(false);
    let report = calibrate(&sim.matrix, &rasch_config(), &cancel).unwrap();
    let records = report.records().unwrap();
    assert_eq!(records.len(), report.items.len());
    for (item, record) in &records {
        assert_eq!(record.model, "rasch");
        assert!(record.json.is_none());
        let (model, back) = ItemParameters::from_record(record).unwrap();
        assert_eq!(model, ModelKind::Rasch);
        assert_eq!(back, report.items[item].parameters);
    }
}

#[test]
fn cancelled_calibration_stops() {
    let sim = simulate(5, 50, 9);
    let cancel = AtomicBool::new(true);
    assert!(matches!(
        calibrate(&sim.matrix, &rasch_config(), &cancel),
        Err(IrtError::Cancelled)
    ));
}

#[test]
fn model_choice_prefers_lower_aic() {
    init_logging();
    let sim = simulate(12, 300, 21);
    let config = CatConfig::from_toml_str(
        r#"
        [calibration]
        rounds = 2
        models = ["rasch", "raschbirnbaum"]
        "#,
    )
    .unwrap();
    let cancel = AtomicBool::new(false);
    let report = calibrate(&sim.matrix, &config, &cancel).unwrap();
    assert!(!report.items.is_empty());
    for item in report.items.values() {
        assert!(matches!(item.model, ModelKind::Rasch | ModelKind::RaschBirnbaum));
    }
}
