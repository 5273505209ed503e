/// End-to-end tests for the twin pipeline
///
/// Run with: cargo test -p twin_core --test pipeline_tests -- --nocapture

use serde_json::json;
use twin_core::config::{ForestParams, SurrogateConfig, SyntheticConfig, TrainingConfig};
use twin_core::engine::surrogate::SurrogateLauncher;
use twin_core::telemetry::round2;
use twin_core::{
    build_dataset, CongestionBand, CsvFileSink, Predictor, SimulationDriver, SplitPolicy, StopReason,
    SyntheticGenerator, TelemetryTable, Trainer, TwinConfig, TwinError, WindowSpec,
};

#[test]
fn test_synthetic_corpus_to_served_prediction() {
    println!("\n=== Test: Synthetic Corpus To Served Prediction ===");
    let dir = tempfile::tempdir().unwrap();
    let corpus = dir.path().join("raw/synthetic.csv");
    let model_path = dir.path().join("models/model.bin");
    let meta_path = dir.path().join("models/model.meta.json");

    let (table, profiles) = SyntheticGenerator::new(SyntheticConfig {
        days: 5,
        steps_per_day: 900,
        base_peak: 450,
        peak_jitter: 40,
        base_width: 120,
        width_jitter: 10,
        ..SyntheticConfig::default()
    })
    .unwrap()
    .generate();
    table.save(&corpus).unwrap();
    println!("✓ Wrote {} rows for {} days", table.len(), profiles.len());

    let reloaded = TelemetryTable::load(&corpus).unwrap();
    assert_eq!(reloaded, table, "CSV round trip must be exact");

    let window = WindowSpec {
        horizon: 60,
        lags: vec![10, 30],
    };
    let dataset = build_dataset(&reloaded, &window).unwrap();
    assert_eq!(dataset.len(), 5 * (900 - 30 - 60));

    let run = Trainer::new(TrainingConfig {
        split: SplitPolicy::ByDay { last_train_day: 4 },
        forest: ForestParams {
            n_trees: 12,
            max_depth: Some(10),
            ..ForestParams::default()
        },
    })
    .train(&dataset)
    .unwrap();
    println!(
        "✓ Trained: MSE={:.2} R2={:.4}",
        run.model.report.mse, run.model.report.r2
    );
    assert!(run.model.report.r2 > 0.3);
    run.model.save(&model_path, &meta_path).unwrap();

    let predictor = Predictor::load(&model_path, &meta_path, Default::default()).unwrap();
    assert_eq!(
        predictor.schema().names(),
        vec!["step", "vehicle_count", "avg_speed", "lag_10", "lag_30"]
    );

    let quiet = predictor
        .predict_value(&json!({
            "step": 30, "vehicle_count": 0, "avg_speed": 15.0, "lag_10": 0, "lag_30": 0
        }))
        .unwrap();
    println!("  Quiet hour -> {} ({})", quiet.predicted_count, quiet.band);
    assert_eq!(quiet.band, CongestionBand::FreeFlow);

    let rush = predictor
        .predict_value(&json!({
            "step": 400, "vehicle_count": 170, "avg_speed": 3.5, "lag_10": 168, "lag_30": 160
        }))
        .unwrap();
    println!("  Rush hour  -> {} ({})", rush.predicted_count, rush.band);
    assert!(rush.predicted_count > quiet.predicted_count);

    let err = predictor
        .predict_value(&json!({
            "step": 400, "vehicle_count": 170, "avg_speed": 3.5, "lag_60": 168, "lag_300": 160
        }))
        .unwrap_err();
    assert!(matches!(err, TwinError::SchemaMismatch(_)));

    println!("✓ All assertions passed");
}

#[test]
fn test_simulated_run_writes_loadable_telemetry() {
    println!("\n=== Test: Simulated Run Writes Loadable Telemetry ===");
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("raw/traffic_log.csv");

    let mut cfg = TwinConfig::default();
    cfg.harvest.wall_clock = false;
    cfg.simulation.engine.surrogate = SurrogateConfig {
        intersections: 2,
        demand_steps: 400,
        demand_peak: 200.0,
        demand_width: 80.0,
        peak_arrivals: 1.0,
        trip_steps: (40, 120),
        ..SurrogateConfig::default()
    };

    let driver = SimulationDriver::new(SurrogateLauncher, &cfg);
    let mut sink = CsvFileSink::new(&out);
    let report = driver.run(300, || false, &mut sink).unwrap();
    println!(
        "✓ Ran {} steps ({:?}), {} extensions",
        report.steps, report.stop, report.policy.extensions
    );
    assert_eq!(report.stop, StopReason::StepLimit);

    let table = TelemetryTable::load(&out).unwrap();
    assert_eq!(table.len(), 300);
    for (i, r) in table.records.iter().enumerate() {
        assert_eq!(r.step, i as u64);
        assert_eq!(r.avg_speed, round2(r.avg_speed));
        if r.vehicle_count == 0 {
            assert_eq!(r.avg_speed, 0.0);
        }
    }
    assert!(table.records.iter().any(|r| r.vehicle_count > 0));

    println!("✓ All assertions passed");
}

#[test]
fn test_interrupted_run_keeps_partial_output() {
    println!("\n=== Test: Interrupted Run Keeps Partial Output ===");
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("partial.csv");

    let mut cfg = TwinConfig::default();
    cfg.harvest.wall_clock = false;
    let driver = SimulationDriver::new(SurrogateLauncher, &cfg);
    let interrupt = twin_core::Interrupt::new();
    let flag = interrupt.clone();
    let mut polled = 0u32;
    let mut sink = CsvFileSink::new(&out);
    let report = driver
        .run(
            3600,
            || {
                polled += 1;
                if polled == 42 {
                    flag.raise();
                }
                interrupt.is_raised()
            },
            &mut sink,
        )
        .unwrap();

    assert_eq!(report.stop, StopReason::Interrupted);
    assert_eq!(TelemetryTable::load(&out).unwrap().len() as u64, report.steps);
    assert_eq!(report.steps, 41);
    println!("✓ All assertions passed");
}
