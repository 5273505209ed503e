use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::{info, warn};

use twin_core::engine::surrogate::SurrogateLauncher;
use twin_core::trainer::write_predictions;
use twin_core::{
    build_dataset, CsvFileSink, Interrupt, Predictor, SimulationDriver, StopReason, SyntheticGenerator,
    TelemetryTable, Trainer, TwinConfig,
};

pub async fn simulate(
    mut cfg: TwinConfig,
    max_steps: Option<u64>,
    out: Option<PathBuf>,
    day: Option<u32>,
) -> Result<()> {
    if day.is_some() {
        cfg.harvest.day = day;
    }
    let max_steps = max_steps.unwrap_or(cfg.simulation.max_steps);
    let out = out.unwrap_or_else(|| cfg.paths.telemetry.clone());

    let interrupt = Interrupt::new();
    let flag = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next step boundary");
            flag.raise();
        }
    });

    info!("starting simulation: up to {} steps, telemetry -> {}", max_steps, out.display());
    let report = tokio::task::spawn_blocking(move || {
        let driver = SimulationDriver::new(SurrogateLauncher, &cfg);
        let mut sink = CsvFileSink::new(out);
        driver.run(max_steps, || interrupt.is_raised(), &mut sink)
    })
    .await
    .context("simulation task panicked")?
    .context("simulation failed")?;

    match &report.stop {
        StopReason::StepFailed { .. } => {
            if let Some(e) = report.failure() {
                warn!("run ended early: {}", e);
            }
        }
        StopReason::Interrupted => warn!("run interrupted; partial telemetry was saved"),
        other => info!("run finished: {:?}", other),
    }
    info!(
        "{} steps, {} records, {} extensions ({} capped of {} evaluations)",
        report.steps,
        report.records,
        report.policy.extensions,
        report.policy.capped,
        report.policy.evaluations
    );
    Ok(())
}

pub fn synth(mut cfg: TwinConfig, days: Option<u32>, seed: Option<u64>, out: Option<PathBuf>) -> Result<()> {
    if let Some(d) = days {
        cfg.synthetic.days = d;
    }
    if let Some(s) = seed {
        cfg.synthetic.seed = s;
    }
    let out = out.unwrap_or_else(|| cfg.paths.synthetic.clone());

    let (table, profiles) = SyntheticGenerator::new(cfg.synthetic.clone())?.generate();
    for p in &profiles {
        info!(
            "day {:>3}: peak {} width {} amplitude {}",
            p.day, p.peak, p.width, p.amplitude
        );
    }
    table
        .save(&out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    info!("saved {} rows to {}", table.len(), out.display());
    Ok(())
}

pub fn train(cfg: TwinConfig, input: Option<PathBuf>, predictions: Option<PathBuf>) -> Result<()> {
    let input = input.unwrap_or_else(|| cfg.paths.synthetic.clone());
    let table = TelemetryTable::load(&input)
        .with_context(|| format!("failed to load telemetry {}", input.display()))?;
    if table.is_empty() {
        bail!("{} has no telemetry rows", input.display());
    }
    info!("loaded {} telemetry rows from {}", table.len(), input.display());

    let dataset = build_dataset(&table, &cfg.features)?;
    let run = Trainer::new(cfg.training.clone()).train(&dataset)?;
    run.model
        .save(&cfg.paths.model, &cfg.paths.meta)
        .context("failed to persist model")?;

    if let Some(path) = predictions {
        write_predictions(&path, &run.predictions)?;
    }

    println!("{}", serde_json::to_string_pretty(&run.model.report)?);
    Ok(())
}

pub fn predict(cfg: TwinConfig, record: &str) -> Result<()> {
    let predictor = Predictor::load(&cfg.paths.model, &cfg.paths.meta, cfg.bands).with_context(|| {
        format!(
            "no usable model at {}; run `twin train` first",
            cfg.paths.model.display()
        )
    })?;
    let value: serde_json::Value = serde_json::from_str(record).context("record is not valid JSON")?;
    let result = predictor.predict_value(&value)?;
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use twin_core::config::ForestParams;
    use twin_core::TrainedModel;

    fn small_config(dir: &std::path::Path) -> TwinConfig {
        let mut cfg = TwinConfig::default();
        cfg.synthetic.days = 3;
        cfg.synthetic.steps_per_day = 600;
        cfg.synthetic.base_peak = 300;
        cfg.synthetic.peak_jitter = 30;
        cfg.synthetic.base_width = 90;
        cfg.synthetic.width_jitter = 10;
        cfg.features.horizon = 30;
        cfg.features.lags = vec![10, 20];
        cfg.training.forest = ForestParams {
            n_trees: 6,
            max_depth: Some(8),
            ..ForestParams::default()
        };
        cfg.harvest.wall_clock = false;
        cfg.paths.telemetry = dir.join("raw/traffic_log.csv");
        cfg.paths.synthetic = dir.join("raw/synthetic.csv");
        cfg.paths.model = dir.join("models/model.bin");
        cfg.paths.meta = dir.join("models/model.meta.json");
        cfg
    }

    #[test]
    fn test_synth_train_predict() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = small_config(dir.path());

        synth(cfg.clone(), None, Some(11), None).unwrap();
        assert_eq!(TelemetryTable::load(&cfg.paths.synthetic).unwrap().len(), 1800);

        let preds = dir.path().join("preds.csv");
        train(cfg.clone(), None, Some(preds.clone())).unwrap();
        assert!(preds.exists());
        let model = TrainedModel::load(&cfg.paths.model, &cfg.paths.meta).unwrap();
        assert_eq!(model.schema.lags, vec![10, 20]);

        predict(
            cfg.clone(),
            r#"{"step": 250, "vehicle_count": 150, "avg_speed": 4.2, "lag_10": 140, "lag_20": 130}"#,
        )
        .unwrap();
        assert!(predict(cfg, r#"{"step": 250}"#).is_err());
    }

    #[test]
    fn test_predict_without_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = predict(small_config(dir.path()), "{}").unwrap_err();
        assert!(err.to_string().contains("twin train"));
    }

    #[tokio::test]
    async fn test_simulate_writes_telemetry() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = small_config(dir.path());
        simulate(cfg.clone(), Some(25), None, Some(4)).await.unwrap();

        let table = TelemetryTable::load(&cfg.paths.telemetry).unwrap();
        assert_eq!(table.len(), 25);
        assert_eq!(table.days(), vec![4]);
    }
}
