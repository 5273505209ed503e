mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use twin_core::TwinConfig;

#[derive(Parser)]
#[command(name = "twin")]
#[command(about = "Traffic digital twin: simulate, generate, train and predict", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "JSON config file (defaults are used when omitted)")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the simulation under the adaptive signal policy and save telemetry")]
    Simulate {
        #[arg(long, help = "Step ceiling (overrides simulation.max_steps)")]
        max_steps: Option<u64>,

        #[arg(long, help = "Telemetry CSV output (overrides paths.telemetry)")]
        out: Option<PathBuf>,

        #[arg(long, help = "Tag every record with this day id")]
        day: Option<u32>,
    },

    #[command(about = "Generate a multi-day synthetic telemetry corpus")]
    Synth {
        #[arg(long, help = "Number of days (overrides synthetic.days)")]
        days: Option<u32>,

        #[arg(long, help = "RNG seed (overrides synthetic.seed)")]
        seed: Option<u64>,

        #[arg(long, help = "CSV output (overrides paths.synthetic)")]
        out: Option<PathBuf>,
    },

    #[command(about = "Window telemetry, fit the forecaster chronologically and persist it")]
    Train {
        #[arg(long, help = "Telemetry CSV to train on (defaults to paths.synthetic)")]
        input: Option<PathBuf>,

        #[arg(long, help = "Also write test-set actual vs predicted counts to this CSV")]
        predictions: Option<PathBuf>,
    },

    #[command(about = "Predict congestion for one feature record")]
    Predict {
        #[arg(help = "Flat JSON object with every schema field, e.g. '{\"step\":1800,...}'")]
        record: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = TwinConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            max_steps,
            out,
            day,
        } => commands::simulate(cfg, max_steps, out, day).await,
        Commands::Synth { days, seed, out } => commands::synth(cfg, days, seed, out),
        Commands::Train { input, predictions } => commands::train(cfg, input, predictions),
        Commands::Predict { record } => commands::predict(cfg, &record),
    }
}
