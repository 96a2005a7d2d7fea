//! `causalbert` command-line driver.
//!
//! Usage:
//!   causalbert run reviews.json --treatment rating --sentiment --cutoff 3
//!   causalbert estimate reviews.csv --checkpoint model.safetensors

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use causalbert_core::{load_config, CausalEstimate, LossHistory, ResponseType, RunConfig};
use causalbert_model::{device_name, select_device};
use causalbert_train::{load_split_examples, CausalBertEstimator, ColumnSpec, TreatmentSource};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "causalbert", about = "Causal effect estimation from text with CausalBert")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train on the train/dev splits, then estimate effects on the test split.
    Run(RunArgs),
    /// Estimate effects on the test split with a saved checkpoint.
    Estimate(EstimateArgs),
}

#[derive(Args)]
struct DataArgs {
    /// CSV, JSON (array or object of records) or JSON Lines file.
    data: PathBuf,

    #[arg(long, default_value = "text")]
    text: String,

    #[arg(long, default_value = "T")]
    treatment: String,

    #[arg(long, default_value = "Y")]
    outcome: String,

    /// Out-of-text confounder column; all zero when omitted.
    #[arg(long)]
    confounder: Option<String>,

    /// Treatment column holds a sentiment score; treated means score > cutoff.
    #[arg(long)]
    sentiment: bool,

    #[arg(long, default_value_t = 0.0)]
    cutoff: f64,
}

impl DataArgs {
    fn columns(&self) -> ColumnSpec {
        ColumnSpec {
            text: self.text.clone(),
            treatment: self.treatment.clone(),
            outcome: self.outcome.clone(),
            confounder: self.confounder.clone(),
            sentiment_cutoff: self.sentiment.then_some(self.cutoff),
            ..ColumnSpec::default()
        }
    }
}

#[derive(Args)]
struct ModelArgs {
    /// YAML run configuration; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hugging Face model repository.
    #[arg(long)]
    model_id: Option<String>,

    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// `binary` or `continuous`.
    #[arg(long)]
    response_type: Option<ResponseType>,

    #[arg(long)]
    max_length: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    g_weight: Option<f64>,

    #[arg(long)]
    q_weight: Option<f64>,

    #[arg(long)]
    mlm_weight: Option<f64>,

    /// Ignore CUDA / Metal even when compiled in.
    #[arg(long)]
    cpu: bool,

    /// Report raw (uncalibrated) estimates.
    #[arg(long)]
    no_recalibrate: bool,
}

impl ModelArgs {
    /// File configuration (or command-line defaults) with flag overrides.
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => cli_defaults(),
        };
        let model = &mut config.model;
        if let Some(id) = &self.model_id {
            model.model_id = id.clone();
        }
        if let Some(dir) = &self.cache_dir {
            model.cache_dir = Some(dir.clone());
        }
        if let Some(rt) = self.response_type {
            model.response_type = rt;
        }
        if let Some(n) = self.max_length {
            model.max_length = n;
        }
        if let Some(w) = self.g_weight {
            model.loss_weights.g = w;
        }
        if let Some(w) = self.q_weight {
            model.loss_weights.q = w;
        }
        if let Some(w) = self.mlm_weight {
            model.loss_weights.mlm = w;
        }
        if let Some(n) = self.batch_size {
            config.train.batch_size = n;
        }
        config.model.validate()?;
        config.train.validate()?;
        Ok(config)
    }
}

/// Small batches and a light propensity weight.
fn cli_defaults() -> RunConfig {
    let mut config = RunConfig::default();
    config.train.batch_size = 2;
    config.train.epochs = 1;
    config.model.loss_weights.g = 0.1;
    config.model.loss_weights.q = 0.1;
    config.model.loss_weights.mlm = 1.0;
    config
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    data: DataArgs,

    #[command(flatten)]
    model: ModelArgs,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Propensity + MLM warm-start epochs before joint training.
    #[arg(long, default_value_t = 0)]
    pretrain_epochs: usize,

    /// Prefix of the loss history and estimate files.
    #[arg(long, default_value = "experiment")]
    experiment: String,

    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Write trained parameters to this safetensors file.
    #[arg(long)]
    save: Option<PathBuf>,
}

#[derive(Args)]
struct EstimateArgs {
    #[command(flatten)]
    data: DataArgs,

    #[command(flatten)]
    model: ModelArgs,

    /// Safetensors checkpoint written by `run --save`.
    #[arg(long)]
    checkpoint: PathBuf,

    /// Write the estimates as JSON here.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Serialize)]
struct EffectReport {
    att_inferred: CausalEstimate,
    att_observed: CausalEstimate,
    ate: CausalEstimate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Estimate(args) => estimate(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = args.model.run_config()?;
    if let Some(epochs) = args.epochs {
        config.train.epochs = epochs;
    }
    if let Some(lr) = args.learning_rate {
        config.train.learning_rate = lr;
    }
    if let Some(path) = &args.save {
        config.train.checkpoint_path = Some(path.clone());
    }

    tracing::info!(path = %args.data.data.display(), "Reading data");
    let split = load_split_examples(&args.data.data, &args.data.columns())?;
    if args.data.sentiment {
        tracing::info!(cutoff = args.data.cutoff, "Treatment is sentiment > cutoff");
    }

    let device = select_device(args.model.cpu);
    tracing::info!(device = device_name(&device), "Loading pretrained encoder");
    let learning_rate = config.train.learning_rate;
    let mut estimator =
        CausalBertEstimator::from_pretrained(config.model, config.train, &device).await?;

    if args.pretrain_epochs > 0 {
        let history = estimator.pretrain(&split.train, learning_rate, args.pretrain_epochs)?;
        write_json(
            &args.output_dir.join(format!("{}_pretrain_losses.json", args.experiment)),
            &history,
        )?;
    }

    tracing::info!(epochs = estimator.train_config().epochs, "Training CausalBert");
    let report = estimator.train(&split.train, &split.dev)?;
    write_history(&args.output_dir, &args.experiment, "training", &report.train)?;
    write_history(&args.output_dir, &args.experiment, "dev", &report.dev)?;

    let effects = estimate_effects(&estimator, &split.test, !args.model.no_recalibrate)?;
    write_json(
        &args.output_dir.join(format!("{}_estimates.json", args.experiment)),
        &effects,
    )?;
    Ok(())
}

async fn estimate(args: EstimateArgs) -> Result<()> {
    let config = args.model.run_config()?;
    let split = load_split_examples(&args.data.data, &args.data.columns())?;

    let device = select_device(args.model.cpu);
    let estimator =
        CausalBertEstimator::from_pretrained(config.model, config.train, &device).await?;
    estimator
        .load(&args.checkpoint)
        .with_context(|| format!("loading checkpoint {}", args.checkpoint.display()))?;

    let effects = estimate_effects(&estimator, &split.test, !args.model.no_recalibrate)?;
    if let Some(path) = &args.output {
        write_json(path, &effects)?;
    }
    Ok(())
}

fn estimate_effects(
    estimator: &CausalBertEstimator,
    test: &[causalbert_core::Example],
    recalibrate: bool,
) -> Result<EffectReport> {
    tracing::info!(examples = test.len(), recalibrate, "Estimating effects on the test split");

    let att_inferred = estimator.att(test, TreatmentSource::Inferred, recalibrate)?;
    tracing::info!(%att_inferred, "ATT (inferred treatments)");

    let att_observed = estimator.att(test, TreatmentSource::Observed, recalibrate)?;
    tracing::info!(%att_observed, "ATT (observed treatments)");

    let ate = estimator.ate(test, recalibrate)?;
    tracing::info!(%ate, "ATE");

    Ok(EffectReport {
        att_inferred,
        att_observed,
        ate,
    })
}

fn write_history(dir: &Path, experiment: &str, kind: &str, history: &LossHistory) -> Result<()> {
    write_json(&dir.join(format!("{experiment}_{kind}_losses.json")), history)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(path = %path.display(), "Wrote results");
    Ok(())
}
