//! lorastep CLI - LoRA fine-tuning on the quantized compute pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use lorastep_compute::{ComputeContext, ContextOptions};
use lorastep_core::{LrSchedulerType, RankStrategy, TrainingCallback, TrainingConfig};
use lorastep_data::{ByteTokenizer, DatasetSource, HfTokenizer, Tokenizer};
use lorastep_lora::validate_adapter_file;
use lorastep_models::{ModelSource, TinyLmConfig, TinyLmProvider};
use lorastep_trainer::{
    HostMessage, LoggingCallback, MetricsJsonCallback, SessionResources, TrainingRequest, Worker,
    WorkerMessage,
};
use serde::{Deserialize, Serialize};

/// Combined configuration file for a training run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Base model configuration.
    #[serde(default)]
    pub model: TinyLmConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,
}

impl RunConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Rank adaptation strategy.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    /// Keep the initial rank
    Fixed,
    /// Ramp from min to max rank over the run
    Progressive,
    /// Follow the loss trend
    Adaptive,
    /// Follow device memory utilization
    HardwareAware,
}

impl From<StrategyArg> for RankStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Fixed => RankStrategy::Fixed,
            StrategyArg::Progressive => RankStrategy::Progressive,
            StrategyArg::Adaptive => RankStrategy::Adaptive,
            StrategyArg::HardwareAware => RankStrategy::HardwareAware,
        }
    }
}

/// Learning rate schedule.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScheduleArg {
    Constant,
    Linear,
    Cosine,
}

impl From<ScheduleArg> for LrSchedulerType {
    fn from(arg: ScheduleArg) -> Self {
        match arg {
            ScheduleArg::Constant => LrSchedulerType::Constant,
            ScheduleArg::Linear => LrSchedulerType::Linear,
            ScheduleArg::Cosine => LrSchedulerType::Cosine,
        }
    }
}

#[derive(Parser)]
#[command(name = "lorastep")]
#[command(author, version, about = "LoRA fine-tuning with 4-bit base weights and 8-bit Adam", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a LoRA adapter on a text corpus
    Train(TrainArgs),

    /// Validate an adapter file and print its contents
    Inspect {
        /// Adapter file (.safetensors)
        path: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    /// Training corpus (UTF-8 text file)
    #[arg(short, long)]
    dataset: PathBuf,

    /// Run configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HuggingFace tokenizer.json (defaults to byte-level)
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Output adapter file
    #[arg(short, long, default_value = "./adapter_model.safetensors")]
    output: PathBuf,

    /// LoRA rank
    #[arg(long)]
    rank: Option<usize>,

    /// LoRA alpha
    #[arg(long)]
    alpha: Option<f32>,

    /// Layers to adapt, by name suffix
    #[arg(long, value_delimiter = ',')]
    target_modules: Option<Vec<String>>,

    /// Number of optimizer steps
    #[arg(long)]
    max_steps: Option<usize>,

    /// Learning rate
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Learning rate schedule
    #[arg(long, value_enum)]
    lr_scheduler: Option<ScheduleArg>,

    /// Sequences per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Tokens per training sequence
    #[arg(long)]
    seq_len: Option<usize>,

    /// Rank scheduler strategy
    #[arg(long, value_enum)]
    rank_strategy: Option<StrategyArg>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Include optimizer moments in the adapter file
    #[arg(long)]
    export_optimizer_state: bool,

    /// Write per-step metrics as JSONL
    #[arg(long)]
    log_metrics: Option<PathBuf>,

    /// Compute threads (defaults to available parallelism)
    #[arg(long)]
    threads: Option<usize>,

    /// Device memory budget in MiB
    #[arg(long, default_value = "4096")]
    memory_budget_mb: u64,
}

impl TrainArgs {
    /// Apply command-line overrides on top of the configuration file.
    fn apply(&self, config: &mut RunConfig) {
        let training = &mut config.training;
        if let Some(rank) = self.rank {
            training.adapter.rank = rank;
            training.adapter.max_rank = training.adapter.max_rank.max(rank);
        }
        if let Some(alpha) = self.alpha {
            training.adapter.alpha = alpha;
        }
        if let Some(targets) = &self.target_modules {
            training.adapter.target_modules = targets.clone();
        }
        if let Some(steps) = self.max_steps {
            training.max_steps = steps;
        }
        if let Some(lr) = self.learning_rate {
            training.learning_rate = lr;
        }
        if let Some(schedule) = self.lr_scheduler {
            training.lr_scheduler = schedule.into();
        }
        if let Some(batch_size) = self.batch_size {
            training.batch_size = batch_size;
        }
        if let Some(seq_len) = self.seq_len {
            training.sequence_length = seq_len;
        }
        if let Some(strategy) = self.rank_strategy {
            training.rank_scheduler.strategy = strategy.into();
        }
        if let Some(seed) = self.seed {
            training.seed = seed;
        }
        if self.export_optimizer_state {
            training.export_optimizer_state = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => run_train(args).await,
        Commands::Inspect { path, json } => run_inspect(&path, json),
    }
}

async fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    args.apply(&mut config);

    let tokenizer: Arc<dyn Tokenizer> = match &args.tokenizer {
        Some(path) => Arc::new(HfTokenizer::from_file(path)?),
        None => Arc::new(ByteTokenizer),
    };
    config.model.vocab_size = config.model.vocab_size.max(tokenizer.vocab_size());
    config.training.validate()?;

    let ctx = ComputeContext::with_options(ContextOptions {
        num_threads: args.threads,
        memory_budget_bytes: args.memory_budget_mb * 1024 * 1024,
        ..Default::default()
    })?;
    let resources = SessionResources::new(
        Arc::new(ctx),
        Arc::new(TinyLmProvider::new(config.model.clone())),
        tokenizer,
    );

    let metrics_path = args.log_metrics.clone();
    let mut worker = Worker::new(resources)
        .with_callbacks(Arc::new(move || {
            let mut callbacks: Vec<Box<dyn TrainingCallback>> =
                vec![Box::new(LoggingCallback::default())];
            if let Some(path) = &metrics_path {
                match MetricsJsonCallback::new(path) {
                    Ok(cb) => callbacks.push(Box::new(cb)),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Metrics logging disabled"),
                }
            }
            callbacks
        }))
        .with_output(&args.output)
        .spawn();

    worker.send(HostMessage::InitializeAndStart(TrainingRequest {
        model_source: ModelSource::Tiny(config.model.clone()),
        dataset: DatasetSource::TextFile {
            path: args.dataset.clone(),
        },
        training_config: config.training.clone(),
    }))?;

    let progress = ProgressBar::new(config.training.max_steps as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) | Loss: {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    while let Some(event) = worker.recv().await {
        match event {
            WorkerMessage::TrainingStarted {
                total_steps,
                dataset_size,
                dataset_tokens,
                ..
            } => {
                progress.set_length(total_steps as u64);
                tracing::info!(total_steps, dataset_size, dataset_tokens, "Training started");
            }
            WorkerMessage::TrainingProgress(update) => {
                progress.set_position(update.step as u64);
                progress.set_message(format!("{:.4} | rank {}", update.loss, update.current_rank));
            }
            WorkerMessage::RankUpdated {
                old_rank,
                new_rank,
                step,
            } => {
                progress.println(format!("step {step}: rank {old_rank} -> {new_rank}"));
            }
            WorkerMessage::TrainingCompleted(report) => {
                progress.finish_with_message(format!(
                    "{:.4}",
                    report.final_loss.unwrap_or(f64::NAN)
                ));
                tracing::info!(
                    path = %args.output.display(),
                    steps = report.total_steps,
                    average_loss = report.average_loss,
                    seconds = report.training_time,
                    final_rank = report.rank_scheduler_stats.final_rank,
                    rank_changes = report.rank_scheduler_stats.adaptations,
                    "Training complete"
                );
                break;
            }
            WorkerMessage::Error { message, step } => {
                progress.abandon();
                match step {
                    Some(step) => bail!("training failed at step {step}: {message}"),
                    None => bail!("training failed: {message}"),
                }
            }
            WorkerMessage::TrainingStopped { step } => {
                progress.abandon();
                bail!("training stopped at step {step}");
            }
            WorkerMessage::TrainingPaused { .. }
            | WorkerMessage::TrainingResumed { .. }
            | WorkerMessage::StatusUpdate(_) => {}
        }
    }

    worker.shutdown().await;
    Ok(())
}

fn run_inspect(path: &Path, json: bool) -> anyhow::Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let report = validate_adapter_file(&bytes)?;

    if json {
        let value = serde_json::json!({
            "metadata": report.adapter_metadata,
            "completeLayers": report.complete_layers,
            "numTensors": report.num_tensors,
            "warnings": report.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Adapter file: {}", path.display());
    match &report.adapter_metadata {
        Some(meta) => {
            println!("  Model:          {}", meta.model_name);
            println!("  Rank / alpha:   {} / {} (scaling {})", meta.rank, meta.alpha, meta.scaling);
            println!("  Targets:        {}", meta.target_modules.join(", "));
            println!("  Steps:          {}", meta.training_steps);
            if let Some(loss) = meta.final_loss {
                println!("  Final loss:     {loss:.4}");
            }
            println!("  Created:        {}", meta.created_at);
            println!("  Optimizer state: {}", meta.includes_optimizer_state);
        }
        None => println!("  Metadata incomplete"),
    }
    println!("  Tensors:        {}", report.num_tensors);
    println!("  Layers:         {}", report.complete_layers.len());
    for layer in &report.complete_layers {
        println!("    {layer}");
    }
    if report.is_clean() {
        println!("No issues found.");
    } else {
        println!("Warnings:");
        for warning in &report.warnings {
            println!("  - {warning}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_overrides() {
        let cli = Cli::try_parse_from([
            "lorastep",
            "train",
            "--dataset",
            "corpus.txt",
            "--rank",
            "96",
            "--target-modules",
            "q_proj,v_proj",
            "--rank-strategy",
            "hardware-aware",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let mut config = RunConfig::default();
        args.apply(&mut config);
        assert_eq!(config.training.adapter.rank, 96);
        assert_eq!(config.training.adapter.max_rank, 96);
        assert_eq!(config.training.adapter.target_modules, vec!["q_proj", "v_proj"]);
        assert_eq!(config.training.rank_scheduler.strategy, RankStrategy::HardwareAware);
        assert!(config.training.validate().is_ok());
    }

    #[test]
    fn test_run_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{"model": {"hidden_size": 64}, "training": {"max_steps": 7, "adapter": {"rank": 4}}}"#,
        )
        .unwrap();
        let config = RunConfig::from_file(&path).unwrap();
        assert_eq!(config.model.hidden_size, 64);
        assert_eq!(config.model.vocab_size, 256);
        assert_eq!(config.training.max_steps, 7);
        assert_eq!(config.training.adapter.rank, 4);
    }
}
