//! Configuration types for lorastep.

use serde::{Deserialize, Serialize};

use crate::{LoraStepError, Result};

/// LoRA adapter configuration.
///
/// Everything except `rank` is fixed for the lifetime of a session. The rank
/// is only changed by applying a rank-scheduler decision between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Initial LoRA rank (r).
    #[serde(default = "default_lora_rank")]
    pub rank: usize,

    /// LoRA alpha (scaling numerator).
    #[serde(default = "default_lora_alpha")]
    pub alpha: f32,

    /// Target modules to apply LoRA to.
    ///
    /// A layer matches when its name equals an entry or ends with `.{entry}`.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    /// Lower bound for rank changes.
    #[serde(default = "default_min_rank")]
    pub min_rank: usize,

    /// Upper bound for rank changes.
    #[serde(default = "default_max_rank")]
    pub max_rank: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            rank: default_lora_rank(),
            alpha: default_lora_alpha(),
            target_modules: default_target_modules(),
            min_rank: default_min_rank(),
            max_rank: default_max_rank(),
        }
    }
}

impl AdapterConfig {
    /// Compute the LoRA scaling factor for the current rank.
    #[must_use]
    pub fn scaling(&self) -> f32 {
        scaling_for(self.alpha, self.rank)
    }

    /// Check bounds and target modules.
    pub fn validate(&self) -> Result<()> {
        if self.min_rank > self.max_rank {
            return Err(LoraStepError::Config(format!(
                "min_rank ({}) must be <= max_rank ({})",
                self.min_rank, self.max_rank
            )));
        }
        if self.rank < self.min_rank || self.rank > self.max_rank {
            return Err(LoraStepError::Config(format!(
                "rank {} outside configured bounds [{}, {}]",
                self.rank, self.min_rank, self.max_rank
            )));
        }
        if !self.alpha.is_finite() || self.alpha <= 0.0 {
            return Err(LoraStepError::Config(format!(
                "alpha must be a positive finite number, got {}",
                self.alpha
            )));
        }
        if self.target_modules.is_empty() {
            return Err(LoraStepError::Config(
                "target_modules must name at least one layer".into(),
            ));
        }
        Ok(())
    }

    /// Whether a layer name is selected by `target_modules`.
    #[must_use]
    pub fn targets(&self, layer_name: &str) -> bool {
        self.target_modules.iter().any(|target| {
            layer_name == target
                || layer_name
                    .strip_suffix(target.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

/// LoRA scaling `alpha / rank`, defined as zero for a disabled (rank 0) adapter.
#[must_use]
pub fn scaling_for(alpha: f32, rank: usize) -> f32 {
    if rank == 0 {
        0.0
    } else {
        alpha / rank as f32
    }
}

/// Optimizer hyperparameters for the fused 8-bit Adam update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// First moment decay.
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    /// Second moment decay.
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    /// Epsilon for numerical stability.
    #[serde(default = "default_eps")]
    pub eps: f32,
    /// Weight decay folded into the gradient (`g + wd * w`).
    #[serde(default)]
    pub weight_decay: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    /// Validate the hyperparameters.
    pub fn validate(&self) -> Result<()> {
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(LoraStepError::Config(format!(
                    "{name} must be in [0, 1), got {beta}"
                )));
            }
        }
        if self.eps <= 0.0 {
            return Err(LoraStepError::Config(format!(
                "eps must be > 0, got {}",
                self.eps
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(LoraStepError::Config(format!(
                "weight_decay must be >= 0, got {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Rank adaptation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RankStrategy {
    /// Rank never changes.
    #[default]
    Fixed,
    /// Deterministic ramp from `min_rank` to `max_rank`.
    Progressive,
    /// Loss/gradient trend analysis over a sliding window.
    Adaptive,
    /// Memory utilization and throughput driven.
    HardwareAware,
}

/// Rank scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankSchedulerConfig {
    /// Strategy to use.
    #[serde(default)]
    pub strategy: RankStrategy,

    /// Minimum number of steps between two applied rank changes.
    #[serde(default = "default_cooldown")]
    pub adaptation_cooldown: usize,

    /// Number of recent metrics considered by the adaptive strategy.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Steps over which the progressive strategy ramps (defaults to the run length).
    #[serde(default)]
    pub progressive_horizon: Option<usize>,

    /// Rank increment/decrement used by the adaptive and hardware strategies.
    #[serde(default = "default_rank_step")]
    pub rank_step: usize,

    /// Memory budget the hardware strategy measures utilization against.
    #[serde(default = "default_target_memory_gb")]
    pub target_memory_usage_gb: f64,

    /// Utilization below which the hardware strategy may grow the rank.
    #[serde(default = "default_low_watermark")]
    pub memory_low_watermark: f64,

    /// Utilization above which the hardware strategy shrinks the rank.
    #[serde(default = "default_high_watermark")]
    pub memory_high_watermark: f64,

    /// Relative loss improvement across the window below which training is stalled.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: f64,

    /// Mean gradient norm below which gradients are considered vanishing.
    #[serde(default = "default_vanishing_grad")]
    pub vanishing_grad_norm: f64,

    /// Mean gradient norm above which gradients are considered exploding.
    #[serde(default = "default_exploding_grad")]
    pub exploding_grad_norm: f64,

    /// Fraction of the running mean throughput that still counts as healthy.
    #[serde(default = "default_min_throughput_ratio")]
    pub min_throughput_ratio: f64,

    /// Maximum retained metrics/decision history entries.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for RankSchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: RankStrategy::default(),
            adaptation_cooldown: default_cooldown(),
            window_size: default_window_size(),
            progressive_horizon: None,
            rank_step: default_rank_step(),
            target_memory_usage_gb: default_target_memory_gb(),
            memory_low_watermark: default_low_watermark(),
            memory_high_watermark: default_high_watermark(),
            stall_threshold: default_stall_threshold(),
            vanishing_grad_norm: default_vanishing_grad(),
            exploding_grad_norm: default_exploding_grad(),
            min_throughput_ratio: default_min_throughput_ratio(),
            max_history: default_max_history(),
        }
    }
}

impl RankSchedulerConfig {
    /// Validate thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.window_size < 2 {
            return Err(LoraStepError::Config(
                "window_size must be >= 2 for trend analysis".into(),
            ));
        }
        if self.rank_step == 0 {
            return Err(LoraStepError::Config("rank_step must be > 0".into()));
        }
        if self.target_memory_usage_gb <= 0.0 {
            return Err(LoraStepError::Config(
                "target_memory_usage_gb must be > 0".into(),
            ));
        }
        if self.memory_low_watermark >= self.memory_high_watermark {
            return Err(LoraStepError::Config(format!(
                "memory_low_watermark ({}) must be below memory_high_watermark ({})",
                self.memory_low_watermark, self.memory_high_watermark
            )));
        }
        if self.vanishing_grad_norm >= self.exploding_grad_norm {
            return Err(LoraStepError::Config(
                "vanishing_grad_norm must be below exploding_grad_norm".into(),
            ));
        }
        if self.max_history < self.window_size {
            return Err(LoraStepError::Config(
                "max_history must be at least window_size".into(),
            ));
        }
        Ok(())
    }
}

/// Learning rate scheduler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    /// Constant learning rate.
    #[default]
    Constant,
    /// Linear decay.
    Linear,
    /// Cosine annealing.
    Cosine,
}

/// Training configuration sent with a start request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Adapter shape and targets.
    #[serde(default)]
    pub adapter: AdapterConfig,

    /// Optimizer hyperparameters.
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Rank scheduling policy.
    #[serde(default)]
    pub rank_scheduler: RankSchedulerConfig,

    /// Learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Learning rate scheduler type.
    #[serde(default)]
    pub lr_scheduler: LrSchedulerType,

    /// Warmup steps.
    #[serde(default)]
    pub warmup_steps: usize,

    /// Sequences per step.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of optimizer steps to run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Tokens per training sequence.
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,

    /// Window stride; `None` means disjoint windows (`stride == sequence_length`).
    #[serde(default)]
    pub stride: Option<usize>,

    /// Maximum gradient norm for clipping (0 disables clipping).
    #[serde(default = "default_grad_clip")]
    pub max_grad_norm: f64,

    /// Random seed for adapter initialization.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Include optimizer moments in the exported adapter file.
    #[serde(default)]
    pub export_optimizer_state: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            optimizer: OptimizerConfig::default(),
            rank_scheduler: RankSchedulerConfig::default(),
            learning_rate: default_lr(),
            lr_scheduler: LrSchedulerType::default(),
            warmup_steps: 0,
            batch_size: default_batch_size(),
            max_steps: default_max_steps(),
            sequence_length: default_sequence_length(),
            stride: None,
            max_grad_norm: default_grad_clip(),
            seed: default_seed(),
            export_optimizer_state: false,
        }
    }
}

impl TrainingConfig {
    /// Effective window stride.
    #[must_use]
    pub fn effective_stride(&self) -> usize {
        self.stride.unwrap_or(self.sequence_length)
    }

    /// Validate the whole configuration tree.
    pub fn validate(&self) -> Result<()> {
        self.adapter.validate()?;
        self.optimizer.validate()?;
        self.rank_scheduler.validate()?;
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(LoraStepError::Config(format!(
                "learning_rate must be a positive finite number, got {}",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(LoraStepError::Config("batch_size must be > 0".into()));
        }
        if self.max_steps == 0 {
            return Err(LoraStepError::Config("max_steps must be > 0".into()));
        }
        if self.sequence_length < 2 {
            return Err(LoraStepError::Config(
                "sequence_length must be >= 2 to form shifted labels".into(),
            ));
        }
        if self.effective_stride() == 0 {
            return Err(LoraStepError::Config("stride must be > 0".into()));
        }
        if self.max_grad_norm < 0.0 {
            return Err(LoraStepError::Config("max_grad_norm must be >= 0".into()));
        }
        Ok(())
    }
}

// Default value functions
fn default_lora_rank() -> usize {
    8
}
fn default_lora_alpha() -> f32 {
    16.0
}
fn default_min_rank() -> usize {
    1
}
fn default_max_rank() -> usize {
    64
}
fn default_target_modules() -> Vec<String> {
    vec!["q_proj".into(), "v_proj".into()]
}
fn default_beta1() -> f32 {
    0.9
}
fn default_beta2() -> f32 {
    0.999
}
fn default_eps() -> f32 {
    1e-8
}
fn default_cooldown() -> usize {
    50
}
fn default_window_size() -> usize {
    10
}
fn default_rank_step() -> usize {
    2
}
fn default_target_memory_gb() -> f64 {
    4.0
}
fn default_low_watermark() -> f64 {
    0.7
}
fn default_high_watermark() -> f64 {
    0.9
}
fn default_stall_threshold() -> f64 {
    0.01
}
fn default_vanishing_grad() -> f64 {
    1e-5
}
fn default_exploding_grad() -> f64 {
    10.0
}
fn default_min_throughput_ratio() -> f64 {
    0.8
}
fn default_max_history() -> usize {
    1000
}
fn default_lr() -> f64 {
    2e-4
}
fn default_batch_size() -> usize {
    1
}
fn default_max_steps() -> usize {
    100
}
fn default_sequence_length() -> usize {
    128
}
fn default_grad_clip() -> f64 {
    1.0
}
fn default_seed() -> u64 {
    42
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling() {
        let config = AdapterConfig {
            rank: 4,
            alpha: 8.0,
            ..Default::default()
        };
        assert!((config.scaling() - 2.0).abs() < 1e-6);
        assert_eq!(scaling_for(8.0, 0), 0.0);
    }

    #[test]
    fn test_rank_outside_bounds_rejected() {
        let config = AdapterConfig {
            rank: 128,
            max_rank: 64,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LoraStepError::Config(_))));
    }

    #[test]
    fn test_targets_matches_suffix() {
        let config = AdapterConfig {
            target_modules: vec!["q_proj".into()],
            ..Default::default()
        };
        assert!(config.targets("q_proj"));
        assert!(config.targets("layers.0.self_attn.q_proj"));
        assert!(!config.targets("layers.0.self_attn.qq_proj"));
        assert!(!config.targets("v_proj"));
    }

    #[test]
    fn test_training_config_defaults_deserialize() {
        let config: TrainingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TrainingConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_stride(), config.sequence_length);
    }

    #[test]
    fn test_partial_adapter_config() {
        let config: TrainingConfig = serde_json::from_str(
            r#"{"adapter": {"rank": 4, "alpha": 8.0, "target_modules": ["q_proj"]}, "max_steps": 50}"#,
        )
        .unwrap();
        assert_eq!(config.adapter.rank, 4);
        assert_eq!(config.adapter.max_rank, 64);
        assert_eq!(config.max_steps, 50);
    }

    #[test]
    fn test_optimizer_betas_validated() {
        let config = OptimizerConfig {
            beta1: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduler_watermarks_validated() {
        let config = RankSchedulerConfig {
            memory_low_watermark: 0.95,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
