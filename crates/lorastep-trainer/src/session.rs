//! Training session: the orchestrator's state machine and step loop.
//!
//! ```text
//! Idle -> Initializing -> Running <-> Paused -> Completed | Aborted | Error
//! ```
//!
//! One [`step`](TrainingSession::step) draws the next batch, runs the base
//! model with the LoRA branch hooked into every adapted layer, computes the
//! loss against shifted labels, back-propagates through the LoRA branch only,
//! clips, applies the 8-bit optimizer and then consults the rank scheduler.
//!
//! The upstream gradient of every adapted layer's output is the model's
//! pseudo-gradient at its final hidden state. This approximates the true
//! gradient without differentiating through the frozen model.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lorastep_compute::{
    clip_by_global_norm, cross_entropy_forward_backward, shifted_labels, Adam8bitBuilder,
    ComputeContext,
};
use lorastep_core::{
    LearningRateScheduler, StaticEstimator, StepMetrics, ThroughputEstimator, TrainingCallback,
    TrainingConfig, TrainingStatus,
};
use lorastep_data::{BatchCursor, ByteTokenizer, SequenceWindows, Tokenizer};
use lorastep_lora::{AdapterData, AdapterLayers, AdapterMetadata, LayerSpec};
use lorastep_models::{
    BaseModel, LayerAdapter, ModelError, ModelProvider, TinyLmConfig, TinyLmProvider,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::error::{Result, TrainerError};
use crate::progress::estimate_eta;
use crate::protocol::{CompletionReport, ProgressUpdate, StatusSnapshot, TrainingRequest};
use crate::rank_scheduler::{RankChange, RankDecision, RankScheduler};
use crate::state::TrainingState;

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionResources {
    /// Compute device.
    pub context: Arc<ComputeContext>,
    /// Resolves model sources.
    pub models: Arc<dyn ModelProvider>,
    /// Tokenizes text datasets.
    pub tokenizer: Arc<dyn Tokenizer>,
    /// Throughput estimate used for ETA before measurements exist.
    pub estimator: Arc<dyn ThroughputEstimator>,
}

impl SessionResources {
    /// Resources with a static throughput estimate.
    pub fn new(
        context: Arc<ComputeContext>,
        models: Arc<dyn ModelProvider>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        Self {
            context,
            models,
            tokenizer,
            estimator: Arc::new(StaticEstimator::default()),
        }
    }

    /// Replace the throughput estimator.
    pub fn with_estimator(mut self, estimator: Arc<dyn ThroughputEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Reference model provider and byte tokenizer on `context`.
    pub fn reference(context: Arc<ComputeContext>) -> Self {
        Self::new(
            context,
            Arc::new(TinyLmProvider::new(TinyLmConfig::default())),
            Arc::new(ByteTokenizer),
        )
    }
}

/// Result of one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Metrics of the step.
    pub metrics: StepMetrics,
    /// Learning rate applied.
    pub learning_rate: f64,
    /// Window indices of the batch.
    pub batch_indices: Vec<usize>,
    /// Rank scheduler decision.
    pub decision: RankDecision,
    /// Rank change applied after the step.
    pub rank_change: Option<RankChange>,
    /// Whether this was the last step.
    pub finished: bool,
}

struct AdapterHook<'a> {
    ctx: &'a ComputeContext,
    layers: &'a mut AdapterLayers,
}

impl LayerAdapter for AdapterHook<'_> {
    fn adapt(
        &mut self,
        layer: &str,
        input: &[f32],
        rows: usize,
        output: &mut [f32],
    ) -> lorastep_models::Result<()> {
        if !self.layers.contains(layer) {
            return Ok(());
        }
        self.layers
            .layer_mut(layer)
            .and_then(|buffers| buffers.forward(self.ctx, input, rows, output))
            .map_err(|e| ModelError::Adapter {
                layer: layer.to_string(),
                message: e.to_string(),
            })
    }
}

/// One training session.
pub struct TrainingSession {
    config: TrainingConfig,
    state: TrainingState,
    ctx: Arc<ComputeContext>,
    model: Arc<dyn BaseModel>,
    adapter: Option<AdapterLayers>,
    windows: SequenceWindows,
    cursor: BatchCursor,
    rank_scheduler: RankScheduler,
    lr_scheduler: LearningRateScheduler,
    estimator: Arc<dyn ThroughputEstimator>,
    rng: StdRng,
    callbacks: Vec<Box<dyn TrainingCallback>>,
    training_time: Duration,
}

impl TrainingSession {
    /// Acquire resources and allocate the adapter.
    ///
    /// On success the session is `Initializing`; call
    /// [`start`](Self::start) to begin. Failures are
    /// [`TrainerError::Setup`] or [`TrainerError::Config`] and leave nothing
    /// allocated.
    pub fn initialize(request: TrainingRequest, resources: &SessionResources) -> Result<Self> {
        let TrainingRequest {
            model_source,
            dataset,
            training_config: config,
        } = request;
        config.validate()?;

        let mut state = TrainingState::new(config.max_steps, config.adapter.rank);
        state.transition(TrainingStatus::Initializing)?;

        let ctx = Arc::clone(&resources.context);
        let model = resources
            .models
            .load(&model_source, Arc::clone(&ctx))
            .map_err(TrainerError::setup)?;

        let specs: Vec<LayerSpec> = model
            .linear_layers()
            .into_iter()
            .filter(|layer| config.adapter.targets(&layer.name))
            .map(|layer| LayerSpec::new(layer.name, layer.in_features, layer.out_features))
            .collect();
        if specs.is_empty() {
            return Err(TrainerError::Setup(format!(
                "no layers of {} match target modules {:?}",
                model.name(),
                config.adapter.target_modules
            )));
        }
        if let Some(spec) = specs.iter().find(|s| s.out_features != model.hidden_size()) {
            return Err(TrainerError::Setup(format!(
                "{} has {} output features; adapted layers must match hidden size {}",
                spec.name,
                spec.out_features,
                model.hidden_size()
            )));
        }

        let tokens = dataset
            .load_tokens(resources.tokenizer.as_ref())
            .map_err(TrainerError::setup)?;
        if let Some(id) = tokens.iter().find(|&&id| id as usize >= model.vocab_size()) {
            return Err(TrainerError::Setup(format!(
                "token id {id} exceeds model vocabulary of {}",
                model.vocab_size()
            )));
        }
        let windows = SequenceWindows::new(tokens, config.sequence_length, config.effective_stride())
            .map_err(TrainerError::setup)?;
        let cursor = BatchCursor::new(windows.len(), config.batch_size).map_err(TrainerError::setup)?;

        let rank_scheduler =
            RankScheduler::new(config.rank_scheduler.clone(), &config.adapter, config.max_steps)?;
        let lr_scheduler = LearningRateScheduler::from_config(&config);

        let mut rng = StdRng::seed_from_u64(config.seed);
        let adapter = AdapterLayers::allocate(
            Arc::clone(&ctx),
            &specs,
            config.adapter.rank,
            config.adapter.alpha,
            &mut rng,
        )
        .map_err(TrainerError::setup)?;

        info!(
            model = model.name(),
            layers = specs.len(),
            rank = config.adapter.rank,
            sequences = windows.len(),
            tokens = windows.total_tokens(),
            steps = config.max_steps,
            "Initialized training session"
        );

        Ok(Self {
            config,
            state,
            ctx,
            estimator: Arc::clone(&resources.estimator),
            model,
            adapter: Some(adapter),
            windows,
            cursor,
            rank_scheduler,
            lr_scheduler,
            rng,
            callbacks: Vec::new(),
            training_time: Duration::ZERO,
        })
    }

    /// Register a callback.
    pub fn add_callback(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    /// Lifecycle status.
    #[inline]
    pub fn status(&self) -> TrainingStatus {
        self.state.status
    }

    /// Progress and histories.
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Effective configuration.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Training sequences after windowing.
    pub fn dataset_size(&self) -> usize {
        self.windows.len()
    }

    /// Tokens in the corpus.
    pub fn dataset_tokens(&self) -> usize {
        self.windows.total_tokens()
    }

    /// Adapter buffers, until released.
    pub fn adapter(&self) -> Option<&AdapterLayers> {
        self.adapter.as_ref()
    }

    /// Rank scheduler.
    pub fn rank_scheduler(&self) -> &RankScheduler {
        &self.rank_scheduler
    }

    /// Window indices the next step will train on.
    pub fn next_batch_indices(&self) -> Vec<usize> {
        self.cursor.peek()
    }

    /// Enter `Running`.
    pub fn start(&mut self) -> Result<()> {
        self.state.transition(TrainingStatus::Running)?;
        for callback in &mut self.callbacks {
            callback.on_train_start();
        }
        Ok(())
    }

    /// Suspend at the current step boundary. Returns the last completed step.
    pub fn pause(&mut self) -> Result<usize> {
        self.state.transition(TrainingStatus::Paused)?;
        info!(step = self.state.current_step, "Training paused");
        Ok(self.state.current_step)
    }

    /// Continue a paused session. Returns the last completed step.
    pub fn resume(&mut self) -> Result<usize> {
        self.state.transition(TrainingStatus::Running)?;
        info!(step = self.state.current_step, "Training resumed");
        Ok(self.state.current_step)
    }

    /// Abort and release the adapter buffers. Returns the last completed step.
    pub fn stop(&mut self) -> Result<usize> {
        self.state.transition(TrainingStatus::Aborted)?;
        self.release();
        self.finish_callbacks();
        info!(step = self.state.current_step, "Training stopped");
        Ok(self.state.current_step)
    }

    /// Enter `Error` and release the adapter buffers.
    pub fn fail(&mut self, error: &TrainerError) {
        if self.state.transition(TrainingStatus::Error).is_err() {
            warn!(status = %self.state.status, "Error reported for a finished session");
        }
        self.release();
        self.finish_callbacks();
        tracing::error!(step = self.state.current_step, error = %error, "Training failed");
    }

    fn finish_callbacks(&mut self) {
        for callback in &mut self.callbacks {
            callback.on_train_end();
        }
    }

    fn release(&mut self) {
        if let Some(adapter) = self.adapter.take() {
            let bytes = adapter.memory_bytes();
            drop(adapter);
            debug!(bytes, "Released adapter buffers");
        }
    }

    /// Run the next step.
    ///
    /// Any failure is a [`TrainerError::Step`]; the caller should then
    /// [`fail`](Self::fail) the session.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.state.status != TrainingStatus::Running {
            return Err(TrainerError::NotRunning(self.state.status));
        }
        let step = self.state.current_step + 1;
        let at = TrainerError::at::<String>(step);

        for callback in &mut self.callbacks {
            callback.on_step_start(step);
        }
        let started = Instant::now();

        let adapter = self
            .adapter
            .as_mut()
            .ok_or_else(|| at("adapter buffers were released".to_string()))?;
        let batch_indices = self.cursor.next_indices();
        let batch = self
            .windows
            .gather(&batch_indices)
            .map_err(TrainerError::at(step))?;
        let rows = batch.num_tokens();
        let ctx = Arc::clone(&self.ctx);

        let logits = {
            let mut hook = AdapterHook {
                ctx: &ctx,
                layers: &mut *adapter,
            };
            self.model
                .forward(&batch.input_ids, &mut hook)
                .map_err(TrainerError::at(step))?
        };

        let labels = shifted_labels(&batch.input_ids, batch.seq_len);
        let loss = cross_entropy_forward_backward(&ctx, &logits, &labels, self.model.vocab_size())
            .map_err(TrainerError::at(step))?;
        if !loss.loss.is_finite() {
            return Err(at(format!("loss is {}", loss.loss)));
        }

        let grad_hidden = self
            .model
            .pseudo_gradient(&loss.grad_logits, rows)
            .map_err(TrainerError::at(step))?;
        for (_, layer) in adapter.iter_mut() {
            layer
                .backward(&ctx, &grad_hidden)
                .map_err(TrainerError::at(step))?;
        }

        let clip = {
            let mut grads: Vec<&mut [f32]> = adapter
                .iter_mut()
                .flat_map(|(_, layer)| layer.grads_mut())
                .collect();
            clip_by_global_norm(&ctx, &mut grads, self.config.max_grad_norm)
        };

        let learning_rate = self.lr_scheduler.current_lr();
        let optimizer = &self.config.optimizer;
        let adam = Adam8bitBuilder::new(learning_rate as f32)
            .with_betas((optimizer.beta1, optimizer.beta2))
            .with_eps(optimizer.eps)
            .with_weight_decay(optimizer.weight_decay)
            .build()
            .map_err(TrainerError::at(step))?;
        for (_, layer) in adapter.iter_mut() {
            layer
                .apply_optimizer(&ctx, &adam)
                .map_err(TrainerError::at(step))?;
        }
        self.lr_scheduler.step();

        let elapsed = started.elapsed();
        self.training_time += elapsed;
        let memory = ctx.memory_stats();
        let metrics = StepMetrics {
            step,
            loss: loss.loss,
            grad_norm: clip.norm,
            memory_usage_gb: memory.used_gb(),
            throughput: rows as f64 / elapsed.as_secs_f64().max(1e-9),
        };
        self.state.record(&metrics, memory);
        for callback in &mut self.callbacks {
            callback.on_step_end(&metrics);
        }

        let decision = self.rank_scheduler.update(&metrics);
        let rank_change = if decision.should_apply {
            self.apply_rank(step, &decision)
        } else {
            None
        };

        Ok(StepOutcome {
            metrics,
            learning_rate,
            batch_indices,
            decision,
            rank_change,
            finished: step >= self.state.total_steps,
        })
    }

    fn apply_rank(&mut self, step: usize, decision: &RankDecision) -> Option<RankChange> {
        let adapter = self.adapter.as_mut()?;
        let old_rank = adapter.rank();
        let new_rank = decision.recommended_rank;
        match adapter.reallocate(new_rank, &mut self.rng) {
            Ok(()) => {
                self.state.current_rank = new_rank;
                for callback in &mut self.callbacks {
                    callback.on_rank_change(step, old_rank, new_rank);
                }
                Some(RankChange {
                    step,
                    old_rank,
                    new_rank,
                    reason: decision.reason.clone(),
                })
            }
            Err(e) => {
                warn!(step, old_rank, new_rank, error = %e, "Rank reallocation failed, keeping current layout");
                self.rank_scheduler.rollback();
                None
            }
        }
    }

    /// Enter `Completed`, read the adapter back and release its buffers.
    pub fn complete(&mut self) -> Result<CompletionReport> {
        self.finish(None)
    }

    /// Like [`complete`](Self::complete), but first write the adapter to
    /// `path` and notify callbacks. A failed write leaves the session running.
    pub fn complete_and_save(&mut self, path: &Path) -> Result<CompletionReport> {
        self.finish(Some(path))
    }

    fn finish(&mut self, output: Option<&Path>) -> Result<CompletionReport> {
        if self.state.current_step < self.state.total_steps {
            return Err(TrainerError::InvalidTransition {
                from: self.state.status,
                to: TrainingStatus::Completed,
            });
        }
        let adapter_data = self.read_back()?;
        if let Some(path) = output {
            adapter_data.save(path)?;
            for callback in &mut self.callbacks {
                callback.on_save(path);
            }
        }
        self.state.transition(TrainingStatus::Completed)?;
        self.release();
        self.finish_callbacks();

        let report = CompletionReport {
            total_steps: self.state.current_step,
            final_loss: self.state.current_loss(),
            average_loss: self.state.average_loss(),
            average_throughput: self.state.average_throughput(),
            training_time: self.training_time.as_secs_f64(),
            rank_scheduler_stats: self.rank_scheduler.stats(),
            adapter_data,
        };
        info!(
            steps = report.total_steps,
            final_loss = report.final_loss,
            seconds = report.training_time,
            "Training completed"
        );
        Ok(report)
    }

    /// Host copy of the current adapter.
    pub fn read_back(&self) -> Result<AdapterData> {
        let adapter = self.adapter.as_ref().ok_or(TrainerError::NotRunning(self.state.status))?;
        let metadata = AdapterMetadata::new(
            adapter.rank(),
            adapter.alpha(),
            self.config.adapter.target_modules.clone(),
            self.model.name(),
        )
        .with_training(self.state.current_step, self.state.current_loss());
        let optimizer_state = if self.config.export_optimizer_state {
            adapter.read_back_optimizer_state()
        } else {
            Default::default()
        };
        Ok(AdapterData {
            metadata,
            layers: adapter.read_back(),
            optimizer_state,
        })
    }

    /// Run from `Initializing` or `Running` to `Completed`.
    ///
    /// A step failure moves the session to `Error` and is returned.
    pub fn run_to_completion(&mut self) -> Result<CompletionReport> {
        if self.state.status == TrainingStatus::Initializing {
            self.start()?;
        }
        loop {
            match self.step() {
                Ok(outcome) if outcome.finished => return self.complete(),
                Ok(_) => {}
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            }
        }
    }

    /// Estimated seconds remaining.
    pub fn eta(&self) -> Option<f64> {
        let remaining = self.state.total_steps.saturating_sub(self.state.current_step);
        let tokens_per_step = self.config.batch_size * self.config.sequence_length;
        let fallback = self
            .estimator
            .tokens_per_second(self.model.name(), self.state.current_rank);
        estimate_eta(
            remaining,
            tokens_per_step,
            self.state.recent_throughput(10),
            fallback,
        )
    }

    /// Progress report for `outcome`.
    pub fn progress_update(&self, outcome: &StepOutcome) -> ProgressUpdate {
        ProgressUpdate {
            step: outcome.metrics.step,
            total_steps: self.state.total_steps,
            progress: self.state.progress(),
            loss: outcome.metrics.loss,
            average_loss: self.state.average_loss().unwrap_or(outcome.metrics.loss),
            throughput: outcome.metrics.throughput,
            eta: self.eta(),
            memory_usage: outcome.metrics.memory_usage_gb,
            current_rank: self.state.current_rank,
            learning_rate: outcome.learning_rate,
            rank_decision: Some(outcome.decision.clone()),
        }
    }

    /// Status snapshot.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            is_training: self.state.status.is_active(),
            is_paused: self.state.status == TrainingStatus::Paused,
            status: self.state.status,
            current_step: self.state.current_step,
            total_steps: self.state.total_steps,
            progress: self.state.progress(),
            current_loss: self.state.current_loss(),
            memory_usage: self.ctx.memory_stats().used_gb(),
            eta: self.eta(),
            current_rank: Some(self.state.current_rank),
        }
    }
}

impl std::fmt::Debug for TrainingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingSession")
            .field("model", &self.model.name())
            .field("status", &self.state.status)
            .field("step", &self.state.current_step)
            .field("rank", &self.state.current_rank)
            .finish_non_exhaustive()
    }
}
