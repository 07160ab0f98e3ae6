//! Training callbacks for monitoring and logging.
//!
//! - [`LoggingCallback`]: structured `tracing` events every N steps
//! - [`MetricsJsonCallback`]: JSONL metrics file, one object per line
//! - [`HistoryCallback`]: shared in-memory step history

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lorastep_core::{StepMetrics, TrainingCallback};
use parking_lot::Mutex;

/// Logging callback for training metrics.
pub struct LoggingCallback {
    log_every: usize,
}

impl LoggingCallback {
    /// Log every `log_every` steps (at least 1).
    pub fn new(log_every: usize) -> Self {
        Self {
            log_every: log_every.max(1),
        }
    }
}

impl Default for LoggingCallback {
    fn default() -> Self {
        Self::new(10)
    }
}

impl TrainingCallback for LoggingCallback {
    fn on_train_start(&mut self) {
        tracing::info!("Training started");
    }

    fn on_train_end(&mut self) {
        tracing::info!("Training finished");
    }

    fn on_step_end(&mut self, metrics: &StepMetrics) {
        if metrics.step % self.log_every == 0 {
            tracing::info!(
                step = metrics.step,
                loss = metrics.loss,
                grad_norm = metrics.grad_norm,
                tokens_per_sec = metrics.throughput,
                memory_gb = metrics.memory_usage_gb,
                "Training step"
            );
        }
    }

    fn on_rank_change(&mut self, step: usize, old_rank: usize, new_rank: usize) {
        tracing::info!(step, old_rank, new_rank, "Adapter rank changed");
    }

    fn on_save(&mut self, path: &Path) {
        tracing::info!(path = %path.display(), "Adapter saved");
    }
}

/// JSONL metrics callback.
///
/// ```json
/// {"event": "step", "step": 1, "loss": 5.5, "grad_norm": 0.12, "timestamp": "2026-01-01T12:00:00Z"}
/// ```
pub struct MetricsJsonCallback {
    writer: BufWriter<File>,
    path: PathBuf,
    run_name: Option<String>,
}

impl MetricsJsonCallback {
    /// Create (truncating) the metrics file, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            run_name: None,
        })
    }

    /// Tag the `train_start` entry with a run name.
    pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }

    /// Path of the metrics file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entry(&mut self, mut entry: serde_json::Value) {
        entry["timestamp"] = serde_json::json!(chrono::Utc::now().to_rfc3339());
        if let Ok(line) = serde_json::to_string(&entry) {
            let _ = writeln!(self.writer, "{}", line);
        }
    }
}

impl TrainingCallback for MetricsJsonCallback {
    fn on_train_start(&mut self) {
        let mut entry = serde_json::json!({ "event": "train_start" });
        if let Some(ref name) = self.run_name {
            entry["run_name"] = serde_json::json!(name);
        }
        self.write_entry(entry);
        let _ = self.writer.flush();
    }

    fn on_train_end(&mut self) {
        self.write_entry(serde_json::json!({ "event": "train_end" }));
        let _ = self.writer.flush();
    }

    fn on_step_end(&mut self, metrics: &StepMetrics) {
        self.write_entry(serde_json::json!({
            "event": "step",
            "step": metrics.step,
            "loss": metrics.loss,
            "grad_norm": metrics.grad_norm,
            "throughput": metrics.throughput,
            "memory_gb": metrics.memory_usage_gb,
        }));
        if metrics.step % 10 == 0 {
            let _ = self.writer.flush();
        }
    }

    fn on_rank_change(&mut self, step: usize, old_rank: usize, new_rank: usize) {
        self.write_entry(serde_json::json!({
            "event": "rank_change",
            "step": step,
            "old_rank": old_rank,
            "new_rank": new_rank,
        }));
        let _ = self.writer.flush();
    }

    fn on_save(&mut self, path: &Path) {
        self.write_entry(serde_json::json!({
            "event": "adapter_saved",
            "path": path.display().to_string(),
        }));
        let _ = self.writer.flush();
    }
}

/// Records every step's metrics into a shared vector.
#[derive(Debug, Clone, Default)]
pub struct HistoryCallback {
    steps: Arc<Mutex<Vec<StepMetrics>>>,
}

impl HistoryCallback {
    /// New empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the recorded metrics.
    pub fn snapshot(&self) -> Vec<StepMetrics> {
        self.steps.lock().clone()
    }
}

impl TrainingCallback for HistoryCallback {
    fn on_step_end(&mut self, metrics: &StepMetrics) {
        self.steps.lock().push(*metrics);
    }
}
