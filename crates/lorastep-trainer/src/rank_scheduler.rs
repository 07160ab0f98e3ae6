//! Adaptive LoRA rank scheduling.
//!
//! The scheduler sees every step's metrics and recommends a rank. Strategies:
//!
//! - **Fixed**: never changes the rank.
//! - **Progressive**: linear ramp from `min_rank` to `max_rank` over the
//!   progressive horizon.
//! - **Adaptive**: over a sliding window, grows the rank when the loss has
//!   stalled while gradients are healthy and shrinks it on vanishing or
//!   exploding gradients.
//! - **HardwareAware**: grows the rank when memory utilization is below the
//!   low watermark and throughput is healthy, shrinks it above the high
//!   watermark.
//!
//! Except under Fixed, two applied changes are always at least
//! `adaptation_cooldown` steps apart. Recommendations are clamped to
//! `[min_rank, max_rank]`.

use std::collections::VecDeque;

use lorastep_core::{
    AdapterConfig, LoraStepError, RankSchedulerConfig, RankStrategy, Result, StepMetrics,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A rank recommendation for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankDecision {
    /// Recommended rank, always within the configured bounds.
    pub recommended_rank: usize,
    /// Whether the caller should reallocate to `recommended_rank` now.
    pub should_apply: bool,
    /// Human-readable explanation.
    pub reason: String,
    /// Strength of the signal in `[0, 1]`.
    pub confidence: f64,
}

/// An applied rank change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankChange {
    /// Step at which the change was decided.
    pub step: usize,
    /// Rank before.
    pub old_rank: usize,
    /// Rank after.
    pub new_rank: usize,
    /// Reason from the decision.
    pub reason: String,
}

/// Summary of a scheduler's activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankSchedulerStats {
    /// Strategy in use.
    pub strategy: RankStrategy,
    /// Rank at session start.
    pub initial_rank: usize,
    /// Rank now.
    pub final_rank: usize,
    /// Smallest rank held.
    pub min_rank_seen: usize,
    /// Largest rank held.
    pub max_rank_seen: usize,
    /// Applied changes.
    pub adaptations: usize,
    /// Applied increases.
    pub increases: usize,
    /// Applied decreases.
    pub decreases: usize,
    /// Changes reverted because reallocation failed.
    pub rollbacks: usize,
    /// Recent applied changes, oldest first.
    pub changes: Vec<RankChange>,
}

/// Rank scheduler state.
#[derive(Debug, Clone)]
pub struct RankScheduler {
    config: RankSchedulerConfig,
    min_rank: usize,
    max_rank: usize,
    initial_rank: usize,
    current_rank: usize,
    horizon: usize,
    last_change_step: Option<usize>,
    pending_rollback: Option<(usize, Option<usize>)>,
    metrics: VecDeque<StepMetrics>,
    decisions: VecDeque<(usize, RankDecision)>,
    changes: VecDeque<RankChange>,
    min_rank_seen: usize,
    max_rank_seen: usize,
    increases: usize,
    decreases: usize,
    rollbacks: usize,
}

impl RankScheduler {
    /// Create a scheduler starting at `adapter.rank`.
    ///
    /// `total_steps` is the default progressive horizon.
    pub fn new(
        config: RankSchedulerConfig,
        adapter: &AdapterConfig,
        total_steps: usize,
    ) -> Result<Self> {
        config.validate()?;
        adapter.validate()?;
        if !(adapter.min_rank..=adapter.max_rank).contains(&adapter.rank) {
            return Err(LoraStepError::Config(format!(
                "rank {} outside [{}, {}]",
                adapter.rank, adapter.min_rank, adapter.max_rank
            )));
        }
        let horizon = config.progressive_horizon.unwrap_or(total_steps).max(1);
        Ok(Self {
            min_rank: adapter.min_rank,
            max_rank: adapter.max_rank,
            initial_rank: adapter.rank,
            current_rank: adapter.rank,
            horizon,
            last_change_step: None,
            pending_rollback: None,
            metrics: VecDeque::new(),
            decisions: VecDeque::new(),
            changes: VecDeque::new(),
            min_rank_seen: adapter.rank,
            max_rank_seen: adapter.rank,
            increases: 0,
            decreases: 0,
            rollbacks: 0,
            config,
        })
    }

    /// Rank the scheduler believes is allocated.
    #[inline]
    pub fn current_rank(&self) -> usize {
        self.current_rank
    }

    /// Strategy in use.
    pub fn strategy(&self) -> RankStrategy {
        self.config.strategy
    }

    /// Retained metrics entries.
    pub fn metrics_len(&self) -> usize {
        self.metrics.len()
    }

    /// Retained decisions with their step, oldest first.
    pub fn decisions(&self) -> impl Iterator<Item = &(usize, RankDecision)> {
        self.decisions.iter()
    }

    fn clamp(&self, rank: usize) -> usize {
        rank.clamp(self.min_rank, self.max_rank)
    }

    fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
        queue.push_back(item);
        while queue.len() > cap {
            queue.pop_front();
        }
    }

    /// Record `metrics` and recommend a rank.
    ///
    /// A decision with `should_apply = true` is assumed applied; call
    /// [`rollback`](Self::rollback) if reallocation fails.
    pub fn update(&mut self, metrics: &StepMetrics) -> RankDecision {
        Self::push_bounded(&mut self.metrics, *metrics, self.config.max_history);
        self.pending_rollback = None;

        let (target, reason, confidence) = match self.config.strategy {
            RankStrategy::Fixed => (self.current_rank, "fixed strategy".to_string(), 1.0),
            RankStrategy::Progressive => self.progressive(metrics.step),
            RankStrategy::Adaptive => self.adaptive(),
            RankStrategy::HardwareAware => self.hardware_aware(metrics),
        };
        let target = self.clamp(target);

        let decision = if target == self.current_rank {
            RankDecision {
                recommended_rank: target,
                should_apply: false,
                reason,
                confidence,
            }
        } else if let Some(since) = self
            .last_change_step
            .map(|last| metrics.step.saturating_sub(last))
            .filter(|since| *since < self.config.adaptation_cooldown)
        {
            RankDecision {
                recommended_rank: target,
                should_apply: false,
                reason: format!(
                    "cooldown: {since} of {} steps since last change ({reason})",
                    self.config.adaptation_cooldown
                ),
                confidence,
            }
        } else {
            self.apply(metrics.step, target, &reason);
            RankDecision {
                recommended_rank: target,
                should_apply: true,
                reason,
                confidence,
            }
        };

        debug!(
            step = metrics.step,
            rank = decision.recommended_rank,
            apply = decision.should_apply,
            reason = %decision.reason,
            "Rank decision"
        );
        Self::push_bounded(
            &mut self.decisions,
            (metrics.step, decision.clone()),
            self.config.max_history,
        );
        decision
    }

    fn apply(&mut self, step: usize, new_rank: usize, reason: &str) {
        let old_rank = self.current_rank;
        self.pending_rollback = Some((old_rank, self.last_change_step));
        self.current_rank = new_rank;
        self.last_change_step = Some(step);
        if new_rank > old_rank {
            self.increases += 1;
        } else {
            self.decreases += 1;
        }
        self.min_rank_seen = self.min_rank_seen.min(new_rank);
        self.max_rank_seen = self.max_rank_seen.max(new_rank);
        Self::push_bounded(
            &mut self.changes,
            RankChange {
                step,
                old_rank,
                new_rank,
                reason: reason.to_string(),
            },
            self.config.max_history,
        );
        info!(step, old_rank, new_rank, reason, "Rank change recommended");
    }

    /// Revert the change applied by the latest [`update`](Self::update).
    ///
    /// Returns the restored rank, or `None` when the latest decision applied
    /// nothing.
    pub fn rollback(&mut self) -> Option<usize> {
        let (rank, last_change) = self.pending_rollback.take()?;
        if self.current_rank > rank {
            self.increases -= 1;
        } else {
            self.decreases -= 1;
        }
        self.changes.pop_back();
        self.current_rank = rank;
        self.last_change_step = last_change;
        self.rollbacks += 1;
        Some(rank)
    }

    fn progressive(&self, step: usize) -> (usize, String, f64) {
        let progress = (step as f64 / self.horizon as f64).min(1.0);
        let span = (self.max_rank - self.min_rank) as f64;
        let target = self.min_rank + (span * progress).floor() as usize;
        (
            target,
            format!("progressive ramp at {:.0}% of horizon", progress * 100.0),
            1.0,
        )
    }

    fn adaptive(&self) -> (usize, String, f64) {
        let window = self.config.window_size;
        if self.metrics.len() < window {
            return (
                self.current_rank,
                format!("collecting metrics ({}/{window})", self.metrics.len()),
                0.0,
            );
        }
        let recent: Vec<&StepMetrics> = self.metrics.iter().skip(self.metrics.len() - window).collect();
        let mean_grad = recent.iter().map(|m| m.grad_norm).sum::<f64>() / window as f64;
        let step = self.config.rank_step;

        if mean_grad < self.config.vanishing_grad_norm {
            let confidence = 1.0 - mean_grad / self.config.vanishing_grad_norm;
            return (
                self.current_rank.saturating_sub(step),
                format!("vanishing gradients (mean norm {mean_grad:.2e})"),
                confidence.clamp(0.0, 1.0),
            );
        }
        if mean_grad > self.config.exploding_grad_norm {
            let confidence = 1.0 - self.config.exploding_grad_norm / mean_grad;
            return (
                self.current_rank.saturating_sub(step),
                format!("exploding gradients (mean norm {mean_grad:.2e})"),
                confidence.clamp(0.0, 1.0),
            );
        }

        let half = window / 2;
        let mean_loss = |items: &[&StepMetrics]| {
            items.iter().map(|m| m.loss).sum::<f64>() / items.len().max(1) as f64
        };
        let early = mean_loss(&recent[..half]);
        let late = mean_loss(&recent[half..]);
        let improvement = (early - late) / early.abs().max(f64::EPSILON);
        if improvement < self.config.stall_threshold {
            let confidence = (self.config.stall_threshold - improvement) / self.config.stall_threshold;
            (
                self.current_rank + step,
                format!("loss stalled ({:.2}% improvement) with healthy gradients", improvement * 100.0),
                confidence.clamp(0.0, 1.0),
            )
        } else {
            (
                self.current_rank,
                format!("loss improving ({:.2}%)", improvement * 100.0),
                0.0,
            )
        }
    }

    fn hardware_aware(&self, metrics: &StepMetrics) -> (usize, String, f64) {
        let utilization = metrics.memory_usage_gb / self.config.target_memory_usage_gb;
        let step = self.config.rank_step;
        let high = self.config.memory_high_watermark;
        let low = self.config.memory_low_watermark;

        if utilization > high {
            let confidence = ((utilization - high) / (1.0 - high).max(f64::EPSILON)).clamp(0.0, 1.0);
            return (
                self.current_rank.saturating_sub(step),
                format!("memory utilization {:.0}% above {:.0}%", utilization * 100.0, high * 100.0),
                confidence,
            );
        }
        if utilization < low {
            let mean_throughput = self.metrics.iter().map(|m| m.throughput).sum::<f64>()
                / self.metrics.len().max(1) as f64;
            let healthy = mean_throughput <= 0.0
                || metrics.throughput >= self.config.min_throughput_ratio * mean_throughput;
            if healthy {
                return (
                    self.current_rank + step,
                    format!("memory utilization {:.0}% below {:.0}%", utilization * 100.0, low * 100.0),
                    ((low - utilization) / low).clamp(0.0, 1.0),
                );
            }
            return (
                self.current_rank,
                "memory available but throughput degraded".to_string(),
                0.0,
            );
        }
        (
            self.current_rank,
            format!("memory utilization {:.0}% within bounds", utilization * 100.0),
            0.0,
        )
    }

    /// Summary of adaptations so far.
    pub fn stats(&self) -> RankSchedulerStats {
        RankSchedulerStats {
            strategy: self.config.strategy,
            initial_rank: self.initial_rank,
            final_rank: self.current_rank,
            min_rank_seen: self.min_rank_seen,
            max_rank_seen: self.max_rank_seen,
            adaptations: self.increases + self.decreases,
            increases: self.increases,
            decreases: self.decreases,
            rollbacks: self.rollbacks,
            changes: self.changes.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn adapter(rank: usize, min_rank: usize, max_rank: usize) -> AdapterConfig {
        AdapterConfig {
            rank,
            min_rank,
            max_rank,
            ..Default::default()
        }
    }

    fn metrics(step: usize, loss: f64, grad_norm: f64, memory_usage_gb: f64) -> StepMetrics {
        StepMetrics {
            step,
            loss,
            grad_norm,
            memory_usage_gb,
            throughput: 1000.0,
        }
    }

    fn scheduler(strategy: RankStrategy, rank: usize) -> RankScheduler {
        let config = RankSchedulerConfig {
            strategy,
            ..Default::default()
        };
        RankScheduler::new(config, &adapter(rank, 4, 16), 100).unwrap()
    }

    #[test]
    fn test_fixed_never_changes() {
        let mut s = scheduler(RankStrategy::Fixed, 8);
        for step in 1..=200 {
            let d = s.update(&metrics(step, 1.0, 1e-9, 100.0));
            assert!(!d.should_apply);
            assert_eq!(d.recommended_rank, 8);
        }
        assert_eq!(s.stats().adaptations, 0);
    }

    /// Starts at `max_rank`, so the growth recommended below the low
    /// watermark clamps to the current rank and only the decrease applies.
    #[test]
    fn test_hardware_aware_memory_ramp() {
        let config = RankSchedulerConfig {
            strategy: RankStrategy::HardwareAware,
            target_memory_usage_gb: 4.0,
            ..Default::default()
        };
        let mut s = RankScheduler::new(config, &adapter(16, 4, 16), 20).unwrap();

        let mut applied = Vec::new();
        for i in 0..20 {
            let memory = 1.0 + 3.5 * i as f64 / 19.0;
            let d = s.update(&metrics(i + 1, 2.0, 1.0, memory));
            assert!((4..=16).contains(&d.recommended_rank));
            if d.should_apply {
                applied.push((memory, d));
            }
        }

        assert_eq!(applied.len(), 1);
        let (memory, decision) = &applied[0];
        assert!(memory / 4.0 > 0.9);
        assert!(decision.recommended_rank < 16);
        assert_eq!(s.current_rank(), decision.recommended_rank);
    }

    #[test]
    fn test_hardware_aware_grows_holds_and_shrinks() {
        let config = RankSchedulerConfig {
            strategy: RankStrategy::HardwareAware,
            target_memory_usage_gb: 4.0,
            ..Default::default()
        };
        let mut s = RankScheduler::new(config, &adapter(8, 4, 16), 200).unwrap();

        let low = s.update(&metrics(1, 1.0, 1.0, 1.0));
        assert!(low.should_apply);
        assert_eq!(low.recommended_rank, 10);
        assert_eq!(s.current_rank(), 10);

        let within = s.update(&metrics(60, 1.0, 1.0, 3.2));
        assert!(!within.should_apply);
        assert_eq!(within.recommended_rank, 10);
        assert!(within.reason.contains("within bounds"), "{}", within.reason);

        let high = s.update(&metrics(120, 1.0, 1.0, 3.9));
        assert!(high.should_apply);
        assert_eq!(high.recommended_rank, 8);

        let stats = s.stats();
        assert_eq!((stats.increases, stats.decreases), (1, 1));
        assert_eq!((stats.min_rank_seen, stats.max_rank_seen), (8, 10));
    }

    #[test]
    fn test_cooldown_suppresses_second_change() {
        let mut s = scheduler(RankStrategy::HardwareAware, 8);
        let first = s.update(&metrics(1, 1.0, 1.0, 3.9));
        assert!(first.should_apply);
        assert_eq!(first.recommended_rank, 6);

        let second = s.update(&metrics(10, 1.0, 1.0, 3.9));
        assert!(!second.should_apply);
        assert_eq!(second.recommended_rank, 4);
        assert!(second.reason.starts_with("cooldown"), "{}", second.reason);
        assert_eq!(s.current_rank(), 6);

        let third = s.update(&metrics(51, 1.0, 1.0, 3.9));
        assert!(third.should_apply);
        assert_eq!(s.current_rank(), 4);
    }

    #[test]
    fn test_progressive_ramp() {
        let config = RankSchedulerConfig {
            strategy: RankStrategy::Progressive,
            adaptation_cooldown: 10,
            ..Default::default()
        };
        let mut s = RankScheduler::new(config, &adapter(4, 4, 16), 100).unwrap();
        let mut ranks = Vec::new();
        for step in 1..=120 {
            if s.update(&metrics(step, 1.0, 1.0, 1.0)).should_apply {
                ranks.push(s.current_rank());
            }
        }
        assert!(ranks.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(s.current_rank(), 16);
    }

    #[test]
    fn test_adaptive_vanishing_gradients() {
        let mut s = scheduler(RankStrategy::Adaptive, 8);
        let mut decisions = Vec::new();
        for step in 1..=10 {
            decisions.push(s.update(&metrics(step, 2.0 - step as f64 * 0.1, 1e-7, 1.0)));
        }
        assert!(decisions[..9].iter().all(|d| !d.should_apply));
        assert!(decisions[9].should_apply);
        assert_eq!(decisions[9].recommended_rank, 6);
        assert!(decisions[9].reason.contains("vanishing"));
    }

    #[test]
    fn test_adaptive_stall_grows_rank() {
        let mut s = scheduler(RankStrategy::Adaptive, 8);
        let mut last = None;
        for step in 1..=10 {
            last = Some(s.update(&metrics(step, 2.0, 0.5, 1.0)));
        }
        let d = last.unwrap();
        assert!(d.should_apply);
        assert_eq!(d.recommended_rank, 10);
    }

    #[test]
    fn test_rollback_restores_rank_and_cooldown() {
        let mut s = scheduler(RankStrategy::HardwareAware, 8);
        assert!(s.update(&metrics(1, 1.0, 1.0, 3.9)).should_apply);
        assert_eq!(s.rollback(), Some(8));
        assert_eq!(s.current_rank(), 8);
        assert_eq!(s.rollback(), None);

        // The reverted change does not start a cooldown.
        assert!(s.update(&metrics(2, 1.0, 1.0, 3.9)).should_apply);
        let stats = s.stats();
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.decreases, 1);
        assert_eq!(stats.changes.len(), 1);
    }

    #[test]
    fn test_history_bounded() {
        let config = RankSchedulerConfig {
            strategy: RankStrategy::Adaptive,
            max_history: 20,
            ..Default::default()
        };
        let mut s = RankScheduler::new(config, &adapter(8, 4, 16), 100).unwrap();
        for step in 1..=500 {
            s.update(&metrics(step, 1.0, 0.5, 1.0));
        }
        assert_eq!(s.metrics_len(), 20);
        assert_eq!(s.decisions().count(), 20);
        assert_eq!(s.decisions().next().map(|(step, _)| *step), Some(481));
    }

    #[test]
    fn test_initial_rank_out_of_bounds() {
        let result = RankScheduler::new(RankSchedulerConfig::default(), &adapter(32, 4, 16), 10);
        assert!(matches!(result, Err(LoraStepError::Config(_))));
    }

    fn strategy() -> impl Strategy<Value = RankStrategy> {
        prop_oneof![
            Just(RankStrategy::Fixed),
            Just(RankStrategy::Progressive),
            Just(RankStrategy::Adaptive),
            Just(RankStrategy::HardwareAware),
        ]
    }

    proptest! {
        #[test]
        fn prop_recommendations_within_bounds(
            strategy in strategy(),
            min_rank in 1usize..8,
            span in 0usize..24,
            cooldown in 0usize..20,
            samples in prop::collection::vec((0.0f64..10.0, 0.0f64..50.0, 0.0f64..8.0, 0.0f64..2000.0), 1..120),
        ) {
            let max_rank = min_rank + span;
            let config = RankSchedulerConfig {
                strategy,
                adaptation_cooldown: cooldown,
                window_size: 4,
                ..Default::default()
            };
            let mut s = RankScheduler::new(config, &adapter(min_rank, min_rank, max_rank), samples.len()).unwrap();
            for (i, (loss, grad_norm, memory, throughput)) in samples.into_iter().enumerate() {
                let d = s.update(&StepMetrics {
                    step: i + 1,
                    loss,
                    grad_norm,
                    memory_usage_gb: memory,
                    throughput,
                });
                prop_assert!(d.recommended_rank >= min_rank && d.recommended_rank <= max_rank);
                prop_assert!(s.current_rank() >= min_rank && s.current_rank() <= max_rank);
            }
        }
    }
}
