//! Compute device management.
//!
//! The device is a dedicated rayon thread pool plus a memory tracker that
//! enforces a byte budget on every buffer allocation. Kernels dispatch their
//! workgroups through [`ComputeContext::install`] so they never run on the
//! caller's threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use lorastep_core::MemoryStats;
use tracing::{debug, info};

use crate::error::{ComputeError, Result};
use crate::kernels::TILE_SIZE;

/// Global context singleton.
static GLOBAL_CONTEXT: OnceLock<Result<Arc<ComputeContext>>> = OnceLock::new();

/// Default memory budget: 4 GiB.
pub const DEFAULT_MEMORY_BUDGET: u64 = 4 * 1024 * 1024 * 1024;

/// Options used to create a [`ComputeContext`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Device name reported in properties and logs.
    pub name: String,
    /// Worker threads; `None` uses the available parallelism.
    pub num_threads: Option<usize>,
    /// Maximum bytes live across all buffers.
    pub memory_budget_bytes: u64,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            name: "cpu".to_string(),
            num_threads: None,
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET,
        }
    }
}

/// Properties of the compute device.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    /// Device name.
    pub name: String,
    /// Number of worker threads executing workgroups.
    pub num_threads: usize,
    /// Memory budget in bytes.
    pub memory_budget_bytes: u64,
    /// Reduction tile size used by the kernels.
    pub tile_size: usize,
}

#[derive(Debug)]
struct MemoryTracker {
    budget: u64,
    used: AtomicU64,
    peak: AtomicU64,
}

impl MemoryTracker {
    fn reserve(self: &Arc<Self>, bytes: u64) -> Result<Allocation> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current
                .checked_add(bytes)
                .filter(|next| *next <= self.budget)
                .ok_or(ComputeError::OutOfMemory {
                    requested: bytes,
                    available: self.budget.saturating_sub(current),
                })?;
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    return Ok(Allocation {
                        tracker: Arc::clone(self),
                        bytes,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// A reservation against the context's memory budget.
///
/// Released when dropped, so a buffer's memory is returned exactly when the
/// buffer goes away.
#[derive(Debug)]
pub struct Allocation {
    tracker: Arc<MemoryTracker>,
    bytes: u64,
}

impl Allocation {
    /// Reserved bytes.
    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.tracker.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Compute execution context.
///
/// Create once and share via `Arc`; all buffers allocated from it count
/// against its budget.
pub struct ComputeContext {
    pool: rayon::ThreadPool,
    memory: Arc<MemoryTracker>,
    properties: DeviceProperties,
}

impl ComputeContext {
    /// Get the global context, initializing it with default options if necessary.
    pub fn global() -> Result<Arc<ComputeContext>> {
        GLOBAL_CONTEXT
            .get_or_init(|| {
                ComputeContext::new().map(Arc::new).map_err(|e| {
                    tracing::error!("Failed to initialize compute context: {}", e);
                    e
                })
            })
            .clone()
    }

    /// Create a context with default options.
    pub fn new() -> Result<Self> {
        Self::with_options(ContextOptions::default())
    }

    /// Create a context with explicit options.
    pub fn with_options(options: ContextOptions) -> Result<Self> {
        let num_threads = match options.num_threads {
            Some(0) => {
                return Err(ComputeError::InvalidConfig(
                    "num_threads must be > 0".to_string(),
                ))
            }
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("lorastep-compute-{i}"))
            .build()
            .map_err(|e| ComputeError::NoDevice(e.to_string()))?;

        let properties = DeviceProperties {
            name: options.name,
            num_threads,
            memory_budget_bytes: options.memory_budget_bytes,
            tile_size: TILE_SIZE,
        };
        info!(
            device = %properties.name,
            threads = num_threads,
            budget_bytes = properties.memory_budget_bytes,
            "Initialized compute device"
        );
        debug!("Device properties: {:?}", properties);

        Ok(Self {
            pool,
            memory: Arc::new(MemoryTracker {
                budget: options.memory_budget_bytes,
                used: AtomicU64::new(0),
                peak: AtomicU64::new(0),
            }),
            properties,
        })
    }

    /// Get device properties.
    #[inline]
    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Run `op` on the device's worker pool.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// Reserve `bytes` against the memory budget.
    pub fn reserve(&self, bytes: u64) -> Result<Allocation> {
        self.memory.reserve(bytes)
    }

    /// Bytes currently allocated.
    #[inline]
    pub fn used_bytes(&self) -> u64 {
        self.memory.used.load(Ordering::Acquire)
    }

    /// Snapshot of the memory tracker.
    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            total_bytes: self.memory.budget,
            used_bytes: self.used_bytes(),
            peak_bytes: self.memory.peak.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("device", &self.properties.name)
            .field("threads", &self.properties.num_threads)
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_context(budget: u64) -> ComputeContext {
        ComputeContext::with_options(ContextOptions {
            name: "test".into(),
            num_threads: Some(2),
            memory_budget_bytes: budget,
        })
        .unwrap()
    }

    #[test]
    fn test_budget_enforced() {
        let ctx = small_context(1024);
        let first = ctx.reserve(512).unwrap();
        let err = ctx.reserve(600).unwrap_err();
        assert_eq!(
            err,
            ComputeError::OutOfMemory {
                requested: 600,
                available: 512
            }
        );

        drop(first);
        assert_eq!(ctx.used_bytes(), 0);
        assert!(ctx.reserve(600).is_ok());
    }

    #[test]
    fn test_peak_tracking() {
        let ctx = small_context(4096);
        {
            let _a = ctx.reserve(1000).unwrap();
            let _b = ctx.reserve(2000).unwrap();
        }
        let stats = ctx.memory_stats();
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.peak_bytes, 3000);
        assert_eq!(stats.total_bytes, 4096);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let result = ComputeContext::with_options(ContextOptions {
            num_threads: Some(0),
            ..Default::default()
        });
        assert!(matches!(result, Err(ComputeError::InvalidConfig(_))));
    }

    #[test]
    fn test_install_runs_on_pool() {
        let ctx = small_context(1024);
        let name = ctx.install(|| std::thread::current().name().map(str::to_string));
        assert!(name.unwrap_or_default().starts_with("lorastep-compute-"));
    }
}
