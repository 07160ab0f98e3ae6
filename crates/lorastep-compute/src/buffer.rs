//! Typed device buffers.
//!
//! Every buffer holds an [`Allocation`] against its context's memory budget,
//! so creation fails cleanly when the budget is exhausted and the memory is
//! returned when the buffer is dropped.

use bytemuck::{Pod, Zeroable};
use std::mem;

use crate::context::{Allocation, ComputeContext};
use crate::error::{ComputeError, Result};

/// Compute the byte size of `len` elements of `T`, guarding against overflow.
pub(crate) fn byte_size<T>(len: usize) -> Result<usize> {
    len.checked_mul(mem::size_of::<T>())
        .ok_or_else(|| ComputeError::BufferCreation {
            size: usize::MAX,
            reason: format!(
                "Buffer size overflow: {} elements * {} bytes/element",
                len,
                mem::size_of::<T>()
            ),
        })
}

/// A typed device buffer.
pub struct GpuBuffer<T: Pod + Zeroable> {
    data: Vec<T>,
    allocation: Allocation,
}

impl<T: Pod + Zeroable> GpuBuffer<T> {
    /// Create a new buffer initialized with zeros.
    pub fn zeros(ctx: &ComputeContext, len: usize) -> Result<Self> {
        let allocation = ctx.reserve(byte_size::<T>(len)? as u64)?;
        Ok(Self {
            data: vec![T::zeroed(); len],
            allocation,
        })
    }

    /// Create a new buffer from existing data.
    pub fn from_slice(ctx: &ComputeContext, data: &[T]) -> Result<Self> {
        let allocation = ctx.reserve(mem::size_of_val(data) as u64)?;
        Ok(Self {
            data: data.to_vec(),
            allocation,
        })
    }

    /// Get the number of elements in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size in bytes charged to the context.
    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.allocation.bytes()
    }

    /// Borrow the contents.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Borrow the contents mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Raw byte view of the contents.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// Copy `src` into the buffer; lengths must match.
    pub fn copy_from_slice(&mut self, src: &[T]) -> Result<()> {
        if src.len() != self.data.len() {
            return Err(ComputeError::BufferSizeMismatch {
                expected: self.data.len(),
                actual: src.len(),
            });
        }
        self.data.copy_from_slice(src);
        Ok(())
    }

    /// Fill the buffer with zeros.
    pub fn clear(&mut self) {
        self.data.fill(T::zeroed());
    }

    /// Read the contents back into host memory.
    pub fn to_vec(&self) -> Vec<T> {
        self.data.clone()
    }
}

impl<T: Pod + Zeroable + std::fmt::Debug> std::fmt::Debug for GpuBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("len", &self.data.len())
            .field("size_bytes", &self.allocation.bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextOptions;

    fn ctx(budget: u64) -> ComputeContext {
        ComputeContext::with_options(ContextOptions {
            name: "test".into(),
            num_threads: Some(1),
            memory_budget_bytes: budget,
        })
        .unwrap()
    }

    #[test]
    fn test_buffer_charges_budget() {
        let ctx = ctx(1024);
        let buffer = GpuBuffer::<f32>::zeros(&ctx, 16).unwrap();
        assert_eq!(buffer.size_bytes(), 64);
        assert_eq!(ctx.used_bytes(), 64);
        drop(buffer);
        assert_eq!(ctx.used_bytes(), 0);
    }

    #[test]
    fn test_buffer_over_budget() {
        let ctx = ctx(32);
        let err = GpuBuffer::<f32>::zeros(&ctx, 16).unwrap_err();
        assert!(matches!(err, ComputeError::OutOfMemory { .. }));
        assert_eq!(ctx.used_bytes(), 0);
    }

    #[test]
    fn test_copy_from_slice_checks_len() {
        let ctx = ctx(1024);
        let mut buffer = GpuBuffer::<f32>::from_slice(&ctx, &[1.0, 2.0]).unwrap();
        assert!(buffer.copy_from_slice(&[1.0]).is_err());
        buffer.copy_from_slice(&[3.0, 4.0]).unwrap();
        assert_eq!(buffer.to_vec(), vec![3.0, 4.0]);
        assert_eq!(buffer.as_bytes().len(), 8);
    }
}
