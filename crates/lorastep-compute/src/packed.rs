//! Sub-word packed buffers.
//!
//! Values narrower than 32 bits are packed into `u32` words. Writes are a
//! single atomic read-modify-write on the containing word, so workgroups may
//! update neighbouring lanes of the same word concurrently.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::buffer::byte_size;
use crate::context::{Allocation, ComputeContext};
use crate::error::Result;

/// Replace the `bits`-wide lane at `shift` within the word.
#[inline]
fn store_lane(word: &AtomicU32, shift: u32, mask: u32, value: u32) {
    let lane = (value & mask) << shift;
    let clear = !(mask << shift);
    let mut current = word.load(Ordering::Acquire);
    loop {
        let updated = (current & clear) | lane;
        match word.compare_exchange_weak(current, updated, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

#[inline]
fn load_lane(word: &AtomicU32, shift: u32, mask: u32) -> u32 {
    (word.load(Ordering::Acquire) >> shift) & mask
}

fn alloc_words(ctx: &ComputeContext, words: usize) -> Result<(Vec<AtomicU32>, Allocation)> {
    let allocation = ctx.reserve(byte_size::<u32>(words)? as u64)?;
    let words = (0..words).map(|_| AtomicU32::new(0)).collect();
    Ok((words, allocation))
}

/// Signed 4-bit values, eight per word.
#[derive(Debug)]
pub struct PackedNibbleBuffer {
    words: Vec<AtomicU32>,
    len: usize,
    _allocation: Allocation,
}

impl PackedNibbleBuffer {
    /// Values per 32-bit word.
    pub const VALUES_PER_WORD: usize = 8;

    /// Create a zero-filled buffer holding `len` nibbles.
    pub fn zeros(ctx: &ComputeContext, len: usize) -> Result<Self> {
        let (words, allocation) = alloc_words(ctx, len.div_ceil(Self::VALUES_PER_WORD))?;
        Ok(Self {
            words,
            len,
            _allocation: allocation,
        })
    }

    /// Number of values.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no values.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of backing words.
    #[inline]
    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    /// Read the value at `index`, sign-extended to `i8` in `[-8, 7]`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    #[inline]
    pub fn get(&self, index: usize) -> i8 {
        assert!(index < self.len, "nibble index {index} out of bounds ({})", self.len);
        let shift = ((index % Self::VALUES_PER_WORD) * 4) as u32;
        let raw = load_lane(&self.words[index / Self::VALUES_PER_WORD], shift, 0xF) as u8;
        // Sign-extend from 4 bits.
        ((raw << 4) as i8) >> 4
    }

    /// Store `value` at `index`. Only the low 4 bits of the two's complement
    /// representation are kept, so callers clamp to `[-8, 7]` first.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    #[inline]
    pub fn set(&self, index: usize, value: i8) {
        assert!(index < self.len, "nibble index {index} out of bounds ({})", self.len);
        debug_assert!((-8..=7).contains(&value));
        let shift = ((index % Self::VALUES_PER_WORD) * 4) as u32;
        store_lane(
            &self.words[index / Self::VALUES_PER_WORD],
            shift,
            0xF,
            value as u8 as u32,
        );
    }

    /// Copy of the raw packed words.
    pub fn words(&self) -> Vec<u32> {
        self.words.iter().map(|w| w.load(Ordering::Acquire)).collect()
    }
}

/// 8-bit values, four per word. Values can be read as signed or unsigned.
#[derive(Debug)]
pub struct PackedByteBuffer {
    words: Vec<AtomicU32>,
    len: usize,
    _allocation: Allocation,
}

impl PackedByteBuffer {
    /// Values per 32-bit word.
    pub const VALUES_PER_WORD: usize = 4;

    /// Create a zero-filled buffer holding `len` bytes.
    pub fn zeros(ctx: &ComputeContext, len: usize) -> Result<Self> {
        let (words, allocation) = alloc_words(ctx, len.div_ceil(Self::VALUES_PER_WORD))?;
        Ok(Self {
            words,
            len,
            _allocation: allocation,
        })
    }

    /// Number of values.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no values.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the byte at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    #[inline]
    pub fn get(&self, index: usize) -> u8 {
        assert!(index < self.len, "byte index {index} out of bounds ({})", self.len);
        let shift = ((index % Self::VALUES_PER_WORD) * 8) as u32;
        load_lane(&self.words[index / Self::VALUES_PER_WORD], shift, 0xFF) as u8
    }

    /// Store the byte at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    #[inline]
    pub fn set(&self, index: usize, value: u8) {
        assert!(index < self.len, "byte index {index} out of bounds ({})", self.len);
        let shift = ((index % Self::VALUES_PER_WORD) * 8) as u32;
        store_lane(
            &self.words[index / Self::VALUES_PER_WORD],
            shift,
            0xFF,
            u32::from(value),
        );
    }

    /// Read the byte at `index` as a signed value.
    #[inline]
    pub fn get_signed(&self, index: usize) -> i8 {
        self.get(index) as i8
    }

    /// Store a signed value at `index`.
    #[inline]
    pub fn set_signed(&self, index: usize, value: i8) {
        self.set(index, value as u8);
    }

    /// Reset every value to zero.
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    fn ctx() -> ComputeContext {
        ComputeContext::new().unwrap()
    }

    #[test]
    fn test_nibble_sign_extension() {
        let ctx = ctx();
        let buffer = PackedNibbleBuffer::zeros(&ctx, 10).unwrap();
        assert_eq!(buffer.num_words(), 2);

        for (i, v) in [-8i8, -1, 0, 7, 3, -5, 1, -2, 6, -7].into_iter().enumerate() {
            buffer.set(i, v);
        }
        let read: Vec<i8> = (0..10).map(|i| buffer.get(i)).collect();
        assert_eq!(read, vec![-8, -1, 0, 7, 3, -5, 1, -2, 6, -7]);
    }

    #[test]
    fn test_nibble_set_leaves_neighbours() {
        let ctx = ctx();
        let buffer = PackedNibbleBuffer::zeros(&ctx, 8).unwrap();
        for i in 0..8 {
            buffer.set(i, -1);
        }
        buffer.set(3, 2);
        assert_eq!(buffer.words()[0], 0xFFFF_2FFF);
    }

    #[test]
    fn test_concurrent_lane_writes() {
        let ctx = ctx();
        let buffer = PackedByteBuffer::zeros(&ctx, 4096).unwrap();
        ctx.install(|| {
            (0..4096usize)
                .into_par_iter()
                .for_each(|i| buffer.set(i, (i % 251) as u8));
        });
        assert!((0..4096).all(|i| buffer.get(i) == (i % 251) as u8));
    }

    #[test]
    fn test_concurrent_nibble_writes() {
        let ctx = ctx();
        let buffer = PackedNibbleBuffer::zeros(&ctx, 4096).unwrap();
        ctx.install(|| {
            (0..4096usize)
                .into_par_iter()
                .for_each(|i| buffer.set(i, (i % 15) as i8 - 7));
        });
        assert!((0..4096).all(|i| buffer.get(i) == (i % 15) as i8 - 7));
    }

    #[test]
    fn test_signed_bytes() {
        let ctx = ctx();
        let buffer = PackedByteBuffer::zeros(&ctx, 3).unwrap();
        buffer.set_signed(0, -127);
        buffer.set_signed(1, 127);
        buffer.set_signed(2, -1);
        assert_eq!(buffer.get_signed(0), -127);
        assert_eq!(buffer.get_signed(1), 127);
        assert_eq!(buffer.get(2), 255);

        buffer.clear();
        assert_eq!(buffer.get_signed(0), 0);
    }

    #[test]
    fn test_packed_memory_accounting() {
        let ctx = ctx();
        let before = ctx.used_bytes();
        let buffer = PackedNibbleBuffer::zeros(&ctx, 17).unwrap();
        assert_eq!(ctx.used_bytes() - before, 12);
        drop(buffer);
        assert_eq!(ctx.used_bytes(), before);
    }
}
