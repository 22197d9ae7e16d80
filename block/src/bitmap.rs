// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Word-granularity bitmaps and chunk-granularity dirty tracking.
//!
//! `BitSet` is a plain fixed-size bitmap over `u64` words. `DirtyBitmap`
//! layers chunk ("granularity") semantics and an explicit lock on top, so
//! it can be shared between a block job and the live guest-write path.

use std::sync::{Mutex, MutexGuard};

/// Fixed-size bitmap over `u64` words.
#[derive(Clone, Debug)]
pub struct BitSet {
    words: Vec<u64>,
    nbits: u64,
}

impl BitSet {
    pub fn new(nbits: u64) -> Self {
        let nwords = nbits.div_ceil(64) as usize;
        BitSet {
            words: vec![0; nwords],
            nbits,
        }
    }

    pub fn len(&self) -> u64 {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    pub fn is_set(&self, bit: u64) -> bool {
        debug_assert!(bit < self.nbits);
        self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    pub fn set_range(&mut self, start: u64, count: u64) {
        debug_assert!(start + count <= self.nbits);
        for bit in start..start + count {
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn clear_range(&mut self, start: u64, count: u64) {
        debug_assert!(start + count <= self.nbits);
        for bit in start..start + count {
            self.words[(bit / 64) as usize] &= !(1 << (bit % 64));
        }
    }

    /// Index of the first set bit at or after `from`.
    pub fn next_set(&self, from: u64) -> Option<u64> {
        if from >= self.nbits {
            return None;
        }
        let mut word_idx = (from / 64) as usize;
        // Mask off bits below `from` in the first word.
        let mut word = self.words[word_idx] & (!0u64 << (from % 64));
        loop {
            if word != 0 {
                let bit = word_idx as u64 * 64 + word.trailing_zeros() as u64;
                return if bit < self.nbits { Some(bit) } else { None };
            }
            word_idx += 1;
            if word_idx >= self.words.len() {
                return None;
            }
            word = self.words[word_idx];
        }
    }

    pub fn any_set_in(&self, start: u64, count: u64) -> bool {
        match self.next_set(start) {
            Some(bit) => bit < start + count,
            None => false,
        }
    }

    pub fn count_set(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Raw word at `idx`, used by iterators taking a snapshot.
    fn word(&self, idx: usize) -> u64 {
        self.words.get(idx).copied().unwrap_or(0)
    }

    fn word_count(&self) -> usize {
        self.words.len()
    }
}

/// Chunk-granularity dirty tracking behind its own lock.
///
/// The lock is explicit because the bitmap is written both by the owning
/// block job and by the guest-write path, which run on different threads.
/// `set()`/`clear()` round outward to whole chunks, so a byte range is
/// never partially forgotten.
pub struct DirtyBitmap {
    granularity: u64,
    length: u64,
    inner: Mutex<BitSet>,
}

impl DirtyBitmap {
    pub fn new(length: u64, granularity: u64) -> Self {
        assert!(granularity.is_power_of_two());
        let chunks = length.div_ceil(granularity);
        DirtyBitmap {
            granularity,
            length,
            inner: Mutex::new(BitSet::new(chunks)),
        }
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn lock(&self) -> DirtyGuard<'_> {
        DirtyGuard {
            granularity: self.granularity,
            length: self.length,
            bits: self.inner.lock().unwrap(),
        }
    }

    pub fn set(&self, offset: u64, bytes: u64) {
        self.lock().set(offset, bytes)
    }

    pub fn clear(&self, offset: u64, bytes: u64) {
        self.lock().clear(offset, bytes)
    }

    pub fn is_dirty(&self, offset: u64) -> bool {
        self.lock().is_dirty(offset)
    }

    pub fn count_dirty_bytes(&self) -> u64 {
        self.lock().count_dirty_bytes()
    }

    pub fn iter(&self) -> DirtyIter {
        DirtyIter {
            next_chunk: 0,
            cached: None,
        }
    }
}

/// Locked view of a `DirtyBitmap`, for compound scan-and-clear sequences.
pub struct DirtyGuard<'a> {
    granularity: u64,
    length: u64,
    bits: MutexGuard<'a, BitSet>,
}

impl DirtyGuard<'_> {
    fn chunk_range(&self, offset: u64, bytes: u64) -> (u64, u64) {
        let start = (offset / self.granularity).min(self.bits.len());
        let end = (offset + bytes).div_ceil(self.granularity).min(self.bits.len());
        (start, end.saturating_sub(start))
    }

    pub fn set(&mut self, offset: u64, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let (start, count) = self.chunk_range(offset, bytes);
        self.bits.set_range(start, count);
    }

    pub fn clear(&mut self, offset: u64, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let (start, count) = self.chunk_range(offset, bytes);
        self.bits.clear_range(start, count);
    }

    pub fn is_dirty(&self, offset: u64) -> bool {
        self.bits.is_set(offset / self.granularity)
    }

    /// Number of dirty bytes, with the trailing partial chunk (if any)
    /// counted only up to the device length.
    pub fn count_dirty_bytes(&self) -> u64 {
        let mut bytes = self.bits.count_set() * self.granularity;
        let last_chunk = self.bits.len().saturating_sub(1);
        if !self.bits.is_empty()
            && self.bits.is_set(last_chunk)
            && (last_chunk + 1) * self.granularity > self.length
        {
            bytes -= (last_chunk + 1) * self.granularity - self.length;
        }
        bytes
    }

    /// Advance `iter` and return the next dirty byte offset.
    ///
    /// The iterator scans from a cached word snapshot; if bits in the
    /// snapshot were cleared since it was taken, the returned offset may be
    /// stale. Callers that depend on freshness must recheck `is_dirty()`
    /// and `seek()` the iterator to resynchronize.
    pub fn next_dirty(&self, iter: &mut DirtyIter) -> Option<u64> {
        loop {
            if let Some((word_idx, snapshot)) = iter.cached.as_mut() {
                if *snapshot != 0 {
                    let bit = snapshot.trailing_zeros() as u64;
                    *snapshot &= *snapshot - 1;
                    let chunk = *word_idx * 64 + bit;
                    if chunk >= self.bits.len() {
                        iter.cached = None;
                        return None;
                    }
                    return Some(chunk * self.granularity);
                }
                iter.cached = None;
            }

            // Refill the cache from the first non-empty word at or after
            // the cursor.
            let mut word_idx = (iter.next_chunk / 64) as usize;
            let mut word = self.bits.word(word_idx) & (!0u64 << (iter.next_chunk % 64));
            loop {
                if word != 0 {
                    iter.cached = Some((word_idx as u64, word));
                    iter.next_chunk = (word_idx as u64 + 1) * 64;
                    break;
                }
                word_idx += 1;
                if word_idx >= self.bits.word_count() {
                    return None;
                }
                word = self.bits.word(word_idx);
            }
        }
    }
}

/// Cursor over a `DirtyBitmap`, resumable across lock sections.
///
/// Holds a word snapshot so that it does not have to retake the scan from
/// the bitmap on every step; the snapshot can go stale under concurrent
/// clears (see `DirtyGuard::next_dirty`).
pub struct DirtyIter {
    next_chunk: u64,
    cached: Option<(u64, u64)>,
}

impl DirtyIter {
    /// Restart the cursor at `offset`, dropping any cached snapshot.
    pub fn seek(&mut self, offset: u64, granularity: u64) {
        self.next_chunk = offset / granularity;
        self.cached = None;
    }
}
