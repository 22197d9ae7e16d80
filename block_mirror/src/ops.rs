// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Operation records and the pure pieces of dispatch: COW alignment,
//! end-of-device clipping and rate-limiter cost accounting.

use block::bitmap::BitSet;
use block::{align_down, align_up};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MirrorMethod {
    Copy,
    Zero,
    Discard,
}

/// Progress of a two-stage copy; ZERO and DISCARD go straight to `Write`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpPhase {
    Read,
    Write,
}

/// Set-once output cell for the bytes an operation accounts for.
///
/// The dispatcher reads the value synchronously right after issuing the
/// operation, so it must be written before the first point at which the
/// dispatch path can process completions. Writing twice, or reading an
/// unset cell, is a bug and panics.
#[derive(Debug, Default)]
pub(crate) struct BytesHandled(Option<u64>);

impl BytesHandled {
    pub fn new() -> Self {
        BytesHandled(None)
    }

    pub fn set(&mut self, bytes: u64) {
        assert!(self.0.is_none(), "bytes_handled written twice");
        self.0 = Some(bytes);
    }

    pub fn get(&self) -> u64 {
        self.0.expect("bytes_handled read before it was set")
    }
}

pub(crate) struct Operation {
    pub id: u64,
    pub offset: u64,
    pub bytes: u64,
    /// Pool chunk indices backing a copy; empty for ZERO/DISCARD.
    pub chunks: Vec<usize>,
    pub method: MirrorMethod,
    pub phase: OpPhase,
    pub is_pseudo: bool,
    pub bytes_handled: BytesHandled,
}

impl Operation {
    pub fn new(id: u64, offset: u64, bytes: u64, method: MirrorMethod) -> Self {
        Operation {
            id,
            offset,
            bytes,
            chunks: Vec::new(),
            method,
            phase: if method == MirrorMethod::Copy {
                OpPhase::Read
            } else {
                OpPhase::Write
            },
            is_pseudo: false,
            bytes_handled: BytesHandled::new(),
        }
    }

    /// Placeholder reservation covering a coalesced range before its real
    /// sub-operations are dispatched; performs no I/O itself.
    pub fn new_pseudo(id: u64, offset: u64, bytes: u64) -> Self {
        Operation {
            id,
            offset,
            bytes,
            chunks: Vec::new(),
            method: MirrorMethod::Zero,
            phase: OpPhase::Write,
            is_pseudo: true,
            bytes_handled: BytesHandled::new(),
        }
    }
}

/// Clip `bytes` at `offset` to not exceed end-of-device.
pub(crate) fn clip_bytes(bdev_length: u64, offset: u64, bytes: u64) -> u64 {
    bytes.min(bdev_length - offset)
}

/// Expand a copy outward to target-cluster boundaries when either boundary
/// chunk has not been made self-contained on the target yet, so a partial
/// cluster write cannot leave undefined filler bytes. Returns the extra
/// tail bytes handled beyond the original request.
pub(crate) fn cow_align(
    cow_bitmap: &BitSet,
    granularity: u64,
    target_cluster_size: u64,
    max_bytes: u64,
    bdev_length: u64,
    offset: &mut u64,
    bytes: &mut u64,
) -> u64 {
    let need_cow = !cow_bitmap.is_set(*offset / granularity)
        || !cow_bitmap.is_set((*offset + *bytes - 1) / granularity);

    let mut align_offset = *offset;
    let mut align_bytes = *bytes;
    if need_cow {
        align_offset = align_down(*offset, target_cluster_size);
        align_bytes = align_up(*offset + *bytes, target_cluster_size) - align_offset;
    }

    if align_bytes > max_bytes {
        align_bytes = max_bytes;
        if need_cow {
            align_bytes = align_down(align_bytes, target_cluster_size);
        }
    }
    // Clipping may leave align_bytes unaligned to the cluster, but that
    // is already the end of the source image.
    align_bytes = clip_bytes(bdev_length, align_offset, align_bytes);

    let extra = (align_offset + align_bytes) as i64 - (*offset + *bytes) as i64;
    assert!(extra >= 0);
    *offset = align_offset;
    *bytes = align_bytes;
    extra as u64
}

/// Bytes a dispatched operation charges against the rate limiter: free for
/// ZERO/DISCARD when the target can zero by deallocating, full cost
/// otherwise.
pub(crate) fn accounted_bytes(method: MirrorMethod, write_zeroes_ok: bool, io_bytes: u64) -> u64 {
    if method != MirrorMethod::Copy && write_zeroes_ok {
        0
    } else {
        io_bytes
    }
}
