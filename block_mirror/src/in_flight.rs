// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! In-flight operation tracking: a busy-chunk bitmap for fast probing
//! plus an ordered table of live operation records for true byte-range
//! conflict detection.
//!
//! The bitmap alone is not enough: COW alignment can expand a request so
//! that two operations overlap at sub-chunk granularity without sharing a
//! dirty chunk, so conflict checks also walk the live records.

use std::collections::BTreeMap;

use block::bitmap::BitSet;

use crate::ops::Operation;

pub(crate) struct InFlightMap {
    busy: BitSet,
    ops: BTreeMap<u64, Operation>,
    /// Operation ids in registration order.
    order: Vec<u64>,
    count: usize,
    bytes: u64,
}

fn ranges_overlap(a_start: u64, a_len: u64, b_start: u64, b_len: u64) -> bool {
    a_start < b_start + b_len && b_start < a_start + a_len
}

impl InFlightMap {
    pub fn new(chunks: u64) -> Self {
        InFlightMap {
            busy: BitSet::new(chunks),
            ops: BTreeMap::new(),
            order: Vec::new(),
            count: 0,
            bytes: 0,
        }
    }

    /// Number of real (non-pseudo) operations in flight.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_busy(&self, chunk: u64) -> bool {
        self.busy.is_set(chunk)
    }

    pub fn claim(&mut self, first_chunk: u64, nb_chunks: u64) {
        self.busy.set_range(first_chunk, nb_chunks);
    }

    pub fn clear_claim(&mut self, first_chunk: u64, nb_chunks: u64) {
        self.busy
            .clear_range(first_chunk, nb_chunks.min(self.busy.len() - first_chunk));
    }

    pub fn insert(&mut self, op: Operation) {
        if !op.is_pseudo {
            self.count += 1;
            self.bytes += op.bytes;
        }
        self.order.push(op.id);
        let prev = self.ops.insert(op.id, op);
        debug_assert!(prev.is_none());
    }

    pub fn remove(&mut self, id: u64) -> Operation {
        let op = self.ops.remove(&id).expect("operation is registered");
        self.order.retain(|&o| o != id);
        if !op.is_pseudo {
            self.count -= 1;
            self.bytes -= op.bytes;
        }
        op
    }

    pub fn get(&self, id: u64) -> Option<&Operation> {
        self.ops.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Operation> {
        self.ops.get_mut(&id)
    }

    pub fn first_non_pseudo(&self) -> Option<u64> {
        self.order
            .iter()
            .copied()
            .find(|id| !self.ops[id].is_pseudo)
    }

    /// First live operation (other than `exclude`) whose claimed chunk
    /// range overlaps `[offset, offset + bytes)`. Probes the busy bitmap
    /// first, then walks the registration-ordered records.
    pub fn conflict(
        &self,
        granularity: u64,
        exclude: Option<u64>,
        offset: u64,
        bytes: u64,
    ) -> Option<u64> {
        let start_chunk = offset / granularity;
        let end_chunk = (offset + bytes).div_ceil(granularity).min(self.busy.len());
        if !self.busy.any_set_in(start_chunk, end_chunk - start_chunk) {
            return None;
        }
        for id in &self.order {
            if exclude == Some(*id) {
                continue;
            }
            let op = &self.ops[id];
            let op_start = op.offset / granularity;
            let op_end = (op.offset + op.bytes).div_ceil(granularity);
            if ranges_overlap(start_chunk, end_chunk - start_chunk, op_start, op_end - op_start) {
                return Some(*id);
            }
        }
        None
    }
}
