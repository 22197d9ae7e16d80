// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! The mirror job proper: operation dispatch, the completion pump, the
//! scheduler iteration and the convergence run loop.
//!
//! The job owns all engine state and runs on its worker thread. Waiting
//! for buffers, for a conflicting range to clear or for a concurrency
//! slot means processing completions until the awaited condition holds;
//! since each processed completion re-runs the full condition check,
//! waiters are effectively restarted broadcast-style.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use block::bitmap::{BitSet, DirtyBitmap, DirtyIter};
use block::graph::{BlockHandle, Graph, Node};
use block_jobs::{ErrorAction, IoStatus, JobCtx, OnError};
use rate_limiter::RateLimiter;

use crate::buffer_pool::BufferPool;
use crate::exit::{mirror_exit, ExitData};
use crate::in_flight::InFlightMap;
use crate::ops::{
    accounted_bytes, clip_bytes, cow_align, BytesHandled, MirrorMethod, OpPhase, Operation,
};
use crate::BackingMode;

pub(crate) const SLICE_TIME: Duration = Duration::from_millis(100);
pub(crate) const MAX_IN_FLIGHT: usize = 16;
pub(crate) const MAX_IO_BYTES: u64 = 1 << 20;
pub(crate) const DEFAULT_MIRROR_BUF_SIZE: u64 = MAX_IN_FLIGHT as u64 * MAX_IO_BYTES;
pub(crate) const DEFAULT_GRANULARITY: u64 = 65536;

pub(crate) const REPLACE_BLOCKER_REASON: &str = "block device is in use by block-job-complete";

/// Token reserved for target flushes; operation ids stay well below it.
const TOKEN_FLUSH: u64 = 1 << 62;

/// Upper bound for a blocking pump step; waiters re-check their condition
/// after every step, so a missed wakeup only costs latency.
const PUMP_WAIT_MS: i32 = 50;

/// Largest span handled per step of the initialization scans.
const MAX_SCAN_BYTES: u64 = 1 << 30;

/// State shared between the job thread and the controlling handle.
pub(crate) struct MirrorShared {
    pub synced: AtomicBool,
    pub should_complete: AtomicBool,
    pub to_replace: Mutex<Option<Arc<Node>>>,
}

impl MirrorShared {
    pub fn new(auto_complete: bool) -> Arc<Self> {
        Arc::new(MirrorShared {
            synced: AtomicBool::new(false),
            should_complete: AtomicBool::new(auto_complete),
            to_replace: Mutex::new(None),
        })
    }
}

/// Everything `start()` hands to the worker thread.
pub(crate) struct MirrorSetup {
    pub graph: Arc<Graph>,
    pub mirror_top: Arc<Node>,
    pub source: Arc<Node>,
    pub target: Arc<BlockHandle>,
    pub target_node: Arc<Node>,
    pub job_blk: Arc<BlockHandle>,
    pub base: Option<Arc<Node>>,
    pub is_none_mode: bool,
    pub backing_mode: BackingMode,
    pub on_source_error: OnError,
    pub on_target_error: OnError,
    pub unmap: bool,
    pub granularity: u64,
    pub buf_size: u64,
    pub dirty_bitmap: Arc<DirtyBitmap>,
    pub shared: Arc<MirrorShared>,
}

struct Poller {
    epoll_file: File,
}

impl Poller {
    fn new(fds: &[RawFd]) -> io::Result<Self> {
        let epoll_fd = epoll::create(true)?;
        // Use 'File' to enforce closing on 'epoll_fd'
        // SAFETY: epoll_fd is a valid fd
        let epoll_file = unsafe { File::from_raw_fd(epoll_fd) };
        for (i, fd) in fds.iter().enumerate() {
            epoll::ctl(
                epoll_file.as_raw_fd(),
                epoll::ControlOptions::EPOLL_CTL_ADD,
                *fd,
                epoll::Event::new(epoll::Events::EPOLLIN, i as u64),
            )?;
        }
        Ok(Poller { epoll_file })
    }

    fn wait(&self, timeout_ms: i32) {
        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); 4];
        match epoll::wait(self.epoll_file.as_raw_fd(), timeout_ms, &mut events) {
            Ok(_) => (),
            Err(e) => {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!("mirror: epoll_wait failed: {e}");
                }
            }
        }
    }
}

pub(crate) struct MirrorJob {
    ctx: JobCtx,
    graph: Arc<Graph>,
    source: Arc<Node>,
    target: Arc<BlockHandle>,
    target_node: Arc<Node>,
    base: Option<Arc<Node>>,
    is_none_mode: bool,
    on_source_error: OnError,
    on_target_error: OnError,
    unmap: bool,
    granularity: u64,
    buf_size: u64,
    bdev_length: u64,
    target_cluster_size: u64,
    max_iov: usize,
    dirty_bitmap: Arc<DirtyBitmap>,
    dbi: DirtyIter,
    cow_bitmap: Option<BitSet>,
    pool: BufferPool,
    in_flight: InFlightMap,
    limit: RateLimiter,
    cur_speed: u64,
    last_pause: Instant,
    ret: i32,
    initial_zeroing_ongoing: bool,
    next_op_id: u64,
    flush_result: Option<i32>,
    poller: Poller,
    shared: Arc<MirrorShared>,
}

impl MirrorJob {
    // ---- completion pump ----

    fn drain_completions(&mut self) -> bool {
        let mut progressed = false;
        loop {
            let mut batch = Vec::new();
            while let Some(completion) = self.source.poll_completion() {
                batch.push(completion);
            }
            while let Some(completion) = self.target_node.poll_completion() {
                batch.push(completion);
            }
            if batch.is_empty() {
                break;
            }
            progressed = true;
            for (token, result) in batch {
                self.on_completion(token, result);
            }
        }
        progressed
    }

    /// One blocking pump step: process pending completions, or wait for
    /// some to arrive (bounded) and process those.
    fn pump_blocking(&mut self) {
        if self.drain_completions() {
            return;
        }
        self.poller.wait(PUMP_WAIT_MS);
        self.source.clear_notifier();
        self.target_node.clear_notifier();
        self.ctx.clear_kick();
        self.drain_completions();
    }

    fn on_completion(&mut self, token: u64, result: i32) {
        if token == TOKEN_FLUSH {
            self.flush_result = Some(result);
            return;
        }
        let Some(op) = self.in_flight.get(token) else {
            warn!("mirror: spurious completion for token {token}");
            return;
        };
        match (op.method, op.phase) {
            (MirrorMethod::Copy, OpPhase::Read) => {
                if result < 0 {
                    self.io_failed(token, true, result);
                    return;
                }
                let (offset, bytes, chunks) = {
                    let op = self.in_flight.get_mut(token).unwrap();
                    op.phase = OpPhase::Write;
                    (op.offset, op.bytes, op.chunks.clone())
                };
                let iovecs = self.pool.iovecs(&chunks, bytes);
                if self
                    .target
                    .submit_write_vectored(offset, &iovecs, token)
                    .is_err()
                {
                    self.io_failed(token, false, -libc::EIO);
                }
            }
            _ => {
                if result < 0 {
                    self.io_failed(token, false, result);
                } else {
                    self.iteration_done(token, result);
                }
            }
        }
    }

    /// Completion-path error handling: re-dirty the range so it will be
    /// retried, consult the policy, then tear the operation down.
    fn io_failed(&mut self, token: u64, is_read: bool, result: i32) {
        let (offset, bytes) = {
            let op = self.in_flight.get(token).unwrap();
            (op.offset, op.bytes)
        };
        self.dirty_bitmap.set(offset, bytes);
        let action = self.error_action(is_read, -result);
        if action == ErrorAction::Report && self.ret >= 0 {
            self.ret = result;
        }
        self.iteration_done(token, result);
    }

    fn error_action(&mut self, is_read: bool, errno: i32) -> ErrorAction {
        self.shared.synced.store(false, Ordering::Release);
        let policy = if is_read {
            self.on_source_error
        } else {
            self.on_target_error
        };
        let action = block_jobs::error_action(policy, errno);
        if action == ErrorAction::Stop {
            self.ctx.set_iostatus(IoStatus::from_errno(errno));
            self.ctx.request_pause();
        }
        action
    }

    /// Final bookkeeping for a finished operation. Buffer chunks return to
    /// the pool and the range's claim is dropped in the same step, so no
    /// intermediate state is observable by conflicting operations.
    fn iteration_done(&mut self, token: u64, result: i32) {
        let op = self.in_flight.remove(token);
        debug_assert!(!op.is_pseudo);
        // Reading the cell is the checked precondition: it must have been
        // written before the operation first waited.
        let handled = op.bytes_handled.get();
        trace!(
            "mirror: op {} [{:#x}, +{:#x}) done, handled {:#x}, in_flight {}, ret {}",
            token,
            op.offset,
            op.bytes,
            handled,
            self.in_flight.count(),
            result
        );
        self.pool.release(&op.chunks);
        let chunk = op.offset / self.granularity;
        let nb_chunks = op.bytes.div_ceil(self.granularity);
        self.in_flight.clear_claim(chunk, nb_chunks);
        if result >= 0 {
            if let Some(cow) = &mut self.cow_bitmap {
                cow.set_range(chunk, nb_chunks);
            }
            if !self.initial_zeroing_ongoing {
                self.ctx.add_progress(op.bytes);
            }
        }
    }

    // ---- waiting primitives ----

    /// Wait for some in-flight operation to complete. There must be a real
    /// operation in flight: pseudo operations cannot be waited on, because
    /// they complete only when their dispatch loop (possibly the caller)
    /// makes progress.
    fn wait_for_free_slot(&mut self) {
        assert!(
            self.in_flight.first_non_pseudo().is_some(),
            "no real in-flight operation to wait on"
        );
        self.pump_blocking();
    }

    fn wait_for_all_io(&mut self) {
        while self.in_flight.count() > 0 {
            self.wait_for_free_slot();
        }
    }

    /// Wait until no in-flight operation overlaps `[offset, offset+bytes)`.
    /// Re-scans from the top after every completion, since several
    /// overlapping operations may drain one after another; gives up early
    /// once the job carries a fatal error.
    fn wait_for_no_conflict(&mut self, exclude: Option<u64>, offset: u64, bytes: u64) {
        while self.ret >= 0 {
            if self
                .in_flight
                .conflict(self.granularity, exclude, offset, bytes)
                .is_none()
            {
                break;
            }
            self.pump_blocking();
        }
    }

    fn pause_point(&mut self) {
        if self.ctx.should_pause() {
            // Pausing first quiesces our own I/O; resumption is implicit
            // in the next loop iteration.
            self.wait_for_all_io();
            self.ctx.pause_point(|| ());
        }
    }

    fn throttle(&mut self) {
        if self.last_pause.elapsed() > SLICE_TIME {
            self.last_pause = Instant::now();
            self.ctx.sleep_ns(0);
        } else {
            self.pause_point();
        }
    }

    // ---- dispatch ----

    fn alloc_op_id(&mut self) -> u64 {
        let id = self.next_op_id;
        self.next_op_id += 1;
        debug_assert!(id < TOKEN_FLUSH);
        id
    }

    /// Dispatch one operation and return the bytes handled from the
    /// requested offset (which can exceed the request for COPY when COW
    /// alignment expands the tail).
    fn perform(&mut self, offset: u64, bytes: u64, method: MirrorMethod) -> u64 {
        match method {
            MirrorMethod::Copy => self.dispatch_copy(offset, bytes),
            MirrorMethod::Zero | MirrorMethod::Discard => {
                self.dispatch_zero_or_discard(offset, bytes, method)
            }
        }
    }

    fn dispatch_copy(&mut self, mut offset: u64, mut bytes: u64) -> u64 {
        let id = self.alloc_op_id();
        let max_bytes = self.granularity * self.max_iov as u64;

        // We can only handle as much as buf_size at a time.
        bytes = bytes.min(self.buf_size).min(max_bytes);
        assert!(bytes > 0);

        let mut handled = bytes;
        if let Some(cow) = &self.cow_bitmap {
            handled += cow_align(
                cow,
                self.granularity,
                self.target_cluster_size,
                max_bytes,
                self.bdev_length,
                &mut offset,
                &mut bytes,
            );
        }
        debug_assert!(bytes <= self.buf_size);
        // The offset is granularity-aligned because COW alignment only
        // happens when the target cluster is larger than the granularity.
        debug_assert_eq!(offset % self.granularity, 0);

        // The bytes-handled cell must be final before the first point
        // below that can process completions.
        let mut cell = BytesHandled::new();
        cell.set(handled);

        let nb_chunks = bytes.div_ceil(self.granularity) as usize;
        while self.pool.free_count() < nb_chunks {
            trace!(
                "mirror: waiting for buffers at {:#x}, in_flight {}",
                offset,
                self.in_flight.count()
            );
            self.wait_for_free_slot();
        }
        let chunks = self.pool.acquire(nb_chunks);
        let iovecs = self.pool.iovecs(&chunks, bytes);

        let mut op = Operation::new(id, offset, bytes, MirrorMethod::Copy);
        op.chunks = chunks;
        op.bytes_handled = cell;
        trace!("mirror: copy [{:#x}, +{:#x})", offset, bytes);
        self.in_flight.insert(op);

        if self.source.submit_read(offset, &iovecs, id).is_err() {
            self.io_failed(id, true, -libc::EIO);
        }
        handled
    }

    fn dispatch_zero_or_discard(&mut self, offset: u64, bytes: u64, method: MirrorMethod) -> u64 {
        let id = self.alloc_op_id();
        let mut op = Operation::new(id, offset, bytes, method);
        let mut cell = BytesHandled::new();
        cell.set(bytes);
        op.bytes_handled = cell;
        trace!("mirror: {:?} [{:#x}, +{:#x})", method, offset, bytes);
        self.in_flight.insert(op);

        let result = match method {
            MirrorMethod::Zero => self
                .target
                .submit_write_zeroes(offset, bytes, self.unmap, id),
            MirrorMethod::Discard => self.target.submit_discard(offset, bytes, id),
            MirrorMethod::Copy => unreachable!(),
        };
        if result.is_err() {
            self.io_failed(id, false, -libc::EIO);
        }
        bytes
    }

    // ---- the scheduler ("mirror iteration") ----

    fn iteration(&mut self) -> Duration {
        let granularity = self.granularity;
        let mut delay = Duration::ZERO;

        // Pick the next dirty offset, rewinding the iterator on wrap; the
        // caller only invokes us with a non-empty bitmap.
        let offset = {
            let guard = self.dirty_bitmap.lock();
            match guard.next_dirty(&mut self.dbi) {
                Some(offset) => offset,
                None => {
                    debug!(
                        "mirror: dirty iterator wrapped, {} dirty bytes left",
                        guard.count_dirty_bytes()
                    );
                    self.dbi.seek(0, granularity);
                    guard
                        .next_dirty(&mut self.dbi)
                        .expect("dirty bitmap has at least one bit set")
                }
            }
        };

        self.wait_for_no_conflict(None, offset, 1);
        self.pause_point();

        // Coalesce consecutive dirty chunks after the first one, within
        // the buffer budget, stopping at claimed chunks. The iterator is
        // allowed to be stale; the bitmap is authoritative and the
        // iterator resynchronizes whenever the two disagree.
        let mut nb_chunks: u64 = 1;
        {
            let mut guard = self.dirty_bitmap.lock();
            while nb_chunks * granularity < self.buf_size {
                let next_offset = offset + nb_chunks * granularity;
                let next_chunk = next_offset / granularity;
                if next_offset >= self.bdev_length || !guard.is_dirty(next_offset) {
                    break;
                }
                if self.in_flight.is_busy(next_chunk) {
                    break;
                }
                let next_dirty = guard.next_dirty(&mut self.dbi);
                if next_dirty != Some(next_offset) {
                    self.dbi.seek(next_offset, granularity);
                    let resynced = guard.next_dirty(&mut self.dbi);
                    debug_assert_eq!(resynced, Some(next_offset));
                }
                nb_chunks += 1;
            }

            // Clear the dirty bits before the block-status queries below;
            // writes racing in from here on re-dirty the bitmap on their
            // own and must not be lost to a stale snapshot.
            guard.clear(offset, nb_chunks * granularity);
        }

        // Claim the whole coalesced range with a pseudo operation first,
        // so conflicting requests queue behind it instead of racing the
        // dispatch loop over sub-operation boundaries.
        let pseudo_id = self.alloc_op_id();
        self.in_flight
            .insert(Operation::new_pseudo(pseudo_id, offset, nb_chunks * granularity));
        self.in_flight.claim(offset / granularity, nb_chunks);

        let write_zeroes_ok = self.target_node.can_write_zeroes_with_unmap();
        let max_io_bytes = (self.buf_size / MAX_IN_FLIGHT as u64).max(MAX_IO_BYTES);
        let mut offset = offset;
        while nb_chunks > 0 && offset < self.bdev_length {
            debug_assert_eq!(offset % granularity, 0);
            let (status, mut io_bytes) =
                self.source
                    .block_status_above(None, offset, nb_chunks * granularity);
            if status.data {
                io_bytes = io_bytes.min(max_io_bytes);
            }

            let mut method = MirrorMethod::Copy;
            io_bytes -= io_bytes % granularity;
            if io_bytes < granularity {
                io_bytes = granularity;
            } else if !status.data {
                // The cheap path is only safe if cluster rounding does not
                // spill outside the sub-range.
                let (aligned_offset, aligned_bytes) =
                    self.target_node.round_to_clusters(offset, io_bytes);
                if aligned_offset == offset && aligned_bytes == io_bytes {
                    method = if status.zero {
                        MirrorMethod::Zero
                    } else {
                        MirrorMethod::Discard
                    };
                }
            }

            while self.in_flight.count() >= MAX_IN_FLIGHT {
                trace!(
                    "mirror: waiting for slot at {:#x}, in_flight {}",
                    offset,
                    self.in_flight.count()
                );
                self.wait_for_free_slot();
            }
            if self.ret < 0 {
                break;
            }

            io_bytes = clip_bytes(self.bdev_length, offset, io_bytes);
            let io_bytes = self.perform(offset, io_bytes, method);
            assert!(io_bytes > 0);
            let accounted = accounted_bytes(method, write_zeroes_ok, io_bytes);
            offset += io_bytes;
            nb_chunks = nb_chunks.saturating_sub(io_bytes.div_ceil(granularity));
            if self.cur_speed != 0 {
                delay = self.limit.calculate_delay(accounted);
            }
        }

        self.in_flight.remove(pseudo_id);
        delay
    }

    // ---- flush ----

    fn flush_target(&mut self) -> i32 {
        self.flush_result = None;
        if self.target.submit_flush(TOKEN_FLUSH).is_err() {
            return -libc::EIO;
        }
        loop {
            if let Some(result) = self.flush_result.take() {
                return result;
            }
            self.pump_blocking();
        }
    }

    /// Flush the target, feeding a failure through the error policy.
    fn flush(&mut self) -> i32 {
        let result = self.flush_target();
        if result < 0 && self.error_action(false, -result) == ErrorAction::Report {
            self.ret = result;
        }
        result
    }

    // ---- initialization scans ----

    fn dirty_init(&mut self) -> i32 {
        if self.base.is_none() && !self.target_node.has_zero_init() {
            if !self.target_node.can_write_zeroes_with_unmap() {
                // No cheap way to zero the target: treat the whole device
                // as dirty and let the copy loop fill it.
                self.dirty_bitmap.set(0, self.bdev_length);
                return 0;
            }

            // Zero the entire device up front, as a pre-pass that does
            // not advance the user-visible progress counter.
            self.initial_zeroing_ongoing = true;
            let mut offset = 0;
            while offset < self.bdev_length {
                let bytes = (self.bdev_length - offset).min(MAX_SCAN_BYTES);
                self.throttle();
                if self.ctx.is_cancelled() {
                    self.initial_zeroing_ongoing = false;
                    return 0;
                }
                if self.in_flight.count() >= MAX_IN_FLIGHT {
                    trace!("mirror: initial zeroing waits for a slot");
                    self.wait_for_free_slot();
                    continue;
                }
                self.perform(offset, bytes, MirrorMethod::Zero);
                offset += bytes;
            }
            self.wait_for_all_io();
            self.initial_zeroing_ongoing = false;
        }

        let mut offset = 0;
        while offset < self.bdev_length {
            let bytes = (self.bdev_length - offset).min(MAX_SCAN_BYTES);
            self.throttle();
            if self.ctx.is_cancelled() {
                return 0;
            }
            let (allocated, count) =
                self.source
                    .is_allocated_above(self.base.as_ref(), offset, bytes);
            assert!(count > 0);
            if allocated {
                self.dirty_bitmap.set(offset, count);
            }
            offset += count;
        }
        0
    }

    // ---- the convergence driver ("mirror run") ----

    fn run(&mut self) -> i32 {
        let ret_final;
        let mut source_drained = false;

        if !self.is_none_mode {
            let init_ret = self.dirty_init();
            if init_ret < 0 || self.ctx.is_cancelled() {
                self.finish(init_ret, &mut source_drained);
                return init_ret;
            }
        }

        self.dbi = self.dirty_bitmap.iter();
        loop {
            if self.ret < 0 {
                ret_final = self.ret;
                break;
            }

            self.pause_point();

            let speed = self.ctx.speed();
            if speed != self.cur_speed {
                self.limit.set_speed(speed, SLICE_TIME);
                self.cur_speed = speed;
            }

            let mut cnt = self.dirty_bitmap.count_dirty_bytes();
            // Processed + in flight + remaining: the total length estimate
            // follows the live source.
            self.ctx
                .set_progress_len(self.ctx.progress_offset() + self.in_flight.bytes() + cnt);

            let mut delay = Duration::ZERO;
            let delta = self.last_pause.elapsed();
            if delta < SLICE_TIME && self.ctx.iostatus() == IoStatus::Ok {
                if self.in_flight.count() >= MAX_IN_FLIGHT
                    || self.pool.free_count() == 0
                    || (cnt == 0 && self.in_flight.count() > 0)
                {
                    trace!(
                        "mirror: yielding, cnt {}, free {}, in_flight {}",
                        cnt,
                        self.pool.free_count(),
                        self.in_flight.count()
                    );
                    self.wait_for_free_slot();
                    continue;
                } else if cnt != 0 {
                    delay = self.iteration();
                }
            }

            let mut should_complete = false;
            if self.in_flight.count() == 0 && cnt == 0 {
                trace!("mirror: flushing before sync point");
                if !self.shared.synced.load(Ordering::Acquire) {
                    if self.flush() < 0 {
                        // Go check self.ret.
                        continue;
                    }
                    // The bulk phase is over. From now on cancellation
                    // completes all pending I/O first, leaving the target
                    // consistent. The synced flag must be visible before
                    // the ready event, or an immediate completion request
                    // would bounce.
                    self.shared.synced.store(true, Ordering::Release);
                    self.ctx.event_ready();
                }
                should_complete =
                    self.shared.should_complete.load(Ordering::Acquire) || self.ctx.is_cancelled();
                cnt = self.dirty_bitmap.count_dirty_bytes();
            }

            if cnt == 0 && should_complete {
                // Block guest writes momentarily and make sure nothing
                // raced in between the count above and the drain.
                trace!("mirror: draining source for completion");
                self.graph.drained_begin(&self.source);
                let recheck = self.dirty_bitmap.count_dirty_bytes();
                if recheck > 0 || self.flush() < 0 {
                    self.graph.drained_end(&self.source);
                    continue;
                }

                // The two disks are in sync; report successful completion.
                self.ctx.reset_cancel();
                source_drained = true;
                ret_final = 0;
                break;
            }

            if !self.shared.synced.load(Ordering::Acquire) {
                self.ctx.sleep_ns(delay.as_nanos() as u64);
                if self.ctx.is_cancelled() {
                    ret_final = 0;
                    break;
                }
            } else if !should_complete {
                // Fully idle streaming: yield a whole slice so a global
                // drain is never held up by this job.
                let idle = self.in_flight.count() == 0 && cnt == 0;
                let ns = if idle { SLICE_TIME.as_nanos() as u64 } else { 0 };
                self.ctx.sleep_ns(ns);
            }
            self.last_pause = Instant::now();
        }

        self.finish(ret_final, &mut source_drained);
        ret_final
    }

    /// Quiesce outstanding I/O and leave the source drained for the exit
    /// stage, which pairs the drain with its final `drained_end`.
    fn finish(&mut self, ret: i32, source_drained: &mut bool) {
        if self.in_flight.count() > 0 {
            // Only reachable when the job failed or was cancelled before
            // the sync point; the target carries no consistency guarantee.
            debug!(
                "mirror: tearing down with {} operations in flight, ret {}",
                self.in_flight.count(),
                ret
            );
            self.wait_for_all_io();
        }
        if !*source_drained {
            self.graph.drained_begin(&self.source);
            *source_drained = true;
        }
    }
}

/// Job driver entry point: set up the engine, run the convergence loop and
/// hand the completion stage back for deferred execution.
pub(crate) fn run_job(setup: MirrorSetup, ctx: JobCtx) -> (i32, Option<block_jobs::ExitFn>) {
    let exit_data = ExitData {
        graph: setup.graph.clone(),
        mirror_top: setup.mirror_top.clone(),
        source: setup.source.clone(),
        target: setup.target.clone(),
        target_node: setup.target_node.clone(),
        job_blk: setup.job_blk.clone(),
        base: setup.base.clone(),
        backing_mode: setup.backing_mode,
        is_none_mode: setup.is_none_mode,
        shared: setup.shared.clone(),
        dirty_bitmap: setup.dirty_bitmap.clone(),
    };
    let exit: block_jobs::ExitFn = Box::new(move |ret| mirror_exit(exit_data, ret));

    if ctx.is_cancelled() {
        setup.graph.drained_begin(&setup.source);
        return (0, Some(exit));
    }

    let bdev_length = setup.source.size();

    // Active commit must resize the base image if the active layer has
    // outgrown it.
    if let Some(base) = &setup.base {
        if Arc::ptr_eq(base, &setup.target_node) {
            let base_length = setup.target_node.size();
            if bdev_length > base_length {
                if let Err(e) = setup.target.resize(bdev_length) {
                    error!("mirror: resizing base failed: {e}");
                    setup.graph.drained_begin(&setup.source);
                    return (-libc::EIO, Some(exit));
                }
            }
        }
    }

    if bdev_length == 0 {
        // Report ready and wait for the completion request.
        setup.shared.synced.store(true, Ordering::Release);
        ctx.event_ready();
        while !ctx.is_cancelled() && !setup.shared.should_complete.load(Ordering::Acquire) {
            ctx.sleep_ns(SLICE_TIME.as_nanos() as u64);
        }
        ctx.reset_cancel();
        setup.graph.drained_begin(&setup.source);
        return (0, Some(exit));
    }

    let granularity = setup.granularity;
    let chunks = bdev_length.div_ceil(granularity);
    let target_cluster_size = setup.target_node.cluster_size();

    // If the target has no backing file attached yet, it cannot do COW on
    // partial cluster writes; copy around the dirty data ourselves and
    // track which clusters are already self-contained.
    let mut buf_size = setup.buf_size;
    let mut cow_bitmap = None;
    if setup.target_node.backing_hint().is_some()
        && setup.target_node.backing().is_none()
        && granularity < target_cluster_size
    {
        buf_size = buf_size.max(target_cluster_size);
        cow_bitmap = Some(BitSet::new(chunks));
    }

    let max_iov = setup.source.max_iov().min(setup.target_node.max_iov());

    let poller = {
        let source_fd = setup.source.notifier_fd();
        let target_fd = setup.target_node.notifier_fd();
        match (source_fd, target_fd) {
            (Ok(s), Ok(t)) => Poller::new(&[s, t, ctx.kick_fd()]),
            _ => Poller::new(&[ctx.kick_fd()]),
        }
    };
    let poller = match poller {
        Ok(p) => p,
        Err(e) => {
            error!("mirror: failed creating poller: {e}");
            setup.graph.drained_begin(&setup.source);
            return (-libc::EIO, Some(exit));
        }
    };

    let mut job = MirrorJob {
        graph: setup.graph,
        source: setup.source,
        target: setup.target,
        target_node: setup.target_node,
        base: setup.base,
        is_none_mode: setup.is_none_mode,
        on_source_error: setup.on_source_error,
        on_target_error: setup.on_target_error,
        unmap: setup.unmap,
        granularity,
        buf_size,
        bdev_length,
        target_cluster_size,
        max_iov,
        dbi: setup.dirty_bitmap.iter(),
        dirty_bitmap: setup.dirty_bitmap,
        cow_bitmap,
        pool: BufferPool::new(buf_size, granularity),
        in_flight: InFlightMap::new(chunks),
        limit: RateLimiter::new(),
        cur_speed: 0,
        last_pause: Instant::now(),
        ret: 0,
        initial_zeroing_ongoing: false,
        next_op_id: 1,
        flush_result: None,
        poller,
        shared: setup.shared,
        ctx,
    };

    let ret = job.run();
    (ret, Some(exit))
}
