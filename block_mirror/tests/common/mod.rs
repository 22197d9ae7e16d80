// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Test doubles and helpers for driving a mirror job end to end: a disk
//! wrapper that holds back write completions until the test releases
//! them, and a wrapper that fails selected requests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use block::disk::{AsyncDisk, BlockStatus, DiskResult};
use block::ram::RamDisk;
use vmm_sys_util::eventfd::EventFd;

/// Job-side tokens never set the top bit; the synchronous guest path
/// always does. Wrappers use this to stall only the job's requests.
fn is_job_token(token: u64) -> bool {
    token >> 63 == 0
}

pub struct StallState {
    held: Mutex<VecDeque<(u64, i32)>>,
    ready: Mutex<VecDeque<(u64, i32)>>,
    stall_writes: AtomicBool,
    notify: EventFd,
}

/// Test-side control over a [`StallDisk`].
#[derive(Clone)]
pub struct StallControl(Arc<StallState>);

impl StallControl {
    pub fn set_stall_writes(&self, on: bool) {
        self.0.stall_writes.store(on, Ordering::SeqCst);
    }

    pub fn held_count(&self) -> usize {
        self.0.held.lock().unwrap().len()
    }

    pub fn release_one(&self) -> bool {
        let completion = self.0.held.lock().unwrap().pop_front();
        match completion {
            Some(c) => {
                self.0.ready.lock().unwrap().push_back(c);
                self.0.notify.write(1).unwrap();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        while self.release_one() {}
    }
}

/// Disk executing requests immediately but holding back the job's write
/// completions until released.
pub struct StallDisk {
    inner: RamDisk,
    state: Arc<StallState>,
}

pub fn stall_disk(inner: RamDisk) -> (Box<StallDisk>, StallControl) {
    let state = Arc::new(StallState {
        held: Mutex::new(VecDeque::new()),
        ready: Mutex::new(VecDeque::new()),
        stall_writes: AtomicBool::new(true),
        notify: EventFd::new(libc::EFD_NONBLOCK).unwrap(),
    });
    (
        Box::new(StallDisk {
            inner,
            state: state.clone(),
        }),
        StallControl(state),
    )
}

impl StallDisk {
    fn held_count(&self) -> usize {
        self.state.held.lock().unwrap().len()
    }

    fn route(&mut self, stallable: bool) {
        while let Some((token, result)) = self.inner.next_completed_request() {
            let stall = stallable
                && is_job_token(token)
                && self.state.stall_writes.load(Ordering::SeqCst);
            if stall {
                self.state.held.lock().unwrap().push_back((token, result));
            } else {
                self.state.ready.lock().unwrap().push_back((token, result));
                self.state.notify.write(1).unwrap();
            }
        }
    }
}

impl AsyncDisk for StallDisk {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn cluster_size(&self) -> u64 {
        self.inner.cluster_size()
    }

    fn has_zero_init(&self) -> bool {
        self.inner.has_zero_init()
    }

    fn can_write_zeroes_with_unmap(&self) -> bool {
        self.inner.can_write_zeroes_with_unmap()
    }

    fn notifier(&self) -> &EventFd {
        &self.state.notify
    }

    fn block_status(&self, offset: u64, bytes: u64) -> (BlockStatus, u64) {
        self.inner.block_status(offset, bytes)
    }

    fn resize(&mut self, new_size: u64) -> DiskResult<()> {
        self.inner.resize(new_size)
    }

    fn read_vectored(
        &mut self,
        offset: u64,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> DiskResult<()> {
        self.inner.read_vectored(offset, iovecs, user_data)?;
        self.route(false);
        Ok(())
    }

    fn write_vectored(
        &mut self,
        offset: u64,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> DiskResult<()> {
        self.inner.write_vectored(offset, iovecs, user_data)?;
        self.route(true);
        Ok(())
    }

    fn write_zeroes(
        &mut self,
        offset: u64,
        bytes: u64,
        unmap: bool,
        user_data: u64,
    ) -> DiskResult<()> {
        self.inner.write_zeroes(offset, bytes, unmap, user_data)?;
        self.route(true);
        Ok(())
    }

    fn discard(&mut self, offset: u64, bytes: u64, user_data: u64) -> DiskResult<()> {
        self.inner.discard(offset, bytes, user_data)?;
        self.route(true);
        Ok(())
    }

    fn fsync(&mut self, user_data: u64) -> DiskResult<()> {
        self.inner.fsync(user_data)?;
        self.route(false);
        Ok(())
    }

    fn next_completed_request(&mut self) -> Option<(u64, i32)> {
        self.state.ready.lock().unwrap().pop_front()
    }

    fn pending_requests(&self) -> usize {
        self.held_count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
}

struct FaultSpec {
    kind: FaultKind,
    offset: u64,
    bytes: u64,
    remaining: usize,
    errno: i32,
}

pub struct FaultState {
    faults: Mutex<Vec<FaultSpec>>,
    notify: EventFd,
}

#[derive(Clone)]
pub struct FaultControl(Arc<FaultState>);

impl FaultControl {
    /// Fail the next `count` job requests of `kind` overlapping the range.
    pub fn inject(&self, kind: FaultKind, offset: u64, bytes: u64, count: usize, errno: i32) {
        self.0.faults.lock().unwrap().push(FaultSpec {
            kind,
            offset,
            bytes,
            remaining: count,
            errno,
        });
    }
}

/// Disk failing selected job requests with an error completion.
pub struct FaultDisk {
    inner: RamDisk,
    state: Arc<FaultState>,
}

pub fn fault_disk(inner: RamDisk) -> (Box<FaultDisk>, FaultControl) {
    let state = Arc::new(FaultState {
        faults: Mutex::new(Vec::new()),
        notify: EventFd::new(libc::EFD_NONBLOCK).unwrap(),
    });
    (
        Box::new(FaultDisk {
            inner,
            state: state.clone(),
        }),
        FaultControl(state),
    )
}

impl FaultDisk {
    fn take_fault(&self, kind: FaultKind, offset: u64, bytes: u64, token: u64) -> Option<i32> {
        // Job writes carry distinguishable tokens; reads are issued with
        // internal tokens, so read faults match any requester.
        if kind == FaultKind::Write && !is_job_token(token) {
            return None;
        }
        let mut faults = self.state.faults.lock().unwrap();
        for fault in faults.iter_mut() {
            if fault.kind == kind
                && fault.remaining > 0
                && offset < fault.offset + fault.bytes
                && fault.offset < offset + bytes
            {
                fault.remaining -= 1;
                return Some(-fault.errno);
            }
        }
        None
    }

    fn forward(&mut self) {
        // The inner disk completed the request already; re-notify through
        // our own eventfd.
        self.state.notify.write(1).unwrap();
    }
}

impl AsyncDisk for FaultDisk {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn cluster_size(&self) -> u64 {
        self.inner.cluster_size()
    }

    fn has_zero_init(&self) -> bool {
        self.inner.has_zero_init()
    }

    fn can_write_zeroes_with_unmap(&self) -> bool {
        self.inner.can_write_zeroes_with_unmap()
    }

    fn notifier(&self) -> &EventFd {
        &self.state.notify
    }

    fn block_status(&self, offset: u64, bytes: u64) -> (BlockStatus, u64) {
        self.inner.block_status(offset, bytes)
    }

    fn resize(&mut self, new_size: u64) -> DiskResult<()> {
        self.inner.resize(new_size)
    }

    fn read_vectored(
        &mut self,
        offset: u64,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> DiskResult<()> {
        let bytes = block::ram::iovecs_len(iovecs) as u64;
        if let Some(errno) = self.take_fault(FaultKind::Read, offset, bytes, user_data) {
            self.inner.push_external_completion(user_data, errno);
            self.forward();
            return Ok(());
        }
        self.inner.read_vectored(offset, iovecs, user_data)?;
        self.forward();
        Ok(())
    }

    fn write_vectored(
        &mut self,
        offset: u64,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> DiskResult<()> {
        let bytes = block::ram::iovecs_len(iovecs) as u64;
        if let Some(errno) = self.take_fault(FaultKind::Write, offset, bytes, user_data) {
            self.inner.push_external_completion(user_data, errno);
            self.forward();
            return Ok(());
        }
        self.inner.write_vectored(offset, iovecs, user_data)?;
        self.forward();
        Ok(())
    }

    fn write_zeroes(
        &mut self,
        offset: u64,
        bytes: u64,
        unmap: bool,
        user_data: u64,
    ) -> DiskResult<()> {
        if let Some(errno) = self.take_fault(FaultKind::Write, offset, bytes, user_data) {
            self.inner.push_external_completion(user_data, errno);
            self.forward();
            return Ok(());
        }
        self.inner.write_zeroes(offset, bytes, unmap, user_data)?;
        self.forward();
        Ok(())
    }

    fn discard(&mut self, offset: u64, bytes: u64, user_data: u64) -> DiskResult<()> {
        if let Some(errno) = self.take_fault(FaultKind::Write, offset, bytes, user_data) {
            self.inner.push_external_completion(user_data, errno);
            self.forward();
            return Ok(());
        }
        self.inner.discard(offset, bytes, user_data)?;
        self.forward();
        Ok(())
    }

    fn fsync(&mut self, user_data: u64) -> DiskResult<()> {
        self.inner.fsync(user_data)?;
        self.forward();
        Ok(())
    }

    fn next_completed_request(&mut self) -> Option<(u64, i32)> {
        self.inner.next_completed_request()
    }
}

/// Deterministic pseudo-random byte stream for write patterns.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Lcg(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0
    }

    pub fn fill(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = (self.next_u64() >> 33) as u8;
        }
    }
}

pub fn pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    Lcg::new(seed).fill(&mut buf);
    buf
}

pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
