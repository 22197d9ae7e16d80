// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Abstraction over the effective storage backing up a node, with
//! completion-queue based asynchronous I/O.
//!
//! Submissions carry a `user_data` token; completions are polled with
//! [`AsyncDisk::next_completed_request`] and signalled through an
//! `EventFd` notifier. A completion result `>= 0` is the number of bytes
//! transferred, `< 0` a negated errno.

use std::io;

use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

#[derive(Error, Debug)]
pub enum DiskError {
    /// Failed submitting vectored read.
    #[error("Failed submitting vectored read")]
    Read(#[source] io::Error),
    /// Failed submitting vectored write.
    #[error("Failed submitting vectored write")]
    Write(#[source] io::Error),
    /// Failed submitting write zeroes.
    #[error("Failed submitting write zeroes")]
    WriteZeroes(#[source] io::Error),
    /// Failed submitting discard.
    #[error("Failed submitting discard")]
    Discard(#[source] io::Error),
    /// Failed submitting fsync.
    #[error("Failed submitting fsync")]
    Fsync(#[source] io::Error),
    /// Failed resizing the disk.
    #[error("Failed resizing the disk")]
    Resize(#[source] io::Error),
}

pub type DiskResult<T> = std::result::Result<T, DiskError>;

/// Allocation status of a byte range, as reported by a single image layer.
///
/// `data` means the range carries guest-visible payload in this layer.
/// `zero` means the range is known to read as zeroes. `allocated` means
/// the layer itself answers for the range (payload or an explicit zero
/// cluster); an unallocated range defers to the backing chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockStatus {
    pub data: bool,
    pub zero: bool,
    pub allocated: bool,
}

impl BlockStatus {
    pub const DATA: BlockStatus = BlockStatus {
        data: true,
        zero: false,
        allocated: true,
    };

    pub const ZERO: BlockStatus = BlockStatus {
        data: false,
        zero: true,
        allocated: true,
    };

    pub fn unallocated(reads_zero: bool) -> BlockStatus {
        BlockStatus {
            data: false,
            zero: reads_zero,
            allocated: false,
        }
    }
}

/// Completion-queue based asynchronous disk.
pub trait AsyncDisk: Send {
    /// Virtual size in bytes.
    fn size(&self) -> u64;

    /// Allocation unit of the image format.
    fn cluster_size(&self) -> u64;

    /// Largest scatter-gather list accepted per request.
    fn max_iov(&self) -> usize {
        1024
    }

    /// Whether unwritten regions are guaranteed to read as zeroes.
    fn has_zero_init(&self) -> bool {
        false
    }

    /// Whether zeroes can be written cheaply by deallocating.
    fn can_write_zeroes_with_unmap(&self) -> bool {
        false
    }

    /// Signalled whenever a completion becomes available.
    fn notifier(&self) -> &EventFd;

    /// Allocation status at `offset`, and the length of the run (clipped
    /// to `bytes`) over which it holds.
    fn block_status(&self, offset: u64, bytes: u64) -> (BlockStatus, u64);

    fn resize(&mut self, new_size: u64) -> DiskResult<()>;

    fn read_vectored(
        &mut self,
        offset: u64,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> DiskResult<()>;

    fn write_vectored(
        &mut self,
        offset: u64,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> DiskResult<()>;

    fn write_zeroes(&mut self, offset: u64, bytes: u64, unmap: bool, user_data: u64)
        -> DiskResult<()>;

    fn discard(&mut self, offset: u64, bytes: u64, user_data: u64) -> DiskResult<()>;

    fn fsync(&mut self, user_data: u64) -> DiskResult<()>;

    fn next_completed_request(&mut self) -> Option<(u64, i32)>;

    /// Requests accepted but whose completion has not been produced yet.
    /// Backends completing at submission time always report 0.
    fn pending_requests(&self) -> usize {
        0
    }
}
