// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Storage node graph: named nodes over disk backends, pass-through filter
//! nodes, backing chains, permission accounting, drained sections and the
//! node substitution primitive block jobs use at completion time.
//!
//! Locking order is graph lock, then node locks walking the chain top-down,
//! then bitmap locks. I/O submission paths never take the graph lock.

use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

use crate::bitmap::DirtyBitmap;
use crate::disk::{AsyncDisk, BlockStatus, DiskError};
use crate::ram::{iovecs_len, scatter_to_iovecs};
use crate::{align_down, align_up};

/// Permission bits a parent can hold on a node (and share with others).
pub mod perm {
    pub const CONSISTENT_READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const WRITE_UNCHANGED: u32 = 1 << 2;
    pub const RESIZE: u32 = 1 << 3;
    pub const GRAPH_MOD: u32 = 1 << 4;
    pub const ALL: u32 =
        CONSISTENT_READ | WRITE | WRITE_UNCHANGED | RESIZE | GRAPH_MOD;
}

/// Completions with this bit in their token belong to the synchronous
/// guest-facing path; everything else is polled by the owning block job.
const GUEST_TOKEN_BIT: u64 = 1 << 63;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Node '{0}' not found")]
    NodeNotFound(String),
    #[error("Conflicting permissions on node '{node}' between '{first}' and '{second}'")]
    PermConflict {
        node: String,
        first: String,
        second: String,
    },
    #[error("Filter node '{0}' has no backing child")]
    NoBacking(String),
    #[error("Operation blocked on node '{node}': {reason}")]
    Blocked { node: String, reason: String },
    #[error("Handle '{handle}' lacks permission {needed:#x}")]
    PermissionDenied { handle: String, needed: u32 },
    #[error("Linking '{0}' would create a backing chain cycle")]
    CycleDetected(String),
    #[error("Failed disk operation")]
    Disk(#[source] DiskError),
    #[error("I/O error (errno {0})")]
    Io(i32),
    #[error("Invalid graph operation: {0}")]
    Invalid(String),
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;

struct Holder {
    id: u64,
    tag: String,
    perm: u32,
    shared: u32,
}

struct BackingLink {
    node: Arc<Node>,
    holder_id: u64,
    perm: u32,
}

enum Driver {
    Disk(Box<dyn AsyncDisk>),
    Filter,
}

struct NodeInner {
    driver: Driver,
    backing: Option<BackingLink>,
    dirty_bitmaps: Vec<Arc<DirtyBitmap>>,
    holders: Vec<Holder>,
    drain_count: u32,
    read_only: bool,
    blockers: Vec<String>,
    backing_hint: Option<String>,
    notify: Option<EventFd>,
    job_ledger: VecDeque<(u64, i32)>,
    guest_ledger: VecDeque<(u64, i32)>,
    next_token: u64,
}

impl NodeInner {
    /// Move completions produced by the disk into the per-consumer ledgers.
    fn pump_disk(&mut self) {
        if let Driver::Disk(disk) = &mut self.driver {
            while let Some((user_data, result)) = disk.next_completed_request() {
                if user_data & GUEST_TOKEN_BIT != 0 {
                    self.guest_ledger.push_back((user_data, result));
                } else {
                    self.job_ledger.push_back((user_data, result));
                }
            }
        }
    }

    fn push_completion(&mut self, user_data: u64, result: i32) {
        if user_data & GUEST_TOKEN_BIT != 0 {
            self.guest_ledger.push_back((user_data, result));
        } else {
            self.job_ledger.push_back((user_data, result));
        }
        if let Some(notify) = &self.notify {
            let _ = notify.write(1);
        }
    }
}

/// A named storage node: either a disk node owning an [`AsyncDisk`], or a
/// pass-through filter forwarding to its backing child.
pub struct Node {
    name: String,
    inner: Mutex<NodeInner>,
}

fn check_holders(node: &str, holders: &[Holder]) -> GraphResult<()> {
    for (i, a) in holders.iter().enumerate() {
        for b in &holders[i + 1..] {
            if a.perm & !b.shared != 0 || b.perm & !a.shared != 0 {
                return Err(GraphError::PermConflict {
                    node: node.to_string(),
                    first: a.tag.clone(),
                    second: b.tag.clone(),
                });
            }
        }
    }
    Ok(())
}

impl Node {
    fn new(name: &str, driver: Driver, notify: Option<EventFd>) -> Arc<Node> {
        Arc::new(Node {
            name: name.to_string(),
            inner: Mutex::new(NodeInner {
                driver,
                backing: None,
                dirty_bitmaps: Vec::new(),
                holders: Vec::new(),
                drain_count: 0,
                read_only: false,
                blockers: Vec::new(),
                backing_hint: None,
                notify,
                job_ledger: VecDeque::new(),
                guest_ledger: VecDeque::new(),
                next_token: 1,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_filter(&self) -> bool {
        matches!(self.inner.lock().unwrap().driver, Driver::Filter)
    }

    pub fn backing(&self) -> Option<Arc<Node>> {
        self.inner.lock().unwrap().backing.as_ref().map(|l| l.node.clone())
    }

    pub fn read_only(&self) -> bool {
        self.inner.lock().unwrap().read_only
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.inner.lock().unwrap().read_only = read_only;
    }

    pub fn backing_hint(&self) -> Option<String> {
        self.inner.lock().unwrap().backing_hint.clone()
    }

    /// Name of the node this image would open as its backing chain, for
    /// images carrying such a reference without the link being attached.
    pub fn set_backing_hint(&self, hint: Option<String>) {
        self.inner.lock().unwrap().backing_hint = hint;
    }

    pub fn op_block(&self, reason: &str) {
        self.inner.lock().unwrap().blockers.push(reason.to_string());
    }

    pub fn op_unblock(&self, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.blockers.retain(|r| r != reason);
    }

    pub fn assert_unblocked(&self) -> GraphResult<()> {
        let inner = self.inner.lock().unwrap();
        match inner.blockers.first() {
            Some(reason) => Err(GraphError::Blocked {
                node: self.name.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn create_dirty_bitmap(self: &Arc<Node>, granularity: u64) -> Arc<DirtyBitmap> {
        let bitmap = Arc::new(DirtyBitmap::new(self.size(), granularity));
        self.inner.lock().unwrap().dirty_bitmaps.push(bitmap.clone());
        bitmap
    }

    pub fn release_dirty_bitmap(&self, bitmap: &Arc<DirtyBitmap>) {
        let mut inner = self.inner.lock().unwrap();
        inner.dirty_bitmaps.retain(|b| !Arc::ptr_eq(b, bitmap));
    }

    /// Resolve through filters down to the disk node that performs I/O.
    pub fn disk_node(self: &Arc<Node>) -> GraphResult<Arc<Node>> {
        let mut node = self.clone();
        loop {
            let next = {
                let inner = node.inner.lock().unwrap();
                match inner.driver {
                    Driver::Disk(_) => return Ok(node.clone()),
                    Driver::Filter => inner
                        .backing
                        .as_ref()
                        .map(|l| l.node.clone())
                        .ok_or_else(|| GraphError::NoBacking(node.name.clone()))?,
                }
            };
            node = next;
        }
    }

    fn with_disk<R>(&self, f: impl FnOnce(&dyn AsyncDisk) -> R) -> R {
        let inner = self.inner.lock().unwrap();
        match &inner.driver {
            Driver::Disk(disk) => f(disk.as_ref()),
            Driver::Filter => unreachable!("disk accessor on filter node"),
        }
    }

    pub fn size(self: &Arc<Node>) -> u64 {
        let node = self.disk_node().expect("chain terminates in a disk node");
        node.with_disk(|d| d.size())
    }

    pub fn cluster_size(self: &Arc<Node>) -> u64 {
        let node = self.disk_node().expect("chain terminates in a disk node");
        node.with_disk(|d| d.cluster_size())
    }

    pub fn max_iov(self: &Arc<Node>) -> usize {
        let node = self.disk_node().expect("chain terminates in a disk node");
        node.with_disk(|d| d.max_iov())
    }

    pub fn has_zero_init(self: &Arc<Node>) -> bool {
        let node = self.disk_node().expect("chain terminates in a disk node");
        node.with_disk(|d| d.has_zero_init())
    }

    pub fn can_write_zeroes_with_unmap(self: &Arc<Node>) -> bool {
        let node = self.disk_node().expect("chain terminates in a disk node");
        node.with_disk(|d| d.can_write_zeroes_with_unmap())
    }

    /// Round a byte range outward to the node's cluster boundaries.
    pub fn round_to_clusters(self: &Arc<Node>, offset: u64, bytes: u64) -> (u64, u64) {
        let cluster = self.cluster_size();
        let start = align_down(offset, cluster);
        let end = align_up(offset + bytes, cluster);
        (start, end - start)
    }

    /// File descriptor signalled when this node has completions pending.
    pub fn notifier_fd(self: &Arc<Node>) -> GraphResult<RawFd> {
        let node = self.disk_node()?;
        let inner = node.inner.lock().unwrap();
        inner
            .notify
            .as_ref()
            .map(|e| e.as_raw_fd())
            .ok_or_else(|| GraphError::Invalid(format!("node '{}' has no notifier", node.name)))
    }

    /// Consume pending notifier ticks, so level-triggered polling settles.
    pub fn clear_notifier(self: &Arc<Node>) {
        if let Ok(node) = self.disk_node() {
            let inner = node.inner.lock().unwrap();
            if let Some(notify) = &inner.notify {
                let _ = notify.read();
            }
        }
    }

    /// Allocation status over the chain from this node down to (not
    /// including) `base`. The first layer answering for the range wins.
    pub fn block_status_above(
        self: &Arc<Node>,
        base: Option<&Arc<Node>>,
        offset: u64,
        bytes: u64,
    ) -> (BlockStatus, u64) {
        let mut node = self.disk_node().expect("chain terminates in a disk node");
        let mut run = bytes;
        loop {
            let (status, layer_run) = node.with_disk(|d| d.block_status(offset, bytes));
            run = run.min(layer_run);
            if status.allocated {
                return (status, run);
            }
            let next = node.backing();
            match next {
                Some(next) if base.is_none_or(|b| !Arc::ptr_eq(b, &next)) => {
                    node = next.disk_node().expect("chain terminates in a disk node");
                }
                _ => return (status, run),
            }
        }
    }

    /// Whether any layer above `base` allocates the range starting at
    /// `offset`, and the number of bytes for which the answer holds.
    pub fn is_allocated_above(
        self: &Arc<Node>,
        base: Option<&Arc<Node>>,
        offset: u64,
        bytes: u64,
    ) -> (bool, u64) {
        let (status, run) = self.block_status_above(base, offset, bytes);
        (status.allocated, run)
    }

    pub fn is_drained(self: &Arc<Node>) -> bool {
        match self.disk_node() {
            Ok(node) => node.inner.lock().unwrap().drain_count > 0,
            Err(_) => false,
        }
    }

    fn drained_begin_inner(self: &Arc<Node>) {
        let node = self.disk_node().expect("chain terminates in a disk node");
        node.inner.lock().unwrap().drain_count += 1;
        // Quiesce: wait out requests the backend has accepted but not yet
        // completed, parking their completions in the ledgers.
        loop {
            {
                let mut inner = node.inner.lock().unwrap();
                inner.pump_disk();
                let pending = match &inner.driver {
                    Driver::Disk(disk) => disk.pending_requests(),
                    Driver::Filter => 0,
                };
                if pending == 0 {
                    break;
                }
            }
            thread::yield_now();
        }
    }

    fn drained_end_inner(self: &Arc<Node>) {
        let node = self.disk_node().expect("chain terminates in a disk node");
        let mut inner = node.inner.lock().unwrap();
        assert!(inner.drain_count > 0);
        inner.drain_count -= 1;
    }

    /// Submit an asynchronous chain-aware read. Unallocated regions fall
    /// through to the backing chain and read as zeroes past its end.
    ///
    /// The underlying backends must complete reads at submission time (all
    /// in-tree backends do); the synthesized completion is delivered
    /// through this node's completion ledger.
    pub fn submit_read(
        self: &Arc<Node>,
        offset: u64,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> GraphResult<()> {
        let total = iovecs_len(iovecs);
        let mut buf = vec![0u8; total];
        let result = match read_chain(self, offset, &mut buf) {
            Ok(()) => {
                // SAFETY: iovecs point to valid writable buffers per contract.
                unsafe { scatter_to_iovecs(iovecs, 0, &buf) };
                total as i32
            }
            Err(errno) => errno,
        };
        let node = self.disk_node()?;
        let mut inner = node.inner.lock().unwrap();
        inner.push_completion(user_data, result);
        Ok(())
    }

    /// Synchronous chain-aware read into `buf`.
    pub fn read_at(self: &Arc<Node>, offset: u64, buf: &mut [u8]) -> GraphResult<()> {
        read_chain(self, offset, buf).map_err(GraphError::Io)
    }

    pub fn submit_write(
        self: &Arc<Node>,
        offset: u64,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> GraphResult<()> {
        let total = iovecs_len(iovecs) as u64;
        let node = self.disk_node()?;
        let mut inner = node.inner.lock().unwrap();
        for bitmap in &inner.dirty_bitmaps {
            bitmap.set(offset, total);
        }
        match &mut inner.driver {
            Driver::Disk(disk) => disk
                .write_vectored(offset, iovecs, user_data)
                .map_err(GraphError::Disk),
            Driver::Filter => unreachable!("disk_node resolved to a filter"),
        }
    }

    pub fn submit_write_zeroes(
        self: &Arc<Node>,
        offset: u64,
        bytes: u64,
        unmap: bool,
        user_data: u64,
    ) -> GraphResult<()> {
        let node = self.disk_node()?;
        let mut inner = node.inner.lock().unwrap();
        for bitmap in &inner.dirty_bitmaps {
            bitmap.set(offset, bytes);
        }
        match &mut inner.driver {
            Driver::Disk(disk) => disk
                .write_zeroes(offset, bytes, unmap, user_data)
                .map_err(GraphError::Disk),
            Driver::Filter => unreachable!("disk_node resolved to a filter"),
        }
    }

    pub fn submit_discard(
        self: &Arc<Node>,
        offset: u64,
        bytes: u64,
        user_data: u64,
    ) -> GraphResult<()> {
        let node = self.disk_node()?;
        let mut inner = node.inner.lock().unwrap();
        for bitmap in &inner.dirty_bitmaps {
            bitmap.set(offset, bytes);
        }
        match &mut inner.driver {
            Driver::Disk(disk) => disk
                .discard(offset, bytes, user_data)
                .map_err(GraphError::Disk),
            Driver::Filter => unreachable!("disk_node resolved to a filter"),
        }
    }

    pub fn submit_flush(self: &Arc<Node>, user_data: u64) -> GraphResult<()> {
        // A filter that lost its backing mid-teardown flushes as a no-op.
        let node = match self.disk_node() {
            Ok(node) => node,
            Err(GraphError::NoBacking(_)) => {
                let mut inner = self.inner.lock().unwrap();
                inner.push_completion(user_data, 0);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut inner = node.inner.lock().unwrap();
        match &mut inner.driver {
            Driver::Disk(disk) => disk.fsync(user_data).map_err(GraphError::Disk),
            Driver::Filter => unreachable!("disk_node resolved to a filter"),
        }
    }

    pub fn resize(self: &Arc<Node>, new_size: u64) -> GraphResult<()> {
        let node = self.disk_node()?;
        let mut inner = node.inner.lock().unwrap();
        match &mut inner.driver {
            Driver::Disk(disk) => disk.resize(new_size).map_err(GraphError::Disk),
            Driver::Filter => unreachable!("disk_node resolved to a filter"),
        }
    }

    /// Next job-side completion, if any.
    pub fn poll_completion(self: &Arc<Node>) -> Option<(u64, i32)> {
        let node = self.disk_node().ok()?;
        let mut inner = node.inner.lock().unwrap();
        inner.pump_disk();
        inner.job_ledger.pop_front()
    }

    fn alloc_guest_token(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let token = inner.next_token;
        inner.next_token += 1;
        GUEST_TOKEN_BIT | token
    }

    fn wait_guest_completion(self: &Arc<Node>, token: u64) -> GraphResult<()> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.pump_disk();
                if let Some(pos) = inner.guest_ledger.iter().position(|(t, _)| *t == token) {
                    let (_, result) = inner.guest_ledger.remove(pos).unwrap();
                    return if result < 0 {
                        Err(GraphError::Io(result))
                    } else {
                        Ok(())
                    };
                }
            }
            thread::yield_now();
        }
    }
}

/// Chain-aware read; returns a negated errno on failure.
fn read_chain(node: &Arc<Node>, offset: u64, buf: &mut [u8]) -> std::result::Result<(), i32> {
    if buf.is_empty() {
        return Ok(());
    }
    let disk_node = match node.disk_node() {
        Ok(n) => n,
        Err(_) => {
            buf.fill(0);
            return Ok(());
        }
    };
    let size = disk_node.with_disk(|d| d.size());
    if offset + buf.len() as u64 > size {
        return Err(-libc::EINVAL);
    }
    let mut pos = 0usize;
    while pos < buf.len() {
        let (status, run) =
            disk_node.with_disk(|d| d.block_status(offset + pos as u64, (buf.len() - pos) as u64));
        let run = run as usize;
        let sub = &mut buf[pos..pos + run];
        if status.allocated {
            read_allocated(&disk_node, offset + pos as u64, sub)?;
        } else {
            let backing = disk_node.backing();
            match backing {
                Some(backing) => read_chain(&backing, offset + pos as u64, sub)?,
                None => sub.fill(0),
            }
        }
        pos += run;
    }
    Ok(())
}

/// Read an allocated run straight from the node's own disk.
fn read_allocated(node: &Arc<Node>, offset: u64, buf: &mut [u8]) -> std::result::Result<(), i32> {
    let mut inner = node.inner.lock().unwrap();
    let token = {
        let t = inner.next_token;
        inner.next_token += 1;
        GUEST_TOKEN_BIT | t
    };
    let iovec = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let Driver::Disk(disk) = &mut inner.driver else {
        unreachable!("read_allocated on filter node")
    };
    disk.read_vectored(offset, &[iovec], token)
        .map_err(|_| -libc::EIO)?;
    // In-tree backends complete reads at submission time.
    let mut stashed = Vec::new();
    let result = loop {
        match disk.next_completed_request() {
            Some((user_data, result)) if user_data == token => break result,
            Some(other) => stashed.push(other),
            None => panic!(
                "backend of node '{}' did not complete a read at submission",
                node.name
            ),
        }
    };
    for (user_data, result) in stashed {
        if user_data & GUEST_TOKEN_BIT != 0 {
            inner.guest_ledger.push_back((user_data, result));
        } else {
            inner.job_ledger.push_back((user_data, result));
        }
    }
    if result < 0 {
        return Err(result);
    }
    Ok(())
}

struct HandleInner {
    node: Option<Arc<Node>>,
    holder_id: u64,
    perm: u32,
    shared: u32,
}

/// Guest-visible attachment to a node.
///
/// Synchronous `read`/`write`/… are the guest-facing convenience path;
/// `submit_*` are the asynchronous entry points used by block jobs, with
/// completions polled off the node.
pub struct BlockHandle {
    name: String,
    inner: Mutex<HandleInner>,
}

impl std::fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl BlockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> Option<Arc<Node>> {
        self.inner.lock().unwrap().node.clone()
    }

    pub fn perm(&self) -> (u32, u32) {
        let inner = self.inner.lock().unwrap();
        (inner.perm, inner.shared)
    }

    fn require_perm(&self, needed: u32) -> GraphResult<Arc<Node>> {
        let inner = self.inner.lock().unwrap();
        if inner.perm & needed != needed {
            return Err(GraphError::PermissionDenied {
                handle: self.name.clone(),
                needed,
            });
        }
        inner
            .node
            .clone()
            .ok_or_else(|| GraphError::Invalid(format!("handle '{}' is detached", self.name)))
    }

    pub fn size(&self) -> GraphResult<u64> {
        let node = self
            .node()
            .ok_or_else(|| GraphError::Invalid(format!("handle '{}' is detached", self.name)))?;
        Ok(node.size())
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> GraphResult<()> {
        let node = self.require_perm(perm::CONSISTENT_READ)?;
        node.read_at(offset, buf)
    }

    /// Guest writes against a drained node block until the drained
    /// section ends, then run against whatever node the handle points at
    /// by then; a single guest's requests therefore keep their order
    /// across graph surgery.
    fn wait_undrained(&self) -> GraphResult<Arc<Node>> {
        loop {
            let node = self.require_perm(perm::WRITE)?;
            let disk_node = node.disk_node()?;
            if !disk_node.is_drained() {
                return Ok(disk_node);
            }
            thread::yield_now();
        }
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> GraphResult<()> {
        let disk_node = self.wait_undrained()?;
        let token = disk_node.alloc_guest_token();
        let iovec = libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };
        disk_node.submit_write(offset, &[iovec], token)?;
        disk_node.wait_guest_completion(token)
    }

    pub fn write_zeroes(&self, offset: u64, bytes: u64, unmap: bool) -> GraphResult<()> {
        let disk_node = self.wait_undrained()?;
        let token = disk_node.alloc_guest_token();
        disk_node.submit_write_zeroes(offset, bytes, unmap, token)?;
        disk_node.wait_guest_completion(token)
    }

    pub fn discard(&self, offset: u64, bytes: u64) -> GraphResult<()> {
        let disk_node = self.wait_undrained()?;
        let token = disk_node.alloc_guest_token();
        disk_node.submit_discard(offset, bytes, token)?;
        disk_node.wait_guest_completion(token)
    }

    pub fn flush(&self) -> GraphResult<()> {
        let node = self
            .node()
            .ok_or_else(|| GraphError::Invalid(format!("handle '{}' is detached", self.name)))?;
        let disk_node = node.disk_node()?;
        let token = disk_node.alloc_guest_token();
        disk_node.submit_flush(token)?;
        disk_node.wait_guest_completion(token)
    }

    pub fn resize(&self, new_size: u64) -> GraphResult<()> {
        let node = self.require_perm(perm::RESIZE)?;
        node.resize(new_size)
    }

    // Asynchronous job-side entry points.

    pub fn submit_write_vectored(
        &self,
        offset: u64,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> GraphResult<()> {
        let node = self.require_perm(perm::WRITE)?;
        node.submit_write(offset, iovecs, user_data)
    }

    pub fn submit_write_zeroes(
        &self,
        offset: u64,
        bytes: u64,
        unmap: bool,
        user_data: u64,
    ) -> GraphResult<()> {
        let node = self.require_perm(perm::WRITE)?;
        node.submit_write_zeroes(offset, bytes, unmap, user_data)
    }

    pub fn submit_discard(&self, offset: u64, bytes: u64, user_data: u64) -> GraphResult<()> {
        let node = self.require_perm(perm::WRITE)?;
        node.submit_discard(offset, bytes, user_data)
    }

    pub fn submit_flush(&self, user_data: u64) -> GraphResult<()> {
        let node = self
            .node()
            .ok_or_else(|| GraphError::Invalid(format!("handle '{}' is detached", self.name)))?;
        node.submit_flush(user_data)
    }

}

struct GraphInner {
    nodes: Vec<Arc<Node>>,
    handles: Vec<Weak<BlockHandle>>,
    next_id: u64,
}

/// The set of live nodes and handles, and the surgery operations on them.
pub struct Graph {
    inner: Mutex<GraphInner>,
}

impl Graph {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Graph> {
        Arc::new(Graph {
            inner: Mutex::new(GraphInner {
                nodes: Vec::new(),
                handles: Vec::new(),
                next_id: 1,
            }),
        })
    }

    fn alloc_id(inner: &mut GraphInner) -> u64 {
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    pub fn add_disk_node(&self, name: &str, disk: Box<dyn AsyncDisk>) -> Arc<Node> {
        let notify = disk
            .notifier()
            .try_clone()
            .expect("Failed cloning disk notifier");
        let node = Node::new(name, Driver::Disk(disk), Some(notify));
        self.inner.lock().unwrap().nodes.push(node.clone());
        node
    }

    pub fn add_filter_node(&self, name: &str) -> Arc<Node> {
        let node = Node::new(name, Driver::Filter, None);
        self.inner.lock().unwrap().nodes.push(node.clone());
        node
    }

    pub fn find_node(&self, name: &str) -> Option<Arc<Node>> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.name() == name)
            .cloned()
    }

    /// Attach a new handle to `node` with the given permission grant.
    pub fn attach(
        &self,
        node: &Arc<Node>,
        tag: &str,
        perm: u32,
        shared: u32,
    ) -> GraphResult<Arc<BlockHandle>> {
        let mut graph = self.inner.lock().unwrap();
        let id = Self::alloc_id(&mut graph);
        {
            let mut inner = node.inner.lock().unwrap();
            inner.holders.push(Holder {
                id,
                tag: tag.to_string(),
                perm,
                shared,
            });
            if let Err(e) = check_holders(node.name(), &inner.holders) {
                inner.holders.retain(|h| h.id != id);
                return Err(e);
            }
        }
        let handle = Arc::new(BlockHandle {
            name: tag.to_string(),
            inner: Mutex::new(HandleInner {
                node: Some(node.clone()),
                holder_id: id,
                perm,
                shared,
            }),
        });
        graph.handles.push(Arc::downgrade(&handle));
        Ok(handle)
    }

    pub fn detach(&self, handle: &Arc<BlockHandle>) {
        let mut graph = self.inner.lock().unwrap();
        let mut inner = handle.inner.lock().unwrap();
        if let Some(node) = inner.node.take() {
            node.inner
                .lock()
                .unwrap()
                .holders
                .retain(|h| h.id != inner.holder_id);
        }
        graph
            .handles
            .retain(|w| w.upgrade().map(|h| !Arc::ptr_eq(&h, handle)).unwrap_or(false));
    }

    /// Change a handle's permission grant; explicit release is `(0, ALL)`.
    pub fn set_perm(&self, handle: &Arc<BlockHandle>, perm: u32, shared: u32) -> GraphResult<()> {
        let _graph = self.inner.lock().unwrap();
        let mut inner = handle.inner.lock().unwrap();
        let node = inner
            .node
            .clone()
            .ok_or_else(|| GraphError::Invalid(format!("handle '{}' is detached", handle.name)))?;
        let mut node_inner = node.inner.lock().unwrap();
        let holder_id = inner.holder_id;
        let holder = node_inner
            .holders
            .iter_mut()
            .find(|h| h.id == holder_id)
            .expect("attached handle has a holder record");
        let old = (holder.perm, holder.shared);
        holder.perm = perm;
        holder.shared = shared;
        if let Err(e) = check_holders(node.name(), &node_inner.holders) {
            let holder = node_inner
                .holders
                .iter_mut()
                .find(|h| h.id == holder_id)
                .unwrap();
            holder.perm = old.0;
            holder.shared = old.1;
            return Err(e);
        }
        inner.perm = perm;
        inner.shared = shared;
        Ok(())
    }

    /// Change the permission a filter holds on its backing child link.
    pub fn set_child_perm(&self, parent: &Arc<Node>, perm: u32) -> GraphResult<()> {
        let _graph = self.inner.lock().unwrap();
        let link = {
            let inner = parent.inner.lock().unwrap();
            inner
                .backing
                .as_ref()
                .map(|l| (l.node.clone(), l.holder_id))
                .ok_or_else(|| GraphError::NoBacking(parent.name().to_string()))?
        };
        let (child, holder_id) = link;
        {
            let mut child_inner = child.inner.lock().unwrap();
            let holder = child_inner
                .holders
                .iter_mut()
                .find(|h| h.id == holder_id)
                .expect("backing link has a holder record");
            let old = holder.perm;
            holder.perm = perm;
            if let Err(e) = check_holders(child.name(), &child_inner.holders) {
                let holder = child_inner
                    .holders
                    .iter_mut()
                    .find(|h| h.id == holder_id)
                    .unwrap();
                holder.perm = old;
                return Err(e);
            }
        }
        let mut inner = parent.inner.lock().unwrap();
        if let Some(l) = inner.backing.as_mut() {
            l.perm = perm;
        }
        Ok(())
    }

    fn link_backing(
        inner: &mut GraphInner,
        node: &Arc<Node>,
        backing: &Arc<Node>,
        perm: u32,
    ) -> GraphResult<u64> {
        // Reject chains that would loop back to `node`.
        let mut cursor = Some(backing.clone());
        while let Some(n) = cursor {
            if Arc::ptr_eq(&n, node) {
                return Err(GraphError::CycleDetected(node.name().to_string()));
            }
            cursor = n.backing();
        }
        let id = Self::alloc_id(inner);
        let mut child_inner = backing.inner.lock().unwrap();
        child_inner.holders.push(Holder {
            id,
            tag: format!("backing link of '{}'", node.name()),
            perm,
            shared: perm::ALL,
        });
        if let Err(e) = check_holders(backing.name(), &child_inner.holders) {
            child_inner.holders.retain(|h| h.id != id);
            return Err(e);
        }
        Ok(id)
    }

    /// Point `node`'s backing link at `backing` (or detach it with `None`).
    pub fn set_backing(&self, node: &Arc<Node>, backing: Option<Arc<Node>>) -> GraphResult<()> {
        let mut graph = self.inner.lock().unwrap();
        // Drop the previous link first.
        let old = node.inner.lock().unwrap().backing.take();
        if let Some(link) = old {
            link.node
                .inner
                .lock()
                .unwrap()
                .holders
                .retain(|h| h.id != link.holder_id);
        }
        if let Some(backing) = backing {
            let id = Self::link_backing(&mut graph, node, &backing, 0)?;
            node.inner.lock().unwrap().backing = Some(BackingLink {
                node: backing,
                holder_id: id,
                perm: 0,
            });
        }
        Ok(())
    }

    /// Every parent link (node backing links and handles) pointing at `at`,
    /// excluding `skip`'s own backing link.
    fn parents_of(
        graph: &GraphInner,
        at: &Arc<Node>,
        skip: Option<&Arc<Node>>,
    ) -> (Vec<Arc<Node>>, Vec<Arc<BlockHandle>>) {
        let mut parent_nodes = Vec::new();
        for n in &graph.nodes {
            if skip.is_some_and(|s| Arc::ptr_eq(s, n)) {
                continue;
            }
            let inner = n.inner.lock().unwrap();
            if inner
                .backing
                .as_ref()
                .is_some_and(|l| Arc::ptr_eq(&l.node, at))
            {
                parent_nodes.push(n.clone());
            }
        }
        let mut parent_handles = Vec::new();
        for w in &graph.handles {
            if let Some(h) = w.upgrade() {
                if h.node().is_some_and(|n| Arc::ptr_eq(&n, at)) {
                    parent_handles.push(h);
                }
            }
        }
        (parent_nodes, parent_handles)
    }

    fn move_holder(from: &Arc<Node>, to: &Arc<Node>, holder_id: u64) -> GraphResult<()> {
        let holder = {
            let mut from_inner = from.inner.lock().unwrap();
            let pos = from_inner
                .holders
                .iter()
                .position(|h| h.id == holder_id)
                .expect("holder registered on source node");
            from_inner.holders.remove(pos)
        };
        let mut to_inner = to.inner.lock().unwrap();
        to_inner.holders.push(holder);
        if let Err(e) = check_holders(to.name(), &to_inner.holders) {
            let holder = to_inner.holders.pop().unwrap();
            drop(to_inner);
            from.inner.lock().unwrap().holders.push(holder);
            return Err(e);
        }
        Ok(())
    }

    /// Insert a filter above `below`: every existing parent of `below` is
    /// repointed at the filter, and the filter inherits the union of the
    /// parents' WRITE permission on its new child link.
    pub fn append_filter(&self, filter: &Arc<Node>, below: &Arc<Node>) -> GraphResult<()> {
        if !filter.is_filter() {
            return Err(GraphError::Invalid(format!(
                "node '{}' is not a filter",
                filter.name()
            )));
        }
        if filter.backing().is_some() {
            return Err(GraphError::Invalid(format!(
                "filter '{}' already has a child",
                filter.name()
            )));
        }
        let mut graph = self.inner.lock().unwrap();
        let (parent_nodes, parent_handles) = Self::parents_of(&graph, below, Some(filter));

        let mut moved_perm = 0u32;
        for h in &parent_handles {
            moved_perm |= h.inner.lock().unwrap().perm;
        }
        for n in &parent_nodes {
            if let Some(l) = n.inner.lock().unwrap().backing.as_ref() {
                moved_perm |= l.perm;
            }
        }

        // The filter must be able to forward guest writes to the real image.
        let child_perm = moved_perm & perm::WRITE;
        let id = Self::link_backing(&mut graph, filter, below, child_perm)?;
        filter.inner.lock().unwrap().backing = Some(BackingLink {
            node: below.clone(),
            holder_id: id,
            perm: child_perm,
        });

        for n in &parent_nodes {
            let holder_id = {
                let mut inner = n.inner.lock().unwrap();
                let link = inner.backing.as_mut().expect("parent has backing link");
                link.node = filter.clone();
                link.holder_id
            };
            Self::move_holder(below, filter, holder_id)?;
        }
        for h in &parent_handles {
            let holder_id = {
                let mut inner = h.inner.lock().unwrap();
                inner.node = Some(filter.clone());
                inner.holder_id
            };
            Self::move_holder(below, filter, holder_id)?;
        }
        debug!(
            "graph: inserted filter '{}' above '{}'",
            filter.name(),
            below.name()
        );
        Ok(())
    }

    /// Atomically substitute `new` for `old` in every parent link.
    ///
    /// Permission compatibility on `new` is verified for all moved links
    /// before anything mutates; a conflict leaves the graph unchanged.
    pub fn replace_node(&self, old: &Arc<Node>, new: &Arc<Node>) -> GraphResult<()> {
        let graph = self.inner.lock().unwrap();
        let (parent_nodes, parent_handles) = Self::parents_of(&graph, old, Some(new));

        // Dry-run the permission move.
        {
            let old_inner = old.inner.lock().unwrap();
            let new_inner = new.inner.lock().unwrap();
            let mut prospective: Vec<Holder> = new_inner
                .holders
                .iter()
                .map(|h| Holder {
                    id: h.id,
                    tag: h.tag.clone(),
                    perm: h.perm,
                    shared: h.shared,
                })
                .collect();
            let moving_ids: Vec<u64> = parent_nodes
                .iter()
                .filter_map(|n| {
                    n.inner
                        .lock()
                        .unwrap()
                        .backing
                        .as_ref()
                        .map(|l| l.holder_id)
                })
                .chain(
                    parent_handles
                        .iter()
                        .map(|h| h.inner.lock().unwrap().holder_id),
                )
                .collect();
            for h in &old_inner.holders {
                if moving_ids.contains(&h.id) {
                    prospective.push(Holder {
                        id: h.id,
                        tag: h.tag.clone(),
                        perm: h.perm,
                        shared: h.shared,
                    });
                }
            }
            check_holders(new.name(), &prospective)?;
        }

        for n in &parent_nodes {
            let holder_id = {
                let mut inner = n.inner.lock().unwrap();
                let link = inner.backing.as_mut().expect("parent has backing link");
                link.node = new.clone();
                link.holder_id
            };
            Self::move_holder(old, new, holder_id)
                .expect("dry-run validated the permission move");
        }
        for h in &parent_handles {
            let holder_id = {
                let mut inner = h.inner.lock().unwrap();
                inner.node = Some(new.clone());
                inner.holder_id
            };
            Self::move_holder(old, new, holder_id)
                .expect("dry-run validated the permission move");
        }
        debug!("graph: replaced node '{}' with '{}'", old.name(), new.name());
        Ok(())
    }

    /// Re-point an existing handle at `node` under a fresh grant, keeping
    /// the handle object alive for its owner.
    pub fn move_handle(
        &self,
        handle: &Arc<BlockHandle>,
        node: &Arc<Node>,
        perm: u32,
        shared: u32,
    ) -> GraphResult<()> {
        let mut graph = self.inner.lock().unwrap();
        let id = Self::alloc_id(&mut graph);
        {
            let mut inner = node.inner.lock().unwrap();
            inner.holders.push(Holder {
                id,
                tag: handle.name.clone(),
                perm,
                shared,
            });
            if let Err(e) = check_holders(node.name(), &inner.holders) {
                inner.holders.retain(|h| h.id != id);
                return Err(e);
            }
        }
        let mut inner = handle.inner.lock().unwrap();
        if let Some(old) = inner.node.take() {
            old.inner
                .lock()
                .unwrap()
                .holders
                .retain(|h| h.id != inner.holder_id);
        }
        inner.node = Some(node.clone());
        inner.holder_id = id;
        inner.perm = perm;
        inner.shared = shared;
        Ok(())
    }

    /// Remove a filter from the graph, splicing its parents onto its child.
    pub fn remove_filter(&self, filter: &Arc<Node>) -> GraphResult<()> {
        let backing = filter.backing();
        {
            let graph = self.inner.lock().unwrap();
            let (parent_nodes, parent_handles) = Self::parents_of(&graph, filter, None);
            match &backing {
                Some(child) => {
                    for n in &parent_nodes {
                        let holder_id = {
                            let mut inner = n.inner.lock().unwrap();
                            let link = inner.backing.as_mut().expect("parent has backing link");
                            link.node = child.clone();
                            link.holder_id
                        };
                        Self::move_holder(filter, child, holder_id)?;
                    }
                    for h in &parent_handles {
                        let holder_id = {
                            let mut inner = h.inner.lock().unwrap();
                            inner.node = Some(child.clone());
                            inner.holder_id
                        };
                        Self::move_holder(filter, child, holder_id)?;
                    }
                }
                None => {
                    for h in &parent_handles {
                        h.inner.lock().unwrap().node = None;
                    }
                }
            }
        }
        // Release the filter's own child link and unregister the node.
        self.set_backing(filter, None)?;
        let mut graph = self.inner.lock().unwrap();
        graph.nodes.retain(|n| !Arc::ptr_eq(n, filter));
        Ok(())
    }

    /// Whether `node` appears in the backing chain rooted at `top`.
    pub fn chain_contains(&self, top: &Arc<Node>, node: &Arc<Node>) -> bool {
        let mut cursor = Some(top.clone());
        while let Some(n) = cursor {
            if Arc::ptr_eq(&n, node) {
                return true;
            }
            cursor = n.backing();
        }
        false
    }

    pub fn drained_begin(&self, node: &Arc<Node>) {
        node.drained_begin_inner();
    }

    /// End a drained section; guest requests blocked on it proceed.
    pub fn drained_end(&self, node: &Arc<Node>) {
        node.drained_end_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ram::RamDisk;

    const CLUSTER: u64 = 65536;

    fn disk(size: u64) -> Box<RamDisk> {
        Box::new(RamDisk::new(size, CLUSTER))
    }

    #[test]
    fn test_chain_read_falls_through_backing() {
        let graph = Graph::new();
        let base = graph.add_disk_node("base", disk(4 * CLUSTER));
        let top = graph.add_disk_node("top", disk(4 * CLUSTER));
        graph.set_backing(&top, Some(base.clone())).unwrap();

        let base_handle = graph
            .attach(&base, "base-writer", perm::CONSISTENT_READ | perm::WRITE, perm::ALL)
            .unwrap();
        base_handle.write(0, &[0xBB; 2 * CLUSTER as usize]).unwrap();

        let top_handle = graph
            .attach(&top, "guest", perm::CONSISTENT_READ | perm::WRITE, perm::ALL)
            .unwrap();
        top_handle.write(0, &[0xAA; CLUSTER as usize]).unwrap();

        let mut buf = vec![0u8; 3 * CLUSTER as usize];
        top_handle.read(0, &mut buf).unwrap();
        assert!(buf[..CLUSTER as usize].iter().all(|&b| b == 0xAA));
        assert!(buf[CLUSTER as usize..2 * CLUSTER as usize]
            .iter()
            .all(|&b| b == 0xBB));
        assert!(buf[2 * CLUSTER as usize..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_block_status_above_layers() {
        let graph = Graph::new();
        let base = graph.add_disk_node("base", disk(4 * CLUSTER));
        let top = graph.add_disk_node("top", disk(4 * CLUSTER));
        graph.set_backing(&top, Some(base.clone())).unwrap();

        let bh = graph
            .attach(&base, "b", perm::CONSISTENT_READ | perm::WRITE, perm::ALL)
            .unwrap();
        bh.write(CLUSTER, &[1; CLUSTER as usize]).unwrap();

        // Unallocated in top, allocated in base.
        let (status, run) = top.block_status_above(None, CLUSTER, CLUSTER);
        assert!(status.data);
        assert_eq!(run, CLUSTER);

        // With base excluded the same range reads as a hole.
        let (status, _) = top.block_status_above(Some(&base), CLUSTER, CLUSTER);
        assert!(!status.allocated);

        let (allocated, _) = top.is_allocated_above(Some(&base), CLUSTER, CLUSTER);
        assert!(!allocated);
        let (allocated, _) = top.is_allocated_above(None, CLUSTER, CLUSTER);
        assert!(allocated);
    }

    #[test]
    fn test_append_and_remove_filter_repoints_handles() {
        let graph = Graph::new();
        let source = graph.add_disk_node("source", disk(CLUSTER));
        let guest = graph
            .attach(&source, "guest", perm::CONSISTENT_READ | perm::WRITE, perm::ALL)
            .unwrap();

        let filter = graph.add_filter_node("mirror-top");
        graph.append_filter(&filter, &source).unwrap();
        assert!(Arc::ptr_eq(&guest.node().unwrap(), &filter));
        assert!(Arc::ptr_eq(&filter.backing().unwrap(), &source));

        // Writes still land on the source and dirty its bitmaps.
        let bitmap = source.create_dirty_bitmap(4096);
        guest.write(0, &[7; 4096]).unwrap();
        assert!(bitmap.is_dirty(0));

        graph.remove_filter(&filter).unwrap();
        assert!(Arc::ptr_eq(&guest.node().unwrap(), &source));
        assert!(graph.find_node("mirror-top").is_none());
    }

    #[test]
    fn test_permission_conflict_on_attach() {
        let graph = Graph::new();
        let node = graph.add_disk_node("disk", disk(CLUSTER));
        let _writer = graph
            .attach(&node, "writer", perm::WRITE, perm::CONSISTENT_READ)
            .unwrap();
        // A second writer is not covered by the first one's shared mask.
        let err = graph
            .attach(&node, "other", perm::WRITE, perm::ALL)
            .unwrap_err();
        assert!(matches!(err, GraphError::PermConflict { .. }));
        // A reader is.
        graph
            .attach(&node, "reader", perm::CONSISTENT_READ, perm::ALL)
            .unwrap();
    }

    #[test]
    fn test_set_perm_release_allows_new_writer() {
        let graph = Graph::new();
        let node = graph.add_disk_node("disk", disk(CLUSTER));
        let writer = graph
            .attach(&node, "writer", perm::WRITE, perm::CONSISTENT_READ)
            .unwrap();
        graph.set_perm(&writer, 0, perm::ALL).unwrap();
        graph
            .attach(&node, "other", perm::WRITE, perm::ALL)
            .unwrap();
    }

    #[test]
    fn test_replace_node_moves_parents() {
        let graph = Graph::new();
        let old = graph.add_disk_node("old", disk(CLUSTER));
        let new = graph.add_disk_node("new", disk(CLUSTER));
        let handle = graph
            .attach(&old, "guest", perm::CONSISTENT_READ | perm::WRITE, perm::ALL)
            .unwrap();

        graph.replace_node(&old, &new).unwrap();
        assert!(Arc::ptr_eq(&handle.node().unwrap(), &new));
        // The holder moved along; a conflicting writer is now rejected on
        // the new node but accepted on the old one.
        assert!(graph
            .attach(&new, "w", perm::WRITE, perm::CONSISTENT_READ)
            .is_err());
        graph
            .attach(&old, "w", perm::WRITE, perm::CONSISTENT_READ)
            .unwrap();
    }

    #[test]
    fn test_replace_node_perm_conflict_leaves_graph_unchanged() {
        let graph = Graph::new();
        let old = graph.add_disk_node("old", disk(CLUSTER));
        let new = graph.add_disk_node("new", disk(CLUSTER));
        let handle = graph
            .attach(&old, "guest", perm::CONSISTENT_READ | perm::WRITE, perm::ALL)
            .unwrap();
        // A holder on `new` that does not share WRITE.
        let _blocker = graph
            .attach(&new, "blocker", 0, perm::CONSISTENT_READ)
            .unwrap();

        let err = graph.replace_node(&old, &new).unwrap_err();
        assert!(matches!(err, GraphError::PermConflict { .. }));
        assert!(Arc::ptr_eq(&handle.node().unwrap(), &old));
    }

    #[test]
    fn test_replace_skips_new_nodes_own_backing_link() {
        // Replacing a source with a target whose backing is that source
        // must not repoint the target's own link onto itself.
        let graph = Graph::new();
        let source = graph.add_disk_node("source", disk(CLUSTER));
        let target = graph.add_disk_node("target", disk(CLUSTER));
        graph.set_backing(&target, Some(source.clone())).unwrap();
        let handle = graph
            .attach(&source, "guest", perm::CONSISTENT_READ, perm::ALL)
            .unwrap();

        graph.replace_node(&source, &target).unwrap();
        assert!(Arc::ptr_eq(&handle.node().unwrap(), &target));
        assert!(Arc::ptr_eq(&target.backing().unwrap(), &source));
    }

    #[test]
    fn test_backing_cycle_rejected() {
        let graph = Graph::new();
        let a = graph.add_disk_node("a", disk(CLUSTER));
        let b = graph.add_disk_node("b", disk(CLUSTER));
        graph.set_backing(&a, Some(b.clone())).unwrap();
        let err = graph.set_backing(&b, Some(a.clone())).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected(_)));
    }

    #[test]
    fn test_drained_section_blocks_guest_writes() {
        let graph = Graph::new();
        let node = graph.add_disk_node("disk", disk(2 * CLUSTER));
        let handle = graph
            .attach(&node, "guest", perm::CONSISTENT_READ | perm::WRITE, perm::ALL)
            .unwrap();

        graph.drained_begin(&node);
        let writer_handle = handle.clone();
        let writer = thread::spawn(move || {
            writer_handle.write(0, &[5; 4096]).unwrap();
        });

        // The write stays blocked while the section is drained.
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!writer.is_finished());
        let mut buf = [0u8; 4096];
        handle.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        graph.drained_end(&node);
        writer.join().unwrap();
        handle.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 5));
    }

    #[test]
    fn test_round_to_clusters() {
        let graph = Graph::new();
        let node = graph.add_disk_node("disk", disk(4 * CLUSTER));
        assert_eq!(node.round_to_clusters(100, 200), (0, CLUSTER));
        assert_eq!(
            node.round_to_clusters(CLUSTER, CLUSTER),
            (CLUSTER, CLUSTER)
        );
        assert_eq!(
            node.round_to_clusters(CLUSTER + 1, CLUSTER),
            (CLUSTER, 2 * CLUSTER)
        );
    }

    #[test]
    fn test_handle_requires_permission() {
        let graph = Graph::new();
        let node = graph.add_disk_node("disk", disk(CLUSTER));
        let reader = graph
            .attach(&node, "reader", perm::CONSISTENT_READ, perm::ALL)
            .unwrap();
        let err = reader.write(0, &[1; 512]).unwrap_err();
        assert!(matches!(err, GraphError::PermissionDenied { .. }));
    }

    #[test]
    fn test_chain_contains() {
        let graph = Graph::new();
        let base = graph.add_disk_node("base", disk(CLUSTER));
        let top = graph.add_disk_node("top", disk(CLUSTER));
        let other = graph.add_disk_node("other", disk(CLUSTER));
        graph.set_backing(&top, Some(base.clone())).unwrap();
        assert!(graph.chain_contains(&top, &base));
        assert!(!graph.chain_contains(&top, &other));
    }
}
