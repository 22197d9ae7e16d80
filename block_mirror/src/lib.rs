// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Disk mirroring block job.
//!
//! Continuously copies a live, actively written source disk to a target
//! disk in granularity-sized chunks (driven by a dirty bitmap, under
//! bounded concurrency and optional rate limiting) until the two images
//! are equivalent, then atomically substitutes the target for the source
//! in the storage graph. Also provides the active-commit flavor, where
//! the target is the base of the source's own backing chain.

#[macro_use]
extern crate log;

mod buffer_pool;
mod exit;
mod filter;
mod in_flight;
mod job;
mod ops;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use block::align_up;
use block::graph::{perm, BlockHandle, Graph, GraphError, Node};
use block_jobs::{JobError, JobHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::{insert_mirror_top, remove_mirror_top};
use crate::job::{
    run_job, MirrorSetup, MirrorShared, DEFAULT_GRANULARITY, DEFAULT_MIRROR_BUF_SIZE,
    REPLACE_BLOCKER_REASON,
};

pub use block_jobs::{IoStatus, OnError};

/// What the initial catch-up phase copies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// The whole device.
    #[default]
    Full,
    /// Only data allocated above the source's backing file.
    Top,
    /// Nothing; stream new writes only.
    None,
    /// Unsupported, rejected at start.
    Incremental,
}

/// What backing chain the target ends up with at completion time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackingMode {
    /// Point the target at the source's chain (or the configured base).
    #[default]
    SourceBackingChain,
    /// Open the target's own backing reference when completing.
    OpenBackingChain,
    /// Leave the target's chain alone.
    LeaveBackingChain,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorOptions {
    pub job_id: String,
    /// Name of a node to substitute instead of the source at completion.
    pub replaces: Option<String>,
    /// Rate limit in bytes per second; 0 means unlimited.
    pub speed: u64,
    /// Chunk size; 0 selects the default. Must be a power of two.
    pub granularity: u64,
    /// Copy buffer size; 0 selects the default.
    pub buf_size: u64,
    pub sync: SyncMode,
    pub backing_mode: BackingMode,
    pub on_source_error: OnError,
    pub on_target_error: OnError,
    /// Allow zero regions to be deallocated on the target.
    pub unmap: bool,
    pub filter_node_name: Option<String>,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        MirrorOptions {
            job_id: "mirror".to_string(),
            replaces: None,
            speed: 0,
            granularity: 0,
            buf_size: 0,
            sync: SyncMode::Full,
            backing_mode: BackingMode::SourceBackingChain,
            on_source_error: OnError::Report,
            on_target_error: OnError::Report,
            unmap: true,
            filter_node_name: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("Invalid parameter 'granularity': must be a power of two")]
    InvalidGranularity,
    #[error("Sync mode 'incremental' not supported")]
    IncrementalNotSupported,
    #[error("Graph operation failed")]
    Graph(#[source] GraphError),
    #[error("Failed starting the job")]
    Job(#[source] JobError),
}

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("The block job cannot be completed before it is synced")]
    NotSynced,
    #[error("Node name '{0}' not found")]
    NodeNotFound(String),
    #[error("The target has no backing reference to open")]
    NoBackingReference,
    #[error("Graph operation failed")]
    Graph(#[source] GraphError),
    #[error("The mirror job failed with I/O error (errno {0})")]
    Io(i32),
    #[error("The mirror job was cancelled")]
    Cancelled,
}

/// Controlling handle for a running mirror job.
pub struct MirrorHandle {
    job: JobHandle,
    shared: Arc<MirrorShared>,
    graph: Arc<Graph>,
    backing_mode: BackingMode,
    replaces: Option<String>,
    target_node: Arc<Node>,
    intermediates: Vec<Arc<BlockHandle>>,
}

impl std::fmt::Debug for MirrorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorHandle")
            .field("backing_mode", &self.backing_mode)
            .field("replaces", &self.replaces)
            .finish_non_exhaustive()
    }
}

impl MirrorHandle {
    /// Whether the target has caught up with the source at least once.
    pub fn is_ready(&self) -> bool {
        self.job.is_ready()
    }

    pub fn pause(&self) {
        self.job.pause();
    }

    pub fn resume(&self) {
        self.job.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.job.is_paused()
    }

    /// Request cancellation. Before the sync point this aborts without
    /// any consistency guarantee for the target; afterwards it finishes
    /// cleanly like a completion request, but without the graph swap.
    pub fn cancel(&self) {
        self.job.cancel();
    }

    pub fn set_speed(&self, bytes_per_sec: u64) {
        self.job.set_speed(bytes_per_sec);
    }

    pub fn iostatus(&self) -> IoStatus {
        self.job.iostatus()
    }

    pub fn progress(&self) -> (u64, u64) {
        self.job.progress()
    }

    /// Request graceful completion with the graph swap. Fails until the
    /// job has reached the sync point.
    pub fn complete(&self) -> Result<(), MirrorError> {
        if !self.shared.synced.load(Ordering::Acquire) {
            return Err(MirrorError::NotSynced);
        }

        if self.backing_mode == BackingMode::OpenBackingChain
            && self.target_node.backing().is_none()
        {
            let reference = self
                .target_node
                .backing_hint()
                .ok_or(MirrorError::NoBackingReference)?;
            let backing = self
                .graph
                .find_node(&reference)
                .ok_or_else(|| MirrorError::NodeNotFound(reference.clone()))?;
            self.graph
                .set_backing(&self.target_node, Some(backing))
                .map_err(MirrorError::Graph)?;
        }

        if let Some(name) = &self.replaces {
            let node = self
                .graph
                .find_node(name)
                .ok_or_else(|| MirrorError::NodeNotFound(name.clone()))?;
            node.op_block(REPLACE_BLOCKER_REASON);
            *self.shared.to_replace.lock().unwrap() = Some(node);
        }

        self.shared.should_complete.store(true, Ordering::Release);
        self.job.kick();
        Ok(())
    }

    /// Wait for the job to finish, run its completion stage on this
    /// thread, and report the final outcome.
    pub fn join(&self) -> Result<(), MirrorError> {
        let code = self.job.join();
        for handle in &self.intermediates {
            self.graph.detach(handle);
        }
        if code < 0 {
            Err(MirrorError::Io(-code))
        } else if self.job.is_cancelled() {
            Err(MirrorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Start mirroring `source` onto `target`.
pub fn start(
    graph: &Arc<Graph>,
    source: &Arc<Node>,
    target: &Arc<Node>,
    options: MirrorOptions,
) -> Result<MirrorHandle, StartError> {
    if options.sync == SyncMode::Incremental {
        return Err(StartError::IncrementalNotSupported);
    }
    let is_none_mode = options.sync == SyncMode::None;
    let base = if options.sync == SyncMode::Top {
        source.backing()
    } else {
        None
    };
    start_job(graph, source, target, &options, is_none_mode, base, false)
}

/// Start committing the active layer `top` into `base`, its (possibly
/// indirect) backing file. The base is reopened writable for the
/// duration; `auto_complete` finishes the job as soon as it converges.
pub fn commit_active_start(
    graph: &Arc<Graph>,
    top: &Arc<Node>,
    base: &Arc<Node>,
    options: MirrorOptions,
    auto_complete: bool,
) -> Result<MirrorHandle, StartError> {
    let orig_base_read_only = base.read_only();
    base.set_read_only(top.read_only());

    let mut options = options;
    options.sync = SyncMode::Full;
    options.backing_mode = BackingMode::LeaveBackingChain;
    options.replaces = None;
    options.unmap = true;

    match start_job(
        graph,
        top,
        base,
        &options,
        false,
        Some(base.clone()),
        auto_complete,
    ) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            // Restore the base's original open flags; the original error
            // is the one worth propagating.
            base.set_read_only(orig_base_read_only);
            Err(e)
        }
    }
}

fn start_job(
    graph: &Arc<Graph>,
    source: &Arc<Node>,
    target_node: &Arc<Node>,
    options: &MirrorOptions,
    is_none_mode: bool,
    base: Option<Arc<Node>>,
    auto_complete: bool,
) -> Result<MirrorHandle, StartError> {
    let granularity = if options.granularity == 0 {
        DEFAULT_GRANULARITY
    } else {
        options.granularity
    };
    if !granularity.is_power_of_two() {
        return Err(StartError::InvalidGranularity);
    }
    if options.sync == SyncMode::Incremental {
        return Err(StartError::IncrementalNotSupported);
    }
    let buf_size = align_up(
        if options.buf_size == 0 {
            DEFAULT_MIRROR_BUF_SIZE
        } else {
            options.buf_size
        },
        granularity,
    );

    target_node.assert_unblocked().map_err(StartError::Graph)?;

    let filter_name = options
        .filter_node_name
        .clone()
        .unwrap_or_else(|| format!("{}-top", options.job_id));
    let mirror_top = insert_mirror_top(graph, source, &filter_name).map_err(StartError::Graph)?;

    // Keep the source chain consistent-readable and unresized while the
    // job runs.
    let job_blk = match graph.attach(
        &mirror_top,
        &format!("{}-job", options.job_id),
        perm::CONSISTENT_READ,
        perm::CONSISTENT_READ | perm::WRITE_UNCHANGED | perm::WRITE | perm::GRAPH_MOD,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            remove_mirror_top(graph, &mirror_top);
            return Err(StartError::Graph(e));
        }
    };

    // No resize for the target either; while the mirror is running a
    // consistent read of the target is not necessarily possible, so other
    // writers stay blocked. Active commit differs: there the target is a
    // populated backing file in active use and everything except resize
    // is shared.
    let target_is_backing = graph.chain_contains(source, target_node);
    let target_graph_mod = options.backing_mode != BackingMode::LeaveBackingChain;
    let mut target_perm = perm::WRITE | perm::RESIZE;
    if target_graph_mod {
        target_perm |= perm::GRAPH_MOD;
    }
    let mut target_shared = perm::WRITE_UNCHANGED;
    if target_is_backing {
        target_shared |= perm::CONSISTENT_READ | perm::WRITE | perm::GRAPH_MOD;
    }
    let target = match graph.attach(
        target_node,
        &format!("{}-target", options.job_id),
        target_perm,
        target_shared,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            graph.detach(&job_blk);
            remove_mirror_top(graph, &mirror_top);
            return Err(StartError::Graph(e));
        }
    };

    // In active commit all intermediate nodes disappear at completion, so
    // jobs on them must be blocked for the duration.
    let mut intermediates = Vec::new();
    if target_is_backing {
        let mut cursor = source.backing();
        while let Some(node) = cursor {
            if Arc::ptr_eq(&node, target_node) {
                break;
            }
            match graph.attach(
                &node,
                &format!("{}-intermediate", options.job_id),
                0,
                perm::WRITE_UNCHANGED | perm::WRITE,
            ) {
                Ok(handle) => intermediates.push(handle),
                Err(e) => {
                    for handle in &intermediates {
                        graph.detach(handle);
                    }
                    graph.detach(&target);
                    graph.detach(&job_blk);
                    remove_mirror_top(graph, &mirror_top);
                    return Err(StartError::Graph(e));
                }
            }
            cursor = node.backing();
        }
    }

    let dirty_bitmap = source.create_dirty_bitmap(granularity);
    let shared = MirrorShared::new(auto_complete);

    let setup = MirrorSetup {
        graph: graph.clone(),
        mirror_top: mirror_top.clone(),
        source: source.clone(),
        target: target.clone(),
        target_node: target_node.clone(),
        job_blk: job_blk.clone(),
        base,
        is_none_mode,
        backing_mode: options.backing_mode,
        on_source_error: options.on_source_error,
        on_target_error: options.on_target_error,
        unmap: options.unmap,
        granularity,
        buf_size,
        dirty_bitmap: dirty_bitmap.clone(),
        shared: shared.clone(),
    };

    info!(
        "starting mirror job '{}': {:?} sync, granularity {}, buffer {}",
        options.job_id, options.sync, granularity, buf_size
    );
    let job = match block_jobs::spawn(&options.job_id, move |ctx| run_job(setup, ctx)) {
        Ok(job) => job,
        Err(e) => {
            source.release_dirty_bitmap(&dirty_bitmap);
            for handle in &intermediates {
                graph.detach(handle);
            }
            graph.detach(&target);
            graph.detach(&job_blk);
            remove_mirror_top(graph, &mirror_top);
            return Err(StartError::Job(e));
        }
    };
    job.set_speed(options.speed);

    Ok(MirrorHandle {
        job,
        shared,
        graph: graph.clone(),
        backing_mode: options.backing_mode,
        replaces: options.replaces.clone(),
        target_node: target_node.clone(),
        intermediates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use block::ram::RamDisk;

    #[test]
    fn test_incremental_sync_rejected() {
        let graph = Graph::new();
        let source = graph.add_disk_node("source", Box::new(RamDisk::new(1 << 20, 65536)));
        let target = graph.add_disk_node("target", Box::new(RamDisk::new(1 << 20, 65536)));
        let err = start(
            &graph,
            &source,
            &target,
            MirrorOptions {
                sync: SyncMode::Incremental,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, StartError::IncrementalNotSupported));
        // The graph is untouched.
        assert!(source.backing().is_none());
        assert!(graph.find_node("mirror-top").is_none());
    }

    #[test]
    fn test_bad_granularity_rejected() {
        let graph = Graph::new();
        let source = graph.add_disk_node("source", Box::new(RamDisk::new(1 << 20, 65536)));
        let target = graph.add_disk_node("target", Box::new(RamDisk::new(1 << 20, 65536)));
        let err = start(
            &graph,
            &source,
            &target,
            MirrorOptions {
                granularity: 3000,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, StartError::InvalidGranularity));
    }

    #[test]
    fn test_blocked_target_rejected_and_graph_restored() {
        let graph = Graph::new();
        let source = graph.add_disk_node("source", Box::new(RamDisk::new(1 << 20, 65536)));
        let target = graph.add_disk_node("target", Box::new(RamDisk::new(1 << 20, 65536)));
        target.op_block("in use elsewhere");
        let err = start(&graph, &source, &target, MirrorOptions::default()).unwrap_err();
        assert!(matches!(err, StartError::Graph(GraphError::Blocked { .. })));
        assert!(graph.find_node("mirror-top").is_none());
    }

    #[test]
    fn test_options_serde_roundtrip() {
        let options = MirrorOptions {
            sync: SyncMode::Top,
            backing_mode: BackingMode::OpenBackingChain,
            on_target_error: OnError::Stop,
            granularity: 4096,
            ..Default::default()
        };
        let json = serde_json::to_string(&options).unwrap();
        let back: MirrorOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sync, SyncMode::Top);
        assert_eq!(back.backing_mode, BackingMode::OpenBackingChain);
        assert_eq!(back.on_target_error, OnError::Stop);
        assert_eq!(back.granularity, 4096);
    }
}
