// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! The completion stage: runs once, after the run loop has quiesced all
//! I/O, on the thread joining the job. Each step tolerates failure:
//! errors are recorded into the final code, but cleanup always runs to
//! the end so no references, permissions or graph state leak.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use block::bitmap::DirtyBitmap;
use block::graph::{perm, BlockHandle, Graph, Node};

use crate::job::{MirrorShared, REPLACE_BLOCKER_REASON};
use crate::BackingMode;

pub(crate) struct ExitData {
    pub graph: Arc<Graph>,
    pub mirror_top: Arc<Node>,
    pub source: Arc<Node>,
    pub target: Arc<BlockHandle>,
    pub target_node: Arc<Node>,
    pub job_blk: Arc<BlockHandle>,
    pub base: Option<Arc<Node>>,
    pub backing_mode: BackingMode,
    pub is_none_mode: bool,
    pub shared: Arc<MirrorShared>,
    pub dirty_bitmap: Arc<DirtyBitmap>,
}

pub(crate) fn mirror_exit(data: ExitData, run_ret: i32) -> i32 {
    let mut ret = run_ret;
    let graph = &data.graph;

    data.source.release_dirty_bitmap(&data.dirty_bitmap);

    // These clones keep source, filter and target alive through the whole
    // sequence even as links to them are dropped below.
    let source = data.source.clone();
    let mirror_top = data.mirror_top.clone();
    let target_node = data.target_node.clone();

    // Drop the write/resize grant on the target before it can be inserted
    // where those permissions might not be obtainable. The explicit
    // release matters: the handle may be kept open by a concurrent drain,
    // so dropping it alone would not give the permissions back.
    if let Err(e) = graph.set_perm(&data.target, 0, perm::ALL) {
        warn!("mirror exit: releasing target permissions: {e}");
    }
    graph.detach(&data.target);

    // The source is not written anymore; give up WRITE/RESIZE on the
    // filter's child link before the source can become a backing file.
    if let Err(e) = graph.set_child_perm(&mirror_top, 0) {
        warn!("mirror exit: releasing filter child permissions: {e}");
    }

    if data.backing_mode == BackingMode::SourceBackingChain {
        let backing = if data.is_none_mode {
            Some(source.clone())
        } else {
            data.base.clone()
        };
        if let Some(backing) = backing {
            let current = target_node.backing();
            if !current.is_some_and(|c| Arc::ptr_eq(&c, &backing)) {
                if let Err(e) = graph.set_backing(&target_node, Some(backing)) {
                    error!("mirror exit: attaching backing chain to target: {e}");
                    ret = -libc::EPERM;
                }
            }
        }
    }

    let should_complete = data.shared.should_complete.load(Ordering::Acquire);
    let to_replace = data.shared.to_replace.lock().unwrap().take();

    if should_complete && ret == 0 {
        let replaced = to_replace.clone().unwrap_or_else(|| source.clone());

        // Align open flags with the node being replaced.
        if target_node.read_only() != replaced.read_only() {
            target_node.set_read_only(replaced.read_only());
        }

        // The job has no requests in flight anymore, but other users of
        // the node must not observe a half-updated graph.
        graph.drained_begin(&target_node);
        let result = graph.replace_node(&replaced, &target_node);
        graph.drained_end(&target_node);
        if let Err(e) = result {
            error!("mirror exit: graph substitution failed: {e}");
            ret = -libc::EPERM;
        }
    }

    if let Some(replaced) = &to_replace {
        replaced.op_unblock(REPLACE_BLOCKER_REASON);
    }

    // Remove the filter, splicing the original chain back beneath it.
    // Permission blockers on the child link have to go first or they
    // would block the removal itself.
    if let Err(e) = graph.set_child_perm(&mirror_top, 0) {
        warn!("mirror exit: stripping filter child permissions: {e}");
    }
    if let Err(e) = graph.remove_filter(&mirror_top) {
        warn!("mirror exit: removing filter node: {e}");
    }

    // The node replacements above moved the job's own handle along with
    // every other parent; park it back on the filter node, without any
    // permissions, so releasing it cannot disturb the new chain.
    if let Err(e) = graph.move_handle(&data.job_blk, &mirror_top, 0, perm::ALL) {
        warn!("mirror exit: re-pointing job handle: {e}");
    }
    graph.detach(&data.job_blk);

    // Pairs with the drained section the run loop left on the source.
    graph.drained_end(&source);

    info!(
        "mirror exit: job finished with code {}, swapped: {}",
        ret,
        should_complete && ret == 0
    );
    ret
}
