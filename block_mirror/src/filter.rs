// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! The mirror-top filter node.
//!
//! A pass-through node inserted above the source for the duration of the
//! job: guest I/O flows through it unchanged (so the guest needs no
//! knowledge of the mirror), writes landing below it feed the dirty
//! bitmap, and the node gives the completion stage a stable point to
//! splice the graph around.

use std::sync::Arc;

use block::graph::{Graph, GraphResult, Node};

/// Create the filter and insert it above `source`, repointing the
/// source's existing parents at it.
pub(crate) fn insert_mirror_top(
    graph: &Arc<Graph>,
    source: &Arc<Node>,
    name: &str,
) -> GraphResult<Arc<Node>> {
    let mirror_top = graph.add_filter_node(name);
    match graph.append_filter(&mirror_top, source) {
        Ok(()) => Ok(mirror_top),
        Err(e) => {
            let _ = graph.remove_filter(&mirror_top);
            Err(e)
        }
    }
}

/// Take the filter back out, restoring the original chain. Used on the
/// start-failure path; the regular teardown happens in the exit stage.
pub(crate) fn remove_mirror_top(graph: &Arc<Graph>, mirror_top: &Arc<Node>) {
    let _ = graph.set_child_perm(mirror_top, 0);
    if let Err(e) = graph.remove_filter(mirror_top) {
        warn!("failed removing mirror-top filter: {e}");
    }
}
