//! Least-loaded remote build node selection
//!
//! Load is the number of live, non-terminal jobs assigned to a node, counted
//! from the job records at selection time. Jobs are only counted once they
//! are persisted, so a burst of near-simultaneous requests can all pick the
//! same node.

use std::collections::HashMap;

use ims_common::models::{Arch, Job, RemoteBuildNode};
use ims_common::{Error, Result};
use serde::Serialize;
use uuid::Uuid;

/// A node together with its current load
#[derive(Debug, Clone, Serialize)]
pub struct NodeLoad {
    #[serde(flatten)]
    pub node: RemoteBuildNode,
    pub active_jobs: usize,
}

/// Active job count per assigned node
pub fn active_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> HashMap<Uuid, usize> {
    let mut counts = HashMap::new();
    for job in jobs.into_iter().filter(|job| job.is_active()) {
        if let Some(node_id) = job.remote_build_node {
            *counts.entry(node_id).or_insert(0) += 1;
        }
    }
    counts
}

/// Every node with its load, in listing order
pub fn node_loads<'a>(
    nodes: impl IntoIterator<Item = &'a RemoteBuildNode>,
    jobs: impl IntoIterator<Item = &'a Job>,
) -> Vec<NodeLoad> {
    let counts = active_jobs(jobs);
    nodes
        .into_iter()
        .map(|node| NodeLoad {
            node: node.clone(),
            active_jobs: counts.get(&node.id).copied().unwrap_or(0),
        })
        .collect()
}

/// Pick the enabled node of `arch` running the fewest active jobs.
///
/// Ties go to the node listed first. Fails with `NoAvailableNode` when no
/// enabled node of `arch` exists.
pub fn select_node<'a>(
    nodes: impl IntoIterator<Item = &'a RemoteBuildNode>,
    jobs: impl IntoIterator<Item = &'a Job>,
    arch: Arch,
) -> Result<&'a RemoteBuildNode> {
    let counts = active_jobs(jobs);

    nodes
        .into_iter()
        .filter(|node| node.is_enabled() && node.arch == arch)
        .enumerate()
        .min_by_key(|(position, node)| (counts.get(&node.id).copied().unwrap_or(0), *position))
        .map(|(_, node)| node)
        .ok_or(Error::NoAvailableNode(arch))
}
