//! Cost estimation for test groups.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use super::CostMap;

/// Equal weights: every group costs 1.
pub fn equal_costs(groups: &BTreeSet<String>) -> CostMap {
    groups.iter().map(|g| (g.clone(), 1.0)).collect()
}

/// Line count of each group's file, read relative to `workspace`.
///
/// Unreadable files are left out; [`fill_missing`] assigns them a cost.
pub async fn line_count_costs(workspace: &Path, groups: &BTreeSet<String>) -> CostMap {
    let mut costs = BTreeMap::new();
    for group in groups {
        match tokio::fs::read(workspace.join(group)).await {
            Ok(bytes) => {
                costs.insert(group.clone(), count_lines(&bytes) as f64);
            }
            Err(e) => {
                tracing::debug!(file = %group, error = %e, "Cannot count lines");
            }
        }
    }
    costs
}

fn count_lines(bytes: &[u8]) -> usize {
    let newlines = bytes.iter().filter(|b| **b == b'\n').count();
    match bytes.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

/// Historical durations restricted to the groups being split.
pub fn timing_costs(times: &HashMap<String, f64>, groups: &BTreeSet<String>) -> CostMap {
    groups
        .iter()
        .filter_map(|g| times.get(g).map(|t| (g.clone(), *t)))
        .collect()
}

/// Completes `costs` so that every group has a usable cost.
///
/// Negative or non-finite costs are clamped to 0. Groups without a cost get
/// the average of the known costs, or 1 when nothing is known. Costs of
/// groups outside `groups` are dropped.
pub fn fill_missing(mut costs: CostMap, groups: &BTreeSet<String>) -> CostMap {
    costs.retain(|g, _| groups.contains(g));
    for cost in costs.values_mut() {
        if !cost.is_finite() || *cost < 0.0 {
            *cost = 0.0;
        }
    }

    let default = if costs.is_empty() {
        1.0
    } else {
        costs.values().sum::<f64>() / costs.len() as f64
    };

    for group in groups {
        costs.entry(group.clone()).or_insert(default);
    }
    costs
}
