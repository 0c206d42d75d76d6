//! CI environment inspection.
//!
//! The CI system launches one process per parallel node and injects the
//! node's position through environment variables. It also exposes the
//! branch and commit that triggered the build; a build without them was
//! started by hand and has no diff to reason about.
//!
//! Everything here reads from an explicit map rather than the process
//! environment so that callers (and tests) decide where values come from.

use std::collections::HashMap;

/// Index of this node within a step-level parallel strategy.
pub const STEP_INDEX_ENV: &str = "HARNESS_STEP_INDEX";
/// Number of nodes in a step-level parallel strategy.
pub const STEP_TOTAL_ENV: &str = "HARNESS_STEP_TOTAL";
/// Index of this node within a stage-level parallel strategy.
pub const STAGE_INDEX_ENV: &str = "HARNESS_STAGE_INDEX";
/// Number of nodes in a stage-level parallel strategy.
pub const STAGE_TOTAL_ENV: &str = "HARNESS_STAGE_TOTAL";

const SOURCE_BRANCH_ENV: &str = "DRONE_SOURCE_BRANCH";
const TARGET_BRANCH_ENV: &str = "DRONE_TARGET_BRANCH";
const COMMIT_SHA_ENV: &str = "DRONE_COMMIT_SHA";

/// Position of this process among the parallel nodes (0-based index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSlot {
    /// This node's index, in `0..total`.
    pub index: usize,
    /// Total number of nodes.
    pub total: usize,
}

impl NodeSlot {
    /// Creates a slot. No validation happens here; see [`parallelism`].
    pub fn new(index: usize, total: usize) -> Self {
        Self { index, total }
    }

    /// The slot of a non-parallel run.
    pub fn single() -> Self {
        Self { index: 0, total: 1 }
    }
}

/// Reads the parallelism parameters, preferring the step strategy over the
/// stage strategy.
///
/// Returns `None` when parallelism is disabled: either value missing or not
/// a number, `total <= 1`, or an index outside `0..total`.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use tirun::ci_env::{parallelism, NodeSlot};
///
/// let env = HashMap::from([
///     ("HARNESS_STEP_INDEX".to_string(), "1".to_string()),
///     ("HARNESS_STEP_TOTAL".to_string(), "3".to_string()),
/// ]);
/// assert_eq!(parallelism(&env), Some(NodeSlot::new(1, 3)));
/// ```
pub fn parallelism(env: &HashMap<String, String>) -> Option<NodeSlot> {
    slot_from(env, STEP_INDEX_ENV, STEP_TOTAL_ENV)
        .or_else(|| slot_from(env, STAGE_INDEX_ENV, STAGE_TOTAL_ENV))
}

fn slot_from(env: &HashMap<String, String>, index_key: &str, total_key: &str) -> Option<NodeSlot> {
    let index = env.get(index_key)?.trim().parse::<usize>().ok()?;
    let total = env.get(total_key)?.trim().parse::<usize>().ok()?;
    if total <= 1 || index >= total {
        return None;
    }
    Some(NodeSlot { index, total })
}

/// Returns `true` when the build was not triggered by a pull request or a
/// branch push, i.e. any of source branch, target branch or commit sha is
/// unset.
pub fn is_manual_execution(env: &HashMap<String, String>) -> bool {
    [SOURCE_BRANCH_ENV, TARGET_BRANCH_ENV, COMMIT_SHA_ENV]
        .iter()
        .any(|key| env.get(*key).is_none_or(|v| v.is_empty()))
}

/// Snapshot of the process environment.
pub fn process_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parallelism_disabled_without_values() {
        assert_eq!(parallelism(&env(&[])), None);
        assert_eq!(parallelism(&env(&[(STEP_INDEX_ENV, "0")])), None);
    }

    #[test]
    fn test_parallelism_disabled_for_single_node() {
        let e = env(&[(STEP_INDEX_ENV, "0"), (STEP_TOTAL_ENV, "1")]);
        assert_eq!(parallelism(&e), None);
    }

    #[test]
    fn test_parallelism_rejects_out_of_range_index() {
        let e = env(&[(STEP_INDEX_ENV, "3"), (STEP_TOTAL_ENV, "3")]);
        assert_eq!(parallelism(&e), None);
        let e = env(&[(STEP_INDEX_ENV, "x"), (STEP_TOTAL_ENV, "3")]);
        assert_eq!(parallelism(&e), None);
    }

    #[test]
    fn test_parallelism_falls_back_to_stage() {
        let e = env(&[(STAGE_INDEX_ENV, "2"), (STAGE_TOTAL_ENV, "4")]);
        assert_eq!(parallelism(&e), Some(NodeSlot::new(2, 4)));

        let e = env(&[
            (STEP_INDEX_ENV, "0"),
            (STEP_TOTAL_ENV, "2"),
            (STAGE_INDEX_ENV, "2"),
            (STAGE_TOTAL_ENV, "4"),
        ]);
        assert_eq!(parallelism(&e), Some(NodeSlot::new(0, 2)));
    }

    #[test]
    fn test_manual_execution() {
        assert!(is_manual_execution(&env(&[])));
        assert!(is_manual_execution(&env(&[
            (SOURCE_BRANCH_ENV, "feature"),
            (TARGET_BRANCH_ENV, "main"),
            (COMMIT_SHA_ENV, ""),
        ])));
        assert!(!is_manual_execution(&env(&[
            (SOURCE_BRANCH_ENV, "feature"),
            (TARGET_BRANCH_ENV, "main"),
            (COMMIT_SHA_ENV, "abc123"),
        ])));
    }
}
