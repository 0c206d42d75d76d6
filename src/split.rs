//! Test splitting across parallel nodes.
//!
//! Tests are grouped (by class, or by file for line-count splitting), each
//! group gets a cost estimate, and the groups are packed into one bucket per
//! node with [`scheduler::pack`]. A node keeps only the tests of its own
//! bucket.
//!
//! # Strategies
//!
//! | Strategy | Config value | Group key | Cost |
//! |----------|--------------|-----------|------|
//! | [`SplitStrategy::HistoricalTiming`] | `class_timing` | `pkg.class` | average duration from the timing service |
//! | [`SplitStrategy::LineCount`] | `file_size` | autodetect path | lines in the file |
//! | [`SplitStrategy::Equal`] | `split_equal` | `pkg.class` | 1 |
//!
//! Groups without a cost get the average of the known costs (1 when none
//! are known). Splitting is deterministic: every node runs the same
//! computation on the same inputs and takes a disjoint share.

pub mod estimator;
pub mod scheduler;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ci_env::NodeSlot;
use crate::model::RunnableTest;
use crate::service::ServiceError;

pub use scheduler::Bucket;

/// Estimated cost of each test group.
pub type CostMap = BTreeMap<String, f64>;

/// Result type for splitting.
pub type SplitResult<T> = Result<T, SplitError>;

/// Errors raised while splitting.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// Historical timing data could not be fetched.
    #[error("test timing data unavailable: {0}")]
    TimingUnavailable(#[source] ServiceError),

    /// The node index is outside the node count.
    #[error("invalid node index {index} for {total} nodes")]
    InvalidNode { index: usize, total: usize },
}

/// How test groups are weighted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStrategy {
    /// Every group weighs the same.
    #[serde(rename = "split_equal")]
    Equal,
    /// Weight by the line count of the test file.
    #[serde(rename = "file_size")]
    LineCount,
    /// Weight by recorded durations.
    #[default]
    #[serde(rename = "class_timing")]
    HistoricalTiming,
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SplitStrategy::Equal => "split_equal",
            SplitStrategy::LineCount => "file_size",
            SplitStrategy::HistoricalTiming => "class_timing",
        })
    }
}

/// Source of historical test durations.
#[async_trait]
pub trait TimingService: Send + Sync {
    /// Average duration in seconds per test group (`pkg.class`).
    async fn test_times(&self, include_suite_detail: bool)
    -> Result<HashMap<String, f64>, ServiceError>;
}

/// Grouping key of a test under `strategy`.
pub fn group_key(test: &RunnableTest, strategy: SplitStrategy) -> String {
    match strategy {
        SplitStrategy::LineCount if !test.autodetect.path.is_empty() => {
            test.autodetect.path.clone()
        }
        _ => test.qualified_class(),
    }
}

/// Partitions tests across parallel nodes.
pub struct Splitter {
    workspace: PathBuf,
    timing: Option<Arc<dyn TimingService>>,
}

impl Splitter {
    /// Creates a splitter reading files relative to `workspace`.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            timing: None,
        }
    }

    /// Sets the source of historical durations.
    pub fn with_timing(mut self, timing: Arc<dyn TimingService>) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Returns the tests assigned to `node`.
    ///
    /// Tests of one group stay together and keep their input order; groups
    /// appear in the order they were assigned to the bucket. A single node
    /// gets every test back unchanged.
    pub async fn split(
        &self,
        tests: Vec<RunnableTest>,
        strategy: SplitStrategy,
        node: NodeSlot,
    ) -> SplitResult<Vec<RunnableTest>> {
        if node.total > 0 && node.index >= node.total {
            return Err(SplitError::InvalidNode {
                index: node.index,
                total: node.total,
            });
        }
        if tests.is_empty() || node.total <= 1 {
            return Ok(tests);
        }

        let mut groups: HashMap<String, Vec<RunnableTest>> = HashMap::new();
        let mut keys = BTreeSet::new();
        for test in tests {
            let key = group_key(&test, strategy);
            keys.insert(key.clone());
            groups.entry(key).or_default().push(test);
        }

        let costs = self.estimate(strategy, &keys).await?;
        let costs = estimator::fill_missing(costs, &keys);
        let mut buckets = scheduler::pack(&costs, node.total);
        let mine = std::mem::take(&mut buckets[node.index]);

        tracing::info!(
            strategy = %strategy,
            node = node.index,
            total = node.total,
            groups = mine.groups.len(),
            load = mine.load,
            "Split tests"
        );

        Ok(mine
            .groups
            .iter()
            .filter_map(|key| groups.remove(key))
            .flatten()
            .collect())
    }

    async fn estimate(
        &self,
        strategy: SplitStrategy,
        keys: &BTreeSet<String>,
    ) -> SplitResult<CostMap> {
        match strategy {
            SplitStrategy::Equal => Ok(estimator::equal_costs(keys)),
            SplitStrategy::LineCount => Ok(estimator::line_count_costs(&self.workspace, keys).await),
            SplitStrategy::HistoricalTiming => {
                let Some(timing) = &self.timing else {
                    return Err(SplitError::TimingUnavailable(ServiceError::NotConfigured));
                };
                let times = timing
                    .test_times(false)
                    .await
                    .map_err(SplitError::TimingUnavailable)?;
                Ok(estimator::timing_costs(&times, keys))
            }
        }
    }
}
