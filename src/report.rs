//! Artifact collection after a test run.
//!
//! Two independent artifacts are gathered once the command has finished:
//! the callgraph files written by the coverage agent, and the JUnit reports
//! produced by the build tool. Both collectors always run; how their errors
//! are treated depends on whether the run succeeded and is decided by the
//! orchestrator.
//!
//! [`LocalCollector`] consolidates both into the output directory:
//!
//! ```text
//! <output_dir>/
//! ├── <step_id>-callgraph.json   # agent callgraph files, merged
//! └── <step_id>-reports.json     # parsed JUnit test cases with totals
//! ```

pub mod junit;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ReportSpec;
pub use junit::{CaseStatus, TestCaseReport, parse_junit};

/// Result type for artifact collection.
pub type CollectResult<T> = Result<T, CollectError>;

/// Errors raised while collecting artifacts.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// Reading or writing a file failed.
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A callgraph file is not valid JSON.
    #[error("invalid callgraph file {}: {message}", path.display())]
    InvalidCallgraph { path: PathBuf, message: String },

    /// A report file is not valid JUnit XML.
    #[error("invalid JUnit report {}: {message}", path.display())]
    InvalidReport { path: PathBuf, message: String },

    /// A report path pattern is malformed.
    #[error("invalid report pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Encoding the consolidated output failed.
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Harvests the artifacts of a finished run.
#[async_trait]
pub trait ArtifactCollector: Send + Sync {
    /// Collects the callgraph files the agent wrote into `dir`.
    async fn collect_callgraph(&self, step_id: &str, dir: &Path, elapsed_ms: u64)
    -> CollectResult<()>;

    /// Collects the test reports described by `reports`.
    async fn collect_test_reports(&self, reports: &[ReportSpec], step_id: &str)
    -> CollectResult<()>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallgraphBundle {
    step_id: String,
    elapsed_ms: u64,
    files: Vec<String>,
    callgraph: Vec<serde_json::Value>,
}

/// Totals over the collected test cases.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportTotals {
    pub tests: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl ReportTotals {
    fn count(cases: &[TestCaseReport]) -> Self {
        let mut totals = Self {
            tests: cases.len(),
            ..Default::default()
        };
        for case in cases {
            match case.status {
                CaseStatus::Failed => totals.failed += 1,
                CaseStatus::Error => totals.errors += 1,
                CaseStatus::Skipped => totals.skipped += 1,
                CaseStatus::Passed => {}
            }
        }
        totals
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportSummary {
    step_id: String,
    files: Vec<String>,
    totals: ReportTotals,
    cases: Vec<TestCaseReport>,
}

/// Collects artifacts into a local output directory.
pub struct LocalCollector {
    workspace: PathBuf,
    output_dir: PathBuf,
}

impl LocalCollector {
    /// Creates a collector resolving report patterns against `workspace` and
    /// writing into `output_dir` (relative paths are taken from `workspace`).
    pub fn new(workspace: impl Into<PathBuf>, output_dir: impl AsRef<Path>) -> Self {
        let workspace = workspace.into();
        let output_dir = workspace.join(output_dir);
        Self {
            workspace,
            output_dir,
        }
    }

    /// Path of the consolidated callgraph for a step.
    pub fn callgraph_path(&self, step_id: &str) -> PathBuf {
        self.output_dir.join(format!("{}-callgraph.json", step_id))
    }

    /// Path of the report summary for a step.
    pub fn reports_path(&self, step_id: &str) -> PathBuf {
        self.output_dir.join(format!("{}-reports.json", step_id))
    }

    fn report_files(&self, reports: &[ReportSpec]) -> CollectResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for spec in reports {
            for pattern in &spec.paths {
                let full = if Path::new(pattern).is_absolute() {
                    pattern.clone()
                } else {
                    self.workspace.join(pattern).to_string_lossy().into_owned()
                };
                let entries = glob::glob(&full).map_err(|e| CollectError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: e.msg.to_string(),
                })?;
                for entry in entries {
                    match entry {
                        Ok(path) if path.is_file() => files.push(path),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Skipping unreadable report path"),
                    }
                }
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    async fn write_json<T: Serialize>(
        &self,
        path: &Path,
        what: &'static str,
        value: &T,
    ) -> CollectResult<()> {
        let data = serde_json::to_vec_pretty(value).map_err(|source| CollectError::Encode {
            what,
            source,
        })?;
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| CollectError::Io {
                path: self.output_dir.clone(),
                source,
            })?;
        tokio::fs::write(path, data)
            .await
            .map_err(|source| CollectError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

async fn read(path: &Path) -> CollectResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CollectError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[async_trait]
impl ArtifactCollector for LocalCollector {
    async fn collect_callgraph(
        &self,
        step_id: &str,
        dir: &Path,
        elapsed_ms: u64,
    ) -> CollectResult<()> {
        if !dir.is_dir() {
            info!(dir = %dir.display(), "No callgraph directory, nothing to collect");
            return Ok(());
        }

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|source| CollectError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        while let Some(entry) = entries.next_entry().await.map_err(|source| CollectError::Io {
            path: dir.to_path_buf(),
            source,
        })? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        if paths.is_empty() {
            info!(dir = %dir.display(), "No callgraph files found");
            return Ok(());
        }

        let mut bundle = CallgraphBundle {
            step_id: step_id.to_string(),
            elapsed_ms,
            files: Vec::with_capacity(paths.len()),
            callgraph: Vec::with_capacity(paths.len()),
        };
        for path in &paths {
            let data = read(path).await?;
            let value = serde_json::from_str(&data).map_err(|e| CollectError::InvalidCallgraph {
                path: path.clone(),
                message: e.to_string(),
            })?;
            bundle.files.push(path.to_string_lossy().into_owned());
            bundle.callgraph.push(value);
        }

        let out = self.callgraph_path(step_id);
        self.write_json(&out, "callgraph", &bundle).await?;
        info!(
            step = step_id,
            files = paths.len(),
            path = %out.display(),
            "Collected callgraph"
        );
        Ok(())
    }

    async fn collect_test_reports(
        &self,
        reports: &[ReportSpec],
        step_id: &str,
    ) -> CollectResult<()> {
        if reports.is_empty() {
            return Ok(());
        }

        let files = self.report_files(reports)?;
        if files.is_empty() {
            warn!(step = step_id, "No test report files matched");
            return Ok(());
        }

        let mut cases = Vec::new();
        for path in &files {
            let xml = read(path).await?;
            let parsed = parse_junit(&xml).map_err(|message| CollectError::InvalidReport {
                path: path.clone(),
                message,
            })?;
            cases.extend(parsed);
        }

        let summary = ReportSummary {
            step_id: step_id.to_string(),
            files: files
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            totals: ReportTotals::count(&cases),
            cases,
        };
        let out = self.reports_path(step_id);
        self.write_json(&out, "test reports", &summary).await?;
        info!(
            step = step_id,
            tests = summary.totals.tests,
            failed = summary.totals.failed,
            errors = summary.totals.errors,
            "Collected test reports"
        );
        Ok(())
    }
}
