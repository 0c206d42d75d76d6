//! Configuration schema definitions for tirun.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── StepConfig      - What to test and how (language, build tool, retries, splitting)
//! ├── AgentConfig     - Where the instrumentation agents live
//! ├── ServiceConfig   - Test Intelligence service endpoint (optional)
//! └── ReportConfig    - Where collected artifacts are written
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::runner::{BuildTool, Language};
use crate::split::SplitStrategy;

/// Root configuration structure for tirun.
///
/// # TOML Structure
///
/// ```toml
/// [step]
/// id = "unit-tests"
/// language = "java"
/// build_tool = "maven"
/// args = "test"
/// num_retries = 2
///
/// [service]
/// endpoint = "https://ti.example.com"
///
/// [report]
/// output_dir = "ti-results"
/// ```
///
/// # Example
///
/// ```
/// use tirun::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [step]
///     id = "run-tests"
///     language = "python"
///     build_tool = "pytest"
/// "#).unwrap();
/// assert_eq!(config.step.num_retries, 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// The run-tests step itself.
    pub step: StepConfig,

    /// Instrumentation agent locations.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Test Intelligence service connection.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Artifact output settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Settings of the run-tests step.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `timeout_secs` | 14400 (4 hours) |
/// | `num_retries` | 1 (a single attempt) |
/// | `run_only_selected_tests` | true |
/// | `split_strategy` | `class_timing` |
/// | `tmp_dir` | `/tmp/engine` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepConfig {
    /// Step identifier, used for artifact names and service calls.
    pub id: String,

    /// Language of the codebase.
    pub language: Language,

    /// Build tool used to run the tests.
    pub build_tool: BuildTool,

    /// Extra arguments handed to the build tool.
    #[serde(default)]
    pub args: String,

    /// Command run before the tests.
    #[serde(default)]
    pub pre_command: String,

    /// Command run after the tests.
    #[serde(default)]
    pub post_command: String,

    /// Comma separated packages to instrument (JVM and Python).
    #[serde(default)]
    pub packages: String,

    /// Comma separated namespaces to instrument (.NET).
    #[serde(default)]
    pub namespaces: String,

    /// Annotations that mark test methods for the agent.
    #[serde(default)]
    pub annotations: String,

    /// Glob patterns overriding the language's default test-file patterns.
    #[serde(default)]
    pub test_globs: Vec<String>,

    /// Run only the tests picked by the selection service.
    ///
    /// When false the whole suite always runs.
    #[serde(default = "default_true")]
    pub run_only_selected_tests: bool,

    /// JSON encoded list of changed files (`[{"name": ..., "status": ...}]`).
    #[serde(default)]
    pub diff_files: String,

    /// Timeout for one execution of the composed command. `0` means default.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Total number of attempts. `0` means default.
    #[serde(default = "default_retries")]
    pub num_retries: u32,

    /// How tests are weighted when splitting across parallel nodes.
    #[serde(default)]
    pub split_strategy: SplitStrategy,

    /// Environment variables whose final values become step outputs.
    #[serde(default)]
    pub env_var_outputs: Vec<String>,

    /// Environment of the test command.
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Test reports to collect after the run.
    #[serde(default)]
    pub reports: Vec<ReportSpec>,

    /// Scratch directory for agent configs, callgraphs and output capture.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// Repository checkout. Defaults to the current directory.
    pub workspace: Option<PathBuf>,
}

impl StepConfig {
    /// Execution timeout with the zero-means-default rule applied.
    pub fn effective_timeout_secs(&self) -> u64 {
        if self.timeout_secs == 0 {
            default_timeout()
        } else {
            self.timeout_secs
        }
    }

    /// Attempt budget with the zero-means-default rule applied.
    pub fn effective_retries(&self) -> u32 {
        if self.num_retries == 0 {
            default_retries()
        } else {
            self.num_retries
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    14400 // 4 hours
}

fn default_retries() -> u32 {
    1
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/tmp/engine")
}

/// A set of test report files to collect.
///
/// ```toml
/// [[step.reports]]
/// type = "junit"
/// paths = ["target/surefire-reports/*.xml"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReportSpec {
    /// Report format.
    #[serde(rename = "type", default)]
    pub kind: ReportKind,

    /// Glob patterns, relative to the workspace unless absolute.
    pub paths: Vec<String>,
}

/// Supported report formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    #[default]
    Junit,
}

/// Locations of the instrumentation agents.
///
/// | Field | Default | Needed by |
/// |-------|---------|-----------|
/// | `java_agent_jar` | `/addon/bin/java-agent.jar` | java |
/// | `install_source` | none | csharp, python (required) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Java agent jar shipped with the step image.
    #[serde(default = "default_java_agent")]
    pub java_agent_jar: PathBuf,

    /// Directory holding `<language>-agent.tar` archives for languages whose
    /// agent is installed per run. Required for C# and Python steps.
    pub install_source: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            java_agent_jar: default_java_agent(),
            install_source: None,
        }
    }
}

fn default_java_agent() -> PathBuf {
    PathBuf::from("/addon/bin/java-agent.jar")
}

/// Connection to the Test Intelligence service.
///
/// Without an endpoint no selection or timing data is available: every run
/// selects all tests and historical splitting falls back to equal weights.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Base URL of the service.
    pub endpoint: Option<String>,

    /// Bearer token for the service.
    pub token: Option<String>,

    /// Request timeout. Default: 60 seconds.
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

fn default_service_timeout() -> u64 {
    60
}

/// Where collected artifacts are written.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Output directory for callgraph and report summaries.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("ti-results")
}
