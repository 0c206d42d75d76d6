//! Run-tests step orchestration.
//!
//! The [`Orchestrator`] drives one invocation of the step through four
//! phases:
//!
//! ```text
//!  Preparing ──────────► Executing ──────────► CollectingArtifacts ──► Done
//!     │                   │    ▲                    │
//!     │ select tests      │    │ retry              │ callgraph
//!     │ split (parallel)  │    │ (exit ≠ 0,         │ test reports
//!     │ install agent     │    │  timeout)          │
//!     │ write agent cfg   └────┘                    │
//!     │ compose command                             │
//!     ▼                                             ▼
//!  fatal error ──────────────────────────────► StepResult
//! ```
//!
//! # Phases
//!
//! - **Preparing** runs once. Any failure here is fatal: no attempt is made
//!   and no artifacts are collected.
//! - **Executing** runs the whole composed command up to `num_retries`
//!   times under the step timeout. Cancellation ends the loop at once.
//! - **CollectingArtifacts** runs exactly once. After a successful run a
//!   collection failure fails the step (the callgraph error wins over the
//!   report error). After a failed run collection errors are only logged
//!   and the execution error is returned.
//!
//! # Parallel nodes
//!
//! When the CI system runs the step on several nodes, each node computes the
//! same split and keeps its own share:
//!
//! | Selection | Action |
//! |-----------|--------|
//! | selected, no tests | nothing to split, skip command |
//! | selected, some tests | split the selected tests |
//! | full run | detect tests in the workspace and split them; the run becomes a selected run |
//! | full run, detection failed | every node runs everything, uninstrumented |
//!
//! A `class_timing` split whose timing data is unavailable is redone with
//! equal weights.

pub mod command;
pub mod outputs;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ci_env::{self, NodeSlot};
use crate::config::Config;
use crate::instrumentation::{
    self, AgentError, AgentInstaller, AgentSettings, IgnoreReason, Instrumentation,
    LocalAgentInstaller,
};
use crate::model::{RunnableTest, parse_changed_files};
use crate::process::{CommandExecutor, ExecOutcome, ExecRequest, ProcessError, ShellExecutor};
use crate::report::{ArtifactCollector, CollectError, LocalCollector};
use crate::runner::{
    CmdRequest, Language, RunnerContext, RunnerError, TestRunner, build_runner, java_agent_arg,
};
use crate::selection::{SelectionService, Selector};
use crate::split::{SplitError, SplitStrategy, Splitter, TimingService};

use command::ScriptParts;

/// Errors that fail a step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The change list handed to the step is not valid JSON.
    #[error("invalid diff files: {0}")]
    DiffFiles(#[source] serde_json::Error),

    /// Preparing the tmp directory failed.
    #[error("failed to prepare {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Installing or configuring the agent failed.
    #[error("agent preparation failed: {0}")]
    Agent(#[from] AgentError),

    /// The runner could not be built or produce a command.
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),

    /// Splitting failed for a reason other than missing timing data.
    #[error("test split failed: {0}")]
    Split(#[from] SplitError),

    /// A `${{ env.NAME }}` placeholder names an unknown variable.
    #[error("unresolved expression: env.{0}")]
    UnresolvedExpression(String),

    /// The command could not run to completion.
    #[error("test command failed: {0}")]
    Process(#[from] ProcessError),

    /// The command exited with a non-zero code.
    #[error("test command exited with code {0}")]
    ExitCode(i32),

    /// Output variables could not be read after the run.
    #[error("failed to read output variables from {}: {source}", path.display())]
    Outputs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Artifact collection failed after a successful run.
    #[error("artifact collection failed: {0}")]
    Collect(#[from] CollectError),

    /// Closing the log stream failed.
    #[error("failed to close log stream: {0}")]
    LogClose(#[source] std::io::Error),

    /// The step failed and the log stream failed to close as well.
    #[error("{step}; additionally failed to close log stream: {log}")]
    Combined { step: Box<StepError>, log: String },
}

/// Merges the step error with a failure to close the log stream, so that a
/// single error reaches the caller.
pub fn combine_errors(
    step: Option<StepError>,
    log_close: Option<std::io::Error>,
) -> Option<StepError> {
    match (step, log_close) {
        (None, None) => None,
        (Some(e), None) => Some(e),
        (None, Some(log)) => Some(StepError::LogClose(log)),
        (Some(e), Some(log)) => Some(StepError::Combined {
            step: Box::new(e),
            log: log.to_string(),
        }),
    }
}

/// Lifecycle phase of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preparing,
    Executing,
    CollectingArtifacts,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Preparing => "preparing",
            Phase::Executing => "executing",
            Phase::CollectingArtifacts => "collecting-artifacts",
            Phase::Done => "done",
        })
    }
}

/// One execution of the composed command.
#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    /// 1-based attempt number.
    pub number: u32,
    /// The script that ran.
    pub command: String,
    /// How the process exited; `None` when it was killed.
    pub outcome: Option<ExecOutcome>,
    /// Output variables read after a successful exit.
    pub outputs: HashMap<String, String>,
}

/// Final state of a step invocation.
#[derive(Debug)]
pub struct StepResult {
    /// Output variables, only on success.
    pub outputs: HashMap<String, String>,
    /// Number of attempts actually made.
    pub attempts: u32,
    /// The failure, if any.
    pub error: Option<StepError>,
    /// The last attempt, if any was made.
    pub last_attempt: Option<ExecutionAttempt>,
    /// Instrumentation decided during preparation.
    pub instrumentation: Option<Instrumentation>,
}

impl StepResult {
    /// Returns `true` when the step succeeded.
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    fn fatal(error: StepError) -> Self {
        Self {
            outputs: HashMap::new(),
            attempts: 0,
            error: Some(error),
            last_attempt: None,
            instrumentation: None,
        }
    }
}

/// Everything decided while preparing: the script and how to run it.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    /// Composed script, placeholders resolved.
    pub command: String,
    /// Resolved step environment.
    pub env: HashMap<String, String>,
    /// Where the script writes output variables.
    pub output_file: PathBuf,
    /// Whether the agent is attached.
    pub instrumentation: Instrumentation,
    /// Tests the command is scoped to; `None` for a full run.
    pub tests: Option<Vec<RunnableTest>>,
}

struct ExecutionSummary {
    attempts: u32,
    last_attempt: Option<ExecutionAttempt>,
    result: Result<HashMap<String, String>, StepError>,
}

/// Drives a run-tests step from configuration to [`StepResult`].
pub struct Orchestrator {
    config: Config,
    env: HashMap<String, String>,
    workspace: PathBuf,
    selection: Option<Arc<dyn SelectionService>>,
    timing: Option<Arc<dyn TimingService>>,
    installer: Arc<dyn AgentInstaller>,
    executor: Arc<dyn CommandExecutor>,
    collector: Arc<dyn ArtifactCollector>,
}

impl Orchestrator {
    /// Creates an orchestrator with the local shell, installer and
    /// collector. `env` is the environment the CI system gave the step.
    pub fn new(config: Config, env: HashMap<String, String>) -> Self {
        let workspace = config.workspace();
        let installer = Arc::new(LocalAgentInstaller::new(config.agent.install_source.clone()));
        let collector = Arc::new(LocalCollector::new(&workspace, &config.report.output_dir));
        Self {
            config,
            env,
            workspace,
            selection: None,
            timing: None,
            installer,
            executor: Arc::new(ShellExecutor::new()),
            collector,
        }
    }

    /// Sets the selection service.
    pub fn with_selection_service(mut self, service: Arc<dyn SelectionService>) -> Self {
        self.selection = Some(service);
        self
    }

    /// Sets the source of historical test timings.
    pub fn with_timing_service(mut self, service: Arc<dyn TimingService>) -> Self {
        self.timing = Some(service);
        self
    }

    /// Sets the agent installer.
    pub fn with_installer(mut self, installer: Arc<dyn AgentInstaller>) -> Self {
        self.installer = installer;
        self
    }

    /// Sets the command executor.
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the artifact collector.
    pub fn with_collector(mut self, collector: Arc<dyn ArtifactCollector>) -> Self {
        self.collector = collector;
        self
    }

    /// Runs the step to completion.
    pub async fn run(&self, cancel: &CancellationToken) -> StepResult {
        let step_id = self.config.step.id.as_str();
        info!(step = step_id, phase = %Phase::Preparing, "Starting step");

        let prepared = match self.prepare().await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(step = step_id, error = %e, "Step preparation failed");
                return StepResult::fatal(e);
            }
        };

        info!(
            step = step_id,
            phase = %Phase::Executing,
            instrumentation = %prepared.instrumentation,
            "Running tests"
        );
        let started = Instant::now();
        let summary = self.execute(&prepared, cancel).await;

        info!(step = step_id, phase = %Phase::CollectingArtifacts, "Collecting artifacts");
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = self.collect(summary.result, elapsed_ms).await;

        let (outputs, error) = match result {
            Ok(outputs) => (outputs, None),
            Err(e) => (HashMap::new(), Some(e)),
        };
        info!(
            step = step_id,
            phase = %Phase::Done,
            attempts = summary.attempts,
            success = error.is_none(),
            "Step finished"
        );

        StepResult {
            outputs,
            attempts: summary.attempts,
            error,
            last_attempt: summary.last_attempt,
            instrumentation: Some(prepared.instrumentation),
        }
    }

    fn runner(&self, agent_dir: Option<PathBuf>) -> Result<Box<dyn TestRunner>, StepError> {
        let step = &self.config.step;
        let ctx = RunnerContext {
            workspace: self.workspace.clone(),
            test_globs: step.test_globs.clone(),
            java_agent_jar: self.config.agent.java_agent_jar.clone(),
            agent_dir,
        };
        Ok(build_runner(step.language, step.build_tool, ctx)?)
    }

    /// Decides what to run and builds the command. Fatal on any error.
    pub async fn prepare(&self) -> Result<PreparedStep, StepError> {
        let step = &self.config.step;
        let tmp_dir = step.tmp_dir.as_path();
        tokio::fs::create_dir_all(tmp_dir)
            .await
            .map_err(|source| StepError::Workspace {
                path: tmp_dir.to_path_buf(),
                source,
            })?;

        let changed = parse_changed_files(&step.diff_files).map_err(StepError::DiffFiles)?;

        let mut selector = Selector::new(self.env.clone());
        if let Some(service) = &self.selection {
            selector = selector.with_service(Arc::clone(service));
        }
        let selection = selector
            .select_tests(changed.as_deref(), step.run_only_selected_tests, &step.id)
            .await;

        let manual = ci_env::is_manual_execution(&self.env);
        let mut tests = (!selection.select_all).then_some(selection.tests);
        let mut instrumentation = match &tests {
            _ if manual => Instrumentation::Ignored(IgnoreReason::ManualExecution),
            Some(selected) if selected.is_empty() => {
                Instrumentation::Ignored(IgnoreReason::NoTestsSelected)
            }
            _ => Instrumentation::Enabled,
        };

        let detector = self.runner(None)?;
        if let Some(node) = ci_env::parallelism(&self.env) {
            match tests.take() {
                Some(selected) if selected.is_empty() => {
                    info!("No tests selected, skipping split");
                    tests = Some(selected);
                }
                Some(selected) => {
                    tests = Some(self.split(selected, node).await?);
                }
                None => match detector.auto_detect_tests().await {
                    Ok(detected) if !detected.is_empty() => {
                        info!(count = detected.len(), "Detected tests for parallel run");
                        tests = Some(self.split(detected, node).await?);
                        instrumentation = Instrumentation::Enabled;
                    }
                    Ok(_) => {
                        warn!("No tests detected, every node runs all tests");
                        instrumentation = Instrumentation::Ignored(IgnoreReason::ParallelFullRun);
                    }
                    Err(e) => {
                        warn!(error = %e, "Test detection failed, every node runs all tests");
                        instrumentation = Instrumentation::Ignored(IgnoreReason::ParallelFullRun);
                    }
                },
            }
        }

        let agent_dir = if instrumentation.is_enabled() {
            self.installer
                .install(step.language, &tmp_dir.join("ti"))
                .await?
        } else {
            None
        };

        let settings = AgentSettings {
            packages: self.instrumented_packages(detector.as_ref()).await,
            annotations: step.annotations.clone(),
        };
        let agent_config =
            instrumentation::write_agent_config(step.language, tmp_dir, &settings).await?;

        let runner = self.runner(agent_dir)?;
        let request = match &tests {
            Some(selected) => CmdRequest::selected(selected, &step.args, instrumentation),
            None => CmdRequest::all(&step.args, instrumentation),
        }
        .with_agent_config(&agent_config);
        let test_command = runner.get_cmd(&request)?;

        let java_agent = if step.language == Language::Java && instrumentation.is_enabled() {
            java_agent_arg(&self.config.agent.java_agent_jar, &agent_config)
        } else {
            String::new()
        };

        let output_file = outputs::output_file(tmp_dir, &step.id);
        let script = command::compose(&ScriptParts {
            tmp_dir,
            java_agent: &java_agent,
            pre_command: &step.pre_command,
            test_command: &test_command,
            post_command: &step.post_command,
            output_vars: &step.env_var_outputs,
            output_file: &output_file,
        });
        let script = command::resolve_expressions(&script, |name| {
            step.environment
                .get(name)
                .or_else(|| self.env.get(name))
                .cloned()
        })?;
        let env = command::resolve_env(&step.environment, &self.env)?;

        Ok(PreparedStep {
            command: script,
            env,
            output_file,
            instrumentation,
            tests,
        })
    }

    async fn split(
        &self,
        tests: Vec<RunnableTest>,
        node: NodeSlot,
    ) -> Result<Vec<RunnableTest>, StepError> {
        let mut splitter = Splitter::new(&self.workspace);
        if let Some(timing) = &self.timing {
            splitter = splitter.with_timing(Arc::clone(timing));
        }

        let strategy = self.config.step.split_strategy;
        match splitter.split(tests.clone(), strategy, node).await {
            Ok(mine) => Ok(mine),
            Err(SplitError::TimingUnavailable(e)) => {
                warn!(error = %e, "Timing data unavailable, splitting tests equally");
                Ok(splitter.split(tests, SplitStrategy::Equal, node).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn instrumented_packages(&self, runner: &dyn TestRunner) -> Vec<String> {
        let step = &self.config.step;
        let configured = match step.language {
            Language::Csharp => &step.namespaces,
            Language::Java | Language::Python => &step.packages,
        };
        let configured = instrumentation::split_list(configured);
        if !configured.is_empty() {
            return configured;
        }

        match runner.auto_detect_packages().await {
            Ok(packages) => packages,
            Err(e) => {
                warn!(error = %e, "Could not detect packages to instrument");
                Vec::new()
            }
        }
    }

    async fn execute(&self, prepared: &PreparedStep, cancel: &CancellationToken) -> ExecutionSummary {
        let step = &self.config.step;
        let budget = step.effective_retries();
        let request = ExecRequest {
            command: prepared.command.clone(),
            working_dir: self.workspace.clone(),
            env: prepared.env.clone(),
            timeout: Duration::from_secs(step.effective_timeout_secs()),
        };

        let mut attempts = 0;
        let mut last_attempt = None;
        let mut last_error = None;

        for number in 1..=budget {
            attempts = number;
            if let Err(e) = outputs::clear_outputs(&prepared.output_file).await {
                warn!(error = %e, "Could not remove stale output file");
            }

            let mut attempt = ExecutionAttempt {
                number,
                command: prepared.command.clone(),
                outcome: None,
                outputs: HashMap::new(),
            };

            let error = match self.executor.execute(&request, cancel).await {
                Ok(outcome) if outcome.success() => {
                    attempt.outcome = Some(outcome);
                    match self.read_outputs(&prepared.output_file).await {
                        Ok(values) => {
                            attempt.outputs = values.clone();
                            info!(attempt = number, duration = ?outcome.duration, "Tests passed");
                            return ExecutionSummary {
                                attempts,
                                last_attempt: Some(attempt),
                                result: Ok(values),
                            };
                        }
                        Err(e) => e,
                    }
                }
                Ok(outcome) => {
                    attempt.outcome = Some(outcome);
                    StepError::ExitCode(outcome.exit_code)
                }
                Err(e) => StepError::Process(e),
            };
            last_attempt = Some(attempt);

            if let StepError::Process(ref e) = error
                && !e.is_retryable()
            {
                warn!(attempt = number, error = %error, "Step cancelled");
                last_error = Some(error);
                break;
            }

            if number < budget {
                warn!(attempt = number, of = budget, error = %error, "Attempt failed, retrying");
            } else {
                error!(attempt = number, of = budget, error = %error, "Attempt failed");
            }
            last_error = Some(error);
        }

        ExecutionSummary {
            attempts,
            last_attempt,
            result: Err(last_error.unwrap_or(StepError::ExitCode(-1))),
        }
    }

    async fn read_outputs(&self, path: &Path) -> Result<HashMap<String, String>, StepError> {
        let names = &self.config.step.env_var_outputs;
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        outputs::read_outputs(path, names)
            .await
            .map_err(|source| StepError::Outputs {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn collect(
        &self,
        execution: Result<HashMap<String, String>, StepError>,
        elapsed_ms: u64,
    ) -> Result<HashMap<String, String>, StepError> {
        let step = &self.config.step;
        let cg_dir = instrumentation::callgraph_dir(&step.tmp_dir);

        let started = Instant::now();
        let callgraph = self
            .collector
            .collect_callgraph(&step.id, &cg_dir, elapsed_ms)
            .await;
        let cg_time = started.elapsed();

        let started = Instant::now();
        let reports = self
            .collector
            .collect_test_reports(&step.reports, &step.id)
            .await;
        let report_time = started.elapsed();

        match execution {
            Ok(outputs) => {
                if let Err(e) = callgraph {
                    error!(error = %e, elapsed = ?cg_time, "Unable to collect callgraph");
                    if let Err(re) = &reports {
                        error!(error = %re, elapsed = ?report_time, "Unable to collect test reports");
                    }
                    return Err(e.into());
                }
                if let Err(e) = reports {
                    error!(error = %e, elapsed = ?report_time, "Unable to collect test reports");
                    return Err(e.into());
                }
                info!(
                    callgraph = ?cg_time,
                    reports = ?report_time,
                    "Collected artifacts"
                );
                Ok(outputs)
            }
            Err(exec_error) => {
                if let Err(e) = callgraph {
                    error!(error = %e, "Error while collecting callgraph");
                }
                if let Err(e) = reports {
                    error!(error = %e, "Error while collecting test reports");
                }
                Err(exec_error)
            }
        }
    }
}
