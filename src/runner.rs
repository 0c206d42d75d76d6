//! Test runner traits and implementations.
//!
//! A runner knows one (language, build tool) pair: how to find the tests in
//! a workspace and how to build the shell command that runs all of them,
//! a selected subset, or nothing at all.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         TestRunner                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  auto_detect_tests()    ──► Vec<RunnableTest>  (full splits)  │
//! │  auto_detect_packages() ──► Vec<String>        (agent config) │
//! │  get_cmd(&CmdRequest)   ──► shell command string              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Command shapes
//!
//! | `run_all` | tests | instrumentation | command |
//! |-----------|-------|-----------------|---------|
//! | true | - | ignored | plain tool invocation with user args |
//! | true | - | enabled | invocation with the coverage agent attached |
//! | false | empty | - | [`SKIP_COMMAND`], succeeds immediately |
//! | false | non-empty | either | invocation scoped to the deduplicated test list |
//!
//! # Built-in Runners
//!
//! | Language | Build tool | Implementation |
//! |----------|------------|----------------|
//! | Java | Maven | [`maven::MavenRunner`] |
//! | Java | Gradle | [`gradle::GradleRunner`] |
//! | Java | Bazel | [`bazel::BazelRunner`] |
//! | C# | dotnet | [`dotnet::DotnetRunner`] |
//! | C# | NUnit console | [`nunit::NunitConsoleRunner`] |
//! | Python | pytest | [`pytest::PytestRunner`] |
//! | Python | unittest | [`unittest::UnittestRunner`] |

pub mod bazel;
pub mod detect;
pub mod dotnet;
pub mod gradle;
pub mod maven;
pub mod nunit;
pub mod pytest;
pub mod unittest;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::instrumentation::Instrumentation;
use crate::model::RunnableTest;

/// Command returned when a selective run has nothing to execute.
pub const SKIP_COMMAND: &str = "echo \"Skipping test run, received no tests to execute\"";

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors raised by runners.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The build tool cannot be used with the language.
    #[error("build tool {build_tool} is not supported for {language}")]
    Unsupported {
        language: Language,
        build_tool: BuildTool,
    },

    /// The runner does not offer this capability.
    #[error("{0} is not implemented for {1}")]
    NotImplemented(&'static str, &'static str),

    /// Instrumentation was requested but its inputs are missing.
    #[error("instrumentation requested for {runner} but {missing} is not available")]
    MissingAgent {
        runner: &'static str,
        missing: &'static str,
    },

    /// A test-file glob pattern is malformed.
    #[error("invalid test glob '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },

    /// Walking the workspace failed.
    #[error("failed to scan workspace {}: {message}", path.display())]
    Scan { path: PathBuf, message: String },

    /// I/O error reading the workspace.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Language of the codebase under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Java,
    Csharp,
    Python,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Language::Java => "java",
            Language::Csharp => "csharp",
            Language::Python => "python",
        })
    }
}

/// Build tool driving the test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildTool {
    Maven,
    Gradle,
    Bazel,
    Dotnet,
    #[serde(rename = "nunitconsole")]
    NunitConsole,
    Pytest,
    Unittest,
}

impl fmt::Display for BuildTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildTool::Maven => "maven",
            BuildTool::Gradle => "gradle",
            BuildTool::Bazel => "bazel",
            BuildTool::Dotnet => "dotnet",
            BuildTool::NunitConsole => "nunitconsole",
            BuildTool::Pytest => "pytest",
            BuildTool::Unittest => "unittest",
        })
    }
}

/// Fails with [`RunnerError::Unsupported`] unless the pair has a runner.
pub fn check_supported(language: Language, build_tool: BuildTool) -> RunnerResult<()> {
    let supported = matches!(
        (language, build_tool),
        (
            Language::Java,
            BuildTool::Maven | BuildTool::Gradle | BuildTool::Bazel
        ) | (Language::Csharp, BuildTool::Dotnet | BuildTool::NunitConsole)
            | (Language::Python, BuildTool::Pytest | BuildTool::Unittest)
    );
    if supported {
        Ok(())
    } else {
        Err(RunnerError::Unsupported {
            language,
            build_tool,
        })
    }
}

/// Workspace facts every runner needs.
#[derive(Debug, Clone)]
pub struct RunnerContext {
    /// Repository checkout that is scanned and where commands run.
    pub workspace: PathBuf,

    /// Test-file globs overriding the language defaults when non-empty.
    pub test_globs: Vec<String>,

    /// Java agent jar, attached with `-javaagent`.
    pub java_agent_jar: PathBuf,

    /// Directory of an installed agent bundle (C# and Python).
    pub agent_dir: Option<PathBuf>,
}

impl RunnerContext {
    /// Creates a context for the given workspace with default globs.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            test_globs: Vec::new(),
            java_agent_jar: PathBuf::from("/addon/bin/java-agent.jar"),
            agent_dir: None,
        }
    }

    /// The configured globs, or `defaults` when none are configured.
    pub fn globs_or(&self, defaults: &[&str]) -> Vec<String> {
        if self.test_globs.is_empty() {
            defaults.iter().map(|g| g.to_string()).collect()
        } else {
            self.test_globs.clone()
        }
    }
}

/// Inputs of [`TestRunner::get_cmd`].
#[derive(Debug, Clone, Copy)]
pub struct CmdRequest<'a> {
    /// Tests to scope the run to when `run_all` is false.
    pub tests: &'a [RunnableTest],

    /// User supplied arguments for the build tool.
    pub user_args: &'a str,

    /// Agent configuration file written during preparation.
    pub agent_config: Option<&'a Path>,

    /// Whether the coverage agent is attached.
    pub instrumentation: Instrumentation,

    /// Run the whole suite, ignoring `tests`.
    pub run_all: bool,
}

impl<'a> CmdRequest<'a> {
    /// Request for a full run.
    pub fn all(user_args: &'a str, instrumentation: Instrumentation) -> Self {
        Self {
            tests: &[],
            user_args,
            agent_config: None,
            instrumentation,
            run_all: true,
        }
    }

    /// Request for a run of the given tests.
    pub fn selected(
        tests: &'a [RunnableTest],
        user_args: &'a str,
        instrumentation: Instrumentation,
    ) -> Self {
        Self {
            tests,
            user_args,
            agent_config: None,
            instrumentation,
            run_all: false,
        }
    }

    /// Sets the agent configuration path.
    pub fn with_agent_config(mut self, path: &'a Path) -> Self {
        self.agent_config = Some(path);
        self
    }

    /// `true` when a selective run has nothing to execute.
    pub fn is_skip(&self) -> bool {
        !self.run_all && self.tests.is_empty()
    }

    /// The agent configuration to attach, if instrumentation is enabled.
    pub fn agent_config_for(&self, runner: &'static str) -> RunnerResult<Option<&'a Path>> {
        if !self.instrumentation.is_enabled() {
            return Ok(None);
        }
        self.agent_config
            .map(Some)
            .ok_or(RunnerError::MissingAgent {
                runner,
                missing: "agent config file",
            })
    }
}

/// Capability set of one (language, build tool) pair.
///
/// Detection is async because it scans the workspace; command generation is
/// pure string assembly.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Finds the tests in the workspace using the language's test-file globs.
    ///
    /// Used for full runs that are split across parallel nodes.
    async fn auto_detect_tests(&self) -> RunnerResult<Vec<RunnableTest>>;

    /// Finds the packages to instrument. Best effort; some runners return
    /// [`RunnerError::NotImplemented`].
    async fn auto_detect_packages(&self) -> RunnerResult<Vec<String>>;

    /// Builds the shell command for the request.
    fn get_cmd(&self, request: &CmdRequest<'_>) -> RunnerResult<String>;
}

/// Creates the runner for a (language, build tool) pair.
///
/// # Example
///
/// ```
/// use tirun::runner::{build_runner, BuildTool, Language, RunnerContext};
///
/// let runner = build_runner(Language::Java, BuildTool::Maven, RunnerContext::new(".")).unwrap();
/// assert_eq!(runner.name(), "maven");
/// assert!(build_runner(Language::Python, BuildTool::Gradle, RunnerContext::new(".")).is_err());
/// ```
pub fn build_runner(
    language: Language,
    build_tool: BuildTool,
    ctx: RunnerContext,
) -> RunnerResult<Box<dyn TestRunner>> {
    check_supported(language, build_tool)?;
    Ok(match build_tool {
        BuildTool::Maven => Box::new(maven::MavenRunner::new(ctx)),
        BuildTool::Gradle => Box::new(gradle::GradleRunner::new(ctx)),
        BuildTool::Bazel => Box::new(bazel::BazelRunner::new(ctx)),
        BuildTool::Dotnet => Box::new(dotnet::DotnetRunner::new(ctx)),
        BuildTool::NunitConsole => Box::new(nunit::NunitConsoleRunner::new(ctx)),
        BuildTool::Pytest => Box::new(pytest::PytestRunner::new(ctx)),
        BuildTool::Unittest => Box::new(unittest::UnittestRunner::new(ctx)),
    })
}

/// Maps tests to identifiers, dropping repeats while keeping the order of
/// first appearance. Several methods of one class yield one identifier.
pub fn unique_identifiers<F>(tests: &[RunnableTest], identify: F) -> Vec<String>
where
    F: Fn(&RunnableTest) -> String,
{
    let mut seen = HashSet::new();
    tests
        .iter()
        .map(identify)
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

/// Joins command fragments with single spaces, skipping empty ones.
pub fn join_command<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `-javaagent:<jar>=<config>`, the JVM flag attaching the callgraph agent.
pub fn java_agent_arg(jar: &Path, config: &Path) -> String {
    format!("-javaagent:{}={}", jar.display(), config.display())
}

/// Routes `command` through the agent wrapper script found in `agent_dir`.
///
/// The wrapper receives the config file and the user command as a single
/// shell-quoted argument, runs it and records the callgraph.
pub fn wrap_with_agent(agent_dir: &Path, script: &str, config: &Path, command: &str) -> String {
    let script = agent_dir.join(script);
    format!(
        "{} --config {} --test-command {}",
        shell_words::quote(&script.to_string_lossy()),
        shell_words::quote(&config.to_string_lossy()),
        shell_words::quote(command)
    )
}

/// Name of the wrapper script inside an installed agent bundle.
pub const AGENT_WRAPPER: &str = "ti-wrapper";

/// Wraps `command` with the agent bundle when the request is instrumented,
/// otherwise returns it unchanged.
pub(crate) fn wrap_if_instrumented(
    ctx: &RunnerContext,
    request: &CmdRequest<'_>,
    runner: &'static str,
    command: String,
) -> RunnerResult<String> {
    let Some(config) = request.agent_config_for(runner)? else {
        return Ok(command);
    };
    let agent_dir = ctx.agent_dir.as_deref().ok_or(RunnerError::MissingAgent {
        runner,
        missing: "agent directory",
    })?;
    Ok(wrap_with_agent(agent_dir, AGENT_WRAPPER, config, &command))
}

/// Runs `command` under `sh -c` with its first word replaced by a shell
/// function that prints each argument on its own line, and returns those
/// arguments.
#[cfg(test)]
pub(crate) fn shell_argv(command: &str) -> Vec<String> {
    let tool = command.split_whitespace().next().unwrap_or_default();
    let script = format!(
        "{}() {{ for arg in \"$@\"; do printf '%s\\n' \"$arg\"; done; }}\n{}",
        tool, command
    );
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(&script)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::IgnoreReason;

    #[test]
    fn test_supported_pairs() {
        assert!(check_supported(Language::Java, BuildTool::Bazel).is_ok());
        assert!(check_supported(Language::Csharp, BuildTool::NunitConsole).is_ok());
        assert!(check_supported(Language::Python, BuildTool::Unittest).is_ok());
        assert!(check_supported(Language::Java, BuildTool::Pytest).is_err());
        assert!(check_supported(Language::Csharp, BuildTool::Maven).is_err());
    }

    #[test]
    fn test_unique_identifiers_collapses_methods() {
        let tests = vec![
            RunnableTest::new("", "A").with_method("m1"),
            RunnableTest::new("", "B"),
            RunnableTest::new("", "A").with_method("m2"),
        ];
        let ids = unique_identifiers(&tests, |t| t.class.clone());
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn test_join_command_skips_empty() {
        assert_eq!(join_command(["mvn", "", "  -q ", "test"]), "mvn -q test");
    }

    #[test]
    fn test_missing_agent_config_is_an_error() {
        let request = CmdRequest::all("", Instrumentation::Enabled);
        assert!(matches!(
            request.agent_config_for("maven"),
            Err(RunnerError::MissingAgent { .. })
        ));

        let request = CmdRequest::all("", Instrumentation::Ignored(IgnoreReason::ManualExecution));
        assert!(request.agent_config_for("maven").unwrap().is_none());
    }

    #[test]
    fn test_wrap_with_agent_quotes_command() {
        let wrapped = wrap_with_agent(
            Path::new("/agent"),
            "ti-wrapper",
            Path::new("/tmp/config.ini"),
            "pytest -k 'a and b'",
        );
        assert!(wrapped.starts_with("/agent/ti-wrapper --config /tmp/config.ini --test-command "));
        assert_eq!(
            shell_words::split(&wrapped).unwrap().last().unwrap(),
            "pytest -k 'a and b'"
        );
    }
}
