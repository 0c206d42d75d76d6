//! Gradle runner for JVM projects.
//!
//! Prefers the project's `./gradlew` wrapper when one is checked in. Each
//! selected class becomes a `--tests` filter. Gradle does not forward system
//! properties to forked test JVMs, so the agent is handed over as the
//! `HARNESS_JAVA_AGENT` property for the build script to pick up.

use async_trait::async_trait;

use super::detect::{self, JAVA_GLOBS};
use super::maven::jvm_packages;
use super::{
    CmdRequest, RunnerContext, RunnerResult, SKIP_COMMAND, TestRunner, java_agent_arg,
    join_command, unique_identifiers,
};
use crate::model::RunnableTest;

/// Property and environment variable carrying the `-javaagent` flag.
pub const JAVA_AGENT_PROPERTY: &str = "HARNESS_JAVA_AGENT";

/// Runs JVM tests with Gradle.
pub struct GradleRunner {
    ctx: RunnerContext,
}

impl GradleRunner {
    /// Creates a Gradle runner for the workspace in `ctx`.
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }

    fn executable(&self) -> &'static str {
        if self.ctx.workspace.join("gradlew").is_file() {
            "./gradlew"
        } else {
            "gradle"
        }
    }
}

#[async_trait]
impl TestRunner for GradleRunner {
    fn name(&self) -> &'static str {
        "gradle"
    }

    async fn auto_detect_tests(&self) -> RunnerResult<Vec<RunnableTest>> {
        let paths = detect::scan(&self.ctx.workspace, self.ctx.globs_or(JAVA_GLOBS)).await?;
        Ok(paths
            .iter()
            .filter_map(|p| detect::jvm_test_from_path(p))
            .collect())
    }

    async fn auto_detect_packages(&self) -> RunnerResult<Vec<String>> {
        jvm_packages(&self.ctx).await
    }

    fn get_cmd(&self, request: &CmdRequest<'_>) -> RunnerResult<String> {
        if request.is_skip() {
            return Ok(SKIP_COMMAND.to_string());
        }

        let agent = request.agent_config_for(self.name())?.map(|cfg| {
            format!(
                "-D{}={}",
                JAVA_AGENT_PROPERTY,
                java_agent_arg(&self.ctx.java_agent_jar, cfg)
            )
        });

        let filters = if request.run_all {
            String::new()
        } else {
            unique_identifiers(request.tests, RunnableTest::qualified_class)
                .iter()
                .map(|class| format!("--tests {}", shell_words::quote(class)))
                .collect::<Vec<_>>()
                .join(" ")
        };

        Ok(join_command([
            self.executable(),
            "test",
            request.user_args,
            agent.as_deref().unwrap_or(""),
            &filters,
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::{IgnoreReason, Instrumentation};
    use crate::runner::shell_argv;
    use tempfile::TempDir;

    #[test]
    fn test_uses_wrapper_when_present() {
        let dir = TempDir::new().unwrap();
        let ignored = Instrumentation::Ignored(IgnoreReason::ManualExecution);

        let runner = GradleRunner::new(RunnerContext::new(dir.path()));
        let cmd = runner.get_cmd(&CmdRequest::all("", ignored)).unwrap();
        assert_eq!(cmd, "gradle test");

        std::fs::write(dir.path().join("gradlew"), "#!/bin/sh").unwrap();
        let cmd = runner.get_cmd(&CmdRequest::all("", ignored)).unwrap();
        assert_eq!(cmd, "./gradlew test");
    }

    #[test]
    fn test_agent_property() {
        let runner = GradleRunner::new(RunnerContext::new("/nonexistent"));
        let cmd = runner
            .get_cmd(
                &CmdRequest::all("", Instrumentation::Enabled)
                    .with_agent_config(std::path::Path::new("/tmp/config.ini")),
            )
            .unwrap();
        assert_eq!(
            cmd,
            "gradle test -DHARNESS_JAVA_AGENT=-javaagent:/addon/bin/java-agent.jar=/tmp/config.ini"
        );
    }

    #[test]
    fn test_selected_filters() {
        let tests = vec![
            RunnableTest::new("io.a", "FooTest").with_method("m1"),
            RunnableTest::new("io.a", "FooTest").with_method("m2"),
            RunnableTest::new("", "BarTest"),
        ];
        let runner = GradleRunner::new(RunnerContext::new("/nonexistent"));
        let ignored = Instrumentation::Ignored(IgnoreReason::NoTestsSelected);
        let cmd = runner
            .get_cmd(&CmdRequest::selected(&tests, "--info", ignored))
            .unwrap();
        assert_eq!(cmd, "gradle test --info --tests io.a.FooTest --tests BarTest");
    }

    #[test]
    fn test_filter_with_spaces_stays_one_argument() {
        let tests = vec![RunnableTest::new("io.a", "Cart Test;rm")];
        let runner = GradleRunner::new(RunnerContext::new("/nonexistent"));
        let ignored = Instrumentation::Ignored(IgnoreReason::ManualExecution);
        let cmd = runner
            .get_cmd(&CmdRequest::selected(&tests, "", ignored))
            .unwrap();
        assert_eq!(shell_argv(&cmd), vec!["test", "--tests", "io.a.Cart Test;rm"]);
    }

    #[test]
    fn test_empty_selection_skips() {
        let runner = GradleRunner::new(RunnerContext::new("/nonexistent"));
        let cmd = runner
            .get_cmd(&CmdRequest::selected(&[], "", Instrumentation::Enabled))
            .unwrap();
        assert_eq!(cmd, SKIP_COMMAND);
    }
}
