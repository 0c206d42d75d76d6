//! Maven runner for JVM projects.
//!
//! Selected tests are passed through surefire's `-Dtest` filter as a comma
//! separated list of fully qualified class names. The coverage agent is
//! attached with `-DargLine`.

use async_trait::async_trait;

use super::detect::{self, JAVA_GLOBS};
use super::{
    CmdRequest, RunnerContext, RunnerResult, SKIP_COMMAND, TestRunner, java_agent_arg,
    join_command, unique_identifiers,
};
use crate::model::RunnableTest;

/// Runs JVM tests with `mvn`.
pub struct MavenRunner {
    ctx: RunnerContext,
}

impl MavenRunner {
    /// Creates a Maven runner for the workspace in `ctx`.
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TestRunner for MavenRunner {
    fn name(&self) -> &'static str {
        "maven"
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

        let agent = request
            .agent_config_for(self.name())?
            .map(|cfg| format!("-DargLine={}", java_agent_arg(&self.ctx.java_agent_jar, cfg)));

        let filter = if request.run_all {
            None
        } else {
            let classes = unique_identifiers(request.tests, RunnableTest::qualified_class);
            Some(format!("-Dtest={}", shell_words::quote(&classes.join(","))))
        };

        Ok(join_command([
            "mvn",
            filter.as_deref().unwrap_or(""),
            "-am",
            agent.as_deref().unwrap_or(""),
            request.user_args,
        ]))
    }
}

/// Distinct packages of the detected JVM tests, used as the default
/// instrumentation scope.
pub(super) async fn jvm_packages(ctx: &RunnerContext) -> RunnerResult<Vec<String>> {
    let paths = detect::scan(&ctx.workspace, ctx.globs_or(JAVA_GLOBS)).await?;
    let tests: Vec<RunnableTest> = paths
        .iter()
        .filter_map(|p| detect::jvm_test_from_path(p))
        .collect();
    Ok(unique_identifiers(&tests, |t| t.pkg.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::{IgnoreReason, Instrumentation};
    use crate::runner::shell_argv;
    use std::path::Path;
    use tempfile::TempDir;

    fn runner() -> MavenRunner {
        MavenRunner::new(RunnerContext::new("/ws"))
    }

    #[test]
    fn test_run_all_without_agent() {
        let ignored = Instrumentation::Ignored(IgnoreReason::ManualExecution);
        let cmd = runner().get_cmd(&CmdRequest::all("clean test", ignored)).unwrap();
        assert_eq!(cmd, "mvn -am clean test");
    }

    #[test]
    fn test_run_all_with_agent() {
        let cmd = runner()
            .get_cmd(
                &CmdRequest::all("test", Instrumentation::Enabled)
                    .with_agent_config(Path::new("/tmp/engine/config.ini")),
            )
            .unwrap();
        assert_eq!(
            cmd,
            "mvn -am -DargLine=-javaagent:/addon/bin/java-agent.jar=/tmp/engine/config.ini test"
        );
    }

    #[test]
    fn test_selected_tests_are_deduplicated() {
        let tests = vec![
            RunnableTest::new("io.a", "FooTest").with_method("one"),
            RunnableTest::new("io.b", "BarTest"),
            RunnableTest::new("io.a", "FooTest").with_method("two"),
        ];
        let ignored = Instrumentation::Ignored(IgnoreReason::ManualExecution);
        let cmd = runner()
            .get_cmd(&CmdRequest::selected(&tests, "test", ignored))
            .unwrap();
        assert_eq!(cmd, "mvn -Dtest=io.a.FooTest,io.b.BarTest -am test");
    }

    #[test]
    fn test_nested_class_filter_is_quoted() {
        let tests = vec![
            RunnableTest::new("io.a", "Outer$InnerTest"),
            RunnableTest::new("io.b", "BarTest"),
        ];
        let ignored = Instrumentation::Ignored(IgnoreReason::ManualExecution);
        let cmd = runner()
            .get_cmd(&CmdRequest::selected(&tests, "test", ignored))
            .unwrap();
        assert_eq!(
            shell_argv(&cmd),
            vec!["-Dtest=io.a.Outer$InnerTest,io.b.BarTest", "-am", "test"]
        );
    }

    #[test]
    fn test_empty_selection_skips() {
        let cmd = runner()
            .get_cmd(&CmdRequest::selected(&[], "test", Instrumentation::Enabled))
            .unwrap();
        assert_eq!(cmd, SKIP_COMMAND);
    }

    #[tokio::test]
    async fn test_auto_detect() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("svc/src/test/java/io/a/FooTest.java");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "class FooTest {}").unwrap();

        let runner = MavenRunner::new(RunnerContext::new(dir.path()));
        let tests = runner.auto_detect_tests().await.unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].qualified_class(), "io.a.FooTest");
        assert_eq!(runner.auto_detect_packages().await.unwrap(), vec!["io.a"]);
    }
}
