//! Bazel runner for JVM projects.
//!
//! Detected tests carry the owning Bazel package in `autodetect.rule`
//! (`//svc:FooTest`). A selected run targets those rules and narrows the run
//! with `--test_filter`; tests without a known rule fall back to `//...`.

use async_trait::async_trait;

use super::detect::{self, JAVA_GLOBS};
use super::{
    CmdRequest, RunnerContext, RunnerError, RunnerResult, SKIP_COMMAND, TestRunner,
    java_agent_arg, join_command, unique_identifiers,
};
use crate::model::RunnableTest;

const ALL_TARGETS: &str = "//...";

/// Runs JVM tests with `bazel test`.
pub struct BazelRunner {
    ctx: RunnerContext,
}

impl BazelRunner {
    /// Creates a Bazel runner for the workspace in `ctx`.
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TestRunner for BazelRunner {
    fn name(&self) -> &'static str {
        "bazel"
    }

    async fn auto_detect_tests(&self) -> RunnerResult<Vec<RunnableTest>> {
        let paths = detect::scan(&self.ctx.workspace, self.ctx.globs_or(JAVA_GLOBS)).await?;
        let mut tests = Vec::with_capacity(paths.len());
        for path in &paths {
            let Some(test) = detect::jvm_test_from_path(path) else {
                continue;
            };
            let test = match detect::bazel_package(&self.ctx.workspace, path) {
                Some(pkg) => {
                    let rule = format!("//{}:{}", pkg, test.class);
                    test.with_rule(rule)
                }
                None => test,
            };
            tests.push(test);
        }
        Ok(tests)
    }

    async fn auto_detect_packages(&self) -> RunnerResult<Vec<String>> {
        Err(RunnerError::NotImplemented("package detection", "bazel"))
    }

    fn get_cmd(&self, request: &CmdRequest<'_>) -> RunnerResult<String> {
        if request.is_skip() {
            return Ok(SKIP_COMMAND.to_string());
        }

        let agent = request
            .agent_config_for(self.name())?
            .map(|cfg| format!("--jvmopt={}", java_agent_arg(&self.ctx.java_agent_jar, cfg)));

        let (targets, filter) = if request.run_all {
            (ALL_TARGETS.to_string(), None)
        } else {
            let targets = if request.tests.iter().any(|t| t.autodetect.rule.is_empty()) {
                ALL_TARGETS.to_string()
            } else {
                unique_identifiers(request.tests, |t| t.autodetect.rule.clone()).join(" ")
            };
            let classes = unique_identifiers(request.tests, RunnableTest::qualified_class);
            (
                targets,
                Some(format!(
                    "--test_filter={}",
                    shell_words::quote(&classes.join("|"))
                )),
            )
        };

        Ok(join_command([
            "bazel",
            "test",
            request.user_args,
            agent.as_deref().unwrap_or(""),
            filter.as_deref().unwrap_or(""),
            "--",
            &targets,
        ]))
    }
}
