//! unittest runner for Python projects.
//!
//! unittest addresses tests by dotted module name, so file paths are turned
//! into modules (`tests/test_a.py` becomes `tests.test_a`).

use async_trait::async_trait;

use super::pytest::{detect_python_tests, python_packages};
use super::{
    CmdRequest, RunnerContext, RunnerResult, SKIP_COMMAND, TestRunner, join_command,
    unique_identifiers, wrap_if_instrumented,
};
use crate::model::RunnableTest;

/// Runs Python tests with `python3 -m unittest`.
pub struct UnittestRunner {
    ctx: RunnerContext,
}

impl UnittestRunner {
    /// Creates a unittest runner for the workspace in `ctx`.
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }
}

fn module_name(path: &str) -> String {
    path.strip_suffix(".py")
        .unwrap_or(path)
        .trim_start_matches("./")
        .replace('/', ".")
}

#[async_trait]
impl TestRunner for UnittestRunner {
    fn name(&self) -> &'static str {
        "unittest"
    }

    async fn auto_detect_tests(&self) -> RunnerResult<Vec<RunnableTest>> {
        detect_python_tests(&self.ctx).await
    }

    async fn auto_detect_packages(&self) -> RunnerResult<Vec<String>> {
        python_packages(&self.ctx.workspace).await
    }

    fn get_cmd(&self, request: &CmdRequest<'_>) -> RunnerResult<String> {
        if request.is_skip() {
            return Ok(SKIP_COMMAND.to_string());
        }

        let modules = if request.run_all {
            String::new()
        } else {
            shell_words::join(unique_identifiers(request.tests, |t| {
                module_name(&t.class)
            }))
        };

        let command = join_command(["python3 -m unittest", request.user_args, &modules]);
        wrap_if_instrumented(&self.ctx, request, self.name(), command)
    }
}
