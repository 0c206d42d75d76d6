//! pytest runner for Python projects.
//!
//! Python tests are identified by file path: detection stores the
//! workspace-relative path in `class`, and selected runs pass those paths to
//! pytest positionally.
//!
//! # Test ID Format
//!
//! ```text
//! tests/unit/test_cart.py
//! ```

use std::path::Path;

use async_trait::async_trait;

use super::detect::{self, PYTHON_GLOBS};
use super::{
    CmdRequest, RunnerContext, RunnerResult, SKIP_COMMAND, TestRunner, join_command,
    unique_identifiers, wrap_if_instrumented,
};
use crate::model::RunnableTest;

/// Runs Python tests with pytest.
pub struct PytestRunner {
    ctx: RunnerContext,
}

impl PytestRunner {
    /// Creates a pytest runner for the workspace in `ctx`.
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TestRunner for PytestRunner {
    fn name(&self) -> &'static str {
        "pytest"
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

        let files = if request.run_all {
            String::new()
        } else {
            shell_words::join(unique_identifiers(request.tests, |t| t.class.clone()))
        };

        let command = join_command(["pytest", request.user_args, &files]);
        wrap_if_instrumented(&self.ctx, request, self.name(), command)
    }
}

pub(super) async fn detect_python_tests(ctx: &RunnerContext) -> RunnerResult<Vec<RunnableTest>> {
    let paths = detect::scan(&ctx.workspace, ctx.globs_or(PYTHON_GLOBS)).await?;
    Ok(paths
        .into_iter()
        .map(|path| RunnableTest::new("", path.clone()).with_path(path))
        .collect())
}

/// Top-level directories of the workspace that are Python packages
/// (contain an `__init__.py`), sorted by name.
pub(super) async fn python_packages(workspace: &Path) -> RunnerResult<Vec<String>> {
    let mut packages = Vec::new();
    let mut entries = tokio::fs::read_dir(workspace).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.file_type().await?.is_dir() {
            continue;
        }
        if tokio::fs::try_exists(entry.path().join("__init__.py")).await? {
            packages.push(name);
        }
    }
    packages.sort();
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::{IgnoreReason, Instrumentation};
    use crate::runner::shell_argv;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_selected_paths() {
        let tests = vec![
            RunnableTest::new("", "tests/test_a.py"),
            RunnableTest::new("", "tests/test_b.py"),
            RunnableTest::new("", "tests/test_a.py").with_method("test_x"),
        ];
        let runner = PytestRunner::new(RunnerContext::new("/ws"));
        let ignored = Instrumentation::Ignored(IgnoreReason::ManualExecution);
        let cmd = runner
            .get_cmd(&CmdRequest::selected(&tests, "-x", ignored))
            .unwrap();
        assert_eq!(cmd, "pytest -x tests/test_a.py tests/test_b.py");
    }

    #[test]
    fn test_paths_with_shell_characters_stay_single_arguments() {
        let tests = vec![
            RunnableTest::new("", "tests/cart tests/test_a.py"),
            RunnableTest::new("", "tests/test_$(touch x);b.py"),
        ];
        let runner = PytestRunner::new(RunnerContext::new("/ws"));
        let ignored = Instrumentation::Ignored(IgnoreReason::ManualExecution);
        let cmd = runner
            .get_cmd(&CmdRequest::selected(&tests, "-x", ignored))
            .unwrap();
        assert_eq!(
            shell_argv(&cmd),
            vec!["-x", "tests/cart tests/test_a.py", "tests/test_$(touch x);b.py"]
        );
    }

    #[test]
    fn test_instrumented_selected_run() {
        let tests = vec![RunnableTest::new("", "tests/test_a.py")];
        let mut ctx = RunnerContext::new("/ws");
        ctx.agent_dir = Some(PathBuf::from("/agent"));
        let runner = PytestRunner::new(ctx);
        let cmd = runner
            .get_cmd(
                &CmdRequest::selected(&tests, "", Instrumentation::Enabled)
                    .with_agent_config(Path::new("/cfg/config.ini")),
            )
            .unwrap();
        assert_eq!(
            cmd,
            "/agent/ti-wrapper --config /cfg/config.ini --test-command 'pytest tests/test_a.py'"
        );
    }

    #[tokio::test]
    async fn test_detection_and_packages() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("shop/tests")).unwrap();
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("shop/__init__.py"), "").unwrap();
        std::fs::write(root.join("shop/tests/test_cart.py"), "").unwrap();
        std::fs::write(root.join("shop/cart.py"), "").unwrap();

        let runner = PytestRunner::new(RunnerContext::new(root));
        let tests = runner.auto_detect_tests().await.unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].class, "shop/tests/test_cart.py");
        assert_eq!(tests[0].autodetect.path, "shop/tests/test_cart.py");
        assert_eq!(runner.auto_detect_packages().await.unwrap(), vec!["shop"]);
    }
}
