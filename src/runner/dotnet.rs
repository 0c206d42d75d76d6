//! .NET runners: `dotnet test` and the NUnit console.
//!
//! Both detect tests the same way: each matching source file yields one test
//! whose class is the file stem and whose package is the file's declared
//! namespace. Instrumentation goes through the installed agent's wrapper
//! script. Namespace detection for the agent is not available; namespaces
//! must be configured.

use std::path::Path;

use async_trait::async_trait;

use super::detect::{self, CSHARP_GLOBS};
use super::{
    CmdRequest, RunnerContext, RunnerError, RunnerResult, SKIP_COMMAND, TestRunner,
    join_command, unique_identifiers, wrap_if_instrumented,
};
use crate::model::RunnableTest;

/// Runs C# tests with `dotnet test`.
pub struct DotnetRunner {
    ctx: RunnerContext,
}

impl DotnetRunner {
    /// Creates a dotnet runner for the workspace in `ctx`.
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TestRunner for DotnetRunner {
    fn name(&self) -> &'static str {
        "dotnet"
    }

    async fn auto_detect_tests(&self) -> RunnerResult<Vec<RunnableTest>> {
        detect_csharp_tests(&self.ctx).await
    }

    async fn auto_detect_packages(&self) -> RunnerResult<Vec<String>> {
        Err(RunnerError::NotImplemented("namespace detection", "dotnet"))
    }

    fn get_cmd(&self, request: &CmdRequest<'_>) -> RunnerResult<String> {
        if request.is_skip() {
            return Ok(SKIP_COMMAND.to_string());
        }

        let filter = if request.run_all {
            String::new()
        } else {
            let clauses: Vec<String> =
                unique_identifiers(request.tests, RunnableTest::qualified_class)
                    .iter()
                    .map(|class| format!("FullyQualifiedName~{}", class))
                    .collect();
            format!("--filter {}", shell_words::quote(&clauses.join("|")))
        };

        let command = join_command(["dotnet", "test", request.user_args, &filter]);
        wrap_if_instrumented(&self.ctx, request, self.name(), command)
    }
}

pub(super) async fn detect_csharp_tests(ctx: &RunnerContext) -> RunnerResult<Vec<RunnableTest>> {
    let paths = detect::scan(&ctx.workspace, ctx.globs_or(CSHARP_GLOBS)).await?;
    let mut tests = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(class) = Path::new(&path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
        else {
            continue;
        };
        let source = tokio::fs::read_to_string(ctx.workspace.join(&path)).await?;
        let namespace = detect::csharp_namespace(&source).unwrap_or_default();
        tests.push(RunnableTest::new(namespace, class).with_path(path));
    }
    Ok(tests)
}
