//! NUnit console runner for C# projects.
//!
//! The test assemblies are expected in the user arguments; selection uses the
//! NUnit test selection language (`--where "class =~ A || class =~ B"`).

use async_trait::async_trait;

use super::dotnet::detect_csharp_tests;
use super::{
    CmdRequest, RunnerContext, RunnerError, RunnerResult, SKIP_COMMAND, TestRunner,
    join_command, unique_identifiers, wrap_if_instrumented,
};
use crate::model::RunnableTest;

/// Runs C# tests with `nunit3-console`.
pub struct NunitConsoleRunner {
    ctx: RunnerContext,
}

impl NunitConsoleRunner {
    /// Creates an NUnit console runner for the workspace in `ctx`.
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TestRunner for NunitConsoleRunner {
    fn name(&self) -> &'static str {
        "nunitconsole"
    }

    async fn auto_detect_tests(&self) -> RunnerResult<Vec<RunnableTest>> {
        detect_csharp_tests(&self.ctx).await
    }

    async fn auto_detect_packages(&self) -> RunnerResult<Vec<String>> {
        Err(RunnerError::NotImplemented("namespace detection", "nunitconsole"))
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
                    .map(|class| format!("class =~ {}", class))
                    .collect();
            format!("--where {}", shell_words::quote(&clauses.join(" || ")))
        };

        let command = join_command(["nunit3-console", request.user_args, &filter]);
        wrap_if_instrumented(&self.ctx, request, self.name(), command)
    }
}
