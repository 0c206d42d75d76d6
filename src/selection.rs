//! Test selection.
//!
//! The [`Selector`] decides whether a run executes the whole suite or only
//! the tests the Test Intelligence service picked for the change set.
//! Selection never fails: any problem degrades to running every test, which
//! is always correct, just slower.
//!
//! # Decision order
//!
//! ```text
//! manual execution ───────────────► all
//! no changed files ───────────────► all
//! service error / invalid tests ──► all
//! service says select_all ────────► all
//! selected-only runs disabled ────► all   (service still called)
//! no service configured ──────────► all
//! otherwise ──────────────────────► service's tests
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::ci_env;
use crate::model::{ChangedFile, SelectionResult};
use crate::service::ServiceError;

/// Source of test selections.
#[async_trait]
pub trait SelectionService: Send + Sync {
    /// Asks which tests cover `files`.
    ///
    /// `select_only` tells the service whether the answer will be used to
    /// restrict the run or only recorded.
    async fn select_tests(
        &self,
        step_id: &str,
        files: &[ChangedFile],
        select_only: bool,
    ) -> Result<SelectionResult, ServiceError>;
}

/// Chooses the tests of a run.
pub struct Selector {
    service: Option<Arc<dyn SelectionService>>,
    env: HashMap<String, String>,
}

impl Selector {
    /// Creates a selector reading CI variables from `env`.
    pub fn new(env: HashMap<String, String>) -> Self {
        Self { service: None, env }
    }

    /// Sets the selection service.
    pub fn with_service(mut self, service: Arc<dyn SelectionService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Produces the selection for this step.
    pub async fn select_tests(
        &self,
        changed_files: Option<&[ChangedFile]>,
        run_only_selected: bool,
        step_id: &str,
    ) -> SelectionResult {
        if ci_env::is_manual_execution(&self.env) {
            info!("Manual execution detected, a pull request is needed for test selection. Running all tests");
            return SelectionResult::all();
        }

        let Some(files) = changed_files.filter(|f| !f.is_empty()) else {
            info!("No changed files available. Running all tests");
            return SelectionResult::all();
        };

        let Some(service) = &self.service else {
            info!("Test intelligence service not configured. Running all tests");
            return SelectionResult::all();
        };

        let result = match service.select_tests(step_id, files, run_only_selected).await {
            Ok(result) => result,
            Err(e) => {
                error!(step = step_id, error = %e, "Test selection failed. Running all tests");
                return SelectionResult::all();
            }
        };

        if result.tests.iter().any(|t| !t.is_valid()) {
            error!(step = step_id, "Service returned tests without a class. Running all tests");
            return SelectionResult::all();
        }
        if result.select_all {
            info!("Service selected all tests");
            return SelectionResult::all();
        }
        if !run_only_selected {
            warn!("Selected-only runs are disabled. Running all tests");
            return SelectionResult::all();
        }

        info!(
            step = step_id,
            count = result.tests.len(),
            "Running selected tests"
        );
        SelectionResult::selected(result.tests)
    }
}
