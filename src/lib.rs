//! tirun: the Test Intelligence run-tests step.
//!
//! Runs a project's tests the way a CI step would, doing as little work as
//! the change allows:
//!
//! - **Selection**: ask the Test Intelligence service which tests a change
//!   affects, falling back to the whole suite whenever that answer is not
//!   usable.
//! - **Splitting**: spread the tests over parallel CI nodes with a
//!   deterministic longest-processing-time packing.
//! - **Runners**: turn the selection into a build tool command for Maven,
//!   Gradle, Bazel, `dotnet test`, NUnit console, pytest or unittest.
//! - **Instrumentation**: attach the call graph agent and write its config.
//! - **Execution**: run the composed script with a timeout and retries.
//! - **Artifacts**: collect the call graph and JUnit reports afterwards.
//!
//! # Example
//!
//! ```no_run
//! use tirun::config::load_config;
//! use tirun::orchestrator::Orchestrator;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("tirun.toml"))?;
//!     let orchestrator = Orchestrator::new(config, tirun::ci_env::process_env());
//!     let result = orchestrator.run(&CancellationToken::new()).await;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod ci_env;
pub mod config;
pub mod instrumentation;
pub mod model;
pub mod orchestrator;
pub mod process;
pub mod report;
pub mod runner;
pub mod selection;
pub mod service;
pub mod split;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use model::{ChangedFile, RunnableTest, SelectionResult};
pub use orchestrator::{Orchestrator, StepError, StepResult};
pub use runner::{BuildTool, Language, TestRunner};
