//! Configuration loading and schema definitions for tirun.
//!
//! This module provides types and functions for loading the step
//! configuration from TOML files or strings.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::runner::{Language, check_supported};

/// Loads tirun configuration from a TOML file.
///
/// Paths in the file may start with `~`, which is expanded to the home
/// directory. The language/build-tool pair is validated before returning.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - The build tool is not supported for the language
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    load_config_str(&content)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

/// Loads tirun configuration from a TOML string.
///
/// # Example
///
/// ```
/// use tirun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [step]
///     id = "unit"
///     language = "java"
///     build_tool = "gradle"
///     num_retries = 3
/// "#)?;
///
/// assert_eq!(config.step.num_retries, 3);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;

    config.validate()?;
    config.expand_paths();

    Ok(config)
}

impl Config {
    /// Rejects configurations that can never run.
    pub fn validate(&self) -> Result<()> {
        check_supported(self.step.language, self.step.build_tool)?;
        if self.step.id.trim().is_empty() {
            anyhow::bail!("step.id must not be empty");
        }
        let language = self.step.language;
        if language != Language::Java && self.agent.install_source.is_none() {
            anyhow::bail!(
                "agent.install_source is required for {}: its agent is installed on every instrumented run",
                language
            );
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.step.tmp_dir = expand(&self.step.tmp_dir);
        self.step.workspace = self.step.workspace.as_deref().map(expand);
        self.agent.java_agent_jar = expand(&self.agent.java_agent_jar);
        self.agent.install_source = self.agent.install_source.as_deref().map(expand);
        self.report.output_dir = expand(&self.report.output_dir);
    }

    /// The workspace directory, falling back to the current directory.
    pub fn workspace(&self) -> PathBuf {
        self.step
            .workspace
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::BuildTool;
    use crate::split::SplitStrategy;

    #[test]
    fn test_defaults() {
        let config = load_config_str(
            r#"
            [step]
            id = "s1"
            language = "csharp"
            build_tool = "dotnet"

            [agent]
            install_source = "/opt/agents"
            "#,
        )
        .unwrap();

        assert_eq!(config.step.language, Language::Csharp);
        assert_eq!(config.step.build_tool, BuildTool::Dotnet);
        assert_eq!(config.step.effective_timeout_secs(), 14400);
        assert_eq!(config.step.effective_retries(), 1);
        assert!(config.step.run_only_selected_tests);
        assert_eq!(config.step.split_strategy, SplitStrategy::HistoricalTiming);
        assert!(config.service.endpoint.is_none());
        assert_eq!(config.report.output_dir, PathBuf::from("ti-results"));
    }

    #[test]
    fn test_zero_means_default() {
        let config = load_config_str(
            r#"
            [step]
            id = "s1"
            language = "java"
            build_tool = "maven"
            timeout_secs = 0
            num_retries = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.step.effective_timeout_secs(), 14400);
        assert_eq!(config.step.effective_retries(), 1);
    }

    #[test]
    fn test_full_step() {
        let config = load_config_str(
            r#"
            [step]
            id = "s1"
            language = "python"
            build_tool = "pytest"
            args = "-x"
            split_strategy = "file_size"
            env_var_outputs = ["COVERAGE"]
            test_globs = ["checks/**/*_check.py"]

            [step.environment]
            PYTHONPATH = "src"

            [[step.reports]]
            type = "junit"
            paths = ["reports/*.xml"]

            [agent]
            install_source = "/opt/agents"

            [service]
            endpoint = "http://localhost:8080"
            "#,
        )
        .unwrap();

        assert_eq!(config.step.split_strategy, SplitStrategy::LineCount);
        assert_eq!(config.step.reports.len(), 1);
        assert_eq!(config.step.reports[0].kind, ReportKind::Junit);
        assert_eq!(config.step.environment["PYTHONPATH"], "src");
        assert_eq!(config.service.timeout_secs, 60);
    }

    #[test]
    fn test_unsupported_build_tool_rejected() {
        let err = load_config_str(
            r#"
            [step]
            id = "s1"
            language = "python"
            build_tool = "maven"
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("not supported"));
    }

    #[test]
    fn test_installed_agent_needs_source() {
        let err = load_config_str(
            r#"
            [step]
            id = "s1"
            language = "python"
            build_tool = "unittest"
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("agent.install_source is required for python"));

        let config = load_config_str(
            r#"
            [step]
            id = "s1"
            language = "python"
            build_tool = "unittest"

            [agent]
            install_source = "/opt/agents"
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.install_source, Some(PathBuf::from("/opt/agents")));
    }

    #[test]
    fn test_unknown_language_rejected() {
        let result = load_config_str(
            r#"
            [step]
            id = "s1"
            language = "cobol"
            build_tool = "maven"
            "#,
        );
        assert!(result.is_err());
    }
}
