//! Coverage agent preparation.
//!
//! Whether the agent is attached to a run is an explicit policy value,
//! [`Instrumentation`], carrying the reason when it is not. Before the first
//! attempt the orchestrator installs the agent bundle for the language and
//! writes the agent configuration file:
//!
//! | Language | File | Format |
//! |----------|------|--------|
//! | Java, Python | `config.ini` | `key: value` lines |
//! | C# | `config.yaml` | YAML with an inline namespace list |
//!
//! The agent writes its callgraph files into [`callgraph_dir`], which the
//! artifact collector harvests after the run.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::runner::Language;

/// Directory (relative to the step's tmp dir) handed to agents as `outDir`.
pub const AGENT_OUT_DIR: &str = "ti/callgraph";

/// Directory (relative to the step's tmp dir) where callgraph files land.
pub const CALLGRAPH_DIR: &str = "ti/callgraph/cg";

/// Returns the callgraph directory for a step's tmp dir.
pub fn callgraph_dir(tmp_dir: &Path) -> PathBuf {
    tmp_dir.join(CALLGRAPH_DIR)
}

/// Why the agent is not attached to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The build was started by hand; there is no diff to learn from.
    ManualExecution,
    /// The run is scoped to a selection and never needs a full callgraph.
    NoTestsSelected,
    /// Parallel full run whose tests could not be detected and split.
    ParallelFullRun,
}

/// Whether the coverage agent is attached to the test command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instrumentation {
    Enabled,
    Ignored(IgnoreReason),
}

impl Instrumentation {
    /// Returns `true` when the agent is attached.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Instrumentation::Enabled)
    }
}

impl fmt::Display for Instrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instrumentation::Enabled => f.write_str("enabled"),
            Instrumentation::Ignored(IgnoreReason::ManualExecution) => {
                f.write_str("ignored (manual execution)")
            }
            Instrumentation::Ignored(IgnoreReason::NoTestsSelected) => {
                f.write_str("ignored (no tests selected)")
            }
            Instrumentation::Ignored(IgnoreReason::ParallelFullRun) => {
                f.write_str("ignored (parallel full run)")
            }
        }
    }
}

/// Result type for agent preparation.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors raised while preparing the agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// No install source is configured for a language that needs one.
    #[error("no agent install source configured for {0}")]
    NoSource(Language),

    /// The agent archive does not exist.
    #[error("agent archive not found: {}", .0.display())]
    MissingArchive(PathBuf),

    /// Unpacking the archive failed.
    #[error("failed to unpack agent archive {}: {source}", path.display())]
    Unpack {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing the configuration file failed.
    #[error("failed to write agent config {}: {source}", path.display())]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Background task panicked or was cancelled.
    #[error("agent install task failed: {0}")]
    Join(String),
}

/// Inputs of the agent configuration file.
#[derive(Debug, Clone, Default)]
pub struct AgentSettings {
    /// Packages (JVM, Python) or namespaces (C#) to instrument.
    pub packages: Vec<String>,

    /// Test annotations, JVM only.
    pub annotations: String,
}

/// Splits a comma separated setting into trimmed, non-empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Renders the `config.ini` read by the JVM and Python agents.
pub fn render_ini(out_dir: &Path, settings: &AgentSettings) -> String {
    let mut data = format!(
        "outDir: {}/\nlogLevel: 0\nlogConsole: false\nwriteTo: COVERAGE_JSON\ninstrPackages: {}",
        out_dir.display(),
        settings.packages.join(",")
    );
    if !settings.annotations.is_empty() {
        data.push_str(&format!("\ntestAnnotations: {}", settings.annotations));
    }
    data
}

/// Renders the `config.yaml` read by the .NET agent.
pub fn render_yaml(callgraph_dir: &Path, settings: &AgentSettings) -> String {
    let namespaces: Vec<String> = settings
        .packages
        .iter()
        .map(|ns| format!("'{}'", ns))
        .collect();
    format!(
        "outDir: '{}'\nlogLevel: 0\nwriteTo: [COVERAGE_JSON]\ninstrPackages: [{}]",
        callgraph_dir.display(),
        namespaces.join(",")
    )
}

/// Writes the agent configuration for `language` under `tmp_dir` and returns
/// its path. Creates the callgraph output directories.
pub async fn write_agent_config(
    language: Language,
    tmp_dir: &Path,
    settings: &AgentSettings,
) -> AgentResult<PathBuf> {
    let out_dir = tmp_dir.join(AGENT_OUT_DIR);
    let cg_dir = callgraph_dir(tmp_dir);
    tokio::fs::create_dir_all(&cg_dir)
        .await
        .map_err(|source| AgentError::WriteConfig {
            path: cg_dir.clone(),
            source,
        })?;

    let (path, data) = match language {
        Language::Csharp => (tmp_dir.join("config.yaml"), render_yaml(&cg_dir, settings)),
        Language::Java | Language::Python => {
            (tmp_dir.join("config.ini"), render_ini(&out_dir, settings))
        }
    };

    tracing::debug!(path = %path.display(), "Writing agent config:\n{}", data);
    tokio::fs::write(&path, data)
        .await
        .map_err(|source| AgentError::WriteConfig {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}

/// Installs the agent bundle of a language.
#[async_trait]
pub trait AgentInstaller: Send + Sync {
    /// Installs the agent for `language` into `dest` and returns the
    /// directory holding it, or `None` when the language needs no install.
    async fn install(&self, language: Language, dest: &Path) -> AgentResult<Option<PathBuf>>;
}

/// Installs agents by unpacking `<source>/<language>-agent.tar`.
///
/// The Java agent ships inside the step image and is never installed.
pub struct LocalAgentInstaller {
    source: Option<PathBuf>,
}

impl LocalAgentInstaller {
    /// Creates an installer reading archives from `source`.
    pub fn new(source: Option<PathBuf>) -> Self {
        Self { source }
    }

    fn archive_for(&self, language: Language) -> AgentResult<PathBuf> {
        let source = self
            .source
            .as_deref()
            .ok_or(AgentError::NoSource(language))?;
        Ok(source.join(format!("{}-agent.tar", language)))
    }
}

#[async_trait]
impl AgentInstaller for LocalAgentInstaller {
    async fn install(&self, language: Language, dest: &Path) -> AgentResult<Option<PathBuf>> {
        if language == Language::Java {
            return Ok(None);
        }

        let archive = self.archive_for(language)?;
        if !archive.is_file() {
            return Err(AgentError::MissingArchive(archive));
        }

        let target = dest.join(format!("{}-agent", language));
        let target_for_task = target.clone();
        let archive_for_task = archive.clone();
        tokio::task::spawn_blocking(move || unpack(&archive_for_task, &target_for_task))
            .await
            .map_err(|e| AgentError::Join(e.to_string()))?
            .map_err(|source| AgentError::Unpack {
                path: archive,
                source,
            })?;

        tracing::info!(language = %language, dir = %target.display(), "Installed agent");
        Ok(Some(target))
    }
}

fn unpack(archive: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    let file = std::fs::File::open(archive)?;
    tar::Archive::new(file).unpack(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" io.a, io.b ,,"), vec!["io.a", "io.b"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_render_ini() {
        let settings = AgentSettings {
            packages: vec!["io.a".into(), "io.b".into()],
            annotations: String::new(),
        };
        assert_eq!(
            render_ini(Path::new("/tmp/engine/ti/callgraph"), &settings),
            "outDir: /tmp/engine/ti/callgraph/\nlogLevel: 0\nlogConsole: false\nwriteTo: COVERAGE_JSON\ninstrPackages: io.a,io.b"
        );

        let settings = AgentSettings {
            annotations: "org.junit.Test".into(),
            ..settings
        };
        assert!(
            render_ini(Path::new("/x"), &settings).ends_with("\ntestAnnotations: org.junit.Test")
        );
    }

    #[test]
    fn test_render_yaml() {
        let settings = AgentSettings {
            packages: vec!["Acme.Core".into(), "Acme.Web".into()],
            annotations: String::new(),
        };
        assert_eq!(
            render_yaml(Path::new("/tmp/cg"), &settings),
            "outDir: '/tmp/cg'\nlogLevel: 0\nwriteTo: [COVERAGE_JSON]\ninstrPackages: ['Acme.Core','Acme.Web']"
        );
    }

    #[tokio::test]
    async fn test_write_agent_config_creates_dirs() {
        let dir = TempDir::new().unwrap();
        let path = write_agent_config(Language::Java, dir.path(), &AgentSettings::default())
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("config.ini"));
        assert!(callgraph_dir(dir.path()).is_dir());

        let path = write_agent_config(Language::Csharp, dir.path(), &AgentSettings::default())
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("config.yaml"));
    }

    #[tokio::test]
    async fn test_java_needs_no_install() {
        let dir = TempDir::new().unwrap();
        let installer = LocalAgentInstaller::new(None);
        assert!(installer.install(Language::Java, dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_install_unpacks_archive() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();

        let archive = std::fs::File::create(src.path().join("python-agent.tar")).unwrap();
        let mut builder = tar::Builder::new(archive);
        let data = b"#!/bin/sh\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "ti-wrapper", &data[..])
            .unwrap();
        builder.finish().unwrap();
        drop(builder);

        let installer = LocalAgentInstaller::new(Some(src.path().to_path_buf()));
        let dir = installer
            .install(Language::Python, dest.path())
            .await
            .unwrap()
            .unwrap();
        assert!(dir.join("ti-wrapper").is_file());
    }

    #[tokio::test]
    async fn test_install_missing_archive() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let installer = LocalAgentInstaller::new(Some(src.path().to_path_buf()));
        let err = installer
            .install(Language::Csharp, dest.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::MissingArchive(_)));

        let installer = LocalAgentInstaller::new(None);
        assert!(matches!(
            installer.install(Language::Csharp, dest.path()).await,
            Err(AgentError::NoSource(Language::Csharp))
        ));
    }
}
