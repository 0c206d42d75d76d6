//! Core data types shared by selection, splitting and the runners.
//!
//! These are plain data: a [`RunnableTest`] names a test by package, class
//! and file, a [`ChangedFile`] is one entry of the diff that triggered the
//! run, and a [`SelectionResult`] is the decision of which tests to run.
//!
//! The serde layout matches the JSON exchanged with the Test Intelligence
//! service, so the same types are used on the wire and in memory.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A test that can be handed to a runner.
///
/// For JVM and .NET languages `class` holds the class name and `pkg` the
/// package or namespace. Path based languages (Python) store the file path
/// in `class` and leave `pkg` empty.
///
/// # Example
///
/// ```
/// use tirun::model::RunnableTest;
///
/// let test = RunnableTest::new("io.harness.ci", "BuildTest").with_method("testBuild");
/// assert_eq!(test.qualified_class(), "io.harness.ci.BuildTest");
/// assert!(test.is_valid());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnableTest {
    /// Package or namespace of the test class.
    #[serde(default)]
    pub pkg: String,

    /// Class name, or the file path for path based languages.
    #[serde(default)]
    pub class: String,

    /// Test method, when the selection is method-granular.
    #[serde(default)]
    pub method: String,

    /// Where auto-detection found this test.
    #[serde(default)]
    pub autodetect: AutoDetect,
}

/// Location information recorded by auto-detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AutoDetect {
    /// Source file path relative to the workspace.
    #[serde(default)]
    pub path: String,

    /// Build rule owning the test (Bazel targets).
    #[serde(default)]
    pub rule: String,
}

impl RunnableTest {
    /// Creates a test from a package and class name.
    pub fn new(pkg: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            pkg: pkg.into(),
            class: class.into(),
            ..Default::default()
        }
    }

    /// Sets the method name.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Sets the auto-detected source path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.autodetect.path = path.into();
        self
    }

    /// Sets the owning build rule.
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.autodetect.rule = rule.into();
        self
    }

    /// A test is usable only when its identifying field is present.
    pub fn is_valid(&self) -> bool {
        !self.class.is_empty()
    }

    /// Returns `pkg.class`, or just `class` when there is no package.
    pub fn qualified_class(&self) -> String {
        if self.pkg.is_empty() {
            self.class.clone()
        } else {
            format!("{}.{}", self.pkg, self.class)
        }
    }
}

impl fmt::Display for RunnableTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_class())?;
        if !self.method.is_empty() {
            write!(f, "#{}", self.method)?;
        }
        Ok(())
    }
}

/// Change status of a file in the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Modified,
    Added,
    Deleted,
}

/// One file of the change set that triggered the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    /// Path relative to the repository root.
    pub name: String,

    /// What happened to the file.
    pub status: FileStatus,
}

impl ChangedFile {
    /// Creates a changed-file entry.
    pub fn new(name: impl Into<String>, status: FileStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}

/// Parses the JSON encoded change list handed to the step.
///
/// An empty or whitespace-only string means no change list is available.
pub fn parse_changed_files(raw: &str) -> serde_json::Result<Option<Vec<ChangedFile>>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw).map(Some)
}

/// The decision of which tests to run for this step invocation.
///
/// Produced once by the selector and never mutated afterward. When
/// `select_all` is set, `tests` is empty and the whole suite runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionResult {
    /// Run the whole suite.
    #[serde(default)]
    pub select_all: bool,

    /// Tests to run when `select_all` is false.
    #[serde(default)]
    pub tests: Vec<RunnableTest>,
}

impl SelectionResult {
    /// Selection that runs every test.
    pub fn all() -> Self {
        Self {
            select_all: true,
            tests: Vec::new(),
        }
    }

    /// Selection restricted to the given tests.
    pub fn selected(tests: Vec<RunnableTest>) -> Self {
        Self {
            select_all: false,
            tests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_requires_class() {
        assert!(RunnableTest::new("", "tests/test_a.py").is_valid());
        assert!(!RunnableTest::new("io.harness", "").is_valid());
    }

    #[test]
    fn test_display_includes_method() {
        let test = RunnableTest::new("a.b", "C").with_method("m");
        assert_eq!(test.to_string(), "a.b.C#m");
        assert_eq!(RunnableTest::new("", "C").to_string(), "C");
    }

    #[test]
    fn test_parse_changed_files() {
        let raw = r#"[{"name": "src/main/java/A.java", "status": "modified"},
                      {"name": "B.py", "status": "deleted"}]"#;
        let files = parse_changed_files(raw).unwrap().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].status, FileStatus::Deleted);

        assert!(parse_changed_files("  ").unwrap().is_none());
        assert!(parse_changed_files("{not json").is_err());
    }

    #[test]
    fn test_selection_wire_format() {
        let resp: SelectionResult = serde_json::from_str(
            r#"{"selectAll": false, "tests": [{"pkg": "p", "class": "C", "method": "m"}]}"#,
        )
        .unwrap();
        assert!(!resp.select_all);
        assert_eq!(resp.tests[0].class, "C");
        assert_eq!(resp.tests[0].autodetect, AutoDetect::default());
    }
}
