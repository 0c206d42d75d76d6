//! Workspace scanning shared by the runners.
//!
//! Test files are found by walking the workspace and matching each relative
//! path against glob patterns. Hidden directories and build output are never
//! entered. Results are sorted so that every parallel node sees the same list.

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use walkdir::{DirEntry, WalkDir};

use super::{RunnerError, RunnerResult};
use crate::model::RunnableTest;

/// Default test-file patterns for JVM sources.
pub const JAVA_GLOBS: &[&str] = &[
    "**/src/test/**/*Test.java",
    "**/src/test/**/*Tests.java",
    "**/src/test/**/Test*.java",
    "**/src/test/**/*Test.kt",
    "**/src/test/**/*Test.scala",
];

/// Default test-file patterns for C# sources.
pub const CSHARP_GLOBS: &[&str] = &["**/*Test.cs", "**/*Tests.cs"];

/// Default test-file patterns for Python sources.
pub const PYTHON_GLOBS: &[&str] = &["**/test_*.py", "**/*_test.py"];

const SKIPPED_DIRS: &[&str] = &[
    "target",
    "build",
    "node_modules",
    "bin",
    "obj",
    "__pycache__",
    "venv",
];

const JVM_SOURCE_ROOTS: &[&str] = &["src/test/java/", "src/test/kotlin/", "src/test/scala/"];

/// Returns the workspace-relative paths of files matching any of `globs`.
///
/// Runs the directory walk on the blocking pool.
pub async fn scan(workspace: &Path, globs: Vec<String>) -> RunnerResult<Vec<String>> {
    let root = workspace.to_path_buf();
    tokio::task::spawn_blocking(move || scan_blocking(&root, &globs))
        .await
        .map_err(|e| RunnerError::Scan {
            path: workspace.to_path_buf(),
            message: e.to_string(),
        })?
}

/// Blocking variant of [`scan`].
pub fn scan_blocking(workspace: &Path, globs: &[String]) -> RunnerResult<Vec<String>> {
    let patterns = compile(globs)?;
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let mut found = Vec::new();
    let walker = WalkDir::new(workspace)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped(e));

    for entry in walker {
        let entry = entry.map_err(|e| RunnerError::Scan {
            path: workspace.to_path_buf(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(workspace) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        if patterns
            .iter()
            .any(|p| p.matches_with(&relative, options))
        {
            found.push(relative);
        }
    }

    found.sort();
    Ok(found)
}

fn compile(globs: &[String]) -> RunnerResult<Vec<Pattern>> {
    globs
        .iter()
        .map(|g| {
            Pattern::new(g).map_err(|e| RunnerError::InvalidGlob {
                pattern: g.clone(),
                message: e.msg.to_string(),
            })
        })
        .collect()
}

fn is_skipped(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || name.starts_with("bazel-") || SKIPPED_DIRS.contains(&name.as_ref())
}

/// Derives a JVM test from its source path.
///
/// `svc/src/test/java/io/harness/FooTest.java` becomes package `io.harness`,
/// class `FooTest`. Paths outside a standard test source root keep only the
/// class name.
pub fn jvm_test_from_path(path: &str) -> Option<RunnableTest> {
    let file = Path::new(path);
    let class = file.file_stem()?.to_string_lossy().into_owned();

    let pkg = JVM_SOURCE_ROOTS
        .iter()
        .find_map(|root| path.find(root).map(|at| &path[at + root.len()..]))
        .and_then(|rest| rest.rsplit_once('/'))
        .map(|(dir, _)| dir.replace('/', "."))
        .unwrap_or_default();

    Some(RunnableTest::new(pkg, class).with_path(path))
}

/// Reads the `namespace` declaration of a C# source file.
pub fn csharp_namespace(source: &str) -> Option<String> {
    source.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("namespace ")?;
        let ns = rest.trim_end_matches([';', '{', ' ']).trim();
        (!ns.is_empty()).then(|| ns.to_string())
    })
}

/// Finds the Bazel package owning `path`: the nearest ancestor directory that
/// holds a `BUILD` or `BUILD.bazel` file.
pub fn bazel_package(workspace: &Path, path: &str) -> Option<String> {
    let mut dir = Path::new(path).parent();
    while let Some(candidate) = dir {
        let abs: PathBuf = workspace.join(candidate);
        if abs.join("BUILD").is_file() || abs.join("BUILD.bazel").is_file() {
            return Some(candidate.to_string_lossy().replace('\\', "/"));
        }
        dir = candidate.parent();
    }
    None
}
