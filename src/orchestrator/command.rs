//! Composition of the shell script executed for a step.
//!
//! ```text
//! set -xe
//! export TMPDIR=<tmp_dir>
//! export HARNESS_JAVA_AGENT=<-javaagent flag or empty>
//! <pre command>
//! <test command>
//! <post command>
//! echo NAME $NAME >> <output file>     (one line per output variable)
//! ```
//!
//! `${{ env.NAME }}` placeholders are resolved before execution; an unknown
//! name is an error.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::StepError;
use crate::runner::gradle::JAVA_AGENT_PROPERTY;

static ENV_EXPR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*env\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex")
});

/// Pieces of the composed script.
#[derive(Debug, Clone)]
pub struct ScriptParts<'a> {
    pub tmp_dir: &'a Path,
    pub java_agent: &'a str,
    pub pre_command: &'a str,
    pub test_command: &'a str,
    pub post_command: &'a str,
    pub output_vars: &'a [String],
    pub output_file: &'a Path,
}

/// Builds the script run by `sh -c`.
pub fn compose(parts: &ScriptParts<'_>) -> String {
    let mut script = format!(
        "set -xe\nexport TMPDIR={}\nexport {}={}\n{}\n{}\n{}",
        parts.tmp_dir.display(),
        JAVA_AGENT_PROPERTY,
        parts.java_agent,
        parts.pre_command,
        parts.test_command,
        parts.post_command
    );
    for var in parts.output_vars {
        script.push_str(&format!(
            "\necho {} ${} >> {}",
            var,
            var,
            parts.output_file.display()
        ));
    }
    script
}

/// Replaces `${{ env.NAME }}` placeholders with values from `lookup`.
pub fn resolve_expressions(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, StepError> {
    let mut missing = None;
    let resolved = ENV_EXPR.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match lookup(name) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(StepError::UnresolvedExpression(name)),
        None => Ok(resolved.into_owned()),
    }
}

/// Resolves the step environment: placeholders first, then `$VAR`
/// references against the process environment. Unknown `$VAR`s are left
/// as written.
pub fn resolve_env(
    environment: &HashMap<String, String>,
    process_env: &HashMap<String, String>,
) -> Result<HashMap<String, String>, StepError> {
    let mut resolved = HashMap::with_capacity(environment.len());
    for (key, value) in environment {
        let value = resolve_expressions(value, |name| process_env.get(name).cloned())?;
        let value = shellexpand::env_with_context_no_errors(&value, |name| {
            process_env.get(name).map(String::as_str)
        })
        .into_owned();
        resolved.insert(key.clone(), value);
    }
    Ok(resolved)
}
