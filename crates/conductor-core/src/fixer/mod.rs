//! Fixer: runs one agent invocation against a list of review issues and
//! reports which files it touched.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};

use conductor_db::models::ReviewIssue;

use crate::harness::{run_to_completion, AgentRunResult, Harness, MaterializedTask};

const FIX_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const FIX_SYSTEM_PROMPT: &str = "You are the fix agent for an autonomous software engineering \
system. Address every issue listed below, make the minimal changes needed, and do not \
introduce unrelated changes.";

#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub success: bool,
    pub files_modified: Vec<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost_usd: f64,
}

pub async fn run_fix(
    task_id: uuid::Uuid,
    issues: &[ReviewIssue],
    repo_root: &Path,
    harness: &dyn Harness,
) -> Result<FixOutcome> {
    let prompt = build_fix_prompt(issues);
    let materialized = MaterializedTask {
        task_id,
        name: "fix review issues".to_string(),
        description: format!("{FIX_SYSTEM_PROMPT}\n\n{prompt}"),
        invariant_commands: vec![],
        working_dir: repo_root.to_path_buf(),
        env_vars: HashMap::new(),
    };

    let handle = harness.spawn(&materialized).await.context("failed to spawn fixer agent")?;
    let result = run_to_completion(harness, &handle, FIX_TIMEOUT).await?;

    let files_modified = union_modified_files(&result, repo_root);

    Ok(FixOutcome {
        success: result.success,
        files_modified,
        input_tokens: result.input_tokens,
        output_tokens: result.output_tokens,
        total_cost_usd: result.total_cost_usd.unwrap_or(0.0),
    })
}

fn build_fix_prompt(issues: &[ReviewIssue]) -> String {
    let mut prompt = String::from("## Issues to fix\n");
    for issue in issues {
        let location = match issue.line {
            Some(line) => format!("{}:{}", issue.file, line),
            None => issue.file.clone(),
        };
        let suggestion = issue
            .suggestion
            .as_deref()
            .map(|s| format!(" ({s})"))
            .unwrap_or_default();
        prompt.push_str(&format!("[{}] {location} {}{suggestion}\n", issue.severity, issue.message));
    }
    prompt
}

/// Union of the runner-reported modified files and a `git status --porcelain`
/// / `git ls-files --others` scan of the working tree, in case the runner's
/// tool-call accounting missed a file touched by a shell command.
fn union_modified_files(result: &AgentRunResult, repo_root: &Path) -> Vec<String> {
    let mut files: std::collections::BTreeSet<String> = result.files_modified.iter().cloned().collect();

    if let Ok(output) = Command::new("git").args(["status", "--porcelain"]).current_dir(repo_root).output() {
        if output.status.success() {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                if let Some(path) = line.get(3..) {
                    files.insert(path.trim().to_string());
                }
            }
        }
    }

    files.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_db::models::IssueSeverity;

    #[test]
    fn fix_prompt_formats_issue_with_line_and_suggestion() {
        let issues = vec![ReviewIssue {
            file: "src/lib.rs".to_string(),
            line: Some(42),
            severity: IssueSeverity::Error,
            message: "missing null check".to_string(),
            suggestion: Some("add an early return".to_string()),
        }];
        let prompt = build_fix_prompt(&issues);
        assert!(prompt.contains("[error] src/lib.rs:42 missing null check (add an early return)"));
    }

    #[test]
    fn fix_prompt_handles_missing_line_and_suggestion() {
        let issues = vec![ReviewIssue {
            file: "src/main.rs".to_string(),
            line: None,
            severity: IssueSeverity::Warning,
            message: "consider renaming".to_string(),
            suggestion: None,
        }];
        let prompt = build_fix_prompt(&issues);
        assert!(prompt.contains("[warning] src/main.rs consider renaming\n"));
    }
}
