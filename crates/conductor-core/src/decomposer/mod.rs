//! Decomposer (Master): turns a task's title/description into either a flat
//! list of subtasks scoped to detected subprojects, a set of child-task
//! definitions for an epic, or a human-review question.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conductor_db::models::Task;

use crate::config::ProjectConfig;
use crate::forge::{fetch_context_files, SourceForgeClient};
use crate::harness::{run_to_completion, Harness, MaterializedTask};
use crate::subproject::{detect_subprojects, AutoDetectConfig, Subproject};

const MAX_PATHS_IN_PROMPT: usize = 500;
const MASTER_MAX_TOKENS: u32 = 4096;
const MASTER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedSubtask {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub subproject_path: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildTaskDefinition {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaskDecomposition {
    Simple {
        #[serde(default)]
        subtasks: Vec<PlannedSubtask>,
        #[serde(default, rename = "needsHumanReview")]
        needs_human_review: bool,
        #[serde(default, rename = "humanReviewQuestion")]
        human_review_question: Option<String>,
    },
    Epic {
        #[serde(default)]
        children: Vec<ChildTaskDefinition>,
        #[serde(default, rename = "needsHumanReview")]
        needs_human_review: bool,
        #[serde(default, rename = "humanReviewQuestion")]
        human_review_question: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct InsertedSubtask {
    pub title: String,
    pub description: String,
    pub subproject_path: String,
    pub depends_on: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub enum DecomposeOutcome {
    NeedsHumanReview { question: String },
    Simple {
        subtasks: Vec<InsertedSubtask>,
        affected_subprojects: Vec<String>,
        summary: String,
    },
    Epic { children: Vec<ChildTaskDefinition> },
}

const MASTER_SYSTEM_PROMPT: &str = "You are the master planning agent for an autonomous \
software engineering system. Decompose the given task into either a flat list of \
independent subtasks scoped to the repository's subprojects, or, for work spanning \
unrelated areas best tracked as separate issues, a set of child tasks. Respond with a \
single JSON code block matching the TaskDecomposition schema. If the task is \
underspecified, set needsHumanReview=true and ask one clarifying question instead.";

/// Run the Decomposer's 11-step procedure against a task.
pub async fn decompose(
    task: &Task,
    repo_root: &Path,
    client: &dyn SourceForgeClient,
    harness: &dyn Harness,
) -> Result<DecomposeOutcome> {
    let repo_files = client
        .list_repo_files(&task.repository_full_name)
        .await
        .unwrap_or_default();

    let config = match client
        .get_file_contents(&task.repository_full_name, ".conductor.yml")
        .await
    {
        Ok(Some(yaml)) => ProjectConfig::parse(&yaml).ok(),
        _ => None,
    };

    let explicit: Vec<Subproject> = config
        .as_ref()
        .map(|c| {
            c.subprojects
                .explicit
                .iter()
                .map(|e| Subproject {
                    path: e.path.clone(),
                    name: e.name.clone(),
                    language: e.language.clone(),
                    test_command: e.test_command.clone(),
                    build_command: e.build_command.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    let auto_detect = config
        .as_ref()
        .map(|c| AutoDetectConfig {
            enabled: c.subprojects.auto_detect.enabled,
            patterns: c.subprojects.auto_detect.patterns.clone(),
        })
        .unwrap_or_default();
    let subprojects = detect_subprojects(repo_root, &explicit, &auto_detect);

    let context_files = fetch_context_files(client, &task.repository_full_name).await;

    let prompt = build_analysis_prompt(task, &repo_files, &subprojects, &context_files);

    let materialized = MaterializedTask {
        task_id: task.id,
        name: format!("decompose: {}", task.title),
        description: prompt,
        invariant_commands: vec![],
        working_dir: repo_root.to_path_buf(),
        env_vars: HashMap::new(),
    };

    let handle = harness
        .spawn(&materialized)
        .await
        .context("failed to spawn decomposer agent")?;
    let result = run_to_completion(harness, &handle, MASTER_TIMEOUT).await?;

    let decomposition = parse_decomposition(&result.output)?;

    match decomposition {
        TaskDecomposition::Simple { needs_human_review: true, human_review_question: Some(question), .. }
        | TaskDecomposition::Epic { needs_human_review: true, human_review_question: Some(question), .. } => {
            Ok(DecomposeOutcome::NeedsHumanReview { question })
        }
        TaskDecomposition::Epic { children, .. } => Ok(DecomposeOutcome::Epic { children }),
        TaskDecomposition::Simple { subtasks, .. } => {
            let planned = if subtasks.is_empty() {
                vec![PlannedSubtask {
                    title: task.title.clone(),
                    description: task.description.clone(),
                    subproject_path: ".".to_string(),
                    depends_on: vec![],
                }]
            } else {
                subtasks
            };

            let valid_paths: Vec<&str> = subprojects.iter().map(|s| s.path.as_str()).collect();
            let by_title: HashMap<&str, Uuid> = planned
                .iter()
                .map(|s| (s.title.as_str(), Uuid::new_v4()))
                .collect();

            let affected_subprojects: Vec<String> = planned
                .iter()
                .map(|s| s.subproject_path.clone())
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();

            let subtasks = planned
                .into_iter()
                .map(|s| {
                    let path = if s.subproject_path.is_empty()
                        || s.subproject_path == "."
                        || valid_paths.contains(&s.subproject_path.as_str())
                    {
                        if s.subproject_path.is_empty() {
                            ".".to_string()
                        } else {
                            s.subproject_path.clone()
                        }
                    } else {
                        ".".to_string()
                    };
                    let depends_on = s
                        .depends_on
                        .iter()
                        .filter_map(|title| by_title.get(title.as_str()).copied())
                        .collect();
                    InsertedSubtask {
                        title: s.title,
                        description: s.description,
                        subproject_path: path,
                        depends_on,
                    }
                })
                .collect();

            Ok(DecomposeOutcome::Simple {
                subtasks,
                affected_subprojects,
                summary: format!("Decomposed \"{}\" into subtasks", task.title),
            })
        }
    }
}

fn build_analysis_prompt(
    task: &Task,
    repo_files: &[crate::forge::RepoFile],
    subprojects: &[Subproject],
    context_files: &HashMap<String, String>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(MASTER_SYSTEM_PROMPT);
    prompt.push_str("\n\n## Task\n");
    prompt.push_str(&format!("Title: {}\n", task.title));
    prompt.push_str(&format!("Description: {}\n", task.description));

    prompt.push_str("\n## Repository structure\n");
    for file in repo_files.iter().take(MAX_PATHS_IN_PROMPT) {
        prompt.push_str(&file.path);
        prompt.push('\n');
    }

    prompt.push_str("\n## Detected subprojects\n");
    for sp in subprojects {
        prompt.push_str(&format!("- {} ({})\n", sp.path, sp.name));
    }

    for (name, content) in context_files {
        prompt.push_str(&format!("\n## {name}\n{content}\n"));
    }

    prompt
}

fn parse_decomposition(output: &str) -> Result<TaskDecomposition> {
    let fenced = extract_fenced_json(output).ok_or_else(|| {
        anyhow!("decomposer response did not contain a fenced JSON block")
    })?;
    serde_json::from_str(&fenced).context("failed to parse TaskDecomposition JSON")
}

fn extract_fenced_json(text: &str) -> Option<String> {
    let start_marker = text.find("```json").map(|i| i + "```json".len())?;
    let rest = &text[start_marker..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json_block() {
        let text = "Here is the plan:\n```json\n{\"type\": \"simple\", \"subtasks\": []}\n```\nDone.";
        let json = extract_fenced_json(text).unwrap();
        assert_eq!(json, r#"{"type": "simple", "subtasks": []}"#);
    }

    #[test]
    fn missing_fence_is_none() {
        assert!(extract_fenced_json("no json here").is_none());
    }

    #[test]
    fn parses_simple_decomposition() {
        let json = r#"{"type": "simple", "subtasks": [{"title": "a", "description": "b", "subprojectPath": "."}]}"#;
        let decomposition: TaskDecomposition = serde_json::from_str(json).unwrap();
        match decomposition {
            TaskDecomposition::Simple { subtasks, .. } => assert_eq!(subtasks.len(), 1),
            _ => panic!("expected simple"),
        }
    }

    #[test]
    fn parses_epic_decomposition() {
        let json = r#"{"type": "epic", "children": [{"title": "a", "description": "b", "dependsOn": []}]}"#;
        let decomposition: TaskDecomposition = serde_json::from_str(json).unwrap();
        match decomposition {
            TaskDecomposition::Epic { children, .. } => assert_eq!(children.len(), 1),
            _ => panic!("expected epic"),
        }
    }

    #[test]
    fn parses_human_review_request() {
        let json = r#"{"type": "simple", "needsHumanReview": true, "humanReviewQuestion": "Which database?"}"#;
        let decomposition: TaskDecomposition = serde_json::from_str(json).unwrap();
        match decomposition {
            TaskDecomposition::Simple { needs_human_review, human_review_question, .. } => {
                assert!(needs_human_review);
                assert_eq!(human_review_question.as_deref(), Some("Which database?"));
            }
            _ => panic!("expected simple"),
        }
    }
}
