//! Repository-root `.conductor.yml` schema.
//!
//! Parsed with `serde_yaml` rather than the teacher's `toml` crate because
//! the external format this project reads is YAML; `toml` stays a
//! workspace dependency only for the CLI's own local config file.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_auto_detect_patterns() -> Vec<String> {
    vec!["packages/*".to_string(), "apps/*".to_string()]
}

fn default_max_parallel() -> u32 {
    5
}

fn default_timeout_minutes() -> u32 {
    30
}

fn default_start_column() -> String {
    "Todo".to_string()
}

fn default_branch_pattern() -> String {
    "conductor/{task_id}/{short_description}".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub version: String,
    #[serde(default)]
    pub project: ProjectMeta,
    #[serde(default)]
    pub subprojects: SubprojectsConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprojectsConfig {
    #[serde(default)]
    pub auto_detect: AutoDetectSection,
    #[serde(default)]
    pub explicit: Vec<ExplicitSubproject>,
}

impl Default for SubprojectsConfig {
    fn default() -> Self {
        Self {
            auto_detect: AutoDetectSection::default(),
            explicit: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoDetectSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_auto_detect_patterns")]
    pub patterns: Vec<String>,
}

impl Default for AutoDetectSection {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: default_auto_detect_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplicitSubproject {
    pub path: String,
    pub name: String,
    pub language: Option<String>,
    pub test_command: Option<String>,
    pub build_command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub master: AgentProfile,
    #[serde(default)]
    pub sub_agent: SubAgentProfile,
    #[serde(default)]
    pub code_review: AgentProfile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfile {
    pub model: Option<String>,
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentProfile {
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u32,
}

impl Default for SubAgentProfile {
    fn default() -> Self {
        Self {
            model: None,
            max_turns: None,
            max_parallel: default_max_parallel(),
            timeout_minutes: default_timeout_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub triggers: TriggersConfig,
    #[serde(default = "default_branch_pattern")]
    pub branch_pattern: String,
    #[serde(default)]
    pub auto_merge: bool,
    #[serde(default)]
    pub require_smoke_test: bool,
    pub smoke_test_webhook: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            triggers: TriggersConfig::default(),
            branch_pattern: default_branch_pattern(),
            auto_merge: false,
            require_smoke_test: false,
            smoke_test_webhook: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggersConfig {
    #[serde(default = "default_start_column")]
    pub start_column: String,
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            start_column: default_start_column(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub telegram: Option<ChannelConfig>,
    pub slack: Option<ChannelConfig>,
    pub webhook: Option<ChannelConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    pub max_files_per_pr: Option<u32>,
    pub max_lines_per_pr: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse .conductor.yml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported config version {0:?}, expected a \\d+.\\d+ string")]
    InvalidVersion(String),
}

impl ProjectConfig {
    /// Parse a `.conductor.yml` document, validating the `version` key's
    /// shape (the schema otherwise tolerates unknown/missing keys via
    /// per-field defaults).
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: ProjectConfig = serde_yaml::from_str(yaml)?;
        let mut parts = config.version.splitn(2, '.');
        let valid = matches!(
            (parts.next(), parts.next()),
            (Some(major), Some(minor))
                if !major.is_empty()
                    && !minor.is_empty()
                    && major.chars().all(|c| c.is_ascii_digit())
                    && minor.chars().all(|c| c.is_ascii_digit())
        );
        if !valid {
            return Err(ConfigError::InvalidVersion(config.version));
        }
        Ok(config)
    }

    pub fn max_parallel(&self) -> usize {
        self.agents.sub_agent.max_parallel.clamp(1, 10) as usize
    }

    pub fn subtask_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            u64::from(self.agents.sub_agent.timeout_minutes.clamp(1, 120)) * 60,
        )
    }
}

/// Render `workflow.branch_pattern` for a task, substituting `{task_id}`
/// with the first 8 characters of `task_id` and `{short_description}` with
/// `title` lowercased, non-alphanumeric runs collapsed to single hyphens,
/// trimmed of leading/trailing hyphens, and capped at 50 characters.
pub fn render_branch_name(pattern: &str, task_id: uuid::Uuid, title: &str) -> String {
    let short_id: String = task_id.to_string().chars().take(8).collect();
    let short_description = slugify(title, 50);
    pattern
        .replace("{task_id}", &short_id)
        .replace("{short_description}", &short_description)
}

fn slugify(title: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_dash = false;
    for ch in title.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = slug.trim_matches('-');
    let truncated: String = trimmed.chars().take(max_len).collect();
    truncated.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = ProjectConfig::parse("version: \"1.0\"\n").unwrap();
        assert_eq!(config.version, "1.0");
        assert!(config.subprojects.auto_detect.enabled);
        assert_eq!(config.subprojects.auto_detect.patterns, vec!["packages/*", "apps/*"]);
        assert_eq!(config.agents.sub_agent.max_parallel, 5);
        assert_eq!(config.agents.sub_agent.timeout_minutes, 30);
        assert_eq!(config.workflow.triggers.start_column, "Todo");
        assert_eq!(config.workflow.branch_pattern, "conductor/{task_id}/{short_description}");
        assert!(!config.workflow.auto_merge);
    }

    #[test]
    fn rejects_malformed_version() {
        let err = ProjectConfig::parse("version: \"v1\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVersion(_)));
    }

    #[test]
    fn parses_full_document() {
        let yaml = r#"
version: "1.0"
project:
  name: demo
subprojects:
  autoDetect:
    enabled: false
  explicit:
    - path: services/api
      name: api
      language: rust
agents:
  master:
    model: claude-opus-4
  subAgent:
    maxParallel: 8
    timeoutMinutes: 45
workflow:
  triggers:
    startColumn: Backlog
  branchPattern: "conductor/{task_id}"
  requireSmokeTest: true
  smokeTestWebhook: https://example.com/smoke
security:
  blockedPatterns:
    - "**/.env"
  maxFilesPerPr: 20
"#;
        let config = ProjectConfig::parse(yaml).unwrap();
        assert_eq!(config.project.name.as_deref(), Some("demo"));
        assert!(!config.subprojects.auto_detect.enabled);
        assert_eq!(config.subprojects.explicit.len(), 1);
        assert_eq!(config.agents.master.model.as_deref(), Some("claude-opus-4"));
        assert_eq!(config.max_parallel(), 8);
        assert_eq!(config.workflow.triggers.start_column, "Backlog");
        assert!(config.workflow.require_smoke_test);
        assert_eq!(config.security.blocked_patterns, vec!["**/.env"]);
    }

    #[test]
    fn branch_name_uses_first_eight_chars_and_slugifies_title() {
        let id = uuid::Uuid::parse_str("abcdef12-3456-7890-abcd-ef1234567890").unwrap();
        let name = render_branch_name(
            "conductor/{task_id}/{short_description}",
            id,
            "Add Hello() to src/index.ts!!",
        );
        assert_eq!(name, "conductor/abcdef12/add-hello-to-src-index-ts");
    }

    #[test]
    fn branch_name_is_pure_and_idempotent() {
        let id = uuid::Uuid::parse_str("abcdef12-3456-7890-abcd-ef1234567890").unwrap();
        let a = render_branch_name("conductor/{task_id}/{short_description}", id, "Same title");
        let b = render_branch_name("conductor/{task_id}/{short_description}", id, "Same title");
        assert_eq!(a, b);
    }

    #[test]
    fn slugify_caps_at_fifty_chars() {
        let long = "a".repeat(80);
        assert_eq!(slugify(&long, 50).len(), 50);
    }
}
