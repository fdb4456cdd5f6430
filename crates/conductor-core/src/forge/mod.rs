//! Source-forge client: the object-safe trait through which the
//! Decomposer, Reviewer, and Task Processor reach the hosted git forge
//! (repository contents, pull requests, issues, and the project board)
//! without hardcoding a single provider, mirroring the `Harness` trait's
//! object-safety pattern.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod github;

pub use github::GitHubForgeClient;

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("forge request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("forge returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("resource not found: {0}")]
    NotFound(String),
}

pub type ForgeResult<T> = Result<T, ForgeError>;

#[derive(Debug, Clone)]
pub struct RepoFile {
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardItem {
    pub item_id: String,
    pub status: String,
    pub title: String,
    pub body: String,
    pub linked_issue_number: Option<i64>,
    pub repository_full_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCreate {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PullRequestCreate {
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
}

#[derive(Debug, Clone)]
pub struct CreatedPullRequest {
    pub number: i64,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct PullRequestFeedback {
    pub review_bodies: Vec<String>,
    pub issue_comments: Vec<String>,
}

/// Authenticated access to one installation's repositories, issues, pull
/// requests, and project board. Implementors wrap a specific forge (GitHub,
/// GitLab, ...); the only shipped implementation targets GitHub.
#[async_trait]
pub trait SourceForgeClient: Send + Sync {
    /// The repository's default branch name (e.g. `main`).
    async fn default_branch(&self, repo_full_name: &str) -> ForgeResult<String>;

    /// Best-effort recursive file listing of the repository's default
    /// branch, skipping hidden directories.
    async fn list_repo_files(&self, repo_full_name: &str) -> ForgeResult<Vec<RepoFile>>;

    /// Fetch a single file's raw contents from the default branch, if it
    /// exists.
    async fn get_file_contents(
        &self,
        repo_full_name: &str,
        path: &str,
    ) -> ForgeResult<Option<String>>;

    /// Unified diff between two refs, or `None` if the forge could not
    /// produce one (callers fall back to reading full file contents).
    async fn compare_commits(
        &self,
        repo_full_name: &str,
        base: &str,
        head: &str,
    ) -> ForgeResult<Option<String>>;

    /// Clone URL with a short-lived installation-scoped credential embedded,
    /// suitable for a single `git clone`/`git fetch`.
    async fn scoped_clone_url(
        &self,
        repo_full_name: &str,
        installation_id: i64,
    ) -> ForgeResult<String>;

    async fn create_issue(
        &self,
        repo_full_name: &str,
        issue: IssueCreate,
    ) -> ForgeResult<i64>;

    async fn comment_on_issue(
        &self,
        repo_full_name: &str,
        issue_number: i64,
        body: &str,
    ) -> ForgeResult<()>;

    /// Most recent comment on an issue that was not authored by a bot
    /// account, if any.
    async fn latest_human_comment(
        &self,
        repo_full_name: &str,
        issue_number: i64,
    ) -> ForgeResult<Option<String>>;

    async fn create_pull_request(
        &self,
        repo_full_name: &str,
        pr: PullRequestCreate,
    ) -> ForgeResult<CreatedPullRequest>;

    /// Review bodies and non-bot issue comments on a pull request, combined
    /// up to 10 entries, used as human-review feedback on a "Redo" move.
    async fn pull_request_feedback(
        &self,
        repo_full_name: &str,
        pr_number: i64,
    ) -> ForgeResult<PullRequestFeedback>;

    /// Move a project board item to `status` (a board column name).
    async fn move_board_item(
        &self,
        project_id: &str,
        item_id: &str,
        status: &str,
    ) -> ForgeResult<()>;

    /// Add an existing issue to the project board, returning the new item
    /// id.
    async fn add_issue_to_board(
        &self,
        project_id: &str,
        repo_full_name: &str,
        issue_number: i64,
    ) -> ForgeResult<String>;

    /// Fetch a board item's current field values by item id.
    async fn get_board_item(&self, project_id: &str, item_id: &str) -> ForgeResult<BoardItem>;
}

/// Known context files the Decomposer attaches to its analysis prompt when
/// present in the repository.
pub const CONTEXT_FILE_CANDIDATES: &[&str] = &[
    "README.md",
    "CLAUDE.md",
    "REQUIREMENTS.md",
    "package.json",
    "pnpm-workspace.yaml",
    "turbo.json",
];

/// Fetch every context file that exists in the repository, skipping misses.
pub async fn fetch_context_files(
    client: &dyn SourceForgeClient,
    repo_full_name: &str,
) -> HashMap<String, String> {
    let mut files = HashMap::new();
    for candidate in CONTEXT_FILE_CANDIDATES {
        if let Ok(Some(content)) = client.get_file_contents(repo_full_name, candidate).await {
            files.insert((*candidate).to_string(), content);
        }
    }
    files
}
