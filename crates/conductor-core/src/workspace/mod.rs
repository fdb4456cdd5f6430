//! Workspace Manager: turns a task into a checked-out, branched working
//! copy that the Subtask Processor and Fixer can run an agent against.
//!
//! Unlike a single-repository orchestrator, a task's repository is only
//! known at runtime (it comes from the webhook payload), so each task gets
//! its own full clone under `workspace_root/<task_id>` rather than a
//! worktree sharing one pre-existing repository's object store. All
//! mutating git operations for a given task are serialised through a
//! per-task lock so a retried or concurrently-dispatched subtask never
//! races its own workspace preparation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during workspace preparation.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to prepare workspace directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A prepared working copy ready for an agent to run in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch_name: String,
    pub base_branch: String,
}

/// Prepares and tears down per-task git working copies.
#[derive(Clone)]
pub struct WorkspaceManager {
    workspace_root: PathBuf,
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl WorkspaceManager {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    fn lock_for(&self, task_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(task_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn task_path(&self, task_id: Uuid) -> PathBuf {
        self.workspace_root.join(task_id.to_string())
    }

    /// Prepare a task's working copy.
    ///
    /// If `task_path(task_id)` already holds a valid clone, it is fetched
    /// and the branch is checked out (creating it off `base_branch` if it
    /// doesn't exist locally yet). Otherwise any partial directory is
    /// removed and a fresh clone is made from `clone_url`, which the
    /// caller (the source-forge client) has already embedded a scoped
    /// installation credential into.
    pub fn prepare(
        &self,
        task_id: Uuid,
        clone_url: &str,
        base_branch: &str,
        branch_name: &str,
    ) -> Result<Workspace, WorkspaceError> {
        let task_lock = self.lock_for(task_id);
        let _guard = task_lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = self.task_path(task_id);

        if self.is_valid_repo(&path) {
            self.fetch(&path)?;
            self.checkout_or_create_branch(&path, branch_name, base_branch)?;
        } else {
            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.clone_repo(clone_url, &path)?;
            self.configure_identity(&path)?;
            self.checkout_or_create_branch(&path, branch_name, base_branch)?;
        }

        Ok(Workspace {
            path,
            branch_name: branch_name.to_string(),
            base_branch: base_branch.to_string(),
        })
    }

    fn is_valid_repo(&self, path: &Path) -> bool {
        if !path.join(".git").exists() {
            return false;
        }
        Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn clone_repo(&self, clone_url: &str, path: &Path) -> Result<(), WorkspaceError> {
        let output = Command::new("git")
            .args(["clone", clone_url])
            .arg(path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git clone".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorkspaceError::GitExit {
                command: "clone".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    fn configure_identity(&self, path: &Path) -> Result<(), WorkspaceError> {
        for (key, value) in [("user.email", "conductor@localhost"), ("user.name", "conductor")] {
            Command::new("git")
                .args(["config", key, value])
                .current_dir(path)
                .output()
                .map_err(|e| WorkspaceError::GitCommand {
                    message: format!("failed to run git config {key}"),
                    source: e,
                })?;
        }
        Ok(())
    }

    fn fetch(&self, path: &Path) -> Result<(), WorkspaceError> {
        let output = Command::new("git")
            .args(["fetch", "origin"])
            .current_dir(path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git fetch".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorkspaceError::GitExit {
                command: "fetch".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    fn branch_exists_locally(&self, path: &Path, branch_name: &str) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{branch_name}")])
            .current_dir(path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn checkout_or_create_branch(
        &self,
        path: &Path,
        branch_name: &str,
        base_branch: &str,
    ) -> Result<(), WorkspaceError> {
        let output = if self.branch_exists_locally(path, branch_name) {
            Command::new("git")
                .args(["checkout", branch_name])
                .current_dir(path)
                .output()
        } else {
            Command::new("git")
                .args(["checkout", "-b", branch_name, &format!("origin/{base_branch}")])
                .current_dir(path)
                .output()
        }
        .map_err(|e| WorkspaceError::GitCommand {
            message: "failed to run git checkout".into(),
            source: e,
        })?;

        if !output.status.success() {
            return Err(WorkspaceError::GitExit {
                command: "checkout".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    /// Stage everything, commit if there are changes, and push the branch.
    ///
    /// Returns the new head commit id, or `None` if there was nothing to
    /// commit (the working tree was already clean).
    pub fn commit_and_push(
        &self,
        workspace: &Workspace,
        message: &str,
    ) -> Result<Option<String>, WorkspaceError> {
        let task_lock_key = workspace.path.clone();
        let _ = task_lock_key; // path already uniquely scopes the git directory

        let add = Command::new("git")
            .args(["add", "-A"])
            .current_dir(&workspace.path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git add -A".into(),
                source: e,
            })?;
        if !add.status.success() {
            return Err(WorkspaceError::GitExit {
                command: "add".into(),
                code: add.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&add.stderr).to_string(),
            });
        }

        let status = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&workspace.path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git status".into(),
                source: e,
            })?;
        if String::from_utf8_lossy(&status.stdout).trim().is_empty() {
            return Ok(None);
        }

        let commit = Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(&workspace.path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git commit".into(),
                source: e,
            })?;
        if !commit.status.success() {
            return Err(WorkspaceError::GitExit {
                command: "commit".into(),
                code: commit.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&commit.stderr).to_string(),
            });
        }

        let push = Command::new("git")
            .args(["push", "origin", &workspace.branch_name])
            .current_dir(&workspace.path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git push".into(),
                source: e,
            })?;
        if !push.status.success() {
            return Err(WorkspaceError::GitExit {
                command: "push".into(),
                code: push.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&push.stderr).to_string(),
            });
        }

        let rev = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&workspace.path)
            .output()
            .map_err(|e| WorkspaceError::GitCommand {
                message: "failed to run git rev-parse HEAD".into(),
                source: e,
            })?;
        let head = String::from_utf8_lossy(&rev.stdout).trim().to_string();
        Ok(Some(head))
    }

    /// Best-effort removal of a task's workspace directory.
    pub fn cleanup(&self, task_id: Uuid) {
        let path = self.task_path(task_id);
        if path.exists() {
            let _ = std::fs::remove_dir_all(&path);
        }
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn init_bare_remote(dir: &Path) {
        StdCommand::new("git").args(["init", "--bare"]).arg(dir).output().unwrap();
    }

    fn seed_remote(remote: &Path, scratch: &Path) {
        StdCommand::new("git").args(["clone", remote.to_str().unwrap()]).arg(scratch).output().unwrap();
        std::fs::write(scratch.join("README.md"), "hello\n").unwrap();
        StdCommand::new("git").args(["-C"]).arg(scratch).args(["add", "-A"]).output().unwrap();
        StdCommand::new("git")
            .args(["-C"]).arg(scratch)
            .args(["-c", "user.email=t@t.com", "-c", "user.name=t", "commit", "-m", "init"])
            .output()
            .unwrap();
        StdCommand::new("git")
            .args(["-C"]).arg(scratch)
            .args(["branch", "-M", "main"])
            .output()
            .unwrap();
        StdCommand::new("git")
            .args(["-C"]).arg(scratch)
            .args(["push", "origin", "main"])
            .output()
            .unwrap();
    }

    #[test]
    fn prepare_clones_and_branches_from_scratch() {
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        let scratch = tmp.path().join("scratch");
        init_bare_remote(&remote);
        seed_remote(&remote, &scratch);

        let manager = WorkspaceManager::new(tmp.path().join("workspaces"));
        let task_id = Uuid::new_v4();
        let ws = manager
            .prepare(task_id, remote.to_str().unwrap(), "main", "conductor/abc/do-thing")
            .unwrap();

        assert!(ws.path.join("README.md").exists());
        assert_eq!(ws.branch_name, "conductor/abc/do-thing");
    }

    #[test]
    fn prepare_is_idempotent_on_second_call() {
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        let scratch = tmp.path().join("scratch");
        init_bare_remote(&remote);
        seed_remote(&remote, &scratch);

        let manager = WorkspaceManager::new(tmp.path().join("workspaces"));
        let task_id = Uuid::new_v4();
        manager.prepare(task_id, remote.to_str().unwrap(), "main", "conductor/abc/do-thing").unwrap();
        let ws2 = manager.prepare(task_id, remote.to_str().unwrap(), "main", "conductor/abc/do-thing").unwrap();

        assert!(ws2.path.join("README.md").exists());
    }

    #[test]
    fn commit_and_push_returns_none_when_clean() {
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        let scratch = tmp.path().join("scratch");
        init_bare_remote(&remote);
        seed_remote(&remote, &scratch);

        let manager = WorkspaceManager::new(tmp.path().join("workspaces"));
        let task_id = Uuid::new_v4();
        let ws = manager.prepare(task_id, remote.to_str().unwrap(), "main", "conductor/abc/do-thing").unwrap();

        let result = manager.commit_and_push(&ws, "no-op commit").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn commit_and_push_commits_and_returns_head() {
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        let scratch = tmp.path().join("scratch");
        init_bare_remote(&remote);
        seed_remote(&remote, &scratch);

        let manager = WorkspaceManager::new(tmp.path().join("workspaces"));
        let task_id = Uuid::new_v4();
        let ws = manager.prepare(task_id, remote.to_str().unwrap(), "main", "conductor/abc/do-thing").unwrap();
        manager.configure_identity(&ws.path).unwrap();

        std::fs::write(ws.path.join("new.txt"), "content\n").unwrap();
        let result = manager.commit_and_push(&ws, "add file").unwrap();
        assert!(result.is_some());
        assert_eq!(result.unwrap().len(), 40);
    }

    #[test]
    fn cleanup_removes_directory() {
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        let scratch = tmp.path().join("scratch");
        init_bare_remote(&remote);
        seed_remote(&remote, &scratch);

        let manager = WorkspaceManager::new(tmp.path().join("workspaces"));
        let task_id = Uuid::new_v4();
        let ws = manager.prepare(task_id, remote.to_str().unwrap(), "main", "conductor/abc/do-thing").unwrap();
        assert!(ws.path.exists());

        manager.cleanup(task_id);
        assert!(!ws.path.exists());
    }
}
