//! Subproject detection: maps a repository's directory structure into the
//! logical subprojects a task's subtasks can be scoped to, either from
//! explicit configuration or by matching glob patterns against top-level
//! directories.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

/// A logical subproject within a (possibly monorepo) repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproject {
    /// Path relative to the repository root. `"."` means the whole repo.
    pub path: String,
    pub name: String,
    pub language: Option<String>,
    pub test_command: Option<String>,
    pub build_command: Option<String>,
}

/// Auto-detection settings: `subprojects.autoDetect.*` in config.
#[derive(Debug, Clone)]
pub struct AutoDetectConfig {
    pub enabled: bool,
    /// Globs where a single `*` matches exactly one path segment, e.g.
    /// `packages/*`, `apps/*`.
    pub patterns: Vec<String>,
}

impl Default for AutoDetectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: vec!["packages/*".to_string(), "apps/*".to_string()],
        }
    }
}

/// Detect the subprojects of a repository checked out at `repo_root`.
///
/// `explicit` (`subprojects.explicit[]`) always wins when non-empty, with
/// any missing `language` filled in via file-marker detection. Otherwise,
/// when `auto_detect.enabled`, each configured glob is matched against
/// immediate subdirectories of `repo_root`.
pub fn detect_subprojects(
    repo_root: &Path,
    explicit: &[Subproject],
    auto_detect: &AutoDetectConfig,
) -> Vec<Subproject> {
    if !explicit.is_empty() {
        return explicit
            .iter()
            .cloned()
            .map(|mut sp| {
                if sp.language.is_none() {
                    sp.language = detect_language(&repo_root.join(&sp.path));
                }
                sp
            })
            .collect();
    }

    if !auto_detect.enabled {
        return Vec::new();
    }

    let mut found = Vec::new();
    for pattern in &auto_detect.patterns {
        found.extend(match_one_segment_glob(repo_root, pattern));
    }
    found
}

/// Match a glob with exactly one `*` wildcard (matching one path segment)
/// against the immediate children of the directory it resolves to.
fn match_one_segment_glob(repo_root: &Path, pattern: &str) -> Vec<Subproject> {
    let Some((prefix, suffix)) = pattern.split_once('*') else {
        // No wildcard: treat the pattern itself as a single fixed path.
        let dir = repo_root.join(pattern);
        return if dir.is_dir() {
            vec![subproject_at(repo_root, pattern)]
        } else {
            Vec::new()
        };
    };

    let prefix = prefix.trim_end_matches('/');
    let search_dir = if prefix.is_empty() {
        repo_root.to_path_buf()
    } else {
        repo_root.join(prefix)
    };

    let Ok(entries) = std::fs::read_dir(&search_dir) else {
        return Vec::new();
    };

    let mut matches = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !suffix.is_empty() {
            continue;
        }
        let rel_path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        matches.push(subproject_at(repo_root, &rel_path));
    }
    matches.sort_by(|a, b| a.path.cmp(&b.path));
    matches
}

fn subproject_at(repo_root: &Path, rel_path: &str) -> Subproject {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path).to_string();
    Subproject {
        path: rel_path.to_string(),
        name,
        language: detect_language(&repo_root.join(rel_path)),
        test_command: None,
        build_command: None,
    }
}

/// Detect a project's primary language by looking for marker files in `dir`.
///
/// Returns `None` if no recognized project type is found.
pub fn detect_language(dir: &Path) -> Option<String> {
    if dir.join("Cargo.toml").exists() {
        Some("rust".to_string())
    } else if dir.join("package.json").exists() {
        Some("node".to_string())
    } else if dir.join("pyproject.toml").exists() || dir.join("setup.py").exists() {
        Some("python".to_string())
    } else if dir.join("go.mod").exists() {
        Some("go".to_string())
    } else {
        None
    }
}

/// Detect the base branch for the git repository at `dir`.
///
/// Tries `git symbolic-ref refs/remotes/origin/HEAD` first, falls back to
/// the current branch, and ultimately defaults to `"main"`.
pub fn detect_base_branch(dir: &Path) -> String {
    if let Ok(output) = Command::new("git")
        .args(["symbolic-ref", "refs/remotes/origin/HEAD"])
        .current_dir(dir)
        .output()
    {
        if output.status.success() {
            let refname = String::from_utf8_lossy(&output.stdout);
            let refname = refname.trim();
            if let Some(branch) = refname.strip_prefix("refs/remotes/origin/") {
                if !branch.is_empty() {
                    return branch.to_string();
                }
            }
        }
    }

    if let Ok(output) = Command::new("git")
        .args(["branch", "--show-current"])
        .current_dir(dir)
        .output()
    {
        if output.status.success() {
            let branch = String::from_utf8_lossy(&output.stdout);
            let branch = branch.trim();
            if !branch.is_empty() {
                return branch.to_string();
            }
        }
    }

    "main".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn detect_rust_project() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        assert_eq!(detect_language(dir.path()), Some("rust".to_string()));
    }

    #[test]
    fn detect_node_project() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "").unwrap();
        assert_eq!(detect_language(dir.path()), Some("node".to_string()));
    }

    #[test]
    fn detect_python_pyproject() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "").unwrap();
        assert_eq!(detect_language(dir.path()), Some("python".to_string()));
    }

    #[test]
    fn detect_go_project() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("go.mod"), "").unwrap();
        assert_eq!(detect_language(dir.path()), Some("go".to_string()));
    }

    #[test]
    fn detect_unknown_project() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_language(dir.path()), None);
    }

    #[test]
    fn detect_base_branch_fallback() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_base_branch(dir.path()), "main");
    }

    #[test]
    fn explicit_subprojects_win_over_autodetect() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("packages/a")).unwrap();

        let explicit = vec![Subproject {
            path: "services/api".to_string(),
            name: "api".to_string(),
            language: Some("rust".to_string()),
            test_command: Some("cargo test".to_string()),
            build_command: None,
        }];

        let found = detect_subprojects(dir.path(), &explicit, &AutoDetectConfig::default());
        assert_eq!(found, explicit);
    }

    #[test]
    fn autodetect_matches_one_path_segment() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("packages/web")).unwrap();
        std::fs::create_dir_all(dir.path().join("packages/api")).unwrap();
        std::fs::write(dir.path().join("packages/web/package.json"), "").unwrap();

        let found = detect_subprojects(dir.path(), &[], &AutoDetectConfig::default());
        assert_eq!(found.len(), 2);
        let web = found.iter().find(|s| s.name == "web").unwrap();
        assert_eq!(web.path, "packages/web");
        assert_eq!(web.language, Some("node".to_string()));
    }

    #[test]
    fn autodetect_disabled_returns_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("packages/web")).unwrap();

        let config = AutoDetectConfig {
            enabled: false,
            patterns: vec!["packages/*".to_string()],
        };
        let found = detect_subprojects(dir.path(), &[], &config);
        assert!(found.is_empty());
    }

    #[test]
    fn autodetect_no_matching_directories() {
        let dir = TempDir::new().unwrap();
        let found = detect_subprojects(dir.path(), &[], &AutoDetectConfig::default());
        assert!(found.is_empty());
    }
}
