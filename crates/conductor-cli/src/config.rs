//! Configuration file management for the `conductor` CLI.
//!
//! Provides a TOML-based config file at `~/.config/conductor/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use conductor_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub webhook: WebhookSection,
    #[serde(default)]
    pub github_app: GitHubAppSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookSection {
    /// Hex-encoded HMAC secret shared with the forge's webhook delivery.
    pub secret: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GitHubAppSection {
    #[serde(default)]
    pub app_id: String,
    /// Path to the PEM-encoded GitHub App private key.
    #[serde(default)]
    pub private_key_path: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the conductor config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/conductor` or
/// `~/.config/conductor`. We intentionally ignore the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support` on
/// macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("conductor");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("conductor")
}

/// Return the path to the conductor config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Webhook secret generation
// -----------------------------------------------------------------------

/// Generate a random webhook secret: 32 random bytes, hex-encoded (64 chars).
pub fn generate_webhook_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ConductorConfig {
    pub db_config: DbConfig,
    /// Raw (decoded) HMAC secret bytes used to verify webhook signatures.
    pub webhook_secret: Vec<u8>,
    pub github_app_id: String,
    pub github_private_key_pem: String,
}

impl ConductorConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `CONDUCTOR_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Webhook secret: `CONDUCTOR_WEBHOOK_SECRET` env (hex) > `config_file.webhook.secret` (hex) > error
    /// - GitHub App: `CONDUCTOR_GITHUB_APP_ID`/`CONDUCTOR_GITHUB_PRIVATE_KEY_PATH` env > config file > empty (board/PR features degrade to no-ops)
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("CONDUCTOR_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let webhook_secret = if let Ok(secret_hex) = std::env::var("CONDUCTOR_WEBHOOK_SECRET") {
            hex::decode(&secret_hex).context("CONDUCTOR_WEBHOOK_SECRET env var is not valid hex")?
        } else if let Some(ref cfg) = file_config {
            hex::decode(&cfg.webhook.secret).context("invalid hex in config file webhook.secret")?
        } else {
            bail!(
                "webhook secret not found; set CONDUCTOR_WEBHOOK_SECRET or run `conductor init` to create a config file"
            );
        };

        let github_app_id = std::env::var("CONDUCTOR_GITHUB_APP_ID").unwrap_or_else(|_| {
            file_config.as_ref().map(|c| c.github_app.app_id.clone()).unwrap_or_default()
        });
        let private_key_path = std::env::var("CONDUCTOR_GITHUB_PRIVATE_KEY_PATH").unwrap_or_else(|_| {
            file_config.as_ref().map(|c| c.github_app.private_key_path.clone()).unwrap_or_default()
        });
        let github_private_key_pem = if private_key_path.is_empty() {
            String::new()
        } else {
            std::fs::read_to_string(&private_key_path)
                .with_context(|| format!("failed to read GitHub App private key at {private_key_path}"))?
        };

        Ok(Self {
            db_config,
            webhook_secret,
            github_app_id,
            github_private_key_pem,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Serializes tests that mutate process-wide environment variables.
    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn generate_webhook_secret_is_64_hex_chars() {
        let secret = generate_webhook_secret();
        assert_eq!(secret.len(), 64);
        assert!(
            secret.chars().all(|c| c.is_ascii_hexdigit()),
            "expected all hex digits, got: {secret}"
        );
    }

    #[test]
    fn generate_webhook_secret_is_random() {
        let a = generate_webhook_secret();
        let b = generate_webhook_secret();
        assert_ne!(a, b, "two generated secrets should differ");
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("conductor");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            webhook: WebhookSection {
                secret: "aa".repeat(32),
            },
            github_app: GitHubAppSection::default(),
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.webhook.secret, original.webhook.secret);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();

        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();

        unsafe { std::env::set_var("CONDUCTOR_DATABASE_URL", "postgresql://env:5432/envdb") };
        unsafe { std::env::set_var("CONDUCTOR_WEBHOOK_SECRET", "aa".repeat(32)) };

        let config = ConductorConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("CONDUCTOR_DATABASE_URL") };
        unsafe { std::env::remove_var("CONDUCTOR_WEBHOOK_SECRET") };
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();

        unsafe { std::env::set_var("CONDUCTOR_DATABASE_URL", "postgresql://env:5432/envdb") };
        unsafe { std::env::set_var("CONDUCTOR_WEBHOOK_SECRET", "aa".repeat(32)) };

        let config = ConductorConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        unsafe { std::env::remove_var("CONDUCTOR_DATABASE_URL") };
        unsafe { std::env::remove_var("CONDUCTOR_WEBHOOK_SECRET") };
    }

    #[test]
    fn resolve_defaults_db_url_when_nothing_set() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("CONDUCTOR_DATABASE_URL") };
        unsafe { std::env::set_var("CONDUCTOR_WEBHOOK_SECRET", "aa".repeat(32)) };

        let config = ConductorConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);

        unsafe { std::env::remove_var("CONDUCTOR_WEBHOOK_SECRET") };
    }

    #[test]
    fn resolve_errors_when_no_webhook_secret() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("CONDUCTOR_WEBHOOK_SECRET") };
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_home = std::env::var("HOME").ok();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("HOME", tmp.path()) };
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };

        let result = ConductorConfig::resolve(Some("postgresql://localhost:5432/conductor"));

        match orig_home {
            Some(h) => unsafe { std::env::set_var("HOME", h) },
            None => unsafe { std::env::remove_var("HOME") },
        }
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        assert!(result.is_err(), "should error when no webhook secret");
        let msg = result.unwrap_err().to_string();
        assert!(
            msg.contains("webhook secret not found"),
            "unexpected error: {msg}"
        );
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("conductor/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
