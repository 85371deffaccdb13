//! Configuration file management for oozer.
//!
//! Provides a TOML-based config file at `~/.config/oozer/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use oozer_core::settings::Settings;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Signing secret for access tokens.
    pub jwt_secret: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the oozer config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/oozer` or `~/.config/oozer`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("oozer");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("oozer")
}

/// Return the path to the oozer config file.
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
// Secret generation
// -----------------------------------------------------------------------

/// Generate a random signing secret: 32 random bytes, hex-encoded.
pub fn generate_jwt_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Resolve runtime settings with the chain:
/// CLI flag > env var > config file > default.
///
/// Only the database URL and the token secret live in the config file;
/// everything else comes from the environment via
/// [`Settings::from_env`].
pub fn resolve(cli_db_url: Option<&str>) -> Result<Settings> {
    let mut settings = Settings::from_env();
    let file_config = load_config().ok();

    if let Some(url) = cli_db_url {
        settings.db_url = url.to_owned();
    } else if std::env::var("DB_URL").is_err() {
        if let Some(ref cfg) = file_config {
            settings.db_url = cfg.database.url.clone();
        }
    }

    if std::env::var("JWT_SECRET").is_err() {
        if let Some(ref cfg) = file_config {
            settings.jwt_secret = cfg.auth.jwt_secret.clone();
        }
    }

    settings
        .validate()
        .context("invalid runtime configuration")?;

    Ok(settings)
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_jwt_secret_is_64_hex_chars() {
        let secret = generate_jwt_secret();
        assert_eq!(secret.len(), 64);
        assert!(
            secret.chars().all(|c| c.is_ascii_hexdigit()),
            "expected all hex digits, got: {secret}"
        );
    }

    #[test]
    fn generate_jwt_secret_is_random() {
        let a = generate_jwt_secret();
        let b = generate_jwt_secret();
        assert_ne!(a, b, "two generated secrets should differ");
    }

    #[test]
    fn config_file_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection {
                url: "sqlite://test.db".to_owned(),
            },
            auth: AuthSection {
                jwt_secret: "aa".repeat(32),
            },
        };

        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded: ConfigFile =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.auth.jwt_secret, original.auth.jwt_secret);
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("oozer/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
