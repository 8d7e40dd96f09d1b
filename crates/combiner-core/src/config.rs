use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Root application configuration, loaded from `~/.config/crm-combiner/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub crm: CrmConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub requests_per_second: f64,
    pub page_limit: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub cache_dir: String,
    pub report_dir: String,
}

// ─── Defaults ──────────────────────────────────────────────

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            requests_per_second: 10.0,
            page_limit: 100,
            max_retries: 3,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("crm-combiner");

        Self {
            cache_dir: data_dir.join("cache").to_string_lossy().to_string(),
            report_dir: data_dir.join("reports").to_string_lossy().to_string(),
        }
    }
}

// ─── Load ──────────────────────────────────────────────────

impl AppConfig {
    /// Standard config file path: `~/.config/crm-combiner/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("COMBINER_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("crm-combiner")
            .join("config.toml")
    }

    /// Load config from disk, falling back to defaults if file doesn't exist.
    /// Credentials from `COMBINER_CRM_URL` / `COMBINER_API_KEY` override the file.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        if let Ok(url) = std::env::var("COMBINER_CRM_URL") {
            config.crm.url = Some(url);
        }
        if let Ok(key) = std::env::var("COMBINER_API_KEY") {
            config.crm.api_key = Some(key);
        }
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    // ─── Derived paths ─────────────────────────────────────

    pub fn cache_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.cache_dir)
    }

    pub fn report_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.report_dir)
    }
}

// ─── Run profiles ──────────────────────────────────────────

/// A saved set of command arguments, passed with `--config`.
///
/// Everything is optional: values given on the command line win and the
/// profile only fills the gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunProfile {
    pub arguments: ProfileArguments,
    pub options: ProfileOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileArguments {
    pub by: Option<String>,
    pub criteria: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOptions {
    pub fields: Option<String>,
    pub all_sites: Option<bool>,
    pub filter_sites: Option<String>,
    pub no_cache: Option<bool>,
    pub csv: Option<bool>,
    pub combine: Option<bool>,
    pub merge_managers: Option<bool>,
    pub merge_phones: Option<usize>,
    pub merge_subscriptions: Option<bool>,
    pub collect_emails: Option<String>,
    pub merge_fields: Option<String>,
    pub consider_orders: Vec<String>,
    pub phone_exact_length: Option<usize>,
    pub source_priority: Option<String>,
    pub exclude: Option<String>,
    pub crm_url: Option<String>,
    pub api_key: Option<String>,
}

impl RunProfile {
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CoreError::Config(format!(
                "profile not found: {}",
                path.display()
            )));
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.crm.page_limit, 100);
        assert!(cfg.crm.url.is_none());
        assert!(cfg.paths.cache_dir.contains("crm-combiner"));
    }

    #[test]
    fn test_partial_config_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[crm]
url = "https://demo.simla.com"
requests_per_second = 5.0
"#,
        )
        .unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.crm.url.as_deref(), Some("https://demo.simla.com"));
        assert_eq!(loaded.crm.requests_per_second, 5.0);
        assert_eq!(loaded.crm.page_limit, 100);
        assert_eq!(loaded.paths.report_dir, AppConfig::default().paths.report_dir);
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let cfg = AppConfig::load_from(Path::new("/tmp/nonexistent_combiner_config.toml")).unwrap();
        assert_eq!(cfg.crm.max_retries, 3);
    }

    #[test]
    fn test_run_profile_parses_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profile.toml");
        std::fs::write(
            &path,
            r#"
[arguments]
by = "phone"
criteria = ["ordersCount", "createdAt"]

[options]
merge_phones = 10
consider_orders = ["createdAt", "status=complete|new"]
combine = true
"#,
        )
        .unwrap();

        let profile = RunProfile::load_from(&path).unwrap();
        assert_eq!(profile.arguments.by.as_deref(), Some("phone"));
        assert_eq!(profile.arguments.criteria, vec!["ordersCount", "createdAt"]);
        assert_eq!(profile.options.merge_phones, Some(10));
        assert_eq!(profile.options.combine, Some(true));
        assert_eq!(profile.options.consider_orders.len(), 2);
        assert!(profile.options.exclude.is_none());
    }

    #[test]
    fn test_missing_profile_is_an_error() {
        assert!(RunProfile::load_from(Path::new("/tmp/nonexistent_combiner_profile.toml")).is_err());
    }
}
