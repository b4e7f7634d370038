//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the toolkit: the
//! project-level config consumed by the server, uploader and capture
//! pipeline, and the per-user global config holding auth state.

use crate::VizzlyError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure for the toolkit
///
/// Every section is optional in the on-disk JSON; missing keys fall back to
/// the documented defaults.
///
/// # Examples
///
/// ```rust
/// use vizzly::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Create custom configuration
/// let config = Config {
///     signature_properties: vec!["viewport".to_string(), "browser".to_string()],
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Local comparison server settings
    pub server: ServerConfig,

    /// Build identity reported to the remote API
    pub build: BuildConfig,

    /// Uploader settings
    pub upload: UploadConfig,

    /// Comparison kernel settings
    pub comparison: ComparisonConfig,

    /// TDD-mode behavior
    pub tdd: TddConfig,

    /// Ordered list of property keys folded into the screenshot signature
    ///
    /// Keys are applied in the order listed here; map iteration order never
    /// influences the signature.
    #[serde(rename = "signatureProperties")]
    pub signature_properties: Vec<String>,

    /// Paths or names of optional capture producers
    pub plugins: Vec<String>,

    /// Plugin-specific sections (e.g. `staticSite`, `storybook`), preserved
    /// as opaque maps and interpreted by the producer that owns them.
    #[serde(flatten)]
    pub plugin_config: HashMap<String, serde_json::Value>,
}

/// Local comparison server settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen port (default: 47392)
    pub port: u16,

    /// Per-request timeout in milliseconds (default: 30000)
    pub timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 47392,
            timeout: 30_000,
        }
    }
}

/// Build identity reported to the remote API
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Display name; `{timestamp}` is substituted at submit time
    pub name: String,

    /// Free-form environment label (default: "test")
    pub environment: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            name: "Build {timestamp}".to_string(),
            environment: "test".to_string(),
        }
    }
}

impl BuildConfig {
    /// Resolves the display name, substituting `{timestamp}`.
    pub fn resolved_name(&self) -> String {
        if self.name.contains("{timestamp}") {
            let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
            self.name.replace("{timestamp}", &stamp)
        } else {
            self.name.clone()
        }
    }
}

/// Uploader settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Directory or list of directories scanned for screenshots
    /// (default: "./screenshots")
    #[serde(rename = "screenshotsDir")]
    pub screenshots_dir: ScreenshotsDir,

    /// Per-batch upload concurrency (default: 10)
    #[serde(rename = "batchSize")]
    pub batch_size: usize,

    /// Per-request upload timeout in milliseconds (default: 30000)
    pub timeout: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            screenshots_dir: ScreenshotsDir::default(),
            batch_size: 10,
            timeout: 30_000,
        }
    }
}

/// One directory or several; both JSON shapes are accepted.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ScreenshotsDir {
    Single(String),
    Multiple(Vec<String>),
}

impl Default for ScreenshotsDir {
    fn default() -> Self {
        ScreenshotsDir::Single("./screenshots".to_string())
    }
}

impl ScreenshotsDir {
    pub fn as_paths(&self) -> Vec<PathBuf> {
        match self {
            ScreenshotsDir::Single(dir) => vec![PathBuf::from(dir)],
            ScreenshotsDir::Multiple(dirs) => dirs.iter().map(PathBuf::from).collect(),
        }
    }
}

/// Comparison kernel settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// Perceptual distance threshold; pixels with ΔE at or below this value
    /// count as matching (default: 2.0)
    pub threshold: f64,

    /// Minimum cluster pixel count; smaller clusters are discarded
    /// (default: 2)
    #[serde(rename = "minClusterSize")]
    pub min_cluster_size: usize,

    /// Suppress pixels flagged as antialiasing artifacts (default: true)
    #[serde(rename = "ignoreAntialiasing")]
    pub ignore_antialiasing: bool,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            threshold: 2.0,
            min_cluster_size: 2,
            ignore_antialiasing: true,
        }
    }
}

/// TDD-mode behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TddConfig {
    /// Open the dashboard when the server starts (default: false)
    #[serde(rename = "openReport")]
    pub open_report: bool,
}

impl Default for TddConfig {
    fn default() -> Self {
        Self { open_report: false }
    }
}

impl Config {
    /// Loads config from a JSON file, falling back to defaults when the file
    /// is absent.
    pub fn load(path: &Path) -> Result<Self, VizzlyError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| VizzlyError::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), VizzlyError> {
        if self.comparison.threshold < 0.0 {
            return Err(VizzlyError::Configuration(
                "comparison.threshold must be >= 0".to_string(),
            ));
        }
        if self.upload.batch_size == 0 {
            return Err(VizzlyError::Configuration(
                "upload.batchSize must be greater than 0".to_string(),
            ));
        }
        if self.server.timeout == 0 {
            return Err(VizzlyError::Configuration(
                "server.timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies a JSON patch to one named section, validating the value
    /// against the section's schema before merging. A rejected patch leaves
    /// the config untouched.
    pub fn apply_scope(
        &mut self,
        scope: &str,
        value: serde_json::Value,
    ) -> Result<(), VizzlyError> {
        let mut updated = self.clone();
        match scope {
            "server" => updated.server = parse_scope(scope, value)?,
            "build" => updated.build = parse_scope(scope, value)?,
            "upload" => updated.upload = parse_scope(scope, value)?,
            "comparison" => updated.comparison = parse_scope(scope, value)?,
            "tdd" => updated.tdd = parse_scope(scope, value)?,
            "signatureProperties" => updated.signature_properties = parse_scope(scope, value)?,
            "plugins" => updated.plugins = parse_scope(scope, value)?,
            other => {
                // Plugin sections pass through untyped.
                updated.plugin_config.insert(other.to_string(), value);
            }
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn parse_scope<T: serde::de::DeserializeOwned>(
    scope: &str,
    value: serde_json::Value,
) -> Result<T, VizzlyError> {
    serde_json::from_value(value)
        .map_err(|e| VizzlyError::Configuration(format!("invalid {} config: {}", scope, e)))
}

/// Per-user global config at `<home>/.vizzly/config.json`
///
/// Holds the auth token set and the per-project slugs. This process never
/// refreshes tokens itself; it only reads what the auth flow stored.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub auth: Option<AuthConfig>,
    pub projects: HashMap<String, ProjectEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiresAt")]
    pub expires_at: Option<i64>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectEntry {
    #[serde(rename = "projectSlug")]
    pub project_slug: String,
    #[serde(rename = "organizationSlug")]
    pub organization_slug: String,
    pub token: Option<String>,
}

impl GlobalConfig {
    pub fn path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".vizzly").join("config.json"))
    }

    pub fn load() -> Self {
        Self::path()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    /// Token for the project rooted at `workspace`, if one is stored.
    pub fn project_token(&self, workspace: &Path) -> Option<String> {
        let key = workspace.to_string_lossy().to_string();
        self.projects
            .get(&key)
            .and_then(|entry| entry.token.clone())
            .or_else(|| self.auth.as_ref().map(|a| a.access_token.clone()))
    }
}
