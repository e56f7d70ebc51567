//! Application configuration for Fieldsmith.
//!
//! User config lives at `~/.fieldsmith/fieldsmith.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FieldsmithError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "fieldsmith.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".fieldsmith";

// ---------------------------------------------------------------------------
// Config structs (matching fieldsmith.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Inference provider settings.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Token budget ceilings.
    #[serde(default)]
    pub budgets: BudgetsConfig,

    /// Context digest carrying.
    #[serde(default)]
    pub context: ContextConfig,

    /// Batch polling and retry behavior.
    #[serde(default)]
    pub polling: PollingConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory for per-run artifacts (payloads, outputs, reports).
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> String {
    "~/fieldsmith-runs".into()
}

/// `[provider]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the batch inference API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model ID to request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Completion window requested for batch jobs.
    #[serde(default = "default_completion_window")]
    pub completion_window: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            completion_window: default_completion_window(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_model() -> String {
    "gpt-5-mini".into()
}
fn default_completion_window() -> String {
    "24h".into()
}

/// `[budgets]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetsConfig {
    /// Maximum estimated tokens in a single request (one fragment).
    #[serde(default = "default_per_request_ceiling")]
    pub per_request_ceiling: u64,

    /// Maximum estimated tokens in a single batch submission (one chunk).
    #[serde(default = "default_per_batch_ceiling")]
    pub per_batch_ceiling: u64,

    /// Maximum estimated tokens submitted within the rolling window.
    #[serde(default = "default_window_ceiling")]
    pub window_ceiling: u64,

    /// Rolling window length in hours.
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
}

impl Default for BudgetsConfig {
    fn default() -> Self {
        Self {
            per_request_ceiling: default_per_request_ceiling(),
            per_batch_ceiling: default_per_batch_ceiling(),
            window_ceiling: default_window_ceiling(),
            window_hours: default_window_hours(),
        }
    }
}

fn default_per_request_ceiling() -> u64 {
    60_000
}
fn default_per_batch_ceiling() -> u64 {
    200_000
}
fn default_window_ceiling() -> u64 {
    2_000_000
}
fn default_window_hours() -> u64 {
    24
}

/// Retention policy for context digests across chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    /// Each digest supersedes the previous one.
    Replace,
    /// Keep the last K digests.
    LastK,
    /// Running union of all digests.
    Union,
}

/// `[context]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Digest retention across chunks.
    #[serde(default = "default_retention")]
    pub policy: RetentionPolicy,

    /// K for the `last-k` policy.
    #[serde(default = "default_last_k")]
    pub last_k: usize,

    /// Digest token budget as a fraction of the per-request ceiling.
    #[serde(default = "default_digest_ratio")]
    pub digest_ratio: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            policy: default_retention(),
            last_k: default_last_k(),
            digest_ratio: default_digest_ratio(),
        }
    }
}

fn default_retention() -> RetentionPolicy {
    RetentionPolicy::Replace
}
fn default_last_k() -> usize {
    3
}
fn default_digest_ratio() -> f64 {
    0.05
}

/// `[polling]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Initial poll interval in milliseconds.
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Maximum poll interval in milliseconds (backoff ceiling).
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Attempt limit for transient submission/poll failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Maximum age of a job before it is treated as expired, in seconds.
    #[serde(default = "default_max_job_age_secs")]
    pub max_job_age_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            max_attempts: default_max_attempts(),
            max_job_age_secs: default_max_job_age_secs(),
        }
    }
}

fn default_initial_interval_ms() -> u64 {
    5_000
}
fn default_max_interval_ms() -> u64 {
    120_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_max_job_age_secs() -> u64 {
    26 * 60 * 60
}

impl PollingConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn max_job_age(&self) -> Duration {
        Duration::from_secs(self.max_job_age_secs)
    }
}

// ---------------------------------------------------------------------------
// Budget config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime budget configuration — merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Per-request (per-fragment) token ceiling.
    pub per_request_ceiling: u64,
    /// Per-batch (per-chunk) token ceiling.
    pub per_batch_ceiling: u64,
    /// Rolling-window token ceiling.
    pub window_ceiling: u64,
    /// Rolling window length.
    pub window: Duration,
    /// Token budget for a context digest.
    pub digest_budget: u64,
}

impl From<&AppConfig> for BudgetConfig {
    fn from(config: &AppConfig) -> Self {
        let digest_budget =
            (config.budgets.per_request_ceiling as f64 * config.context.digest_ratio) as u64;
        Self {
            per_request_ceiling: config.budgets.per_request_ceiling,
            per_batch_ceiling: config.budgets.per_batch_ceiling,
            window_ceiling: config.budgets.window_ceiling,
            window: Duration::from_secs(config.budgets.window_hours * 60 * 60),
            digest_budget: digest_budget.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.fieldsmith/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| FieldsmithError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.fieldsmith/fieldsmith.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| FieldsmithError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        FieldsmithError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| FieldsmithError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| FieldsmithError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| FieldsmithError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the provider API key env var is set and non-empty, returning
/// the key.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.provider.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(FieldsmithError::config(format!(
            "provider API key not found. Set the {var_name} environment variable."
        ))),
    }
}
