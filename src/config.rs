//! Configuration for the release engine.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (RELEASE_HOME, RELEASE_REPO, RELEASE_CI_TOKEN)
//! 2. Config file (.release/config.yaml)
//! 3. Defaults (~/.release-engine, current directory as repository)
//!
//! Config file discovery:
//! - Searches current directory and parents for .release/config.yaml
//! - `paths.home` is relative to the .release/ directory
//! - `repository.path` is relative to the directory containing .release/

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::PollPolicy;
use crate::core::{ChecklistSettings, ExecutionOptions, RetryPolicy};
use crate::domain::ReleaseVersion;

pub const ENV_HOME: &str = "RELEASE_HOME";
pub const ENV_REPO: &str = "RELEASE_REPO";
pub const ENV_CI_TOKEN: &str = "RELEASE_CI_TOKEN";

const CONFIG_DIR: &str = ".release";
const CONFIG_FILE: &str = "config.yaml";
const DEFAULT_HOME_DIR: &str = ".release-engine";
const DEFAULT_BRANCH_PATTERN: &str = "release-{major}.{minor}";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub execution: Option<ExecutionConfig>,
    #[serde(default)]
    pub publish: Option<PublishConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .release/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryConfig {
    /// Work tree (relative to the project root)
    pub path: Option<String>,
    pub remote: Option<String>,
    /// Release branch name with `{major}` and `{minor}` placeholders
    pub branch_pattern: Option<String>,
    /// Mainline branch that receives the release commit afterwards
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionConfig {
    pub parallelism: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishConfig {
    pub ci_base_url: Option<String>,
    #[serde(default)]
    pub workflows: Vec<String>,
    #[serde(default)]
    pub poll: Option<PollPolicy>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to engine state (runs, ledger)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub repository: RepositorySettings,
    pub execution: ExecutionOptions,
    pub publish: PublishSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositorySettings {
    pub path: PathBuf,
    pub remote: String,
    pub branch_pattern: String,
    pub default_branch: Option<String>,
}

impl RepositorySettings {
    /// Release branch for a version's line
    pub fn release_branch(&self, version: &ReleaseVersion) -> String {
        self.branch_pattern
            .replace("{major}", &version.major.to_string())
            .replace("{minor}", &version.minor.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishSettings {
    pub ci_base_url: Option<String>,
    /// Bearer token for the CI service; only read from the environment
    pub token: Option<String>,
    pub workflows: Vec<String>,
    pub poll: PollPolicy,
}

impl ResolvedConfig {
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.home.join("ledger.json")
    }

    /// Optional checklist steps implied by this configuration
    pub fn checklist_settings(&self) -> ChecklistSettings {
        let workflows = if self.publish.ci_base_url.is_some() {
            self.publish.workflows.clone()
        } else {
            Vec::new()
        };

        ChecklistSettings {
            workflows,
            backport_branch: self.repository.default_branch.clone(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed config file with environment overrides
fn resolve_config(
    config_file: Option<(PathBuf, ConfigFile)>,
    default_home: PathBuf,
    cwd: PathBuf,
    env: impl Fn(&str) -> Option<String>,
) -> ResolvedConfig {
    let (config_path, file) = match config_file {
        Some((path, file)) => (Some(path), file),
        None => (None, ConfigFile::default()),
    };

    // .release/ and the project root containing it
    let release_dir = config_path
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    let project_root = release_dir
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or(cwd);

    let home = if let Some(env_home) = env(ENV_HOME) {
        PathBuf::from(env_home)
    } else if let (Some(dir), Some(home_path)) = (&release_dir, &file.paths.home) {
        resolve_path(dir, home_path)
    } else {
        default_home
    };

    let repo_path = if let Some(env_repo) = env(ENV_REPO) {
        PathBuf::from(env_repo)
    } else if let Some(ref path) = file.repository.path {
        resolve_path(&project_root, path)
    } else {
        project_root
    };

    let repository = RepositorySettings {
        path: repo_path,
        remote: file
            .repository
            .remote
            .unwrap_or_else(|| "origin".to_string()),
        branch_pattern: file
            .repository
            .branch_pattern
            .unwrap_or_else(|| DEFAULT_BRANCH_PATTERN.to_string()),
        default_branch: file.repository.default_branch,
    };

    let defaults = ExecutionOptions::default();
    let execution_file = file.execution.unwrap_or_default();
    let execution = ExecutionOptions {
        retry: file.retry.unwrap_or_default(),
        parallelism: execution_file.parallelism.unwrap_or(defaults.parallelism),
    };

    let publish_file = file.publish.unwrap_or_default();
    let publish = PublishSettings {
        ci_base_url: publish_file.ci_base_url,
        token: env(ENV_CI_TOKEN).filter(|t| !t.is_empty()),
        workflows: publish_file.workflows,
        poll: publish_file.poll.unwrap_or_default(),
    };

    ResolvedConfig {
        home,
        config_file: config_path,
        repository,
        execution,
        publish,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(DEFAULT_HOME_DIR);
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;

    let config_file = match find_config_file() {
        Some(path) => {
            let parsed = load_config_file(&path)?;
            Some((path, parsed))
        }
        None => None,
    };

    Ok(resolve_config(config_file, default_home, cwd, |key| {
        std::env::var(key).ok()
    }))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (bypasses the cache)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the engine home directory
pub fn release_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($RELEASE_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}

/// Get the version ledger path ($RELEASE_HOME/ledger.json)
pub fn ledger_path() -> Result<PathBuf> {
    Ok(config()?.ledger_path())
}
