//! `docqueue.toml` configuration.
//!
//! A missing file means defaults. `DOCQUEUE_STORE`, `DOCQUEUE_ACTION_COMMAND`
//! and `DOCQUEUE_MAX_WORKERS` override the file.

use super::types::ExecutionMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "docqueue.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub executor: ExecutorConfig,
    pub advisor: AdvisorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Queue file; `.yaml`/`.yml` selects YAML, anything else JSON
    pub path: PathBuf,

    /// How long to wait for another process's lock
    pub lock_timeout_ms: u64,

    /// Write `events.jsonl` next to the queue file
    pub event_log: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".docqueue/queue.json"),
            lock_timeout_ms: 5000,
            event_log: true,
        }
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Action command; receives the action name as its last argument
    pub command: String,

    pub default_mode: ExecutionMode,

    /// Upper bound on concurrent dispatches in parallel mode
    pub max_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: "docqueue-action".to_string(),
            default_mode: ExecutionMode::Sequential,
            max_workers: 4,
        }
    }
}

/// Which wire format the reasoning service speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisorEngine {
    #[default]
    Anthropic,
    Openai,
}

impl std::str::FromStr for AdvisorEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::Openai),
            other => Err(format!(
                "unknown engine '{}' (expected anthropic or openai)",
                other
            )),
        }
    }
}

impl std::fmt::Display for AdvisorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::Openai => write!(f, "openai"),
        }
    }
}

/// Reasoning-service settings. Unset URL, model and key variable fall back
/// to the engine's stock values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    pub engine: AdvisorEngine,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Name of the environment variable holding the API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            engine: AdvisorEngine::Anthropic,
            api_url: None,
            model: None,
            api_key_env: None,
            timeout_secs: 60,
            max_tokens: 4096,
        }
    }
}

impl AdvisorConfig {
    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or(match self.engine {
            AdvisorEngine::Anthropic => "https://api.anthropic.com/v1/messages",
            AdvisorEngine::Openai => "https://api.openai.com/v1/chat/completions",
        })
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(match self.engine {
            AdvisorEngine::Anthropic => "claude-3-5-haiku-latest",
            AdvisorEngine::Openai => "gpt-4o-mini",
        })
    }

    pub fn api_key_env(&self) -> &str {
        self.api_key_env.as_deref().unwrap_or(match self.engine {
            AdvisorEngine::Anthropic => "ANTHROPIC_API_KEY",
            AdvisorEngine::Openai => "OPENAI_API_KEY",
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Switch engine. Endpoint overrides belong to the old engine and are dropped.
    pub fn with_engine(&self, engine: AdvisorEngine) -> Self {
        if engine == self.engine {
            return self.clone();
        }
        Self {
            engine,
            api_url: None,
            model: None,
            api_key_env: None,
            ..self.clone()
        }
    }
}

/// Parse a config from TOML text.
pub fn parse_config(toml_str: &str) -> Result<Config, String> {
    toml::from_str(toml_str).map_err(|e| format!("config parse error: {}", e))
}

/// Load a config file, falling back to defaults if it does not exist, then
/// apply environment overrides.
pub fn load_config(path: &Path) -> Result<Config, String> {
    let mut cfg = if path.exists() {
        let s = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        parse_config(&s).map_err(|e| format!("{}: {}", path.display(), e))?
    } else {
        Config::default()
    };

    // relative store paths in the file are relative to the file's directory
    if cfg.store.path.is_relative() {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            cfg.store.path = dir.join(&cfg.store.path);
        }
    }
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;
    Ok(cfg)
}

/// Apply `DOCQUEUE_*` overrides from `lookup`.
pub fn apply_env_overrides(
    cfg: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), String> {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("DOCQUEUE_STORE") {
        cfg.store.path = PathBuf::from(v);
    }
    if let Some(v) = get("DOCQUEUE_ACTION_COMMAND") {
        cfg.executor.command = v;
    }
    if let Some(v) = get("DOCQUEUE_MAX_WORKERS") {
        cfg.executor.max_workers = v
            .trim()
            .parse()
            .map_err(|_| format!("DOCQUEUE_MAX_WORKERS must be a positive integer, got '{}'", v))?;
    }
    if cfg.executor.max_workers == 0 {
        return Err("executor.max_workers must be at least 1".to_string());
    }
    Ok(())
}

/// Default config file written by `docqueue init`.
pub fn template() -> String {
    let cfg = Config::default();
    format!(
        r#"# docqueue configuration

[store]
path = "{store}"
lock_timeout_ms = {lock}
event_log = true

[executor]
# receives the action name as last argument, params as JSON on stdin
command = "{command}"
default_mode = "sequential"
max_workers = {workers}

[advisor]
engine = "anthropic"
api_url = "{url}"
model = "{model}"
api_key_env = "{key}"
timeout_secs = {timeout}
"#,
        store = cfg.store.path.display(),
        lock = cfg.store.lock_timeout_ms,
        command = cfg.executor.command,
        workers = cfg.executor.max_workers,
        url = cfg.advisor.api_url(),
        model = cfg.advisor.model(),
        key = cfg.advisor.api_key_env(),
        timeout = cfg.advisor.timeout_secs,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.store.path, PathBuf::from(".docqueue/queue.json"));
        assert_eq!(cfg.executor.max_workers, 4);
        assert_eq!(cfg.advisor.engine, AdvisorEngine::Anthropic);
    }

    #[test]
    fn test_config_partial_sections() {
        let cfg = parse_config(
            r#"
[executor]
default_mode = "parallel"
max_workers = 8

[advisor]
engine = "openai"
"#,
        )
        .unwrap();
        assert_eq!(cfg.executor.default_mode, ExecutionMode::Parallel);
        assert_eq!(cfg.executor.max_workers, 8);
        assert_eq!(cfg.executor.command, "docqueue-action");
        assert_eq!(cfg.advisor.engine, AdvisorEngine::Openai);
        assert_eq!(cfg.advisor.api_url(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(cfg.advisor.api_key_env(), "OPENAI_API_KEY");
    }

    #[test]
    fn test_config_template_parses() {
        let cfg = parse_config(&template()).unwrap();
        assert_eq!(cfg.store, StoreConfig::default());
        assert_eq!(cfg.executor, ExecutorConfig::default());
        assert_eq!(cfg.advisor.api_url(), AdvisorConfig::default().api_url());
    }

    #[test]
    fn test_config_bad_toml() {
        assert!(parse_config("[store\npath=1").unwrap_err().contains("config parse error"));
    }

    #[test]
    fn test_config_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DOCQUEUE_STORE", "/tmp/q.yaml"),
            ("DOCQUEUE_ACTION_COMMAND", "osascript actions.js"),
            ("DOCQUEUE_MAX_WORKERS", "2"),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.store.path, PathBuf::from("/tmp/q.yaml"));
        assert_eq!(cfg.executor.command, "osascript actions.js");
        assert_eq!(cfg.executor.max_workers, 2);

        let mut cfg = Config::default();
        let err = apply_env_overrides(&mut cfg, |k| {
            (k == "DOCQUEUE_MAX_WORKERS").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(err.contains("at least 1"));
    }

    #[test]
    fn test_config_load_relative_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docqueue.toml");
        std::fs::write(&path, "[store]\npath = \"q/queue.json\"\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert!(cfg.store.path.ends_with("q/queue.json"));
        assert!(cfg.store.path.starts_with(dir.path()));
    }

    #[test]
    fn test_config_engine_switch() {
        let base = AdvisorConfig {
            timeout_secs: 5,
            model: Some("claude-custom".into()),
            ..AdvisorConfig::default()
        };
        assert_eq!(base.model(), "claude-custom");
        let openai = base.with_engine("openai".parse().unwrap());
        assert_eq!(openai.api_key_env(), "OPENAI_API_KEY");
        assert_eq!(openai.model(), "gpt-4o-mini");
        assert_eq!(openai.timeout_secs, 5);
        assert!("bard".parse::<AdvisorEngine>().is_err());
    }
}
