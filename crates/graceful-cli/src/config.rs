//! `graceful.toml`: server, shutdown and fib sections

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub shutdown: ShutdownConfig,
    pub fib: FibConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
    /// Artificial handler latency, to observe draining
    pub delay_ms: u64,
    pub read_timeout_secs: u64,
    #[serde(deserialize_with = "tls_path")]
    pub cert: Option<String>,
    #[serde(deserialize_with = "tls_path")]
    pub key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            delay_ms: 10_000,
            read_timeout_secs: 30,
            cert: None,
            key: None,
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Bound on the shutdown call, counted from the signal (0 = none)
    pub timeout_secs: u64,
    /// Second SIGINT/SIGTERM exits immediately
    pub force_exit_on_repeat: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            force_exit_on_repeat: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FibConfig {
    /// Pause per addition, so the calculation is slow enough to interrupt
    pub step_ms: u64,
}

impl Default for FibConfig {
    fn default() -> Self {
        Self { step_ms: 100 }
    }
}

/// Certificate/key path with `${VAR}` references expanded. An unset variable
/// is an error rather than a silently missing file.
fn tls_path<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| expand_vars(&raw, |name| std::env::var(name).ok()))
        .transpose()
        .map_err(<D::Error as serde::de::Error>::custom)
}

/// Replace every `${NAME}` in `raw` using `lookup`.
fn expand_vars(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated variable reference in {raw:?}"))?;
        let name = &after[..end];
        let value = lookup(name).ok_or_else(|| format!("environment variable {name} is not set"))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Config files tried by [`Config::load`], first match wins.
fn search_path() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("graceful.toml")];
    if let Some(dirs) = directories::ProjectDirs::from("", "", "graceful") {
        paths.push(dirs.config_dir().join("config.toml"));
    }
    paths
}

impl Config {
    /// First of `./graceful.toml` and `~/.config/graceful/config.toml`, or defaults.
    pub fn load() -> Result<Self> {
        Self::load_first(&search_path())
    }

    fn load_first(candidates: &[PathBuf]) -> Result<Self> {
        match candidates.iter().find(|p| p.exists()) {
            Some(path) => Self::from_file(path),
            None => {
                log::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Shutdown deadline; zero leaves the shutdown call unbounded
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.timeout_secs)
    }
}
