//! Configuration module

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Proxy listen port (plain HTTP and CONNECT on the same port)
    pub port: u16,

    /// Seconds between probe cycles
    #[serde(rename = "refresh-interval")]
    pub refresh_interval: u64,

    /// Consecutive absent cycles before a candidate is evicted
    #[serde(rename = "max-failures")]
    pub max_failures: u32,

    /// Directory holding persisted candidate lists
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,

    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Probe options
    pub probe: ProbeConfig,

    /// CDN domains to manage
    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    /// External IP discovery
    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("port must be between 1 and 65535"));
        }
        if self.refresh_interval < 60 {
            return Err(Error::config("refresh-interval must be at least 60 seconds"));
        }
        if self.targets.is_empty() {
            return Err(Error::config("at least one target must be configured"));
        }
        let mut patterns = HashSet::new();
        for target in &self.targets {
            if target.host.is_empty() {
                return Err(Error::config("target host cannot be empty"));
            }
            if !patterns.insert(target.pattern()) {
                return Err(Error::config(format!(
                    "duplicate domain pattern: {}",
                    target.pattern()
                )));
            }
        }
        self.probe.validate()?;
        if self.discovery.enabled {
            self.discovery.validate()?;
        }
        Ok(())
    }

    /// Resolve the configured targets into domain routes
    pub fn domain_targets(&self) -> Vec<DomainTarget> {
        self.targets
            .iter()
            .map(|t| {
                let pattern = t.pattern();
                let list_path = t.ip_list.clone().unwrap_or_else(|| {
                    self.data_dir.join(format!("{}_iplist.txt", pattern))
                });
                DomainTarget {
                    pattern,
                    target_host: t.host.clone(),
                    list_path,
                }
            })
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8146,
            refresh_interval: 300,
            max_failures: 5,
            data_dir: PathBuf::from("data"),
            log_level: Some("info".to_string()),
            probe: ProbeConfig::default(),
            targets: Vec::new(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// One CDN domain to manage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Canonical upstream hostname, e.g. `upos-hz-mirrorakam.akamaized.net`
    pub host: String,

    /// Domain-suffix pattern; defaults to the host's last two labels
    pub pattern: Option<String>,

    /// Persisted candidate list; defaults to `<data-dir>/<pattern>_iplist.txt`
    #[serde(rename = "ip-list")]
    pub ip_list: Option<PathBuf>,
}

impl TargetConfig {
    pub fn pattern(&self) -> String {
        self.pattern
            .clone()
            .unwrap_or_else(|| default_pattern(&self.host))
    }
}

/// A target with pattern and list path resolved
#[derive(Debug, Clone)]
pub struct DomainTarget {
    pub pattern: String,
    pub target_host: String,
    pub list_path: PathBuf,
}

/// Derive the domain-suffix pattern from a hostname.
///
/// `upos-hz-mirrorakam.akamaized.net` -> `akamaized.net`
pub fn default_pattern(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 2 {
        labels[labels.len() - 2..].join(".")
    } else {
        host.to_string()
    }
}

/// Probe options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Attempts per layer per candidate
    pub attempts: u32,

    /// Timeout per attempt
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Port probed on each candidate
    pub port: u16,

    /// Use TLS for the application-layer probe
    #[serde(rename = "use-tls")]
    pub use_tls: bool,
}

impl ProbeConfig {
    fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(Error::config("probe attempts must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(Error::config("probe timeout-ms must be non-zero"));
        }
        Ok(())
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            attempts: 5,
            timeout_ms: 3000,
            port: 443,
            use_tls: true,
        }
    }
}

/// External IP discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Enable the external discovery subprocess
    pub enabled: bool,

    /// Command to execute
    pub command: String,

    /// Arguments placed before the target hosts
    pub args: Vec<String>,

    /// Working directory for the subprocess
    #[serde(rename = "work-dir")]
    pub work_dir: Option<PathBuf>,

    /// Directory containing the per-host output files
    #[serde(rename = "output-dir")]
    pub output_dir: PathBuf,

    /// Seconds between discovery runs
    pub interval: u64,

    /// Maximum subprocess runtime
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Candidate cap handed to replace/merge
    #[serde(rename = "max-ips")]
    pub max_ips: usize,

    /// Replace candidate lists with discovery results instead of merging
    #[serde(rename = "replace-mode")]
    pub replace_mode: bool,

    /// Persist candidate lists after discovery and refresh cycles
    #[serde(rename = "save-to-file")]
    pub save_to_file: bool,

    /// Run discovery once before serving, replacing stale lists
    #[serde(rename = "validate-on-startup")]
    pub validate_on_startup: bool,
}

impl DiscoveryConfig {
    fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::config("discovery command cannot be empty"));
        }
        if self.interval < 300 {
            return Err(Error::config(
                "discovery interval must be at least 300 seconds",
            ));
        }
        if self.timeout_ms < 60_000 {
            return Err(Error::config(
                "discovery timeout-ms must be at least 60000 (1 minute)",
            ));
        }
        if self.max_ips < 10 || self.max_ips > 1000 {
            return Err(Error::config("discovery max-ips must be within 10..=1000"));
        }
        Ok(())
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            enabled: false,
            command: "python3".to_string(),
            args: Vec::new(),
            work_dir: None,
            output_dir: PathBuf::from("."),
            interval: 3600,
            timeout_ms: 300_000,
            max_ips: 200,
            replace_mode: true,
            save_to_file: true,
            validate_on_startup: false,
        }
    }
}
