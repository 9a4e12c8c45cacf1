//! Configuration management for rignet

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::net::uri::{LISTEN_PORT, Scheme, UriOptions, check_uri};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Socket and protocol settings
    pub network: NetworkConfig,

    /// Rigs to fan out to
    pub services: ServicesConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// 1. Explicit path if provided
    /// 2. Project-local: .rignet.yml
    /// 3. User config: ~/.config/rignet/rignet.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".rignet.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("rignet").join("rignet.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Check rig URIs and names
    pub fn validate(&self) -> Result<()> {
        if self.network.channel_buffer == 0 {
            return Err(eyre!("network.channel-buffer must be positive"));
        }
        if self.network.echo_timeout_ms == 0 {
            return Err(eyre!("network.echo-timeout-ms must be positive"));
        }

        let mut seen = HashSet::new();
        for rig in &self.services.rigs {
            if !seen.insert(rig.name.as_str()) {
                return Err(eyre!("Duplicate rig name \"{}\"", rig.name));
            }
            // Resolution happens on connect
            check_uri(&rig.uri, &self.network.uri_options())
                .context(format!("Invalid URI for rig \"{}\"", rig.name))?;
        }
        Ok(())
    }
}

/// Socket and protocol settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port used when a URI has none
    #[serde(rename = "listen-port")]
    pub listen_port: u16,

    /// Scheme used when a URI has none
    #[serde(rename = "default-scheme")]
    pub default_scheme: Scheme,

    /// How long a confirmed send waits for its echo
    #[serde(rename = "echo-timeout-ms")]
    pub echo_timeout_ms: u64,

    /// Capacity of each communicator's request and link channels
    #[serde(rename = "channel-buffer")]
    pub channel_buffer: usize,

    /// Largest frame accepted on a stream transport (1MB default)
    #[serde(rename = "max-frame-size")]
    pub max_frame_size: usize,

    /// Resolve hostnames to IPs when validating URIs
    #[serde(rename = "resolve-host")]
    pub resolve_host: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: LISTEN_PORT,
            default_scheme: Scheme::Udp,
            echo_timeout_ms: 1000,
            channel_buffer: 100,
            max_frame_size: 1024 * 1024,
            resolve_host: true,
        }
    }
}

impl NetworkConfig {
    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    /// URI validation options derived from these settings
    pub fn uri_options(&self) -> UriOptions {
        UriOptions {
            resolve_host: self.resolve_host,
            default_port: self.listen_port,
            default_scheme: self.default_scheme,
        }
    }
}

/// Services orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Shared response budget; null or 0 waits forever
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: Option<u64>,

    /// Rigs, in fan-out order
    pub rigs: Vec<RigConfig>,

    /// Token handed to any rig that asks for one
    pub credential: Option<Value>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Some(10_000),
            rigs: Vec::new(),
            credential: None,
        }
    }
}

impl ServicesConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|&ms| ms > 0).map(Duration::from_millis)
    }
}

/// A named rig endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RigConfig {
    pub name: String,
    pub uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.listen_port, 1001);
        assert_eq!(config.network.default_scheme, Scheme::Udp);
        assert_eq!(config.network.echo_timeout(), Duration::from_secs(1));
        assert_eq!(config.services.timeout(), Some(Duration::from_secs(10)));
        assert!(config.services.rigs.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rignet.yml");
        fs::write(
            &path,
            r#"
network:
  listen-port: 9998
  default-scheme: tcp
services:
  timeout-ms: null
  credential:
    token: abc
  rigs:
    - name: behavior
      uri: 127.0.0.1:9999
    - name: video
      uri: udp://127.0.0.2
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.network.listen_port, 9998);
        assert_eq!(config.network.default_scheme, Scheme::Tcp);
        assert_eq!(config.network.echo_timeout_ms, 1000);
        assert_eq!(config.services.timeout(), None);
        assert_eq!(config.services.credential, Some(json!({"token": "abc"})));
        assert_eq!(config.services.rigs.len(), 2);
        assert_eq!(config.services.rigs[0].name, "behavior");

        let opts = config.network.uri_options();
        assert_eq!(opts.default_port, 9998);
        assert_eq!(opts.default_scheme, Scheme::Tcp);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_rigs() {
        let mut config = Config::default();
        config.services.rigs = vec![
            RigConfig {
                name: "rig".to_string(),
                uri: "127.0.0.1:9000".to_string(),
            },
            RigConfig {
                name: "rig".to_string(),
                uri: "127.0.0.1:9001".to_string(),
            },
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate rig name"));
    }

    #[test]
    fn test_validate_rejects_bad_uri() {
        let mut config = Config::default();
        config.services.rigs = vec![RigConfig {
            name: "rig".to_string(),
            uri: "127.0.0.1:70000".to_string(),
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_dns_names() {
        let mut config = Config::default();
        config.services.rigs = vec![
            RigConfig {
                name: "behavior".to_string(),
                uri: "localhost.localdomain:9000".to_string(),
            },
            RigConfig {
                name: "video".to_string(),
                uri: "tcp://Rig-2.Lab.Example.org".to_string(),
            },
        ];
        assert!(config.validate().is_ok());

        config.services.rigs[1].uri = "http://rig-2:9000".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_services_timeout_waits_forever() {
        let services = ServicesConfig {
            timeout_ms: Some(0),
            ..Default::default()
        };
        assert_eq!(services.timeout(), None);

        let services = ServicesConfig {
            timeout_ms: Some(250),
            ..Default::default()
        };
        assert_eq!(services.timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_roundtrip_yaml_uses_kebab_case() {
        let yaml = serde_yaml::to_string(&Config::default()).unwrap();
        assert!(yaml.contains("echo-timeout-ms"));
        assert!(yaml.contains("max-frame-size"));
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network, NetworkConfig::default());
    }
}
