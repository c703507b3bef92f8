//! Configuration file loading.

use crate::config::{Config, validate_config};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a YAML file.
///
/// This function reads the file, parses the YAML, and validates the configuration.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&contents)?;
    validate_config(&config).map_err(ConfigError::ValidationError)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CheckType;
    use crate::upstream::Module;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_minimal_config() {
        let yaml = r#"
upstreams:
  - name: api
    servers:
      - server: "127.0.0.1:9000"
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.upstreams[0].module, Module::Http);
        assert!(config.healthcheck.check_type.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let yaml = r#"
global:
  log_level: debug
  log_format: pretty
  workers: 4
  tick: 500ms
  zone_size: 65536
healthcheck:
  type: tcp
  fall: 2
  timeout: 2s
  disabled_hosts: ["10.9."]
upstreams:
  - name: api
    module: http
    servers:
      - server: "127.0.0.1:9000"
      - server: "127.0.0.1:9001"
        backup: true
    check:
      type: http
      keepalive: 10
      request:
        method: HEAD
        uri: /status
        headers:
          Host: api.internal
      expected:
        codes: [200, 204]
        body: "ok"
      excluded_hosts: ["127.0.0.1:9001"]
  - name: cache
    module: stream
    servers:
      - server: "127.0.0.1:6379"
    check:
      request:
        body: "PING\r\n"
      expected:
        body: "PONG"
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.global.workers, 4);
        assert_eq!(config.global.tick, Duration::from_millis(500));
        assert_eq!(config.healthcheck.check_type, Some(CheckType::Tcp));

        let api = config.upstreams[0].check_options(&config.healthcheck);
        assert_eq!(api.check_type, Some(CheckType::Http));
        assert_eq!(api.fall, 2);
        assert_eq!(api.keepalive, 10);
        assert_eq!(api.timeout, Duration::from_secs(2));
        assert_eq!(api.global_disabled_hosts, vec!["10.9.".to_string()]);
        assert!(config.upstreams[0].servers[1].backup);

        let cache = config.upstreams[1].check_options(&config.healthcheck);
        assert_eq!(config.upstreams[1].module, Module::Stream);
        assert_eq!(cache.check_type, Some(CheckType::Tcp));
        assert_eq!(cache.request.body, "PING\r\n");
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/config.yaml");
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ConfigError::ReadError(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not: valid: yaml: {{{}}}").unwrap();

        let result = load_config(file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"upstreams:\n  - name: api\n    servers: []\n").unwrap();

        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
