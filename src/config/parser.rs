//! Configuration parser for loading environment descriptions.
//!
//! This module handles loading the desired schema from YAML files and
//! environment variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, VpcForgeError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::spec::EnvironmentConfig;

/// Configuration parser for loading environment configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path used to locate the `.env` file.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EnvironmentConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(VpcForgeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            VpcForgeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EnvironmentConfig> {
        debug!("Parsing YAML configuration");

        let config: EnvironmentConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = match (source, e.location()) {
                (Some(p), Some(loc)) => Some(format!("{}:{}:{}", p.display(), loc.line(), loc.column())),
                (Some(p), None) => Some(p.display().to_string()),
                (None, Some(loc)) => Some(format!("line {}, column {}", loc.line(), loc.column())),
                (None, None) => None,
            };
            VpcForgeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(environment = %config.environment, "Parsed configuration");
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Recognised variables: `VPCFORGE_ENVIRONMENT`, `VPCFORGE_REGION` and
    /// `VPCFORGE_MAX_CONCURRENCY`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override has an unparsable value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<EnvironmentConfig> {
        let mut config = self.load_file(path)?;
        apply_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                VpcForgeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Applies overrides read through `lookup`.
///
/// Split from [`ConfigParser::load_with_env`] so tests can supply variables
/// without touching the process environment.
pub(crate) fn apply_overrides(
    config: &mut EnvironmentConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(environment) = lookup("VPCFORGE_ENVIRONMENT") {
        debug!("Overriding environment from VPCFORGE_ENVIRONMENT");
        config.environment = environment;
    }

    if let Some(region) = lookup("VPCFORGE_REGION") {
        debug!("Overriding region from VPCFORGE_REGION");
        config.region = Some(region);
    }

    if let Some(value) = lookup("VPCFORGE_MAX_CONCURRENCY") {
        let parsed: usize = value.trim().parse().map_err(|_| {
            VpcForgeError::Config(ConfigError::validation(
                format!("VPCFORGE_MAX_CONCURRENCY must be a positive integer, got '{value}'"),
                "engine.max_concurrency",
            ))
        })?;
        if parsed == 0 {
            warn!("VPCFORGE_MAX_CONCURRENCY=0 ignored");
        } else {
            debug!(max_concurrency = parsed, "Overriding engine.max_concurrency");
            config.engine.max_concurrency = parsed;
        }
    }

    Ok(())
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["vpcforge.yaml", "vpcforge.yml", ".vpcforge.yaml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(VpcForgeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    const MINIMAL_CONFIG: &str = r"
environment: staging
network:
  cidr: 10.0.0.0/16
route_tables:
  private:
    routes:
      - [0.0.0.0/0, nat]
subnets:
  private-1: { size: 24, route_table: private }
  private-2: { size: 24, route_table: private }
";

    #[test]
    fn test_parse_minimal_config() {
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(MINIMAL_CONFIG, None).unwrap();

        assert_eq!(config.environment, "staging");
        assert_eq!(config.network.cidr, "10.0.0.0/16");
        assert_eq!(config.subnets.len(), 2);
        assert_eq!(config.route_tables["private"].routes.len(), 1);
        assert!(config.network.enable_dns);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(MINIMAL_CONFIG.as_bytes()).unwrap();

        let parser = ConfigParser::new();
        let config = parser.load_file(file.path()).unwrap();

        assert_eq!(config.environment, "staging");
    }

    #[test]
    fn test_file_not_found() {
        let parser = ConfigParser::new();
        let result = parser.load_file("/nonexistent/path/vpcforge.yaml");

        assert!(matches!(
            result,
            Err(VpcForgeError::Config(ConfigError::FileNotFound { .. }))
        ));
    }

    #[test]
    fn test_invalid_route_target_reports_location() {
        let parser = ConfigParser::new();
        let yaml = "environment: x\nroute_tables:\n  a:\n    routes:\n      - [0.0.0.0/0, moon]\n";
        match parser.parse_yaml(yaml, Some(Path::new("vpcforge.yaml"))) {
            Err(VpcForgeError::Config(ConfigError::ParseError { message, location })) => {
                assert!(message.contains("moon"));
                assert!(location.unwrap().starts_with("vpcforge.yaml"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_env_overrides() {
        let parser = ConfigParser::new();
        let mut config = parser.parse_yaml(MINIMAL_CONFIG, None).unwrap();
        let vars: HashMap<&str, &str> = HashMap::from([
            ("VPCFORGE_ENVIRONMENT", "production"),
            ("VPCFORGE_REGION", "eu-west-1"),
            ("VPCFORGE_MAX_CONCURRENCY", "3"),
        ]);

        apply_overrides(&mut config, |name| vars.get(name).map(ToString::to_string)).unwrap();

        assert_eq!(config.environment, "production");
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.engine.max_concurrency, 3);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = EnvironmentConfig::new("staging");
        let result = apply_overrides(&mut config, |name| {
            (name == "VPCFORGE_MAX_CONCURRENCY").then(|| String::from("lots"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("vpcforge.yml"), MINIMAL_CONFIG).unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("vpcforge.yml"));
    }
}
