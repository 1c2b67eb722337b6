//! Stack file loading.
//!
//! This module handles loading the stack file from YAML, `.env` loading, and
//! `CONVERGE_*` environment variable overrides.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackConfig;

/// Stack file parser.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a stack file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading stack from: {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::ParseError {
                    message: format!("Failed to read file: {e}"),
                    location: Some(path.display().to_string()),
                }
            }
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a stack from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML stack");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = e.location().map_or_else(
                || source.map(|p| p.display().to_string()),
                |loc| {
                    Some(format!(
                        "{}:{}:{}",
                        source.map_or_else(|| String::from("<input>"), |p| p.display().to_string()),
                        loc.line(),
                        loc.column()
                    ))
                },
            );
            ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            }
        })?;

        debug!(
            "Parsed stack {} with {} resources",
            config.stack.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads a stack file and applies environment overrides.
    ///
    /// Environment variables have the form `CONVERGE_<SECTION>_<KEY>`
    /// (e.g., `CONVERGE_STACK_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides found through `lookup` to the stack.
    fn apply_env_overrides(
        config: &mut StackConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(name) = lookup("CONVERGE_STACK_NAME") {
            debug!("Overriding stack.name from environment");
            config.stack.name = name;
        }

        if let Some(env) = lookup("CONVERGE_STACK_ENVIRONMENT") {
            debug!("Overriding stack.environment from environment");
            config.stack.environment = env;
        }

        if let Some(path) = lookup("CONVERGE_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Some(raw) = lookup("CONVERGE_CONCURRENCY") {
            debug!("Overriding engine.concurrency from environment");
            config.engine.concurrency = raw.parse().map_err(|_| ConfigError::MissingEnvVar {
                name: String::from("CONVERGE_CONCURRENCY"),
            })?;
        }

        Ok(())
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
                ConvergeError::Config(ConfigError::ParseError {
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

/// Default stack file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "converge.stack.yaml",
    "converge.stack.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the stack file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no stack file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found stack file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckpointMode, StateBackend};
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_stack() {
        let yaml = r"
stack:
  name: test-stack
";
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("minimal stack parses");

        assert_eq!(config.stack.name, "test-stack");
        assert_eq!(config.stack.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_stack() {
        let yaml = r#"
stack:
  name: msk-demo
  environment: prod

state:
  backend: memory

engine:
  concurrency: 2
  run_timeout_secs: 600
  checkpoint: end

providers:
  local:
    root: ./out

resources:
  - name: vpc
    type: local:random_id
    inputs:
      byte_length: 8
  - name: subnet
    type: local:file
    inputs:
      path: subnet.txt
      content: "vpc=${vpc.id}"
    depends_on: [vpc]

outputs:
  vpc_id: "${vpc.id}"
"#;
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("full stack parses");

        assert_eq!(config.stack.environment, "prod");
        assert_eq!(config.state.backend, StateBackend::Memory);
        assert_eq!(config.engine.concurrency, 2);
        assert_eq!(config.engine.run_timeout_secs, Some(600));
        assert_eq!(config.engine.checkpoint, CheckpointMode::End);
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[0].inputs.get("byte_length"), Some(&json!(8)));
        assert_eq!(config.resources[1].depends_on, vec![String::from("vpc")]);
        assert_eq!(config.outputs.get("vpc_id").map(String::as_str), Some("${vpc.id}"));
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = ConfigParser::new()
            .parse_yaml("stack: [unclosed", None)
            .expect_err("invalid yaml");
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::ParseError {
                location: Some(_),
                ..
            })
        ));
    }

    fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_env_overrides_replace_stack_values() {
        let mut config = ConfigParser::new()
            .parse_yaml("stack:\n  name: from-file\n", None)
            .expect("stack parses");
        let env = overrides(&[
            ("CONVERGE_STACK_NAME", "from-env"),
            ("CONVERGE_STACK_ENVIRONMENT", "staging"),
            ("CONVERGE_STATE_PATH", "/tmp/converge-state"),
            ("CONVERGE_CONCURRENCY", "8"),
        ]);

        ConfigParser::apply_env_overrides(&mut config, |key| env.get(key).cloned())
            .expect("overrides apply");

        assert_eq!(config.stack.name, "from-env");
        assert_eq!(config.stack.environment, "staging");
        assert_eq!(config.state.path.as_deref(), Some("/tmp/converge-state"));
        assert_eq!(config.engine.concurrency, 8);
    }

    #[test]
    fn test_env_overrides_absent_keep_file_values() {
        let mut config = ConfigParser::new()
            .parse_yaml("stack:\n  name: from-file\nengine:\n  concurrency: 3\n", None)
            .expect("stack parses");

        ConfigParser::apply_env_overrides(&mut config, |_| None).expect("no overrides");

        assert_eq!(config.stack.name, "from-file");
        assert_eq!(config.stack.environment, "dev");
        assert!(config.state.path.is_none());
        assert_eq!(config.engine.concurrency, 3);
    }

    #[test]
    fn test_invalid_concurrency_override_is_rejected() {
        let mut config = ConfigParser::new()
            .parse_yaml("stack:\n  name: from-file\n", None)
            .expect("stack parses");
        let env = overrides(&[("CONVERGE_CONCURRENCY", "lots")]);

        let err = ConfigParser::apply_env_overrides(&mut config, |key| env.get(key).cloned())
            .expect_err("not a number");

        match err {
            ConvergeError::Config(ConfigError::MissingEnvVar { name }) => {
                assert_eq!(name, "CONVERGE_CONCURRENCY");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_find_config_walks_upward() {
        let dir = TempDir::new().expect("tempdir");
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join("converge.stack.yaml"), "stack: {name: x}\n")
            .expect("write");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, dir.path().join("converge.stack.yaml"));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().expect("tempdir");
        let err = ConfigParser::new()
            .load_file(dir.path().join("missing.yaml"))
            .expect_err("missing file");
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
