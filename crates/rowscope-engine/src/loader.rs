//! Layered configuration loading: TOML file, then environment overrides.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};

use crate::config::{ConfigError, EngineConfig};

/// File read when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "rowscope.toml";

/// Prefix of environment overrides, e.g. `ROWSCOPE__WARMING__CONCURRENCY=4`.
pub const ENV_PREFIX: &str = "ROWSCOPE";

/// Load, merge and validate the engine configuration.
///
/// A missing file is not an error: defaults and environment overrides still
/// apply.
///
/// # Errors
///
/// Returns `ConfigError::Load` if a source cannot be parsed, or the
/// validation error from [`EngineConfig::validate`].
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let path = path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), Path::to_path_buf);
    load_layers(Some(path), Environment::with_prefix(ENV_PREFIX))
}

fn load_layers(path: Option<PathBuf>, env: Environment) -> Result<EngineConfig, ConfigError> {
    let mut builder = Config::builder();
    if let Some(path) = path
        && path.exists()
    {
        tracing::debug!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(File::from(path));
    }
    builder = builder.add_source(env.try_parsing(true).separator("__"));

    let merged: EngineConfig = builder.build()?.try_deserialize()?;
    merged.validate()?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    fn no_env() -> Environment {
        Environment::with_prefix(ENV_PREFIX).source(Some(HashMap::new()))
    }

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<HashMap<_, _>>();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_layers(Some(dir.path().join("absent.toml")), no_env()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_file_values_are_applied() {
        let file = write_file(
            r#"
            [store]
            key_root = "analytics"

            [warming]
            lease_ttl = "2m"
            "#,
        );
        let config = load_layers(Some(file.path().to_path_buf()), no_env()).unwrap();
        assert_eq!(config.store.key_root, "analytics");
        assert_eq!(config.warming.lease_ttl, Duration::from_secs(120));
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_file("[warming]\nconcurrency = 2\n");
        let config = load_layers(
            Some(file.path().to_path_buf()),
            env(&[("ROWSCOPE__WARMING__CONCURRENCY", "6")]),
        )
        .unwrap();
        assert_eq!(config.warming.concurrency, 6);
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let file = write_file("[warming]\nconcurrency = 0\n");
        let err = load_layers(Some(file.path().to_path_buf()), no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_malformed_file_is_a_load_error() {
        let file = write_file("[warming\nconcurrency = ");
        let err = load_layers(Some(file.path().to_path_buf()), no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
