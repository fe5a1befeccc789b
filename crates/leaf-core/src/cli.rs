//! Shared CLI helpers for workspace tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, PipelineConfig, Result};

/// Installs the fmt subscriber. `RUST_LOG` wins over the verbosity flag.
pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
}

/// Loads the pipeline configuration from `path`, or the defaults when no file
/// is given. Validation is left to the caller so CLI overrides can be applied
/// first.
pub fn load_pipeline_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => {
            debug!("Loading configuration from {}", path.display());
            load_toml_config(path)
        }
        None => Ok(PipelineConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_pipeline_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[training]\nepochs = 5\nlearning_rate = 0.01").unwrap();

        let config = load_pipeline_config(Some(file.path())).unwrap();
        assert_eq!(config.training.epochs, 5);
        assert_eq!(config.training.learning_rate, 0.01);
        assert_eq!(config.dataset.image_size, 224);
    }

    #[test]
    fn test_load_pipeline_config_defaults() {
        let config = load_pipeline_config(None).unwrap();
        assert_eq!(config.training.epochs, 20);
    }

    #[test]
    fn test_missing_config_is_config_error() {
        let err = load_pipeline_config(Some(Path::new("/nonexistent/leafsense.toml")))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_config_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[training\nepochs = ").unwrap();
        let err = load_toml_config::<PipelineConfig>(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
