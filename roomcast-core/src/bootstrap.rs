//! Configuration loading

use std::path::Path;

use tracing::info;

use crate::{Config, Error, Result};

/// Load configuration from a config file or environment variables
///
/// Config file search order:
/// 1. `explicit_path` (the `--config` command line flag)
/// 2. `ROOMCAST_CONFIG_PATH` environment variable
/// 3. `./config.yaml` (current working directory)
/// 4. `/config/config.yaml` (container mount path)
/// 5. Fall back to environment variables only
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    let config_path = explicit_path
        .map(str::to_string)
        .or_else(|| {
            std::env::var("ROOMCAST_CONFIG_PATH")
                .ok()
                .filter(|p| Path::new(p).exists())
        })
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = match config_path {
        Some(path) => {
            // Logging is not initialised yet; report on stderr.
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => {
            eprintln!("No config file found, using defaults and environment variables");
            Config::from_env()?
        }
    };

    config.validate().map_err(Error::Validation)?;

    info!("Configuration loaded and validated successfully");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_path_wins() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(file, "server:\n  port: 5005\n").unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 5005);
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(file, "sfu:\n  rtc_min_port: 9000\n  rtc_max_port: 8000\n").unwrap();

        let err = load_config(file.path().to_str()).unwrap_err();
        assert!(matches!(err, Error::Validation(ref errors) if errors.len() == 1));
    }
}
