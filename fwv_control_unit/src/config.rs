//! TOML configuration loader with validation.
//!
//! Loads a [`ControlConfig`] from a TOML file or string and runs the
//! cross-field validation rules before the tuning reaches any controller.

use std::path::Path;

use thiserror::Error;

use fwv_common::config::ControlConfig;

/// Configuration loading/validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("config I/O error: {0}")]
    Io(String),
    /// TOML parse error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Cross-field validation error.
    #[error("config validation: {0}")]
    Validation(String),
}

/// Load and validate the control configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ControlConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("failed to read {}: {e}", path.display())))?;
    config_from_toml(&text)
}

/// Parse and validate the control configuration from a TOML string.
///
/// Absent sections and fields keep their tuned defaults, so a config file
/// only needs to name what it overrides.
pub fn config_from_toml(text: &str) -> Result<ControlConfig, ConfigError> {
    let config: ControlConfig =
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate().map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = config_from_toml("").unwrap();
        assert_eq!(cfg, ControlConfig::default());
    }

    #[test]
    fn overrides_apply() {
        let cfg = config_from_toml(
            r#"
            [protection.supply]
            under_stop = 750
            "#,
        )
        .unwrap();
        assert_eq!(cfg.protection.supply.under_stop, 750);
        assert_eq!(cfg.protection.supply.over_stop, 1700);
    }

    #[test]
    fn invalid_config_rejected() {
        let err = config_from_toml(
            r#"
            [protection.supply]
            under_stop = 950
            under_return = 900
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn malformed_toml_rejected() {
        assert!(matches!(
            config_from_toml("not = [valid"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valve.toml");
        std::fs::write(&path, "[motor]\nmax_duty = 2048\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.motor.max_duty, 2048);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/valve.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
