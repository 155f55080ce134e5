//! Configuration trait and hot-reload manager.
//!
//! A service defines one config struct implementing [`Config`]; the
//! [`ConfigManager`] holds the live copy behind an `ArcSwap` so readers
//! never block and hot updates apply atomically.

mod manager;

pub use manager::ConfigManager;

/// Errors raised while loading, parsing, or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("field '{field}': expected {expected}")]
    TypeMismatch { field: String, expected: String },

    #[error("field '{field}' value {value} out of range [{min:?}, {max:?}]")]
    OutOfRange {
        field: String,
        value: String,
        min: Option<String>,
        max: Option<String>,
    },

    #[error("{0}")]
    Invalid(String),
}

/// A service configuration.
///
/// `hot_update` copies only the hot-updatable fields from `other` into
/// `self`; everything else requires a restart to change.
pub trait Config: Sized + Send + Sync + 'static {
    /// Build a config from a parsed TOML document, starting from defaults.
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError>;

    /// Merge hot-updatable fields of `other` into `self`.
    fn hot_update(&mut self, other: &Self);

    /// Render the config back to TOML text.
    fn render(&self) -> String;

    /// Check invariants; called on every load and update.
    fn validate(&self) -> Result<(), ConfigError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample {
        interval_secs: u64,
        tag: String,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                interval_secs: 5,
                tag: "default".into(),
            }
        }
    }

    impl Config for Sample {
        fn from_toml(value: &toml::Value) -> Result<Self, ConfigError> {
            let mut cfg = Self::default();
            if let Some(v) = value.get("interval_secs") {
                cfg.interval_secs =
                    v.as_integer()
                        .ok_or_else(|| ConfigError::TypeMismatch {
                            field: "interval_secs".into(),
                            expected: "integer".into(),
                        })? as u64;
            }
            if let Some(v) = value.get("tag") {
                cfg.tag = v
                    .as_str()
                    .ok_or_else(|| ConfigError::TypeMismatch {
                        field: "tag".into(),
                        expected: "string".into(),
                    })?
                    .to_string();
            }
            Ok(cfg)
        }

        fn hot_update(&mut self, other: &Self) {
            self.interval_secs = other.interval_secs;
        }

        fn render(&self) -> String {
            format!("interval_secs = {}\ntag = \"{}\"", self.interval_secs, self.tag)
        }

        fn validate(&self) -> Result<(), ConfigError> {
            if self.interval_secs == 0 {
                return Err(ConfigError::OutOfRange {
                    field: "interval_secs".into(),
                    value: "0".into(),
                    min: Some("1".into()),
                    max: None,
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_from_toml_defaults() {
        let value: toml::Value = "".parse().unwrap();
        let cfg = Sample::from_toml(&value).unwrap();
        assert_eq!(cfg, Sample::default());
    }

    #[test]
    fn test_from_toml_type_mismatch() {
        let value: toml::Value = "interval_secs = \"ten\"".parse().unwrap();
        let err = Sample::from_toml(&value).unwrap_err();
        assert!(matches!(err, ConfigError::TypeMismatch { .. }));
    }

    #[test]
    fn test_manager_apply_hot() {
        let mgr = ConfigManager::new(Sample::default());
        assert_eq!(mgr.snapshot().interval_secs, 5);

        let mut overlay = mgr.snapshot();
        overlay.interval_secs = 9;
        overlay.tag = "ignored-by-hot-update".into();
        mgr.apply_hot(&overlay).unwrap();

        let snap = mgr.snapshot();
        assert_eq!(snap.interval_secs, 9);
        assert_eq!(snap.tag, "default");
    }

    #[test]
    fn test_manager_rejects_invalid_update() {
        let mgr = ConfigManager::new(Sample::default());
        let mut bad = mgr.snapshot();
        bad.interval_secs = 0;
        assert!(mgr.update(bad).is_err());
        // Original config untouched.
        assert_eq!(mgr.snapshot().interval_secs, 5);

        // An invalid hot overlay is rejected the same way.
        let mut bad = mgr.snapshot();
        bad.interval_secs = 0;
        assert!(mgr.apply_hot(&bad).is_err());
        assert_eq!(mgr.snapshot().interval_secs, 5);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let mgr =
            ConfigManager::<Sample>::load_or_default("/nonexistent/dir/sample.toml").unwrap();
        assert_eq!(mgr.snapshot(), Sample::default());
        // The path is remembered for a later reload.
        assert!(mgr.source().is_some());
        // Reloading while the file is still absent fails with an io
        // error rather than silently resetting.
        assert!(mgr.reload().is_err());
    }
}
