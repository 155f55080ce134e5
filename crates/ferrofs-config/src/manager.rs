use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{Config, ConfigError};

fn read_config<T: Config>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let doc: toml::Value = text.parse()?;
    let config = T::from_toml(&doc)?;
    config.validate()?;
    Ok(config)
}

/// Holds the live configuration for a service.
///
/// Readers take lock-free snapshots; writers validate and swap in a
/// replacement atomically. A manager built from a file remembers its
/// source so [`ConfigManager::reload`] can fold the file's
/// hot-updatable fields back in at runtime.
pub struct ConfigManager<T: Config> {
    live: ArcSwap<T>,
    source: Option<PathBuf>,
}

impl<T: Config> ConfigManager<T> {
    pub fn new(config: T) -> Self {
        Self {
            live: ArcSwap::from_pointee(config),
            source: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        Ok(Self {
            live: ArcSwap::from_pointee(read_config(path)?),
            source: Some(path.to_path_buf()),
        })
    }

    /// The file this manager reloads from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Replace the whole configuration.
    pub fn update(&self, next: T) -> Result<(), ConfigError> {
        next.validate()?;
        self.live.store(Arc::new(next));
        Ok(())
    }
}

impl<T: Config + Default> ConfigManager<T> {
    /// Like [`ConfigManager::load`], but a missing file yields the
    /// default configuration. The path is still remembered, so a file
    /// created later is picked up by [`ConfigManager::reload`]. A file
    /// that exists but fails to parse or validate is an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Ok(Self {
            live: ArcSwap::from_pointee(T::default()),
            source: Some(path.to_path_buf()),
        })
    }
}

impl<T: Config + Clone> ConfigManager<T> {
    pub fn snapshot(&self) -> T {
        (*self.live.load_full()).clone()
    }

    /// Fold the hot-updatable fields of `overlay` into the live
    /// configuration; everything else keeps its current value.
    pub fn apply_hot(&self, overlay: &T) -> Result<(), ConfigError> {
        let mut next = self.snapshot();
        next.hot_update(overlay);
        self.update(next)
    }

    /// Re-read the source file and apply its hot-updatable fields.
    /// A manager built without a file is left unchanged.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let Some(ref path) = self.source else {
            return Ok(());
        };
        self.apply_hot(&read_config(path)?)?;
        tracing::info!(path = %path.display(), "config reloaded");
        Ok(())
    }
}
