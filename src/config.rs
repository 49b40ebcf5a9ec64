//! Live feature/settings configuration and the experiment config file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::features::{FeatureFlag, FeatureSet, Variant};
use crate::settings::{SettingKey, SettingsTable};

/// The single owned configuration object for a session.
///
/// The orchestrator is its only writer; every resolution reads it.
#[derive(Debug, Clone, Default)]
pub struct FeatureConfiguration {
    live: FeatureSet,
    settings: SettingsTable,
    alternate: Option<FeatureSet>,
}

impl FeatureConfiguration {
    pub fn new(live: FeatureSet, settings: SettingsTable) -> Self {
        Self {
            live,
            settings,
            alternate: None,
        }
    }

    /// Primary reads the live set. Alternate reads the set installed for the
    /// current comparison trial, or the live set when no trial is running.
    pub fn resolve_flag(&self, flag: FeatureFlag, variant: Variant) -> bool {
        self.features(variant).is_enabled(flag)
    }

    pub fn resolve_setting(&self, key: SettingKey, variant: Variant) -> Value {
        self.settings.resolve(key, variant)
    }

    pub fn is_enabled(&self, flag: FeatureFlag) -> bool {
        self.live.is_enabled(flag)
    }

    pub fn features(&self, variant: Variant) -> &FeatureSet {
        match (variant, &self.alternate) {
            (Variant::Alternate, Some(alt)) => alt,
            _ => &self.live,
        }
    }

    pub fn live(&self) -> &FeatureSet {
        &self.live
    }

    pub fn settings(&self) -> &SettingsTable {
        &self.settings
    }

    pub fn set_flag(&mut self, flag: FeatureFlag, enabled: bool) {
        self.live.set(flag, enabled);
    }

    /// Replace the live set wholesale (block activation).
    pub fn replace_features(&mut self, features: FeatureSet) {
        self.live = features;
    }

    pub fn merge_settings(&mut self, overrides: &BTreeMap<String, Value>) {
        self.settings.merge(overrides);
    }

    pub fn install_alternate(&mut self, alternate: FeatureSet) {
        self.alternate = Some(alternate);
    }

    pub fn clear_alternate(&mut self) {
        self.alternate = None;
    }

    // Typed shorthands for primary-side session control.

    pub fn int(&self, key: SettingKey) -> i64 {
        self.settings.resolve_i64(key, Variant::Primary)
    }

    pub fn seconds(&self, key: SettingKey) -> f64 {
        self.settings.resolve_f64(key, Variant::Primary)
    }

    pub fn toggle(&self, key: SettingKey) -> bool {
        self.settings.resolve_bool(key, Variant::Primary)
    }

    pub fn text(&self, key: SettingKey) -> String {
        self.settings.resolve_string(key, Variant::Primary)
    }
}

/// Errors loading an experiment config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// On-disk experiment configuration chosen by the researcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Completion model id; the environment or built-in default applies when absent.
    #[serde(default)]
    pub model: Option<String>,
    /// Flags enabled at session start.
    #[serde(default)]
    pub features: FeatureSet,
    /// Setting overrides merged onto the documented defaults.
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    /// Directory that relative script/blueprint names resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl ExperimentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ExperimentConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    /// Build the session's live configuration from this file.
    pub fn to_configuration(&self) -> FeatureConfiguration {
        let mut settings = SettingsTable::default();
        settings.merge(&self.settings);
        FeatureConfiguration::new(self.features, settings)
    }

    /// Resolve a file named in settings relative to the config file.
    pub fn resolve_path(&self, name: &str) -> PathBuf {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.base_dir.join(candidate)
        }
    }
}
