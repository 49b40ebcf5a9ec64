//! Multi-block experiment blueprints.
//!
//! A blueprint is an ordered list of blocks. Each block replaces the live
//! feature set and merges its settings, then runs for a number of committed
//! turns before the next block takes over.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::FeatureConfiguration;
use crate::features::{FeatureFlag, FeatureSet};

pub const DEFAULT_BLOCK_DURATION: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum BlueprintError {
    #[error("Blueprint file '{}' not found.", .0.display())]
    NotFound(PathBuf),
    #[error("io error reading blueprint {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid blueprint {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentBlock {
    #[serde(default = "default_block_name")]
    pub name: String,
    #[serde(default = "default_duration")]
    pub duration_messages: u64,
    /// Flag overrides by name; flags not listed are off for the block.
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

fn default_block_name() -> String {
    "Chat".to_string()
}

fn default_duration() -> u64 {
    DEFAULT_BLOCK_DURATION
}

impl ExperimentBlock {
    /// Reset every flag, apply this block's overrides and merge its settings.
    /// Returns feature names that did not match a flag.
    pub fn apply(&self, config: &mut FeatureConfiguration) -> Vec<String> {
        let mut features = FeatureSet::all_disabled();
        let unknown = features.apply_overrides(&self.features);
        config.replace_features(features);
        config.merge_settings(&self.settings);
        unknown
    }
}

/// Ordered, immutable list of blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blueprint(Vec<ExperimentBlock>);

impl Blueprint {
    pub fn new(blocks: Vec<ExperimentBlock>) -> Self {
        Self(blocks)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, BlueprintError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BlueprintError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| BlueprintError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| BlueprintError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn blocks(&self) -> &[ExperimentBlock] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Human-readable problems: unknown flag names and zero durations.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for (i, block) in self.0.iter().enumerate() {
            for name in block.features.keys() {
                if name.parse::<FeatureFlag>().is_err() {
                    issues.push(format!("block {} ({}): unknown feature {name}", i + 1, block.name));
                }
            }
            if block.duration_messages == 0 {
                issues.push(format!(
                    "block {} ({}): duration_messages is 0; it ends after one turn",
                    i + 1,
                    block.name
                ));
            }
        }
        issues
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    NotStarted,
    BlockActive(usize),
    Complete,
}

/// Result of moving to the next block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlueprintStep {
    Activated { index: usize, block: ExperimentBlock },
    Complete,
}

#[derive(Debug, Clone)]
pub struct BlueprintRunner {
    blueprint: Blueprint,
    state: RunnerState,
    turns_in_block: u64,
}

impl BlueprintRunner {
    pub fn new(blueprint: Blueprint) -> Self {
        Self {
            blueprint,
            state: RunnerState::NotStarted,
            turns_in_block: 0,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// True while a block governs the session.
    pub fn is_active(&self) -> bool {
        matches!(self.state, RunnerState::BlockActive(_))
    }

    pub fn current_block(&self) -> Option<&ExperimentBlock> {
        match self.state {
            RunnerState::BlockActive(i) => self.blueprint.0.get(i),
            _ => None,
        }
    }

    /// Activate the first block. A runner already started just reports its state.
    pub fn start(&mut self) -> BlueprintStep {
        match self.state {
            RunnerState::NotStarted => self.advance(),
            RunnerState::BlockActive(index) => BlueprintStep::Activated {
                index,
                block: self.blueprint.0[index].clone(),
            },
            RunnerState::Complete => BlueprintStep::Complete,
        }
    }

    /// Move to the next block, or to `Complete` past the last one.
    pub fn advance(&mut self) -> BlueprintStep {
        let next = match self.state {
            RunnerState::NotStarted => 0,
            RunnerState::BlockActive(i) => i + 1,
            RunnerState::Complete => return BlueprintStep::Complete,
        };
        self.turns_in_block = 0;
        match self.blueprint.0.get(next) {
            Some(block) => {
                self.state = RunnerState::BlockActive(next);
                tracing::info!(block = %block.name, index = next, "activating experiment block");
                BlueprintStep::Activated {
                    index: next,
                    block: block.clone(),
                }
            }
            None => {
                self.state = RunnerState::Complete;
                tracing::info!("experiment blueprint complete");
                BlueprintStep::Complete
            }
        }
    }

    /// Count a committed turn; advances when the block's duration is reached.
    pub fn on_turn_committed(&mut self) -> Option<BlueprintStep> {
        let duration = self.current_block()?.duration_messages;
        self.turns_in_block += 1;
        (self.turns_in_block >= duration).then(|| self.advance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Variant;
    use crate::settings::{SettingKey, SettingsTable};

    fn block(name: &str, duration: u64) -> ExperimentBlock {
        ExperimentBlock {
            name: name.to_string(),
            duration_messages: duration,
            features: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }

    #[test]
    fn durations_two_then_three() {
        let mut runner = BlueprintRunner::new(Blueprint::new(vec![block("a", 2), block("b", 3)]));
        assert_eq!(runner.state(), RunnerState::NotStarted);
        assert!(matches!(runner.start(), BlueprintStep::Activated { index: 0, .. }));

        assert_eq!(runner.on_turn_committed(), None);
        assert!(matches!(
            runner.on_turn_committed(),
            Some(BlueprintStep::Activated { index: 1, .. })
        ));
        assert_eq!(runner.on_turn_committed(), None);
        assert_eq!(runner.on_turn_committed(), None);
        assert_eq!(runner.on_turn_committed(), Some(BlueprintStep::Complete));
        assert_eq!(runner.state(), RunnerState::Complete);
        assert_eq!(runner.on_turn_committed(), None);
    }

    #[test]
    fn activation_clears_unlisted_flags() {
        let mut config = FeatureConfiguration::new(
            FeatureSet::all_disabled()
                .with(FeatureFlag::Lie)
                .with(FeatureFlag::DynamicFeatureChanging),
            SettingsTable::default(),
        );
        let mut b = block("kind", 3);
        b.features.insert("KIND_TONE".into(), true);
        b.features.insert("WARP_DRIVE".into(), true);
        b.settings.insert("block_duration_s".into(), 3.into());

        let unknown = b.apply(&mut config);

        assert_eq!(unknown, vec!["WARP_DRIVE".to_string()]);
        assert!(config.is_enabled(FeatureFlag::KindTone));
        assert!(!config.is_enabled(FeatureFlag::Lie));
        assert!(!config.is_enabled(FeatureFlag::DynamicFeatureChanging));
        assert_eq!(
            config.settings().resolve_i64(SettingKey::BlockDurationS, Variant::Primary),
            3
        );
    }

    #[test]
    fn flag_from_previous_block_is_cleared_on_advance() {
        let mut config =
            FeatureConfiguration::new(FeatureSet::all_disabled(), SettingsTable::default());
        let mut lie = block("lie", 1);
        lie.features.insert("LIE".into(), true);
        let mut kind = block("kind", 1);
        kind.features.insert("KIND_TONE".into(), true);
        let mut runner = BlueprintRunner::new(Blueprint::new(vec![lie, kind]));

        let BlueprintStep::Activated { block, .. } = runner.start() else {
            panic!("first block should activate");
        };
        block.apply(&mut config);
        assert!(config.is_enabled(FeatureFlag::Lie));

        let Some(BlueprintStep::Activated { index: 1, block }) = runner.on_turn_committed() else {
            panic!("second block should activate after one turn");
        };
        block.apply(&mut config);
        assert!(config.is_enabled(FeatureFlag::KindTone));
        assert!(!config.is_enabled(FeatureFlag::Lie));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let bp: Blueprint = serde_json::from_str(r#"[{"features": {"LIE": true}}]"#).unwrap();
        assert_eq!(bp.blocks()[0].name, "Chat");
        assert_eq!(bp.blocks()[0].duration_messages, DEFAULT_BLOCK_DURATION);
        assert!(bp.validate().is_empty());
    }

    #[test]
    fn empty_blueprint_completes_on_start() {
        let mut runner = BlueprintRunner::new(Blueprint::default());
        assert_eq!(runner.start(), BlueprintStep::Complete);
        assert!(!runner.is_active());
    }

    #[test]
    fn validate_flags_unknown_features() {
        let mut b = block("x", 0);
        b.features.insert("NOPE".into(), true);
        let issues = Blueprint::new(vec![b]).validate();
        assert_eq!(issues.len(), 2);
        assert!(issues[0].contains("unknown feature NOPE"));
    }

    #[test]
    fn missing_file_reports_name() {
        let dir = tempfile::tempdir().unwrap();
        let err = Blueprint::load(dir.path().join("plan.json")).unwrap_err();
        assert!(err.to_string().contains("plan.json"));
        assert!(err.to_string().starts_with("Blueprint file '"));
    }
}
