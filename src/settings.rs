//! Settings table with alternate-side (`_b`) siblings.
//!
//! Every primary key `K` may carry a sibling `K_b` used when resolving for the
//! alternate variant. Lookups never fail: a missing or mistyped value falls
//! back to the key's documented default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::features::Variant;

/// Suffix marking the alternate-side sibling of a setting.
pub const ALTERNATE_SUFFIX: &str = "_b";

macro_rules! setting_keys {
    ($($variant:ident => $name:literal = $primary:expr, $alternate:expr;)+) => {
        /// Documented setting keys.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum SettingKey {
            $($variant),+
        }

        impl SettingKey {
            pub const ALL: &'static [SettingKey] = &[$(SettingKey::$variant),+];

            pub fn name(&self) -> &'static str {
                match self {
                    $(SettingKey::$variant => $name),+
                }
            }

            /// Fallback for the primary side.
            pub fn default_value(&self) -> Value {
                match self {
                    $(SettingKey::$variant => Value::from($primary)),+
                }
            }

            /// Value seeded into the default table under `<name>_b`, if any.
            fn default_alternate(&self) -> Option<Value> {
                match self {
                    $(SettingKey::$variant => $alternate.map(Value::from)),+
                }
            }
        }
    };
}

setting_keys! {
    TextSize => "text_size" = 20, Some(24);
    DelaySeconds => "delay_seconds" = 2, Some(3);
    AutoEndMessages => "auto_end_messages" = 10, Some(15);
    AutoEndMinutes => "auto_end_minutes" = 5, Some(8);
    SlowdownPeriodS => "slowdown_period_s" = 100, Some(150);
    SlowdownWindowS => "slowdown_window_s" = 20, Some(30);
    SlowdownMinDelayS => "slowdown_min_delay_s" = 4, Some(6);
    SlowdownPermanentAfterEnabled => "slowdown_permanent_after_enabled" = false, Some(true);
    SlowdownPermanentAfterS => "slowdown_permanent_after_s" = 600, Some(900);
    EraseHistoryDelayS => "erase_history_delay_s" = 60, Some(90);
    EraseHistoryRepeat => "erase_history_repeat" = false, Some(true);
    EraseHistoryIntervalS => "erase_history_interval_s" = 120, Some(180);
    BlockMessageCount => "block_message_count" = 5, Some(8);
    BlockDurationS => "block_duration_s" = 15, Some(25);
    BlockRepeat => "block_repeat" = true, Some(false);
    TypewriterSpeedMs => "typewriter_speed_ms" = 20, Some(50);
    AbTestMessageThreshold => "ab_test_message_threshold" = 5, None::<i64>;
    CustomChatTitle => "custom_chat_title" = "ChatGPT", None::<&str>;
    SurveyTriggerCount => "survey_trigger_count" = 5, None::<i64>;
    ScriptedConvoFile => "scripted_convo_file" = "script.json", None::<&str>;
    BlueprintFilename => "blueprint_filename" = "experiment_blueprint.json", None::<&str>;
}

impl SettingKey {
    pub fn alternate_name(&self) -> String {
        format!("{}{ALTERNATE_SUFFIX}", self.name())
    }
}

/// Mapping from setting name to JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsTable(BTreeMap<String, Value>);

impl Default for SettingsTable {
    /// Table seeded with every documented primary and alternate default.
    fn default() -> Self {
        let mut map = BTreeMap::new();
        for key in SettingKey::ALL {
            map.insert(key.name().to_string(), key.default_value());
            if let Some(alt) = key.default_alternate() {
                map.insert(key.alternate_name(), alt);
            }
        }
        Self(map)
    }
}

impl SettingsTable {
    /// Table with no entries; every lookup resolves to its fallback.
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Overwrite matching keys, keep all others.
    pub fn merge(&mut self, overrides: &BTreeMap<String, Value>) {
        for (name, value) in overrides {
            self.0.insert(name.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolve any name for a variant, with an explicit fallback.
    ///
    /// Alternate prefers `<name>_b`, then `<name>`; primary reads `<name>` only.
    pub fn resolve_raw(&self, name: &str, variant: Variant, fallback: Value) -> Value {
        if variant == Variant::Alternate {
            if let Some(v) = self.0.get(&format!("{name}{ALTERNATE_SUFFIX}")) {
                return v.clone();
            }
        }
        self.0.get(name).cloned().unwrap_or(fallback)
    }

    pub fn resolve(&self, key: SettingKey, variant: Variant) -> Value {
        self.resolve_raw(key.name(), variant, key.default_value())
    }

    pub fn resolve_i64(&self, key: SettingKey, variant: Variant) -> i64 {
        as_i64(&self.resolve(key, variant))
            .or_else(|| as_i64(&key.default_value()))
            .unwrap_or(0)
    }

    /// Seconds as a float, so fractional delays in config files are honoured.
    pub fn resolve_f64(&self, key: SettingKey, variant: Variant) -> f64 {
        self.resolve(key, variant)
            .as_f64()
            .or_else(|| key.default_value().as_f64())
            .unwrap_or(0.0)
    }

    pub fn resolve_bool(&self, key: SettingKey, variant: Variant) -> bool {
        self.resolve(key, variant)
            .as_bool()
            .or_else(|| key.default_value().as_bool())
            .unwrap_or(false)
    }

    pub fn resolve_string(&self, key: SettingKey, variant: Variant) -> String {
        match self.resolve(key, variant) {
            Value::String(s) => s,
            _ => key
                .default_value()
                .as_str()
                .map(str::to_string)
                .unwrap_or_default(),
        }
    }

    /// Boolean toggle by free-form name (e.g. `ab_rude_tone_b`); missing reads false.
    pub fn toggle(&self, name: &str) -> bool {
        self.0.get(name).and_then(Value::as_bool).unwrap_or(false)
    }
}

fn as_i64(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f.floor() as i64))
}
