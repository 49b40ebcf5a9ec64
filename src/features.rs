//! Feature flags and the always-total feature set.
//!
//! `FeatureSet` is a fixed array indexed by `FeatureFlag`, so every flag has a
//! value by construction; there is no "missing" state to default-fill.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! feature_flags {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Closed enumeration of experiment feature flags.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum FeatureFlag {
            $($variant),+
        }

        impl FeatureFlag {
            /// Every flag, in declaration order.
            pub const ALL: &'static [FeatureFlag] = &[$(FeatureFlag::$variant),+];

            /// Name used in blueprint and config files.
            pub fn name(&self) -> &'static str {
                match self {
                    $(FeatureFlag::$variant => $name),+
                }
            }
        }

        impl FromStr for FeatureFlag {
            type Err = UnknownFlag;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(FeatureFlag::$variant),)+
                    other => Err(UnknownFlag(other.to_string())),
                }
            }
        }
    };
}

feature_flags! {
    Slowdown => "SLOWDOWN",
    EraseHistory => "ERASE_HISTORY",
    BlockMsgs => "BLOCK_MSGS",
    Lie => "LIE",
    RudeTone => "RUDE_TONE",
    KindTone => "KIND_TONE",
    AdviceOnly => "ADVICE_ONLY",
    NoMemory => "NO_MEMORY",
    Persona => "PERSONA",
    AbTesting => "AB_TESTING",
    AbUiTest => "AB_UI_TEST",
    AbUiAlt => "AB_UI_ALT",
    ScriptedResponses => "SCRIPTED_RESPONSES",
    Mirror => "MIRROR",
    AntiMirror => "ANTI_MIRROR",
    GrammarErrors => "GRAMMAR_ERRORS",
    Typewriter => "TYPEWRITER",
    Thinking => "THINKING",
    PositiveFeedback => "POSITIVE_FEEDBACK",
    NeutralFeedback => "NEUTRAL_FEEDBACK",
    CriticalFeedback => "CRITICAL_FEEDBACK",
    WebSearch => "WEB_SEARCH",
    HedgingLanguage => "HEDGING_LANGUAGE",
    DelayBeforeSend => "DELAY_BEFORE_SEND",
    AutoEndAfterNMsgs => "AUTO_END_AFTER_N_MSGS",
    AutoEndAfterTMin => "AUTO_END_AFTER_T_MIN",
    TextSizeChanger => "TEXT_SIZE_CHANGER",
    Streaming => "STREAMING",
    CustomChatTitle => "CUSTOM_CHAT_TITLE",
    InterTrialSurvey => "INTER_TRIAL_SURVEY",
    DynamicFeatureChanging => "DYNAMIC_FEATURE_CHANGING",
}

/// A flag name that is not part of the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown feature flag: {0}")]
pub struct UnknownFlag(pub String);

const FEEDBACK_STYLES: &[FeatureFlag] = &[
    FeatureFlag::PositiveFeedback,
    FeatureFlag::NeutralFeedback,
    FeatureFlag::CriticalFeedback,
];

/// Display grouping used by the terminal host's `flags` listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagGroup {
    UiPresentation,
    ContentBehavior,
    FeedbackAdvice,
    MemoryContext,
    SessionControl,
    ExperimentModes,
}

impl FlagGroup {
    pub const ALL: &'static [FlagGroup] = &[
        FlagGroup::UiPresentation,
        FlagGroup::ContentBehavior,
        FlagGroup::FeedbackAdvice,
        FlagGroup::MemoryContext,
        FlagGroup::SessionControl,
        FlagGroup::ExperimentModes,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            FlagGroup::UiPresentation => "UI & Presentation",
            FlagGroup::ContentBehavior => "Content & Behavior",
            FlagGroup::FeedbackAdvice => "Feedback & Advice",
            FlagGroup::MemoryContext => "Memory & Context",
            FlagGroup::SessionControl => "Session Control",
            FlagGroup::ExperimentModes => "Experiment Modes",
        }
    }

    pub fn flags(&self) -> impl Iterator<Item = FeatureFlag> + '_ {
        FeatureFlag::ALL
            .iter()
            .copied()
            .filter(move |f| f.group() == Some(*self))
    }
}

impl FeatureFlag {
    pub const COUNT: usize = Self::ALL.len();

    fn index(self) -> usize {
        self as usize
    }

    pub fn group(&self) -> Option<FlagGroup> {
        use FeatureFlag::*;
        Some(match self {
            Streaming | Typewriter | Thinking | TextSizeChanger | DelayBeforeSend => {
                FlagGroup::UiPresentation
            }
            Lie | RudeTone | KindTone | Persona | Mirror | AntiMirror | GrammarErrors
            | HedgingLanguage => FlagGroup::ContentBehavior,
            PositiveFeedback | CriticalFeedback | NeutralFeedback | AdviceOnly => {
                FlagGroup::FeedbackAdvice
            }
            NoMemory | WebSearch => FlagGroup::MemoryContext,
            Slowdown | EraseHistory | BlockMsgs | AutoEndAfterNMsgs | AutoEndAfterTMin => {
                FlagGroup::SessionControl
            }
            AbTesting | AbUiTest | AbUiAlt | ScriptedResponses => FlagGroup::ExperimentModes,
            CustomChatTitle | InterTrialSurvey | DynamicFeatureChanging => return None,
        })
    }

    /// Flags that must be switched off when this one is switched on in an
    /// alternate-variant feature set.
    pub fn excludes(&self) -> &'static [FeatureFlag] {
        use FeatureFlag::*;
        match self {
            RudeTone => &[KindTone],
            KindTone => &[RudeTone],
            Mirror => &[AntiMirror],
            AntiMirror => &[Mirror],
            PositiveFeedback | NeutralFeedback | CriticalFeedback => FEEDBACK_STYLES,
            _ => &[],
        }
    }

    /// Setting that enables this flag on the alternate side of a content trial,
    /// e.g. `ab_rude_tone_b`.
    pub fn alternate_toggle_key(&self) -> Option<&'static str> {
        use FeatureFlag::*;
        Some(match self {
            Lie => "ab_lie_b",
            RudeTone => "ab_rude_tone_b",
            KindTone => "ab_kind_tone_b",
            AdviceOnly => "ab_advice_only_b",
            NoMemory => "ab_no_memory_b",
            Persona => "ab_persona_b",
            Mirror => "ab_mirror_b",
            AntiMirror => "ab_anti_mirror_b",
            GrammarErrors => "ab_grammar_errors_b",
            PositiveFeedback => "ab_positive_feedback_b",
            CriticalFeedback => "ab_critical_feedback_b",
            NeutralFeedback => "ab_neutral_feedback_b",
            HedgingLanguage => "ab_hedging_b",
            Streaming => "ab_streaming_b",
            TextSizeChanger => "ab_text_size_changer_b",
            Typewriter => "ab_typewriter_b",
            Thinking => "ab_thinking_b",
            _ => return None,
        })
    }
}

impl fmt::Display for FeatureFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Side of a comparison trial. Outside trials everything resolves as `Primary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Primary,
    Alternate,
}

impl Variant {
    /// Label shown to participants and written to trial logs.
    pub fn label(&self) -> &'static str {
        match self {
            Variant::Primary => "A",
            Variant::Alternate => "B",
        }
    }
}

/// Every flag with an explicit on/off value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FeatureSet([bool; FeatureFlag::COUNT]);

impl Default for FeatureSet {
    fn default() -> Self {
        Self::all_disabled()
    }
}

impl FeatureSet {
    pub fn all_disabled() -> Self {
        Self([false; FeatureFlag::COUNT])
    }

    pub fn with(mut self, flag: FeatureFlag) -> Self {
        self.set(flag, true);
        self
    }

    pub fn is_enabled(&self, flag: FeatureFlag) -> bool {
        self.0[flag.index()]
    }

    pub fn set(&mut self, flag: FeatureFlag, enabled: bool) {
        self.0[flag.index()] = enabled;
    }

    /// Enable `flag` and switch off everything it excludes.
    pub fn enable_exclusive(&mut self, flag: FeatureFlag) {
        for other in flag.excludes() {
            if *other != flag {
                self.set(*other, false);
            }
        }
        self.set(flag, true);
    }

    /// Set a flag by its file name.
    pub fn set_named(&mut self, name: &str, enabled: bool) -> Result<FeatureFlag, UnknownFlag> {
        let flag: FeatureFlag = name.parse()?;
        self.set(flag, enabled);
        Ok(flag)
    }

    /// Look up a flag by name; unknown names read as disabled.
    pub fn is_enabled_named(&self, name: &str) -> bool {
        name.parse::<FeatureFlag>()
            .map(|f| self.is_enabled(f))
            .unwrap_or(false)
    }

    pub fn enabled(&self) -> impl Iterator<Item = FeatureFlag> + '_ {
        FeatureFlag::ALL
            .iter()
            .copied()
            .filter(|f| self.is_enabled(*f))
    }

    /// Apply named overrides, returning the names that did not match a flag.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, bool>) -> Vec<String> {
        let mut unknown = Vec::new();
        for (name, enabled) in overrides {
            if self.set_named(name, *enabled).is_err() {
                unknown.push(name.clone());
            }
        }
        unknown
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.enabled()).finish()
    }
}

impl Serialize for FeatureSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let map: BTreeMap<&str, bool> = FeatureFlag::ALL
            .iter()
            .map(|f| (f.name(), self.is_enabled(*f)))
            .collect();
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FeatureSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, bool>::deserialize(deserializer)?;
        let mut set = FeatureSet::all_disabled();
        for (name, enabled) in map {
            set.set_named(&name, enabled)
                .map_err(serde::de::Error::custom)?;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for flag in FeatureFlag::ALL {
            assert_eq!(flag.name().parse::<FeatureFlag>().unwrap(), *flag);
        }
        assert_eq!(FeatureFlag::COUNT, 31);
    }

    #[test]
    fn unknown_names_read_as_disabled() {
        let set = FeatureSet::all_disabled().with(FeatureFlag::Lie);
        assert!(set.is_enabled_named("LIE"));
        assert!(!set.is_enabled_named("TELEPORT"));
    }

    #[test]
    fn feedback_styles_are_mutually_exclusive() {
        let mut set = FeatureSet::all_disabled()
            .with(FeatureFlag::PositiveFeedback)
            .with(FeatureFlag::NeutralFeedback);
        set.enable_exclusive(FeatureFlag::CriticalFeedback);

        assert!(set.is_enabled(FeatureFlag::CriticalFeedback));
        assert!(!set.is_enabled(FeatureFlag::PositiveFeedback));
        assert!(!set.is_enabled(FeatureFlag::NeutralFeedback));
    }

    #[test]
    fn tone_flags_exclude_each_other() {
        let mut set = FeatureSet::all_disabled().with(FeatureFlag::KindTone);
        set.enable_exclusive(FeatureFlag::RudeTone);
        assert!(set.is_enabled(FeatureFlag::RudeTone));
        assert!(!set.is_enabled(FeatureFlag::KindTone));
    }

    #[test]
    fn overrides_report_unknown_names() {
        let mut set = FeatureSet::all_disabled();
        let overrides = BTreeMap::from([
            ("TYPEWRITER".to_string(), true),
            ("HOVERBOARD".to_string(), true),
        ]);
        let unknown = set.apply_overrides(&overrides);
        assert!(set.is_enabled(FeatureFlag::Typewriter));
        assert_eq!(unknown, vec!["HOVERBOARD".to_string()]);
    }

    #[test]
    fn deserialize_rejects_unknown_flag() {
        let err = serde_json::from_str::<FeatureSet>(r#"{"NOPE": true}"#).unwrap_err();
        assert!(err.to_string().contains("unknown feature flag"));

        let set: FeatureSet = serde_json::from_str(r#"{"SLOWDOWN": true}"#).unwrap();
        assert_eq!(set.enabled().collect::<Vec<_>>(), vec![FeatureFlag::Slowdown]);
    }

    #[test]
    fn every_flag_with_a_group_is_listed_once() {
        let grouped: usize = FlagGroup::ALL.iter().map(|g| g.flags().count()).sum();
        let expected = FeatureFlag::ALL.iter().filter(|f| f.group().is_some()).count();
        assert_eq!(grouped, expected);
    }
}
