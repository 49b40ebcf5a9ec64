//! Host boundary: everything the orchestrator asks of the participant-facing UI.
//!
//! Notification methods are synchronous and must not block. Interactive
//! methods (`present_choice`, `run_survey`) are awaited on a spawned task so
//! the session loop keeps servicing timers while the participant decides.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::features::Variant;
use crate::gateway::Role;

/// How one message should be rendered, resolved for its variant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Presentation {
    /// Per-character delay when the typewriter effect applies.
    pub typewriter_ms: Option<u64>,
    /// Font size when the text-size changer applies.
    pub text_size: Option<i64>,
    /// Show a thinking indicator before the text.
    pub thinking: bool,
    /// Text was already delivered through `stream_chunk`.
    pub streamed: bool,
}

/// Whether the two sides of a trial differ in content or only in presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialKind {
    ContentTest,
    UiTest,
}

impl TrialKind {
    /// Identical texts can only differ in how they are shown.
    pub fn classify(primary: &str, alternate: &str) -> Self {
        if primary == alternate {
            TrialKind::UiTest
        } else {
            TrialKind::ContentTest
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrialKind::ContentTest => "content_test",
            TrialKind::UiTest => "ui_test",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceOption {
    pub variant: Variant,
    pub text: String,
    pub presentation: Presentation,
}

/// Two candidate replies offered side by side.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceRequest {
    pub turn: u64,
    pub kind: TrialKind,
    pub options: [ChoiceOption; 2],
}

impl ChoiceRequest {
    pub fn option(&self, variant: Variant) -> &ChoiceOption {
        match variant {
            Variant::Primary => &self.options[0],
            Variant::Alternate => &self.options[1],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChoiceOutcome {
    pub chosen: Variant,
    /// Time from presentation to selection, measured by the host.
    pub latency: Duration,
}

/// Survey answers keyed by question.
pub type SurveyAnswers = BTreeMap<String, Value>;

#[async_trait]
pub trait ChatHost: Send + Sync {
    fn show_message(&self, role: Role, text: &str, presentation: &Presentation);

    /// System-style line (errors, countdowns, session notices).
    fn show_notice(&self, text: &str);

    fn set_input_enabled(&self, enabled: bool);

    fn set_thinking(&self, active: bool);

    /// Newline-terminated fragment of a streamed reply.
    fn stream_chunk(&self, text: &str);

    fn set_title(&self, title: &str);

    fn apply_text_size(&self, size: i64);

    /// History was erased; hosts that keep a transcript may drop it.
    fn clear_transcript(&self) {}

    /// Offer both sides and wait for a pick. `None` means the choice was
    /// abandoned and the primary side is committed.
    async fn present_choice(&self, request: ChoiceRequest) -> Option<ChoiceOutcome>;

    /// Run the inter-trial survey. `None` when skipped or unavailable.
    async fn run_survey(&self, turn: u64) -> Option<SurveyAnswers>;

    fn session_ended(&self, reason: &str);
}

// =============================================================================
// Web search
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Retrieval capability used for web-grounded replies.
///
/// Failures are the implementation's concern: an empty list means ungrounded.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Vec<SearchResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_texts_classify_as_ui_test() {
        assert_eq!(TrialKind::classify("same", "same"), TrialKind::UiTest);
        assert_eq!(TrialKind::classify("a", "b"), TrialKind::ContentTest);
        assert_eq!(TrialKind::UiTest.as_str(), "ui_test");
    }

    #[test]
    fn choice_request_indexes_by_variant() {
        let option = |variant, text: &str| ChoiceOption {
            variant,
            text: text.to_string(),
            presentation: Presentation::default(),
        };
        let request = ChoiceRequest {
            turn: 5,
            kind: TrialKind::ContentTest,
            options: [option(Variant::Primary, "a"), option(Variant::Alternate, "b")],
        };
        assert_eq!(request.option(Variant::Alternate).text, "b");
        assert_eq!(request.option(Variant::Primary).text, "a");
    }
}
