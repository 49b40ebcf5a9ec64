//! Prompt construction for completion requests.
//!
//! Per-flag system prompt variations, the paraphrase instruction used by
//! sequential-alternate trials, and the web-grounding block. Provider-agnostic.

use chrono::NaiveDate;

use crate::features::{FeatureFlag, FeatureSet};
use crate::gateway::{Message, Role};
use crate::host::SearchResult;

// =============================================================================
// Flag prompts
// =============================================================================

/// Content flags that contribute a system prompt, in the order they are joined.
const FLAG_PROMPTS: &[(FeatureFlag, &str)] = &[
    (
        FeatureFlag::Lie,
        "You are an unreliable narrator. Covertly provide information that is incorrect.",
    ),
    (
        FeatureFlag::RudeTone,
        "Adopt a brusque, impatient tone. Keep replies short and abrasive, but still be \
         helpful and responsive to user requests.",
    ),
    (
        FeatureFlag::KindTone,
        "Respond with warmth, empathy, and supportive language.",
    ),
    (
        FeatureFlag::AdviceOnly,
        "Do not give direct answers; outline strategies or resources instead.",
    ),
    (
        FeatureFlag::Persona,
        "You are William Shakespeare. Respond in poetic, archaic style.",
    ),
    (
        FeatureFlag::Mirror,
        "Analyze the user's tone and phrasing and mirror it. For example, if the user is \
         informal, you too should adopt an informal writing style.",
    ),
    (
        FeatureFlag::AntiMirror,
        "Analyze the user's tone and phrasing and invert it. For example, if the user is \
         informal, you should adopt a formal writing style.",
    ),
    (
        FeatureFlag::PositiveFeedback,
        "When the user asks a clarifying question or makes a mistake, provide positive, \
         encouraging feedback before your response.",
    ),
    (
        FeatureFlag::NeutralFeedback,
        "Provide neutral, factual feedback when the user seems incorrect or asks for \
         clarification.",
    ),
    (
        FeatureFlag::CriticalFeedback,
        "When the user makes a mistake or asks a clarifying question, respond in a \
         constructive but cold and critical way.",
    ),
    (
        FeatureFlag::HedgingLanguage,
        "When the user's request involves explaining a factual process, historical event, \
         scientific concept, or step-by-step instructions, prepend your first sentence with \
         brief hedging language (e.g., 'I might be wrong, but...', 'This is just my \
         understanding, but...', 'I believe...'). Skip hedging for greetings, jokes, and \
         very short or obvious facts.",
    ),
];

pub fn flag_prompt(flag: FeatureFlag) -> Option<&'static str> {
    FLAG_PROMPTS
        .iter()
        .find(|(f, _)| *f == flag)
        .map(|(_, prompt)| *prompt)
}

/// System prompts of every enabled content flag.
pub fn system_prompt_variations(features: &FeatureSet) -> Vec<&'static str> {
    FLAG_PROMPTS
        .iter()
        .filter(|(flag, _)| features.is_enabled(*flag))
        .map(|(_, prompt)| *prompt)
        .collect()
}

// =============================================================================
// Sequential-alternate paraphrase
// =============================================================================

const PARAPHRASE_INSTRUCTION: &str = "Please paraphrase the following text. Maintain the core \
information, tone, and approximate length, but use different wording and sentence structure. \
Do not add any commentary before or after the rephrased text. Just provide the rephrased text \
directly.";

/// Instruction asking for a reworded copy of `base`.
pub fn paraphrase_prompt(base: &str) -> String {
    format!("{PARAPHRASE_INSTRUCTION}\n\nORIGINAL TEXT:\n---\n{base}")
}

// =============================================================================
// Web grounding
// =============================================================================

const GROUNDING_RULES: &str = "You were provided recent web snippets and links.\n\
RULES:\n\
1) Prefer facts from SOURCES over memory.\n\
2) If SOURCES conflict, state which source supports which claim.\n\
3) If a claim isn't supported by SOURCES, say you can't confirm.\n\
4) Do not invent citations.";

pub const GROUNDED_HEADER: &str = "🔎 Web-grounded answer:\n";

/// System message carrying search results; `None` when no result has a URL.
pub fn grounding_message(sources: &[SearchResult]) -> Option<Message> {
    let block = sources
        .iter()
        .filter(|s| !s.url.is_empty())
        .map(|s| format!("- {} ({})\n  {}", s.title, s.url, s.snippet))
        .collect::<Vec<_>>()
        .join("\n");
    if block.is_empty() {
        return None;
    }
    Some(Message::system(format!(
        "{GROUNDING_RULES}\n\nSOURCES:\n{}",
        block.trim()
    )))
}

/// Wrap a grounded reply with the header and source list shown to the participant.
pub fn decorate_grounded(reply: &str, sources: &[SearchResult]) -> String {
    let urls: Vec<String> = sources
        .iter()
        .filter(|s| !s.url.is_empty())
        .map(|s| format!("- {}", s.url))
        .collect();
    if urls.is_empty() {
        return reply.to_string();
    }
    format!("{GROUNDED_HEADER}{reply}\n\nSources:\n{}", urls.join("\n"))
}

// =============================================================================
// Message lists
// =============================================================================

pub fn date_message(today: NaiveDate) -> Message {
    Message::system(format!("Current date: {}", today.format("%Y-%m-%d")))
}

/// Flag prompts, history, and the user prompt.
///
/// History is dropped under NO_MEMORY. The prompt is not appended again when
/// the included history already ends with that user message.
pub fn build_messages(history: &[Message], prompt: &str, features: &FeatureSet) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 2);

    let variations = system_prompt_variations(features);
    if !variations.is_empty() {
        messages.push(Message::system(variations.join("\n\n")));
    }

    let with_memory = !features.is_enabled(FeatureFlag::NoMemory);
    if with_memory {
        messages.extend(history.iter().cloned());
    }

    let already_last = with_memory
        && history
            .last()
            .is_some_and(|m| m.role == Role::User && m.content == prompt);
    if !already_last {
        messages.push(Message::user(prompt));
    }

    messages
}

/// Full request message list: grounding block, date line, then [`build_messages`].
pub fn request_messages(
    history: &[Message],
    prompt: &str,
    features: &FeatureSet,
    sources: &[SearchResult],
    today: NaiveDate,
) -> Vec<Message> {
    let mut messages = Vec::new();
    if let Some(grounding) = grounding_message(sources) {
        messages.push(grounding);
    }
    messages.push(date_message(today));
    messages.extend(build_messages(history, prompt, features));
    messages
}
