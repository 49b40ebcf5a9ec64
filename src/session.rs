//! Per-session state: history, counters, and the auto-end and blocking rules.

use tokio::time::Instant;

use crate::config::FeatureConfiguration;
use crate::features::{FeatureFlag, Variant};
use crate::gateway::{Message, Role};
use crate::settings::SettingKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoEndReason {
    MessageLimit,
    TimeLimit,
}

impl AutoEndReason {
    pub fn label(&self) -> &'static str {
        match self {
            AutoEndReason::MessageLimit => "message limit",
            AutoEndReason::TimeLimit => "time limit",
        }
    }

    pub fn notice(&self) -> String {
        format!("Chat ended automatically: {} reached.", self.label())
    }
}

/// Countdown during which input is suspended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockingState {
    active: bool,
    remaining_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTick {
    Remaining(u64),
    Finished,
}

impl BlockingState {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.remaining_seconds
    }

    /// Begin a countdown; a zero duration does not block.
    pub fn start(&mut self, seconds: u64) -> bool {
        self.active = seconds > 0;
        self.remaining_seconds = seconds;
        self.active
    }

    /// One second elapsed.
    pub fn tick(&mut self) -> BlockTick {
        self.remaining_seconds = self.remaining_seconds.saturating_sub(1);
        if self.remaining_seconds == 0 {
            self.active = false;
            BlockTick::Finished
        } else {
            BlockTick::Remaining(self.remaining_seconds)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    history: Vec<Message>,
    turn_count: u64,
    assistant_turns: u64,
    erase_count: u64,
    started_at: Instant,
    last_selection: Option<Variant>,
    blocking: BlockingState,
}

impl SessionState {
    pub fn new(started_at: Instant) -> Self {
        Self {
            history: Vec::new(),
            turn_count: 0,
            assistant_turns: 0,
            erase_count: 0,
            started_at,
            last_selection: None,
            blocking: BlockingState::default(),
        }
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn assistant_turns(&self) -> u64 {
        self.assistant_turns
    }

    pub fn erase_count(&self) -> u64 {
        self.erase_count
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn last_selection(&self) -> Option<Variant> {
        self.last_selection
    }

    pub fn blocking(&self) -> &BlockingState {
        &self.blocking
    }

    pub fn blocking_mut(&mut self) -> &mut BlockingState {
        &mut self.blocking
    }

    pub fn record_user(&mut self, text: impl Into<String>) {
        self.history.push(Message::user(text));
    }

    /// Most recent user message still in history.
    pub fn last_user_message(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Append the assistant reply and bump both counters. Returns the new turn count.
    pub fn commit_assistant(&mut self, text: impl Into<String>, selection: Option<Variant>) -> u64 {
        self.history.push(Message::assistant(text));
        self.turn_count += 1;
        self.assistant_turns += 1;
        self.last_selection = selection;
        self.turn_count
    }

    /// Drop the conversation history; counters are kept.
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.erase_count += 1;
    }

    pub fn auto_end_reason(&self, config: &FeatureConfiguration) -> Option<AutoEndReason> {
        if !config.is_enabled(FeatureFlag::AutoEndAfterNMsgs) {
            return None;
        }
        let limit = config.int(SettingKey::AutoEndMessages).max(0) as u64;
        (self.assistant_turns >= limit).then_some(AutoEndReason::MessageLimit)
    }

    /// Every Nth committed turn with repeat, otherwise only the Nth.
    pub fn should_block(&self, config: &FeatureConfiguration) -> bool {
        if !config.is_enabled(FeatureFlag::BlockMsgs) {
            return false;
        }
        let n = config.int(SettingKey::BlockMessageCount).max(1) as u64;
        if config.toggle(SettingKey::BlockRepeat) {
            self.turn_count > 0 && self.turn_count % n == 0
        } else {
            self.turn_count == n
        }
    }

    pub fn survey_due(&self, config: &FeatureConfiguration) -> bool {
        if !config.is_enabled(FeatureFlag::InterTrialSurvey) {
            return false;
        }
        let every = config.int(SettingKey::SurveyTriggerCount).max(1) as u64;
        self.assistant_turns > 0 && self.assistant_turns % every == 0
    }
}
