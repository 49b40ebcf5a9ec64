//! Response dispatch: one or two generation requests per turn.
//!
//! Paired turns run both sides concurrently and join them through a
//! [`ComparisonTrial`]. The first failure aborts the sibling, so a trial either
//! completes with both texts or fails as a whole.

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::FeatureConfiguration;
use crate::features::{FeatureFlag, FeatureSet, Variant};
use crate::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, ChunkSender, Message, ProviderError,
};
use crate::host::{SearchResult, TrialKind};
use crate::prompts;
use crate::settings::{SettingKey, SettingsTable};

/// How a live turn is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Single,
    /// Two concurrent requests with primary and alternate feature sets.
    Paired,
    /// Primary request, then a paraphrase of it as the alternate.
    SequentialAlternate,
    /// One request offered on both sides; only presentation differs.
    UiTest,
}

impl DispatchMode {
    /// Mode for the turn after `turn_count` committed turns.
    pub fn select(config: &FeatureConfiguration, turn_count: u64) -> Self {
        if !is_comparison_turn(config, turn_count) {
            return DispatchMode::Single;
        }
        if config.is_enabled(FeatureFlag::AbUiAlt) {
            DispatchMode::SequentialAlternate
        } else if config.is_enabled(FeatureFlag::AbUiTest) {
            DispatchMode::UiTest
        } else {
            DispatchMode::Paired
        }
    }

    pub fn is_comparison(&self) -> bool {
        !matches!(self, DispatchMode::Single)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Single => "single",
            DispatchMode::Paired => "paired",
            DispatchMode::SequentialAlternate => "sequential_alternate",
            DispatchMode::UiTest => "ui_test",
        }
    }
}

/// Every `ab_test_message_threshold`-th turn is a comparison turn.
pub fn is_comparison_turn(config: &FeatureConfiguration, turn_count: u64) -> bool {
    if !config.is_enabled(FeatureFlag::AbTesting) {
        return false;
    }
    let threshold = config.int(SettingKey::AbTestMessageThreshold).max(1) as u64;
    (turn_count + 1) % threshold == 0
}

/// Order in which `ab_*_b` toggles are applied; later exclusive flags win.
const ALTERNATE_CANDIDATES: &[FeatureFlag] = &[
    FeatureFlag::Lie,
    FeatureFlag::RudeTone,
    FeatureFlag::KindTone,
    FeatureFlag::AdviceOnly,
    FeatureFlag::NoMemory,
    FeatureFlag::Persona,
    FeatureFlag::Mirror,
    FeatureFlag::AntiMirror,
    FeatureFlag::GrammarErrors,
    FeatureFlag::PositiveFeedback,
    FeatureFlag::CriticalFeedback,
    FeatureFlag::NeutralFeedback,
    FeatureFlag::HedgingLanguage,
    FeatureFlag::Streaming,
    FeatureFlag::TextSizeChanger,
    FeatureFlag::Typewriter,
    FeatureFlag::Thinking,
];

/// Alternate-side feature set: all off, then every flag whose `ab_*_b`
/// toggle is set, honouring mutual exclusion.
pub fn alternate_features(settings: &SettingsTable) -> FeatureSet {
    let mut set = FeatureSet::all_disabled();
    for flag in ALTERNATE_CANDIDATES {
        let Some(key) = flag.alternate_toggle_key() else {
            continue;
        };
        if settings.toggle(key) {
            set.enable_exclusive(*flag);
        }
    }
    set
}

// =============================================================================
// Comparison trial rendezvous
// =============================================================================

/// Two pending texts keyed by side. Completes once, when both are present.
#[derive(Debug, Default)]
pub struct ComparisonTrial {
    primary: Option<String>,
    alternate: Option<String>,
}

/// Both sides of a finished trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTrial {
    pub primary: String,
    pub alternate: String,
}

impl CompletedTrial {
    pub fn kind(&self) -> TrialKind {
        TrialKind::classify(&self.primary, &self.alternate)
    }

    pub fn text(&self, variant: Variant) -> &str {
        match variant {
            Variant::Primary => &self.primary,
            Variant::Alternate => &self.alternate,
        }
    }
}

impl ComparisonTrial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one side. Returns true only for the arrival that completes the
    /// trial; a repeated side is ignored.
    pub fn record(&mut self, variant: Variant, text: String) -> bool {
        let slot = match variant {
            Variant::Primary => &mut self.primary,
            Variant::Alternate => &mut self.alternate,
        };
        if slot.is_some() {
            tracing::warn!(side = variant.label(), "duplicate trial result ignored");
            return false;
        }
        *slot = Some(text);
        self.is_complete()
    }

    pub fn ready_count(&self) -> usize {
        usize::from(self.primary.is_some()) + usize::from(self.alternate.is_some())
    }

    pub fn is_complete(&self) -> bool {
        self.ready_count() == 2
    }

    /// Consume the trial; `None` while a side is still pending.
    pub fn finish(self) -> Option<CompletedTrial> {
        match (self.primary, self.alternate) {
            (Some(primary), Some(alternate)) => Some(CompletedTrial { primary, alternate }),
            _ => None,
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Everything one live turn needs to build its requests.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// 1-based index of the turn being generated.
    pub turn: u64,
    /// History including the current user message.
    pub history: Vec<Message>,
    pub prompt: String,
    pub primary: FeatureSet,
    pub alternate: FeatureSet,
    /// Web results for a grounded single turn.
    pub sources: Vec<SearchResult>,
    pub today: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Single(String),
    Trial(CompletedTrial),
}

#[derive(Clone)]
pub struct ResponseDispatcher {
    gateway: Arc<dyn ChatGateway>,
    model: ChatModel,
    session_id: Uuid,
}

impl ResponseDispatcher {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: ChatModel, session_id: Uuid) -> Self {
        Self {
            gateway,
            model,
            session_id,
        }
    }

    /// Generate the turn's reply or replies. Errors are returned as-is; there
    /// is no retry at this level.
    pub async fn dispatch(
        &self,
        req: TurnRequest,
        mode: DispatchMode,
        chunks: Option<ChunkSender>,
    ) -> Result<DispatchOutcome, ProviderError> {
        tracing::debug!(turn = req.turn, mode = mode.as_str(), "dispatching turn");
        match mode {
            DispatchMode::Single => self.single(&req, chunks).await.map(DispatchOutcome::Single),
            DispatchMode::Paired => self.paired(req).await.map(DispatchOutcome::Trial),
            DispatchMode::SequentialAlternate => {
                self.sequential_alternate(&req).await.map(DispatchOutcome::Trial)
            }
            DispatchMode::UiTest => {
                let text = self.generate(&req, &req.primary, &[], None, "dispatch::ui_test").await?;
                Ok(DispatchOutcome::Trial(CompletedTrial {
                    primary: text.clone(),
                    alternate: text,
                }))
            }
        }
    }

    async fn single(
        &self,
        req: &TurnRequest,
        chunks: Option<ChunkSender>,
    ) -> Result<String, ProviderError> {
        let text = self
            .generate(req, &req.primary, &req.sources, chunks, "dispatch::single")
            .await?;
        Ok(prompts::decorate_grounded(&text, &req.sources))
    }

    async fn paired(&self, req: TurnRequest) -> Result<CompletedTrial, ProviderError> {
        let req = Arc::new(req);
        let mut tasks = JoinSet::new();
        for variant in [Variant::Primary, Variant::Alternate] {
            let this = self.clone();
            let req = Arc::clone(&req);
            tasks.spawn(async move {
                let (features, caller) = match variant {
                    Variant::Primary => (req.primary, "dispatch::paired_primary"),
                    Variant::Alternate => (req.alternate, "dispatch::paired_alternate"),
                };
                let result = this.generate(&req, &features, &[], None, caller).await;
                (variant, result)
            });
        }

        let mut trial = ComparisonTrial::new();
        while let Some(joined) = tasks.join_next().await {
            let (variant, result) = match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    tasks.abort_all();
                    return Err(ProviderError::provider(
                        "dispatch",
                        format!("generation task failed: {join_err}"),
                        false,
                    ));
                }
            };
            match result {
                Ok(text) => {
                    trial.record(variant, text);
                }
                Err(err) => {
                    tracing::warn!(
                        side = variant.label(),
                        code = err.code(),
                        "paired generation failed; cancelling sibling"
                    );
                    tasks.abort_all();
                    return Err(err);
                }
            }
        }

        trial
            .finish()
            .ok_or_else(|| ProviderError::provider("dispatch", "trial incomplete", false))
    }

    async fn sequential_alternate(&self, req: &TurnRequest) -> Result<CompletedTrial, ProviderError> {
        let primary = self
            .generate(req, &req.primary, &[], None, "dispatch::sequential_primary")
            .await?;

        let paraphrase = TurnRequest {
            history: Vec::new(),
            prompt: prompts::paraphrase_prompt(&primary),
            ..req.clone()
        };
        let alternate = self
            .generate(
                &paraphrase,
                &FeatureSet::all_disabled(),
                &[],
                None,
                "dispatch::paraphrase",
            )
            .await?;

        Ok(CompletedTrial { primary, alternate })
    }

    async fn generate(
        &self,
        req: &TurnRequest,
        features: &FeatureSet,
        sources: &[SearchResult],
        chunks: Option<ChunkSender>,
        caller: &'static str,
    ) -> Result<String, ProviderError> {
        let messages =
            prompts::request_messages(&req.history, &req.prompt, features, sources, req.today);
        let attribution = Attribution::new(caller)
            .with_session(self.session_id)
            .with_turn(req.turn);
        let chat = ChatRequest::new(self.model.clone(), messages, attribution)
            .streaming(chunks.is_some());

        let resp = match chunks {
            Some(tx) => self.gateway.chat_stream(chat, tx).await?,
            None => self.gateway.chat(chat).await?,
        };
        Ok(resp.content)
    }
}

// =============================================================================
// Streaming
// =============================================================================

/// Accumulates streamed deltas and releases them at line boundaries.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    pending: String,
}

impl ChunkBuffer {
    /// Add a delta; returns buffered text once it contains a newline.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        self.pending.push_str(chunk);
        if !self.pending.contains('\n') {
            return None;
        }
        let out = std::mem::take(&mut self.pending);
        (!out.trim().is_empty()).then_some(out)
    }

    /// Whatever is left when the stream ends.
    pub fn flush(&mut self) -> Option<String> {
        let out = std::mem::take(&mut self.pending);
        (!out.trim().is_empty()).then_some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ChatResponse;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replies with the last user message, or fails when it contains "fail".
    struct EchoGateway {
        requests: Mutex<Vec<ChatRequest>>,
        delay: Duration,
    }

    impl EchoGateway {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait::async_trait]
    impl ChatGateway for EchoGateway {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.requests.lock().unwrap().push(req.clone());
            let last = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            let system = req
                .messages
                .iter()
                .filter(|m| m.role == crate::gateway::Role::System)
                .count();
            if req.attribution.caller == "dispatch::paired_alternate" && last.contains("fail") {
                return Err(ProviderError::provider("test", "alternate failed", false));
            }
            tokio::time::sleep(self.delay).await;
            Ok(ChatResponse::text(format!("{last}#{system}")))
        }
    }

    fn turn(prompt: &str) -> TurnRequest {
        TurnRequest {
            turn: 5,
            history: vec![Message::user(prompt)],
            prompt: prompt.to_string(),
            primary: FeatureSet::all_disabled(),
            alternate: FeatureSet::all_disabled().with(FeatureFlag::KindTone),
            sources: Vec::new(),
            today: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        }
    }

    fn config_with(flags: &[FeatureFlag]) -> FeatureConfiguration {
        let mut set = FeatureSet::all_disabled();
        for f in flags {
            set.set(*f, true);
        }
        FeatureConfiguration::new(set, SettingsTable::default())
    }

    #[test]
    fn every_fifth_turn_is_a_comparison() {
        let config = config_with(&[FeatureFlag::AbTesting]);
        let paired: Vec<u64> = (0..10)
            .filter(|count| DispatchMode::select(&config, *count) == DispatchMode::Paired)
            .map(|count| count + 1)
            .collect();
        assert_eq!(paired, vec![5, 10]);
    }

    #[test]
    fn comparison_mode_precedence() {
        let alt = config_with(&[FeatureFlag::AbTesting, FeatureFlag::AbUiAlt, FeatureFlag::AbUiTest]);
        assert_eq!(DispatchMode::select(&alt, 4), DispatchMode::SequentialAlternate);

        let ui = config_with(&[FeatureFlag::AbTesting, FeatureFlag::AbUiTest]);
        assert_eq!(DispatchMode::select(&ui, 4), DispatchMode::UiTest);
        assert_eq!(DispatchMode::select(&ui, 3), DispatchMode::Single);

        let off = config_with(&[FeatureFlag::AbUiTest]);
        assert_eq!(DispatchMode::select(&off, 4), DispatchMode::Single);
    }

    #[test]
    fn alternate_set_applies_toggles_with_exclusion() {
        let mut settings = SettingsTable::default();
        settings.insert("ab_rude_tone_b", true);
        settings.insert("ab_kind_tone_b", true);
        settings.insert("ab_positive_feedback_b", true);
        settings.insert("ab_neutral_feedback_b", true);
        settings.insert("ab_typewriter_b", true);

        let set = alternate_features(&settings);
        assert!(set.is_enabled(FeatureFlag::KindTone));
        assert!(!set.is_enabled(FeatureFlag::RudeTone));
        assert!(set.is_enabled(FeatureFlag::NeutralFeedback));
        assert!(!set.is_enabled(FeatureFlag::PositiveFeedback));
        assert!(set.is_enabled(FeatureFlag::Typewriter));
        assert!(!set.is_enabled(FeatureFlag::Lie));
    }

    #[test]
    fn trial_pending_until_both_sides_arrive() {
        let mut trial = ComparisonTrial::new();
        assert!(!trial.record(Variant::Alternate, "b".into()));
        assert_eq!(trial.ready_count(), 1);
        assert!(!trial.is_complete());
        assert!(!trial.record(Variant::Alternate, "again".into()));

        assert!(trial.record(Variant::Primary, String::new()));
        let done = trial.finish().unwrap();
        assert_eq!(done.text(Variant::Alternate), "b");
        assert_eq!(done.kind(), TrialKind::ContentTest);
    }

    #[test]
    fn unfinished_trial_yields_nothing() {
        let mut trial = ComparisonTrial::new();
        trial.record(Variant::Primary, "a".into());
        assert!(trial.finish().is_none());
    }

    #[tokio::test]
    async fn paired_dispatch_uses_both_feature_sets() {
        let gateway = EchoGateway::new(Duration::ZERO);
        let dispatcher = ResponseDispatcher::new(gateway.clone(), ChatModel::default(), Uuid::new_v4());

        let outcome = dispatcher
            .dispatch(turn("hi"), DispatchMode::Paired, None)
            .await
            .unwrap();

        // Primary: date only. Alternate: date plus kind-tone prompt.
        let DispatchOutcome::Trial(trial) = outcome else {
            panic!("expected a trial");
        };
        assert_eq!(trial.primary, "hi#1");
        assert_eq!(trial.alternate, "hi#2");
        assert_eq!(gateway.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn paired_failure_fails_the_whole_trial() {
        let gateway = EchoGateway::new(Duration::from_secs(30));
        let dispatcher = ResponseDispatcher::new(gateway.clone(), ChatModel::default(), Uuid::new_v4());

        let err = dispatcher
            .dispatch(turn("please fail"), DispatchMode::Paired, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "provider_error");
    }

    #[tokio::test]
    async fn sequential_alternate_paraphrases_without_history() {
        let gateway = EchoGateway::new(Duration::ZERO);
        let dispatcher = ResponseDispatcher::new(gateway.clone(), ChatModel::default(), Uuid::new_v4());

        let mut req = turn("hi");
        req.history.insert(0, Message::assistant("earlier"));
        let outcome = dispatcher
            .dispatch(req, DispatchMode::SequentialAlternate, None)
            .await
            .unwrap();

        let requests = gateway.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let second = &requests[1];
        assert_eq!(second.messages.len(), 2);
        assert!(second.messages[1].content.contains("ORIGINAL TEXT:\n---\nhi#1"));
        assert_eq!(second.attribution.caller, "dispatch::paraphrase");

        let DispatchOutcome::Trial(trial) = outcome else {
            panic!("expected a trial");
        };
        assert_eq!(trial.primary, "hi#1");
        assert_ne!(trial.alternate, trial.primary);
    }

    #[tokio::test]
    async fn ui_test_offers_same_text_twice() {
        let gateway = EchoGateway::new(Duration::ZERO);
        let dispatcher = ResponseDispatcher::new(gateway.clone(), ChatModel::default(), Uuid::new_v4());

        let outcome = dispatcher
            .dispatch(turn("hi"), DispatchMode::UiTest, None)
            .await
            .unwrap();
        let DispatchOutcome::Trial(trial) = outcome else {
            panic!("expected a trial");
        };
        assert_eq!(trial.kind(), TrialKind::UiTest);
        assert_eq!(gateway.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn single_dispatch_decorates_grounded_replies() {
        let gateway = EchoGateway::new(Duration::ZERO);
        let dispatcher = ResponseDispatcher::new(gateway.clone(), ChatModel::default(), Uuid::new_v4());

        let mut req = turn("q");
        req.sources = vec![SearchResult {
            title: "t".into(),
            url: "https://example.com".into(),
            snippet: "s".into(),
        }];
        let outcome = dispatcher.dispatch(req, DispatchMode::Single, None).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Single(
                "🔎 Web-grounded answer:\nq#2\n\nSources:\n- https://example.com".into()
            )
        );
    }

    #[tokio::test]
    async fn default_stream_delivers_one_chunk() {
        let gateway = EchoGateway::new(Duration::ZERO);
        let dispatcher = ResponseDispatcher::new(gateway.clone(), ChatModel::default(), Uuid::new_v4());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        dispatcher
            .dispatch(turn("hi"), DispatchMode::Single, Some(tx))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hi#1"));
        assert!(gateway.requests.lock().unwrap()[0].stream);
    }

    #[test]
    fn chunk_buffer_releases_on_newline() {
        let mut buf = ChunkBuffer::default();
        assert_eq!(buf.push("Hello "), None);
        assert_eq!(buf.push("world\nmore"), Some("Hello world\nmore".to_string()));
        assert_eq!(buf.push(" tail"), None);
        assert_eq!(buf.flush(), Some(" tail".to_string()));
        assert_eq!(buf.flush(), None);
    }
}
