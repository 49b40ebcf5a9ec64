//! The session event loop.
//!
//! `TurnOrchestrator::run` owns all session state and is the only writer of
//! the live configuration. Generation, timers, and host interactions that wait
//! on the participant run as spawned tasks and report back as [`SessionEvent`]s,
//! so the loop never blocks on them.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::blueprint::{Blueprint, BlueprintRunner, BlueprintStep, ExperimentBlock};
use crate::config::FeatureConfiguration;
use crate::dispatch::{
    alternate_features, ChunkBuffer, CompletedTrial, DispatchMode, DispatchOutcome,
    ResponseDispatcher, TurnRequest,
};
use crate::error::OrchestratorError;
use crate::features::{FeatureFlag, Variant};
use crate::gateway::{ChatGateway, ChatModel, Role};
use crate::host::{
    ChatHost, ChoiceOption, ChoiceOutcome, ChoiceRequest, Presentation, SurveyAnswers, WebSearch,
};
use crate::script::{ScriptPlayer, ScriptStep};
use crate::session::{AutoEndReason, BlockTick, SessionState};
use crate::settings::SettingKey;
use crate::timing::{pre_send_delay, secs, TimingDecision, TimingPolicy};
use crate::trial_log::{MessageLog, NoopTrialLog, SurveyRecord, TrialLogSink, TrialRecord};

/// Grace period between the auto-end notice and closing the session.
pub const AUTO_END_GRACE: Duration = Duration::from_secs(2);
/// Time worker tasks get to unwind at session end before being aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Simulated thinking time before a scripted single reply.
pub const SCRIPT_THINK_PAUSE: Duration = Duration::from_secs(1);
/// Delay between a committed turn and the survey prompt.
pub const SURVEY_DELAY: Duration = Duration::from_secs(1);
const BLOCK_TICK: Duration = Duration::from_secs(1);
const SEARCH_RESULTS: usize = 3;

pub const BLUEPRINT_COMPLETE: &str = "Experiment blueprint complete.";
pub const HISTORY_ERASED: &str = "Chat history erased.";
pub const INPUT_RESUMED: &str = "You may type now.";
pub const FEATURES_LOCKED: &str = "Feature changes are disabled while an experiment blueprint is running.";

// =============================================================================
// Host-facing handle
// =============================================================================

/// Commands a host sends into a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// A participant message; `search` asks for a web-grounded reply.
    Message { text: String, search: bool },
    /// Mid-chat flag changes.
    ChangeFeatures(Vec<(FeatureFlag, bool)>),
    /// Participant or researcher ended the chat.
    End,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("session has ended")]
pub struct SessionClosed;

#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl SessionHandle {
    pub fn send_message(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(HostCommand::Message {
            text: text.into(),
            search: false,
        })
    }

    pub fn send_with_search(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(HostCommand::Message {
            text: text.into(),
            search: true,
        })
    }

    pub fn change_features(&self, changes: Vec<(FeatureFlag, bool)>) -> Result<(), SessionClosed> {
        self.send(HostCommand::ChangeFeatures(changes))
    }

    pub fn end(&self) -> Result<(), SessionClosed> {
        self.send(HostCommand::End)
    }

    pub fn send(&self, command: HostCommand) -> Result<(), SessionClosed> {
        self.commands.send(command).map_err(|_| SessionClosed)
    }
}

// =============================================================================
// Internal events
// =============================================================================

enum SessionEvent {
    /// Pre-send delay elapsed; generation may be requested.
    SendNow {
        turn: u64,
        prompt: String,
        search: bool,
    },
    Chunk {
        turn: u64,
        text: String,
    },
    TurnReady {
        turn: u64,
        result: Result<DispatchOutcome, OrchestratorError>,
    },
    ChoiceMade {
        request: ChoiceRequest,
        trial: CompletedTrial,
        outcome: Option<ChoiceOutcome>,
    },
    SurveyDone {
        turn: u64,
        answers: Option<SurveyAnswers>,
    },
    EraseHistory,
    AutoEnd(AutoEndReason),
    BlockTick,
    Close(String),
}

/// Turn between acceptance and commit.
struct InFlight {
    turn: u64,
    thinking: bool,
    streamed: bool,
    buffer: ChunkBuffer,
}

/// How a session finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub turns: u64,
    pub assistant_turns: u64,
    pub end_reason: String,
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct TurnOrchestrator {
    session_id: Uuid,
    config: FeatureConfiguration,
    session: SessionState,
    gateway: Arc<dyn ChatGateway>,
    model: ChatModel,
    host: Arc<dyn ChatHost>,
    trial_log: Arc<dyn TrialLogSink>,
    search: Option<Arc<dyn WebSearch>>,
    base_dir: PathBuf,
    script: Option<ScriptPlayer>,
    blueprint: Option<BlueprintRunner>,
    commands: mpsc::UnboundedReceiver<HostCommand>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    erase_timer: Option<AbortHandle>,
    in_flight: Option<InFlight>,
    closing: bool,
    end_reason: Option<String>,
}

impl TurnOrchestrator {
    pub fn new(
        config: FeatureConfiguration,
        gateway: Arc<dyn ChatGateway>,
        host: Arc<dyn ChatHost>,
    ) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            session_id: Uuid::new_v4(),
            config,
            session: SessionState::new(Instant::now()),
            gateway,
            model: ChatModel::default(),
            host,
            trial_log: Arc::new(NoopTrialLog),
            search: None,
            base_dir: PathBuf::new(),
            script: None,
            blueprint: None,
            commands,
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
            erase_timer: None,
            in_flight: None,
            closing: false,
            end_reason: None,
        };
        (
            orchestrator,
            SessionHandle {
                commands: commands_tx,
            },
        )
    }

    pub fn with_model(mut self, model: ChatModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_trial_log(mut self, log: Arc<dyn TrialLogSink>) -> Self {
        self.trial_log = log;
        self
    }

    pub fn with_web_search(mut self, search: Arc<dyn WebSearch>) -> Self {
        self.search = Some(search);
        self
    }

    /// Directory that script and blueprint file names resolve against.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn with_session_id(mut self, id: Uuid) -> Self {
        self.session_id = id;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Drive the session until it ends.
    pub async fn run(mut self) -> SessionSummary {
        tracing::info!(session = %self.session_id, "session started");
        self.session = SessionState::new(Instant::now());
        self.start();

        while self.end_reason.is_none() {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => self.end_session("host disconnected"),
                },
                Some(event) = self.events_rx.recv() => self.on_event(event),
            }
            self.workers.retain(|h| !h.is_finished());
        }

        self.shutdown_workers().await;
        let summary = SessionSummary {
            session_id: self.session_id,
            turns: self.session.turn_count(),
            assistant_turns: self.session.assistant_turns(),
            end_reason: self.end_reason.take().unwrap_or_default(),
        };
        tracing::info!(
            session = %summary.session_id,
            turns = summary.turns,
            reason = %summary.end_reason,
            "session ended"
        );
        summary
    }

    // -------------------------------------------------------------------------
    // Session start
    // -------------------------------------------------------------------------

    fn start(&mut self) {
        if self.config.is_enabled(FeatureFlag::CustomChatTitle) {
            self.host.set_title(&self.config.text(SettingKey::CustomChatTitle));
        }
        if self.config.is_enabled(FeatureFlag::AutoEndAfterTMin) {
            let after = secs(self.config.seconds(SettingKey::AutoEndMinutes) * 60.0);
            self.spawn_timer(after, SessionEvent::AutoEnd(AutoEndReason::TimeLimit));
        }
        self.arm_erase_timer(secs(self.config.seconds(SettingKey::EraseHistoryDelayS)));
        self.apply_text_size();

        if self.config.is_enabled(FeatureFlag::DynamicFeatureChanging) {
            self.start_blueprint();
        }
        self.enable_input();
    }

    fn start_blueprint(&mut self) {
        let path = self.resolve_path(&self.config.text(SettingKey::BlueprintFilename));
        let blueprint = match Blueprint::load(&path) {
            Ok(blueprint) => blueprint,
            Err(err) => {
                let err = OrchestratorError::from(err);
                tracing::error!(error = %err, "cannot start experiment blueprint");
                self.host.show_notice(&err.notice());
                return;
            }
        };
        tracing::info!(blocks = blueprint.len(), path = %path.display(), "loaded experiment blueprint");
        let mut runner = BlueprintRunner::new(blueprint);
        let step = runner.start();
        self.blueprint = Some(runner);
        self.on_blueprint_step(step);
    }

    fn on_blueprint_step(&mut self, step: BlueprintStep) {
        match step {
            BlueprintStep::Activated { block, .. } => self.activate_block(&block),
            BlueprintStep::Complete => {
                self.host.show_notice(BLUEPRINT_COMPLETE);
                self.end_session("experiment blueprint complete");
            }
        }
    }

    fn activate_block(&mut self, block: &ExperimentBlock) {
        for name in block.apply(&mut self.config) {
            tracing::warn!(feature = %name, block = %block.name, "blueprint contains unknown feature");
        }
        self.apply_text_size();
        self.arm_erase_timer(secs(self.config.seconds(SettingKey::EraseHistoryDelayS)));
        self.host.set_title(&block.name);
    }

    fn apply_text_size(&self) {
        if self.config.is_enabled(FeatureFlag::TextSizeChanger) {
            self.host.apply_text_size(self.config.int(SettingKey::TextSize));
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn on_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Message { text, search } => self.on_user_message(text, search),
            HostCommand::ChangeFeatures(changes) => self.on_feature_change(changes),
            HostCommand::End => self.end_session("ended by participant"),
        }
    }

    fn on_user_message(&mut self, text: String, search: bool) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        if self.closing {
            tracing::debug!("message rejected: session closing");
            return;
        }
        if self.session.blocking().is_active() {
            tracing::debug!("message rejected: input blocked");
            return;
        }
        if self.in_flight.is_some() {
            tracing::debug!("message rejected: turn in flight");
            return;
        }

        let turn = self.session.turn_count() + 1;
        self.trial_log.log_message(
            self.session_id,
            MessageLog {
                turn,
                role: Role::User,
                text: text.clone(),
                had_trial: false,
                selection: None,
            },
        );
        self.host.show_message(Role::User, &text, &Presentation::default());
        self.session.record_user(text.clone());
        self.host.set_input_enabled(false);
        self.in_flight = Some(InFlight {
            turn,
            thinking: false,
            streamed: false,
            buffer: ChunkBuffer::default(),
        });

        let search = search && self.config.is_enabled(FeatureFlag::WebSearch);
        match pre_send_delay(&self.config) {
            Some(delay) => {
                if search {
                    self.host.show_notice(&format!(
                        "Processing web search... ({}s delay)",
                        delay.as_secs_f64()
                    ));
                }
                self.spawn_timer(
                    delay,
                    SessionEvent::SendNow {
                        turn,
                        prompt: text,
                        search,
                    },
                );
            }
            None => self.begin_turn(turn, text, search),
        }
    }

    fn on_feature_change(&mut self, changes: Vec<(FeatureFlag, bool)>) {
        if self.blueprint.as_ref().is_some_and(BlueprintRunner::is_active) {
            tracing::warn!("mid-chat feature change rejected while blueprint is active");
            self.host.show_notice(FEATURES_LOCKED);
            return;
        }
        for (flag, enabled) in changes {
            tracing::info!(flag = %flag, enabled, "applying mid-chat feature change");
            self.config.set_flag(flag, enabled);
        }
    }

    // -------------------------------------------------------------------------
    // Turn generation
    // -------------------------------------------------------------------------

    fn begin_turn(&mut self, turn: u64, prompt: String, search: bool) {
        let decision = TimingPolicy::from_config(&self.config)
            .decide(self.session.started_at(), Instant::now());
        if decision.must_delay() {
            tracing::debug!(turn, "slow window: reveal deferred");
        }

        if !search && self.config.is_enabled(FeatureFlag::ScriptedResponses) {
            match self.next_script_step() {
                Some(ScriptStep::Normal { response }) => {
                    self.start_thinking();
                    self.spawn_reveal(turn, decision, SCRIPT_THINK_PAUSE, DispatchOutcome::Single(response));
                    return;
                }
                Some(ScriptStep::PairedTest {
                    response_a,
                    response_b,
                }) => {
                    self.start_thinking();
                    self.config
                        .install_alternate(alternate_features(self.config.settings()));
                    let trial = CompletedTrial {
                        primary: response_a,
                        alternate: response_b,
                    };
                    self.spawn_reveal(turn, decision, Duration::ZERO, DispatchOutcome::Trial(trial));
                    return;
                }
                Some(ScriptStep::Unrecognized { kind }) => {
                    tracing::warn!(kind = %kind, "unknown script step type; generating live");
                }
                None => {}
            }
        }

        let mode = if search {
            DispatchMode::Single
        } else {
            DispatchMode::select(&self.config, self.session.turn_count())
        };
        if mode.is_comparison() {
            self.config
                .install_alternate(alternate_features(self.config.settings()));
        }
        tracing::info!(turn, mode = mode.as_str(), "requesting generation");
        self.start_thinking();

        let stream = mode == DispatchMode::Single
            && self.config.is_enabled(FeatureFlag::Streaming)
            && !decision.must_delay();
        let req = TurnRequest {
            turn,
            history: self.session.history().to_vec(),
            prompt,
            primary: *self.config.live(),
            alternate: *self.config.features(Variant::Alternate),
            sources: Vec::new(),
            today: chrono::Local::now().date_naive(),
        };
        let search_backend = if search {
            if self.search.is_none() {
                tracing::warn!("web search requested but no search backend configured");
            }
            self.search.clone()
        } else {
            None
        };

        let dispatcher = ResponseDispatcher::new(
            Arc::clone(&self.gateway),
            self.model.clone(),
            self.session_id,
        );
        let events = self.events_tx.clone();
        self.spawn_worker(async move {
            let mut req = req;
            if let Some(backend) = search_backend {
                req.sources = backend.search(&req.prompt, SEARCH_RESULTS).await;
            }
            let result = if stream {
                dispatch_streaming(&dispatcher, req, turn, &events).await
            } else {
                dispatcher.dispatch(req, mode, None).await
            };
            let result = match result {
                Ok(outcome) => decision.maybe_delay_then(|| Ok(outcome)).await,
                Err(err) => Err(OrchestratorError::from(err)),
            };
            let _ = events.send(SessionEvent::TurnReady { turn, result });
        });
    }

    /// Reveal a pre-authored outcome after `pause` and the timing gate.
    fn spawn_reveal(
        &mut self,
        turn: u64,
        decision: TimingDecision,
        pause: Duration,
        outcome: DispatchOutcome,
    ) {
        let events = self.events_tx.clone();
        self.spawn_worker(async move {
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            let result = decision.maybe_delay_then(|| Ok(outcome)).await;
            let _ = events.send(SessionEvent::TurnReady { turn, result });
        });
    }

    fn next_script_step(&mut self) -> Option<ScriptStep> {
        if self.script.is_none() {
            let path = self.resolve_path(&self.config.text(SettingKey::ScriptedConvoFile));
            let (player, err) = ScriptPlayer::load_or_empty(&path);
            if let Some(err) = err {
                self.host.show_notice(&OrchestratorError::from(err).notice());
            }
            self.script = Some(player);
        }
        let step = self.script.as_mut()?.next_step()?;
        let placeholder = step.issue().filter(|_| !matches!(step, ScriptStep::Unrecognized { .. }));
        if let Some(issue) = placeholder {
            let err = OrchestratorError::Validation(issue);
            tracing::warn!(error = %err, "script step replaced by placeholder");
        }
        Some(step)
    }

    fn start_thinking(&mut self) {
        if !self.config.is_enabled(FeatureFlag::Thinking) {
            return;
        }
        if let Some(in_flight) = self.in_flight.as_mut() {
            if !in_flight.thinking {
                in_flight.thinking = true;
                self.host.set_thinking(true);
            }
        }
    }

    fn stop_thinking(&mut self) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            if in_flight.thinking {
                in_flight.thinking = false;
                self.host.set_thinking(false);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    fn on_event(&mut self, event: SessionEvent) {
        if self.end_reason.is_some() {
            return;
        }
        match event {
            SessionEvent::SendNow {
                turn,
                prompt,
                search,
            } => {
                if self.is_current(turn) {
                    self.begin_turn(turn, prompt, search);
                }
            }
            SessionEvent::Chunk { turn, text } => self.on_chunk(turn, &text),
            SessionEvent::TurnReady { turn, result } => {
                if self.is_current(turn) {
                    self.on_turn_ready(turn, result);
                }
            }
            SessionEvent::ChoiceMade {
                request,
                trial,
                outcome,
            } => {
                if self.is_current(request.turn) {
                    self.on_choice(request, trial, outcome);
                }
            }
            SessionEvent::SurveyDone { turn, answers } => {
                if let Some(answers) = answers {
                    self.trial_log
                        .log_survey(self.session_id, SurveyRecord { turn, answers });
                }
            }
            SessionEvent::EraseHistory => self.on_erase_history(),
            SessionEvent::AutoEnd(reason) => self.begin_auto_end(reason),
            SessionEvent::BlockTick => self.on_block_tick(),
            SessionEvent::Close(reason) => self.end_session(reason),
        }
    }

    fn is_current(&self, turn: u64) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.turn == turn)
    }

    fn on_chunk(&mut self, turn: u64, text: &str) {
        let Some(in_flight) = self.in_flight.as_mut().filter(|f| f.turn == turn) else {
            return;
        };
        if let Some(line) = in_flight.buffer.push(text) {
            in_flight.streamed = true;
            self.host.stream_chunk(&line);
        }
    }

    fn on_turn_ready(&mut self, turn: u64, result: Result<DispatchOutcome, OrchestratorError>) {
        self.stop_thinking();
        match result {
            Err(err) => {
                tracing::warn!(
                    turn,
                    code = err.code(),
                    request_id = err.request_id().unwrap_or(""),
                    error = %err,
                    "generation failed"
                );
                self.config.clear_alternate();
                self.in_flight = None;
                self.host.show_notice(&err.notice());
                self.enable_input();
            }
            Ok(DispatchOutcome::Single(text)) => {
                let mut streamed = false;
                if let Some(in_flight) = self.in_flight.as_mut() {
                    if in_flight.streamed {
                        if let Some(rest) = in_flight.buffer.flush() {
                            self.host.stream_chunk(&rest);
                        }
                        streamed = true;
                    }
                }
                let presentation = self.presentation(Variant::Primary, streamed);
                self.host.show_message(Role::Assistant, &text, &presentation);
                self.commit(text, None, false);
            }
            Ok(DispatchOutcome::Trial(trial)) => {
                let option = |variant: Variant| ChoiceOption {
                    variant,
                    text: trial.text(variant).to_string(),
                    presentation: self.presentation(variant, false),
                };
                let request = ChoiceRequest {
                    turn,
                    kind: trial.kind(),
                    options: [option(Variant::Primary), option(Variant::Alternate)],
                };
                self.config.clear_alternate();

                let host = Arc::clone(&self.host);
                let events = self.events_tx.clone();
                self.spawn_worker(async move {
                    let outcome = host.present_choice(request.clone()).await;
                    let _ = events.send(SessionEvent::ChoiceMade {
                        request,
                        trial,
                        outcome,
                    });
                });
            }
        }
    }

    fn on_choice(
        &mut self,
        request: ChoiceRequest,
        trial: CompletedTrial,
        outcome: Option<ChoiceOutcome>,
    ) {
        let Some(outcome) = outcome else {
            tracing::info!(turn = request.turn, "choice abandoned; committing primary");
            let primary = request.option(Variant::Primary);
            self.host
                .show_message(Role::Assistant, &primary.text, &primary.presentation);
            self.commit(trial.primary, None, false);
            return;
        };

        let chosen = outcome.chosen;
        self.trial_log.log_trial(
            self.session_id,
            TrialRecord {
                turn: request.turn,
                user_message: self.session.last_user_message().unwrap_or_default().to_string(),
                option_a: trial.primary.clone(),
                option_b: trial.alternate.clone(),
                selected: chosen,
                latency_ms: outcome.latency.as_millis() as u64,
                kind: request.kind,
            },
        );
        self.host
            .show_notice(&format!("You selected Option {}", chosen.label()));
        let option = request.option(chosen);
        self.host
            .show_message(Role::Assistant, &option.text, &option.presentation);
        let text = trial.text(chosen).to_string();
        self.commit(text, Some(chosen), true);
    }

    /// Commit the assistant reply, then run the post-turn checks.
    fn commit(&mut self, text: String, selection: Option<Variant>, had_trial: bool) {
        let turn = self.session.commit_assistant(text.clone(), selection);
        self.in_flight = None;
        self.trial_log.log_message(
            self.session_id,
            MessageLog {
                turn,
                role: Role::Assistant,
                text,
                had_trial,
                selection,
            },
        );

        let step = self
            .blueprint
            .as_mut()
            .and_then(BlueprintRunner::on_turn_committed);
        if let Some(step) = step {
            self.on_blueprint_step(step);
            if self.end_reason.is_some() {
                return;
            }
        }

        if self.session.survey_due(&self.config) {
            let host = Arc::clone(&self.host);
            let events = self.events_tx.clone();
            self.spawn_worker(async move {
                tokio::time::sleep(SURVEY_DELAY).await;
                let answers = host.run_survey(turn).await;
                let _ = events.send(SessionEvent::SurveyDone { turn, answers });
            });
        }

        if let Some(reason) = self.session.auto_end_reason(&self.config) {
            self.begin_auto_end(reason);
            return;
        }

        if self.session.should_block(&self.config) {
            let seconds = self.config.int(SettingKey::BlockDurationS).max(1) as u64;
            if self.session.blocking_mut().start(seconds) {
                tracing::info!(turn, seconds, "blocking input");
                self.host.show_notice(&format!("Blocking for {seconds}s..."));
                let events = self.events_tx.clone();
                self.spawn_worker(async move {
                    for _ in 0..seconds {
                        tokio::time::sleep(BLOCK_TICK).await;
                        let _ = events.send(SessionEvent::BlockTick);
                    }
                });
                return;
            }
        }

        self.enable_input();
    }

    fn on_block_tick(&mut self) {
        if !self.session.blocking().is_active() {
            return;
        }
        match self.session.blocking_mut().tick() {
            BlockTick::Remaining(n) => self.host.show_notice(&format!("{n}s...")),
            BlockTick::Finished => {
                self.host.show_notice(INPUT_RESUMED);
                self.enable_input();
            }
        }
    }

    fn on_erase_history(&mut self) {
        tracing::info!(erased = self.session.erase_count() + 1, "erasing chat history");
        self.session.clear_history();
        self.host.clear_transcript();
        self.host.show_notice(HISTORY_ERASED);
        if self.config.toggle(SettingKey::EraseHistoryRepeat) {
            let interval = secs(self.config.seconds(SettingKey::EraseHistoryIntervalS));
            self.arm_erase_timer(interval);
        } else {
            self.erase_timer = None;
        }
    }

    fn arm_erase_timer(&mut self, delay: Duration) {
        if let Some(timer) = self.erase_timer.take() {
            timer.abort();
        }
        if self.config.is_enabled(FeatureFlag::EraseHistory) {
            self.erase_timer = Some(self.spawn_timer(delay, SessionEvent::EraseHistory));
        }
    }

    // -------------------------------------------------------------------------
    // Ending
    // -------------------------------------------------------------------------

    /// Input stays off once the session is closing.
    fn enable_input(&self) {
        if !self.closing {
            self.host.set_input_enabled(true);
        }
    }

    fn begin_auto_end(&mut self, reason: AutoEndReason) {
        if self.closing {
            return;
        }
        self.closing = true;
        tracing::info!(reason = reason.label(), "auto-ending session");
        self.host.show_notice(&reason.notice());
        self.host.set_input_enabled(false);
        self.spawn_timer(AUTO_END_GRACE, SessionEvent::Close(reason.label().to_string()));
    }

    fn end_session(&mut self, reason: impl Into<String>) {
        if self.end_reason.is_some() {
            return;
        }
        let reason = reason.into();
        self.closing = true;
        self.cancel.cancel();
        self.host.set_input_enabled(false);
        self.host.session_ended(&reason);
        self.end_reason = Some(reason);
    }

    async fn shutdown_workers(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        join_all(workers.into_iter().map(|mut handle| async move {
            tokio::select! {
                _ = &mut handle => {}
                _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                    handle.abort();
                    if let Err(err) = handle.await {
                        tracing::debug!(?err, "worker aborted at shutdown");
                    }
                }
            }
        }))
        .await;
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Spawn work that stops at session end.
    fn spawn_worker<F>(&mut self, work: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = work => {}
            }
        });
        let abort = handle.abort_handle();
        self.workers.push(handle);
        abort
    }

    fn spawn_timer(&mut self, after: Duration, event: SessionEvent) -> AbortHandle {
        let events = self.events_tx.clone();
        self.spawn_worker(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        })
    }

    fn presentation(&self, variant: Variant, streamed: bool) -> Presentation {
        let settings = self.config.settings();
        let on = |flag| self.config.resolve_flag(flag, variant);
        Presentation {
            typewriter_ms: on(FeatureFlag::Typewriter)
                .then(|| settings.resolve_i64(SettingKey::TypewriterSpeedMs, variant).max(0) as u64),
            text_size: on(FeatureFlag::TextSizeChanger)
                .then(|| settings.resolve_i64(SettingKey::TextSize, variant)),
            thinking: on(FeatureFlag::Thinking),
            streamed,
        }
    }

    fn resolve_path(&self, name: &str) -> PathBuf {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.base_dir.join(candidate)
        }
    }
}

/// Single-mode dispatch that relays chunks to the loop before reporting the result.
async fn dispatch_streaming(
    dispatcher: &ResponseDispatcher,
    req: TurnRequest,
    turn: u64,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<DispatchOutcome, crate::gateway::ProviderError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let dispatch = dispatcher.dispatch(req, DispatchMode::Single, Some(tx));
    tokio::pin!(dispatch);

    let result = loop {
        tokio::select! {
            result = &mut dispatch => break result,
            Some(text) = rx.recv() => {
                let _ = events.send(SessionEvent::Chunk { turn, text });
            }
        }
    };
    while let Ok(text) = rx.try_recv() {
        let _ = events.send(SessionEvent::Chunk { turn, text });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureSet;
    use crate::settings::SettingsTable;

    struct NullGateway;

    #[async_trait::async_trait]
    impl ChatGateway for NullGateway {
        async fn chat(
            &self,
            _req: crate::gateway::ChatRequest,
        ) -> Result<crate::gateway::ChatResponse, crate::gateway::ProviderError> {
            Ok(crate::gateway::ChatResponse::text("ok"))
        }
    }

    struct SilentHost;

    #[async_trait::async_trait]
    impl ChatHost for SilentHost {
        fn show_message(&self, _: Role, _: &str, _: &Presentation) {}
        fn show_notice(&self, _: &str) {}
        fn set_input_enabled(&self, _: bool) {}
        fn set_thinking(&self, _: bool) {}
        fn stream_chunk(&self, _: &str) {}
        fn set_title(&self, _: &str) {}
        fn apply_text_size(&self, _: i64) {}
        async fn present_choice(&self, _: ChoiceRequest) -> Option<ChoiceOutcome> {
            None
        }
        async fn run_survey(&self, _: u64) -> Option<SurveyAnswers> {
            None
        }
        fn session_ended(&self, _: &str) {}
    }

    fn orchestrator(features: FeatureSet, settings: SettingsTable) -> TurnOrchestrator {
        let (orchestrator, _handle) = TurnOrchestrator::new(
            FeatureConfiguration::new(features, settings),
            Arc::new(NullGateway),
            Arc::new(SilentHost),
        );
        orchestrator
    }

    #[test]
    fn alternate_presentation_reads_b_settings() {
        let mut settings = SettingsTable::default();
        settings.insert("typewriter_speed_ms", 10);
        settings.insert("typewriter_speed_ms_b", 80);
        let mut orch = orchestrator(FeatureSet::all_disabled(), settings);
        orch.config
            .install_alternate(FeatureSet::all_disabled().with(FeatureFlag::Typewriter));

        assert_eq!(orch.presentation(Variant::Primary, false).typewriter_ms, None);
        assert_eq!(orch.presentation(Variant::Alternate, false).typewriter_ms, Some(80));
    }

    #[test]
    fn relative_paths_resolve_against_base_dir() {
        let orch = orchestrator(FeatureSet::all_disabled(), SettingsTable::default())
            .with_base_dir("/srv/study");
        assert_eq!(
            orch.resolve_path("script.json"),
            PathBuf::from("/srv/study/script.json")
        );
        assert_eq!(orch.resolve_path("/abs/plan.json"), PathBuf::from("/abs/plan.json"));
    }

    #[tokio::test]
    async fn dropped_handle_ends_session() {
        let (orch, handle) = TurnOrchestrator::new(
            FeatureConfiguration::default(),
            Arc::new(NullGateway),
            Arc::new(SilentHost),
        );
        drop(handle);
        let summary = orch.run().await;
        assert_eq!(summary.end_reason, "host disconnected");
        assert_eq!(summary.turns, 0);
    }
}
