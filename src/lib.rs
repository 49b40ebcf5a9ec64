#![forbid(unsafe_code)]

//! # trialchat
//!
//! Turn orchestration for controlled-experiment chat sessions.
//!
//! A participant talks to an assistant whose behavior is governed by a set of
//! experimental feature flags and numeric settings. On selected turns the
//! orchestrator generates two candidate replies (a primary and an alternate
//! configuration) and asks the participant to pick one; the choice, its
//! latency, and both texts are logged as a comparison trial.
//!
//! Sessions may be fully live, scripted from a JSON file, or driven by an
//! experiment blueprint that swaps configurations every few turns. Timing
//! manipulations (pre-send delay, cyclic slowdown windows, blocking
//! countdowns, history erasure, auto-end) all run inside the single session
//! loop in [`orchestrator`].

pub mod blueprint;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod features;
pub mod gateway;
pub mod host;
pub mod orchestrator;
pub mod prompts;
pub mod script;
pub mod session;
pub mod settings;
pub mod timing;
pub mod trial_log;

pub use blueprint::{Blueprint, BlueprintError, BlueprintRunner, ExperimentBlock};
pub use config::{ConfigError, ExperimentConfig, FeatureConfiguration};
pub use dispatch::{DispatchMode, DispatchOutcome, ResponseDispatcher};
pub use error::OrchestratorError;
pub use features::{FeatureFlag, FeatureSet, Variant};
pub use gateway::{Attribution, ChatGateway, ChatModel, ProviderError, ProviderGateway};
pub use host::{ChatHost, ChoiceOutcome, ChoiceRequest, Presentation, SearchResult, WebSearch};
pub use orchestrator::{HostCommand, SessionClosed, SessionHandle, SessionSummary, TurnOrchestrator};
pub use script::{ScriptPlayer, ScriptStep};
pub use settings::{SettingKey, SettingsTable};
pub use trial_log::{JsonlTrialLog, MemoryTrialLog, TrialLogSink, TrialLogWorker};
