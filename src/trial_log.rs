//! Trial event logging at the sink boundary.
//!
//! The orchestrator reports messages, comparison trials, and survey answers
//! here and never waits on the outcome. `JsonlTrialLog` writes one JSON object
//! per line from a background thread.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{mpsc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::features::Variant;
use crate::gateway::Role;
use crate::host::{SurveyAnswers, TrialKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageLog {
    pub turn: u64,
    pub role: Role,
    pub text: String,
    /// The message was committed from a comparison trial.
    pub had_trial: bool,
    /// Side chosen in that trial, when one was chosen.
    pub selection: Option<Variant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub turn: u64,
    pub user_message: String,
    pub option_a: String,
    pub option_b: String,
    pub selected: Variant,
    pub latency_ms: u64,
    pub kind: TrialKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyRecord {
    pub turn: u64,
    pub answers: SurveyAnswers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrialEvent {
    Message(MessageLog),
    Trial(TrialRecord),
    Survey(SurveyRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialLogEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    #[serde(flatten)]
    pub event: TrialEvent,
}

impl TrialLogEntry {
    pub fn now(session_id: Uuid, event: TrialEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id,
            event,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrialLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trial log channel closed")]
    Closed,
    #[error("trial log worker failed: {0}")]
    Join(String),
}

pub trait TrialLogSink: Send + Sync {
    fn record(&self, entry: TrialLogEntry) -> Result<(), TrialLogError>;

    fn log_message(&self, session_id: Uuid, message: MessageLog) {
        self.submit(TrialLogEntry::now(session_id, TrialEvent::Message(message)));
    }

    fn log_trial(&self, session_id: Uuid, trial: TrialRecord) {
        self.submit(TrialLogEntry::now(session_id, TrialEvent::Trial(trial)));
    }

    fn log_survey(&self, session_id: Uuid, survey: SurveyRecord) {
        self.submit(TrialLogEntry::now(session_id, TrialEvent::Survey(survey)));
    }

    /// Record and swallow failures; logging never interrupts a session.
    fn submit(&self, entry: TrialLogEntry) {
        if let Err(err) = self.record(entry) {
            tracing::warn!(error = %err, "dropping trial log entry");
        }
    }
}

pub struct NoopTrialLog;

impl TrialLogSink for NoopTrialLog {
    fn record(&self, _entry: TrialLogEntry) -> Result<(), TrialLogError> {
        Ok(())
    }
}

/// Keeps entries in memory; handy for hosts that export at session end.
#[derive(Default)]
pub struct MemoryTrialLog {
    entries: Mutex<Vec<TrialLogEntry>>,
}

impl MemoryTrialLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TrialLogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl TrialLogSink for MemoryTrialLog {
    fn record(&self, entry: TrialLogEntry) -> Result<(), TrialLogError> {
        self.entries
            .lock()
            .map_err(|_| TrialLogError::Serde("trial log mutex poisoned".to_string()))?
            .push(entry);
        Ok(())
    }
}

#[derive(Clone)]
pub struct JsonlTrialLog {
    sender: mpsc::Sender<TrialLogEntry>,
}

pub struct TrialLogWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TrialLogError>>>,
}

impl TrialLogWorker {
    /// Wait for every queued entry to be written. Drop all senders first.
    pub fn join(mut self) -> Result<(), TrialLogError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TrialLogError::Join("trial log worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTrialLog {
    /// Append to `path`, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, TrialLogWorker), TrialLogError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (sender, receiver) = mpsc::channel::<TrialLogEntry>();
        let handle = std::thread::spawn(move || write_log_loop(file, receiver));
        Ok((
            Self { sender },
            TrialLogWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TrialLogSink for JsonlTrialLog {
    fn record(&self, entry: TrialLogEntry) -> Result<(), TrialLogError> {
        self.sender.send(entry).map_err(|_| TrialLogError::Closed)
    }
}

fn write_log_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<TrialLogEntry>,
) -> Result<(), TrialLogError> {
    let mut writer = BufWriter::new(file);
    for entry in receiver {
        let line =
            serde_json::to_string(&entry).map_err(|e| TrialLogError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
        // Entries must survive a crashed session.
        writer.flush()?;
    }
    writer.flush()?;
    Ok(())
}
