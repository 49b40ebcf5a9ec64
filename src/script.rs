//! Scripted conversations replayed in place of live generation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MISSING_RESPONSE: &str = "SCRIPT ERROR: Missing 'response'";
pub const MISSING_RESPONSE_A: &str = "SCRIPT ERROR: Missing 'response_a'";
pub const MISSING_RESPONSE_B: &str = "SCRIPT ERROR: Missing 'response_b'";

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script file not found: {0}")]
    NotFound(PathBuf),
    #[error("io error reading script {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("script {path} is not a JSON list: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// One pre-authored turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Normal { response: String },
    PairedTest { response_a: String, response_b: String },
    /// Step with a `type` this player does not know; the turn goes live.
    Unrecognized { kind: String },
}

/// Wire shape of a step; missing text becomes a visible placeholder.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawStep {
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    response_a: Option<String>,
    #[serde(default)]
    response_b: Option<String>,
}

fn default_kind() -> String {
    "normal".to_string()
}

impl ScriptStep {
    fn from_value(value: Value) -> Self {
        let raw: RawStep = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "malformed script entry");
                return ScriptStep::Unrecognized {
                    kind: "<malformed>".to_string(),
                };
            }
        };
        match raw.kind.as_str() {
            "normal" => ScriptStep::Normal {
                response: raw.response.unwrap_or_else(|| MISSING_RESPONSE.to_string()),
            },
            "ab_test" => ScriptStep::PairedTest {
                response_a: raw.response_a.unwrap_or_else(|| MISSING_RESPONSE_A.to_string()),
                response_b: raw.response_b.unwrap_or_else(|| MISSING_RESPONSE_B.to_string()),
            },
            _ => ScriptStep::Unrecognized { kind: raw.kind },
        }
    }

    /// Placeholder or unknown-type problems, for `validate-script`.
    pub fn issue(&self) -> Option<String> {
        match self {
            ScriptStep::Normal { response } if response == MISSING_RESPONSE => {
                Some("missing 'response'".to_string())
            }
            ScriptStep::PairedTest {
                response_a,
                response_b,
            } => {
                let mut missing = Vec::new();
                if response_a == MISSING_RESPONSE_A {
                    missing.push("'response_a'");
                }
                if response_b == MISSING_RESPONSE_B {
                    missing.push("'response_b'");
                }
                (!missing.is_empty()).then(|| format!("missing {}", missing.join(" and ")))
            }
            ScriptStep::Unrecognized { kind } => Some(format!("unknown step type '{kind}'")),
            ScriptStep::Normal { .. } => None,
        }
    }
}

/// Parse a script document from JSON text.
pub fn parse_script(raw: &str, path: &Path) -> Result<Vec<ScriptStep>, ScriptError> {
    let entries: Vec<Value> = serde_json::from_str(raw).map_err(|source| ScriptError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(entries.into_iter().map(ScriptStep::from_value).collect())
}

pub fn load_script(path: impl AsRef<Path>) -> Result<Vec<ScriptStep>, ScriptError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ScriptError::NotFound(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_script(&raw, path)
}

/// Cursor over a loaded script. Once past the end it stays exhausted.
#[derive(Debug, Clone, Default)]
pub struct ScriptPlayer {
    steps: Vec<ScriptStep>,
    cursor: usize,
}

impl ScriptPlayer {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps, cursor: 0 }
    }

    /// Load a script; on failure play nothing and hand back the error for a notice.
    pub fn load_or_empty(path: impl AsRef<Path>) -> (Self, Option<ScriptError>) {
        match load_script(path) {
            Ok(steps) => {
                tracing::info!(steps = steps.len(), "loaded conversation script");
                (Self::new(steps), None)
            }
            Err(err) => {
                tracing::warn!(error = %err, "script unavailable; scripted mode will do nothing");
                (Self::default(), Some(err))
            }
        }
    }

    /// Step at the cursor, advancing it.
    pub fn next_step(&mut self) -> Option<ScriptStep> {
        let step = self.steps.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(step)
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.steps.len()
    }
}
