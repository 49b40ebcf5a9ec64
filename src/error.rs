//! Session-level error taxonomy.
//!
//! Subsystem errors are converted here at the orchestrator boundary. None of
//! them ends a session: each becomes a one-line notice and input is re-enabled.

use crate::blueprint::BlueprintError;
use crate::gateway::ProviderError;
use crate::script::ScriptError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Blueprint or script missing or malformed; the session degrades.
    #[error("{0}")]
    Configuration(String),

    /// Completion failed; the turn is abandoned without retry.
    #[error("{0}")]
    Generation(#[from] ProviderError),

    /// A malformed entry was replaced by a placeholder.
    #[error("{0}")]
    Validation(String),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Generation(err) => err.code(),
            Self::Validation(_) => "validation",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Generation(err) => err.request_id(),
            _ => None,
        }
    }

    /// Inline text shown to the participant.
    pub fn notice(&self) -> String {
        format!("ERROR: {self}")
    }
}

impl From<BlueprintError> for OrchestratorError {
    fn from(err: BlueprintError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<ScriptError> for OrchestratorError {
    fn from(err: ScriptError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn blueprint_errors_become_configuration_notices() {
        let err: OrchestratorError = BlueprintError::NotFound(PathBuf::from("plan.json")).into();
        assert_eq!(err.code(), "configuration");
        assert_eq!(err.notice(), "ERROR: Blueprint file 'plan.json' not found.");
    }

    #[test]
    fn generation_keeps_provider_code() {
        let err: OrchestratorError = ProviderError::provider("openai", "HTTP 500", true).into();
        assert_eq!(err.code(), "provider_error");
        assert!(err.notice().starts_with("ERROR: "));
    }
}
