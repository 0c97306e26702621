use std::fmt;
use std::time::Duration;

/// Lifecycle step that can be bounded by the transition timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStage {
    Generate,
    Execute,
}

impl fmt::Display for TransitionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionStage::Generate => write!(f, "generate"),
            TransitionStage::Execute => write!(f, "execute"),
        }
    }
}

/// Errors surfaced by the reload runtime
#[derive(Debug, thiserror::Error)]
pub enum HmrError {
    /// The loaded artifact is not a hot module
    #[error("Invalid hot module export for import {id}: {reason}")]
    ContractViolation { id: String, reason: String },

    /// A module was assembled without one of its required parts
    #[error("Incomplete hot module: {0}")]
    IncompleteModule(&'static str),

    #[error("Error in import of {id}: {source}")]
    LoadFailure {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error generating persistent values for {id}: {source}")]
    Generate {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error cleaning up persistent values for {id}: {source}")]
    PersistCleanup {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error cleaning up module {id}: {source}")]
    RunnerClean {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error running module {id}: {source}")]
    Execute {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Module {id} timed out during {stage} after {after:?}")]
    Timeout {
        id: String,
        stage: TransitionStage,
        after: Duration,
    },

    #[error("Module {0} is not imported")]
    NotImported(String),

    #[error("Unable to watch {id}: {source}")]
    Watch {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl HmrError {
    /// Id of the unit the error concerns, if any
    pub fn id(&self) -> Option<&str> {
        match self {
            HmrError::ContractViolation { id, .. }
            | HmrError::LoadFailure { id, .. }
            | HmrError::Generate { id, .. }
            | HmrError::PersistCleanup { id, .. }
            | HmrError::RunnerClean { id, .. }
            | HmrError::Execute { id, .. }
            | HmrError::Timeout { id, .. }
            | HmrError::Watch { id, .. } => Some(id),
            HmrError::NotImported(id) => Some(id),
            HmrError::IncompleteModule(_) => None,
        }
    }

    /// Whether the failure happened inside a lifecycle transition
    pub fn is_transition_failure(&self) -> bool {
        matches!(
            self,
            HmrError::Generate { .. }
                | HmrError::PersistCleanup { .. }
                | HmrError::RunnerClean { .. }
                | HmrError::Execute { .. }
                | HmrError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HmrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_ids() {
        let err = HmrError::Execute {
            id: "./a".to_string(),
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.id(), Some("./a"));
        assert!(err.is_transition_failure());
        assert_eq!(err.to_string(), "Error running module ./a: boom");

        let err = HmrError::IncompleteModule("runner");
        assert_eq!(err.id(), None);
        assert!(!err.is_transition_failure());
    }

    #[test]
    fn test_timeout_display() {
        let err = HmrError::Timeout {
            id: "m".to_string(),
            stage: TransitionStage::Generate,
            after: Duration::from_millis(50),
        };
        assert_eq!(err.to_string(), "Module m timed out during generate after 50ms");
    }
}
