//! Error kinds for the work-order execution engine.
//!
//! Mirrors `src-tauri/src/error.rs`'s `TandemError`: one `thiserror` enum,
//! `#[from]` conversions at the boundaries, and a crate-local `Result` alias.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("tool failure: {0}")]
    ToolFailure(String),

    #[error("model failure: {0}")]
    ModelFailure(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// The closed-set error kind name, as used in chat-facing failure summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::PreconditionFailed(_) => "PreconditionFailed",
            Self::ContractViolation(_) => "ContractViolation",
            Self::BudgetExhausted(_) => "BudgetExhausted",
            Self::ToolFailure(_) => "ToolFailure",
            Self::ModelFailure(_) => "ModelFailure",
            Self::Cancelled(_) => "Cancelled",
            Self::Timeout(_) => "Timeout",
            Self::Internal(_) => "Internal",
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Internal(format!("serialization error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
