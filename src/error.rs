//! Conditions that end a request abnormally.
//!
//! Execution faults never show up here: the retry loop absorbs them and only
//! reports `RetryBudgetExhausted` once the budget is spent.

use crate::data::DataError;
use crate::llm::SynthesisError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("the code generation service failed: {0}. Check ANTHROPIC_API_KEY and network access, then try again")]
    Synthesis(#[from] SynthesisError),

    #[error("gave up after {attempts} failed attempts. Last error:\n{last_error}\nTry rephrasing the request or /revert to an earlier version")]
    RetryBudgetExhausted { attempts: u32, last_error: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("empty message: type a request")]
    EmptyMessage,

    #[error("there is no code yet: describe an analysis first")]
    NoCurrentArtifact,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("market data unavailable: {0}")]
    Data(#[from] DataError),
}

impl OrchestratorError {
    /// True for failures that came from the generation service.
    pub fn is_synthesis(&self) -> bool {
        matches!(self, OrchestratorError::Synthesis(_))
    }
}
