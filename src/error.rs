//! Errors reported by the external collaborators (parser, LLM, TTS).
//!
//! The pipeline needs to tell a rejected credential apart from every other
//! failure, so collaborators return [NarratorError] instead of a bare
//! `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NarratorError {
    /// The provider rejected the API key. Fatal for the current run.
    #[error("invalid credential for {provider}")]
    InvalidCredential { provider: String },

    /// Any other collaborator failure. Recovered locally by the pipeline.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl NarratorError {
    pub fn invalid_credential(provider: impl Into<String>) -> Self {
        NarratorError::InvalidCredential {
            provider: provider.into(),
        }
    }

    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, NarratorError::InvalidCredential { .. })
    }
}

impl From<reqwest::Error> for NarratorError {
    fn from(e: reqwest::Error) -> Self {
        NarratorError::Failed(e.into())
    }
}

impl From<serde_json::Error> for NarratorError {
    fn from(e: serde_json::Error) -> Self {
        NarratorError::Failed(e.into())
    }
}

pub type NarratorResult<T> = std::result::Result<T, NarratorError>;
