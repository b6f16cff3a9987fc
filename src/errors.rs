use std::io;

use thiserror::Error;

use crate::budget::RequestKind;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{kind} request budget exceeded: {used} >= {cap}")]
    BudgetExceeded {
        kind: RequestKind,
        used: u64,
        cap: u64,
    },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response from {url}: {message}")]
    MalformedResponse { url: String, message: String },
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Only budget exhaustion is recoverable inside best-effort stages.
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. })
    }
}
