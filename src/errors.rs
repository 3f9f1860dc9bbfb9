use thiserror::Error;

/// Typed error hierarchy for the trading engine.
///
/// Library code returns these; the binary and config loader wrap with `anyhow::Context`.
#[derive(Error, Debug)]
pub enum TraderError {
    // -- Exchange -----------------------------------------------------------
    #[error("exchange error: {reason}")]
    Exchange { reason: String },

    #[error("order for {symbol} failed: {reason}")]
    OrderExecution { symbol: String, reason: String },

    // -- External services --------------------------------------------------
    #[error("advisory service error: {reason}")]
    Advisory { reason: String },

    #[error("activity service error: {reason}")]
    Activity { reason: String },

    // -- State --------------------------------------------------------------
    #[error("inconsistent state for {symbol}: {reason}")]
    InconsistentState { symbol: String, reason: String },

    // -- Storage ------------------------------------------------------------
    #[error("persistence error: {reason}")]
    Persistence { reason: String },

    // -- Configuration ------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    // -- Forwarded errors ---------------------------------------------------
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl TraderError {
    pub fn exchange(reason: impl Into<String>) -> Self {
        TraderError::Exchange {
            reason: reason.into(),
        }
    }

    pub fn advisory(reason: impl Into<String>) -> Self {
        TraderError::Advisory {
            reason: reason.into(),
        }
    }

    pub fn activity(reason: impl Into<String>) -> Self {
        TraderError::Activity {
            reason: reason.into(),
        }
    }

    pub fn persistence(reason: impl Into<String>) -> Self {
        TraderError::Persistence {
            reason: reason.into(),
        }
    }

    /// Transport-level failures worth an immediate retry.
    ///
    /// Order failures are never retried and state/config problems won't fix themselves.
    pub fn is_transient(&self) -> bool {
        match self {
            TraderError::Exchange { .. }
            | TraderError::Advisory { .. }
            | TraderError::Activity { .. } => true,
            TraderError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            TraderError::Io(_) => true,
            TraderError::OrderExecution { .. }
            | TraderError::InconsistentState { .. }
            | TraderError::Persistence { .. }
            | TraderError::Config(_)
            | TraderError::Json(_)
            | TraderError::Csv(_) => false,
        }
    }
}

pub type TraderResult<T> = std::result::Result<T, TraderError>;
