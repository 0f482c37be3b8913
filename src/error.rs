// =============================================================================
// Pipeline errors
// =============================================================================
//
// None of these are fatal to the host process. Connection errors feed the
// reconnect loop, malformed messages are dropped, and backfill failures
// degrade to an empty history. SeedAfterTicks is a usage error and is
// returned to the caller synchronously.
// =============================================================================

use thiserror::Error;

/// All errors generated by the live candle pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("reconnect attempts exhausted after {attempts} attempts")]
    ConnectionExhausted { attempts: u32 },

    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("backfill for {instrument} failed: {reason}")]
    BackfillFetch { instrument: String, reason: String },

    #[error("backfill for {instrument} timed out after {timeout_ms} ms")]
    BackfillTimeout { instrument: String, timeout_ms: u64 },

    #[error("cannot seed {instrument}: live ticks have already been aggregated")]
    SeedAfterTicks { instrument: String },
}

impl PipelineError {
    /// Whether the reconnect loop should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }

    pub(crate) fn backfill(instrument: &str, reason: impl Into<String>) -> Self {
        Self::BackfillFetch {
            instrument: instrument.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PipelineError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(value.to_string())
    }
}
