// =============================================================================
// Error kinds for the Meridian session engine
// =============================================================================
//
// Every fallible public operation returns a `CoreError` carrying one of the
// failure classes below. Worker loops catch errors at the top of their loop,
// log them with structured context, and continue — unless `is_fatal()` is
// true (an invariant violation inside SessionData), in which case the
// coordinator is signalled to begin teardown.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the engine.
pub type CoreResult<T> = Result<T, CoreError>;

/// The failure classes of the engine.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Malformed configuration, unsupported interval, no common base
    /// interval. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A symbol failed one of the pre-session validation checks. Non-fatal
    /// unless every configured symbol fails.
    #[error("validation failed for {symbol}: {reason}")]
    Validation { symbol: String, reason: String },

    /// A provisioning step failed. The current provisioning run is aborted;
    /// pre-session the symbol is dropped, mid-session the request is
    /// rejected and rolled back.
    #[error("provisioning step '{step}' failed for {symbol}: {reason}")]
    Provisioning {
        symbol: String,
        step: String,
        reason: String,
    },

    /// A data-level problem (missing series, unloadable range). Non-fatal.
    #[error("data error: {0}")]
    Data(String),

    /// The requested symbol is not present in the session.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// A fetch or provisioning budget was exceeded.
    #[error("timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    /// Out-of-order insertion, duplicate timestamp, derived-before-base.
    /// The offending bar is dropped; repeated violations indicate a broken
    /// upstream and are treated as fatal by the coordinator.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl CoreError {
    /// Whether this error should trigger session teardown when it escapes a
    /// worker loop. Only internal invariant violations qualify; everything
    /// else is logged and survived.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn provisioning(
        symbol: impl Into<String>,
        step: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Provisioning {
            symbol: symbol.into(),
            step: step.into(),
            reason: reason.into(),
        }
    }
}

impl From<crate::types::IntervalParseError> for CoreError {
    fn from(err: crate::types::IntervalParseError) -> Self {
        Self::Config(err.to_string())
    }
}
