// =============================================================================
// Feed Errors — failure taxonomy shared by adapters, sync and the live feed
// =============================================================================
//
// Recoverability is decided at the lowest layer with enough context:
//   - adapters decide on payload shape (InvalidExchangeResponse,
//     MalformedCandle),
//   - the live controller decides on transport failures (reconnect),
//   - only configuration errors are fatal, and only at startup.
// =============================================================================

use thiserror::Error;

/// Errors produced by the candle feed engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    /// The historical payload is missing its expected envelope or the
    /// exchange rejected the request.
    #[error("invalid {exchange} response: {reason}")]
    InvalidExchangeResponse { exchange: String, reason: String },

    /// A single record carries a field that cannot be turned into a number or
    /// a timestamp.
    #[error("malformed candle field {field}: '{value}'")]
    MalformedCandle { field: &'static str, value: String },

    /// Push-connection failure (connect, send, read, idle timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP collaborator failure (DNS, TLS, timeout, body read).
    #[error("network error: {0}")]
    Network(String),

    #[error("unsupported exchange: {0}")]
    UnsupportedExchange(String),

    #[error("unsupported timeframe: {0}")]
    UnsupportedTimeframe(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FeedError {
    pub fn invalid_response(exchange: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidExchangeResponse {
            exchange: exchange.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(field: &'static str, value: impl ToString) -> Self {
        Self::MalformedCandle {
            field,
            value: value.to_string(),
        }
    }

    /// `true` for errors that must stop the process before any network
    /// activity happens.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedExchange(_) | Self::UnsupportedTimeframe(_) | Self::InvalidConfig(_)
        )
    }
}

/// Truncate a raw payload for log output.
pub fn snippet(raw: &str) -> &str {
    const MAX: usize = 200;
    if raw.len() <= MAX {
        return raw;
    }
    let mut end = MAX;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    &raw[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_errors_are_fatal() {
        assert!(FeedError::UnsupportedExchange("kraken".into()).is_fatal());
        assert!(FeedError::UnsupportedTimeframe("2m".into()).is_fatal());
        assert!(FeedError::InvalidConfig("bars = 0".into()).is_fatal());
        assert!(!FeedError::Transport("reset".into()).is_fatal());
        assert!(!FeedError::invalid_response("bybit", "missing result").is_fatal());
        assert!(!FeedError::malformed("open", "abc").is_fatal());
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let raw = "é".repeat(150);
        let cut = snippet(&raw);
        assert!(cut.len() <= 200);
        assert!(raw.starts_with(cut));
        assert_eq!(snippet("short"), "short");
    }
}
