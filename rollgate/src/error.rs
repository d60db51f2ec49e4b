//! Error types for the rollgate read-path engine.
//!
//! Errors are split by the phase that raises them so callers can tell apart
//! the conditions they react to differently: configuration that must abort a
//! load, upstream data that cannot be trusted, capacity or deadline
//! exhaustion that may be retried, and policy rejections.

use std::time::Duration;

use thiserror::Error;

/// The main error type for all rollgate operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error compiling retention rules.
    #[error("rule error: {0}")]
    Rule(#[from] RuleError),

    /// Error decoding a storage response.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Error while fetching data for a request.
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
}

/// Errors raised while reading configuration files.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Read {
        /// The path that could not be read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected schema.
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// The path that failed to parse.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration value is out of range.
    #[error("invalid config: {reason}")]
    Invalid {
        /// What was wrong with the value.
        reason: String,
    },
}

/// Errors raised while compiling a retention rule set.
///
/// Every variant is fatal for the load: a rule set is never partially applied.
#[derive(Error, Debug)]
pub enum RuleError {
    /// A pattern's name regex does not compile.
    #[error("pattern {index}: invalid regexp '{pattern}': {source}")]
    InvalidRegex {
        /// Position of the pattern in the rule list.
        index: usize,
        /// The offending expression.
        pattern: String,
        /// The regex compiler error.
        #[source]
        source: regex::Error,
    },

    /// A pattern names an aggregation function that does not exist.
    #[error("pattern {index}: unknown aggregation function '{name}'")]
    UnknownFunction {
        /// Position of the pattern in the rule list (`usize::MAX` for the default).
        index: usize,
        /// The unknown name.
        name: String,
    },

    /// Retention thresholds are not strictly ascending by age.
    #[error("pattern {index}: retention ages must be strictly ascending")]
    UnorderedRetention {
        /// Position of the pattern in the rule list.
        index: usize,
    },

    /// A retention entry could not be parsed or has a zero precision.
    #[error("invalid retention '{value}': {reason}")]
    InvalidRetention {
        /// The offending text or entry.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors raised by the binary row decoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The response cannot be decoded any further.
    ///
    /// Raised on array length mismatches, over-long varints, or a row that is
    /// still incomplete once the input has ended.
    #[error("malformed response row: {reason} (row bytes: {})", hex_preview(.row))]
    Malformed {
        /// What was wrong.
        reason: String,
        /// Raw bytes of the offending row, from its first byte.
        row: Vec<u8>,
    },
}

/// Errors raised by the common-step barrier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Not every registered participant contributed before the timeout.
    #[error("common step unresolved after {waited:?}: {missing} participant(s) did not report")]
    Timeout {
        /// How long the caller waited.
        waited: Duration,
        /// Participants that never contributed.
        missing: usize,
    },

    /// The least common multiple of the reported steps does not fit in a step.
    #[error("common step overflows: lcm({step}, {contribution}) exceeds u32::MAX")]
    Overflow {
        /// Step folded so far.
        step: u32,
        /// Step that could not be folded in.
        contribution: u32,
    },
}

/// Errors raised by a storage transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The request could not be sent or the connection failed.
    #[error("storage request failed: {reason}")]
    Request {
        /// Description of the failure.
        reason: String,
    },

    /// Storage answered with a non-success status.
    #[error("storage returned status {status}: {body}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// Reading the response body failed midway.
    #[error("failed to read storage response: {reason}")]
    Body {
        /// Description of the failure.
        reason: String,
    },

    /// Error from the HTTP client.
    #[cfg(feature = "http-transport")]
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised while fetching a multi-target request.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The request asks for more metrics than allowed.
    #[error("request expands to {requested} metrics, limit is {limit}")]
    MetricsLimitExceeded {
        /// Metrics the request resolved to.
        requested: usize,
        /// Configured per-request limit.
        limit: usize,
    },

    /// No admission slot became free before the request deadline.
    #[error("no query slot available after {waited:?}")]
    AdmissionTimeout {
        /// How long the caller waited for a slot.
        waited: Duration,
    },

    /// A storage query did not finish within its timeout.
    #[error("query on '{table}' timed out after {timeout:?}")]
    QueryTimeout {
        /// Table the query ran against.
        table: String,
        /// The applied timeout.
        timeout: Duration,
    },

    /// The request deadline passed.
    #[error("request deadline exceeded")]
    Deadline,

    /// The common step could not be resolved.
    #[error(transparent)]
    Step(#[from] StepError),

    /// The storage transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The storage response was malformed.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A fetch task panicked or was cancelled.
    #[error("fetch task failed: {reason}")]
    TaskFailed {
        /// Description of the failure.
        reason: String,
    },
}

/// Coarse classification of a [`FetchError`] for the reply layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient; the same request may succeed later.
    Retry,
    /// Storage returned data that could not be decoded.
    MalformedUpstream,
    /// Capacity or time budget ran out.
    ResourceExhausted,
    /// The request was refused by policy.
    PolicyRejected,
}

impl FetchError {
    /// Returns the reply-layer classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MetricsLimitExceeded { .. } => ErrorKind::PolicyRejected,
            Self::AdmissionTimeout { .. } | Self::Deadline => ErrorKind::ResourceExhausted,
            Self::Decode(_) => ErrorKind::MalformedUpstream,
            Self::QueryTimeout { .. }
            | Self::Step(_)
            | Self::Transport(_)
            | Self::TaskFailed { .. } => ErrorKind::Retry,
        }
    }
}

/// Renders up to 32 leading bytes of a row as hex for diagnostics.
fn hex_preview(row: &[u8]) -> String {
    const MAX: usize = 32;
    let mut out = String::with_capacity(MAX * 2 + 16);
    for byte in row.iter().take(MAX) {
        out.push_str(&format!("{byte:02x}"));
    }
    if row.len() > MAX {
        out.push_str(&format!("... ({} bytes)", row.len()));
    }
    out
}

/// Type alias for `Result<T, GatewayError>`.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_display_includes_preview() {
        let err = DecodeError::Malformed {
            reason: "times/values length mismatch".to_string(),
            row: vec![0x01, 0x61, 0xff],
        };
        let text = err.to_string();
        assert!(text.contains("mismatch"));
        assert!(text.contains("0161ff"));
    }

    #[test]
    fn test_hex_preview_truncates() {
        let row = vec![0xab; 40];
        let preview = hex_preview(&row);
        assert!(preview.ends_with("... (40 bytes)"));
        assert!(preview.starts_with("abab"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            FetchError::MetricsLimitExceeded {
                requested: 10,
                limit: 5
            }
            .kind(),
            ErrorKind::PolicyRejected
        );
        assert_eq!(FetchError::Deadline.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(
            FetchError::Step(StepError::Timeout {
                waited: Duration::from_secs(2),
                missing: 1
            })
            .kind(),
            ErrorKind::Retry
        );
        assert_eq!(
            FetchError::Step(StepError::Overflow {
                step: 65_521,
                contribution: 65_519
            })
            .kind(),
            ErrorKind::Retry
        );
        assert_eq!(
            FetchError::Decode(DecodeError::Malformed {
                reason: String::new(),
                row: Vec::new()
            })
            .kind(),
            ErrorKind::MalformedUpstream
        );
    }
}
