//! Gateway configuration.
//!
//! Configuration is a JSON document with two sections:
//!
//! ```json
//! {
//!   "rules": {
//!     "default_precision": 60,
//!     "default_function": "average",
//!     "patterns": [
//!       { "regexp": "\\.count$", "function": "sum", "retention": "0:10,1d:60" },
//!       { "retention": [ { "age": 0, "precision": 60 } ] }
//!     ]
//!   },
//!   "fetch": {
//!     "aggregated": true,
//!     "max_metrics_per_request": 10000,
//!     "max_concurrent_queries": 32,
//!     "range_limits": [
//!       { "max_range": 86400, "max_concurrent": 16, "query_timeout": 10.0 }
//!     ],
//!     "default_query_timeout": 60.0
//!   }
//! }
//! ```
//!
//! Durations are written as seconds (fractions allowed). Every field has a
//! default, so `{}` is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::rules::{RuleSet, RulesConfig};
use crate::step::DEFAULT_STEP_TIMEOUT;

/// Concurrency and timeout limits for queries up to a given time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeLimit {
    /// Largest query range (`until - from`) this bucket covers.
    #[serde(with = "duration_serde")]
    pub max_range: Duration,

    /// Queries of this bucket allowed in flight at once; 0 is unlimited.
    #[serde(default)]
    pub max_concurrent: usize,

    /// Timeout of one storage round trip in this bucket.
    #[serde(with = "duration_serde")]
    pub query_timeout: Duration,
}

/// Fetch orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Let storage downsample (aggregated mode).
    pub aggregated: bool,

    /// Metrics one request may expand to; 0 is unlimited.
    pub max_metrics_per_request: usize,

    /// Storage queries in flight across all requests; 0 is unlimited.
    pub max_concurrent_queries: usize,

    /// Storage queries in flight within one request; 0 is unlimited.
    pub max_queries_per_request: usize,

    /// Per-range limits, ascending by `max_range`. Ranges beyond the last
    /// bucket use the defaults.
    pub range_limits: Vec<RangeLimit>,

    /// Query timeout when no range bucket applies.
    #[serde(with = "duration_serde")]
    pub default_query_timeout: Duration,

    /// Budget for the secondary source; its points are skipped on expiry.
    #[serde(with = "duration_serde")]
    pub secondary_timeout: Duration,

    /// How long target groups wait for each other's step contribution.
    #[serde(with = "duration_serde")]
    pub step_resolve_timeout: Duration,

    /// Deadline for a whole request.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            aggregated: false,
            max_metrics_per_request: 0,
            max_concurrent_queries: 0,
            max_queries_per_request: 0,
            range_limits: Vec::new(),
            default_query_timeout: Duration::from_secs(60),
            secondary_timeout: Duration::from_secs(1),
            step_resolve_timeout: DEFAULT_STEP_TIMEOUT,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl FetchConfig {
    /// Validates limits and timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a timeout is zero or the range
    /// buckets are not strictly ascending.
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("default_query_timeout", self.default_query_timeout),
            ("secondary_timeout", self.secondary_timeout),
            ("step_resolve_timeout", self.step_resolve_timeout),
            ("request_timeout", self.request_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(invalid(format!("{name} cannot be zero")));
            }
        }

        for (i, limit) in self.range_limits.iter().enumerate() {
            if limit.query_timeout.is_zero() {
                return Err(invalid(format!("range_limits[{i}].query_timeout cannot be zero")));
            }
            if i > 0 && limit.max_range <= self.range_limits[i - 1].max_range {
                return Err(invalid(format!(
                    "range_limits must be ascending by max_range ({:?} after {:?})",
                    limit.max_range,
                    self.range_limits[i - 1].max_range
                )));
            }
        }
        Ok(())
    }

    /// The first bucket covering a range of `range_secs` seconds.
    pub fn range_limit(&self, range_secs: u32) -> Option<&RangeLimit> {
        let range = Duration::from_secs(u64::from(range_secs));
        self.range_limits.iter().find(|l| range <= l.max_range)
    }

    /// Query timeout for a range of `range_secs` seconds.
    pub fn query_timeout(&self, range_secs: u32) -> Duration {
        self.range_limit(range_secs)
            .map_or(self.default_query_timeout, |l| l.query_timeout)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Retention rules.
    pub rules: RulesConfig,
    /// Fetch orchestration.
    pub fetch: FetchConfig,
}

impl GatewayConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and any error of
    /// [`validate`](Self::validate).
    pub fn from_json(text: &str) -> Result<Self> {
        Self::parse(text, "<inline>")
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`from_json`](Self::from_json).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    fn parse(text: &str, origin: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates both sections, compiling the rules once.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`](crate::error::RuleError) if the rules do not
    /// compile and [`ConfigError::Invalid`] for bad fetch settings.
    pub fn validate(&self) -> Result<()> {
        RuleSet::compile(&self.rules)?;
        self.fetch.validate()
    }
}

fn invalid(reason: String) -> crate::error::GatewayError {
    ConfigError::Invalid { reason }.into()
}

/// Serde support for Duration fields.
///
/// Durations are serialized as total seconds (f64) for human readability
/// in JSON configuration files.
mod duration_serde {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds)
            .map_err(|e| D::Error::custom(format!("invalid duration {seconds}: {e}")))
    }
}
