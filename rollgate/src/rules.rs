//! Retention rules: which precision and aggregation apply to a metric.
//!
//! A rule set is an ordered list of patterns. Each pattern optionally carries
//! a name regex, an aggregation function and a retention ladder of
//! `(age, precision)` steps. Patterns are compiled once at load time; a rule
//! set that fails to compile is rejected as a whole.
//!
//! # Lookup
//!
//! Patterns are scanned in declared order. The first matching pattern that
//! names a function decides the function, and the first matching pattern with
//! a retention step at or below the query age decides the precision. Anything
//! left unresolved falls back to the rule set defaults.
//!
//! # Example
//!
//! ```rust
//! use rollgate::aggregation::AggregationFn;
//! use rollgate::rules::{PatternConfig, RetentionSpec, RuleSet, RulesConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RulesConfig {
//!     default_precision: 60,
//!     default_function: "average".to_string(),
//!     patterns: vec![PatternConfig {
//!         regexp: Some(r"\.count$".to_string()),
//!         function: Some("sum".to_string()),
//!         retention: RetentionSpec::Compact("0:10,1d:60".to_string()),
//!     }],
//! };
//! let rules = RuleSet::compile(&config)?;
//!
//! let hit = rules.lookup("requests.count", 7200);
//! assert_eq!((hit.precision, hit.function), (10, AggregationFn::Sum));
//!
//! let miss = rules.lookup("cpu.load", 7200);
//! assert_eq!((miss.precision, miss.function), (60, AggregationFn::Average));
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::aggregation::AggregationFn;
use crate::error::{Result, RuleError};

/// Precision used when no pattern resolves one.
pub const DEFAULT_PRECISION: u32 = 60;

/// One step of a retention ladder.
///
/// From `age` seconds in the past onwards, data is kept at `precision`
/// seconds per point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Retention {
    /// Minimum query age, in seconds, at which this step applies.
    pub age: u32,
    /// Bucket width, in seconds.
    pub precision: u32,
}

impl Retention {
    /// Creates a retention step.
    pub fn new(age: u32, precision: u32) -> Self {
        Self { age, precision }
    }

    /// Parses a compact retention ladder such as `"0:60,1d:300,30d:3600"`.
    ///
    /// Each entry is `age:precision`; both sides accept the unit suffixes
    /// `s`, `m`, `h`, `d`, `w` and `y`, and bare numbers are seconds.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidRetention`] on a malformed entry.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rollgate::rules::Retention;
    ///
    /// let ladder = Retention::parse_list("0:1m, 1d:5m").unwrap();
    /// assert_eq!(ladder, vec![Retention::new(0, 60), Retention::new(86_400, 300)]);
    /// ```
    pub fn parse_list(text: &str) -> Result<Vec<Self>> {
        text.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| -> Result<Self> {
                let (age, precision) =
                    entry
                        .split_once(':')
                        .ok_or_else(|| RuleError::InvalidRetention {
                            value: entry.to_string(),
                            reason: "expected 'age:precision'".to_string(),
                        })?;
                Ok(Self::new(parse_seconds(age)?, parse_seconds(precision)?))
            })
            .collect()
    }
}

/// Parses a duration like `90`, `15m` or `2d` into seconds.
///
/// # Errors
///
/// Returns [`RuleError::InvalidRetention`] for unknown units, bad numbers or
/// values that overflow `u32`.
pub fn parse_seconds(text: &str) -> Result<u32> {
    let text = text.trim();
    let invalid = |reason: &str| RuleError::InvalidRetention {
        value: text.to_string(),
        reason: reason.to_string(),
    };

    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    if digits.is_empty() {
        return Err(invalid("missing number").into());
    }
    let number: u64 = digits.parse().map_err(|_| invalid("bad number"))?;

    let multiplier: u64 = match unit {
        "" | "s" => 1,
        "m" | "min" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        "y" => 31_536_000,
        _ => return Err(invalid("unknown unit, use s, m, h, d, w or y").into()),
    };

    number
        .checked_mul(multiplier)
        .and_then(|secs| u32::try_from(secs).ok())
        .ok_or_else(|| invalid("value too large").into())
}

/// Retention ladder as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetentionSpec {
    /// Explicit list of steps.
    List(Vec<Retention>),
    /// Compact `age:precision,...` string.
    Compact(String),
}

impl Default for RetentionSpec {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl RetentionSpec {
    /// Expands the retention into a list of steps, as written (unsorted).
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidRetention`] if a compact string is malformed.
    pub fn to_steps(&self) -> Result<Vec<Retention>> {
        match self {
            Self::List(steps) => Ok(steps.clone()),
            Self::Compact(text) => Retention::parse_list(text),
        }
    }
}

/// Uncompiled pattern as read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Regex matched against the metric name; absent matches every metric.
    #[serde(default)]
    pub regexp: Option<String>,
    /// Aggregation function name.
    #[serde(default)]
    pub function: Option<String>,
    /// Retention ladder, ascending by age.
    #[serde(default)]
    pub retention: RetentionSpec,
}

fn default_precision() -> u32 {
    DEFAULT_PRECISION
}

fn default_function() -> String {
    AggregationFn::default().name().to_string()
}

/// Uncompiled rule set as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Precision used when no pattern resolves one.
    #[serde(default = "default_precision")]
    pub default_precision: u32,
    /// Function used when no pattern resolves one.
    #[serde(default = "default_function")]
    pub default_function: String,
    /// Patterns in lookup order.
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            default_precision: default_precision(),
            default_function: default_function(),
            patterns: Vec::new(),
        }
    }
}

/// A compiled retention pattern.
#[derive(Debug, Clone)]
pub struct RetentionPattern {
    regexp: Option<Regex>,
    function: Option<AggregationFn>,
    retention: Vec<Retention>,
}

impl RetentionPattern {
    /// Creates a pattern, validating its retention ladder.
    ///
    /// # Errors
    ///
    /// - [`RuleError::UnorderedRetention`] if ages are not strictly ascending
    /// - [`RuleError::InvalidRetention`] if any precision is zero
    pub fn new(
        regexp: Option<Regex>,
        function: Option<AggregationFn>,
        retention: Vec<Retention>,
    ) -> Result<Self> {
        Self::validated(0, regexp, function, retention)
    }

    fn validated(
        index: usize,
        regexp: Option<Regex>,
        function: Option<AggregationFn>,
        retention: Vec<Retention>,
    ) -> Result<Self> {
        if let Some(step) = retention.iter().find(|r| r.precision == 0) {
            return Err(RuleError::InvalidRetention {
                value: format!("{}:{}", step.age, step.precision),
                reason: format!("pattern {index}: precision must be > 0"),
            }
            .into());
        }
        if retention.windows(2).any(|w| w[0].age >= w[1].age) {
            return Err(RuleError::UnorderedRetention { index }.into());
        }
        Ok(Self {
            regexp,
            function,
            retention,
        })
    }

    /// Compiles a configured pattern.
    fn compile(index: usize, config: &PatternConfig) -> Result<Self> {
        let regexp = config
            .regexp
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| RuleError::InvalidRegex {
                    index,
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose()?;

        let function = config
            .function
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(|name| {
                AggregationFn::from_name(name).ok_or_else(|| RuleError::UnknownFunction {
                    index,
                    name: name.to_string(),
                })
            })
            .transpose()?;

        Self::validated(index, regexp, function, config.retention.to_steps()?)
    }

    /// Returns `true` if this pattern applies to `metric`.
    pub fn matches(&self, metric: &str) -> bool {
        self.regexp.as_ref().is_none_or(|re| re.is_match(metric))
    }

    /// Precision of the last step whose age is `<= age`, if any.
    pub fn precision_at(&self, age: u32) -> Option<u32> {
        let idx = self.retention.partition_point(|r| r.age <= age);
        idx.checked_sub(1).map(|i| self.retention[i].precision)
    }

    /// The aggregation function this pattern assigns, if any.
    pub fn function(&self) -> Option<AggregationFn> {
        self.function
    }

    /// The retention ladder.
    pub fn retention(&self) -> &[Retention] {
        &self.retention
    }
}

/// Outcome of a rule lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMatch {
    /// Bucket width in seconds; never zero.
    pub precision: u32,
    /// Aggregation function for the bucket.
    pub function: AggregationFn,
}

/// A compiled, immutable set of retention patterns.
#[derive(Debug, Clone)]
pub struct RuleSet {
    patterns: Vec<RetentionPattern>,
    default_precision: u32,
    default_function: AggregationFn,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            default_precision: DEFAULT_PRECISION,
            default_function: AggregationFn::default(),
        }
    }
}

impl RuleSet {
    /// Creates a rule set from compiled patterns.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidRetention`] if `default_precision` is zero.
    pub fn new(
        patterns: Vec<RetentionPattern>,
        default_precision: u32,
        default_function: AggregationFn,
    ) -> Result<Self> {
        if default_precision == 0 {
            return Err(RuleError::InvalidRetention {
                value: "0".to_string(),
                reason: "default precision must be > 0".to_string(),
            }
            .into());
        }
        Ok(Self {
            patterns,
            default_precision,
            default_function,
        })
    }

    /// Compiles a rule set from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`] if any pattern has an invalid regex, names an
    /// unknown function or has a malformed retention ladder. Nothing of the
    /// configuration is usable in that case.
    pub fn compile(config: &RulesConfig) -> Result<Self> {
        let default_function =
            AggregationFn::from_name(&config.default_function).ok_or_else(|| {
                RuleError::UnknownFunction {
                    index: usize::MAX,
                    name: config.default_function.clone(),
                }
            })?;

        let patterns = config
            .patterns
            .iter()
            .enumerate()
            .map(|(index, pattern)| RetentionPattern::compile(index, pattern))
            .collect::<Result<Vec<_>>>()?;

        Self::new(patterns, config.default_precision, default_function)
    }

    /// Resolves precision and aggregation function for `metric` at `age`
    /// seconds.
    ///
    /// Total and deterministic: every input yields exactly one answer.
    pub fn lookup(&self, metric: &str, age: u32) -> RuleMatch {
        let mut precision = None;
        let mut function = None;

        for pattern in &self.patterns {
            if precision.is_some() && function.is_some() {
                break;
            }
            if !pattern.matches(metric) {
                continue;
            }
            if function.is_none() {
                function = pattern.function;
            }
            if precision.is_none() {
                precision = pattern.precision_at(age);
            }
        }

        RuleMatch {
            precision: precision.unwrap_or(self.default_precision),
            function: function.unwrap_or(self.default_function),
        }
    }

    /// Precision half of [`lookup`](Self::lookup).
    pub fn lookup_precision(&self, metric: &str, age: u32) -> u32 {
        self.lookup(metric, age).precision
    }

    /// Function half of [`lookup`](Self::lookup).
    pub fn lookup_function(&self, metric: &str) -> AggregationFn {
        self.lookup(metric, 0).function
    }

    /// Largest precision over `metrics` at `age`, or the default precision
    /// for an empty list.
    pub fn max_precision<'a, I>(&self, metrics: I, age: u32) -> u32
    where
        I: IntoIterator<Item = &'a str>,
    {
        metrics
            .into_iter()
            .map(|m| self.lookup(m, age).precision)
            .max()
            .unwrap_or(self.default_precision)
    }

    /// Fallback precision.
    pub fn default_precision(&self) -> u32 {
        self.default_precision
    }

    /// Fallback aggregation function.
    pub fn default_function(&self) -> AggregationFn {
        self.default_function
    }

    /// The compiled patterns, in lookup order.
    pub fn patterns(&self) -> &[RetentionPattern] {
        &self.patterns
    }
}

/// A rule set that can be swapped at runtime.
///
/// Readers take a cheap `Arc` snapshot and keep using it for a whole request,
/// so a reload never changes rules mid-request.
#[derive(Debug, Default)]
pub struct SharedRules {
    current: RwLock<Arc<RuleSet>>,
}

impl SharedRules {
    /// Wraps an initial rule set.
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    /// Returns the current rule set.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.current.read())
    }

    /// Compiles `config` and installs it.
    ///
    /// On error the previous rule set stays in place.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`] if the configuration does not compile.
    pub fn reload(&self, config: &RulesConfig) -> Result<()> {
        let compiled = RuleSet::compile(config)?;
        *self.current.write() = Arc::new(compiled);
        tracing::info!(patterns = config.patterns.len(), "retention rules reloaded");
        Ok(())
    }
}
