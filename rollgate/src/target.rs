//! Request inputs: time frames and resolved target groups.
//!
//! Both types are produced by the metric resolver that sits in front of this
//! crate (glob and tag expansion) and are consumed read-only by the planner
//! and the fetch orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use crate::rules::RuleSet;

/// The time window and resolution requested for one or more targets.
///
/// Targets that share an identical frame are answered together and keyed by
/// it in the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeFrame {
    /// Start of the window, epoch seconds.
    pub from: u32,
    /// End of the window, epoch seconds (`until >= from`).
    pub until: u32,
    /// Upper bound on points per series the client wants back; 0 means no
    /// limit.
    pub max_data_points: u32,
}

impl TimeFrame {
    /// Creates a time frame.
    pub fn new(from: u32, until: u32, max_data_points: u32) -> Self {
        Self {
            from,
            until,
            max_data_points,
        }
    }

    /// Length of the window in seconds.
    pub fn duration(&self) -> u32 {
        self.until.saturating_sub(self.from)
    }

    /// Seconds between `from` and `now`, used to select retention tiers.
    pub fn age(&self, now: u32) -> u32 {
        now.saturating_sub(self.from)
    }
}

/// One display name a metric is shown under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    /// Name shown to the client.
    pub display_name: String,
    /// Target expression that produced this name.
    pub target: String,
}

/// The resolved metrics for one requested target expression.
#[derive(Debug, Clone)]
pub struct TargetGroup {
    /// Concrete metric names, in resolution order and without duplicates.
    pub metrics: Vec<String>,
    /// Display aliases per metric name.
    pub aliases: HashMap<String, Vec<Alias>>,
    /// Storage table holding the points.
    pub table: String,
    /// The table stores paths with their dot-separated nodes reversed.
    pub is_reversed: bool,
    /// Match retention patterns against the reversed path instead of the
    /// display path. Only meaningful when `is_reversed` is set.
    pub match_reversed_names: bool,
    /// Retention rules for the table.
    pub rules: Arc<RuleSet>,
}

impl TargetGroup {
    /// Creates a group for `table` with no metrics.
    pub fn new(table: impl Into<String>, rules: Arc<RuleSet>) -> Self {
        Self {
            metrics: Vec::new(),
            aliases: HashMap::new(),
            table: table.into(),
            is_reversed: false,
            match_reversed_names: false,
            rules,
        }
    }

    /// Adds a resolved `(metric, display name, target)` triple.
    ///
    /// The metric is appended once; every call adds another alias.
    pub fn push(
        &mut self,
        metric: impl Into<String>,
        display_name: impl Into<String>,
        target: impl Into<String>,
    ) {
        let metric = metric.into();
        if !self.aliases.contains_key(&metric) {
            self.metrics.push(metric.clone());
        }
        self.aliases.entry(metric).or_default().push(Alias {
            display_name: display_name.into(),
            target: target.into(),
        });
    }

    /// Builds a group from resolver output.
    pub fn from_triples<I, M, D, T>(
        table: impl Into<String>,
        rules: Arc<RuleSet>,
        triples: I,
    ) -> Self
    where
        I: IntoIterator<Item = (M, D, T)>,
        M: Into<String>,
        D: Into<String>,
        T: Into<String>,
    {
        let mut group = Self::new(table, rules);
        for (metric, display, target) in triples {
            group.push(metric, display, target);
        }
        group
    }

    /// Marks the table as storing reversed paths.
    #[must_use]
    pub fn reversed(mut self, match_reversed_names: bool) -> Self {
        self.is_reversed = true;
        self.match_reversed_names = match_reversed_names;
        self
    }

    /// Number of distinct metrics.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Returns `true` if nothing was resolved.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Path of `metric` as stored in the table.
    pub fn storage_path(&self, metric: &str) -> String {
        if self.is_reversed {
            reverse_path(metric)
        } else {
            metric.to_string()
        }
    }

    /// Name the retention rules should be matched against.
    pub fn rule_name<'a>(&self, metric: &'a str) -> std::borrow::Cow<'a, str> {
        if self.is_reversed && self.match_reversed_names {
            std::borrow::Cow::Owned(reverse_path(metric))
        } else {
            std::borrow::Cow::Borrowed(metric)
        }
    }
}

/// Reverses the dot-separated nodes of a path.
///
/// A tagged path (`name?tag=value`) keeps its tag suffix in place; only the
/// name part is reversed.
///
/// # Examples
///
/// ```rust
/// use rollgate::target::reverse_path;
///
/// assert_eq!(reverse_path("a.b.c"), "c.b.a");
/// assert_eq!(reverse_path("cpu.load?host=a"), "load.cpu?host=a");
/// assert_eq!(reverse_path("single"), "single");
/// ```
pub fn reverse_path(path: &str) -> String {
    let (name, tags) = match path.find('?') {
        Some(pos) => path.split_at(pos),
        None => (path, ""),
    };
    let mut out = String::with_capacity(path.len());
    for (i, node) in name.rsplit('.').enumerate() {
        if i > 0 {
            out.push('.');
        }
        out.push_str(node);
    }
    out.push_str(tags);
    out
}
