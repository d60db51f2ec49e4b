//! Query planning.
//!
//! Turns one `(TimeFrame, TargetGroup)` pair into the storage queries that
//! answer it. Two modes exist:
//!
//! - **Unaggregated**: storage returns raw points for every metric in one
//!   query; bounds are aligned to the largest metric step so no metric's last
//!   bucket is cut short. Consolidation happens locally.
//! - **Aggregated**: storage downsamples. Metrics are split by aggregation
//!   function (one query each) and every group of the request is aligned to a
//!   common step resolved across all target groups, see
//!   [`CommonStepResolver`](crate::step::CommonStepResolver).
//!
//! Both modes align bounds with the same helpers: [`floor_to`] for `from` and
//! [`ceil_to`] for the inclusive `until`.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::aggregation::AggregationFn;
use crate::decode::RowShape;
use crate::error::StepError;
use crate::rules::RuleMatch;
use crate::target::{TargetGroup, TimeFrame};

/// Name of the external table carrying the metric list.
pub const METRICS_TABLE: &str = "metrics_list";

/// Largest multiple of `step` not above `value`. A zero step is treated as 1.
///
/// # Examples
///
/// ```rust
/// use rollgate::plan::{ceil_to, floor_to};
///
/// assert_eq!(floor_to(125, 60), 120);
/// assert_eq!(ceil_to(125, 60), 180);
/// assert_eq!(ceil_to(120, 60), 120);
/// ```
pub fn floor_to(value: u32, step: u32) -> u32 {
    let step = step.max(1);
    value - value % step
}

/// Smallest multiple of `step` not below `value`, saturating at the largest
/// representable multiple. A zero step is treated as 1.
pub fn ceil_to(value: u32, step: u32) -> u32 {
    let step = step.max(1);
    match value % step {
        0 => value,
        rem => value
            .checked_add(step - rem)
            .unwrap_or_else(|| floor_to(u32::MAX, step)),
    }
}

/// Greatest common divisor.
pub fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Least common multiple, with 0 meaning "no opinion": `lcm(0, x) == x`.
///
/// Returns `None` if the result does not fit in a `u32`.
pub fn lcm(a: u32, b: u32) -> Option<u32> {
    if a == 0 || b == 0 {
        return Some(a.max(b));
    }
    (a / gcd(a, b)).checked_mul(b)
}

/// Which side performs the downsampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanMode {
    /// Storage aggregates into buckets of the common step.
    Aggregated,
    /// Storage returns raw points.
    Unaggregated,
}

impl PlanMode {
    /// Row layout of responses in this mode.
    pub fn shape(self) -> RowShape {
        match self {
            Self::Aggregated => RowShape::Aggregated,
            Self::Unaggregated => RowShape::Unaggregated,
        }
    }
}

/// Out-of-band table sent along with a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTable {
    /// Table name referenced by the query text.
    pub name: String,
    /// Column declaration, e.g. `Path String`.
    pub structure: String,
    /// Tab-separated body, one row per line.
    pub body: String,
}

impl ExternalTable {
    /// A one-column table listing metric paths.
    pub fn metric_list<'a, I>(paths: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut body = String::new();
        for path in paths {
            push_escaped(&mut body, path);
            body.push('\n');
        }
        Self {
            name: METRICS_TABLE.to_string(),
            structure: "Path String".to_string(),
            body,
        }
    }

    /// Number of rows in the body.
    pub fn rows(&self) -> usize {
        self.body.lines().count()
    }
}

/// Appends `field` with TabSeparated escaping.
fn push_escaped(out: &mut String, field: &str) {
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

/// One storage round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageQuery {
    /// Table the query reads.
    pub table: String,
    /// Query text.
    pub text: String,
    /// Metric list referenced by the query.
    pub external: ExternalTable,
    /// Aligned lower bound, inclusive.
    pub from: u32,
    /// Aligned upper bound, inclusive.
    pub until: u32,
    /// Bucket width; raw points carry the largest metric step here.
    pub step: u32,
    /// Row layout of the response.
    pub shape: RowShape,
    /// Aggregate pushed into storage, aggregated mode only.
    pub function: Option<AggregationFn>,
}

/// Metrics that share an aggregation function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationGroup {
    /// The shared function.
    pub function: AggregationFn,
    /// Display names, in resolution order.
    pub metrics: Vec<String>,
    /// Largest precision among the metrics.
    pub step: u32,
}

/// Resolved rules for every metric of one target group.
#[derive(Debug, Clone, Default)]
pub struct MetricGrouping {
    /// `(metric, rule)` in resolution order.
    pub rules: Vec<(String, RuleMatch)>,
    /// Metrics split by function, in order of first appearance.
    pub groups: Vec<AggregationGroup>,
}

impl MetricGrouping {
    /// Resolves rules for `group` at the age of `time_frame`.
    pub fn resolve(group: &TargetGroup, time_frame: &TimeFrame, now: u32) -> Self {
        let age = time_frame.age(now);
        let mut grouping = Self::default();

        for metric in &group.metrics {
            let rule = group.rules.lookup(&group.rule_name(metric), age);
            grouping.rules.push((metric.clone(), rule));

            match grouping
                .groups
                .iter_mut()
                .find(|g| g.function == rule.function)
            {
                Some(g) => {
                    g.metrics.push(metric.clone());
                    g.step = g.step.max(rule.precision);
                }
                None => grouping.groups.push(AggregationGroup {
                    function: rule.function,
                    metrics: vec![metric.clone()],
                    step: rule.precision,
                }),
            }
        }
        grouping
    }

    /// Largest step of any metric, at least 1.
    pub fn max_step(&self) -> u32 {
        self.groups.iter().map(|g| g.step).max().unwrap_or(1).max(1)
    }

    /// LCM of the group steps; 0 for an empty grouping.
    ///
    /// This is what a target group contributes to the common step.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Overflow`] if the LCM does not fit in a step.
    pub fn step_contribution(&self) -> Result<u32, StepError> {
        self.groups.iter().try_fold(0, |acc, g| {
            lcm(acc, g.step).ok_or(StepError::Overflow {
                step: acc,
                contribution: g.step,
            })
        })
    }

    /// Returns `true` if no metric was resolved.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Everything needed to fetch and consolidate one target group.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// The planned mode.
    pub mode: PlanMode,
    /// Per-metric rules and function groups.
    pub grouping: MetricGrouping,
    /// Final step: the aligned common step (aggregated) or the largest
    /// metric step (unaggregated).
    pub step: u32,
    /// Aligned lower bound.
    pub from: u32,
    /// Aligned upper bound, inclusive.
    pub until: u32,
    /// Storage round trips; empty when the group has no metrics.
    pub queries: Vec<StorageQuery>,
}

impl QueryPlan {
    fn empty(mode: PlanMode, time_frame: &TimeFrame) -> Self {
        Self {
            mode,
            grouping: MetricGrouping::default(),
            step: 1,
            from: time_frame.from,
            until: time_frame.until,
            queries: Vec::new(),
        }
    }

    /// Step to roll up with: the shared step in aggregated mode, 0 (use each
    /// metric's own step) otherwise.
    pub fn rollup_step(&self) -> u32 {
        match self.mode {
            PlanMode::Aggregated => self.step,
            PlanMode::Unaggregated => 0,
        }
    }
}

/// Final aggregated step for a frame, given the resolved common step.
///
/// The result is the common step, coarsened to a multiple of itself when the
/// frame would otherwise yield more than `max_data_points` buckets.
///
/// # Examples
///
/// ```rust
/// use rollgate::plan::final_step;
/// use rollgate::target::TimeFrame;
///
/// assert_eq!(final_step(&TimeFrame::new(0, 900, 100), 300), 300);
/// assert_eq!(final_step(&TimeFrame::new(0, 86_400, 100), 60), 900);
/// ```
pub fn final_step(time_frame: &TimeFrame, common_step: u32) -> u32 {
    let common = common_step.max(1);
    if time_frame.max_data_points == 0 {
        return common;
    }
    let per_point = time_frame.duration().div_ceil(time_frame.max_data_points);
    common.max(ceil_to(per_point, common))
}

/// Plans a raw-points fetch: one query for the whole group.
pub fn plan_unaggregated(group: &TargetGroup, time_frame: &TimeFrame, now: u32) -> QueryPlan {
    let grouping = MetricGrouping::resolve(group, time_frame, now);
    if grouping.is_empty() {
        return QueryPlan::empty(PlanMode::Unaggregated, time_frame);
    }

    let step = grouping.max_step();
    let from = floor_to(time_frame.from, step);
    let until = ceil_to(time_frame.until, step);
    let paths: Vec<String> = group.metrics.iter().map(|m| group.storage_path(m)).collect();
    let external = ExternalTable::metric_list(paths.iter().map(String::as_str));

    let query = StorageQuery {
        table: group.table.clone(),
        text: unaggregated_query(&group.table, from, until),
        external,
        from,
        until,
        step,
        shape: RowShape::Unaggregated,
        function: None,
    };

    QueryPlan {
        mode: PlanMode::Unaggregated,
        grouping,
        step,
        from,
        until,
        queries: vec![query],
    }
}

/// Plans a storage-aggregated fetch: one query per function group.
///
/// `common_step` is the resolved request-wide step (0 falls back to this
/// group's own contribution).
///
/// # Errors
///
/// Returns [`StepError::Overflow`] if the fallback step does not fit.
pub fn plan_aggregated(
    group: &TargetGroup,
    time_frame: &TimeFrame,
    now: u32,
    common_step: u32,
) -> Result<QueryPlan, StepError> {
    let grouping = MetricGrouping::resolve(group, time_frame, now);
    plan_aggregated_with(group, time_frame, grouping, common_step)
}

/// Like [`plan_aggregated`], reusing an already resolved grouping.
///
/// # Errors
///
/// Returns [`StepError::Overflow`] if the fallback step does not fit.
pub fn plan_aggregated_with(
    group: &TargetGroup,
    time_frame: &TimeFrame,
    grouping: MetricGrouping,
    common_step: u32,
) -> Result<QueryPlan, StepError> {
    if grouping.is_empty() {
        return Ok(QueryPlan::empty(PlanMode::Aggregated, time_frame));
    }

    let common = if common_step > 0 {
        common_step
    } else {
        grouping.step_contribution()?
    };
    let step = final_step(time_frame, common);
    let from = floor_to(time_frame.from, step);
    let until = ceil_to(time_frame.until, step);

    let queries = grouping
        .groups
        .iter()
        .map(|g| {
            let paths: Vec<String> = g.metrics.iter().map(|m| group.storage_path(m)).collect();
            StorageQuery {
                table: group.table.clone(),
                text: aggregated_query(&group.table, g.function, step, from, until),
                external: ExternalTable::metric_list(paths.iter().map(String::as_str)),
                from,
                until,
                step,
                shape: RowShape::Aggregated,
                function: Some(g.function),
            }
        })
        .collect();

    Ok(QueryPlan {
        mode: PlanMode::Aggregated,
        grouping,
        step,
        from,
        until,
        queries,
    })
}

fn unaggregated_query(table: &str, from: u32, until: u32) -> String {
    let mut q = String::with_capacity(256);
    let _ = write!(
        q,
        "SELECT Path, groupArray(Time), groupArray(Value), groupArray(Timestamp) \
         FROM {table} {} \
         WHERE (Path IN {METRICS_TABLE}) AND (Time >= {from} AND Time <= {until}) \
         GROUP BY Path FORMAT RowBinary",
        date_prewhere(from, until)
    );
    q
}

fn aggregated_query(
    table: &str,
    function: AggregationFn,
    step: u32,
    from: u32,
    until: u32,
) -> String {
    let mut q = String::with_capacity(384);
    let _ = write!(
        q,
        "SELECT Path, groupArray(Bucket), groupArray(Agg) FROM (\
         SELECT Path, intDiv(Time, {step}) * {step} AS Bucket, {}(Value) AS Agg \
         FROM {table} {} \
         WHERE (Path IN {METRICS_TABLE}) AND (Time >= {from} AND Time <= {until}) \
         GROUP BY Path, Bucket ORDER BY Path, Bucket\
         ) GROUP BY Path FORMAT RowBinary",
        function.storage_name(),
        date_prewhere(from, until)
    );
    q
}

/// Partition pre-filter on the `Date` column.
fn date_prewhere(from: u32, until: u32) -> String {
    format!(
        "PREWHERE Date >= '{}' AND Date <= '{}'",
        partition_date(from),
        partition_date(until)
    )
}

/// UTC calendar date of an epoch second, as `YYYY-MM-DD`.
fn partition_date(epoch: u32) -> String {
    // every u32 second is in chrono's range
    DateTime::<Utc>::from_timestamp(i64::from(epoch), 0)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}
