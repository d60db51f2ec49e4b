//! Point storage and in-place consolidation.
//!
//! A [`PointStore`] collects the points of one fetch, keyed by interned metric
//! ids, and is consolidated in three passes that must run in order:
//!
//! 1. [`sort`](PointStore::sort): order by `(metric_id, time)`
//! 2. [`uniq`](PointStore::uniq): last write wins per `(metric_id, time)`
//! 3. [`rollup`](PointStore::rollup): bucket by step and reduce
//!
//! All passes rewrite the point vector in place and truncate it; nothing is
//! reallocated.

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::warn;

use crate::aggregation::AggregationFn;
use crate::decode::RawRow;
use crate::plan::floor_to;
use crate::target::reverse_path;
use crate::transport::RecentPoint;

/// A single data point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Interned metric id; 0 marks a discarded point.
    pub metric_id: u32,
    /// Sample value.
    pub value: f64,
    /// Epoch seconds; the bucket start once rolled up.
    pub time: u32,
    /// Ingest version, used to break ties between duplicates.
    pub timestamp: u32,
}

/// Points of one fetch plus per-metric metadata.
///
/// Metric ids are dense and start at 1. They are only meaningful within the
/// store that assigned them.
#[derive(Debug, Default, Clone)]
pub struct PointStore {
    points: Vec<Point>,
    names: Vec<String>,
    ids: HashMap<String, u32>,
    steps: Vec<u32>,
    functions: Vec<Option<AggregationFn>>,
}

impl PointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of `name`, assigning the next one on first sight.
    #[allow(clippy::cast_possible_truncation)] // more than 2^32 metrics is rejected upstream
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        self.names.push(name.to_string());
        self.steps.push(0);
        self.functions.push(None);
        let id = self.names.len() as u32;
        self.ids.insert(name.to_string(), id);
        id
    }

    /// Id of `name`, if it has been seen.
    pub fn metric_id(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    /// Name behind `id`.
    pub fn metric_name(&self, id: u32) -> Option<&str> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.names.get(index).map(String::as_str)
    }

    /// Number of distinct metrics interned.
    pub fn metric_count(&self) -> usize {
        self.names.len()
    }

    fn slot(&self, id: u32) -> Option<usize> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        (index < self.names.len()).then_some(index)
    }

    /// Assigns the rollup step of a metric. Unknown ids are ignored.
    pub fn set_step(&mut self, id: u32, step: u32) {
        if let Some(i) = self.slot(id) {
            self.steps[i] = step;
        }
    }

    /// Rollup step of a metric, if assigned.
    pub fn step(&self, id: u32) -> Option<u32> {
        self.slot(id)
            .map(|i| self.steps[i])
            .filter(|&step| step > 0)
    }

    /// Assigns the aggregation function of a metric. Unknown ids are ignored.
    pub fn set_aggregation(&mut self, id: u32, function: AggregationFn) {
        if let Some(i) = self.slot(id) {
            self.functions[i] = Some(function);
        }
    }

    /// Aggregation function of a metric, if assigned.
    pub fn aggregation(&self, id: u32) -> Option<AggregationFn> {
        self.slot(id).and_then(|i| self.functions[i])
    }

    /// Interns `name` and records its step and function in one go.
    pub fn describe(&mut self, name: &str, step: u32, function: AggregationFn) -> u32 {
        let id = self.intern(name);
        self.set_step(id, step);
        self.set_aggregation(id, function);
        id
    }

    /// Appends one point.
    pub fn push(&mut self, metric_id: u32, time: u32, value: f64, timestamp: u32) {
        self.points.push(Point {
            metric_id,
            value,
            time,
            timestamp,
        });
    }

    /// Appends every point of a decoded row and returns the row's metric id.
    ///
    /// With `reverse` set the stored path is turned back into its display
    /// form before interning.
    ///
    /// A path that is not valid UTF-8 is interned lossily and logged, since
    /// no requested metric can match it.
    pub fn append_row(&mut self, row: &RawRow, reverse: bool) -> u32 {
        let name = String::from_utf8_lossy(&row.name);
        if let Cow::Owned(lossy) = &name {
            warn!(path = %lossy, points = row.len(), "stored path is not valid UTF-8");
        }
        let id = if reverse {
            self.intern(&reverse_path(&name))
        } else {
            self.intern(&name)
        };

        self.points.reserve(row.len());
        for (i, (&time, &value)) in row.times.iter().zip(&row.values).enumerate() {
            self.push(id, time, value, row.timestamp(i));
        }
        id
    }

    /// Appends points from the secondary source.
    pub fn append_recent(&mut self, points: &[RecentPoint]) {
        self.points.reserve(points.len());
        for p in points {
            let id = self.intern(&p.metric);
            self.push(id, p.time, p.value, p.timestamp);
        }
    }

    /// The points in their current order.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns `true` if the store holds no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Sorts by `(metric_id, time)`, keeping ingest order for equal keys.
    pub fn sort(&mut self) {
        self.points.sort_by_key(|p| (p.metric_id, p.time));
    }

    /// Keeps one point per `(metric_id, time)`, the one with the greatest
    /// `timestamp`, then drops discarded and NaN points.
    ///
    /// Equal timestamps keep the point ingested last. Requires
    /// [`sort`](Self::sort) first.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rollgate::points::PointStore;
    ///
    /// let mut store = PointStore::new();
    /// let id = store.intern("m");
    /// store.push(id, 10, 5.0, 1);
    /// store.push(id, 10, 9.0, 2);
    /// store.sort();
    /// store.uniq();
    ///
    /// assert_eq!(store.len(), 1);
    /// assert_eq!(store.points()[0].value, 9.0);
    /// ```
    pub fn uniq(&mut self) {
        let mut keep = 0;
        for i in 1..self.points.len() {
            let kept = self.points[keep];
            let cur = self.points[i];
            if kept.metric_id == cur.metric_id && kept.time == cur.time {
                if cur.timestamp >= kept.timestamp {
                    self.points[keep].metric_id = 0;
                    keep = i;
                } else {
                    self.points[i].metric_id = 0;
                }
            } else {
                keep = i;
            }
        }
        self.points.retain(|p| p.metric_id != 0 && !p.value.is_nan());
    }

    /// Buckets each metric's points and reduces every bucket to one point.
    ///
    /// The bucket width is `common_step` when non-zero (storage already
    /// aggregated to it), otherwise the metric's own step (1 when unset).
    /// Values are reduced with the metric's function, average when unset.
    /// A bucket is dropped when it ends at or before `from` or reduces to
    /// NaN; a bucket that starts before `from` but overlaps it is kept.
    ///
    /// Requires [`sort`](Self::sort) and [`uniq`](Self::uniq) first.
    pub fn rollup(&mut self, from: u32, common_step: u32) {
        let len = self.points.len();
        let mut batch = Vec::new();
        let mut read = 0;
        let mut write = 0;

        while read < len {
            let id = self.points[read].metric_id;
            let step = if common_step > 0 {
                common_step
            } else {
                self.step(id).unwrap_or(1)
            };
            let function = self.aggregation(id).unwrap_or_default();
            let bucket = floor_to(self.points[read].time, step);

            batch.clear();
            let mut timestamp = 0;
            while read < len {
                let p = self.points[read];
                if p.metric_id != id || floor_to(p.time, step) != bucket {
                    break;
                }
                batch.push(p.value);
                timestamp = timestamp.max(p.timestamp);
                read += 1;
            }

            if u64::from(bucket) + u64::from(step) <= u64::from(from) {
                continue;
            }
            let value = function.apply(&batch);
            if value.is_nan() {
                continue;
            }
            self.points[write] = Point {
                metric_id: id,
                value,
                time: bucket,
                timestamp,
            };
            write += 1;
        }

        self.points.truncate(write);
    }

    /// Splits the (sorted) points into one run per metric.
    pub fn group_by_metric(&self) -> impl Iterator<Item = (u32, &[Point])> {
        self.points
            .chunk_by(|a, b| a.metric_id == b.metric_id)
            .map(|run| (run[0].metric_id, run))
    }

    /// Points of one metric. Requires [`sort`](Self::sort) first.
    pub fn metric_points(&self, id: u32) -> &[Point] {
        let start = self.points.partition_point(|p| p.metric_id < id);
        let end = self.points.partition_point(|p| p.metric_id <= id);
        &self.points[start..end]
    }
}
