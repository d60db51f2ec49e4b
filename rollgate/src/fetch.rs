//! Concurrent multi-target fetch.
//!
//! A [`FetchRequest`] holds one or more `(TimeFrame, TargetGroup)` pairs. The
//! [`FetchOrchestrator`] answers each pair in its own task:
//!
//! 1. resolve rules and plan the storage queries (aggregated mode first agrees
//!    on a common step with every other pair of the request)
//! 2. acquire admission slots and run the queries concurrently, decoding each
//!    response as it streams in
//! 3. merge recent points from the secondary source, if one is configured
//! 4. sort, deduplicate and roll up
//!
//! The reply maps each time frame to the groups requested for it.
//!
//! # Failure
//!
//! Every task is awaited even after one fails; the first error collected is
//! returned and no partial response is produced. A group's rows only reach
//! its point store once the whole response decoded, so a failed or cancelled
//! query leaves nothing behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::aggregation::AggregationFn;
use crate::config::FetchConfig;
use crate::decode::{RawRow, decode_stream};
use crate::error::FetchError;
use crate::plan::{
    MetricGrouping, PlanMode, QueryPlan, StorageQuery, plan_aggregated_with, plan_unaggregated,
};
use crate::points::{Point, PointStore};
use crate::step::CommonStepResolver;
use crate::target::{Alias, TargetGroup, TimeFrame};
use crate::transport::{RecentPoint, SecondarySource, StorageTransport};

/// The targets of one render request.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pairs: Vec<(TimeFrame, TargetGroup)>,
    now: Option<u32>,
}

impl FetchRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target group to fetch over `time_frame`.
    #[must_use]
    pub fn with(mut self, time_frame: TimeFrame, group: TargetGroup) -> Self {
        self.pairs.push((time_frame, group));
        self
    }

    /// Pins "now" for retention ages instead of reading the clock.
    #[must_use]
    pub fn at(mut self, now: u32) -> Self {
        self.now = Some(now);
        self
    }

    /// Metrics across all groups.
    pub fn metric_count(&self) -> usize {
        self.pairs.iter().map(|(_, g)| g.len()).sum()
    }

    /// Number of `(TimeFrame, TargetGroup)` pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns `true` if nothing was requested.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// One metric's consolidated points with its reply metadata.
#[derive(Debug, Clone, Copy)]
pub struct Series<'a> {
    /// Metric name.
    pub metric: &'a str,
    /// Names the metric is displayed under.
    pub aliases: &'a [Alias],
    /// Points, ascending by time; possibly empty.
    pub points: &'a [Point],
    /// Bucket width of the points.
    pub step: u32,
    /// Consolidation function reported to the client.
    pub function: AggregationFn,
}

/// The answer for one target group.
#[derive(Debug, Clone)]
pub struct GroupReply {
    /// Consolidated points.
    pub store: PointStore,
    /// Requested metrics, in resolution order.
    pub metrics: Vec<String>,
    /// Display aliases per metric.
    pub aliases: HashMap<String, Vec<Alias>>,
    /// Storage table the group was read from.
    pub table: String,
    /// Who downsampled.
    pub mode: PlanMode,
    /// Final step (aggregated) or largest metric step (unaggregated).
    pub step: u32,
    /// Aligned lower bound.
    pub from: u32,
    /// Aligned upper bound, inclusive.
    pub until: u32,
}

impl GroupReply {
    fn new(group: TargetGroup, plan: &QueryPlan, store: PointStore) -> Self {
        Self {
            store,
            metrics: group.metrics,
            aliases: group.aliases,
            table: group.table,
            mode: plan.mode,
            step: plan.step,
            from: plan.from,
            until: plan.until,
        }
    }

    /// One entry per requested metric, in resolution order.
    pub fn series(&self) -> impl Iterator<Item = Series<'_>> {
        self.metrics.iter().map(|metric| {
            let id = self.store.metric_id(metric);
            let step = match self.mode {
                PlanMode::Aggregated => self.step,
                PlanMode::Unaggregated => id.and_then(|id| self.store.step(id)).unwrap_or(self.step),
            };
            Series {
                metric,
                aliases: self.aliases.get(metric).map(Vec::as_slice).unwrap_or_default(),
                points: id
                    .map(|id| self.store.metric_points(id))
                    .unwrap_or_default(),
                step,
                function: id
                    .and_then(|id| self.store.aggregation(id))
                    .unwrap_or_default(),
            }
        })
    }

    /// Total points across all series.
    pub fn point_count(&self) -> usize {
        self.store.len()
    }
}

/// Replies keyed by time frame, groups in request order.
pub type FetchResponse = HashMap<TimeFrame, Vec<GroupReply>>;

fn limiter(limit: usize) -> Option<Arc<Semaphore>> {
    (limit > 0).then(|| Arc::new(Semaphore::new(limit)))
}

/// Fans requests out to storage under admission control.
///
/// Admission is layered: a global slot pool shared by every request, a
/// per-request pool, and one pool per configured range bucket. A query holds
/// one slot of each applicable pool for its whole round trip.
pub struct FetchOrchestrator {
    transport: Arc<dyn StorageTransport>,
    secondary: SecondarySource,
    config: Arc<FetchConfig>,
    global: Option<Arc<Semaphore>>,
    ranges: Arc<Vec<Option<Arc<Semaphore>>>>,
}

impl std::fmt::Debug for FetchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOrchestrator")
            .field("secondary", &self.secondary)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FetchOrchestrator {
    /// Creates an orchestrator over `transport`.
    pub fn new(
        transport: Arc<dyn StorageTransport>,
        secondary: SecondarySource,
        config: FetchConfig,
    ) -> Self {
        let ranges = config
            .range_limits
            .iter()
            .map(|l| limiter(l.max_concurrent))
            .collect();
        Self {
            transport,
            secondary,
            global: limiter(config.max_concurrent_queries),
            ranges: Arc::new(ranges),
            config: Arc::new(config),
        }
    }

    /// The active settings.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetches every target of `request`.
    ///
    /// # Errors
    ///
    /// - [`FetchError::MetricsLimitExceeded`] before any query is sent
    /// - [`FetchError::Deadline`] when the request timeout passes
    /// - the first error of any target group otherwise
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let requested = request.metric_count();
        let limit = self.config.max_metrics_per_request;
        if limit > 0 && requested > limit {
            return Err(FetchError::MetricsLimitExceeded { requested, limit });
        }

        let now = request.now.unwrap_or_else(unix_now);
        let started = Instant::now();
        let deadline = started + self.config.request_timeout;
        let mode = if self.config.aggregated {
            PlanMode::Aggregated
        } else {
            PlanMode::Unaggregated
        };

        let resolver = Arc::new(CommonStepResolver::new(self.config.step_resolve_timeout));
        if mode == PlanMode::Aggregated {
            resolver.add_participants(request.pairs.len());
        }

        let ctx = Arc::new(RequestContext {
            transport: Arc::clone(&self.transport),
            secondary: self.secondary.clone(),
            config: Arc::clone(&self.config),
            global: self.global.clone(),
            ranges: Arc::clone(&self.ranges),
            per_request: limiter(self.config.max_queries_per_request),
            resolver,
            mode,
            now,
            started,
            deadline,
        });

        let mut tasks = JoinSet::new();
        for (index, (time_frame, group)) in request.pairs.into_iter().enumerate() {
            let ctx = Arc::clone(&ctx);
            tasks.spawn(async move {
                let reply = tokio::time::timeout_at(ctx.deadline, ctx.fetch_group(time_frame, group))
                    .await
                    .unwrap_or(Err(FetchError::Deadline));
                (index, time_frame, reply)
            });
        }

        let mut replies = Vec::with_capacity(tasks.len());
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, time_frame, Ok(reply))) => replies.push((index, time_frame, reply)),
                Ok((index, _, Err(e))) => {
                    warn!(group = index, error = %e, "target group fetch failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!(error = %e, "fetch task failed");
                    first_error.get_or_insert(FetchError::TaskFailed {
                        reason: e.to_string(),
                    });
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        replies.sort_by_key(|(index, _, _)| *index);
        let mut response = FetchResponse::new();
        for (_, time_frame, reply) in replies {
            response.entry(time_frame).or_default().push(reply);
        }

        debug!(
            groups = response.values().map(Vec::len).sum::<usize>(),
            metrics = requested,
            elapsed_ms = started.elapsed().as_millis(),
            "fetch complete"
        );
        Ok(response)
    }
}

/// State shared by the tasks of one request.
struct RequestContext {
    transport: Arc<dyn StorageTransport>,
    secondary: SecondarySource,
    config: Arc<FetchConfig>,
    global: Option<Arc<Semaphore>>,
    ranges: Arc<Vec<Option<Arc<Semaphore>>>>,
    per_request: Option<Arc<Semaphore>>,
    resolver: Arc<CommonStepResolver>,
    mode: PlanMode,
    now: u32,
    started: Instant,
    deadline: Instant,
}

impl RequestContext {
    async fn fetch_group(
        &self,
        time_frame: TimeFrame,
        group: TargetGroup,
    ) -> Result<GroupReply, FetchError> {
        let plan = match self.mode {
            PlanMode::Aggregated => {
                let grouping = MetricGrouping::resolve(&group, &time_frame, self.now);
                // report before waiting on anything so no peer stalls on us
                match grouping.step_contribution() {
                    Ok(step) => self.resolver.contribute(step),
                    Err(err) => {
                        self.resolver.abandon(err.clone());
                        return Err(err.into());
                    }
                }
                let common = if grouping.is_empty() {
                    0
                } else {
                    self.resolver.result().await?
                };
                plan_aggregated_with(&group, &time_frame, grouping, common)?
            }
            PlanMode::Unaggregated => plan_unaggregated(&group, &time_frame, self.now),
        };

        let mut store = PointStore::new();
        for (metric, rule) in &plan.grouping.rules {
            store.describe(metric, rule.precision, rule.function);
        }
        if plan.queries.is_empty() {
            return Ok(GroupReply::new(group, &plan, store));
        }

        let store = Mutex::new(store);
        let queries = plan
            .queries
            .iter()
            .map(|q| self.run_query(q, group.is_reversed, &store));
        let (results, recent) = tokio::join!(
            join_all(queries),
            self.recent_points(&group.metrics, plan.from, plan.until)
        );
        results.into_iter().collect::<Result<Vec<()>, _>>()?;

        let mut store = store.into_inner();
        store.append_recent(&recent);
        store.sort();
        store.uniq();
        store.rollup(plan.from, plan.rollup_step());

        debug!(
            table = %group.table,
            metrics = group.len(),
            points = store.len(),
            step = plan.step,
            "target group consolidated"
        );
        Ok(GroupReply::new(group, &plan, store))
    }

    async fn run_query(
        &self,
        query: &StorageQuery,
        reverse: bool,
        store: &Mutex<PointStore>,
    ) -> Result<(), FetchError> {
        let range = query.until.saturating_sub(query.from);
        let _permits = self.admit(range).await?;

        let timeout = self.config.query_timeout(range);
        let rows = tokio::time::timeout(timeout, self.read_rows(query))
            .await
            .map_err(|_| FetchError::QueryTimeout {
                table: query.table.clone(),
                timeout,
            })??;

        let mut store = store.lock();
        for row in &rows {
            store.append_row(row, reverse);
        }
        Ok(())
    }

    async fn read_rows(&self, query: &StorageQuery) -> Result<Vec<RawRow>, FetchError> {
        let begin = Instant::now();
        let mut stream = self.transport.execute(query).await?;
        let mut rows = Vec::new();
        let stats = decode_stream(stream.as_mut(), query.shape, |row| rows.push(row)).await?;

        debug!(
            table = %query.table,
            function = ?query.function,
            step = query.step,
            metrics = query.external.rows(),
            rows = stats.rows,
            points = stats.points,
            bytes = stats.bytes,
            elapsed_ms = begin.elapsed().as_millis(),
            "storage query decoded"
        );
        Ok(rows)
    }

    /// Takes one slot from every pool that applies to a query over `range`
    /// seconds. Slots are released when the returned permits drop.
    async fn admit(&self, range: u32) -> Result<Vec<OwnedSemaphorePermit>, FetchError> {
        let bucket = self
            .config
            .range_limits
            .iter()
            .position(|l| Duration::from_secs(u64::from(range)) <= l.max_range)
            .and_then(|i| self.ranges.get(i).cloned().flatten());

        let pools = [self.per_request.clone(), bucket, self.global.clone()];
        let mut permits = Vec::with_capacity(pools.len());
        for pool in pools.into_iter().flatten() {
            let permit = tokio::time::timeout_at(self.deadline, pool.acquire_owned())
                .await
                .map_err(|_| FetchError::AdmissionTimeout {
                    waited: self.started.elapsed(),
                })?
                .map_err(|e| FetchError::TaskFailed {
                    reason: e.to_string(),
                })?;
            permits.push(permit);
        }
        Ok(permits)
    }

    async fn recent_points(&self, metrics: &[String], from: u32, until: u32) -> Vec<RecentPoint> {
        let SecondarySource::Present(source) = &self.secondary else {
            return Vec::new();
        };
        let timeout = self.config.secondary_timeout;
        match tokio::time::timeout(timeout, source.recent_points(metrics, from, until)).await {
            Ok(Ok(points)) => points,
            Ok(Err(e)) => {
                warn!(error = %e, "secondary source failed, serving storage points only");
                Vec::new()
            }
            Err(_) => {
                warn!(?timeout, "secondary source timed out, serving storage points only");
                Vec::new()
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // epoch seconds fit u32 until 2106
fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs().min(u64::from(u32::MAX)) as u32)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::BytesMut;

    use super::*;
    use crate::decode::encode_row;
    use crate::error::TransportError;
    use crate::rules::RuleSet;
    use crate::transport::{ChunkStream, MemoryStream};

    /// Answers every query with one row per listed metric.
    struct EchoTransport;

    #[async_trait]
    impl StorageTransport for EchoTransport {
        async fn execute(
            &self,
            query: &StorageQuery,
        ) -> Result<Box<dyn ChunkStream>, TransportError> {
            let mut body = BytesMut::new();
            for path in query.external.body.lines() {
                let times = [query.from, query.from + query.step];
                let ts = matches!(query.shape, crate::decode::RowShape::Unaggregated)
                    .then_some(&times[..]);
                encode_row(&mut body, path.as_bytes(), &times, &[1.0, 2.0], ts);
            }
            Ok(Box::new(MemoryStream::chunked(body.freeze(), 5)))
        }
    }

    fn group(metrics: &[&str]) -> TargetGroup {
        TargetGroup::from_triples(
            "graphite",
            Arc::new(RuleSet::default()),
            metrics.iter().map(|m| (*m, *m, *m)),
        )
    }

    #[tokio::test]
    async fn test_metrics_limit_checked_first() {
        let config = FetchConfig {
            max_metrics_per_request: 1,
            ..FetchConfig::default()
        };
        let orchestrator =
            FetchOrchestrator::new(Arc::new(EchoTransport), SecondarySource::Absent, config);
        let request = FetchRequest::new().with(TimeFrame::new(0, 600, 0), group(&["a", "b"]));

        let err = orchestrator.fetch(request).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::MetricsLimitExceeded {
                requested: 2,
                limit: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_unaggregated_fetch_builds_series() {
        let orchestrator = FetchOrchestrator::new(
            Arc::new(EchoTransport),
            SecondarySource::Absent,
            FetchConfig::default(),
        );
        let tf = TimeFrame::new(0, 600, 0);
        let request = FetchRequest::new().with(tf, group(&["a", "b"])).at(600);

        let response = orchestrator.fetch(request).await.unwrap();
        let reply = &response[&tf][0];
        let series: Vec<Series<'_>> = reply.series().collect();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].metric, "a");
        assert_eq!(series[0].step, 60);
        assert_eq!(series[0].function, AggregationFn::Average);
        let times: Vec<u32> = series[1].points.iter().map(|p| p.time).collect();
        assert_eq!(times, vec![0, 60]);
    }

    #[tokio::test]
    async fn test_empty_group_sends_no_query() {
        struct Unreachable;

        #[async_trait]
        impl StorageTransport for Unreachable {
            async fn execute(
                &self,
                _query: &StorageQuery,
            ) -> Result<Box<dyn ChunkStream>, TransportError> {
                Err(TransportError::Request {
                    reason: "should not be called".to_string(),
                })
            }
        }

        let orchestrator = FetchOrchestrator::new(
            Arc::new(Unreachable),
            SecondarySource::Absent,
            FetchConfig {
                aggregated: true,
                ..FetchConfig::default()
            },
        );
        let tf = TimeFrame::new(0, 600, 10);
        let response = orchestrator
            .fetch(FetchRequest::new().with(tf, group(&[])))
            .await
            .unwrap();
        assert_eq!(response[&tf][0].point_count(), 0);
        assert_eq!(response[&tf][0].series().count(), 0);
    }

    #[test]
    fn test_unix_now_is_recent() {
        assert!(unix_now() > 1_600_000_000);
    }

    #[tokio::test]
    async fn test_echo_transport_streams_in_chunks() {
        let plan = plan_unaggregated(&group(&["x"]), &TimeFrame::new(0, 60, 0), 60);
        let mut stream = EchoTransport.execute(&plan.queries[0]).await.unwrap();
        let mut chunks = 0;
        while stream.next_chunk().await.unwrap().is_some() {
            chunks += 1;
        }
        assert!(chunks > 1);
    }
}
