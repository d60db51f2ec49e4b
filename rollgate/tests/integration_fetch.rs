//! Integration tests for the fetch orchestrator.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use rollgate::config::{FetchConfig, RangeLimit};
use rollgate::decode::{RowShape, encode_row};
use rollgate::error::{ErrorKind, FetchError, StepError, TransportError};
use rollgate::plan::StorageQuery;
use rollgate::rules::{PatternConfig, RetentionSpec, RuleSet, RulesConfig};
use rollgate::transport::{
    ChunkStream, MemoryStream, RecentPoint, RecentPointSource, SecondarySource, StorageTransport,
};
use rollgate::{AggregationFn, FetchOrchestrator, FetchRequest, TargetGroup, TimeFrame};

/// Fake storage: answers each listed metric with two points at `from` and
/// `from + step`, valued 1 and 2.
#[derive(Default)]
struct FakeStorage {
    queries: Mutex<Vec<StorageQuery>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Metrics whose row is cut short.
    truncate: Vec<String>,
}

impl FakeStorage {
    fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn recorded(&self) -> Vec<StorageQuery> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl StorageTransport for FakeStorage {
    async fn execute(&self, query: &StorageQuery) -> Result<Box<dyn ChunkStream>, TransportError> {
        self.queries.lock().push(query.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut body = BytesMut::new();
        for path in query.external.body.lines() {
            let times = [query.from, query.from + query.step];
            let timestamps = (query.shape == RowShape::Unaggregated).then_some(&times[..]);
            let mut row = BytesMut::new();
            encode_row(&mut row, path.as_bytes(), &times, &[1.0, 2.0], timestamps);
            if self.truncate.iter().any(|t| t == path) {
                row.truncate(row.len() - 4);
            }
            body.extend_from_slice(&row);
        }
        Ok(Box::new(MemoryStream::chunked(body.freeze(), 16)))
    }
}

struct FakeRecent {
    points: Vec<RecentPoint>,
    delay: Duration,
}

#[async_trait]
impl RecentPointSource for FakeRecent {
    async fn recent_points(
        &self,
        metrics: &[String],
        _from: u32,
        _until: u32,
    ) -> Result<Vec<RecentPoint>, TransportError> {
        tokio::time::sleep(self.delay).await;
        Ok(self
            .points
            .iter()
            .filter(|p| metrics.contains(&p.metric))
            .cloned()
            .collect())
    }
}

fn rules() -> Arc<RuleSet> {
    let pattern = |re: &str, f: &str, ret: &str| PatternConfig {
        regexp: Some(re.to_string()),
        function: Some(f.to_string()),
        retention: RetentionSpec::Compact(ret.to_string()),
    };
    Arc::new(
        RuleSet::compile(&RulesConfig {
            default_precision: 60,
            default_function: "average".to_string(),
            patterns: vec![pattern("^a$", "avg", "0:60"), pattern("^b$", "max", "0:300")],
        })
        .unwrap(),
    )
}

fn group(metrics: &[&str]) -> TargetGroup {
    TargetGroup::from_triples("graphite", rules(), metrics.iter().map(|m| (*m, *m, *m)))
}

fn aggregated() -> FetchConfig {
    FetchConfig {
        aggregated: true,
        ..FetchConfig::default()
    }
}

#[tokio::test]
async fn test_aggregated_groups_share_common_step() {
    let storage = Arc::new(FakeStorage::default());
    let orchestrator =
        FetchOrchestrator::new(storage.clone(), SecondarySource::Absent, aggregated());

    let tf = TimeFrame::new(0, 900, 100);
    let request = FetchRequest::new()
        .with(tf, group(&["a"]))
        .with(tf, group(&["b"]))
        .at(900);
    let response = orchestrator.fetch(request).await.unwrap();

    let queries = storage.recorded();
    assert_eq!(queries.len(), 2);
    for q in &queries {
        assert_eq!(q.step, 300);
        assert_eq!((q.from, q.until), (0, 900));
        assert_eq!(q.shape, RowShape::Aggregated);
    }

    let replies = &response[&tf];
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].metrics, vec!["a"]);
    assert_eq!(replies[1].metrics, vec!["b"]);

    let b = replies[1].series().next().unwrap();
    assert_eq!(b.step, 300);
    assert_eq!(b.function, AggregationFn::Max);
    let points: Vec<(u32, f64)> = b.points.iter().map(|p| (p.time, p.value)).collect();
    assert_eq!(points, vec![(0, 1.0), (300, 2.0)]);
}

#[tokio::test]
async fn test_distinct_time_frames_are_keyed_separately() {
    let storage = Arc::new(FakeStorage::default());
    let orchestrator =
        FetchOrchestrator::new(storage, SecondarySource::Absent, FetchConfig::default());

    let first = TimeFrame::new(0, 600, 0);
    let second = TimeFrame::new(600, 1_200, 0);
    let response = orchestrator
        .fetch(
            FetchRequest::new()
                .with(first, group(&["a"]))
                .with(second, group(&["a", "c"]))
                .at(1_200),
        )
        .await
        .unwrap();

    assert_eq!(response.len(), 2);
    assert_eq!(response[&first][0].metrics.len(), 1);
    assert_eq!(response[&second][0].metrics.len(), 2);
}

#[tokio::test]
async fn test_secondary_points_override_storage() {
    let storage = Arc::new(FakeStorage::default());
    let recent = FakeRecent {
        points: vec![
            RecentPoint {
                metric: "a".to_string(),
                time: 60,
                value: 9.0,
                timestamp: 1_000,
            },
            RecentPoint {
                metric: "a".to_string(),
                time: 120,
                value: 3.0,
                timestamp: 1_000,
            },
            RecentPoint {
                metric: "unrequested".to_string(),
                time: 60,
                value: 1.0,
                timestamp: 1_000,
            },
        ],
        delay: Duration::ZERO,
    };
    let orchestrator = FetchOrchestrator::new(
        storage,
        SecondarySource::present(recent),
        FetchConfig::default(),
    );

    let tf = TimeFrame::new(0, 120, 0);
    let response = orchestrator
        .fetch(FetchRequest::new().with(tf, group(&["a"])).at(120))
        .await
        .unwrap();

    let series = response[&tf][0].series().next().unwrap();
    let points: Vec<(u32, f64)> = series.points.iter().map(|p| (p.time, p.value)).collect();
    assert_eq!(points, vec![(0, 1.0), (60, 9.0), (120, 3.0)]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_secondary_source_is_skipped() {
    let storage = Arc::new(FakeStorage::default());
    let recent = FakeRecent {
        points: vec![RecentPoint {
            metric: "a".to_string(),
            time: 60,
            value: 9.0,
            timestamp: 1_000,
        }],
        delay: Duration::from_secs(30),
    };
    let config = FetchConfig {
        secondary_timeout: Duration::from_millis(100),
        ..FetchConfig::default()
    };
    let orchestrator = FetchOrchestrator::new(storage, SecondarySource::present(recent), config);

    let tf = TimeFrame::new(0, 120, 0);
    let response = orchestrator
        .fetch(FetchRequest::new().with(tf, group(&["a"])).at(120))
        .await
        .unwrap();

    let series = response[&tf][0].series().next().unwrap();
    let values: Vec<f64> = series.points.iter().map(|p| p.value).collect();
    assert_eq!(values, vec![1.0, 2.0]);
}

#[tokio::test(start_paused = true)]
async fn test_request_deadline() {
    let storage = Arc::new(FakeStorage::delayed(Duration::from_secs(30)));
    let config = FetchConfig {
        request_timeout: Duration::from_secs(1),
        ..FetchConfig::default()
    };
    let orchestrator = FetchOrchestrator::new(storage, SecondarySource::Absent, config);

    let err = orchestrator
        .fetch(FetchRequest::new().with(TimeFrame::new(0, 600, 0), group(&["a"])))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Deadline));
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}

#[tokio::test(start_paused = true)]
async fn test_range_bucket_query_timeout() {
    let storage = Arc::new(FakeStorage::delayed(Duration::from_secs(5)));
    let config = FetchConfig {
        range_limits: vec![RangeLimit {
            max_range: Duration::from_secs(3_600),
            max_concurrent: 0,
            query_timeout: Duration::from_secs(1),
        }],
        ..FetchConfig::default()
    };
    let orchestrator = FetchOrchestrator::new(storage, SecondarySource::Absent, config);

    let err = orchestrator
        .fetch(FetchRequest::new().with(TimeFrame::new(0, 600, 0), group(&["a"])).at(600))
        .await
        .unwrap_err();
    assert!(
        matches!(err, FetchError::QueryTimeout { ref table, timeout }
            if table == "graphite" && timeout == Duration::from_secs(1))
    );
    assert_eq!(err.kind(), ErrorKind::Retry);
}

#[tokio::test(start_paused = true)]
async fn test_global_admission_limit() {
    let storage = Arc::new(FakeStorage::delayed(Duration::from_millis(100)));
    let config = FetchConfig {
        max_concurrent_queries: 1,
        ..FetchConfig::default()
    };
    let orchestrator = FetchOrchestrator::new(storage.clone(), SecondarySource::Absent, config);

    let tf = TimeFrame::new(0, 600, 0);
    let request = (0..3).fold(FetchRequest::new().at(600), |r, _| r.with(tf, group(&["a"])));
    let response = orchestrator.fetch(request).await.unwrap();

    assert_eq!(response[&tf].len(), 3);
    assert_eq!(storage.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(storage.recorded().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unlimited_admission_runs_concurrently() {
    let storage = Arc::new(FakeStorage::delayed(Duration::from_millis(100)));
    let orchestrator =
        FetchOrchestrator::new(storage.clone(), SecondarySource::Absent, FetchConfig::default());

    let tf = TimeFrame::new(0, 600, 0);
    let request = (0..3).fold(FetchRequest::new().at(600), |r, _| r.with(tf, group(&["a"])));
    orchestrator.fetch(request).await.unwrap();

    assert_eq!(storage.max_in_flight.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_malformed_group_fails_whole_request() {
    let storage = Arc::new(FakeStorage {
        truncate: vec!["b".to_string()],
        ..FakeStorage::default()
    });
    let orchestrator =
        FetchOrchestrator::new(storage.clone(), SecondarySource::Absent, FetchConfig::default());

    let tf = TimeFrame::new(0, 600, 0);
    let err = orchestrator
        .fetch(
            FetchRequest::new()
                .with(tf, group(&["a"]))
                .with(tf, group(&["b"]))
                .at(600),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Decode(_)));
    assert_eq!(err.kind(), ErrorKind::MalformedUpstream);
    // the healthy group still ran to completion
    assert_eq!(storage.recorded().len(), 2);
}

#[tokio::test]
async fn test_metrics_limit_sends_no_query() {
    let storage = Arc::new(FakeStorage::default());
    let config = FetchConfig {
        max_metrics_per_request: 2,
        ..FetchConfig::default()
    };
    let orchestrator = FetchOrchestrator::new(storage.clone(), SecondarySource::Absent, config);

    let tf = TimeFrame::new(0, 600, 0);
    let err = orchestrator
        .fetch(
            FetchRequest::new()
                .with(tf, group(&["a", "b"]))
                .with(tf, group(&["c"])),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PolicyRejected);
    assert!(storage.recorded().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_per_request_query_limit() {
    let storage = Arc::new(FakeStorage::delayed(Duration::from_millis(100)));
    let config = FetchConfig {
        max_queries_per_request: 1,
        ..FetchConfig::default()
    };
    let orchestrator = FetchOrchestrator::new(storage.clone(), SecondarySource::Absent, config);

    let tf = TimeFrame::new(0, 600, 0);
    let request = (0..3).fold(FetchRequest::new().at(600), |r, _| r.with(tf, group(&["a"])));
    let response = orchestrator.fetch(request).await.unwrap();

    assert_eq!(response[&tf].len(), 3);
    assert_eq!(storage.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_range_bucket_concurrency_limit() {
    let storage = Arc::new(FakeStorage::delayed(Duration::from_millis(100)));
    let config = FetchConfig {
        range_limits: vec![RangeLimit {
            max_range: Duration::from_secs(3_600),
            max_concurrent: 1,
            query_timeout: Duration::from_secs(10),
        }],
        ..FetchConfig::default()
    };
    let orchestrator = FetchOrchestrator::new(storage.clone(), SecondarySource::Absent, config);

    let tf = TimeFrame::new(0, 600, 0);
    let request = (0..3).fold(FetchRequest::new().at(600), |r, _| r.with(tf, group(&["a"])));
    orchestrator.fetch(request).await.unwrap();
    assert_eq!(storage.max_in_flight.load(Ordering::SeqCst), 1);

    // ranges past the last bucket are not limited by it
    storage.max_in_flight.store(0, Ordering::SeqCst);
    let wide = TimeFrame::new(0, 7_200, 0);
    let request = (0..3).fold(FetchRequest::new().at(7_200), |r, _| r.with(wide, group(&["a"])));
    orchestrator.fetch(request).await.unwrap();
    assert_eq!(storage.max_in_flight.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_query_releases_admission_slots() {
    let storage = Arc::new(FakeStorage {
        truncate: vec!["b".to_string()],
        ..FakeStorage::default()
    });
    let config = FetchConfig {
        max_concurrent_queries: 1,
        range_limits: vec![RangeLimit {
            max_range: Duration::from_secs(3_600),
            max_concurrent: 1,
            query_timeout: Duration::from_secs(10),
        }],
        request_timeout: Duration::from_secs(1),
        ..FetchConfig::default()
    };
    let orchestrator = FetchOrchestrator::new(storage.clone(), SecondarySource::Absent, config);

    let tf = TimeFrame::new(0, 600, 0);
    let err = orchestrator
        .fetch(FetchRequest::new().with(tf, group(&["b"])).at(600))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Decode(_)));

    // a leaked slot would stall this request until its deadline
    let response = orchestrator
        .fetch(FetchRequest::new().with(tf, group(&["a"])).at(600))
        .await
        .unwrap();
    assert_eq!(response[&tf][0].point_count(), 2);
    assert_eq!(storage.recorded().len(), 2);
}

#[tokio::test]
async fn test_aggregated_group_queries_per_function() {
    let storage = Arc::new(FakeStorage::default());
    let orchestrator =
        FetchOrchestrator::new(storage.clone(), SecondarySource::Absent, aggregated());

    let tf = TimeFrame::new(0, 900, 100);
    let response = orchestrator
        .fetch(FetchRequest::new().with(tf, group(&["a", "b"])).at(900))
        .await
        .unwrap();

    let queries = storage.recorded();
    assert_eq!(queries.len(), 2);
    let functions: Vec<_> = queries.iter().map(|q| q.function).collect();
    assert!(functions.contains(&Some(AggregationFn::Average)));
    assert!(functions.contains(&Some(AggregationFn::Max)));
    for q in &queries {
        assert_eq!(q.step, 300);
        assert_eq!((q.from, q.until), (0, 900));
        assert_eq!(q.external.rows(), 1);
    }

    let reply = &response[&tf][0];
    let series: Vec<_> = reply.series().collect();
    assert_eq!(series.len(), 2);
    assert_eq!(
        (series[0].metric, series[0].function, series[0].step),
        ("a", AggregationFn::Average, 300)
    );
    assert_eq!(
        (series[1].metric, series[1].function, series[1].step),
        ("b", AggregationFn::Max, 300)
    );
    for s in &series {
        let points: Vec<(u32, f64)> = s.points.iter().map(|p| (p.time, p.value)).collect();
        assert_eq!(points, vec![(0, 1.0), (300, 2.0)]);
    }
}

#[tokio::test]
async fn test_unrepresentable_common_step_fails_request() {
    // pairwise coprime steps whose LCM exceeds u32::MAX
    let pattern = |re: &str, ret: &str| PatternConfig {
        regexp: Some(re.to_string()),
        function: None,
        retention: RetentionSpec::Compact(ret.to_string()),
    };
    let rules = Arc::new(
        RuleSet::compile(&RulesConfig {
            default_precision: 60,
            default_function: "average".to_string(),
            patterns: vec![
                pattern("^p$", "0:65521"),
                pattern("^q$", "0:65519"),
                pattern("^r$", "0:65497"),
            ],
        })
        .unwrap(),
    );
    let single =
        |m: &str| TargetGroup::from_triples("graphite", Arc::clone(&rules), [(m, m, m)]);

    let storage = Arc::new(FakeStorage::default());
    let orchestrator =
        FetchOrchestrator::new(storage.clone(), SecondarySource::Absent, aggregated());

    let tf = TimeFrame::new(0, 900, 0);
    let err = orchestrator
        .fetch(
            FetchRequest::new()
                .with(tf, single("p"))
                .with(tf, single("q"))
                .with(tf, single("r"))
                .at(900),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Step(StepError::Overflow { .. })));
    assert_eq!(err.kind(), ErrorKind::Retry);
    assert!(storage.recorded().is_empty());
}
