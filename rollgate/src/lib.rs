//! # rollgate
//!
//! Read-path engine for a time-series gateway in front of a columnar store.
//!
//! rollgate turns render requests (metric lists, a time range, a target point
//! count) into storage queries, decodes the binary row stream the storage
//! engine sends back, deduplicates and downsamples the points according to
//! retention rules, and hands per-metric series to a reply layer. Several
//! targets fetched together share one timeline granularity.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Streaming decode: responses are parsed chunk by chunk, never buffered whole
//! - Retention rules compiled once, swapped atomically on reload
//! - One common step across all targets of a request, so series line up
//! - Layered admission control with RAII permits
//! - No partial results: a request either answers every target or fails
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rollgate::{
//!     FetchOrchestrator, FetchRequest, GatewayConfig, RuleSet, SecondarySource, TargetGroup,
//!     TimeFrame,
//! };
//!
//! # async fn run(transport: Arc<dyn rollgate::transport::StorageTransport>)
//! # -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::load("rollgate.json")?;
//! let rules = Arc::new(RuleSet::compile(&config.rules)?);
//! let orchestrator = FetchOrchestrator::new(transport, SecondarySource::Absent, config.fetch);
//!
//! let group = TargetGroup::from_triples(
//!     "graphite",
//!     rules,
//!     [("servers.web1.cpu", "servers.web1.cpu", "servers.*.cpu")],
//! );
//! let frame = TimeFrame::new(1_700_000_000, 1_700_003_600, 500);
//! let response = orchestrator
//!     .fetch(FetchRequest::new().with(frame, group))
//!     .await?;
//!
//! for reply in &response[&frame] {
//!     for series in reply.series() {
//!         println!("{} step={} points={}", series.metric, series.step, series.points.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`rules`]: retention patterns and rule lookup
//! - [`aggregation`]: bucket reduction functions
//! - [`plan`]: query planning and bound alignment
//! - [`step`]: common-step barrier
//! - [`decode`]: streaming row decoder
//! - [`points`]: point store, sort, uniq and rollup
//! - [`fetch`]: concurrent orchestration
//! - [`target`]: request inputs
//! - [`transport`]: storage and secondary source seams
//! - [`config`]: JSON configuration
//! - [`error`]: error types

pub mod aggregation;
pub mod config;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod plan;
pub mod points;
pub mod rules;
pub mod step;
pub mod target;
pub mod transport;

// Re-export primary API types at crate root for convenience.
pub use aggregation::AggregationFn;
pub use config::{FetchConfig, GatewayConfig};
pub use error::{FetchError, GatewayError, Result};
pub use fetch::{FetchOrchestrator, FetchRequest, FetchResponse, GroupReply, Series};
pub use points::{Point, PointStore};
pub use rules::{RuleSet, SharedRules};
pub use target::{TargetGroup, TimeFrame};
pub use transport::SecondarySource;
