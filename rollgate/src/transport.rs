//! Seams to the outside world: the storage engine and the secondary point
//! source.
//!
//! The fetch orchestrator only sees these traits. A storage round trip
//! produces a [`ChunkStream`] that is decoded incrementally, so a response is
//! never buffered whole. The secondary source is an optional capability
//! injected at construction time via [`SecondarySource`].

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;
use crate::plan::StorageQuery;

/// A response body arriving in chunks.
#[async_trait]
pub trait ChunkStream: Send {
    /// Returns the next chunk, or `None` once the body has ended.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Executes storage queries.
#[async_trait]
pub trait StorageTransport: Send + Sync {
    /// Sends `query` and returns the response body as a stream.
    async fn execute(&self, query: &StorageQuery)
    -> Result<Box<dyn ChunkStream>, TransportError>;
}

/// An in-memory body, replayed chunk by chunk.
#[derive(Debug, Default, Clone)]
pub struct MemoryStream {
    chunks: VecDeque<Bytes>,
}

impl MemoryStream {
    /// Creates a stream that yields `chunks` in order.
    pub fn new<I: IntoIterator<Item = Bytes>>(chunks: I) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }

    /// Splits `body` into chunks of at most `chunk_size` bytes.
    pub fn chunked(body: Bytes, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut chunks = VecDeque::with_capacity(body.len() / chunk_size + 1);
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + chunk_size).min(body.len());
            chunks.push_back(body.slice(offset..end));
            offset = end;
        }
        Self { chunks }
    }
}

#[async_trait]
impl ChunkStream for MemoryStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.chunks.pop_front())
    }
}

/// A point from the secondary source, not yet durable in storage.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentPoint {
    /// Metric name (display form, never reversed).
    pub metric: String,
    /// Epoch seconds.
    pub time: u32,
    /// Sample value.
    pub value: f64,
    /// Ingest version; wins ties against storage points when higher.
    pub timestamp: u32,
}

/// Source of recent points that storage has not flushed yet.
#[async_trait]
pub trait RecentPointSource: Send + Sync {
    /// Returns points for `metrics` within `[from, until]`.
    async fn recent_points(
        &self,
        metrics: &[String],
        from: u32,
        until: u32,
    ) -> Result<Vec<RecentPoint>, TransportError>;
}

/// Optional secondary point source.
#[derive(Clone, Default)]
pub enum SecondarySource {
    /// No secondary source is configured.
    #[default]
    Absent,
    /// Recent points are merged from this source.
    Present(Arc<dyn RecentPointSource>),
}

impl SecondarySource {
    /// Wraps a source.
    pub fn present<S: RecentPointSource + 'static>(source: S) -> Self {
        Self::Present(Arc::new(source))
    }

    /// Returns `true` when no source is configured.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

impl std::fmt::Debug for SecondarySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => f.write_str("Absent"),
            Self::Present(_) => f.write_str("Present(..)"),
        }
    }
}

#[cfg(feature = "http-transport")]
pub use http::HttpTransport;

/// Storage over HTTP, with the metric list sent as an external table.
#[cfg(feature = "http-transport")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::{ChunkStream, StorageTransport};
    use crate::error::TransportError;
    use crate::plan::StorageQuery;

    /// Sends queries to an HTTP endpoint of the storage engine.
    ///
    /// The query text goes in the `query` URL parameter; the metric list is
    /// attached as a multipart file named after the external table, with its
    /// structure and format declared in URL parameters.
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        client: reqwest::Client,
        endpoint: String,
    }

    impl HttpTransport {
        /// Creates a transport for `endpoint`.
        ///
        /// # Errors
        ///
        /// Returns [`TransportError::Http`] if the client cannot be built.
        pub fn new(
            endpoint: impl Into<String>,
            connect_timeout: Duration,
        ) -> Result<Self, TransportError> {
            let client = reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()?;
            Ok(Self {
                client,
                endpoint: endpoint.into(),
            })
        }
    }

    struct HttpChunkStream {
        response: reqwest::Response,
    }

    #[async_trait]
    impl ChunkStream for HttpChunkStream {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
            self.response
                .chunk()
                .await
                .map_err(|e| TransportError::Body {
                    reason: e.to_string(),
                })
        }
    }

    #[async_trait]
    impl StorageTransport for HttpTransport {
        async fn execute(
            &self,
            query: &StorageQuery,
        ) -> Result<Box<dyn ChunkStream>, TransportError> {
            let external = &query.external;
            let part = reqwest::multipart::Part::text(external.body.clone())
                .file_name(external.name.clone());
            let form = reqwest::multipart::Form::new().part(external.name.clone(), part);

            let params = [
                ("query".to_string(), query.text.clone()),
                (
                    format!("{}_structure", external.name),
                    external.structure.clone(),
                ),
                (
                    format!("{}_format", external.name),
                    "TabSeparated".to_string(),
                ),
            ];

            let response = self
                .client
                .post(&self.endpoint)
                .query(&params)
                .multipart(form)
                .send()
                .await
                .map_err(|e| TransportError::Request {
                    reason: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            Ok(Box::new(HttpChunkStream { response }))
        }
    }
}
