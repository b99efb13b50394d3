use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::snapshot::Snapshot;
use crate::telemetry::TelemetryEvent;

/// SSE event name carrying a whole snapshot.
pub const SNAPSHOT_EVENT: &str = "snapshot";

/// Silence on the push stream, keep-alive comments included, after which the
/// connection is treated as dead. Three of the server's default keep-alives.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Updated(Snapshot),
    /// The server has nothing newer than the version we sent.
    NotModified,
}

pub type SnapshotStream = BoxStream<'static, Result<Snapshot, SyncError>>;

/// Where a client gets snapshots from.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    /// Conditional fetch: `known_version` is what the caller already holds.
    async fn fetch(&self, known_version: Option<u64>) -> Result<FetchOutcome, SyncError>;

    /// Open the push channel. The stream ending means the connection dropped.
    async fn subscribe(&self) -> Result<SnapshotStream, SyncError>;
}

/// Where a client sends telemetry batches.
#[async_trait]
pub trait TelemetrySink: Send + Sync + 'static {
    async fn send(&self, events: Vec<TelemetryEvent>) -> Result<(), SyncError>;
}

/// HTTP transport: conditional `GET /snapshot/{key}`, SSE on
/// `GET /stream/{key}`, and `POST /telemetry/{project}/events`.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    environment_key: String,
    project_id: Option<Uuid>,
    request_timeout: Duration,
    idle_timeout: Duration,
}

impl HttpSource {
    pub fn new(
        base_url: impl Into<String>,
        environment_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, SyncError> {
        // No client-wide timeout; it would cut the long-lived stream
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            environment_key: environment_key.into(),
            project_id: None,
            request_timeout,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    /// Project id telemetry batches are posted under.
    pub fn with_project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn snapshot_url(&self) -> String {
        format!("{}/snapshot/{}", self.base_url, self.environment_key)
    }

    fn stream_url(&self) -> String {
        format!("{}/stream/{}", self.base_url, self.environment_key)
    }
}

/// Decode snapshot events from raw SSE bytes. The stream yields
/// `SyncError::Timeout` and ends if no bytes arrive within `idle_timeout`.
fn snapshot_events<S, B>(bytes: S, idle_timeout: Duration) -> SnapshotStream
where
    S: Stream<Item = Result<B, SyncError>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let chunks = stream::unfold(Some(bytes.boxed()), move |state| async move {
        let mut bytes = state?;
        match tokio::time::timeout(idle_timeout, bytes.next()).await {
            Ok(Some(chunk)) => Some((chunk, Some(bytes))),
            Ok(None) => None,
            Err(_) => {
                debug!(idle_ms = idle_timeout.as_millis() as u64, "Push stream went silent");
                Some((Err(SyncError::Timeout), None))
            }
        }
    });

    chunks
        .eventsource()
        .filter_map(|event| async move {
            match event {
                Ok(event) if event.event == SNAPSHOT_EVENT => Some(
                    serde_json::from_str::<Snapshot>(&event.data).map_err(|e| {
                        warn!(error = %e, "Failed to parse pushed snapshot");
                        SyncError::Parse(e.to_string())
                    }),
                ),
                Ok(_) => None,
                Err(EventStreamError::Transport(e)) => Some(Err(e)),
                Err(e) => Some(Err(SyncError::transport(e.to_string()))),
            }
        })
        .boxed()
}

async fn server_error(response: reqwest::Response) -> SyncError {
    SyncError::Server {
        status: response.status().as_u16(),
        message: response.text().await.unwrap_or_default(),
    }
}

#[async_trait]
impl SnapshotSource for HttpSource {
    async fn fetch(&self, known_version: Option<u64>) -> Result<FetchOutcome, SyncError> {
        let mut request = self
            .client
            .get(self.snapshot_url())
            .timeout(self.request_timeout);
        if let Some(version) = known_version {
            request = request.header(IF_NONE_MATCH, format!("\"{}\"", version));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout
            } else {
                SyncError::Request(e)
            }
        })?;

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(FetchOutcome::NotModified),
            status if status.is_success() => {
                let body = response.text().await?;
                let snapshot: Snapshot =
                    serde_json::from_str(&body).map_err(|e| SyncError::Parse(e.to_string()))?;
                debug!(version = snapshot.version, "Fetched snapshot");
                Ok(FetchOutcome::Updated(snapshot))
            }
            _ => Err(server_error(response).await),
        }
    }

    async fn subscribe(&self) -> Result<SnapshotStream, SyncError> {
        let request = self
            .client
            .get(self.stream_url())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send();
        // Only the connect is bounded; the body stays open for pushes
        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| SyncError::Timeout)??;

        if !response.status().is_success() {
            return Err(server_error(response).await);
        }

        let bytes = response.bytes_stream().map(|chunk| chunk.map_err(SyncError::from));
        Ok(snapshot_events(bytes, self.idle_timeout))
    }
}

#[async_trait]
impl TelemetrySink for HttpSource {
    async fn send(&self, events: Vec<TelemetryEvent>) -> Result<(), SyncError> {
        let Some(project_id) = self.project_id else {
            return Ok(());
        };

        let response = self
            .client
            .post(format!("{}/telemetry/{}/events", self.base_url, project_id))
            .timeout(self.request_timeout)
            .json(&events)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(server_error(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn snapshot_body(version: u64) -> serde_json::Value {
        let mut snapshot = Snapshot::empty(Uuid::nil());
        snapshot.version = version;
        serde_json::to_value(snapshot).unwrap()
    }

    async fn source(server: &MockServer) -> HttpSource {
        HttpSource::new(server.uri(), "production", Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/snapshot/production"))
            .respond_with(ResponseTemplate::new(200).set_body_json(snapshot_body(3)))
            .mount(&server)
            .await;

        let outcome = source(&server).await.fetch(None).await.unwrap();
        match outcome {
            FetchOutcome::Updated(snapshot) => assert_eq!(snapshot.version, 3),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conditional_fetch_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/snapshot/production"))
            .and(header("if-none-match", "\"3\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let outcome = source(&server).await.fetch(Some(3)).await.unwrap();
        assert_eq!(outcome, FetchOutcome::NotModified);
    }

    #[tokio::test]
    async fn test_fetch_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/snapshot/production"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Environment not found"))
            .mount(&server)
            .await;

        let err = source(&server).await.fetch(None).await.unwrap_err();
        match err {
            SyncError::Server { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Environment not found");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/snapshot/production"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(snapshot_body(1))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let source = HttpSource::new(server.uri(), "production", Duration::from_millis(100)).unwrap();
        let err = source.fetch(None).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
    }

    #[tokio::test]
    async fn test_subscribe_parses_snapshot_events() {
        let server = MockServer::start().await;
        let body = format!(
            ": keep-alive\n\nevent: snapshot\nid: 1\ndata: {}\n\nevent: other\ndata: ignored\n\nevent: snapshot\nid: 2\ndata: {}\n\n",
            snapshot_body(1),
            snapshot_body(2)
        );
        Mock::given(method("GET"))
            .and(path("/stream/production"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let stream = source(&server).await.subscribe().await.unwrap();
        let versions: Vec<u64> = stream
            .map(|item| item.unwrap().version)
            .collect()
            .await;
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_subscribe_connect_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream/production"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let source = HttpSource::new(server.uri(), "production", Duration::from_millis(100)).unwrap();
        let err = source.subscribe().await.err().unwrap();
        assert!(matches!(err, SyncError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_times_out() {
        // Each chunk lands 30s after the last, then the server goes quiet
        let chunks = stream::iter(vec![
            Ok::<_, SyncError>(format!("event: snapshot\ndata: {}\n\n", snapshot_body(1))),
            Ok(": keep-alive\n\n".to_string()),
            Ok(": keep-alive\n\n".to_string()),
            Ok(": keep-alive\n\n".to_string()),
        ])
        .then(|chunk| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            chunk
        })
        .chain(stream::pending());

        let started = tokio::time::Instant::now();
        let mut events = snapshot_events(chunks, Duration::from_secs(45));
        assert_eq!(events.next().await.unwrap().unwrap().version, 1);

        assert!(matches!(events.next().await, Some(Err(SyncError::Timeout))));
        assert!(started.elapsed() >= Duration::from_secs(120 + 45));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_telemetry_posted_to_project() {
        let server = MockServer::start().await;
        let project = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path(format!("/telemetry/{}/events", project)))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = source(&server).await.with_project(project);
        sink.send(vec![]).await.unwrap();
    }
}
