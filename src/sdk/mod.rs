//! Client-side sync: keeps a local snapshot fresh and evaluates against it.
//!
//! A [`SyncClient`] fetches the current snapshot once, then follows the push
//! channel. While push is down it polls with conditional fetches and retries
//! the push channel with capped, jittered backoff. Every snapshot, pushed or
//! polled, goes through the same version check, so out-of-order and
//! duplicate deliveries are harmless.
//!
//! ```ignore
//! let client = SyncClient::builder()
//!     .base_url("https://flags.example.com")
//!     .environment_key("production")
//!     .build()?;
//! client.ready().await?;
//! let enabled = client.get_bool("new-ui", false);
//! ```

pub mod backoff;
pub mod cache;
pub mod reporter;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::evaluation::{self, EvaluationContext, EvaluationResult};
use crate::snapshot::Snapshot;
use crate::telemetry::{Origin, TelemetryEvent};

pub use backoff::{Backoff, BackoffConfig};
pub use cache::SnapshotCache;
pub use reporter::{ReporterConfig, TelemetryReporter};
pub use transport::{FetchOutcome, HttpSource, SnapshotSource, SnapshotStream, TelemetrySink};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub backoff: BackoffConfig,
    /// Follow the push channel; when false the client only polls.
    pub push: bool,
    pub reporter: ReporterConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            push: true,
            reporter: ReporterConfig::default(),
        }
    }
}

type Listener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

struct Identity {
    context: Option<EvaluationContext>,
    /// Per-instance key used when the context carries none; `reset` rotates it.
    anonymous_key: String,
}

struct Inner {
    source: Arc<dyn SnapshotSource>,
    config: SyncConfig,
    cache: SnapshotCache,
    identity: RwLock<Identity>,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener: AtomicU64,
    /// Held shared while callbacks run; `close` takes it exclusively.
    callback_gate: RwLock<()>,
    ready: watch::Sender<bool>,
    push_connected: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    reporter: Option<TelemetryReporter>,
}

impl Inner {
    /// Version-checked cache update; notifies listeners when it changed.
    fn apply(&self, snapshot: Snapshot) -> bool {
        let _gate = self.callback_gate.read();
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        let version = snapshot.version;
        let snapshot = Arc::new(snapshot);
        let changed = self.cache.apply(snapshot.clone());
        self.ready.send_replace(true);

        if changed {
            debug!(version, "Applied snapshot");
            let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
            for listener in listeners {
                listener(&snapshot);
            }
        } else {
            debug!(version, current = ?self.cache.version(), "Ignored snapshot that is not newer");
        }
        changed
    }

    /// One conditional fetch, bounded by the request timeout.
    async fn fetch_once(&self) -> Result<bool, SyncError> {
        let fetch = self.source.fetch(self.cache.version());
        let outcome = tokio::time::timeout(self.config.request_timeout, fetch)
            .await
            .map_err(|_| SyncError::Timeout)??;

        match outcome {
            FetchOutcome::Updated(snapshot) => Ok(self.apply(snapshot)),
            FetchOutcome::NotModified => {
                if self.cache.version().is_some() {
                    self.ready.send_replace(true);
                }
                Ok(false)
            }
        }
    }

    fn context_for(&self, explicit: Option<&EvaluationContext>) -> EvaluationContext {
        let identity = self.identity.read();
        let mut context = explicit
            .or(identity.context.as_ref())
            .cloned()
            .unwrap_or_default();
        if context.bucketing_key.is_none() {
            context.bucketing_key = Some(identity.anonymous_key.clone());
        }
        context
    }
}

/// Handle returned by [`SyncClient::on_update`].
pub struct ListenerHandle {
    id: u64,
    inner: Weak<Inner>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().remove(&self.id);
        }
    }
}

pub struct SyncClient {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn builder() -> SyncClientBuilder {
        SyncClientBuilder::default()
    }

    /// Resolves once the first snapshot is cached.
    pub async fn ready(&self) -> Result<(), SyncError> {
        let mut ready = self.inner.ready.subscribe();
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(SyncError::Closed),
            result = ready.wait_for(|r| *r) => result.map(|_| ()).map_err(|_| SyncError::Closed),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Evaluate with the identified context (or `context`, when given).
    pub fn get(&self, flag_key: &str, fallback: Value, context: Option<&EvaluationContext>) -> Value {
        self.get_detail(flag_key, fallback, context).value
    }

    pub fn get_detail(
        &self,
        flag_key: &str,
        fallback: Value,
        context: Option<&EvaluationContext>,
    ) -> EvaluationResult {
        let context = self.inner.context_for(context);
        let Some(snapshot) = self.inner.cache.load() else {
            return EvaluationResult::fallback(flag_key, &fallback);
        };

        let started = Instant::now();
        let result = evaluation::evaluate(&snapshot, flag_key, &context, &fallback);

        if let Some(reporter) = &self.inner.reporter {
            reporter.record(TelemetryEvent::new(
                snapshot.environment_id,
                result.clone(),
                &context,
                started.elapsed().as_micros() as u64,
                Origin::Sdk,
            ));
        }
        result
    }

    /// Boolean flag; a non-boolean value yields `fallback`.
    pub fn get_bool(&self, flag_key: &str, fallback: bool) -> bool {
        self.get(flag_key, Value::Bool(fallback), None)
            .as_bool()
            .unwrap_or(fallback)
    }

    pub fn get_string(&self, flag_key: &str, fallback: &str) -> String {
        match self.get(flag_key, Value::String(fallback.to_string()), None) {
            Value::String(s) => s,
            _ => fallback.to_string(),
        }
    }

    /// Call `listener` after every snapshot change.
    pub fn on_update(&self, listener: impl Fn(&Snapshot) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().insert(id, Arc::new(listener));
        ListenerHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Context used by evaluations that do not pass one.
    pub fn identify(&self, context: EvaluationContext) {
        self.inner.identity.write().context = Some(context);
    }

    /// Forget the identified context and start a new anonymous identity.
    /// The cached snapshot is kept.
    pub fn reset(&self) {
        let mut identity = self.inner.identity.write();
        identity.context = None;
        identity.anonymous_key = Uuid::new_v4().to_string();
    }

    /// Fetch now, regardless of the polling cadence. Returns whether the
    /// cache changed. Dropping the future leaves the cache untouched.
    pub async fn refresh(&self) -> Result<bool, SyncError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        tokio::select! {
            result = self.inner.fetch_once() => result,
            _ = self.inner.shutdown.cancelled() => Err(SyncError::Closed),
        }
    }

    pub fn version(&self) -> Option<u64> {
        self.inner.cache.version()
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.cache.load()
    }

    pub fn is_push_connected(&self) -> bool {
        self.inner.push_connected.load(Ordering::SeqCst)
    }

    /// Stop timers and the push connection and wait for them. No listener is
    /// called once this returns. Evaluation keeps working on the last snapshot.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        // Wait out callbacks already running
        drop(self.inner.callback_gate.write());

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.inner.listeners.lock().clear();
        self.inner.push_connected.store(false, Ordering::SeqCst);
        info!("Sync client closed");
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[derive(Default)]
pub struct SyncClientBuilder {
    base_url: Option<String>,
    environment_key: Option<String>,
    project_id: Option<Uuid>,
    source: Option<Arc<dyn SnapshotSource>>,
    sink: Option<Arc<dyn TelemetrySink>>,
    context: Option<EvaluationContext>,
    config: SyncConfig,
}

impl SyncClientBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn environment_key(mut self, key: impl Into<String>) -> Self {
        self.environment_key = Some(key.into());
        self
    }

    /// Enables telemetry reporting to the HTTP source's ingest endpoint.
    pub fn project_id(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Use a custom transport instead of HTTP.
    pub fn source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn context(mut self, context: EvaluationContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn push(mut self, enabled: bool) -> Self {
        self.config.push = enabled;
        self
    }

    pub fn reporter(mut self, reporter: ReporterConfig) -> Self {
        self.config.reporter = reporter;
        self
    }

    /// Build the client and start syncing. Must run inside a tokio runtime.
    pub fn build(self) -> Result<SyncClient, SyncError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(SyncError::InvalidConfig(
                "SyncClient must be built inside a tokio runtime".to_string(),
            ));
        }
        if self.config.poll_interval.is_zero() {
            return Err(SyncError::InvalidConfig("poll interval must be positive".to_string()));
        }
        if self.config.backoff.base.is_zero() || self.config.backoff.cap < self.config.backoff.base {
            return Err(SyncError::InvalidConfig(
                "backoff base must be positive and no larger than its cap".to_string(),
            ));
        }
        if self.config.reporter.flush_interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "telemetry flush interval must be positive".to_string(),
            ));
        }
        if self.config.reporter.batch_size == 0 || self.config.reporter.buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "telemetry batch size and buffer must be positive".to_string(),
            ));
        }

        let (source, sink): (Arc<dyn SnapshotSource>, Option<Arc<dyn TelemetrySink>>) =
            match (self.source, self.base_url, self.environment_key) {
                (Some(source), _, _) => (source, self.sink),
                (None, Some(base_url), Some(environment_key)) => {
                    let http = HttpSource::new(base_url, environment_key, self.config.request_timeout)?;
                    let sink = match (self.sink, self.project_id) {
                        (Some(sink), _) => Some(sink),
                        (None, Some(project_id)) => {
                            Some(Arc::new(http.clone().with_project(project_id)) as Arc<dyn TelemetrySink>)
                        }
                        (None, None) => None,
                    };
                    (Arc::new(http) as Arc<dyn SnapshotSource>, sink)
                }
                _ => {
                    return Err(SyncError::InvalidConfig(
                        "either a source or both base_url and environment_key are required".to_string(),
                    ))
                }
            };

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let reporter = sink.map(|sink| {
            let (reporter, handle) =
                TelemetryReporter::spawn(sink, self.config.reporter.clone(), shutdown.clone());
            tasks.push(handle);
            reporter
        });

        let (ready, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            source,
            config: self.config,
            cache: SnapshotCache::new(),
            identity: RwLock::new(Identity {
                context: self.context,
                anonymous_key: Uuid::new_v4().to_string(),
            }),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            callback_gate: RwLock::new(()),
            ready,
            push_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
            reporter,
        });

        tasks.push(tokio::spawn(poll_loop(inner.clone())));
        if inner.config.push {
            tasks.push(tokio::spawn(push_loop(inner.clone())));
        }

        Ok(SyncClient {
            inner,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Initial fetch (retried until it succeeds), then conditional polling
/// whenever push is not connected.
async fn poll_loop(inner: Arc<Inner>) {
    let mut backoff = Backoff::new(inner.config.backoff.clone());
    loop {
        let initial = tokio::select! {
            result = inner.fetch_once() => result,
            _ = inner.shutdown.cancelled() => return,
        };
        match initial {
            Ok(_) => break,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "Initial fetch failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.shutdown.cancelled() => return,
                }
            }
        }
    }

    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.shutdown.cancelled() => return,
        }
        if inner.push_connected.load(Ordering::SeqCst) {
            continue;
        }

        let result = tokio::select! {
            result = inner.fetch_once() => result,
            _ = inner.shutdown.cancelled() => return,
        };
        if let Err(e) = result {
            debug!(error = %e, "Poll failed");
        }
    }
}

/// Hold the push channel open, reconnecting with backoff.
async fn push_loop(inner: Arc<Inner>) {
    let mut backoff = Backoff::new(inner.config.backoff.clone());
    loop {
        let connect = tokio::select! {
            result = inner.source.subscribe() => result,
            _ = inner.shutdown.cancelled() => return,
        };

        match connect {
            Ok(mut stream) => {
                inner.push_connected.store(true, Ordering::SeqCst);
                info!("Push channel connected");

                loop {
                    let item = tokio::select! {
                        item = stream.next() => item,
                        _ = inner.shutdown.cancelled() => {
                            inner.push_connected.store(false, Ordering::SeqCst);
                            return;
                        }
                    };
                    match item {
                        Some(Ok(snapshot)) => {
                            backoff.reset();
                            inner.apply(snapshot);
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Push channel error");
                            if !e.is_retryable() {
                                inner.push_connected.store(false, Ordering::SeqCst);
                                return;
                            }
                            break;
                        }
                        None => {
                            debug!("Push channel closed by server");
                            break;
                        }
                    }
                }
                inner.push_connected.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                debug!(error = %e, "Push channel unavailable");
                if !e.is_retryable() {
                    return;
                }
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempt(), "Reconnecting push channel");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{FlagDefinition, FlagKind, TargetingRules, Variation};
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Snapshot with a single boolean flag `new-ui` whose default is `value`.
    fn snapshot(version: u64, value: bool) -> Snapshot {
        let mut snapshot = Snapshot::empty(Uuid::nil());
        snapshot.version = version;
        let default = if value { "on" } else { "off" };
        snapshot.flags.insert(
            "new-ui".to_string(),
            FlagDefinition {
                id: Uuid::nil(),
                key: "new-ui".to_string(),
                kind: FlagKind::Boolean,
                variations: vec![
                    Variation { id: "on".to_string(), value: json!(true), is_default: value },
                    Variation { id: "off".to_string(), value: json!(false), is_default: !value },
                ],
            },
        );
        snapshot.rules.insert(
            "new-ui".to_string(),
            TargetingRules {
                targets: vec![],
                enabled: true,
                default_variation_id: default.to_string(),
                default_rollout: None,
                off_variation_id: "off".to_string(),
            },
        );
        snapshot
    }

    /// Scripted source: fetches pop from a queue (after an optional delay),
    /// pushes come from a channel the test controls.
    struct FakeSource {
        fetches: Mutex<VecDeque<Result<FetchOutcome, SyncError>>>,
        fetch_delay: Duration,
        fetch_count: AtomicUsize,
        subscribe_count: AtomicUsize,
        push: Mutex<Option<mpsc::UnboundedReceiver<Snapshot>>>,
    }

    impl FakeSource {
        fn new(fetches: Vec<Result<FetchOutcome, SyncError>>) -> Self {
            Self {
                fetches: Mutex::new(fetches.into()),
                fetch_delay: Duration::ZERO,
                fetch_count: AtomicUsize::new(0),
                subscribe_count: AtomicUsize::new(0),
                push: Mutex::new(None),
            }
        }

        fn with_push(self) -> (Self, mpsc::UnboundedSender<Snapshot>) {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.push.lock() = Some(rx);
            (self, tx)
        }
    }

    #[async_trait]
    impl SnapshotSource for FakeSource {
        async fn fetch(&self, _known_version: Option<u64>) -> Result<FetchOutcome, SyncError> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            if !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
            self.fetches
                .lock()
                .pop_front()
                .unwrap_or(Ok(FetchOutcome::NotModified))
        }

        async fn subscribe(&self) -> Result<SnapshotStream, SyncError> {
            self.subscribe_count.fetch_add(1, Ordering::SeqCst);
            match self.push.lock().take() {
                Some(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|s| (Ok(s), rx))
                })
                .boxed()),
                None => Err(SyncError::transport("push unavailable")),
            }
        }
    }

    fn client(source: FakeSource, push: bool) -> SyncClient {
        SyncClient::builder()
            .source(Arc::new(source))
            .push(push)
            .poll_interval(Duration::from_secs(10))
            .request_timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fallback_before_ready() {
        let mut source = FakeSource::new(vec![Ok(FetchOutcome::Updated(snapshot(1, true)))]);
        source.fetch_delay = Duration::from_secs(60);
        let client = client(source, false);

        let result = client.get_detail("new-ui", json!("fb"), None);
        assert_eq!(result.reason, evaluation::Reason::Fallback);
        assert_eq!(result.value, json!("fb"));
        assert!(!client.get_bool("new-ui", false));
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_initial_fetch() {
        let source = FakeSource::new(vec![
            Err(SyncError::transport("connection refused")),
            Ok(FetchOutcome::Updated(snapshot(1, true))),
        ]);
        let client = client(source, false);

        client.ready().await.unwrap();
        assert_eq!(client.version(), Some(1));
        assert!(client.get_bool("new-ui", false));
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_newer_wins_over_slower_poll() {
        // Poll answers v4 after a delay; push delivers v5 in the meantime
        let mut source = FakeSource::new(vec![Ok(FetchOutcome::Updated(snapshot(4, false)))]);
        source.fetch_delay = Duration::from_secs(1);
        let (source, push) = source.with_push();
        let client = client(source, true);

        push.send(snapshot(5, true)).unwrap();
        client.ready().await.unwrap();
        assert_eq!(client.version(), Some(5));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(client.version(), Some(5));
        assert!(client.get_bool("new-ui", false));
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_older_pushes_are_ignored() {
        let (source, push) = FakeSource::new(vec![]).with_push();
        let client = client(source, true);

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        let _handle = client.on_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for version in [3, 3, 2, 4, 4] {
            push.send(snapshot(version, true)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(client.version(), Some(4));
        assert_eq!(updates.load(Ordering::SeqCst), 2);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_while_push_unavailable() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(FetchOutcome::Updated(snapshot(1, false))),
            Ok(FetchOutcome::NotModified),
            Ok(FetchOutcome::Updated(snapshot(2, true))),
        ]));
        let client = SyncClient::builder()
            .source(source.clone())
            .poll_interval(Duration::from_secs(10))
            .build()
            .unwrap();

        client.ready().await.unwrap();
        assert!(!client.is_push_connected());
        assert_eq!(client.version(), Some(1));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(client.version(), Some(2));
        assert!(source.fetch_count.load(Ordering::SeqCst) >= 3);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_resumes_when_push_drops() {
        let (source, push) = FakeSource::new(vec![
            Ok(FetchOutcome::Updated(snapshot(1, false))),
            Ok(FetchOutcome::Updated(snapshot(2, true))),
        ])
        .with_push();
        let source = Arc::new(source);
        let client = SyncClient::builder()
            .source(source.clone())
            .poll_interval(Duration::from_secs(10))
            .build()
            .unwrap();

        client.ready().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.is_push_connected());
        assert_eq!(client.version(), Some(1));
        assert_eq!(source.fetch_count.load(Ordering::SeqCst), 1);

        drop(push);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!client.is_push_connected());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(client.version(), Some(2));
        assert!(client.get_bool("new-ui", false));
        assert!(source.subscribe_count.load(Ordering::SeqCst) >= 2);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_forces_fetch() {
        let source = FakeSource::new(vec![
            Ok(FetchOutcome::Updated(snapshot(1, false))),
            Ok(FetchOutcome::Updated(snapshot(2, true))),
        ]);
        let client = client(source, false);
        client.ready().await.unwrap();

        assert!(client.refresh().await.unwrap());
        assert_eq!(client.version(), Some(2));
        assert!(!client.refresh().await.unwrap());
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_leaves_cache() {
        let mut source = FakeSource::new(vec![Ok(FetchOutcome::Updated(snapshot(1, false)))]);
        source.fetch_delay = Duration::from_secs(30);
        let client = SyncClient::builder()
            .source(Arc::new(source))
            .push(false)
            .request_timeout(Duration::from_secs(1))
            .build()
            .unwrap();

        let err = client.refresh().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
        assert_eq!(client.version(), None);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_callbacks_after_close() {
        let (source, push) = FakeSource::new(vec![]).with_push();
        let client = client(source, true);

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        let _handle = client.on_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        push.send(snapshot(1, true)).unwrap();
        client.ready().await.unwrap();
        client.close().await;
        let seen = updates.load(Ordering::SeqCst);

        let _ = push.send(snapshot(2, true));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(updates.load(Ordering::SeqCst), seen);
        assert_eq!(client.version(), Some(1));
        assert!(matches!(client.refresh().await, Err(SyncError::Closed)));
        assert!(matches!(client.ready().await, Err(SyncError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_listener() {
        let (source, push) = FakeSource::new(vec![]).with_push();
        let client = client(source, true);

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        let handle = client.on_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        push.send(snapshot(1, true)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.unsubscribe();
        push.send(snapshot(2, true)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(client.version(), Some(2));
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_and_reset() {
        let mut split = snapshot(1, false);
        if let Some(rules) = split.rules.get_mut("new-ui") {
            rules.default_rollout = Some(vec![
                crate::snapshot::WeightedVariation { variation_id: "on".to_string(), weight: 20_000 },
                crate::snapshot::WeightedVariation { variation_id: "off".to_string(), weight: 80_000 },
            ]);
        }
        let source = FakeSource::new(vec![Ok(FetchOutcome::Updated(split))]);
        let client = client(source, false);
        client.ready().await.unwrap();

        // user-42 lands in bucket 23286, outside the 20% slice
        client.identify(EvaluationContext::new().with_key("user-42"));
        assert!(!client.get_bool("new-ui", true));

        // Explicit context overrides the identity
        let other = EvaluationContext::new().with_key("user-1");
        let detail = client.get_detail("new-ui", json!(null), Some(&other));
        assert_eq!(detail.reason, evaluation::Reason::Default);

        client.reset();
        assert_eq!(client.version(), Some(1));
        let anonymous = client.inner.context_for(None);
        assert_ne!(anonymous.bucketing_key.as_deref(), Some("user-42"));
        // Anonymous key is stable until the next reset
        assert_eq!(client.inner.context_for(None), anonymous);
        client.reset();
        assert_ne!(client.inner.context_for(None), anonymous);
        client.close().await;
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = SyncClient::builder()
            .base_url("http://localhost:1")
            .environment_key("production")
            .build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_build_requires_source() {
        let result = SyncClient::builder().environment_key("production").build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_build_rejects_zero_timings() {
        let source = || Arc::new(FakeSource::new(vec![]));

        let result = SyncClient::builder()
            .source(source())
            .reporter(ReporterConfig {
                flush_interval: Duration::ZERO,
                ..ReporterConfig::default()
            })
            .build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));

        let result = SyncClient::builder()
            .source(source())
            .reporter(ReporterConfig {
                batch_size: 0,
                ..ReporterConfig::default()
            })
            .build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));

        let result = SyncClient::builder()
            .source(source())
            .backoff(BackoffConfig {
                base: Duration::ZERO,
                cap: Duration::from_secs(30),
            })
            .build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));

        let result = SyncClient::builder()
            .source(source())
            .backoff(BackoffConfig {
                base: Duration::from_secs(5),
                cap: Duration::from_secs(1),
            })
            .build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }
}
