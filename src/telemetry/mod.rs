//! Best-effort live feed of evaluation outcomes, per project.
//!
//! Every observer owns a bounded ring: when it is full the oldest event is
//! evicted. Emitting never waits on an observer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::evaluation::{EvaluationContext, EvaluationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Server,
    Sdk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub environment_id: Uuid,
    pub flag_key: String,
    pub result: EvaluationResult,
    pub duration_us: u64,
    pub evaluated_at: DateTime<Utc>,
    #[serde(default)]
    pub bucketing_key: Option<String>,
    /// Names only; attribute values never leave the evaluating process.
    #[serde(default)]
    pub attribute_names: Vec<String>,
    pub origin: Origin,
}

impl TelemetryEvent {
    pub fn new(
        environment_id: Uuid,
        result: EvaluationResult,
        context: &EvaluationContext,
        duration_us: u64,
        origin: Origin,
    ) -> Self {
        let mut attribute_names: Vec<String> = context.attributes.keys().cloned().collect();
        attribute_names.sort();

        Self {
            environment_id,
            flag_key: result.flag_key.clone(),
            result,
            duration_us,
            evaluated_at: Utc::now(),
            bucketing_key: context.bucketing_key.clone(),
            attribute_names,
            origin,
        }
    }
}

/// Bounded, lossy, latest-biased queue owned by one observer.
pub struct ObserverQueue {
    id: u64,
    capacity: usize,
    events: Mutex<VecDeque<TelemetryEvent>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl ObserverQueue {
    fn new(id: u64, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: TelemetryEvent) {
        {
            let mut events = self.events.lock();
            if events.len() >= self.capacity {
                events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<TelemetryEvent> {
        self.events.lock().pop_front()
    }
}

pub struct TelemetryHub {
    capacity: usize,
    next_id: AtomicU64,
    observers: RwLock<HashMap<Uuid, Vec<Arc<ObserverQueue>>>>,
    emitted: AtomicU64,
}

impl TelemetryHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            next_id: AtomicU64::new(1),
            observers: RwLock::new(HashMap::new()),
            emitted: AtomicU64::new(0),
        })
    }

    pub fn subscribe(self: &Arc<Self>, project_id: Uuid) -> Observer {
        let queue = Arc::new(ObserverQueue::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            self.capacity,
        ));
        self.observers
            .write()
            .entry(project_id)
            .or_default()
            .push(queue.clone());

        debug!(project_id = %project_id, observer = queue.id, "Telemetry observer subscribed");
        Observer {
            hub: self.clone(),
            project_id,
            queue,
        }
    }

    /// Hand an event to every observer of the project. Never blocks.
    pub fn emit(&self, project_id: Uuid, event: TelemetryEvent) {
        let observers = self.observers.read();
        let Some(queues) = observers.get(&project_id) else {
            return;
        };
        for queue in queues {
            queue.push(event.clone());
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn emit_all(&self, project_id: Uuid, events: impl IntoIterator<Item = TelemetryEvent>) {
        for event in events {
            self.emit(project_id, event);
        }
    }

    pub fn has_observers(&self, project_id: Uuid) -> bool {
        self.observers
            .read()
            .get(&project_id)
            .is_some_and(|queues| !queues.is_empty())
    }

    pub fn observer_count(&self, project_id: Uuid) -> usize {
        self.observers.read().get(&project_id).map_or(0, Vec::len)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    fn unsubscribe(&self, project_id: Uuid, id: u64) {
        let mut observers = self.observers.write();
        if let Some(queues) = observers.get_mut(&project_id) {
            queues.retain(|q| q.id != id);
            if queues.is_empty() {
                observers.remove(&project_id);
            }
        }
        debug!(project_id = %project_id, observer = id, "Telemetry observer unsubscribed");
    }
}

/// A dashboard's subscription. Dropping it unsubscribes.
pub struct Observer {
    hub: Arc<TelemetryHub>,
    project_id: Uuid,
    queue: Arc<ObserverQueue>,
}

impl Observer {
    pub async fn recv(&self) -> TelemetryEvent {
        loop {
            if let Some(event) = self.queue.pop() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<TelemetryEvent> {
        self.queue.pop()
    }

    /// Events evicted from this observer's queue so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> impl Stream<Item = TelemetryEvent> + Send {
        stream::unfold(self, |observer| async move {
            let event = observer.recv().await;
            Some((event, observer))
        })
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.project_id, self.queue.id);
    }
}
