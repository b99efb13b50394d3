//! Per-environment fan-out actor.
//!
//! A room is a tokio task that owns the latest snapshot of one environment and
//! the senders of every live subscriber. All state transitions go through its
//! command channel, so they are applied one at a time. Broadcasting never
//! waits on a subscriber: each has a bounded queue filled with `try_send`, and
//! a subscriber whose queue is full is dropped (its stream ends and the client
//! reconnects).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RoomUnavailable;
use crate::snapshot::Snapshot;
use crate::store::SnapshotStore;

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Queue depth per subscriber before it is considered stuck.
    pub subscriber_buffer: usize,
    /// How long a room with no subscribers lives before it stops.
    pub idle_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 16,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub environment_id: Uuid,
    pub version: Option<u64>,
    pub subscribers: usize,
    pub snapshots_published: u64,
    pub subscribers_dropped: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Stored and pushed to `delivered` subscribers; `dropped` were cut off.
    Applied { delivered: usize, dropped: usize },
    /// The room already holds `current`, which is at least as new.
    Stale { current: u64 },
}

/// A live subscription. The first item is the room's current snapshot, if it
/// has one; the stream ends when the room drops the subscriber or stops.
pub struct Subscription {
    receiver: mpsc::Receiver<Arc<Snapshot>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<Snapshot>> {
        self.receiver.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<Arc<Snapshot>> {
        ReceiverStream::new(self.receiver)
    }
}

enum RoomCommand {
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Publish {
        snapshot: Arc<Snapshot>,
        reply: oneshot::Sender<PublishOutcome>,
    },
    Current {
        reply: oneshot::Sender<Option<Arc<Snapshot>>>,
    },
    Stats {
        reply: oneshot::Sender<RoomStats>,
    },
}

/// Cheap, clonable address of a running room.
#[derive(Clone)]
pub struct RoomHandle {
    environment_id: Uuid,
    commands: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn environment_id(&self) -> Uuid {
        self.environment_id
    }

    /// True once the room task has stopped (hibernated or crashed).
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn subscribe(&self) -> Result<Subscription, RoomUnavailable> {
        self.request(|reply| RoomCommand::Subscribe { reply }).await
    }

    pub async fn publish(&self, snapshot: Arc<Snapshot>) -> Result<PublishOutcome, RoomUnavailable> {
        self.request(|reply| RoomCommand::Publish { snapshot, reply })
            .await
    }

    pub async fn current(&self) -> Result<Option<Arc<Snapshot>>, RoomUnavailable> {
        self.request(|reply| RoomCommand::Current { reply }).await
    }

    pub async fn stats(&self) -> Result<RoomStats, RoomUnavailable> {
        self.request(|reply| RoomCommand::Stats { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RoomUnavailable> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| RoomUnavailable(self.environment_id))?;
        response.await.map_err(|_| RoomUnavailable(self.environment_id))
    }
}

struct Room {
    environment_id: Uuid,
    config: RoomConfig,
    store: Arc<dyn SnapshotStore>,
    snapshot: Option<Arc<Snapshot>>,
    /// Whether durable storage has been consulted since the room started.
    loaded: bool,
    subscribers: Vec<mpsc::Sender<Arc<Snapshot>>>,
    idle_since: Option<Instant>,
    published: u64,
    dropped: u64,
    started_at: DateTime<Utc>,
}

/// Start a room task for `environment_id` and return its handle.
pub fn spawn(
    environment_id: Uuid,
    store: Arc<dyn SnapshotStore>,
    config: RoomConfig,
) -> RoomHandle {
    let (commands, inbox) = mpsc::channel(COMMAND_BUFFER);
    let room = Room {
        environment_id,
        config,
        store,
        snapshot: None,
        loaded: false,
        subscribers: Vec::new(),
        idle_since: Some(Instant::now()),
        published: 0,
        dropped: 0,
        started_at: Utc::now(),
    };
    tokio::spawn(room.run(inbox));

    RoomHandle {
        environment_id,
        commands,
    }
}

impl Room {
    async fn run(mut self, mut inbox: mpsc::Receiver<RoomCommand>) {
        debug!(environment_id = %self.environment_id, "Room started");

        let check_every = (self.config.idle_timeout / 4).max(Duration::from_millis(100));
        let mut idle_check = tokio::time::interval(check_every);
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = idle_check.tick() => {
                    self.forget_closed();
                    if self.should_hibernate() {
                        info!(
                            environment_id = %self.environment_id,
                            version = ?self.snapshot.as_ref().map(|s| s.version),
                            "Room idle, hibernating"
                        );
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Subscribe { reply } => {
                // Refuse rather than attach a subscriber that would never see
                // the stored snapshot; the caller keeps polling meanwhile.
                if !self.ensure_loaded().await {
                    drop(reply);
                    return;
                }
                let subscription = self.attach();
                let _ = reply.send(subscription);
            }
            RoomCommand::Publish { snapshot, reply } => {
                let _ = self.ensure_loaded().await;
                let _ = reply.send(self.apply(snapshot));
            }
            RoomCommand::Current { reply } => {
                let _ = self.ensure_loaded().await;
                let _ = reply.send(self.snapshot.clone());
            }
            RoomCommand::Stats { reply } => {
                self.forget_closed();
                let _ = reply.send(RoomStats {
                    environment_id: self.environment_id,
                    version: self.snapshot.as_ref().map(|s| s.version),
                    subscribers: self.subscribers.len(),
                    snapshots_published: self.published,
                    subscribers_dropped: self.dropped,
                    started_at: self.started_at,
                });
            }
        }
    }

    /// Recover the latest snapshot from durable storage on first use.
    /// Returns whether storage has been consulted successfully.
    async fn ensure_loaded(&mut self) -> bool {
        if self.loaded {
            return true;
        }
        match self.store.latest(self.environment_id).await {
            Ok(Some(snapshot)) => {
                debug!(
                    environment_id = %self.environment_id,
                    version = snapshot.version,
                    "Room recovered snapshot from storage"
                );
                let newer = self
                    .snapshot
                    .as_ref()
                    .map_or(true, |current| snapshot.version > current.version);
                if newer {
                    self.snapshot = Some(Arc::new(snapshot));
                }
                self.loaded = true;
            }
            Ok(None) => self.loaded = true,
            Err(e) => {
                // Stay unloaded so the next command retries
                warn!(environment_id = %self.environment_id, error = %e, "Failed to load snapshot");
            }
        }
        self.loaded
    }

    fn attach(&mut self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.config.subscriber_buffer.max(1));
        if let Some(snapshot) = &self.snapshot {
            // A fresh channel always has room for one
            let _ = sender.try_send(snapshot.clone());
        }
        self.subscribers.push(sender);
        self.idle_since = None;

        debug!(
            environment_id = %self.environment_id,
            subscribers = self.subscribers.len(),
            "Subscriber attached"
        );
        Subscription { receiver }
    }

    fn apply(&mut self, snapshot: Arc<Snapshot>) -> PublishOutcome {
        if let Some(current) = &self.snapshot {
            if snapshot.version <= current.version {
                debug!(
                    environment_id = %self.environment_id,
                    incoming = snapshot.version,
                    current = current.version,
                    "Ignoring stale snapshot"
                );
                return PublishOutcome::Stale {
                    current: current.version,
                };
            }
        }

        self.snapshot = Some(snapshot.clone());
        self.published += 1;

        let mut cut_off = 0;
        self.subscribers.retain(|subscriber| match subscriber.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                cut_off += 1;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        self.dropped += cut_off as u64;
        if self.subscribers.is_empty() && self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
        }

        if cut_off > 0 {
            warn!(
                environment_id = %self.environment_id,
                version = snapshot.version,
                dropped = cut_off,
                "Dropped subscribers with full buffers"
            );
        }
        info!(
            environment_id = %self.environment_id,
            version = snapshot.version,
            delivered = self.subscribers.len(),
            "Snapshot broadcast"
        );

        PublishOutcome::Applied {
            delivered: self.subscribers.len(),
            dropped: cut_off,
        }
    }

    fn forget_closed(&mut self) {
        self.subscribers.retain(|s| !s.is_closed());
        if self.subscribers.is_empty() && self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
        }
    }

    fn should_hibernate(&self) -> bool {
        self.idle_since
            .is_some_and(|since| since.elapsed() >= self.config.idle_timeout)
    }
}
