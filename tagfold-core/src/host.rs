//! Projection hosting.
//!
//! A [`ProjectionHost`] is the stateful unit around one
//! [`TagMultiProjector`]: it consumes the event feed in arrival order,
//! sizes the safety window from observed delivery lag, and persists and
//! restores snapshots. [`HostHandle`] wraps a host in a dedicated task with
//! a command mailbox so all mutation happens on a single writer, while any
//! number of callers hold cheap cloneable handles.
//!
//! Lifecycle: restore a compatible snapshot (or start empty), catch up from
//! the log, go live, and persist a final snapshot on deactivation.

use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    event::{Event, TagProjector},
    ident::SortableUniqueId,
    projector::{SnapshotCodecError, TagMultiProjector},
    registry::DomainTypeRegistry,
    snapshot::{BlobAccessor, SnapshotEnvelope, SnapshotStore, StoredSnapshot},
    store::EventStore,
    tag::TagGroup,
    window::{SafeWindow, SafeWindowConfig},
};

const DEFAULT_OFFLOAD_THRESHOLD_BYTES: usize = 256 * 1024;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from projection host operations.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("snapshot codec error: {0}")]
    Codec(#[from] SnapshotCodecError),
    #[error("snapshot store error: {0}")]
    SnapshotStore(#[source] BoxedError),
    #[error("blob store error: {0}")]
    Blob(#[source] BoxedError),
    #[error("event store error: {0}")]
    EventStore(#[source] BoxedError),
    /// No persisted snapshot exists for this projector name and version.
    #[error("no persisted snapshot for projector `{name}` version `{version}`")]
    NoEnvelope { name: String, version: String },
    #[error("a persist operation is already in progress")]
    PersistInProgress,
    #[error("timed out waiting for position {marker}")]
    WaitTimeout { marker: SortableUniqueId },
    /// The host task has stopped and can no longer accept commands.
    #[error("projection host is no longer running")]
    HostStopped,
}

/// Configuration for a [`ProjectionHost`].
#[derive(Clone, Debug)]
pub struct HostOptions {
    pub window: SafeWindowConfig,
    /// Compressed snapshots larger than this are written to the blob store
    /// instead of inline into the snapshot store.
    pub offload_threshold_bytes: usize,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            window: SafeWindowConfig::default(),
            offload_threshold_bytes: DEFAULT_OFFLOAD_THRESHOLD_BYTES,
        }
    }
}

/// Point-in-time host introspection.
#[derive(Clone, Debug)]
pub struct HostStatus {
    pub projector_name: &'static str,
    pub projector_version: &'static str,
    pub events_processed: u64,
    pub item_count: usize,
    pub unsafe_item_count: usize,
    pub current_window: Duration,
    pub window_is_dynamic: bool,
    pub last_position: Option<SortableUniqueId>,
    pub is_catching_up: bool,
    pub has_persisted_snapshot: bool,
}

/// Event delivery telemetry.
#[derive(Clone, Debug)]
pub struct DeliveryStatistics {
    pub events_received: u64,
    pub duplicates_observed: u64,
    pub out_of_order_observed: u64,
    pub last_lag: Option<Duration>,
    pub smoothed_lag: Option<Duration>,
    pub current_window: Duration,
    pub window_is_dynamic: bool,
}

/// Result of a successful persist.
#[derive(Clone, Debug)]
pub struct PersistOutcome {
    pub offloaded: bool,
    pub offload_key: Option<String>,
    pub original_size_bytes: u64,
    pub compressed_size_bytes: u64,
    pub item_count: usize,
    /// Highest position captured in the snapshot.
    pub safe_last: Option<SortableUniqueId>,
}

/// A serialized snapshot waiting on its store writes.
struct PersistJob {
    envelope: SnapshotEnvelope,
    /// Compressed bytes for inline storage; `None` when offloaded.
    inline: Option<Vec<u8>>,
    /// Blob key and bytes when the snapshot exceeds the offload threshold.
    offload: Option<(String, Vec<u8>)>,
    outcome: PersistOutcome,
}

#[derive(Default)]
struct DeliveryCounters {
    events_received: u64,
    duplicates: u64,
    out_of_order: u64,
    last_lag: Option<Duration>,
}

/// Stateful host for one projector over one tag group.
///
/// The host itself is single-threaded: every method takes `&mut self` or
/// `&self` and callers serialize access, normally by wrapping it in a
/// [`HostHandle`]. External collaborators (event store, snapshot store,
/// blob store) are passed per call rather than owned.
pub struct ProjectionHost<P, G>
where
    P: TagProjector,
    G: TagGroup,
{
    projection: TagMultiProjector<P, G>,
    registry: Arc<DomainTypeRegistry>,
    window: SafeWindow,
    options: HostOptions,
    /// Position to resume catch-up after; advanced by every applied event.
    resume_after: Option<SortableUniqueId>,
    events_processed: u64,
    counters: DeliveryCounters,
    catching_up: bool,
    deactivating: bool,
    persist_in_progress: bool,
    envelope: Option<SnapshotEnvelope>,
}

impl<P: TagProjector, G: TagGroup> ProjectionHost<P, G> {
    #[must_use]
    pub fn new(registry: Arc<DomainTypeRegistry>, options: HostOptions) -> Self {
        let window = SafeWindow::new(options.window.clone());
        Self {
            projection: TagMultiProjector::initial(),
            registry,
            window,
            options,
            resume_after: None,
            events_processed: 0,
            counters: DeliveryCounters::default(),
            catching_up: true,
            deactivating: false,
            persist_in_progress: false,
            envelope: None,
        }
    }

    /// Restore state from a persisted snapshot, if a compatible one exists.
    ///
    /// Snapshots are keyed by projector name and version, so a snapshot
    /// written by a different projector version is simply not found and the
    /// host starts empty, rebuilding from the log. The registry's recorded
    /// version for this projector name must agree with the running build as
    /// well. An unreadable snapshot is logged and discarded the same way.
    /// Returns whether a snapshot was restored.
    ///
    /// # Errors
    ///
    /// Returns an error only when the stores themselves fail; bad snapshot
    /// content is never fatal.
    #[tracing::instrument(skip(self, snapshots, blobs), fields(projector = P::NAME))]
    pub async fn restore_from<SS, BA>(
        &mut self,
        snapshots: &SS,
        blobs: &BA,
    ) -> Result<bool, HostError>
    where
        SS: SnapshotStore,
        BA: BlobAccessor,
    {
        self.catching_up = true;
        if let Some(registered) = self.registry.projector_version(P::NAME) {
            if registered != P::VERSION {
                tracing::warn!(
                    registered,
                    running = P::VERSION,
                    "registered projector version differs from this build; rebuilding from log"
                );
                return Ok(false);
            }
        }
        let stored = snapshots
            .get(P::NAME, P::VERSION)
            .await
            .map_err(|e| HostError::SnapshotStore(Box::new(e)))?;
        let Some(stored) = stored else {
            tracing::debug!("no snapshot found; starting empty");
            return Ok(false);
        };
        if stored.envelope.projector_version != P::VERSION {
            tracing::warn!(
                snapshot_version = %stored.envelope.projector_version,
                "discarding snapshot written by a different projector version"
            );
            return Ok(false);
        }

        let bytes = if stored.envelope.is_offloaded {
            let Some(key) = stored.envelope.offload_key.as_deref() else {
                tracing::warn!("offloaded snapshot has no blob key; rebuilding from log");
                return Ok(false);
            };
            match blobs
                .read(key)
                .await
                .map_err(|e| HostError::Blob(Box::new(e)))?
            {
                Some(bytes) => bytes,
                None => {
                    tracing::warn!(key, "offloaded snapshot blob is missing; rebuilding from log");
                    return Ok(false);
                }
            }
        } else {
            match stored.inline {
                Some(bytes) => bytes,
                None => {
                    tracing::warn!("snapshot has neither inline bytes nor blob key; rebuilding from log");
                    return Ok(false);
                }
            }
        };

        match TagMultiProjector::deserialize(&self.registry, &bytes) {
            Ok(projection) => {
                tracing::debug!(
                    items = projection.item_count(),
                    events_processed = stored.envelope.events_processed,
                    "restored projection from snapshot"
                );
                self.projection = projection;
                self.events_processed = stored.envelope.events_processed;
                self.resume_after = stored.envelope.last_sortable_unique_id.clone();
                self.envelope = Some(stored.envelope);
                Ok(true)
            }
            Err(error) => {
                tracing::warn!(%error, "snapshot is unreadable; rebuilding from log");
                Ok(false)
            }
        }
    }

    /// Replay log events after the current resume position.
    ///
    /// Returns the number of events applied and marks the host live.
    ///
    /// # Errors
    ///
    /// Returns an error when the event store read fails.
    #[tracing::instrument(skip(self, store), fields(projector = P::NAME))]
    pub async fn catch_up_from<ES: EventStore>(&mut self, store: &ES) -> Result<usize, HostError> {
        let events = store
            .read_events_after(self.resume_after.as_ref())
            .await
            .map_err(|e| HostError::EventStore(Box::new(e)))?;

        let threshold = self.window.threshold(SystemTime::now());
        for event in &events {
            self.projection = self.projection.apply(event, Some(&threshold));
            self.events_processed += 1;
            self.advance_resume_after(&event.sortable_unique_id);
        }
        self.catching_up = false;
        tracing::debug!(count = events.len(), "catch-up complete");
        Ok(events.len())
    }

    /// Fold one live event into the projection.
    ///
    /// Updates delivery telemetry, feeds the event's lag into the safety
    /// window, and applies the event at the current effective threshold.
    pub fn apply_event(&mut self, event: &Event) {
        let now = SystemTime::now();
        self.counters.events_received += 1;

        if self.projection.last_event_id() == Some(event.id) {
            self.counters.duplicates += 1;
        } else if self
            .resume_after
            .as_ref()
            .is_some_and(|last| event.sortable_unique_id < *last)
        {
            self.counters.out_of_order += 1;
        }

        if let Some(created) = event.sortable_unique_id.timestamp() {
            let lag = now.duration_since(created).unwrap_or(Duration::ZERO);
            self.window.observe(lag, Instant::now());
            self.counters.last_lag = Some(lag);
        }

        let threshold = self.window.threshold(now);
        self.projection = self.projection.apply(event, Some(&threshold));
        self.events_processed += 1;
        self.advance_resume_after(&event.sortable_unique_id);
    }

    #[must_use]
    pub fn status(&self) -> HostStatus {
        HostStatus {
            projector_name: P::NAME,
            projector_version: P::VERSION,
            events_processed: self.events_processed,
            item_count: self.projection.item_count(),
            unsafe_item_count: self.projection.unsafe_item_count(),
            current_window: self.window.effective(),
            window_is_dynamic: self.window.is_dynamic(),
            last_position: self.resume_after.clone(),
            is_catching_up: self.catching_up,
            has_persisted_snapshot: self.envelope.is_some(),
        }
    }

    #[must_use]
    pub fn delivery_statistics(&self) -> DeliveryStatistics {
        DeliveryStatistics {
            events_received: self.counters.events_received,
            duplicates_observed: self.counters.duplicates,
            out_of_order_observed: self.counters.out_of_order,
            last_lag: self.counters.last_lag,
            smoothed_lag: self.window.lag_ema(),
            current_window: self.window.effective(),
            window_is_dynamic: self.window.is_dynamic(),
        }
    }

    /// Serialize the safe view and persist it.
    ///
    /// Compressed bytes above the offload threshold are written to the blob
    /// store and referenced from the envelope; smaller snapshots are stored
    /// inline. In-memory state is never modified, so a failed persist leaves
    /// the host serving as before. The hosted path ([`HostHandle::persist`])
    /// runs the store writes off-task instead so event application never
    /// queues behind persist I/O.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::PersistInProgress`] if a persist is already
    /// running, or the underlying codec/store error.
    #[tracing::instrument(skip(self, snapshots, blobs), fields(projector = P::NAME))]
    pub async fn persist_state<SS, BA>(
        &mut self,
        snapshots: &SS,
        blobs: &BA,
    ) -> Result<PersistOutcome, HostError>
    where
        SS: SnapshotStore,
        BA: BlobAccessor,
    {
        let job = self.begin_persist()?;
        let result = write_snapshot(&job, snapshots, blobs).await;
        self.complete_persist(job, result)
    }

    /// Serialize the safe view and mark a persist in progress.
    ///
    /// The returned job carries everything the store writes need, so the
    /// writes can run elsewhere; [`complete_persist`](Self::complete_persist)
    /// releases the guard and records the result.
    fn begin_persist(&mut self) -> Result<PersistJob, HostError> {
        if self.persist_in_progress {
            return Err(HostError::PersistInProgress);
        }
        let now = SystemTime::now();
        let threshold = self.window.threshold(now);
        let serialized = self.projection.serialize(Some(&threshold))?;
        let compressed_size = serialized.compressed.len();

        let (is_offloaded, offload_key, inline, offload) =
            if compressed_size > self.options.offload_threshold_bytes {
                let key = format!("{}/{}/{}.gz", P::NAME, P::VERSION, Uuid::new_v4());
                (
                    true,
                    Some(key.clone()),
                    None,
                    Some((key, serialized.compressed)),
                )
            } else {
                (false, None, Some(serialized.compressed), None)
            };

        let stamp = Utc::now();
        let envelope = SnapshotEnvelope {
            projector_name: P::NAME.to_string(),
            projector_version: P::VERSION.to_string(),
            payload_type_name: self.payload_type_name(),
            last_sortable_unique_id: self.resume_after.clone(),
            events_processed: self.events_processed,
            is_offloaded,
            offload_key: offload_key.clone(),
            original_size_bytes: serialized.original_size as u64,
            compressed_size_bytes: compressed_size as u64,
            safe_window_threshold: Some(threshold),
            created_at: self.created_at(stamp),
            updated_at: stamp,
            build_source: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"))
                .to_string(),
            build_host: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        };

        self.persist_in_progress = true;
        Ok(PersistJob {
            envelope,
            inline,
            offload,
            outcome: PersistOutcome {
                offloaded: is_offloaded,
                offload_key,
                original_size_bytes: serialized.original_size as u64,
                compressed_size_bytes: compressed_size as u64,
                item_count: serialized.item_count,
                safe_last: serialized.safe_last,
            },
        })
    }

    /// Record the result of a finished persist and release the guard.
    fn complete_persist(
        &mut self,
        job: PersistJob,
        result: Result<(), HostError>,
    ) -> Result<PersistOutcome, HostError> {
        self.persist_in_progress = false;
        result?;
        tracing::debug!(
            projector = P::NAME,
            items = job.outcome.item_count,
            compressed_size = job.outcome.compressed_size_bytes,
            offloaded = job.outcome.offloaded,
            "persisted projection snapshot"
        );
        self.envelope = Some(job.envelope);
        Ok(job.outcome)
    }

    /// Relabel the persisted snapshot with a new projector version.
    ///
    /// Metadata-only: the snapshot bytes are untouched. Used to adopt an
    /// existing snapshot after a projector version bump whose logic change
    /// is known not to affect stored state.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoEnvelope`] when no snapshot is persisted.
    pub async fn overwrite_persisted_version<SS: SnapshotStore>(
        &mut self,
        snapshots: &SS,
        new_version: &str,
    ) -> Result<(), HostError> {
        let mut stored = snapshots
            .get(P::NAME, P::VERSION)
            .await
            .map_err(|e| HostError::SnapshotStore(Box::new(e)))?
            .ok_or_else(|| HostError::NoEnvelope {
                name: P::NAME.to_string(),
                version: P::VERSION.to_string(),
            })?;

        stored.envelope.projector_version = new_version.to_string();
        stored.envelope.updated_at = Utc::now();
        let envelope = stored.envelope.clone();
        snapshots
            .put(stored)
            .await
            .map_err(|e| HostError::SnapshotStore(Box::new(e)))?;
        if new_version != P::VERSION {
            snapshots
                .delete(P::NAME, P::VERSION)
                .await
                .map_err(|e| HostError::SnapshotStore(Box::new(e)))?;
        }
        self.envelope = Some(envelope);
        Ok(())
    }

    /// Re-read the feed tail and fold anything new.
    ///
    /// Also recomputes the threshold, so previously tentative events may
    /// settle even when the tail is empty. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when the event store read fails.
    pub async fn refresh<ES: EventStore>(&mut self, store: &ES) -> Result<usize, HostError> {
        let applied = self.catch_up_from(store).await?;
        // The threshold moves with the clock, so a quiet tail can settle
        // even when no events arrived.
        let threshold = self.window.threshold(SystemTime::now());
        self.projection = self.projection.settle(&threshold);
        Ok(applied)
    }

    /// Mark the host as shutting down. Idempotent.
    pub fn request_deactivation(&mut self) {
        if !self.deactivating {
            tracing::debug!(projector = P::NAME, "deactivation requested");
            self.deactivating = true;
        }
    }

    #[must_use]
    pub fn is_deactivating(&self) -> bool {
        self.deactivating
    }

    /// Whether an event at `marker` has been applied.
    #[must_use]
    pub fn is_id_received(&self, marker: &SortableUniqueId) -> bool {
        self.projection.is_id_received(marker)
    }

    /// Render the projection as JSON for inspection.
    ///
    /// With `include_unsafe` the full current view is rendered; otherwise
    /// the safe view at the present threshold.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if a payload cannot be serialized.
    pub fn snapshot_json(&self, include_unsafe: bool) -> Result<serde_json::Value, HostError> {
        let threshold = self.window.threshold(SystemTime::now());
        let threshold = if include_unsafe { None } else { Some(&threshold) };
        Ok(self.projection.to_json(threshold)?)
    }

    #[must_use]
    pub fn projection(&self) -> &TagMultiProjector<P, G> {
        &self.projection
    }

    fn advance_resume_after(&mut self, position: &SortableUniqueId) {
        if self.resume_after.as_ref().is_none_or(|last| position > last) {
            self.resume_after = Some(position.clone());
        }
    }

    fn payload_type_name(&self) -> String {
        self.projection
            .current_items()
            .values()
            .next()
            .map(|state| state.payload.type_name().to_string())
            .unwrap_or_default()
    }

    fn created_at(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.envelope.as_ref().map_or(fallback, |e| e.created_at)
    }
}

/// Run the store writes for a prepared persist job.
async fn write_snapshot<SS, BA>(
    job: &PersistJob,
    snapshots: &SS,
    blobs: &BA,
) -> Result<(), HostError>
where
    SS: SnapshotStore,
    BA: BlobAccessor,
{
    if let Some((key, bytes)) = &job.offload {
        blobs
            .write(key, bytes.clone())
            .await
            .map_err(|e| HostError::Blob(Box::new(e)))?;
        tracing::debug!(key = %key, size = bytes.len(), "offloaded snapshot to blob store");
    }
    snapshots
        .put(StoredSnapshot {
            envelope: job.envelope.clone(),
            inline: job.inline.clone(),
        })
        .await
        .map_err(|e| HostError::SnapshotStore(Box::new(e)))?;
    Ok(())
}

enum Command {
    Apply(Event),
    Status(oneshot::Sender<HostStatus>),
    Stats(oneshot::Sender<DeliveryStatistics>),
    Persist(oneshot::Sender<Result<PersistOutcome, HostError>>),
    Refresh(oneshot::Sender<Result<usize, HostError>>),
    OverwriteVersion(String, oneshot::Sender<Result<(), HostError>>),
    SnapshotJson(bool, oneshot::Sender<Result<serde_json::Value, HostError>>),
    IsReceived(SortableUniqueId, oneshot::Sender<bool>),
}

/// Handle to a running projection host task.
///
/// The host runs on its own task and processes one command at a time, so
/// every observable state transition happens in a serialized turn. Dropping
/// the handle does not stop the task immediately; call
/// [`deactivate`](HostHandle::deactivate) for a graceful shutdown that
/// persists a final snapshot.
pub struct HostHandle {
    commands: mpsc::Sender<Command>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl HostHandle {
    /// Restore, catch up, and start the host task.
    ///
    /// Restore and catch-up run before this returns, so a successful spawn
    /// means the projection is current with the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial restore or catch-up fails.
    pub async fn spawn<P, G, ES, SS, BA>(
        mut host: ProjectionHost<P, G>,
        event_store: ES,
        snapshots: SS,
        blobs: BA,
    ) -> Result<Self, HostError>
    where
        P: TagProjector,
        G: TagGroup,
        ES: EventStore + 'static,
        SS: SnapshotStore + 'static,
        BA: BlobAccessor + 'static,
    {
        host.restore_from(&snapshots, &blobs).await?;
        host.catch_up_from(&event_store).await?;

        let (commands, mut commands_rx) = mpsc::channel(256);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let snapshots = Arc::new(snapshots);
        let blobs = Arc::new(blobs);

        let task = tokio::spawn(async move {
            type PersistReply = oneshot::Sender<Result<PersistOutcome, HostError>>;
            let (persist_tx, mut persist_rx) =
                mpsc::channel::<(PersistJob, Result<(), HostError>, PersistReply)>(8);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        tracing::debug!(projector = P::NAME, "projection host stopping");
                        break;
                    }
                    Some((job, result, reply)) = persist_rx.recv() => {
                        let _ = reply.send(host.complete_persist(job, result));
                    }
                    command = commands_rx.recv() => {
                        let Some(command) = command else {
                            tracing::debug!(projector = P::NAME, "all handles dropped");
                            break;
                        };
                        match command {
                            Command::Apply(event) => host.apply_event(&event),
                            Command::Status(reply) => {
                                let _ = reply.send(host.status());
                            }
                            Command::Stats(reply) => {
                                let _ = reply.send(host.delivery_statistics());
                            }
                            Command::Persist(reply) => match host.begin_persist() {
                                // Store writes run off-task so event
                                // application never queues behind persist
                                // I/O; completion comes back through the
                                // persist channel.
                                Ok(job) => {
                                    let snapshots = Arc::clone(&snapshots);
                                    let blobs = Arc::clone(&blobs);
                                    let completions = persist_tx.clone();
                                    tokio::spawn(async move {
                                        let result =
                                            write_snapshot(&job, &*snapshots, &*blobs).await;
                                        let _ = completions.send((job, result, reply)).await;
                                    });
                                }
                                Err(error) => {
                                    let _ = reply.send(Err(error));
                                }
                            },
                            Command::Refresh(reply) => {
                                let _ = reply.send(host.refresh(&event_store).await);
                            }
                            Command::OverwriteVersion(version, reply) => {
                                let _ = reply
                                    .send(host.overwrite_persisted_version(&*snapshots, &version).await);
                            }
                            Command::SnapshotJson(include_unsafe, reply) => {
                                let _ = reply.send(host.snapshot_json(include_unsafe));
                            }
                            Command::IsReceived(marker, reply) => {
                                let _ = reply.send(host.is_id_received(&marker));
                            }
                        }
                    }
                }
            }

            // Let any in-flight persist land before the final snapshot.
            while host.persist_in_progress {
                let Some((job, result, reply)) = persist_rx.recv().await else {
                    break;
                };
                let _ = reply.send(host.complete_persist(job, result));
            }

            // Best-effort final snapshot.
            host.request_deactivation();
            if let Err(error) = host.persist_state(&*snapshots, &*blobs).await {
                tracing::warn!(
                    projector = P::NAME,
                    %error,
                    "failed to persist snapshot during deactivation"
                );
            }
        });

        Ok(Self {
            commands,
            stop_tx: Some(stop_tx),
            task,
        })
    }

    /// Deliver one event to the host.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::HostStopped`] if the task has stopped.
    pub async fn apply(&self, event: Event) -> Result<(), HostError> {
        self.commands
            .send(Command::Apply(event))
            .await
            .map_err(|_| HostError::HostStopped)
    }

    /// # Errors
    ///
    /// Returns [`HostError::HostStopped`] if the task has stopped.
    pub async fn status(&self) -> Result<HostStatus, HostError> {
        self.request(Command::Status).await
    }

    /// # Errors
    ///
    /// Returns [`HostError::HostStopped`] if the task has stopped.
    pub async fn delivery_statistics(&self) -> Result<DeliveryStatistics, HostError> {
        self.request(Command::Stats).await
    }

    /// Persist the current safe view.
    ///
    /// The snapshot is serialized in the host's turn but the store writes
    /// run on a separate task, so event application continues while the
    /// write is in flight. A second persist issued before the write lands
    /// fails with [`HostError::PersistInProgress`].
    ///
    /// # Errors
    ///
    /// Returns the host's persist error, or [`HostError::HostStopped`].
    pub async fn persist(&self) -> Result<PersistOutcome, HostError> {
        self.request(Command::Persist).await?
    }

    /// Re-read the feed tail.
    ///
    /// # Errors
    ///
    /// Returns the host's refresh error, or [`HostError::HostStopped`].
    pub async fn refresh(&self) -> Result<usize, HostError> {
        self.request(Command::Refresh).await?
    }

    /// Relabel the persisted snapshot with a new projector version.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoEnvelope`] when nothing is persisted, or
    /// [`HostError::HostStopped`].
    pub async fn overwrite_persisted_version(
        &self,
        new_version: impl Into<String>,
    ) -> Result<(), HostError> {
        let version = new_version.into();
        self.request(|reply| Command::OverwriteVersion(version, reply))
            .await?
    }

    /// Render the projection as JSON.
    ///
    /// # Errors
    ///
    /// Returns the host's encoding error, or [`HostError::HostStopped`].
    pub async fn snapshot_json(&self, include_unsafe: bool) -> Result<serde_json::Value, HostError> {
        self.request(|reply| Command::SnapshotJson(include_unsafe, reply))
            .await?
    }

    /// Whether an event at `marker` has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::HostStopped`] if the task has stopped.
    pub async fn is_id_received(&self, marker: &SortableUniqueId) -> Result<bool, HostError> {
        let marker = marker.clone();
        self.request(|reply| Command::IsReceived(marker, reply))
            .await
    }

    /// Wait until an event at `marker` has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::WaitTimeout`] if the marker does not arrive in
    /// time, or [`HostError::HostStopped`].
    pub async fn wait_for(
        &self,
        marker: &SortableUniqueId,
        timeout: Duration,
    ) -> Result<(), HostError> {
        let wait = async {
            loop {
                if self.is_id_received(marker).await? {
                    return Ok(());
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(HostError::WaitTimeout {
                marker: marker.clone(),
            }),
        }
    }

    /// Stop the host gracefully, persisting a final snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::HostStopped`] if the task panicked.
    pub async fn deactivate(mut self) -> Result<(), HostError> {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        self.task.await.map_err(|_| HostError::HostStopped)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HostError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| HostError::HostStopped)?;
        reply_rx.await.map_err(|_| HostError::HostStopped)
    }
}
