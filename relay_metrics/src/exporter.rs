//! The per-relay events exporter.
//!
//! An [`EventsExporter`] is registered with an instrumentation
//! [`Registry`] for its whole lifetime. Snapshot callbacks arrive on the
//! registry's reporting task and are merged into the current window; a flush
//! task owned by the exporter detaches that window on its own timer and hands
//! the resulting event to the publisher. The two never wait on each other
//! beyond the single window lock.
//!
//! Closing is synchronous and idempotent. The first [`EventsExporter::close`]
//! marks the window closed under its lock, which is the point after which no
//! callback merges anything and no flush detaches anything. Whatever was
//! merged into the open window is discarded.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{runtime, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::{
    clock::{Clock, RealClock},
    config::{self, Config},
    filter::DimensionFilter,
    flush::FlushScheduler,
    instrument::{ExporterId, Registry, SnapshotExporter, SnapshotRow},
    measure::{self, Measure},
    publisher::EventPublisher,
    window::Accumulator,
};

/// Upper bound on how long [`EventsExporter::wait_closed`] waits for the
/// flush task.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors produced by [`EventsExporter`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] config::Error),
    /// The exporter was started outside of a tokio runtime.
    #[error("no tokio runtime to run the flush task on: {0}")]
    Runtime(#[from] runtime::TryCurrentError),
}

/// Snapshot ingestion side of an exporter, shared with its flush task.
pub(crate) struct Bridge<C: Clock> {
    pub(crate) filter: DimensionFilter,
    pub(crate) accumulator: Accumulator,
    pub(crate) clock: C,
}

impl<C: Clock> Bridge<C> {
    pub(crate) fn new(relay_id: String, clock: C) -> Self {
        let accumulator = Accumulator::new(clock.now_ms());
        Self {
            filter: DimensionFilter::new(relay_id),
            accumulator,
            clock,
        }
    }

    /// Merge the rows of one snapshot that belong to this relay.
    pub(crate) fn ingest(&self, measure: &Measure, rows: &[SnapshotRow]) {
        // Merge semantics come from the catalogue, never from the caller.
        let Some(measure) = measure::lookup(measure.name) else {
            return;
        };
        let admitted: Vec<_> = rows
            .iter()
            .filter_map(|row| self.filter.admit(row).map(|group| (group, row.value)))
            .collect();
        if admitted.is_empty() {
            return;
        }
        let count = admitted.len();
        if self.accumulator.merge_all(measure, admitted) {
            trace!(
                relay_id = self.filter.relay_id(),
                measure = measure.name,
                rows = count,
                "merged snapshot rows"
            );
        }
    }
}

impl<C: Clock> SnapshotExporter for Bridge<C> {
    fn export_snapshot(&self, measure: &Measure, rows: &[SnapshotRow]) {
        self.ingest(measure, rows);
    }
}

/// Turns one relay's share of the instrumentation stream into
/// `relay-metrics` events.
pub struct EventsExporter<C: Clock = RealClock> {
    bridge: Arc<Bridge<C>>,
    registry: Registry,
    registration: ExporterId,
    shutdown: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Clock> fmt::Debug for EventsExporter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventsExporter")
            .field("relay_id", &self.bridge.filter.relay_id())
            .field("registration", &self.registration)
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl EventsExporter<RealClock> {
    /// Start an exporter reading the wall clock.
    ///
    /// # Errors
    ///
    /// See [`EventsExporter::start_with_clock`].
    pub fn start(
        config: &Config,
        publisher: Arc<dyn EventPublisher>,
        registry: &Registry,
    ) -> Result<Self, Error> {
        Self::start_with_clock(config, publisher, registry, RealClock)
    }
}

impl<C: Clock> EventsExporter<C> {
    /// Start an exporter reading window boundaries from `clock`.
    ///
    /// The first window opens now. The exporter is registered with
    /// `registry` and its flush task is running when this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not validate or if called outside a
    /// tokio runtime.
    pub fn start_with_clock(
        config: &Config,
        publisher: Arc<dyn EventPublisher>,
        registry: &Registry,
        clock: C,
    ) -> Result<Self, Error> {
        config.validate()?;
        let handle = runtime::Handle::try_current()?;

        let bridge = Arc::new(Bridge::new(config.relay_id.clone(), clock));
        let shutdown = CancellationToken::new();
        let scheduler = FlushScheduler::new(Arc::clone(&bridge), publisher);
        let flush_task = handle.spawn(scheduler.run(config.flush_interval(), shutdown.clone()));
        let registration = registry.register_exporter(Arc::clone(&bridge) as Arc<dyn SnapshotExporter>);

        info!(
            relay_id = %config.relay_id,
            flush_interval = ?config.flush_interval(),
            "relay metrics exporter started"
        );
        Ok(Self {
            bridge,
            registry: registry.clone(),
            registration,
            shutdown,
            flush_task: Mutex::new(Some(flush_task)),
        })
    }

    /// The relay this exporter reports for.
    #[must_use]
    pub fn relay_id(&self) -> &str {
        self.bridge.filter.relay_id()
    }

    /// Stop the exporter. Idempotent.
    ///
    /// On return no snapshot callback will merge into a window and no further
    /// event will be published, save one whose window was detached before this
    /// call. The partially filled window is discarded.
    pub fn close(&self) {
        if !self.bridge.accumulator.close() {
            return;
        }
        self.registry.unregister_exporter(self.registration);
        self.shutdown.cancel();
        info!(relay_id = self.relay_id(), "relay metrics exporter closed");
    }

    /// Close the exporter and wait, for a bounded time, for its flush task to
    /// finish.
    pub async fn wait_closed(&self) {
        self.close();
        let task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };
        match time::timeout(CLOSE_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(relay_id = self.relay_id(), "flush task failed: {err}"),
            Err(_) => warn!(
                relay_id = self.relay_id(),
                timeout = ?CLOSE_TIMEOUT,
                "flush task did not stop in time"
            ),
        }
    }
}

impl<C: Clock> Drop for EventsExporter<C> {
    fn drop(&mut self) {
        self.close();
    }
}
