//! In-process instrumentation: tagged measurements, views and snapshots
//!
//! Call sites throughout the relay record connection activity with the
//! [`metrics`] macros. [`Registry`] is the [`metrics::Recorder`] behind those
//! macros. It stores every tagged counter and gauge and, once per reporting
//! period, computes a snapshot per registered [`View`] and pushes it to every
//! registered [`SnapshotExporter`].
//!
//! An additive measure reports how much each tag combination grew since the
//! previous report. A latest-value measure reports the current value of every
//! combination that is non-zero, and of every combination touched since the
//! previous report, so a drop to zero is reported exactly once. Combinations
//! with nothing to say produce no row.
//!
//! Tag combinations that sit idle, meaning a counter not incremented or a
//! gauge resting at zero, for longer than the registry's idle timeout are
//! evicted from storage. A gauge holding a non-zero value is never evicted.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use metrics::{Key, Label};
use metrics_util::{
    MetricKindMask,
    registry::{
        AtomicStorage, Generation, GenerationalAtomicStorage, GenerationalStorage, Recency,
        Registry as Storage,
    },
};
use rustc_hash::FxHashMap;
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::measure::{self, Measure, MergePolicy, tag};

mod recorder;

pub use recorder::ViewRecorder;

/// Errors produced by [`Registry`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A global recorder was already installed.
    #[error("Failed to set recorder")]
    SetRecorder,
    /// A view names a measure that is not in the catalogue.
    #[error("Unknown measure: {0}")]
    UnknownMeasure(String),
    /// A view for this measure is already registered.
    #[error("View already registered for measure: {0}")]
    DuplicateView(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Aggregation of one measure, grouped by a set of tag keys.
pub struct View {
    /// Name of the catalogue measure this view aggregates.
    pub measure: String,
    /// Tag keys retained in snapshot rows, in this order.
    pub tag_keys: Vec<String>,
}

impl View {
    /// Create a view over `measure` grouped by `tag_keys`.
    pub fn new<M, K>(measure: M, tag_keys: &[K]) -> Self
    where
        M: Into<String>,
        K: AsRef<str>,
    {
        Self {
            measure: measure.into(),
            tag_keys: tag_keys.iter().map(|k| k.as_ref().to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One aggregated observation for one tag combination of one measure.
pub struct SnapshotRow {
    /// Tag values for this combination, projected onto the view's tag keys.
    pub tags: Vec<Label>,
    /// Aggregated value since this combination's previous report.
    pub value: i64,
}

impl SnapshotRow {
    /// Value of tag `key`, if present on this row.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|label| label.key() == key)
            .map(Label::value)
    }
}

/// Receiver of periodic snapshots from a [`Registry`].
///
/// Implementations are called from the registry's reporting task, possibly
/// from several threads at once, and must not block.
pub trait SnapshotExporter: Send + Sync {
    /// Accept the rows computed for `measure` in one reporting period.
    fn export_snapshot(&self, measure: &Measure, rows: &[SnapshotRow]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Handle returned by [`Registry::register_exporter`].
pub struct ExporterId(u64);

#[derive(Debug, Clone)]
struct RegisteredView {
    measure: &'static Measure,
    tag_keys: Vec<String>,
}

/// How long a tag combination may sit idle before it is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

struct Inner {
    storage: Storage<Key, GenerationalAtomicStorage>,
    recency: Recency<Key>,
    views: RwLock<Vec<RegisteredView>>,
    exporters: RwLock<Vec<(ExporterId, Arc<dyn SnapshotExporter>)>>,
    next_exporter_id: AtomicU64,
    /// Storage generation of each gauge at its last report. Entries leave with
    /// their gauge on eviction.
    reported_gauges: Mutex<FxHashMap<Key, Generation>>,
}

#[derive(Clone)]
/// Process-wide store of tagged measurements with push-based snapshots.
///
/// Clones share the same storage, views and exporters.
pub struct Registry {
    inner: Arc<Inner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let views = self
            .inner
            .views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let exporters = self
            .inner
            .exporters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Registry")
            .field("views", &views)
            .field("exporters", &exporters)
            .finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry with no views and no exporters, evicting
    /// after [`DEFAULT_IDLE_TIMEOUT`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    /// Create an empty registry evicting tag combinations idle for longer
    /// than `idle_timeout`.
    #[must_use]
    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self::with_recency_clock(quanta::Clock::new(), idle_timeout)
    }

    fn with_recency_clock(clock: quanta::Clock, idle_timeout: Duration) -> Self {
        let inner = Inner {
            storage: Storage::new(GenerationalStorage::new(AtomicStorage)),
            recency: Recency::new(
                clock,
                MetricKindMask::GAUGE | MetricKindMask::COUNTER,
                Some(idle_timeout),
            ),
            views: RwLock::new(Vec::new()),
            exporters: RwLock::new(Vec::new()),
            next_exporter_id: AtomicU64::new(0),
            reported_gauges: Mutex::new(FxHashMap::default()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// A [`metrics::Recorder`] writing into this registry.
    #[must_use]
    pub fn recorder(&self) -> ViewRecorder {
        ViewRecorder::new(Arc::clone(&self.inner))
    }

    /// Install this registry as the global [`metrics::Recorder`]
    ///
    /// # Errors
    ///
    /// Returns an error if there is already a global recorder set.
    pub fn install(&self) -> Result<(), Error> {
        metrics::set_global_recorder(self.recorder()).map_err(|_| Error::SetRecorder)?;
        info!("relay instrumentation registry installed as global recorder");
        Ok(())
    }

    /// Register a view so that its measure is reported to exporters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMeasure`] if the view names a measure outside
    /// the catalogue and [`Error::DuplicateView`] if the measure already has a
    /// view.
    pub fn register_view(&self, view: View) -> Result<(), Error> {
        let Some(measure) = measure::lookup(&view.measure) else {
            return Err(Error::UnknownMeasure(view.measure));
        };
        let mut views = self
            .inner
            .views
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if views.iter().any(|v| v.measure.name == measure.name) {
            return Err(Error::DuplicateView(measure.name));
        }
        views.push(RegisteredView {
            measure,
            tag_keys: view.tag_keys,
        });
        debug!(measure = measure.name, "registered view");
        Ok(())
    }

    /// Register one view per catalogue measure over the standard tag keys.
    ///
    /// # Errors
    ///
    /// See [`Registry::register_view`].
    pub fn register_default_views(&self) -> Result<(), Error> {
        for measure in &measure::ALL {
            self.register_view(View::new(measure.name, &tag::ALL))?;
        }
        Ok(())
    }

    /// Stop reporting `measure`. Returns whether a view was removed.
    pub fn unregister_view(&self, measure: &str) -> bool {
        let mut views = self
            .inner
            .views
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = views.len();
        views.retain(|v| v.measure.name != measure);
        before != views.len()
    }

    /// Begin pushing snapshots to `exporter`.
    pub fn register_exporter(&self, exporter: Arc<dyn SnapshotExporter>) -> ExporterId {
        let id = ExporterId(self.inner.next_exporter_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .exporters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, exporter));
        id
    }

    /// Stop pushing snapshots to the exporter behind `id`. Returns whether
    /// it was still registered.
    pub fn unregister_exporter(&self, id: ExporterId) -> bool {
        let mut exporters = self
            .inner
            .exporters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = exporters.len();
        exporters.retain(|(registered, _)| *registered != id);
        before != exporters.len()
    }

    /// Compute one snapshot per view and push each to every exporter.
    ///
    /// Counter deltas consumed here are gone whether or not an exporter is
    /// registered to receive them.
    pub fn report(&self) {
        let views = self
            .inner
            .views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let exporters: Vec<Arc<dyn SnapshotExporter>> = self
            .inner
            .exporters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, exporter)| Arc::clone(exporter))
            .collect();

        for view in &views {
            let rows = self.collect(view);
            if rows.is_empty() {
                continue;
            }
            trace!(
                measure = view.measure.name,
                rows = rows.len(),
                exporters = exporters.len(),
                "pushing snapshot"
            );
            for exporter in &exporters {
                exporter.export_snapshot(view.measure, &rows);
            }
        }
    }

    /// Run [`Registry::report`] every `period` until `shutdown` is cancelled.
    #[must_use]
    pub fn spawn_reporter(&self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        debug!("snapshot reporter shut down");
                        return;
                    }
                    _ = ticker.tick() => registry.report(),
                }
            }
        })
    }

    fn collect(&self, view: &RegisteredView) -> Vec<SnapshotRow> {
        let mut rows: FxHashMap<Vec<Label>, i64> = FxHashMap::default();
        match view.measure.policy {
            MergePolicy::Additive => {
                for (key, counter) in self.inner.storage.get_counter_handles() {
                    if key.name() != view.measure.name {
                        continue;
                    }
                    if !self.inner.recency.should_store_counter(
                        &key,
                        counter.get_generation(),
                        &self.inner.storage,
                    ) {
                        trace!(measure = view.measure.name, "evicted idle counter");
                        continue;
                    }
                    // Swapping to zero hands every increment to exactly one
                    // report.
                    let delta = counter.get_inner().swap(0, Ordering::AcqRel);
                    if delta == 0 {
                        continue;
                    }
                    let delta = i64::try_from(delta).unwrap_or(i64::MAX);
                    let sum = rows.entry(project(&key, &view.tag_keys)).or_insert(0);
                    *sum = sum.saturating_add(delta);
                }
            }
            MergePolicy::LatestValue => {
                let mut reported = self
                    .inner
                    .reported_gauges
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                for (key, gauge) in self.inner.storage.get_gauge_handles() {
                    if key.name() != view.measure.name {
                        continue;
                    }
                    // Generation first: a write racing this read is reported
                    // again next period rather than skipped.
                    let generation = gauge.get_generation();
                    let value = gauge_value(gauge.get_inner().load(Ordering::Acquire));
                    if value == 0 {
                        // Non-zero gauges may have live handles, never evict them.
                        if !self.inner.recency.should_store_gauge(
                            &key,
                            generation,
                            &self.inner.storage,
                        ) {
                            reported.remove(&key);
                            trace!(measure = view.measure.name, "evicted idle gauge");
                            continue;
                        }
                        if reported.get(&key) == Some(&generation) {
                            continue;
                        }
                    }
                    let tags = project(&key, &view.tag_keys);
                    reported.insert(key, generation);
                    let sum = rows.entry(tags).or_insert(0);
                    *sum = sum.saturating_add(value);
                }
            }
        }
        rows.into_iter()
            .map(|(tags, value)| SnapshotRow { tags, value })
            .collect()
    }
}

/// Keep only the labels named in `tag_keys`, in that order.
fn project(key: &Key, tag_keys: &[String]) -> Vec<Label> {
    tag_keys
        .iter()
        .filter_map(|tag_key| key.labels().find(|l| l.key() == tag_key).cloned())
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
fn gauge_value(bits: u64) -> i64 {
    // There's no atomic f64 so gauges are stored as bits in an AtomicU64.
    f64::from_bits(bits).round() as i64
}
