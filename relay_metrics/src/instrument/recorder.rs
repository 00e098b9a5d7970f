use std::sync::Arc;

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, SharedString, Unit};

use super::Inner;

/// The [`metrics::Recorder`] behind a [`super::Registry`].
pub struct ViewRecorder {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ViewRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewRecorder").finish_non_exhaustive()
    }
}

impl ViewRecorder {
    pub(super) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }
}

impl metrics::Recorder for ViewRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {
        // nothing, intentionally
    }

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {
        // nothing, intentionally
    }

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {
        // nothing, intentionally
    }

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.inner
            .storage
            .get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.inner
            .storage
            .get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, _key: &Key, _: &Metadata<'_>) -> Histogram {
        // No relay measure is a distribution.
        Histogram::noop()
    }
}
