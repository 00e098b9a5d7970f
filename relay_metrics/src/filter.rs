//! Admission of snapshot rows belonging to one relay.
//!
//! The instrumentation registry is shared by every relay in the process, so
//! most rows an exporter sees belong to someone else. Discarding is the hot
//! path and borrows only; nothing is allocated for a row that is not admitted.

use crate::{instrument::SnapshotRow, measure::tag};

/// Grouping key of an admitted row, borrowed from the row's tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GroupRef<'a> {
    pub(crate) platform_category: &'a str,
    pub(crate) user_agent: &'a str,
}

#[derive(Debug)]
pub(crate) struct DimensionFilter {
    relay_id: String,
}

impl DimensionFilter {
    pub(crate) fn new(relay_id: String) -> Self {
        Self { relay_id }
    }

    pub(crate) fn relay_id(&self) -> &str {
        &self.relay_id
    }

    /// Admit `row` with its grouping key, or `None` to discard it.
    ///
    /// A row is discarded when its relay id tag is absent, empty or names a
    /// different relay, and when either grouping tag is missing.
    pub(crate) fn admit<'r>(&self, row: &'r SnapshotRow) -> Option<GroupRef<'r>> {
        let mut relay_id = None;
        let mut platform_category = None;
        let mut user_agent = None;
        for label in &row.tags {
            match label.key() {
                tag::RELAY_ID => relay_id = Some(label.value()),
                tag::PLATFORM_CATEGORY => platform_category = Some(label.value()),
                tag::USER_AGENT => user_agent = Some(label.value()),
                _ => {}
            }
        }
        // The configured id is never empty, so an empty tag cannot match.
        if relay_id? != self.relay_id {
            return None;
        }
        Some(GroupRef {
            platform_category: platform_category?,
            user_agent: user_agent?,
        })
    }
}
