//! Recording connection activity from the relay.
//!
//! The relay calls [`connection_opened`] when a client connects and holds the
//! returned [`ConnectionGuard`] for as long as the connection lives. Both
//! measurements go through the [`metrics`] facade, so they land in whichever
//! recorder is current: the globally installed [`crate::instrument::Registry`]
//! in production, a local one in tests.

use std::fmt;

use metrics::Gauge;

use crate::measure::{CONNECTIONS, NEW_CONNECTIONS, tag};

#[derive(Debug, Clone, PartialEq, Eq)]
/// The tags every connection measurement carries.
pub struct ConnectionTags {
    /// Identifier of the relay that accepted the connection.
    pub relay_id: String,
    /// The client's platform category, e.g. `gameConsole`.
    pub platform_category: String,
    /// The client's user agent.
    pub user_agent: String,
}

impl ConnectionTags {
    /// Construct tags for one client group of one relay.
    #[must_use]
    pub fn new(
        relay_id: impl Into<String>,
        platform_category: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            relay_id: relay_id.into(),
            platform_category: platform_category.into(),
            user_agent: user_agent.into(),
        }
    }
}

#[must_use = "the connection counts as open until the guard is dropped"]
/// An open connection. Dropping it records the close.
pub struct ConnectionGuard {
    current: Gauge,
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard").finish_non_exhaustive()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.current.decrement(1.0);
    }
}

/// Record a newly opened connection described by `tags`.
pub fn connection_opened(tags: &ConnectionTags) -> ConnectionGuard {
    metrics::counter!(
        NEW_CONNECTIONS.name,
        tag::RELAY_ID => tags.relay_id.clone(),
        tag::PLATFORM_CATEGORY => tags.platform_category.clone(),
        tag::USER_AGENT => tags.user_agent.clone()
    )
    .increment(1);
    let current = metrics::gauge!(
        CONNECTIONS.name,
        tag::RELAY_ID => tags.relay_id.clone(),
        tag::PLATFORM_CATEGORY => tags.platform_category.clone(),
        tag::USER_AGENT => tags.user_agent.clone()
    );
    current.increment(1.0);
    ConnectionGuard { current }
}
