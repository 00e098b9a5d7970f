//! The `relay-metrics` event handed to the event publisher.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
/// Discriminator carried in the `kind` field of every event.
pub enum EventKind {
    /// Usage summary of one relay over one window.
    #[default]
    #[serde(rename = "relay-metrics")]
    RelayMetrics,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Connections open at the end of a window for one client group.
pub struct CurrentConnectionsMetric {
    /// The clients' user agent.
    pub user_agent: String,
    /// The clients' platform category.
    pub platform_category: String,
    /// Most recently reported number of open connections.
    pub current: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Connections opened during a window for one client group.
pub struct NewConnectionsMetric {
    /// The clients' user agent.
    pub user_agent: String,
    /// The clients' platform category.
    pub platform_category: String,
    /// Number of connections opened within the window.
    pub count: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Summary of one relay's connection activity over one non-empty window.
///
/// `start_date <= end_date`, and the `start_date` of each event is at or
/// after the `end_date` of the one before it.
pub struct RelayMetricsEvent {
    /// Always [`EventKind::RelayMetrics`].
    pub kind: EventKind,
    /// Identifier of the relay this event describes.
    #[serde(rename = "relayID")]
    pub relay_id: String,
    /// Window start, unix milliseconds.
    pub start_date: u64,
    /// Window end, unix milliseconds.
    pub end_date: u64,
    /// Current connections per group, ordered by user agent then platform.
    pub connections: Vec<CurrentConnectionsMetric>,
    /// New connections per group, ordered by user agent then platform.
    pub new_connections: Vec<NewConnectionsMetric>,
}

impl RelayMetricsEvent {
    /// Assemble an event of kind [`EventKind::RelayMetrics`].
    #[must_use]
    pub fn new(
        relay_id: String,
        start_date: u64,
        end_date: u64,
        connections: Vec<CurrentConnectionsMetric>,
        new_connections: Vec<NewConnectionsMetric>,
    ) -> Self {
        Self {
            kind: EventKind::RelayMetrics,
            relay_id,
            start_date,
            end_date,
            connections,
            new_connections,
        }
    }
}
