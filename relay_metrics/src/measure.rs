//! The catalogue of measures this crate knows how to turn into events.
//!
//! A [`Measure`] names one kind of numeric observation. Its [`MergePolicy`] is
//! fixed here, at compile time, and decides both how the instrumentation
//! registry stores it and how a flush window merges it.

/// Dimension tag keys attached to every relay observation.
pub mod tag {
    /// Identifier of the relay instance that owns the observation.
    pub const RELAY_ID: &str = "relay_id";
    /// Coarse client platform class, for instance `server` or `gameConsole`.
    pub const PLATFORM_CATEGORY: &str = "platform_category";
    /// The client's user agent string.
    pub const USER_AGENT: &str = "user_agent";

    /// All standard tag keys, in the order views project them.
    pub const ALL: [&str; 3] = [RELAY_ID, PLATFORM_CATEGORY, USER_AGENT];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// How repeated values for the same group combine within one window.
pub enum MergePolicy {
    /// The most recently merged value replaces any earlier one. Used for
    /// instantaneous gauges.
    LatestValue,
    /// Values are summed. Used for counts of new occurrences.
    Additive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// A named kind of numeric observation with a fixed merge policy.
pub struct Measure {
    /// Metric name under which the measure is recorded.
    pub name: &'static str,
    /// Merge policy applied in windows.
    pub policy: MergePolicy,
}

/// Connections currently open against the relay.
pub const CONNECTIONS: Measure = Measure {
    name: "relay_private_connections",
    policy: MergePolicy::LatestValue,
};

/// Connections opened against the relay since the previous report.
pub const NEW_CONNECTIONS: Measure = Measure {
    name: "relay_private_new_connections",
    policy: MergePolicy::Additive,
};

/// Every measure in the catalogue.
pub static ALL: [Measure; 2] = [CONNECTIONS, NEW_CONNECTIONS];

/// Look up a catalogue measure by metric name.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static Measure> {
    ALL.iter().find(|m| m.name == name)
}
