//! Per-window accumulation of admitted snapshot rows.
//!
//! A [`Window`] maps `(measure, group)` to a single value. How a new value
//! combines with the stored one depends on the measure's [`MergePolicy`]:
//!
//!  * `Additive` sums. It is associative and commutative, so the order in
//!    which snapshot callbacks land inside one window does not matter.
//!  * `LatestValue` overwrites. Only merge order matters, and a zero is a real
//!    value ("connections dropped to zero"), never the same as absent.
//!
//! Windows are never shared. The exporter owns the current one behind a lock
//! and [`Window::detach`] moves it out whole, installing a fresh window in its
//! place, so each merged row belongs to exactly one window.

use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

use crate::{
    clock::Clock,
    event::{CurrentConnectionsMetric, NewConnectionsMetric, RelayMetricsEvent},
    filter::GroupRef,
    measure::{self, Measure, MergePolicy},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct GroupKey {
    pub(crate) user_agent: String,
    pub(crate) platform_category: String,
}

impl From<GroupRef<'_>> for GroupKey {
    fn from(group: GroupRef<'_>) -> Self {
        Self {
            user_agent: group.user_agent.to_string(),
            platform_category: group.platform_category.to_string(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Window {
    /// Unix milliseconds at which this window opened.
    start_ms: u64,
    values: FxHashMap<(&'static str, GroupKey), i64>,
}

impl Window {
    pub(crate) fn new(start_ms: u64) -> Self {
        Self {
            start_ms,
            values: FxHashMap::default(),
        }
    }

    pub(crate) fn start_ms(&self) -> u64 {
        self.start_ms
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn merge(&mut self, measure: &'static Measure, group: GroupRef<'_>, value: i64) {
        let slot = self
            .values
            .entry((measure.name, GroupKey::from(group)))
            .or_insert(0);
        match measure.policy {
            MergePolicy::Additive => *slot = slot.saturating_add(value),
            MergePolicy::LatestValue => *slot = value,
        }
    }

    /// Swap in a fresh window opened at `now_ms`, returning the detached one
    /// and the time it closed.
    ///
    /// The close time never precedes the detached window's start, even if the
    /// wall clock stepped backward, and the fresh window opens exactly when the
    /// detached one closed.
    pub(crate) fn detach(&mut self, now_ms: u64) -> (Window, u64) {
        let end_ms = now_ms.max(self.start_ms);
        (std::mem::replace(self, Window::new(end_ms)), end_ms)
    }

    /// Convert into the event for `relay_id`, or `None` if nothing was merged.
    pub(crate) fn into_event(self, relay_id: &str, end_ms: u64) -> Option<RelayMetricsEvent> {
        if self.is_empty() {
            return None;
        }
        let mut connections = Vec::new();
        let mut new_connections = Vec::new();
        for ((measure_name, group), value) in self.values {
            if measure_name == measure::CONNECTIONS.name {
                connections.push(CurrentConnectionsMetric {
                    user_agent: group.user_agent,
                    platform_category: group.platform_category,
                    current: value,
                });
            } else if measure_name == measure::NEW_CONNECTIONS.name {
                new_connections.push(NewConnectionsMetric {
                    user_agent: group.user_agent,
                    platform_category: group.platform_category,
                    count: value,
                });
            }
        }
        if connections.is_empty() && new_connections.is_empty() {
            return None;
        }
        connections.sort_by(|a, b| {
            (&a.user_agent, &a.platform_category).cmp(&(&b.user_agent, &b.platform_category))
        });
        new_connections.sort_by(|a, b| {
            (&a.user_agent, &a.platform_category).cmp(&(&b.user_agent, &b.platform_category))
        });
        Some(RelayMetricsEvent::new(
            relay_id.to_string(),
            self.start_ms,
            end_ms,
            connections,
            new_connections,
        ))
    }
}

#[derive(Debug)]
struct State {
    window: Window,
    closed: bool,
}

/// The current window of one exporter, behind the single lock that covers
/// merging, detaching and closing.
#[derive(Debug)]
pub(crate) struct Accumulator {
    state: Mutex<State>,
}

impl Accumulator {
    pub(crate) fn new(start_ms: u64) -> Self {
        Self {
            state: Mutex::new(State {
                window: Window::new(start_ms),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Every mutation is a single map operation, a poisoned window is still
        // a consistent one.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge `rows` into the current window under one lock acquisition.
    ///
    /// Returns `false`, merging nothing, once closed.
    pub(crate) fn merge_all<'r, I>(&self, measure: &'static Measure, rows: I) -> bool
    where
        I: IntoIterator<Item = (GroupRef<'r>, i64)>,
    {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        for (group, value) in rows {
            state.window.merge(measure, group, value);
        }
        true
    }

    /// Detach the current window, closing it at `clock`'s now.
    ///
    /// Returns `None` once closed. The clock is read under the lock so that
    /// consecutive windows never overlap.
    pub(crate) fn detach<C: Clock>(&self, clock: &C) -> Option<(Window, u64)> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        Some(state.window.detach(clock.now_ms()))
    }

    /// Refuse all further merges and detaches, dropping the current window.
    /// Returns whether this call did the closing.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.window = Window::new(state.window.start_ms);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        measure::{CONNECTIONS, NEW_CONNECTIONS},
    };
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    const CONSOLE: GroupRef<'static> = GroupRef {
        platform_category: "gameConsole",
        user_agent: "UA1",
    };

    #[test]
    fn additive_values_sum() {
        let mut window = Window::new(0);
        window.merge(&NEW_CONNECTIONS, CONSOLE, 1);
        window.merge(&NEW_CONNECTIONS, CONSOLE, 1);
        let event = window.into_event("R1", 10).unwrap();
        assert_eq!(event.new_connections.len(), 1);
        assert_eq!(event.new_connections[0].count, 2);
        assert!(event.connections.is_empty());
    }

    #[test]
    fn latest_value_zero_overwrites() {
        let mut window = Window::new(0);
        window.merge(&CONNECTIONS, CONSOLE, 5);
        window.merge(&CONNECTIONS, CONSOLE, 0);
        let event = window.into_event("R1", 10).unwrap();
        assert_eq!(
            event.connections,
            vec![CurrentConnectionsMetric {
                user_agent: "UA1".to_string(),
                platform_category: "gameConsole".to_string(),
                current: 0,
            }]
        );
    }

    #[test]
    fn groups_without_latest_value_rows_have_no_current_record() {
        let mut window = Window::new(0);
        window.merge(&NEW_CONNECTIONS, CONSOLE, 3);
        let event = window.into_event("R1", 10).unwrap();
        assert!(event.connections.is_empty());
    }

    #[test]
    fn empty_window_yields_no_event() {
        assert!(Window::new(0).into_event("R1", 10).is_none());
    }

    #[test]
    fn detach_installs_fresh_window_at_close_time() {
        let mut window = Window::new(100);
        window.merge(&NEW_CONNECTIONS, CONSOLE, 1);
        let (detached, end) = window.detach(250);
        assert_eq!(end, 250);
        assert_eq!(detached.start_ms(), 100);
        assert!(!detached.is_empty());
        assert_eq!(window.start_ms(), 250);
        assert!(window.is_empty());
    }

    #[test]
    fn detach_clamps_backward_clock() {
        let mut window = Window::new(500);
        let (_, end) = window.detach(400);
        assert_eq!(end, 500);
        assert_eq!(window.start_ms(), 500);
    }

    #[test]
    fn records_are_ordered_by_agent_then_platform() {
        let mut window = Window::new(0);
        for (agent, platform) in [("b", "server"), ("a", "mobile"), ("a", "browser")] {
            let group = GroupRef {
                platform_category: platform,
                user_agent: agent,
            };
            window.merge(&NEW_CONNECTIONS, group, 1);
        }
        let event = window.into_event("R1", 1).unwrap();
        let order: Vec<(&str, &str)> = event
            .new_connections
            .iter()
            .map(|m| (m.user_agent.as_str(), m.platform_category.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![("a", "browser"), ("a", "mobile"), ("b", "server")]
        );
    }

    #[test]
    fn closed_accumulator_refuses_work() {
        let clock = ManualClock::new(0);
        let accumulator = Accumulator::new(0);
        assert!(accumulator.merge_all(&NEW_CONNECTIONS, [(CONSOLE, 1)]));
        assert!(accumulator.close());
        assert!(!accumulator.close());
        assert!(!accumulator.merge_all(&NEW_CONNECTIONS, [(CONSOLE, 1)]));
        assert!(accumulator.detach(&clock).is_none());
    }

    #[test]
    fn concurrent_merges_are_neither_lost_nor_doubled() {
        const WRITERS: i64 = 4;
        const MERGES: i64 = 2_000;

        let clock = ManualClock::new(0);
        let accumulator = Accumulator::new(0);
        let done = AtomicBool::new(false);
        let mut windows = Vec::new();

        std::thread::scope(|scope| {
            let writers: Vec<_> = (0..WRITERS)
                .map(|_| {
                    scope.spawn(|| {
                        for _ in 0..MERGES {
                            accumulator.merge_all(&NEW_CONNECTIONS, [(CONSOLE, 1)]);
                        }
                    })
                })
                .collect();
            let flusher = scope.spawn(|| {
                let mut detached = Vec::new();
                while !done.load(Ordering::Acquire) {
                    clock.advance(1);
                    detached.extend(accumulator.detach(&clock));
                    std::thread::yield_now();
                }
                detached
            });
            for writer in writers {
                writer.join().unwrap();
            }
            done.store(true, Ordering::Release);
            windows = flusher.join().unwrap();
        });
        windows.extend(accumulator.detach(&clock));

        let mut total = 0;
        let mut previous_end = 0;
        for (window, end) in windows {
            assert!(window.start_ms() >= previous_end);
            assert!(window.start_ms() <= end);
            previous_end = end;
            if let Some(event) = window.into_event("R1", end) {
                total += event.new_connections.iter().map(|m| m.count).sum::<i64>();
            }
        }
        assert_eq!(total, WRITERS * MERGES);
    }

    proptest! {
        #[test]
        fn additive_total_is_the_arithmetic_sum(values in prop::collection::vec(0i64..10_000, 1..64)) {
            let mut window = Window::new(0);
            for v in &values {
                window.merge(&NEW_CONNECTIONS, CONSOLE, *v);
            }
            let event = window.into_event("R1", 1).unwrap();
            prop_assert_eq!(event.new_connections[0].count, values.iter().sum::<i64>());
        }

        #[test]
        fn latest_value_is_the_last_merged(values in prop::collection::vec(-100i64..10_000, 1..64)) {
            let mut window = Window::new(0);
            for v in &values {
                window.merge(&CONNECTIONS, CONSOLE, *v);
            }
            let event = window.into_event("R1", 1).unwrap();
            prop_assert_eq!(event.connections[0].current, *values.last().unwrap());
        }
    }
}
