//! Flush scheduling for an events exporter
//!
//! The scheduler owns window boundaries; ingestion only owns values. On every
//! tick it detaches the current window, installing a fresh one that opens at
//! the tick time, and only then, off the lock, decides whether the detached
//! window is worth an event. An empty window publishes nothing but still
//! moves the boundary forward, so the next event's `startDate` is the last
//! tick time and not the time of the last non-empty flush.
//!
//! As in other event loops of this workspace the decision logic is a plain
//! state machine, [`FlushScheduler::next`], and [`FlushScheduler::run`] only
//! translates timer and shutdown wakeups into [`Event`]s.

use std::{sync::Arc, time::Duration};

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{clock::Clock, exporter::Bridge, publisher::EventPublisher};

/// Events that drive the flush scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// The flush interval elapsed
    FlushTick,
    /// The exporter is shutting down
    ShutdownSignaled,
}

/// Operations the scheduler can request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    /// Continue the event loop
    Continue,
    /// Exit the event loop
    Exit,
}

pub(crate) struct FlushScheduler<C: Clock> {
    bridge: Arc<Bridge<C>>,
    publisher: Arc<dyn EventPublisher>,
    /// Events handed to the publisher so far.
    published: u64,
}

impl<C: Clock> FlushScheduler<C> {
    pub(crate) fn new(bridge: Arc<Bridge<C>>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            bridge,
            publisher,
            published: 0,
        }
    }

    pub(crate) fn next(&mut self, event: Event) -> Operation {
        match event {
            Event::FlushTick => self.handle_flush_tick(),
            Event::ShutdownSignaled => {
                debug!(
                    relay_id = self.bridge.filter.relay_id(),
                    published = self.published,
                    "flush scheduler shutting down"
                );
                Operation::Exit
            }
        }
    }

    fn handle_flush_tick(&mut self) -> Operation {
        let relay_id = self.bridge.filter.relay_id();
        let Some((window, end_ms)) = self.bridge.accumulator.detach(&self.bridge.clock) else {
            trace!(relay_id, "exporter closed, flush scheduler exiting");
            return Operation::Exit;
        };
        let start_ms = window.start_ms();
        match window.into_event(relay_id, end_ms) {
            Some(event) => {
                debug!(
                    relay_id,
                    start_ms,
                    end_ms,
                    connections = event.connections.len(),
                    new_connections = event.new_connections.len(),
                    "publishing relay metrics event"
                );
                self.publisher.publish(event);
                self.published += 1;
            }
            None => debug!(relay_id, start_ms, end_ms, "empty window, nothing published"),
        }
        Operation::Continue
    }

    /// Run the scheduler, ticking every `interval`, until `shutdown` is
    /// cancelled or the exporter closes.
    pub(crate) async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let event = tokio::select! {
                biased;
                () = shutdown.cancelled() => Event::ShutdownSignaled,
                _ = ticker.tick() => Event::FlushTick,
            };
            if self.next(event) == Operation::Exit {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        event::RelayMetricsEvent,
        instrument::SnapshotRow,
        measure::{CONNECTIONS, NEW_CONNECTIONS, tag},
        publisher::ChannelPublisher,
    };
    use metrics::Label;
    use proptest::prelude::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    const START_MS: u64 = 1_700_000_000_000;

    struct Harness {
        clock: ManualClock,
        bridge: Arc<Bridge<ManualClock>>,
        scheduler: FlushScheduler<ManualClock>,
        events: UnboundedReceiver<RelayMetricsEvent>,
    }

    impl Harness {
        fn new(relay_id: &str) -> Self {
            let clock = ManualClock::new(START_MS);
            let bridge = Arc::new(Bridge::new(relay_id.to_string(), clock.clone()));
            let (publisher, events) = ChannelPublisher::channel();
            let scheduler = FlushScheduler::new(Arc::clone(&bridge), Arc::new(publisher));
            Self {
                clock,
                bridge,
                scheduler,
                events,
            }
        }

        fn tick(&mut self) -> Operation {
            self.scheduler.next(Event::FlushTick)
        }

        fn published(&mut self) -> Vec<RelayMetricsEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn row(relay_id: &str, platform: &str, agent: &str, value: i64) -> SnapshotRow {
        SnapshotRow {
            tags: vec![
                Label::new(tag::RELAY_ID, relay_id.to_string()),
                Label::new(tag::PLATFORM_CATEGORY, platform.to_string()),
                Label::new(tag::USER_AGENT, agent.to_string()),
            ],
            value,
        }
    }

    #[test]
    fn window_with_rows_publishes_one_event() {
        let mut h = Harness::new("R1");
        h.bridge
            .ingest(&NEW_CONNECTIONS, &[row("R1", "gameConsole", "UA1", 2)]);
        h.bridge
            .ingest(&CONNECTIONS, &[row("R1", "gameConsole", "UA1", 1)]);
        h.clock.advance(1);

        assert_eq!(h.tick(), Operation::Continue);
        let events = h.published();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.relay_id, "R1");
        assert_eq!(event.start_date, START_MS);
        assert_eq!(event.end_date, START_MS + 1);
        assert_eq!(event.connections.len(), 1);
        assert_eq!(event.connections[0].user_agent, "UA1");
        assert_eq!(event.connections[0].platform_category, "gameConsole");
        assert_eq!(event.connections[0].current, 1);
        assert_eq!(event.new_connections.len(), 1);
        assert_eq!(event.new_connections[0].count, 2);
    }

    #[test]
    fn empty_windows_publish_nothing_but_advance_start() {
        let mut h = Harness::new("R1");
        h.clock.advance(10);
        h.tick();
        let first_tick = h.clock.now_ms();
        h.clock.advance(10);
        h.tick();
        let second_tick = h.clock.now_ms();
        assert!(h.published().is_empty());

        h.bridge
            .ingest(&CONNECTIONS, &[row("R1", "server", "UA1", 1)]);
        h.clock.advance(10);
        h.tick();
        let events = h.published();
        assert_eq!(events.len(), 1);
        assert!(events[0].start_date >= first_tick);
        assert_eq!(events[0].start_date, second_tick);
    }

    #[test]
    fn rows_land_in_exactly_one_window() {
        let mut h = Harness::new("R1");
        h.bridge
            .ingest(&NEW_CONNECTIONS, &[row("R1", "server", "UA1", 3)]);
        h.clock.advance(5);
        h.tick();
        h.clock.advance(5);
        h.tick();
        let events = h.published();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_connections[0].count, 3);
    }

    #[test]
    fn closed_exporter_stops_the_scheduler() {
        let mut h = Harness::new("R1");
        h.bridge
            .ingest(&NEW_CONNECTIONS, &[row("R1", "server", "UA1", 3)]);
        assert!(h.bridge.accumulator.close());
        assert_eq!(h.tick(), Operation::Exit);
        assert!(h.published().is_empty());
    }

    #[test]
    fn shutdown_exits() {
        let mut h = Harness::new("R1");
        assert_eq!(h.scheduler.next(Event::ShutdownSignaled), Operation::Exit);
    }

    #[tokio::test(start_paused = true)]
    async fn run_flushes_on_the_interval_until_cancelled() {
        let clock = ManualClock::new(START_MS);
        let bridge = Arc::new(Bridge::new("R1".to_string(), clock.clone()));
        let (publisher, mut events) = ChannelPublisher::channel();
        let scheduler = FlushScheduler::new(Arc::clone(&bridge), Arc::new(publisher));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(Duration::from_secs(1), shutdown.clone()));

        bridge.ingest(&NEW_CONNECTIONS, &[row("R1", "server", "UA1", 1)]);
        clock.advance(1_000);
        let event = events.recv().await.unwrap();
        assert_eq!(event.new_connections[0].count, 1);
        assert_eq!(event.end_date, START_MS + 1_000);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[derive(Debug, Clone)]
    enum FlushOp {
        Merge {
            own: bool,
            additive: bool,
            agent: u8,
            value: i64,
        },
        Advance {
            millis: u64,
        },
        Rewind {
            millis: u64,
        },
        Tick,
    }

    impl Arbitrary for FlushOp {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            prop_oneof![
                4 => (any::<bool>(), any::<bool>(), 0u8..3, 0i64..100).prop_map(
                    |(own, additive, agent, value)| FlushOp::Merge {
                        own,
                        additive,
                        agent,
                        value,
                    }
                ),
                2 => (0u64..1_000).prop_map(|millis| FlushOp::Advance { millis }),
                1 => (0u64..100).prop_map(|millis| FlushOp::Rewind { millis }),
                2 => Just(FlushOp::Tick),
            ]
            .boxed()
        }
    }

    proptest! {
        #[test]
        fn windows_are_monotonic_isolated_and_lossless(
            ops in prop::collection::vec(any::<FlushOp>(), 1..128)
        ) {
            let mut h = Harness::new("R1");
            let mut expected_new = 0i64;
            let mut seen_new = 0i64;
            let mut last_end = START_MS;

            for op in ops.into_iter().chain(std::iter::once(FlushOp::Tick)) {
                match op {
                    FlushOp::Merge { own, additive, agent, value } => {
                        let relay = if own { "R1" } else { "R2" };
                        let measure = if additive { &NEW_CONNECTIONS } else { &CONNECTIONS };
                        let agent = format!("UA{agent}");
                        h.bridge.ingest(measure, &[row(relay, "server", &agent, value)]);
                        if own && additive {
                            expected_new += value;
                        }
                    }
                    FlushOp::Advance { millis } => h.clock.advance(millis),
                    FlushOp::Rewind { millis } => {
                        h.clock.set(h.clock.now_ms().saturating_sub(millis));
                    }
                    FlushOp::Tick => {
                        prop_assert_eq!(h.tick(), Operation::Continue);
                    }
                }
                for event in h.published() {
                    prop_assert_eq!(&event.relay_id, "R1");
                    prop_assert!(event.start_date <= event.end_date);
                    prop_assert!(event.start_date >= last_end);
                    last_end = event.end_date;
                    seen_new += event.new_connections.iter().map(|m| m.count).sum::<i64>();
                }
            }
            prop_assert_eq!(seen_new, expected_new);
        }
    }
}
