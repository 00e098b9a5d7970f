//! Relay usage events from the relay's own instrumentation
//!
//! The relay records connection activity through the [`metrics`] facade,
//! tagging each observation with the owning relay's identifier, the client's
//! platform category and its user agent. Many relay instances may share one
//! process and therefore one instrumentation registry. This crate turns that
//! shared, multi-tenant stream into discrete `relay-metrics` events, one per
//! non-empty flush window, each scoped to exactly one relay.
//!
//! The pieces, leaf first:
//!
//! * [`instrument::Registry`] records tagged measurements and periodically
//!   pushes per-view snapshots to registered [`instrument::SnapshotExporter`]s.
//! * [`exporter::EventsExporter`] is one such exporter. It filters snapshot
//!   rows down to its own relay, merges them into the current window and, on
//!   an independent timer, detaches the window and hands a
//!   [`event::RelayMetricsEvent`] to an [`publisher::EventPublisher`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![allow(clippy::multiple_crate_versions)]

pub mod clock;
pub mod config;
pub mod event;
pub mod exporter;
mod filter;
mod flush;
pub mod instrument;
pub mod measure;
pub mod publisher;
pub mod track;
mod window;
