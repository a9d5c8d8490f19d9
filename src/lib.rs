//! tscached: a read-through caching proxy for time-series queries.
//!
//! Dashboards and alerting clients re-issue near-identical sliding-window
//! queries; tscached cuts the repeated load on the upstream query service by
//! serving previously fetched results from Redis when fresh, fetching only
//! the missing delta range when they are stale, and falling through to a full
//! fetch on a miss.
//!
//! Core pieces:
//! - [`kquery`]: the per-metric query descriptor and its cache key
//! - [`mts`]: cached series entries and their merge-on-read algorithm
//! - [`orchestrator`]: the cold/hot/warm state machine
//! - [`store`] / [`upstream`]: injected store and backend clients

pub mod config;
pub mod error;
pub mod keys;
pub mod kquery;
pub mod mts;
pub mod orchestrator;
pub mod server;
pub mod store;
pub mod time_range;
pub mod upstream;
