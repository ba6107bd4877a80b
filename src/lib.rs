//! reachwatch - multi-protocol reachability monitoring
//!
//! Probes ICMP, TCP, UDP and HTTP endpoints on their own cadence, keeps a
//! bounded reply history with running statistics per endpoint, and persists
//! definitions (and optionally history) to SQLite.

pub mod config;
pub mod db;
pub mod endpoint;
pub mod events;
pub mod ledger;
pub mod probe;
pub mod scheduler;
pub mod web;
