//! Feature-flag snapshot distribution: deterministic evaluation, per-environment
//! snapshot rooms with push and poll delivery, a live telemetry feed, and a
//! client SDK that keeps a local snapshot in sync.

pub mod config;
pub mod distribution;
pub mod error;
pub mod evaluation;
pub mod routes;
pub mod sdk;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod telemetry;
