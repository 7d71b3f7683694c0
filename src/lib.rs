//! walgate - a SQLite write gateway that acknowledges a write only after
//! remote storage holds it
//!
//! - `restore`: rebuild the local database from the newest remote generation
//! - `replication`: tail the WAL and ship snapshots and segments
//! - `gateway`: the durable write path
//! - `http_server`, `cli`: outer surfaces

pub mod cli;
pub mod client;
pub mod gateway;
pub mod http_server;
pub mod observability;
pub mod replication;
pub mod restore;
