//! # walgate HTTP Server Module
//!
//! Axum front of the gateway.
//!
//! # Endpoints
//!
//! - `GET /`, `POST /` - Page view (durable write, text response)
//! - `POST /write` - Generic durable write (when `expose_sql_endpoint` is set)
//! - `/health` - Health check
//! - `/status` - Restore outcome and replication state
//! - `/metrics` - Counters

pub mod config;
pub mod observability_routes;
pub mod server;
pub mod state;
pub mod write_routes;

pub use config::HttpServerConfig;
pub use server::HttpServer;
pub use state::GatewayState;
pub use write_routes::{POST_POSITION_HEADER, PRE_POSITION_HEADER, SHIP_MS_HEADER};
