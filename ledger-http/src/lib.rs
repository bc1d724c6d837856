//! HTTP-facing collaborator of `ledger-core`: Postgres persistence, signed
//! webhook ingress, per-vendor broker adapters and WebSocket fan-out. The
//! order lifecycle and fill logic themselves live in `ledger-core`; this
//! crate only wires them to the outside world.

pub mod app_state;
pub mod broker_adapters;
pub mod realtime;
pub mod store_pg;
pub mod webhook_routes;

pub use app_state::AppState;
