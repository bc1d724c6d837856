//! Core of the multi-tenant brokerage order router and ledger: order
//! lifecycle, holdings/cash ledger, broker adapter abstraction, and the
//! signed webhook + event-bus plumbing that feeds real-time fan-out.
//!
//! HTTP route binding, auth/session issuance, market data and the UI are
//! external collaborators; this crate only defines the interfaces they call
//! through (`store::LedgerStore`, `broker::BrokerAdapter`, `events::EventBus`).

pub mod audit;
pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod fills;
pub mod holdings;
pub mod lifecycle;
pub mod orders;
pub mod pnl;
pub mod store;
pub mod types;
pub mod webhook;

pub use error::{ErrorClass, LedgerError, LedgerResult};
