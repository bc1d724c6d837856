//! Shared application state, built once at startup and handed to every
//! handler behind `web::Data`. Mirrors the teacher's `AppState` shape: a
//! handful of concurrent registries plus the database pool, no framework
//! magic.

use std::sync::Arc;

use dashmap::DashMap;
use ledger_core::config::Settings;
use ledger_core::events::EventBus;
use ledger_core::types::UserId;

use crate::broker_adapters::{BrokerRegistry, SessionRegistry};
use crate::realtime::{bridge_event_bus, ConnectionManager};
use crate::store_pg::PgStore;

pub struct AppState {
    pub settings: Settings,
    pub store: PgStore,
    pub events: EventBus,
    pub connections: Arc<ConnectionManager>,
    pub brokers: BrokerRegistry,
    /// `user_id -> broker` (lowercase vendor name), populated alongside
    /// whatever external onboarding flow links a client to their vendor
    /// account; out of scope here beyond this lookup.
    pub broker_for_user: DashMap<UserId, String>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let pool = PgStore::create_pool(&settings.database_url);
        let events = EventBus::new();
        let connections = Arc::new(ConnectionManager::new(settings.realtime_queue_capacity));
        bridge_event_bus(&events, connections.clone());

        let sessions: SessionRegistry = Arc::new(DashMap::new());

        Self {
            settings,
            store: PgStore::new(pool),
            events,
            connections,
            brokers: BrokerRegistry::new(sessions),
            broker_for_user: DashMap::new(),
        }
    }
}
