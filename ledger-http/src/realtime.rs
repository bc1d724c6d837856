//! Per-client WebSocket fan-out. A connection manager maps `user_id -> set
//! of queues`; a single wildcard subscriber on the event bus routes each
//! published event to every queue registered for its `user_id`. Each
//! connected socket drains its own queue on an interval, concurrently with
//! reading client frames (ping/pong only, everything else ignored).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web_actors::ws;
use dashmap::DashMap;
use ledger_core::events::{Event, EventBus};
use ledger_core::types::UserId;
use serde_json::{json, Value};

const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Drops the oldest entry once full rather than blocking the publisher or
/// erroring the socket; clients reconcile by refetching snapshot state.
struct BoundedQueue {
    inner: Mutex<VecDeque<Value>>,
    capacity: usize,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::new()), capacity }
    }

    fn push(&self, value: Value) {
        let mut q = self.inner.lock().expect("realtime queue mutex poisoned");
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(value);
    }

    fn drain(&self) -> Vec<Value> {
        let mut q = self.inner.lock().expect("realtime queue mutex poisoned");
        q.drain(..).collect()
    }
}

pub struct ConnectionManager {
    conns: DashMap<UserId, Vec<Arc<BoundedQueue>>>,
    queue_capacity: usize,
}

impl ConnectionManager {
    pub fn new(queue_capacity: usize) -> Self {
        Self { conns: DashMap::new(), queue_capacity }
    }

    fn register(&self, user_id: UserId) -> Arc<BoundedQueue> {
        let queue = Arc::new(BoundedQueue::new(self.queue_capacity));
        self.conns.entry(user_id).or_default().push(queue.clone());
        queue
    }

    fn unregister(&self, user_id: UserId, queue: &Arc<BoundedQueue>) {
        if let Some(mut entry) = self.conns.get_mut(&user_id) {
            entry.retain(|q| !Arc::ptr_eq(q, queue));
            if entry.is_empty() {
                drop(entry);
                self.conns.remove(&user_id);
            }
        }
    }

    /// The wildcard subscriber callback: extracts `user_id` from the event
    /// payload and pushes the event onto every queue registered for it.
    fn route(&self, event: &Event) {
        let Some(user_id) = event.payload.get("user_id").and_then(Value::as_i64) else {
            return;
        };
        if let Some(queues) = self.conns.get(&user_id) {
            let mut body = event.payload.clone();
            if let Value::Object(ref mut map) = body {
                map.insert("event".into(), json!(event.topic));
            }
            for queue in queues.iter() {
                queue.push(body.clone());
            }
        }
    }
}

/// Subscribes a `ConnectionManager` to every event on the bus. Call once at
/// startup; the closure holds a clone of the `Arc` so the manager outlives
/// the subscription.
pub fn bridge_event_bus(events: &EventBus, conn_mgr: Arc<ConnectionManager>) {
    events.subscribe("*", Arc::new(move |event: &Event| conn_mgr.route(event)));
}

pub struct RealtimeSession {
    user_id: UserId,
    conn_mgr: Arc<ConnectionManager>,
    queue: Option<Arc<BoundedQueue>>,
}

impl RealtimeSession {
    pub fn new(user_id: UserId, conn_mgr: Arc<ConnectionManager>) -> Self {
        Self { user_id, conn_mgr, queue: None }
    }
}

impl Actor for RealtimeSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let queue = self.conn_mgr.register(self.user_id);
        self.queue = Some(queue);

        ctx.text(json!({"event": "connection_ack", "client_id": self.user_id}).to_string());

        ctx.run_interval(DRAIN_INTERVAL, |act, ctx| {
            let Some(queue) = &act.queue else { return };
            for message in queue.drain() {
                ctx.text(message.to_string());
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(queue) = self.queue.take() {
            self.conn_mgr.unregister(self.user_id, &queue);
        }
    }
}

/// Authorization for `/ws/client/{client_id}`: the caller's identity must
/// equal `client_id`, or the caller must be a trader mapped to that client.
/// Identity arrives via `X-Caller-Id`, set by whatever upstream gateway
/// terminates authentication (out of scope here; see the core's non-goals).
pub async fn authorize_ws_connection(
    store: &crate::store_pg::PgStore,
    caller_id: UserId,
    client_id: UserId,
    debug_mode: bool,
) -> Result<(), ledger_core::error::LedgerError> {
    use ledger_core::store::LedgerStore;

    if caller_id == client_id || debug_mode {
        return Ok(());
    }
    if store.trader_maps_to_client(caller_id, client_id).await? {
        return Ok(());
    }
    Err(ledger_core::error::LedgerError::NotAuthorized)
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RealtimeSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(bytes)) => ctx.pong(&bytes),
            Ok(ws::Message::Text(text)) => {
                if text.trim() == "ping" {
                    ctx.text(json!({"event": "pong"}).to_string());
                }
                // Every other inbound frame is ignored per the fan-out contract.
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(_) => ctx.stop(),
            _ => {}
        }
    }
}

pub mod route {
    use actix_web::{get, web, Error, HttpRequest, HttpResponse};
    use actix_web_actors::ws;
    use ledger_core::types::UserId;

    use super::{authorize_ws_connection, RealtimeSession};
    use crate::app_state::AppState;

    fn caller_id(req: &HttpRequest) -> Option<UserId> {
        req.headers().get("X-Caller-Id")?.to_str().ok()?.parse().ok()
    }

    #[get("/ws/client/{client_id}")]
    pub async fn ws_client(
        req: HttpRequest,
        stream: web::Payload,
        path: web::Path<(UserId,)>,
        state: web::Data<AppState>,
    ) -> Result<HttpResponse, Error> {
        let (client_id,) = path.into_inner();
        let Some(caller_id) = caller_id(&req) else {
            tracing::info!(client_id, "rejecting websocket connection: no caller identity");
            return Ok(HttpResponse::Unauthorized().finish());
        };

        if authorize_ws_connection(&state.store, caller_id, client_id, state.settings.debug)
            .await
            .is_err()
        {
            tracing::info!(caller_id, client_id, "rejecting websocket connection: not authorized");
            return Ok(HttpResponse::Forbidden().finish());
        }

        tracing::info!(caller_id, client_id, "websocket connection authorized");
        ws::start(RealtimeSession::new(client_id, state.connections.clone()), &req, stream)
    }
}
