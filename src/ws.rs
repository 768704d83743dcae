//! WebSocket relay front-end.
//!
//! Speaks the array protocol: inbound `["EVENT", …]`, `["REQ", …]`,
//! `["CLOSE", …]`; outbound `OK`, `EVENT`, `EOSE`, `CLOSED`, `NOTICE`.
//! Every parseable EVENT gets exactly one OK; every REQ gets its stored
//! matches followed by exactly one EOSE, then stays live until CLOSE or
//! disconnect.

use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::event::Event;
use crate::store::{unix_now, Filter, Store};
use crate::validate::admit_event;

/// Shared state for the relay front-end.
#[derive(Clone)]
pub struct Relay {
    pub store: Store,
    pub verify_sig: bool,
    pub max_message_bytes: usize,
    live: broadcast::Sender<Event>,
}

impl Relay {
    pub fn new(store: Store, verify_sig: bool, max_message_bytes: usize) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            store,
            verify_sig,
            max_message_bytes,
            live,
        }
    }
}

/// Start the WebSocket server.
pub async fn serve_ws(
    addr: SocketAddr,
    relay: Relay,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = router(relay);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(relay: Relay) -> Router {
    Router::new()
        .route("/", get(handler))
        .with_state(Arc::new(relay))
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move { process(socket, relay).await })
}

/// Process one connection: inbound protocol messages plus live fan-out of
/// newly accepted events to this connection's subscriptions.
async fn process(mut socket: WebSocket, relay: Arc<Relay>) {
    let mut rx = relay.live.subscribe();
    let mut subs: HashMap<String, Vec<Filter>> = HashMap::new();
    loop {
        tokio::select! {
            msg = socket.next() => {
                let Some(Ok(msg)) = msg else { break };
                if let Message::Text(txt) = msg {
                    if txt.len() > relay.max_message_bytes {
                        send(&mut socket, &serde_json::json!(["NOTICE", "message too large"])).await;
                        continue;
                    }
                    handle_text(&txt, &mut socket, &relay, &mut subs).await;
                }
            }
            ev = rx.recv() => {
                let Ok(ev) = ev else { continue };
                let now = unix_now();
                for (sub, filters) in &subs {
                    if filters.iter().any(|f| f.matches(&ev, now)) {
                        send(&mut socket, &serde_json::json!(["EVENT", sub, ev])).await;
                    }
                }
            }
        }
    }
}

async fn send(socket: &mut WebSocket, msg: &Value) {
    let _ = socket.send(Message::Text(msg.to_string())).await;
}

/// Dispatch one inbound text frame.
async fn handle_text(
    txt: &str,
    socket: &mut WebSocket,
    relay: &Relay,
    subs: &mut HashMap<String, Vec<Filter>>,
) {
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        send(socket, &serde_json::json!(["NOTICE", "could not parse message"])).await;
        return;
    };
    let Some(arr) = val.as_array() else {
        send(socket, &serde_json::json!(["NOTICE", "expected a message array"])).await;
        return;
    };
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 2 => {
            let payload = &arr[1];
            let Ok(ev) = serde_json::from_value::<Event>(payload.clone()) else {
                // echo the claimed id when there is one to hang an OK on
                if let Some(id) = payload.get("id").and_then(|v| v.as_str()) {
                    send(socket, &serde_json::json!(["OK", id, false, "invalid: malformed event"]))
                        .await;
                } else {
                    send(socket, &serde_json::json!(["NOTICE", "could not parse event"])).await;
                }
                return;
            };
            match admit_event(&relay.store, &ev, relay.verify_sig, unix_now()) {
                Ok(()) => {
                    send(socket, &serde_json::json!(["OK", ev.id, true, ""])).await;
                    let _ = relay.live.send(ev);
                }
                Err(reject) => {
                    send(
                        socket,
                        &serde_json::json!(["OK", ev.id, false, reject.to_string()]),
                    )
                    .await;
                }
            }
        }
        Some("REQ") if arr.len() >= 2 => {
            let sub = arr[1].as_str().unwrap_or_default().to_string();
            let filters: Vec<Filter> = arr[2..].iter().map(Filter::from_value).collect();
            if let Ok(events) = relay.store.query(&filters, unix_now()) {
                for ev in events {
                    send(socket, &serde_json::json!(["EVENT", sub, ev])).await;
                }
            }
            send(socket, &serde_json::json!(["EOSE", sub])).await;
            subs.insert(sub, filters);
        }
        Some("CLOSE") if arr.len() >= 2 => {
            let sub = arr[1].as_str().unwrap_or_default().to_string();
            subs.remove(&sub);
            send(
                socket,
                &serde_json::json!(["CLOSED", sub, "subscription closed"]),
            )
            .await;
        }
        _ => {
            send(socket, &serde_json::json!(["NOTICE", "unrecognized message"])).await;
        }
    }
}
