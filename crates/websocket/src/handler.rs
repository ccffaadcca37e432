use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::interval;

use events::{EventBus, EventEnvelope};

use crate::messages::{ClientMessage, ServerMessage, SubscriptionFilter};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct WsState {
    pub event_bus: EventBus,
}

impl WsState {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }
}

/// `?experiment=name` subscribes to that experiment right away.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub experiment: Option<String>,
}

/// What one connection currently wants to hear about.
#[derive(Debug, Default)]
struct Subscription {
    active: bool,
    filter: Option<SubscriptionFilter>,
}

impl Subscription {
    fn from_query(query: WsQuery) -> Self {
        match query.experiment {
            Some(experiment) => Self {
                active: true,
                filter: Some(SubscriptionFilter::for_experiment(experiment)),
            },
            None => Self::default(),
        }
    }

    fn wants(&self, envelope: &EventEnvelope) -> bool {
        self.active && self.filter.as_ref().map_or(true, |f| f.matches(envelope))
    }

    /// Apply a client frame and produce the reply.
    fn handle(&mut self, text: &str) -> ServerMessage {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Subscribe { filter }) => {
                self.active = true;
                self.filter = filter.clone();
                ServerMessage::Subscribed { filter }
            }
            Ok(ClientMessage::Unsubscribe) => {
                self.active = false;
                self.filter = None;
                ServerMessage::Unsubscribed
            }
            Ok(ClientMessage::Ping) => ServerMessage::Pong,
            Err(e) => ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            },
        }
    }
}

type Sender = SplitSink<WebSocket, Message>;

/// Serialize and send; false once the client is gone.
async fn send(sender: &mut Sender, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize websocket message");
            true
        }
    }
}

/// Event stream for all experiments, narrowed by the client's subscription.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let subscription = Subscription::from_query(query);
    ws.on_upgrade(move |socket| handle_socket(socket, state, subscription))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsState>, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.event_bus.subscribe();

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.reset();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if !send(&mut sender, &ServerMessage::Pong).await {
                    break;
                }
            }

            event = event_rx.recv() => match event {
                Ok(envelope) => {
                    if subscription.wants(&envelope)
                        && !send(&mut sender, &ServerMessage::Event { envelope }).await
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "WebSocket client lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            msg = tokio::time::timeout(CLIENT_TIMEOUT + HEARTBEAT_INTERVAL, receiver.next()) => match msg {
                Ok(Some(Ok(Message::Text(text)))) => {
                    let reply = subscription.handle(&text);
                    if !send(&mut sender, &reply).await {
                        break;
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(_))) => {}
                Err(_) => {
                    tracing::debug!("WebSocket client timed out");
                    break;
                }
            },
        }
    }

    tracing::debug!("WebSocket connection closed");
}
