use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use websocket::WsQuery;

use crate::state::AppState;

/// Run, pipeline and terminal events; `?experiment=` pre-subscribes, and
/// clients may narrow further with a subscription filter.
pub async fn events_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    websocket::ws_handler(ws, State(state.ws.clone()), Query(query)).await
}
