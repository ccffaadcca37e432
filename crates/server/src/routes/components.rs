use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use scorch::{ComponentOutput, OutputFrame, OutputSubscription, Scorch};
use scorch_core::{ComponentKey, Stage};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::error::{AppError, ErrorResponse};
use crate::state::AppState;

/// Path segments addressing one component slot.
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Path)]
pub struct ComponentPath {
    pub experiment: String,
    pub run: usize,
    #[serde(rename = "loop")]
    pub loop_index: usize,
    pub stage: Stage,
    pub name: String,
}

impl From<ComponentPath> for ComponentKey {
    fn from(path: ComponentPath) -> Self {
        ComponentKey::new(path.experiment, path.run, path.loop_index, path.stage, path.name)
    }
}

#[utoipa::path(
    get,
    path = "/api/experiments/{experiment}/runs/{run}/loops/{loop}/stages/{stage}/components/{name}/output",
    params(ComponentPath),
    responses(
        (status = 200, description = "Buffered output and status", body = ComponentOutput),
        (status = 404, description = "Component has not reported yet", body = ErrorResponse)
    ),
    tag = "components"
)]
pub async fn get_component_output(
    State(state): State<AppState>,
    Path(path): Path<ComponentPath>,
) -> Result<Json<ComponentOutput>, AppError> {
    let key = ComponentKey::from(path);
    match state.scorch.component_output(key.clone()).await? {
        Some(output) => Ok(Json(output)),
        None => Err(AppError::NotFound(format!("No output for component {}", key))),
    }
}

/// Streams the component's output as binary frames: everything buffered so
/// far, then live chunks. The server closes the socket once the component
/// finishes.
pub async fn component_output_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(path): Path<ComponentPath>,
) -> Result<Response, AppError> {
    let subscription = state.scorch.subscribe_output(path.into()).await?;
    let scorch = state.scorch.clone();
    Ok(ws.on_upgrade(move |socket| stream_output(socket, scorch, subscription)))
}

async fn stream_output(socket: WebSocket, scorch: Scorch, mut subscription: OutputSubscription) {
    let (mut sender, mut receiver) = socket.split();
    let key = subscription.key.clone();
    let id = subscription.id;

    loop {
        tokio::select! {
            frame = subscription.recv() => match frame {
                Some(OutputFrame::Chunk(chunk)) => {
                    if sender.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                Some(OutputFrame::Done) | None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // viewers only listen
                Some(Ok(_)) => {}
            },
        }
    }

    if let Err(e) = scorch.detach_output(key.clone(), id).await {
        tracing::debug!(component = %key, error = %e, "Failed to detach output viewer");
    }
}
