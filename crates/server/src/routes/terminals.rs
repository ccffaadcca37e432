use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use scorch::{Access, TerminalAttachment, TerminalFrame, TerminalInfo, TerminalRegistry};
use scorch_core::ComponentKey;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::components::ComponentPath;
use crate::error::{AppError, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct TerminalQuery {
    /// Only terminals of this experiment
    pub experiment: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ClaimRequest {
    pub client: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClaimResponse {
    pub pid: u32,
    pub access: Access,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct AttachQuery {
    pub client: String,
}

/// Text frames a terminal client may send. Binary frames are raw input.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TerminalInput {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
}

#[utoipa::path(
    get,
    path = "/api/terminals",
    params(TerminalQuery),
    responses((status = 200, description = "Live breakpoint terminals", body = Vec<TerminalInfo>)),
    tag = "terminals"
)]
pub async fn list_terminals(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
) -> Json<Vec<TerminalInfo>> {
    Json(state.scorch.terminals().list(query.experiment.as_deref()).await)
}

/// Negotiate access to a breakpoint's terminal. A read-write grant must be
/// followed by the websocket attach within the claim window.
#[utoipa::path(
    post,
    path = "/api/experiments/{experiment}/runs/{run}/loops/{loop}/stages/{stage}/components/{name}/terminal",
    params(ComponentPath),
    request_body = ClaimRequest,
    responses(
        (status = 200, description = "Access granted", body = ClaimResponse),
        (status = 404, description = "No terminal for this component", body = ErrorResponse)
    ),
    tag = "terminals"
)]
pub async fn claim_terminal(
    State(state): State<AppState>,
    Path(path): Path<ComponentPath>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, AppError> {
    if request.client.trim().is_empty() {
        return Err(AppError::BadRequest("Client ID cannot be empty".to_string()));
    }

    let key = ComponentKey::from(path);
    let (pid, access) = state
        .scorch
        .terminals()
        .claim_by_key(&key, &request.client)
        .await?;
    Ok(Json(ClaimResponse { pid, access }))
}

/// Attach to a terminal. History is replayed first, then live output; input
/// from anyone but the attached read-write owner is dropped.
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(pid): Path<u32>,
    Query(query): Query<AttachQuery>,
) -> Result<Response, AppError> {
    let terminals = state.scorch.terminals().clone();
    let attachment = terminals.attach(pid, &query.client).await?;
    tracing::info!(pid, client = %query.client, access = ?attachment.access, "Terminal viewer attached");

    let released = release_on_failure(terminals.clone(), pid, query.client.clone());
    Ok(ws
        .on_failed_upgrade(released)
        .on_upgrade(move |socket| serve_terminal(socket, terminals, attachment, query.client)))
}

/// The attachment is taken before the handshake; a handshake that never
/// completes must give the claim back.
fn release_on_failure(
    terminals: TerminalRegistry,
    pid: u32,
    client: String,
) -> impl FnOnce(axum::Error) + Send + 'static {
    move |error| {
        tracing::warn!(pid, client = %client, error = %error, "Terminal upgrade failed");
        tokio::spawn(async move { terminals.detach(pid, &client).await });
    }
}

async fn serve_terminal(
    socket: WebSocket,
    terminals: TerminalRegistry,
    mut attachment: TerminalAttachment,
    client: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let pid = attachment.pid;

    let history = std::mem::take(&mut attachment.history);
    if !history.is_empty() && sender.send(Message::Binary(history)).await.is_err() {
        terminals.detach(pid, &client).await;
        return;
    }

    loop {
        tokio::select! {
            frame = attachment.recv() => match frame {
                Some(TerminalFrame::Output(chunk)) => {
                    if sender.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                Some(TerminalFrame::Exited) | None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    forward(&terminals, pid, &client, &data).await;
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<TerminalInput>(&text) {
                        Ok(TerminalInput::Input { data }) => {
                            forward(&terminals, pid, &client, data.as_bytes()).await;
                        }
                        Ok(TerminalInput::Resize { rows, cols }) => {
                            if let Err(e) = terminals.resize(pid, &client, rows, cols).await {
                                tracing::warn!(pid, error = %e, "Terminal resize failed");
                            }
                        }
                        // plain keystrokes
                        Err(_) => forward(&terminals, pid, &client, text.as_bytes()).await,
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    terminals.detach(pid, &client).await;
    tracing::info!(pid, client = %client, "Terminal viewer detached");
}

async fn forward(terminals: &TerminalRegistry, pid: u32, client: &str, data: &[u8]) {
    match terminals.write(pid, client, data).await {
        Ok(true) => {}
        Ok(false) => tracing::trace!(pid, client, "Dropped input from read-only viewer"),
        Err(e) => tracing::warn!(pid, client, error = %e, "Terminal write failed"),
    }
}
