use scorch::Scorch;
use std::sync::Arc;
use websocket::WsState;

#[derive(Clone)]
pub struct AppState {
    pub scorch: Scorch,
    pub ws: Arc<WsState>,
}

impl AppState {
    pub fn new(scorch: Scorch) -> Self {
        let ws = Arc::new(WsState::new(scorch.bus().clone()));
        Self { scorch, ws }
    }
}
