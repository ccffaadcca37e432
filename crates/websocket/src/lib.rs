//! Websocket fan-out of engine events, filtered per connection.

mod handler;
mod messages;

pub use handler::{ws_handler, WsQuery, WsState};
pub use messages::{ClientMessage, ServerMessage, SubscriptionFilter};
