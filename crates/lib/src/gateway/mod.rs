//! Gateway: HTTP + WebSocket front of the chat service.
//!
//! Single port serves HTTP and WebSocket. Protocol: first frame must be `connect`;
//! then requests (req/res) and per-session events.

mod protocol;
mod server;

pub use protocol::{
    event_frame, ChatSendParams, ConnectParams, HelloOk, ModelSelectParams, SessionOpenParams,
    SettingsUpdateParams, WsRequest, WsResponse, PROTOCOL_VERSION,
};
pub use server::{run_gateway, serve, EventSurface, GatewayState, SessionEvent};
