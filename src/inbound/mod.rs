//! Inbound side: the local listener and per-connection relay sessions

mod http;
mod http_response;
pub mod request;

pub use http::{
    ClientConn, Hijack, Relay, RelayListener, RelaySession, SessionStage, SessionSummary,
};
pub use http_response::{bad_gateway, bad_request};
pub use request::{RequestHead, AUTH_TOKEN_HEADER, PADDING_HEADER};
