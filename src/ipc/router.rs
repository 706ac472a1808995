use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const HANDLERS: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::setup::try_handle,
    handlers::departments::try_handle,
    handlers::subjects::try_handle,
    handlers::teachers::try_handle,
    handlers::students::try_handle,
    handlers::enrollment::try_handle,
    handlers::marks::try_handle,
    handlers::performance::try_handle,
    handlers::attendance::try_handle,
    handlers::timetable::try_handle,
    handlers::fees::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    for try_handle in HANDLERS {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }
    tracing::debug!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
