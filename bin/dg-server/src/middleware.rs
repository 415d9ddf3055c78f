//! Cross-cutting HTTP concerns that apply to every route (spec.md §6/§7):
//! echoing the trace id header, and turning a panicking handler into the
//! same error envelope a normal `GatewayError` produces instead of a bare
//! connection reset.

use std::any::Any;

use axum::{
    body::Body,
    extract::Request,
    http::HeaderName,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dg_errors::GatewayError;

use crate::error::ApiError;

pub const TRACE_ID_HEADER: &str = "x-oasis-trace-id";

/// Echoes `X-OASIS-TRACE-ID` back on the response verbatim, unmodified
/// (spec.md §6). Requests without the header get no echo; nothing requires
/// one.
pub async fn echo_trace_id(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(HeaderName::from_static(TRACE_ID_HEADER))
        .cloned();

    let mut response = next.run(request).await;
    if let Some(value) = trace_id {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_ID_HEADER), value);
    }
    response
}

/// Converts a panic caught by `tower_http::catch_panic::CatchPanicLayer`
/// into the gateway's own error envelope (spec.md §7: "Panics in
/// user-supplied handlers are captured at the nearest task boundary and
/// converted into the Internal category with stacktrace logged").
pub fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    };
    tracing::error!(panic = %message, "request.panicked");
    ApiError(GatewayError::from_panic(&message)).into_response()
}
