//! Request-body validation (spec.md §6: "JSON bodies, UTF-8, `Content-Type:
//! application/json` required; `Content-Length` required and must be ≤
//! configured limit"). Kept as a hand-rolled check instead of axum's default
//! `Json<T>` rejection so the failure reaches the client as the gateway's
//! own error envelope and error code, not axum's built-in rejection body.

use axum::http::HeaderMap;
use dg_errors::GatewayError;
use serde::de::DeserializeOwned;

fn content_type_is_json(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim() == "application/json")
        .unwrap_or(false)
}

pub fn read_json<T: DeserializeOwned>(
    headers: &HeaderMap,
    body: &[u8],
    max_body_bytes: usize,
) -> Result<T, GatewayError> {
    if !headers.contains_key(axum::http::header::CONTENT_LENGTH) {
        return Err(GatewayError::MissingBody);
    }
    if body.is_empty() {
        return Err(GatewayError::MissingBody);
    }
    if body.len() > max_body_bytes {
        return Err(GatewayError::BodyTooLarge);
    }
    if !content_type_is_json(headers) {
        return Err(GatewayError::BadContentType);
    }
    serde_json::from_slice(body).map_err(|e| GatewayError::JsonParseError(e.to_string()))
}

pub fn parse_address(raw: &str) -> Result<alloy_primitives::Address, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::InvalidAddress(raw.to_string()))
}

pub fn parse_bytes(raw: &str) -> Result<alloy_primitives::Bytes, GatewayError> {
    use std::str::FromStr;
    let bytes = alloy_primitives::Bytes::from_str(raw).map_err(|_| GatewayError::InvalidHex(raw.to_string()))?;
    if bytes.is_empty() {
        return Err(GatewayError::EmptyInput);
    }
    Ok(bytes)
}
