//! Error envelope (spec.md §6/§7): `{errorCode, description}` with an HTTP
//! status chosen from the error's [`dg_errors::Category`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dg_errors::{Category, GatewayError};
use serde::Serialize;

pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    #[serde(rename = "errorCode")]
    error_code: i64,
    description: String,
}

fn status_for(category: Category) -> StatusCode {
    match category {
        Category::Input => StatusCode::BAD_REQUEST,
        Category::Auth => StatusCode::FORBIDDEN,
        Category::NotFound => StatusCode::NOT_FOUND,
        Category::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        Category::Resource => StatusCode::TOO_MANY_REQUESTS,
        Category::Conflict => StatusCode::CONFLICT,
        Category::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.category());
        tracing::warn!(error = %self.0, code = self.0.code(), %status, "request.failed");
        let body = ErrorEnvelope {
            error_code: self.0.code(),
            description: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
