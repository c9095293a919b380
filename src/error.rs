//! Error codes and uniform JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header naming the gateway-side failure class
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Client-visible failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// Authentication denied without a recoverable login redirect
    Unauthorized,
    /// The backend could not be started or did not become ready
    BackendStartFailed,
    /// The backend call itself failed
    ConnectionFailed,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::Unauthorized => StatusCode::FORBIDDEN,
            GatewayErrorCode::BackendStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used in the `error` field of the body
    pub fn label(&self) -> &'static str {
        match self {
            GatewayErrorCode::Unauthorized => "Unauthorized",
            GatewayErrorCode::BackendStartFailed => "Service Unavailable",
            GatewayErrorCode::ConnectionFailed => "Bad Gateway",
            GatewayErrorCode::InternalError => "Internal Server Error",
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::Unauthorized => "UNAUTHORIZED",
            GatewayErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: code.label(),
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","message":"{}"}}"#,
                self.error,
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
