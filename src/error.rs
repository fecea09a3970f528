//! Error codes and plain-text error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Header carrying a stable machine-readable error code
pub const X_PREVIEW_ERROR: &str = "x-preview-error";

/// Error codes for gateway responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Missing or unparsable Host header
    MissingHostHeader,
    /// No preview registered for the host
    UnknownHost,
    /// Webhook delivery failed validation or decoding
    InvalidDelivery,
    /// A preview for the pull request is already running
    PreviewExists,
    /// No preview registered for the pull request being closed
    UnknownPreview,
    /// Container runtime or registry store failed while handling a delivery
    ProvisioningFailed,
    /// Failed to connect to the preview backend
    ConnectionFailed,
    /// Preview backend did not answer in time
    RequestTimeout,
}

impl ErrorCode {
    /// HTTP status for this error
    ///
    /// Everything the webhook caller or a visitor can cause, including
    /// runtime and store failures during a delivery, is reported as 400.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ErrorCode::UnknownHost => "UNKNOWN_HOST",
            ErrorCode::InvalidDelivery => "INVALID_DELIVERY",
            ErrorCode::PreviewExists => "PREVIEW_EXISTS",
            ErrorCode::UnknownPreview => "UNKNOWN_PREVIEW",
            ErrorCode::ProvisioningFailed => "PROVISIONING_FAILED",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }
}

/// Response body type shared by every handler
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Wrap bytes in the shared body type
pub fn full_body(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Plain-text error response with the X-Preview-Error header
pub fn error_response(code: ErrorCode, message: impl Into<String>) -> Response<ResponseBody> {
    let mut message = message.into();
    message.push('\n');

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header(X_PREVIEW_ERROR, code.as_header_value())
        .body(full_body(message))
        .expect("valid response with StatusCode enum and static headers")
}
