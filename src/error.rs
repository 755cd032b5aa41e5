use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

/// Closed set of failure kinds a request can resolve with.
///
/// Every pipeline stage classifies its failures into one of these before
/// setting the result future; nothing else ever crosses the worker boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Schema or validation failure, including unknown model ids.
    #[error("[{req_id}] {message}")]
    BadRequest { req_id: String, message: String },

    /// Rejected by the inbound bearer-token check.
    #[error("{message}")]
    Unauthorized { message: String },

    /// The UI refused or failed a model switch.
    #[error("[{req_id}] {message}")]
    ModelSwitchFailed { req_id: String, message: String },

    /// A probe or checkpoint observed the client gone. Never written to the
    /// wire; it short-circuits work and is logged instead.
    #[error("[{req_id}] {message}")]
    ClientDisconnected { req_id: String, message: String },

    /// The client asked for cancellation via the cancel endpoint.
    #[error("[{req_id}] {message}")]
    UserCancelled { req_id: String, message: String },

    /// The UI session is not ready to take requests.
    #[error("[{req_id}] {message}")]
    ServiceUnavailable { req_id: String, message: String },

    /// Queue wait or completion wait ran out of time.
    #[error("[{req_id}] {message}")]
    ProcessingTimeout { req_id: String, message: String },

    /// The provider answered with an error, or the stream parser gave up.
    #[error("[{req_id}] {message}")]
    UpstreamError { req_id: String, message: String },

    /// Upstream 429 or a provider message mentioning quota.
    #[error("[{req_id}] {message}")]
    QuotaExceeded { req_id: String, message: String },

    /// Anything unclassified. Accompanied by a debug snapshot when it comes
    /// out of the pipeline.
    #[error("[{req_id}] {message}")]
    ServerError { req_id: String, message: String },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::ModelSwitchFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::ClientDisconnected { .. } | GatewayError::UserCancelled { .. } => {
                // Nginx-style "client closed request".
                StatusCode::from_u16(499).expect("valid status")
            }
            GatewayError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ProcessingTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for the two kinds that mean "the requester is no longer there".
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            GatewayError::ClientDisconnected { .. } | GatewayError::UserCancelled { .. }
        )
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        let body = serde_json::json!({ "error": { "message": self.to_string() } });
        let mut builder = HttpResponse::build(self.status());
        if matches!(self, GatewayError::ServiceUnavailable { .. }) {
            builder.insert_header(("retry-after", "30"));
        }
        builder.json(body)
    }
}

// Constructors mirroring how call sites classify failures; keeps the
// variants' field noise out of the pipeline code.

pub fn bad_request(req_id: &str, message: impl Into<String>) -> GatewayError {
    GatewayError::BadRequest {
        req_id: req_id.to_string(),
        message: message.into(),
    }
}

pub fn unauthorized(message: impl Into<String>) -> GatewayError {
    GatewayError::Unauthorized {
        message: message.into(),
    }
}

pub fn model_switch_failed(req_id: &str, message: impl Into<String>) -> GatewayError {
    GatewayError::ModelSwitchFailed {
        req_id: req_id.to_string(),
        message: message.into(),
    }
}

pub fn client_disconnected(req_id: &str, message: impl Into<String>) -> GatewayError {
    GatewayError::ClientDisconnected {
        req_id: req_id.to_string(),
        message: message.into(),
    }
}

pub fn client_cancelled(req_id: &str, message: impl Into<String>) -> GatewayError {
    GatewayError::UserCancelled {
        req_id: req_id.to_string(),
        message: message.into(),
    }
}

pub fn service_unavailable(req_id: &str, message: impl Into<String>) -> GatewayError {
    GatewayError::ServiceUnavailable {
        req_id: req_id.to_string(),
        message: message.into(),
    }
}

pub fn processing_timeout(req_id: &str, message: impl Into<String>) -> GatewayError {
    GatewayError::ProcessingTimeout {
        req_id: req_id.to_string(),
        message: message.into(),
    }
}

pub fn upstream_error(req_id: &str, message: impl Into<String>) -> GatewayError {
    GatewayError::UpstreamError {
        req_id: req_id.to_string(),
        message: message.into(),
    }
}

pub fn quota_exceeded(req_id: &str, message: impl Into<String>) -> GatewayError {
    GatewayError::QuotaExceeded {
        req_id: req_id.to_string(),
        message: message.into(),
    }
}

pub fn server_error(req_id: &str, message: impl Into<String>) -> GatewayError {
    GatewayError::ServerError {
        req_id: req_id.to_string(),
        message: message.into(),
    }
}

/// Classify an upstream error frame: 429 and quota-flavoured messages become
/// `QuotaExceeded`, everything else `UpstreamError`.
pub fn classify_upstream(req_id: &str, status: u16, message: &str) -> GatewayError {
    if status == 429 || message.to_ascii_lowercase().contains("quota") {
        quota_exceeded(req_id, format!("Provider quota exhausted: {message}"))
    } else {
        upstream_error(req_id, format!("Provider error (status {status}): {message}"))
    }
}
