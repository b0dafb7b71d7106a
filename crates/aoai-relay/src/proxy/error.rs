//! Per-request and per-stream failures
//!
//! Every [`ProxyError`] is terminal for the request it occurred in and maps to
//! exactly one HTTP response. [`StreamError`] covers failures after the response
//! head has been sent; those abort the body instead.

use axum::{
    body::Body,
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Method other than OPTIONS/POST (or GET on the model list)
    #[error("method {0} is not allowed")]
    UnsupportedMethod(Method),

    #[error("no route for path {0}")]
    UnknownRoute(String),

    /// No usable `Authorization` header on the inbound request
    #[error("missing credential")]
    MissingCredential,

    /// Body unparseable, `model` absent, or not present in the model map
    #[error("model is missing or not mapped to a deployment")]
    UnresolvedModel,

    /// The inbound request body could not be read
    #[error("invalid request: {0}")]
    Request(String),

    /// Backend unreachable, TLS failure, or a broken response
    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream request timed out: {0}")]
    UpstreamTimeout(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::UnknownRoute(_) => StatusCode::NOT_FOUND,
            Self::MissingCredential | Self::UnresolvedModel => StatusCode::FORBIDDEN,
            Self::Request(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Classify a transport error from the outbound client.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout(err.to_string())
        } else if err.is_connect() {
            Self::Upstream(format!("failed to connect to upstream: {err}"))
        } else {
            Self::Upstream(err.to_string())
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Client-facing 4xx bodies are fixed strings that callers match on.
        let plain = match &self {
            Self::UnsupportedMethod(_) => Some("Method Not Allowed"),
            Self::UnknownRoute(_) => Some("404 Not Found"),
            Self::MissingCredential => Some("Not allowed"),
            Self::UnresolvedModel => Some("Missing model mapper"),
            _ => None,
        };

        let (content_type, body) = match plain {
            Some(text) => ("text/plain;charset=UTF-8", text.to_string()),
            None => {
                let error_type = match &self {
                    Self::Request(_) => "invalid_request",
                    Self::UpstreamTimeout(_) => "upstream_timeout",
                    _ => "upstream_error",
                };
                let body = serde_json::json!({
                    "error": {
                        "type": error_type,
                        "message": self.to_string(),
                    }
                });
                ("application/json", body.to_string())
            }
        };

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap_or_else(|_| status.into_response())
    }
}

/// Failure while repacketizing a streamed response
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("upstream stream failed: {0}")]
    Upstream(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid UTF-8 in upstream stream at byte {offset}")]
    MalformedUtf8 { offset: usize },

    /// The source ended in the middle of a multi-byte character
    #[error("upstream stream ended inside a UTF-8 sequence ({pending} bytes pending)")]
    TruncatedUtf8 { pending: usize },
}
