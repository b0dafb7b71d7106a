//! Rewriting OpenAI-shaped requests into Azure OpenAI deployment calls
//!
//! The inbound request is parsed once into a [`ProxyRequest`]; together with the
//! resolved deployment it deterministically produces an [`OutboundTarget`].

use axum::http::{HeaderMap, HeaderValue, Method, header};
use bytes::Bytes;
use serde_json::Value;
use url::Url;

use crate::config::BackendConfig;
use crate::error::Result;

use super::error::ProxyError;

/// Header Azure OpenAI reads the key from
pub const API_KEY_HEADER: &str = "api-key";

/// The two completion endpoints that are forwarded to a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Completions,
}

impl Endpoint {
    /// Path below `/openai/deployments/{deployment}/`
    pub fn backend_path(self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "chat/completions",
            Endpoint::Completions => "completions",
        }
    }
}

/// Where an inbound path leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Forward(Endpoint),
    Models,
    Unknown,
}

impl Route {
    /// Route a request path. A leading `//` is collapsed to a single slash.
    pub fn from_path(path: &str) -> Self {
        match normalize_path(path) {
            "/v1/chat/completions" => Route::Forward(Endpoint::ChatCompletions),
            "/v1/completions" => Route::Forward(Endpoint::Completions),
            "/v1/models" => Route::Models,
            _ => Route::Unknown,
        }
    }
}

/// Strip one slash from paths starting with `//`.
pub fn normalize_path(path: &str) -> &str {
    if path.starts_with("//") {
        &path[1..]
    } else {
        path
    }
}

/// An inbound completion request, parsed once and read-only afterwards
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub endpoint: Endpoint,
    pub headers: HeaderMap,
    /// Raw body bytes as received
    pub raw_body: Bytes,
    /// Parsed body; `None` when empty or not valid JSON
    pub body: Option<Value>,
    pub stream_requested: bool,
}

impl ProxyRequest {
    pub fn new(endpoint: Endpoint, headers: HeaderMap, raw_body: Bytes) -> Self {
        let body = serde_json::from_slice::<Value>(&raw_body).ok();
        let stream_requested = body
            .as_ref()
            .and_then(|b| b.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Self {
            endpoint,
            headers,
            raw_body,
            body,
            stream_requested,
        }
    }

    /// The `model` field, if the body is an object carrying a string model
    pub fn model(&self) -> Option<&str> {
        self.body.as_ref()?.get("model")?.as_str()
    }

    /// The caller's key: the `Authorization` value minus a `Bearer ` prefix.
    ///
    /// Returns `None` when the header is absent, not visible ASCII, or empty
    /// once the prefix is removed.
    pub fn credential(&self) -> Option<&str> {
        let value = self.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let key = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if key.is_empty() { None } else { Some(key) }
    }

    /// Bytes sent upstream: the original payload when it is a JSON object, `{}` otherwise
    pub fn outbound_body(&self) -> Bytes {
        match &self.body {
            Some(Value::Object(_)) => self.raw_body.clone(),
            _ => Bytes::from_static(b"{}"),
        }
    }
}

/// Fixed addressing for the Azure resource, derived once from configuration
#[derive(Debug, Clone)]
pub struct Backend {
    base_url: Url,
    api_version: String,
}

impl Backend {
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url()?,
            api_version: config.api_version.clone(),
        })
    }

    /// `{base}/openai/deployments/{deployment}/{endpoint}?api-version={version}`
    pub fn deployment_url(&self, deployment: &str, endpoint: Endpoint) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["openai", "deployments", deployment])
                .extend(endpoint.backend_path().split('/'));
        }
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version);
        url
    }
}

/// A fully rewritten backend call
#[derive(Debug, Clone)]
pub struct OutboundTarget {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Build the backend call for `request` against `deployment`.
///
/// Only `Content-Type: application/json` and the `api-key` header are sent; all
/// inbound headers, including `Authorization`, are dropped.
pub fn translate(
    request: &ProxyRequest,
    deployment: &str,
    backend: &Backend,
) -> std::result::Result<OutboundTarget, ProxyError> {
    let key = request.credential().ok_or(ProxyError::MissingCredential)?;
    let mut api_key = HeaderValue::from_str(key).map_err(|_| ProxyError::MissingCredential)?;
    api_key.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(API_KEY_HEADER, api_key);

    Ok(OutboundTarget {
        url: backend.deployment_url(deployment, request.endpoint),
        method: Method::POST,
        headers,
        body: request.outbound_body(),
    })
}
