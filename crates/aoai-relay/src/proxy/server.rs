//! HTTP front end of the relay
//!
//! Every request goes through a single dispatcher that walks the same decision
//! sequence: preflight, model listing, method check, route, model resolution,
//! credential check, upstream call, and finally direct or re-paced relay of the
//! upstream body.

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

use crate::config::{Config, ProxyConfig};
use crate::error::{RelayError, Result};

use super::error::ProxyError;
use super::models::ModelMap;
use super::repacketize::{Pacing, repacketize};
use super::translate::{Backend, Endpoint, OutboundTarget, ProxyRequest, Route, translate};

/// Hop-by-hop headers that are never relayed back to the client
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared application state for all requests; read-only after startup
#[derive(Debug, Clone)]
pub struct AppState {
    /// Listener and client settings
    pub config: ProxyConfig,
    /// Azure resource addressing
    pub backend: Backend,
    /// Client model name to deployment mapping
    pub models: ModelMap,
    /// Delay between re-paced frames
    pub pacing: Pacing,
    /// HTTP client for upstream requests
    pub client: reqwest::Client,
}

impl AppState {
    /// Build state from a validated configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.proxy.connect_timeout())
            .read_timeout(config.proxy.idle_timeout())
            .build()
            .map_err(|e| RelayError::Proxy(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            config: config.proxy.clone(),
            backend: Backend::from_config(&config.backend)?,
            models: config.models.clone(),
            pacing: Pacing::from(&config.pacing),
            client,
        })
    }
}

/// The relay server
pub struct ProxyServer {
    state: Arc<AppState>,
}

impl ProxyServer {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(AppState::from_config(config)?),
        })
    }

    /// Listen for requests until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let addr = self.state.config.socket_addr()?;
        let app = create_router(self.state.clone());

        tracing::info!("Starting proxy server on {addr}");
        tracing::info!(
            "Serving {} model(s): {}",
            self.state.models.len(),
            self.state.models.names().collect::<Vec<_>>().join(", ")
        );

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Proxy(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| RelayError::Proxy(format!("Server error: {e}")))?;

        tracing::info!("Proxy server shut down gracefully");
        Ok(())
    }
}

/// Create the router; all paths funnel into [`dispatch`].
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn dispatch(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response<Body> {
    match handle(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                ProxyError::Upstream(_) | ProxyError::UpstreamTimeout(_) => {
                    tracing::warn!("{e}");
                }
                _ => tracing::debug!("Rejected request: {e}"),
            }
            e.into_response()
        }
    }
}

async fn handle(state: &AppState, request: Request<Body>) -> std::result::Result<Response, ProxyError> {
    if request.method() == Method::OPTIONS {
        return Ok(preflight_response());
    }

    let route = Route::from_path(request.uri().path());
    let method = request.method().clone();

    if route == Route::Models && (method == Method::GET || method == Method::POST) {
        return Ok(models_response(&state.models));
    }
    if method != Method::POST {
        return Err(ProxyError::UnsupportedMethod(method));
    }
    let endpoint = match route {
        Route::Forward(endpoint) => endpoint,
        Route::Models | Route::Unknown => {
            return Err(ProxyError::UnknownRoute(request.uri().path().to_string()));
        }
    };

    let inbound = read_request(endpoint, request).await?;
    let deployment = inbound
        .model()
        .and_then(|model| state.models.resolve(model))
        .ok_or(ProxyError::UnresolvedModel)?;
    let target = translate(&inbound, deployment, &state.backend)?;

    tracing::debug!(
        deployment,
        stream = inbound.stream_requested,
        "Forwarding to {}",
        target.url
    );

    let upstream = send(state, target, inbound.stream_requested).await?;
    Ok(relay_response(upstream, inbound.stream_requested, state.pacing))
}

async fn read_request(
    endpoint: Endpoint,
    request: Request<Body>,
) -> std::result::Result<ProxyRequest, ProxyError> {
    let (parts, body) = request.into_parts();
    let raw_body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::Request(format!("Failed to read request body: {e}")))?;
    Ok(ProxyRequest::new(endpoint, parts.headers, raw_body))
}

async fn send(
    state: &AppState,
    target: OutboundTarget,
    streaming: bool,
) -> std::result::Result<reqwest::Response, ProxyError> {
    let builder = state
        .client
        .request(target.method, target.url)
        .headers(target.headers)
        .body(target.body);
    let deadline = state.config.timeout();

    if !streaming {
        return builder
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| ProxyError::from_transport(&e));
    }

    // Only the response head is bounded here; a stalled body trips the read timeout.
    match tokio::time::timeout(deadline, builder.send()).await {
        Ok(result) => result.map_err(|e| ProxyError::from_transport(&e)),
        Err(_) => Err(ProxyError::UpstreamTimeout(format!(
            "no response headers within {}s",
            deadline.as_secs()
        ))),
    }
}

/// Relay the upstream response: status and headers as received plus
/// `Access-Control-Allow-Origin: *`, body either untouched or re-paced.
fn relay_response(upstream: reqwest::Response, streaming: bool, pacing: Pacing) -> Response {
    let status = upstream.status();
    let headers = relayed_headers(upstream.headers(), streaming);

    let body = if streaming {
        Body::from_stream(repacketize(upstream.bytes_stream(), pacing))
    } else {
        Body::from_stream(upstream.bytes_stream().map_err(std::io::Error::other))
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn relayed_headers(upstream: &HeaderMap, streaming: bool) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 1);
    for (name, value) in upstream {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) {
            continue;
        }
        // Re-pacing may append a delimiter to the final frame.
        if streaming && *name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers
}

/// CORS preflight answer, identical for every path
fn preflight_response() -> Response {
    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
        ],
    )
        .into_response()
}

fn models_response(models: &ModelMap) -> Response {
    match serde_json::to_string_pretty(&models.catalog()) {
        Ok(json) => ([(header::CONTENT_TYPE, "application/json")], json).into_response(),
        Err(e) => {
            tracing::error!("Failed to serialize model catalog: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
