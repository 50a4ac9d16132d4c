//! Artifact serving.
//!
//! Endpoints download the published artifact over plain HTTP from
//! `<asset_route>/<file name>`. Only the artifact the catalog currently
//! resolves is served; anything else is a 404. Files are streamed from disk
//! and never buffered whole.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::Url;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acquisition::{safe_file_name, ArtifactCatalog, ArtifactMetadata};

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:8088";

/// Route artifacts are served under for a payload.
pub fn default_asset_route(payload: &str) -> String {
    format!("/plugins/{}/assets", payload)
}

/// Errors raised while running the artifact server.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Runtime(#[from] io::Error),
}

/// Where and how artifacts are served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub asset_route: String,
    pub public_origin: Option<String>,
}

impl ServeConfig {
    pub fn new(bind: SocketAddr, asset_route: impl AsRef<str>) -> Self {
        Self {
            bind,
            asset_route: normalize_route(asset_route.as_ref()),
            public_origin: None,
        }
    }

    /// Origin used in download links when a request carries none.
    pub fn with_public_origin(mut self, origin: impl Into<String>) -> Self {
        self.public_origin = Some(origin.into());
        self
    }

    /// Absolute URL an endpoint in `domain` should fetch `asset_name` from.
    ///
    /// The request origin is used when it is an http(s) origin, then the
    /// configured public origin, then the bind address.
    pub fn download_url(
        &self,
        origin: Option<&str>,
        domain: &str,
        asset_name: &str,
    ) -> Option<String> {
        let base = origin
            .filter(|o| o.starts_with("http"))
            .map(str::to_string)
            .or_else(|| self.public_origin.clone())
            .unwrap_or_else(|| format!("http://{}", self.bind));

        let mut url = Url::parse(base.trim_end_matches('/')).ok()?;
        {
            let mut segments = url.path_segments_mut().ok()?;
            segments.pop_if_empty();
            if !domain.is_empty() {
                segments.push(domain);
            }
            segments.extend(self.asset_route.split('/').filter(|s| !s.is_empty()));
            segments.push(asset_name);
        }
        Some(url.to_string())
    }
}

fn normalize_route(route: &str) -> String {
    let trimmed = route.trim().trim_matches('/');
    format!("/{}", trimmed)
}

/// Build the router serving `catalog` under `config.asset_route`.
///
/// `GET <route>` returns artifact metadata as JSON; `GET <route>/<name>`
/// streams the artifact.
pub fn router(catalog: Arc<ArtifactCatalog>, config: &ServeConfig) -> Router {
    let route = config.asset_route.trim_end_matches('/');
    let info_route = if route.is_empty() { "/" } else { route };
    Router::new()
        .route(info_route, get(asset_info))
        .route(&format!("{}/:filename", route), get(serve_asset))
        .with_state(catalog)
}

async fn asset_info(State(catalog): State<Arc<ArtifactCatalog>>) -> Json<ArtifactMetadata> {
    Json(catalog.metadata(false).await)
}

async fn serve_asset(
    State(catalog): State<Arc<ArtifactCatalog>>,
    Path(filename): Path<String>,
) -> Response {
    let Some(requested) = safe_file_name(&filename) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(asset) = catalog.resolve_asset().await else {
        debug!(file = %requested, "No artifact published");
        return StatusCode::NOT_FOUND.into_response();
    };
    if asset.name != requested {
        return StatusCode::NOT_FOUND.into_response();
    }

    let file = match tokio::fs::File::open(&asset.path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => {
            warn!(path = %asset.path.display(), error = %e, "Failed to open artifact");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let length = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!(path = %asset.path.display(), error = %e, "Failed to stat artifact");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    debug!(file = %asset.name, bytes = length, "Serving artifact");
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type_for(&asset.name)));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Content type for a served file name.
pub fn content_type_for(name: &str) -> &'static str {
    let is_zip = std::path::Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
    if is_zip {
        "application/zip"
    } else {
        "application/octet-stream"
    }
}

/// Bind `config.bind` and serve until `shutdown` is cancelled.
pub async fn serve(
    app: Router,
    config: &ServeConfig,
    shutdown: CancellationToken,
) -> Result<(), ServeError> {
    let listener = TcpListener::bind(config.bind).await.map_err(|source| {
        error!(
            target: "server::startup",
            addr = %config.bind,
            error = %source,
            "Failed to bind to address"
        );
        ServeError::Bind {
            address: config.bind.to_string(),
            source,
        }
    })?;
    info!(target: "server::startup", route = %config.asset_route, "Serving artifacts");
    serve_on(listener, app, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve_on(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), ServeError> {
    let addr = listener.local_addr()?;
    info!(target: "server::startup", addr = %addr, "Artifact server listening");
    if addr.ip().is_unspecified() {
        warn!(
            target: "server::startup",
            "Server is bound to all interfaces. Ensure firewall rules are properly configured."
        );
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| {
            error!(target: "server::shutdown", error = %e, "Server encountered an error");
            ServeError::Runtime(e)
        })?;

    info!(target: "server::shutdown", "Artifact server shut down gracefully");
    Ok(())
}
