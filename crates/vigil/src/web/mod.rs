//! Embedded HTTP server: snapshot image and live-stream playlists.
//!
//! - `GET /image.jpg?width=W&height=H`: newest frame as JPEG
//! - `GET /<base>[-<profile>].m3u8`: rewritten HLS playlist for a profile
//!
//! Everything else is a 404. While the session is tearing down every
//! request gets a 503.

mod playlist;
mod snapshot;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::pipeline::StreamReader;
use crate::profiles::StreamingProfiles;

/// State shared between the session and request handlers
pub struct WebState {
    pub(crate) reader: Arc<dyn StreamReader>,
    /// Stream guard: true while the decode layer is open. Held across any
    /// handler call that touches the current frame.
    pub(crate) stream_opened: Arc<Mutex<bool>>,
    pub(crate) profiles: StreamingProfiles,
    pub(crate) cleaning_up: AtomicBool,
    pub(crate) playlist_base: String,
    pub(crate) remote_dir: PathBuf,
    pub(crate) playlist_wait: Duration,
    pub(crate) playlist_poll: Duration,
}

impl WebState {
    pub fn new(reader: Arc<dyn StreamReader>, config: &SessionConfig) -> Self {
        Self {
            reader,
            stream_opened: Arc::new(Mutex::new(false)),
            profiles: StreamingProfiles::new(config.timing.profile_idle_timeout),
            cleaning_up: AtomicBool::new(false),
            playlist_base: config.playlist_base(),
            remote_dir: config.remote_dir(),
            playlist_wait: config.timing.playlist_wait,
            playlist_poll: config.timing.playlist_poll,
        }
    }

    pub fn is_cleaning_up(&self) -> bool {
        self.cleaning_up.load(Ordering::Acquire)
    }
}

/// Build the router for a session
pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/image.jpg", get(snapshot::image))
        .fallback(fallback)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            unavailable_while_cleaning_up,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn unavailable_while_cleaning_up(
    State(state): State<Arc<WebState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.is_cleaning_up() {
        return (StatusCode::SERVICE_UNAVAILABLE, "camera process about to stop").into_response();
    }
    next.run(request).await
}

async fn fallback(State(state): State<Arc<WebState>>, uri: Uri) -> Response {
    let path = uri.path();
    if path.ends_with(".m3u8") {
        playlist::serve(&state, path).await
    } else {
        (StatusCode::NOT_FOUND, format!("unknown request path '{}'", path)).into_response()
    }
}

/// Headers that keep clients and proxies from caching live content
fn no_cache(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
}

/// A running HTTP server
pub struct WebServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WebServer {
    /// Bind `bind` (port 0 picks an ephemeral port) and start serving.
    pub async fn start(state: Arc<WebState>, bind: SocketAddr) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .context(format!("Failed to bind to {}", bind))?;
        let addr = listener.local_addr().context("Failed to read bound address")?;

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = router(state);

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                warn!("Web server error: {}", e);
            }
        });

        info!("Web server listening on http://{}", addr);
        Ok(Self { addr, cancel, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting and wait up to `timeout` for in-flight requests.
    ///
    /// Returns false if the server was still draining when time ran out.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                task.abort();
                false
            }
        }
    }
}
