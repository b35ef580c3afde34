//! Local HTTP server serving a media file, for transfer and resolver tests

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// Path of the media file on the server
pub const CLIP_PATH: &str = "/media/clip.mp4";

/// Path that always answers 404
pub const MISSING_PATH: &str = "/media/missing.mp4";

/// Path that always answers 429 with `Retry-After: 7`
pub const BUSY_PATH: &str = "/media/busy.mp4";

struct MediaState {
    body: Vec<u8>,
    ranges: bool,
    /// `Range` header of every GET, in arrival order.
    range_requests: Mutex<Vec<Option<String>>>,
}

/// Media server on a random local port. Shuts down when dropped.
pub struct MediaServer {
    pub base_url: String,
    state: Arc<MediaState>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MediaServer {
    /// Serve `body` at [`CLIP_PATH`]. With `ranges` false the server ignores
    /// `Range` headers and never advertises byte ranges.
    pub async fn spawn(body: Vec<u8>, ranges: bool) -> Self {
        let state = Arc::new(MediaState {
            body,
            ranges,
            range_requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route(CLIP_PATH, get(serve_clip))
            .route(MISSING_PATH, get(|| async { StatusCode::NOT_FOUND }))
            .route(
                BUSY_PATH,
                get(|| async {
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        [(header::RETRY_AFTER, "7")],
                    )
                        .into_response()
                }),
            )
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Media server failed");
        });

        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            state,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn body(&self) -> &[u8] {
        &self.state.body
    }

    /// `Range` header of every GET of the clip so far.
    pub fn range_requests(&self) -> Vec<Option<String>> {
        self.state.range_requests.lock().unwrap().clone()
    }
}

/// Deterministic, non-repeating-looking filler of `len` bytes.
pub fn media_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn serve_clip(
    State(state): State<Arc<MediaState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let len = state.body.len() as u64;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if method == Method::GET {
        state.range_requests.lock().unwrap().push(range.clone());
    }

    let start = range
        .as_deref()
        .filter(|_| state.ranges)
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.trim_end_matches('-').parse::<u64>().ok());

    let mut builder = Response::builder().header(header::CONTENT_TYPE, "video/mp4");
    if state.ranges {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }

    match start {
        Some(start) if start >= len => builder
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{}", len))
            .body(Body::empty())
            .unwrap(),
        Some(start) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, len - 1, len),
            )
            .header(header::CONTENT_LENGTH, len - start)
            .body(Body::from(state.body[start as usize..].to_vec()))
            .unwrap(),
        None => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, len)
            .body(Body::from(state.body.clone()))
            .unwrap(),
    }
}
