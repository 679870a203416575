use crate::auth::authorize_path;
use crate::job::Job;
use crate::params::{Format, ImageQuery, validate_params};
use crate::pipeline::{self, PipelineError};
use crate::state::AppState;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const IDENTITY: &str = "ImageServer";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/favicon.ico", get(favicon))
        .fallback(serve_image)
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    (StatusCode::OK, IDENTITY)
}

async fn favicon() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

/// Every path other than the fixed routes is a proxied source path.
async fn serve_image(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let path = uri.path();
    if let Err(err) = authorize_path(path, state.config.allowed_prefixes.as_ref()) {
        warn!(path, "request outside allowed prefixes");
        return (StatusCode::FORBIDDEN, err.to_string()).into_response();
    }

    // A malformed query string behaves exactly like an empty one.
    let query: ImageQuery = uri
        .query()
        .and_then(|raw| serde_urlencoded::from_str(raw).ok())
        .unwrap_or_default();
    let params = validate_params(&query);
    let job = Job::new(&state.config, path, params);

    match pipeline::process(&state, job).await {
        Ok(result_path) => serve_result(&result_path, params.format).await,
        Err(PipelineError::Timeout) => StatusCode::GATEWAY_TIMEOUT.into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

/// Serve a result-cache entry. Result filenames carry no extension, so
/// the content type comes from the requested format or, failing that,
/// from sniffing the stored bytes.
async fn serve_result(path: &Path, format: Option<Format>) -> Response {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    let content_type = format
        .map(|format| format.mime().to_string())
        .or_else(|| {
            image::guess_format(&bytes)
                .ok()
                .map(|format| format.to_mime_type().to_string())
        })
        .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());

    let mut response = Response::new(Body::from(bytes));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    response.headers_mut().remove(header::ACCEPT_ENCODING);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::Config;
    use crate::downloader::Downloader;
    use crate::params::Params;
    use crate::transform::{ImageEngine, TransformError, Transformer};
    use axum::body::to_bytes;
    use axum::http::Request;
    use image::{DynamicImage, ImageFormat, RgbaImage};
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::net::TcpListener;
    use tower::ServiceExt;
    use url::Url;

    fn png_bytes() -> Vec<u8> {
        let canvas = RgbaImage::from_pixel(32, 32, image::Rgba([200, 120, 40, 255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    async fn spawn_upstream() -> String {
        let app = Router::new()
            .route("/images/cat.png", get(|| async { png_bytes() }))
            .route(
                "/images/broken.png",
                get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_app(
        upstream: &str,
        dir: &std::path::Path,
        allowed_prefixes: Option<HashSet<String>>,
        transformer: Arc<dyn Transformer>,
        timeout: Duration,
    ) -> Router {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            source_base_url: Url::parse(upstream).unwrap(),
            master_dir: dir.join("master"),
            result_dir: dir.join("result"),
            request_timeout: timeout,
            download_timeout: Duration::from_secs(5),
            allowed_prefixes,
            max_download_conns_per_host: 8,
            max_in_flight_requests: 0,
        };
        let cache = CacheStore::new(&config).unwrap();
        let downloader = Downloader::new(&config, cache.clone()).unwrap();
        let state = Arc::new(AppState::new(config, cache, downloader, transformer));
        router(state)
    }

    async fn default_app(upstream: &str, dir: &std::path::Path) -> Router {
        test_app(
            upstream,
            dir,
            None,
            Arc::new(ImageEngine),
            Duration::from_secs(10),
        )
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn root_serves_identity() {
        let upstream = spawn_upstream().await;
        let dir = tempdir().unwrap();
        let app = default_app(&upstream, dir.path()).await;
        let response = app.oneshot(request("GET", "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ImageServer");
    }

    #[tokio::test]
    async fn favicon_is_not_found() {
        let upstream = spawn_upstream().await;
        let dir = tempdir().unwrap();
        let app = default_app(&upstream, dir.path()).await;
        let response = app.oneshot(request("GET", "/favicon.ico")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_get_methods_are_rejected() {
        let upstream = spawn_upstream().await;
        let dir = tempdir().unwrap();
        let app = default_app(&upstream, dir.path()).await;
        let response = app
            .clone()
            .oneshot(request("POST", "/images/cat.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let response = app.oneshot(request("DELETE", "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn allow_list_gates_first_segment() {
        let upstream = spawn_upstream().await;
        let dir = tempdir().unwrap();
        let allowed = Some(HashSet::from(["images".to_string()]));
        let app = test_app(
            &upstream,
            dir.path(),
            allowed,
            Arc::new(ImageEngine),
            Duration::from_secs(10),
        );
        let response = app
            .clone()
            .oneshot(request("GET", "/other/cat.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = app
            .oneshot(request("GET", "/images/cat.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn transformed_image_round_trip() {
        let upstream = spawn_upstream().await;
        let dir = tempdir().unwrap();
        let app = default_app(&upstream, dir.path()).await;
        let response = app
            .oneshot(request("GET", "/images/cat.png?w=8&h=8&fmt=jpeg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/jpeg"
        );
        assert!(response.headers().get(header::ACCEPT_ENCODING).is_none());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded = image::load_from_memory(&body).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
        assert_eq!(image::guess_format(&body).unwrap(), ImageFormat::Jpeg);
    }

    #[tokio::test]
    async fn repeated_request_is_served_from_the_result_cache() {
        let upstream = spawn_upstream().await;
        let dir = tempdir().unwrap();
        let app = default_app(&upstream, dir.path()).await;
        let first = app
            .clone()
            .oneshot(request("GET", "/images/cat.png?w=8"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first_body = to_bytes(first.into_body(), usize::MAX).await.unwrap();

        let second = app
            .oneshot(request("GET", "/images/cat.png?w=8"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let second_body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        assert_eq!(first_body, second_body);
    }

    #[tokio::test]
    async fn upstream_failure_maps_to_bad_request() {
        let upstream = spawn_upstream().await;
        let dir = tempdir().unwrap();
        let app = default_app(&upstream, dir.path()).await;
        let response = app
            .oneshot(request("GET", "/images/broken.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(!body.is_empty());
    }

    struct StalledEngine;

    impl Transformer for StalledEngine {
        fn transform(&self, master: &[u8], params: &Params) -> Result<Vec<u8>, TransformError> {
            std::thread::sleep(Duration::from_millis(600));
            ImageEngine.transform(master, params)
        }
    }

    #[tokio::test]
    async fn deadline_expiry_maps_to_gateway_timeout() {
        let upstream = spawn_upstream().await;
        let dir = tempdir().unwrap();
        let app = test_app(
            &upstream,
            dir.path(),
            None,
            Arc::new(StalledEngine),
            Duration::from_millis(100),
        );
        let response = app
            .oneshot(request("GET", "/images/cat.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
