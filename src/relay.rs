use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bail_relay;
use crate::error::{RelayError, RelayResult};
use crate::extractors::ApiKey;
use crate::gemini::GenerationError;
use crate::AppState;

#[derive(Deserialize, Debug)]
pub struct GenerateRequest {
    /// Base64 encoded PNG portrait
    pub image: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct GenerateResponse {
    pub image: String,
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[axum_macros::debug_handler(state = AppState)]
pub(crate) async fn generate(
    State(state): State<AppState>,
    ApiKey(api_key): ApiKey,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> RelayResult<(StatusCode, Json<GenerateResponse>)> {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => bail_relay!(rejection.status(), rejection.body_text()),
    };

    let image = match request.image.as_deref() {
        Some(image) if !image.is_empty() => image,
        _ => bail_relay!(StatusCode::BAD_REQUEST, "Missing field image"),
    };
    if Base64::decode_vec(image).is_err() {
        bail_relay!(StatusCode::BAD_REQUEST, "Field image is not valid base64");
    }

    let response = match state.gemini.generate_image(&api_key, image).await {
        Ok(response) => response,
        Err(GenerationError::Api { status, message }) => bail_relay!(
            status,
            message.unwrap_or_else(|| "Gemini API Error".to_string())
        ),
        Err(err) => {
            warn!("Gemini request failed: {}", err);
            return Err(err.into());
        }
    };

    match response.first_inline_image() {
        Some(image) => {
            info!(model = state.gemini.model(), image_len = image.len(), "Image generated");
            Ok((
                StatusCode::OK,
                Json(GenerateResponse {
                    image: image.to_string(),
                }),
            ))
        }
        None => {
            warn!(candidates = response.candidates.len(), "Gemini returned no image");
            bail_relay!("AI failed to return an image")
        }
    }
}

pub(crate) async fn method_not_allowed() -> impl IntoResponse {
    (
        [(header::ALLOW, "POST")],
        RelayError {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: "Method Not Allowed".into(),
        },
    )
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::body::Body;
    use axum::http::{Method, Request, Uri};
    use axum::Router;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    use crate::gemini::{GeminiClient, PROMPT};

    use super::*;

    const PORTRAIT: &str = "iVBORw0KGgo=";

    #[derive(Default)]
    struct Upstream {
        calls: AtomicUsize,
        requests: Mutex<Vec<(Uri, Value)>>,
    }

    /// Serves a canned reply for every request and records what it received
    async fn spawn_gemini(status: StatusCode, reply: String) -> (String, Arc<Upstream>) {
        let upstream = Arc::new(Upstream::default());
        let recorder = upstream.clone();
        let fake = Router::new().fallback(move |uri: Uri, Json(body): Json<Value>| {
            let recorder = recorder.clone();
            let reply = reply.clone();
            async move {
                recorder.calls.fetch_add(1, Ordering::SeqCst);
                recorder.requests.lock().unwrap().push((uri, body));
                (status, [(header::CONTENT_TYPE, "application/json")], reply)
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, fake).await.unwrap() });

        (format!("http://{}/v1beta", addr), upstream)
    }

    fn app(base_url: &str, api_key: Option<&str>) -> Router {
        let state = AppState {
            gemini: Arc::new(GeminiClient::new(base_url, "gemini-test").unwrap()),
            api_key: api_key.map(Arc::from),
        };
        crate::router(state, 1_000_000)
    }

    async fn send(app: Router, method: Method, body: impl Into<Body>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri("/api/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post_portrait(app: Router) -> (StatusCode, Value) {
        send(app, Method::POST, json!({ "image": PORTRAIT }).to_string()).await
    }

    fn image_reply(parts: Value) -> String {
        json!({ "candidates": [{ "content": { "parts": parts }, "finishReason": "STOP" }] })
            .to_string()
    }

    #[tokio::test]
    async fn other_methods_are_rejected_before_dispatch() {
        let (base_url, upstream) = spawn_gemini(StatusCode::OK, image_reply(json!([]))).await;
        let app = app(&base_url, Some("test-key"));

        for method in [Method::GET, Method::PUT, Method::DELETE, Method::PATCH] {
            let (status, body) = send(app.clone(), method, Body::empty()).await;
            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(body, json!({ "error": "Method Not Allowed" }));
        }
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_api_key_is_a_configuration_error() {
        let (base_url, upstream) = spawn_gemini(StatusCode::OK, image_reply(json!([]))).await;

        let (status, body) = post_portrait(app(&base_url, None)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            json!({ "error": "Server Configuration Error: API Key missing" })
        );
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_or_invalid_image_is_rejected_before_dispatch() {
        let (base_url, upstream) = spawn_gemini(StatusCode::OK, image_reply(json!([]))).await;
        let app = app(&base_url, Some("test-key"));

        for payload in [json!({}), json!({ "image": null }), json!({ "image": "" })] {
            let (status, body) = send(app.clone(), Method::POST, payload.to_string()).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body, json!({ "error": "Missing field image" }));
        }

        let (status, body) = send(
            app.clone(),
            Method::POST,
            json!({ "image": "not base64!" }).to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Field image is not valid base64" }));

        let (status, body) = send(app, Method::POST, "{\"image\":").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("JSON"));

        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn relays_the_generated_image() {
        let reply = image_reply(json!([
            { "inlineData": { "mimeType": "image/png", "data": "cGFzc3BvcnQ=" } }
        ]));
        let (base_url, upstream) = spawn_gemini(StatusCode::OK, reply).await;

        let (status, body) = post_portrait(app(&base_url, Some("test-key"))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "image": "cGFzc3BvcnQ=" }));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        let requests = upstream.requests.lock().unwrap();
        let (uri, sent) = &requests[0];
        assert_eq!(uri.path(), "/v1beta/models/gemini-test:generateContent");
        assert_eq!(uri.query(), Some("key=test-key"));
        assert_eq!(
            sent,
            &json!({
                "contents": [{
                    "parts": [
                        { "text": PROMPT },
                        { "inlineData": { "mimeType": "image/png", "data": PORTRAIT } }
                    ]
                }],
                "generationConfig": { "responseModalities": ["IMAGE"] }
            })
        );
    }

    #[tokio::test]
    async fn relays_only_the_first_inline_image() {
        let reply = image_reply(json!([
            { "text": "Here you go" },
            { "inlineData": { "mimeType": "image/png", "data": "Zmlyc3Q=" } },
            { "inlineData": { "mimeType": "image/png", "data": "c2Vjb25k" } }
        ]));
        let (base_url, _) = spawn_gemini(StatusCode::OK, reply).await;

        let (status, body) = post_portrait(app(&base_url, Some("test-key"))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "image": "Zmlyc3Q=" }));
    }

    #[tokio::test]
    async fn relays_upstream_status_and_message() {
        let reply = json!({
            "error": { "code": 403, "message": "API key not valid", "status": "PERMISSION_DENIED" }
        });
        let (base_url, _) = spawn_gemini(StatusCode::FORBIDDEN, reply.to_string()).await;

        let (status, body) = post_portrait(app(&base_url, Some("test-key"))).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, json!({ "error": "API key not valid" }));
    }

    #[tokio::test]
    async fn upstream_error_without_message_uses_fallback() {
        let replies = [
            json!({ "error": { "code": 429 } }).to_string(),
            json!({ "error": { "code": 400, "message": "" } }).to_string(),
            "{}".to_string(),
            "<html>".to_string(),
        ];
        for reply in replies {
            let (base_url, _) = spawn_gemini(StatusCode::TOO_MANY_REQUESTS, reply).await;

            let (status, body) = post_portrait(app(&base_url, Some("test-key"))).await;

            assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(body, json!({ "error": "Gemini API Error" }));
        }
    }

    #[tokio::test]
    async fn success_without_image_is_a_failure() {
        let reply = image_reply(json!([{ "text": "I cannot edit this photo" }]));
        let (base_url, upstream) = spawn_gemini(StatusCode::OK, reply).await;

        let (status, body) = post_portrait(app(&base_url, Some("test-key"))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "AI failed to return an image" }));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_upstream_body_is_an_internal_error() {
        let (base_url, _) = spawn_gemini(StatusCode::OK, "not json".to_string()).await;

        let (status, body) = post_portrait(app(&base_url, Some("test-key"))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Internal Server Error: "));
    }

    #[tokio::test]
    async fn network_failure_is_an_internal_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let app = app(&format!("http://{}/v1beta", addr), Some("test-key"));
        let (status, body) = post_portrait(app).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let message = body["error"].as_str().unwrap();
        assert!(message.starts_with("Internal Server Error: "));
        assert!(message.len() > "Internal Server Error: ".len());
        assert!(!message.contains("test-key"));
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app("http://127.0.0.1:9/v1beta", None);
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
    }
}
