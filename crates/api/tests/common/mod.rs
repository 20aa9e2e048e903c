#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http_body_util::BodyExt;
use sketchforge_core::generation::{GeneratedImage, ImageFormat};
use sketchforge_providers::descriptor::{HostedProvider, LocalProvider};
use sketchforge_providers::{
    BackendError, BackendOutput, BackendRequest, Capabilities, GenerationBackend, Pricing,
    ProviderConfig, ProviderRegistry, RateLimits,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use sketchforge_api::config::{OrchestratorConfig, ServerConfig};
use sketchforge_api::router::build_app_router;
use sketchforge_api::state::AppState;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
    }
}

/// Orchestrator defaults with fast retries; providers come from the test.
pub fn test_orchestrator() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::from_lookup(|key| match key {
        "BACKOFF_BASE_MS" => Some("10".to_string()),
        "BACKOFF_CAP_MS" => Some("100".to_string()),
        _ => None,
    })
    .expect("default orchestrator config");
    config.providers.clear();
    config
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Backend that always returns an 8x8 PNG, after an optional delay.
pub struct StubBackend {
    pub delay: Duration,
    pub healthy: AtomicBool,
}

impl StubBackend {
    pub fn new() -> Arc<Self> {
        Self::slow(Duration::ZERO)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            healthy: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl GenerationBackend for StubBackend {
    async fn generate(&self, _request: &BackendRequest) -> Result<BackendOutput, BackendError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(BackendOutput {
            image: GeneratedImage {
                bytes: sample_png(8, 8),
                format: ImageFormat::Png,
                width: 8,
                height: 8,
            },
            model: Some("stub".to_string()),
            quality_score: Some(0.9),
        })
    }

    async fn probe(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

pub fn capabilities() -> Capabilities {
    Capabilities {
        max_width: 1024,
        max_height: 1024,
        supported_formats: vec![ImageFormat::Png],
        max_prompt_length: 500,
        image_to_image: true,
    }
}

pub fn limits() -> RateLimits {
    RateLimits {
        per_minute: 100,
        per_hour: 1000,
        concurrent: 4,
    }
}

pub fn local_provider(id: &str) -> ProviderConfig {
    ProviderConfig::Local(LocalProvider {
        id: id.to_string(),
        name: format!("Local {id}"),
        api_url: "http://localhost:7860".to_string(),
        model: "sd-test".to_string(),
        capabilities: capabilities(),
        rate_limits: limits(),
        timeout_secs: 30,
    })
}

pub fn hosted_provider(id: &str, cost: f64) -> ProviderConfig {
    ProviderConfig::Hosted(HostedProvider {
        id: id.to_string(),
        name: format!("Hosted {id}"),
        api_url: "https://api.example.test".to_string(),
        model: "sdxl-test".to_string(),
        api_key: Some("test-key".to_string()),
        capabilities: capabilities(),
        pricing: Pricing {
            cost_per_generation: cost,
            currency: "USD".to_string(),
            free_quota: 0,
        },
        rate_limits: limits(),
        timeout_secs: 30,
    })
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

/// A running app: router plus the state behind it. Workers stop when the
/// value is dropped.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    cancel: CancellationToken,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Build the full application router over `providers`, each backed by its
/// paired backend, and start the queue workers.
///
/// This uses the same router builder as `main.rs` so tests exercise the
/// production middleware stack.
pub fn build_test_app(providers: Vec<(ProviderConfig, Arc<dyn GenerationBackend>)>) -> TestApp {
    let orchestrator = test_orchestrator();
    let registry = Arc::new(ProviderRegistry::new(orchestrator.rate_limit_windows));
    for (config, backend) in providers {
        registry.register(config, backend).expect("register provider");
    }

    let config = test_config();
    let state = AppState::new(config.clone(), &orchestrator, registry);
    let cancel = CancellationToken::new();
    state.queue.start(cancel.clone());

    TestApp {
        router: build_app_router(state.clone(), &config),
        state,
        cancel,
    }
}

/// App with a single healthy local provider `local`.
pub fn default_app() -> TestApp {
    let backend: Arc<dyn GenerationBackend> = StubBackend::new();
    build_test_app(vec![(local_provider("local"), backend)])
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub async fn get(app: &TestApp, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, Body::empty(), None).await
}

pub async fn delete(app: &TestApp, uri: &str) -> Response<Body> {
    send(app, Method::DELETE, uri, Body::empty(), None).await
}

pub async fn post_empty(app: &TestApp, uri: &str) -> Response<Body> {
    send(app, Method::POST, uri, Body::empty(), None).await
}

pub async fn post_json(app: &TestApp, uri: &str, body: serde_json::Value) -> Response<Body> {
    send(
        app,
        Method::POST,
        uri,
        Body::from(body.to_string()),
        Some("application/json"),
    )
    .await
}

async fn send(
    app: &TestApp,
    method: Method,
    uri: &str,
    body: Body,
    content_type: Option<&str>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(content_type) = content_type {
        builder = builder.header("content-type", content_type);
    }
    app.router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([255, 255, 255, 255]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

/// A minimal valid POST /generate body.
pub fn generate_body(prompt: &str) -> serde_json::Value {
    serde_json::json!({
        "sketch": BASE64.encode(sample_png(32, 32)),
        "prompt": prompt,
    })
}

/// Submit a generation and return its job id.
pub async fn submit(app: &TestApp, body: serde_json::Value) -> String {
    let response = post_json(app, "/generate", body).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    body_json(response).await["data"]["job_id"]
        .as_str()
        .unwrap()
        .to_string()
}

/// Poll GET /status until the job is terminal; returns the status data.
pub async fn wait_terminal(app: &TestApp, job_id: &str) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let json = body_json(get(app, &format!("/status/{job_id}")).await).await;
        let state = json["data"]["state"].as_str().unwrap_or_default().to_string();
        if matches!(state.as_str(), "completed" | "failed" | "cancelled") {
            return json["data"].clone();
        }
        assert!(Instant::now() < deadline, "job {job_id} stuck in {state}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
