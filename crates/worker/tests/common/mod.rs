#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sketchforge_cache::{CacheConfig, CacheStore};
use sketchforge_core::generation::{GeneratedImage, GenerationRequest, ImageFormat, SketchImage};
use sketchforge_core::scheduling::{JobState, RetryPolicy};
use sketchforge_core::types::JobId;
use sketchforge_events::ProgressBroadcaster;
use sketchforge_providers::descriptor::LocalProvider;
use sketchforge_providers::{
    BackendError, BackendOutput, BackendRequest, Capabilities, GenerationBackend,
    ProviderConfig, ProviderRegistry, RateLimits,
};
use sketchforge_worker::{JobStatusView, QueueConfig, QueueManager};
use tokio_util::sync::CancellationToken;

/// Encode a blank PNG of the given size.
pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([255, 255, 255, 255]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

pub fn request(prompt: &str) -> GenerationRequest {
    let sketch = SketchImage::from_bytes(sample_png(64, 64), Vec::new()).expect("valid sketch");
    GenerationRequest::new(sketch, prompt)
}

/// Same generation inputs under a fresh job id.
pub fn resubmit(request: &GenerationRequest) -> GenerationRequest {
    request.clone().with_id(uuid::Uuid::now_v7())
}

/// A local provider with generous limits.
pub fn local_provider(id: &str) -> ProviderConfig {
    ProviderConfig::Local(LocalProvider {
        id: id.to_string(),
        name: format!("Test {id}"),
        api_url: "http://localhost:7860".to_string(),
        model: "test-model".to_string(),
        capabilities: Capabilities {
            max_width: 2048,
            max_height: 2048,
            supported_formats: vec![ImageFormat::Png],
            max_prompt_length: 1000,
            image_to_image: true,
        },
        rate_limits: RateLimits {
            per_minute: 1000,
            per_hour: 10_000,
            concurrent: 16,
        },
        timeout_secs: 30,
    })
}

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

/// Backend that replays scripted failures in order, then succeeds (or keeps
/// failing with `always` when set). Records every call.
pub struct MockBackend {
    script: Mutex<VecDeque<BackendError>>,
    always: Mutex<Option<fn() -> BackendError>>,
    delay: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    started: Mutex<Vec<Instant>>,
}

impl MockBackend {
    pub fn succeeding() -> Arc<Self> {
        Self::build(Vec::new(), None, Duration::ZERO)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::build(Vec::new(), None, delay)
    }

    pub fn scripted(failures: Vec<BackendError>) -> Arc<Self> {
        Self::build(failures, None, Duration::ZERO)
    }

    pub fn always(failure: fn() -> BackendError) -> Arc<Self> {
        Self::build(Vec::new(), Some(failure), Duration::ZERO)
    }

    fn build(
        failures: Vec<BackendError>,
        always: Option<fn() -> BackendError>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(failures.into()),
            always: Mutex::new(always),
            delay,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Gaps between the starts of consecutive calls.
    pub fn gaps(&self) -> Vec<Duration> {
        let started = self.started.lock().unwrap();
        started.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    async fn generate(&self, request: &BackendRequest) -> Result<BackendOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.started.lock().unwrap().push(Instant::now());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(failure) = self.script.lock().unwrap().pop_front() {
            return Err(failure);
        }
        if let Some(make) = *self.always.lock().unwrap() {
            return Err(make());
        }

        Ok(BackendOutput {
            image: GeneratedImage {
                bytes: sample_png(8, 8),
                format: ImageFormat::Png,
                width: 8,
                height: 8,
            },
            model: Some("test-model".to_string()),
            quality_score: Some(0.8),
        })
    }

    async fn probe(&self) -> bool {
        true
    }
}

/// Registry holding only `local`, backed by `backend`.
pub fn single_provider(backend: Arc<MockBackend>) -> Arc<ProviderRegistry> {
    let registry = Arc::new(ProviderRegistry::default());
    registry
        .register(local_provider("local"), backend)
        .expect("register provider");
    registry
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub queue: QueueManager,
    pub registry: Arc<ProviderRegistry>,
    pub cache: Arc<CacheStore>,
    pub events: Arc<ProgressBroadcaster>,
    pub cancel: CancellationToken,
}

impl Harness {
    /// Queue with one local provider `local` backed by `backend`. Workers
    /// are not started.
    pub fn new(config: QueueConfig, backend: Arc<MockBackend>) -> Self {
        Self::with_registry(config, single_provider(backend))
    }

    pub fn with_registry(config: QueueConfig, registry: Arc<ProviderRegistry>) -> Self {
        Self::with_cache(config, registry, CacheConfig::default())
    }

    pub fn with_cache(
        config: QueueConfig,
        registry: Arc<ProviderRegistry>,
        cache_config: CacheConfig,
    ) -> Self {
        let cache = Arc::new(CacheStore::new(cache_config));
        let events = Arc::new(ProgressBroadcaster::default());
        let queue = QueueManager::new(
            config,
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&events),
        );
        Self {
            queue,
            registry,
            cache,
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn start(&self) {
        self.queue.start(self.cancel.clone());
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait_terminal(&self, id: JobId) -> JobStatusView {
        self.wait_for(id, |s| s.state.is_terminal()).await
    }

    pub async fn wait_for(&self, id: JobId, done: impl Fn(&JobStatusView) -> bool) -> JobStatusView {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = self.queue.status(id).expect("job exists");
            if done(&status) {
                return status;
            }
            assert!(
                Instant::now() < deadline,
                "job {id} stuck in {:?}",
                status.state
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Config with fast retries and the given pool size.
pub fn fast_config(workers: usize) -> QueueConfig {
    QueueConfig {
        max_concurrent_jobs: workers,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        },
        maintenance_interval: Duration::from_secs(60),
        ..QueueConfig::default()
    }
}

pub fn is_state(state: JobState) -> impl Fn(&JobStatusView) -> bool {
    move |s| s.state == state
}
