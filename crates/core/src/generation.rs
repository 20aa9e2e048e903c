//! Generation request and result model.
//!
//! A [`GenerationRequest`] is an immutable value built by the caller and
//! handed to the queue on submission. A [`GenerationResult`] is produced
//! either by a provider call or by the cache and recorded by the queue.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::failure::JobFailure;
use crate::scheduling::Priority;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Validation limits
// ---------------------------------------------------------------------------

/// Hard upper bound on prompt length, independent of any provider limit.
pub const MAX_PROMPT_CHARS: usize = 4000;

/// Largest sketch edge accepted from a caller.
pub const MAX_SKETCH_EDGE: u32 = 4096;

/// Upper bound on diffusion steps.
pub const MAX_STEPS: u32 = 150;

/// Upper bound on classifier-free guidance.
pub const MAX_GUIDANCE: f32 = 30.0;

// ---------------------------------------------------------------------------
// Image payloads
// ---------------------------------------------------------------------------

/// Encoded image formats understood by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
        }
    }

    /// MIME type used when streaming the image back to a client.
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }

    /// Parse a provider-supplied format name (`"jpg"` is accepted).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    fn from_codec(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Png => Some(ImageFormat::Png),
            image::ImageFormat::Jpeg => Some(ImageFormat::Jpeg),
            image::ImageFormat::WebP => Some(ImageFormat::Webp),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller's drawing, as encoded bytes plus header-derived metadata.
#[derive(Debug, Clone)]
pub struct SketchImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Palette colors used while drawing, as `#rrggbb` strings.
    pub palette: Vec<String>,
}

impl SketchImage {
    /// Build a sketch from encoded bytes, reading format and dimensions
    /// from the image header only.
    ///
    /// Fails with [`CoreError::InvalidInput`] for empty, unrecognized or
    /// corrupt headers, and for images larger than [`MAX_SKETCH_EDGE`].
    pub fn from_bytes(bytes: Vec<u8>, palette: Vec<String>) -> Result<Self, CoreError> {
        let (format, width, height) = probe_header(&bytes)?;
        if width > MAX_SKETCH_EDGE || height > MAX_SKETCH_EDGE {
            return Err(CoreError::InvalidInput(format!(
                "Sketch is {width}x{height}; the maximum edge is {MAX_SKETCH_EDGE}px"
            )));
        }
        Ok(Self {
            bytes,
            format,
            width,
            height,
            palette,
        })
    }
}

/// Read the format and dimensions of an encoded image without decoding
/// its pixel data.
pub fn probe_header(bytes: &[u8]) -> Result<(ImageFormat, u32, u32), CoreError> {
    if bytes.is_empty() {
        return Err(CoreError::InvalidInput("Sketch image is empty".to_string()));
    }

    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CoreError::InvalidInput(format!("Unreadable sketch image: {e}")))?;

    let format = reader
        .format()
        .and_then(ImageFormat::from_codec)
        .ok_or_else(|| {
            CoreError::InvalidInput("Sketch must be a PNG, JPEG or WebP image".to_string())
        })?;

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| CoreError::InvalidInput(format!("Corrupt sketch image: {e}")))?;

    if width == 0 || height == 0 {
        return Err(CoreError::InvalidInput(
            "Sketch image has a zero dimension".to_string(),
        ));
    }

    Ok((format, width, height))
}

/// An image produced by a provider. The bytes are never serialized into
/// JSON views; they are streamed separately.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedImage {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl GeneratedImage {
    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }
}

// ---------------------------------------------------------------------------
// Request parts
// ---------------------------------------------------------------------------

/// A named style that rewrites the prompt and nudges technical parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StylePreset {
    pub id: String,
    /// Text appended to the user's prompt.
    #[serde(default)]
    pub prompt_modifier: String,
    pub strength: Option<f32>,
    pub guidance: Option<f32>,
    pub negative_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A recognizable element of the sketch and where it sits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementHint {
    pub label: String,
    pub bounds: BoundingBox,
}

/// Analysis of the drawing's composition. Advisory only: it never changes
/// the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositionHints {
    #[serde(default)]
    pub dominant_colors: Vec<String>,
    #[serde(default)]
    pub elements: Vec<ElementHint>,
    #[serde(default)]
    pub complexity: Complexity,
}

/// Technical diffusion parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// How far the output may depart from the sketch (0 = copy, 1 = ignore).
    pub strength: f32,
    pub steps: u32,
    pub guidance: f32,
    pub seed: Option<u64>,
    /// Requested output width; defaults to the sketch width.
    pub width: Option<u32>,
    /// Requested output height; defaults to the sketch height.
    pub height: Option<u32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            strength: 0.75,
            steps: 30,
            guidance: 7.5,
            seed: None,
            width: None,
            height: None,
        }
    }
}

// ---------------------------------------------------------------------------
// GenerationRequest
// ---------------------------------------------------------------------------

/// Everything needed to turn a sketch into an image.
///
/// Constructed via [`GenerationRequest::new`] and refined with the `with_*`
/// builder methods.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: JobId,
    pub sketch: SketchImage,
    pub prompt: String,
    pub style: Option<StylePreset>,
    pub hints: CompositionHints,
    pub params: GenerationParams,
    /// Provider the caller asked for; the registry may fall back.
    pub provider_id: Option<String>,
    pub priority: Priority,
    /// Refuse providers whose declared cost exceeds this ceiling.
    pub max_cost: Option<f64>,
    pub created_at: Timestamp,
}

impl GenerationRequest {
    pub fn new(sketch: SketchImage, prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            sketch,
            prompt: prompt.into(),
            style: None,
            hints: CompositionHints::default(),
            params: GenerationParams::default(),
            provider_id: None,
            priority: Priority::Normal,
            max_cost: None,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_style(mut self, style: StylePreset) -> Self {
        self.style = Some(style);
        self
    }

    pub fn with_hints(mut self, hints: CompositionHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    /// Output size actually requested: explicit parameters win, otherwise
    /// the sketch dimensions.
    pub fn output_size(&self) -> (u32, u32) {
        (
            self.params.width.unwrap_or(self.sketch.width),
            self.params.height.unwrap_or(self.sketch.height),
        )
    }

    /// The prompt sent to a provider, including the style modifier.
    pub fn effective_prompt(&self) -> String {
        match &self.style {
            Some(style) if !style.prompt_modifier.trim().is_empty() => {
                format!("{}, {}", self.prompt.trim(), style.prompt_modifier.trim())
            }
            _ => self.prompt.trim().to_string(),
        }
    }

    /// Parameters after style overrides are applied.
    pub fn effective_params(&self) -> GenerationParams {
        let mut params = self.params.clone();
        if let Some(style) = &self.style {
            if let Some(strength) = style.strength {
                params.strength = strength;
            }
            if let Some(guidance) = style.guidance {
                params.guidance = guidance;
            }
        }
        let (width, height) = self.output_size();
        params.width = Some(width);
        params.height = Some(height);
        params
    }

    pub fn negative_prompt(&self) -> Option<&str> {
        self.style
            .as_ref()
            .and_then(|s| s.negative_prompt.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    /// Provider-independent request checks.
    ///
    /// Provider limits (prompt length, resolution) are enforced later by the
    /// invoker, against the provider actually selected.
    pub fn validate(&self) -> Result<(), CoreError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(CoreError::InvalidInput("Prompt must not be empty".to_string()));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(CoreError::InvalidInput(format!(
                "Prompt must not exceed {MAX_PROMPT_CHARS} characters"
            )));
        }

        let params = &self.params;
        if !(0.0..=1.0).contains(&params.strength) {
            return Err(CoreError::InvalidInput(
                "Strength must be between 0.0 and 1.0".to_string(),
            ));
        }
        if params.steps == 0 || params.steps > MAX_STEPS {
            return Err(CoreError::InvalidInput(format!(
                "Steps must be between 1 and {MAX_STEPS}"
            )));
        }
        if !(0.0..=MAX_GUIDANCE).contains(&params.guidance) {
            return Err(CoreError::InvalidInput(format!(
                "Guidance must be between 0 and {MAX_GUIDANCE}"
            )));
        }
        if matches!(params.width, Some(0)) || matches!(params.height, Some(0)) {
            return Err(CoreError::InvalidInput(
                "Output dimensions must be positive".to_string(),
            ));
        }
        if let Some(max_cost) = self.max_cost {
            if !max_cost.is_finite() || max_cost < 0.0 {
                return Err(CoreError::InvalidInput(
                    "Max cost must be a non-negative number".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GenerationResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
}

/// Canonical outcome of one generation job.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub request_id: JobId,
    pub status: ResultStatus,
    pub image: Option<GeneratedImage>,
    pub failure: Option<JobFailure>,
    pub provider_id: Option<String>,
    pub model: Option<String>,
    /// Parameters actually sent to the provider.
    pub parameters: Option<GenerationParams>,
    pub processing_time_ms: u64,
    pub cost: f64,
    pub cache_hit: bool,
    pub quality_score: Option<f32>,
    pub completed_at: Timestamp,
}

impl GenerationResult {
    /// A terminal failure record for a job.
    pub fn failed(request_id: JobId, provider_id: Option<String>, failure: JobFailure) -> Self {
        Self {
            request_id,
            status: ResultStatus::Failed,
            image: None,
            failure: Some(failure),
            provider_id,
            model: None,
            parameters: None,
            processing_time_ms: 0,
            cost: 0.0,
            cache_hit: false,
            quality_score: None,
            completed_at: chrono::Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ResultStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
