//! Content addressing for generation requests.
//!
//! A fingerprint is a SHA-256 hex digest over a canonical JSON rendering of
//! the request fields that influence the generated image. Request id,
//! priority, cost ceiling, composition hints and timestamps are left out so
//! that repeated creative requests share one cache entry.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::CoreError;
use crate::generation::{probe_header, GenerationParams, GenerationRequest};

/// Canonical form of the output-relevant request fields.
///
/// Field order is fixed by the struct definition, so serialization is
/// stable across processes.
#[derive(Serialize)]
struct CanonicalRequest<'a> {
    sketch_sha256: String,
    prompt: String,
    style: Option<CanonicalStyle<'a>>,
    params: &'a GenerationParams,
    output: (u32, u32),
    provider_id: Option<&'a str>,
}

#[derive(Serialize)]
struct CanonicalStyle<'a> {
    id: &'a str,
    prompt_modifier: String,
    strength: Option<f32>,
    guidance: Option<f32>,
    negative_prompt: Option<String>,
}

/// Compute the SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Hash of the sketch content. Fails for bytes that are not a readable image.
pub fn sketch_digest(bytes: &[u8]) -> Result<String, CoreError> {
    probe_header(bytes)?;
    Ok(sha256_hex(bytes))
}

/// Derive the fingerprint of a request.
pub fn fingerprint(request: &GenerationRequest) -> Result<String, CoreError> {
    let canonical = CanonicalRequest {
        sketch_sha256: sketch_digest(&request.sketch.bytes)?,
        prompt: normalize_text(&request.prompt),
        style: request.style.as_ref().map(|style| CanonicalStyle {
            id: &style.id,
            prompt_modifier: normalize_text(&style.prompt_modifier),
            strength: style.strength,
            guidance: style.guidance,
            negative_prompt: style.negative_prompt.as_deref().map(normalize_text),
        }),
        params: &request.params,
        output: request.output_size(),
        provider_id: request.provider_id.as_deref(),
    };

    let encoded = serde_json::to_vec(&canonical)
        .map_err(|e| CoreError::Internal(format!("Fingerprint serialization failed: {e}")))?;
    Ok(sha256_hex(&encoded))
}

/// Trim and collapse internal whitespace runs to a single space.
fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::generation::tests::{sample_png, sample_request};
    use crate::generation::{GenerationParams, SketchImage, StylePreset};
    use crate::scheduling::Priority;

    #[test]
    fn empty_input_produces_known_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn ignores_id_priority_cost_and_timestamp() {
        let a = sample_request("a red barn");
        let mut b = a
            .clone()
            .with_id(uuid::Uuid::new_v4())
            .with_priority(Priority::High)
            .with_max_cost(0.5);
        b.created_at = a.created_at + chrono::Duration::hours(3);

        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn identical_requests_from_different_builders_match() {
        let a = sample_request("a red barn");
        let b = sample_request("a red barn");
        assert_ne!(a.id, b.id);
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn whitespace_differences_are_normalized() {
        let a = sample_request("a red barn");
        let b = sample_request("  a   red\tbarn ");
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn prompt_changes_fingerprint() {
        let a = sample_request("a red barn");
        let b = sample_request("a blue barn");
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn params_style_and_provider_change_fingerprint() {
        let base = sample_request("a red barn");
        let fp = fingerprint(&base).unwrap();

        let seeded = base.clone().with_params(GenerationParams {
            seed: Some(42),
            ..Default::default()
        });
        assert_ne!(fingerprint(&seeded).unwrap(), fp);

        let styled = base.clone().with_style(StylePreset {
            id: "ink".into(),
            prompt_modifier: "ink drawing".into(),
            strength: None,
            guidance: None,
            negative_prompt: None,
        });
        assert_ne!(fingerprint(&styled).unwrap(), fp);

        let routed = base.with_provider("local-sd");
        assert_ne!(fingerprint(&routed).unwrap(), fp);
    }

    #[test]
    fn sketch_content_changes_fingerprint() {
        let a = sample_request("a red barn");
        let sketch = SketchImage::from_bytes(sample_png(9, 6), Vec::new()).unwrap();
        let b = crate::generation::GenerationRequest::new(sketch, "a red barn");
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn corrupt_sketch_is_invalid_input() {
        let mut req = sample_request("a red barn");
        req.sketch.bytes = vec![0x89, b'P', b'N', b'G', 0, 0];
        assert_matches!(fingerprint(&req), Err(CoreError::InvalidInput(_)));
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint(&sample_request("a red barn")).unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
