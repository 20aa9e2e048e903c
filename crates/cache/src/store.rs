//! Fingerprint-addressed generation result store.
//!
//! All mutation happens under a single async mutex, so an entry is either
//! fully written or absent. Hit-count refreshes mutate entries in place and
//! never re-insert, which keeps an entry removed by eviction, expiry or
//! invalidation from coming back through a concurrent lookup.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::Serialize;
use sketchforge_core::generation::{
    GeneratedImage, GenerationParams, GenerationRequest, GenerationResult, ResultStatus,
};
use sketchforge_core::types::{JobId, Timestamp};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::CacheError;

/// Default number of entries kept before eviction starts.
const DEFAULT_CAPACITY: usize = 1000;

/// Default entry lifetime.
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default bound on waiting for the store.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    /// Lifetime of entries stored without an explicit TTL.
    pub default_ttl: Duration,
    /// Upper bound on any single store operation; exceeding it yields
    /// [`CacheError::Unavailable`].
    pub op_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            default_ttl: DEFAULT_TTL,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }
}

/// The parts of the originating request worth keeping next to a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSummary {
    pub prompt: String,
    pub style_id: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl From<&GenerationRequest> for RequestSummary {
    fn from(request: &GenerationRequest) -> Self {
        let (width, height) = request.output_size();
        Self {
            prompt: request.prompt.trim().to_string(),
            style_id: request.style.as_ref().map(|s| s.id.clone()),
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub image: GeneratedImage,
    pub summary: RequestSummary,
    pub provider_id: String,
    pub model: Option<String>,
    pub parameters: Option<GenerationParams>,
    pub quality_score: Option<f32>,
    pub hit_count: u64,
    pub created_at: Timestamp,
    pub last_accessed: Timestamp,
    pub expires_at: Timestamp,
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Render the entry as the result of job `request_id`.
    pub fn to_result(&self, request_id: JobId, processing_time: Duration) -> GenerationResult {
        GenerationResult {
            request_id,
            status: ResultStatus::Completed,
            image: Some(self.image.clone()),
            failure: None,
            provider_id: Some(self.provider_id.clone()),
            model: self.model.clone(),
            parameters: self.parameters.clone(),
            processing_time_ms: processing_time.as_millis() as u64,
            cost: 0.0,
            cache_hit: true,
            quality_score: self.quality_score,
            completed_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub hit_rate: f64,
    pub total_hits: u64,
    pub misses: u64,
    pub average_quality: Option<f64>,
}

#[derive(Default)]
struct CacheTable {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl CacheTable {
    fn purge_expired(&mut self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Evict the least recently used entry; ties go to the lowest hit count.
    fn evict_one(&mut self) -> Option<String> {
        let victim = self
            .entries
            .values()
            .min_by(|a, b| {
                a.last_accessed
                    .cmp(&b.last_accessed)
                    .then(a.hit_count.cmp(&b.hit_count))
            })
            .map(|entry| entry.fingerprint.clone())?;
        self.entries.remove(&victim);
        Some(victim)
    }
}

/// In-process generation cache.
///
/// Designed to be shared as `Arc<CacheStore>`.
pub struct CacheStore {
    table: Mutex<CacheTable>,
    config: CacheConfig,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            table: Mutex::new(CacheTable::default()),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a fingerprint.
    ///
    /// On a hit the entry's hit count and last-accessed time are refreshed.
    /// Expired entries count as a miss and are removed.
    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut table = self.acquire().await?;
        let now = chrono::Utc::now();

        let expired = match table.entries.get(fingerprint) {
            None => {
                table.misses += 1;
                return Ok(None);
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            table.entries.remove(fingerprint);
            table.misses += 1;
            tracing::debug!(fingerprint, "Cache entry expired");
            return Ok(None);
        }

        table.hits += 1;
        let entry = match table.entries.get_mut(fingerprint) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        entry.hit_count += 1;
        entry.last_accessed = now;
        Ok(Some(entry.clone()))
    }

    /// Store a completed result under `fingerprint`, replacing any previous
    /// entry. Evicts first when the store is full. `ttl` defaults to
    /// [`CacheConfig::default_ttl`].
    pub async fn put(
        &self,
        fingerprint: &str,
        summary: RequestSummary,
        result: &GenerationResult,
        ttl: Option<Duration>,
        tags: impl IntoIterator<Item = String>,
    ) -> Result<(), CacheError> {
        let image = match (&result.status, &result.image) {
            (ResultStatus::Completed, Some(image)) => image.clone(),
            _ => {
                return Err(CacheError::NotCacheable(
                    "only completed results with an image are cached".to_string(),
                ))
            }
        };
        let provider_id = result.provider_id.clone().unwrap_or_default();

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let now = chrono::Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);

        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            image,
            summary,
            provider_id,
            model: result.model.clone(),
            parameters: result.parameters.clone(),
            quality_score: result.quality_score,
            hit_count: 0,
            created_at: now,
            last_accessed: now,
            expires_at,
            tags: tags.into_iter().collect(),
        };

        let mut table = self.acquire().await?;
        if !table.entries.contains_key(fingerprint) && table.entries.len() >= self.config.capacity {
            table.purge_expired(now);
            while table.entries.len() >= self.config.capacity {
                match table.evict_one() {
                    Some(victim) => tracing::debug!(fingerprint = %victim, "Evicted cache entry"),
                    None => break,
                }
            }
        }
        if self.config.capacity > 0 {
            table.entries.insert(fingerprint.to_string(), entry);
        }
        Ok(())
    }

    /// Remove every entry carrying any of `tags`. Returns how many went.
    pub async fn invalidate(&self, tags: &[String]) -> Result<usize, CacheError> {
        if tags.is_empty() {
            return Ok(0);
        }
        let mut table = self.acquire().await?;
        let before = table.entries.len();
        table
            .entries
            .retain(|_, entry| !tags.iter().any(|tag| entry.tags.contains(tag)));
        let removed = before - table.entries.len();
        tracing::info!(removed, ?tags, "Invalidated cache entries");
        Ok(removed)
    }

    /// Remove every expired entry. Returns how many went.
    pub async fn sweep(&self) -> Result<usize, CacheError> {
        let mut table = self.acquire().await?;
        Ok(table.purge_expired(chrono::Utc::now()))
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let table = self.acquire().await?;

        let lookups = table.hits + table.misses;
        let hit_rate = if lookups > 0 {
            table.hits as f64 / lookups as f64
        } else {
            0.0
        };

        let scores: Vec<f64> = table
            .entries
            .values()
            .filter_map(|e| e.quality_score.map(f64::from))
            .collect();
        let average_quality = if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        };

        Ok(CacheStats {
            entry_count: table.entries.len(),
            hit_rate,
            total_hits: table.hits,
            misses: table.misses,
            average_quality,
        })
    }

    async fn acquire(&self) -> Result<MutexGuard<'_, CacheTable>, CacheError> {
        tokio::time::timeout(self.config.op_timeout, self.table.lock())
            .await
            .map_err(|_| {
                CacheError::Unavailable(format!(
                    "store busy for more than {} ms",
                    self.config.op_timeout.as_millis()
                ))
            })
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
