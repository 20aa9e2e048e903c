/// Errors from the cache layer.
///
/// The queue treats every variant as a cache miss and proceeds to
/// generation; none of them fail a job.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The store did not answer within its operation timeout.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// The result cannot be cached (e.g. it carries no image).
    #[error("Result not cacheable: {0}")]
    NotCacheable(String),
}
