//! Backoff calculator (spec §4.F): `2s * 2^attempt`, capped at 30s; the
//! `rate_limit` category uses a variant starting at 5s. Hand-rolled rather
//! than pulled from a generic resilience crate — the shape is one
//! geometric-backoff formula, fixed by the spec (SPEC_FULL §0).

use std::time::Duration;

use crate::config::ChainConfig;
use crate::jobs::model::ErrorCategory;

pub fn calculate_backoff(attempt: u32, category: ErrorCategory, config: &ChainConfig) -> Duration {
    let base_secs = if category == ErrorCategory::RateLimit {
        config.rate_limit_base_backoff_secs
    } else {
        config.base_backoff_secs
    };

    let scaled = base_secs.saturating_mul(1u64 << attempt.min(32));
    Duration::from_secs(scaled.min(config.max_backoff_secs))
}
