//! Error classifier (spec §4.D): maps a raw provider error into an
//! `ErrorCategory` plus retry/fallback verdict. Classification never fails,
//! so (per SPEC_FULL §0) there is no `ClassifierError` — this module only
//! produces values.

use crate::jobs::model::ErrorCategory;

/// Raw inputs the chain runner has on hand when an executor attempt fails.
#[derive(Debug, Clone)]
pub struct RawError {
    pub http_status: Option<u16>,
    pub message: String,
    pub is_byok: bool,
    pub is_free_tier_model: bool,
}

/// Classified outcome of one executor attempt (spec §4.D).
#[derive(Debug, Clone, PartialEq)]
pub struct LlmError {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub should_fallback: bool,
    pub suggest_upgrade: bool,
    pub user_message: String,
    pub raw_message: String,
}

/// Apply the decision table in spec §4.D to one raw error.
pub fn classify(error: &RawError) -> LlmError {
    let lower = error.message.to_lowercase();

    let (category, retryable, should_fallback) = match error.http_status {
        Some(429) => (ErrorCategory::RateLimit, true, true),
        Some(402) => (ErrorCategory::QuotaExceeded, false, true),
        Some(401) => (ErrorCategory::InvalidKey, false, false),
        Some(502) | Some(503) | Some(504) => (ErrorCategory::ProviderError, true, true),
        _ if lower.contains("response_format not supported") => (ErrorCategory::ModelUnsupported, false, true),
        _ if lower.contains("context length") => (ErrorCategory::ContentTooLong, false, false),
        _ if lower.contains("timeout") || lower.contains("deadline exceeded") => (ErrorCategory::Timeout, true, true),
        _ => (ErrorCategory::Unknown, false, true),
    };

    let suggest_upgrade = !error.is_byok && matches!(category, ErrorCategory::RateLimit | ErrorCategory::QuotaExceeded);

    let user_message = user_facing_message(category, error);

    LlmError {
        category,
        retryable,
        should_fallback,
        suggest_upgrade,
        user_message,
        raw_message: error.message.clone(),
    }
}

/// Free-tier users see sanitized, upgrade-nudging copy; BYOK users see the
/// raw diagnostic text (spec §4.D, §7).
fn user_facing_message(category: ErrorCategory, error: &RawError) -> String {
    if error.is_byok {
        return error.message.clone();
    }

    if error.is_free_tier_model {
        return match category {
            ErrorCategory::RateLimit => "This model is temporarily rate-limited. Try again shortly or upgrade your plan.".to_string(),
            ErrorCategory::QuotaExceeded => "You've used your free quota for this model. Upgrade your plan or bring your own API key.".to_string(),
            _ => generic_message(category),
        };
    }

    generic_message(category)
}

fn generic_message(category: ErrorCategory) -> String {
    match category {
        ErrorCategory::RateLimit => "The provider is rate-limiting requests. Retrying automatically.".to_string(),
        ErrorCategory::QuotaExceeded => "The provider's quota has been exhausted for this key.".to_string(),
        ErrorCategory::InvalidKey => "The configured API key was rejected by the provider.".to_string(),
        ErrorCategory::ModelUnsupported => "The selected model does not support structured output.".to_string(),
        ErrorCategory::ContentTooLong => "The page content exceeds this model's context length.".to_string(),
        ErrorCategory::Timeout => "The provider did not respond in time.".to_string(),
        ErrorCategory::ProviderError => "The provider returned a temporary error.".to_string(),
        _ => "An unexpected error occurred while extracting this page.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(status: Option<u16>, message: &str) -> RawError {
        RawError { http_status: status, message: message.into(), is_byok: false, is_free_tier_model: false }
    }

    #[test]
    fn test_rate_limit_is_retryable_and_falls_back() {
        let result = classify(&err(Some(429), "too many requests"));
        assert_eq!(result.category, ErrorCategory::RateLimit);
        assert!(result.retryable);
        assert!(result.should_fallback);
    }

    #[test]
    fn test_invalid_key_does_not_fallback() {
        let result = classify(&err(Some(401), "unauthorized"));
        assert_eq!(result.category, ErrorCategory::InvalidKey);
        assert!(!result.retryable);
        assert!(!result.should_fallback);
    }

    #[test]
    fn test_quota_exceeded_falls_back_without_retry() {
        let result = classify(&err(Some(402), "payment required"));
        assert_eq!(result.category, ErrorCategory::QuotaExceeded);
        assert!(!result.retryable);
        assert!(result.should_fallback);
    }

    #[test]
    fn test_provider_error_status_codes() {
        for status in [502, 503, 504] {
            let result = classify(&err(Some(status), "bad gateway"));
            assert_eq!(result.category, ErrorCategory::ProviderError);
            assert!(result.retryable);
            assert!(result.should_fallback);
        }
    }

    #[test]
    fn test_response_format_pattern_match() {
        let result = classify(&err(Some(400), "response_format not supported for this model"));
        assert_eq!(result.category, ErrorCategory::ModelUnsupported);
        assert!(!result.retryable);
        assert!(result.should_fallback);
    }

    #[test]
    fn test_context_length_does_not_fallback() {
        let result = classify(&err(Some(400), "maximum context length exceeded"));
        assert_eq!(result.category, ErrorCategory::ContentTooLong);
        assert!(!result.retryable);
        assert!(!result.should_fallback);
    }

    #[test]
    fn test_timeout_pattern_match() {
        let result = classify(&err(None, "request timeout"));
        assert_eq!(result.category, ErrorCategory::Timeout);
        assert!(result.retryable);
        assert!(result.should_fallback);
    }

    #[test]
    fn test_unclassified_falls_back_without_retry() {
        let result = classify(&err(Some(500), "something strange happened"));
        assert_eq!(result.category, ErrorCategory::Unknown);
        assert!(!result.retryable);
        assert!(result.should_fallback);
    }

    #[test]
    fn test_byok_users_see_raw_message() {
        let mut error = err(Some(401), "invalid api key: sk-xxx");
        error.is_byok = true;
        let result = classify(&error);
        assert_eq!(result.user_message, "invalid api key: sk-xxx");
    }

    #[test]
    fn test_free_tier_model_gets_upgrade_nudge() {
        let mut error = err(Some(429), "rate limited");
        error.is_free_tier_model = true;
        let result = classify(&error);
        assert!(result.suggest_upgrade);
        assert!(result.user_message.contains("upgrade"));
    }
}
