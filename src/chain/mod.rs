//! Fallback chain runner (spec §4.F): iterates a job's stored chain
//! snapshot, applying within-entry retry and cross-entry fallback.

mod backoff;

pub use backoff::calculate_backoff;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::classifier::{self, LlmError, RawError};
use crate::config::ChainConfig;
use crate::dynamic_config::ModelDefaultsDoc;
use crate::jobs::model::{ChainEntry, ErrorCategory};
use crate::llm::{ExtractRequest, LlmExecutor, LlmExecutorError};
use crate::registry::ProviderRegistry;

/// Outcome of running the chain for one page/job (spec §4.F steps 4-6).
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub token_in: u64,
    pub token_out: u64,
    pub generation_id: Option<String>,
    pub error: Option<LlmError>,
    pub retry_count: u32,
}

pub struct ChainRunner {
    executor: Arc<LlmExecutor>,
    registry: Arc<ProviderRegistry>,
}

impl ChainRunner {
    pub fn new(executor: Arc<LlmExecutor>, registry: Arc<ProviderRegistry>) -> Self {
        Self { executor, registry }
    }

    /// Run the resolved chain snapshot against one page's content.
    ///
    /// `api_keys` resolves provider -> credential; a missing entry means
    /// the entry is skipped as if BYOK credentials the user lacks (spec §3
    /// supplemental, §4.F step 5).
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        chain: &[ChainEntry],
        prompt: &str,
        schema: &serde_json::Value,
        is_byok: bool,
        api_keys: &HashMap<String, String>,
        model_defaults: &ModelDefaultsDoc,
        chain_config: &ChainConfig,
        cancellation: &CancellationToken,
    ) -> ChainOutcome {
        if chain.is_empty() {
            return ChainOutcome {
                success: false,
                data: None,
                provider: None,
                model: None,
                token_in: 0,
                token_out: 0,
                generation_id: None,
                error: Some(LlmError {
                    category: ErrorCategory::NoModels,
                    retryable: false,
                    should_fallback: false,
                    suggest_upgrade: false,
                    user_message: "No models are available for this request.".to_string(),
                    raw_message: "chain snapshot was empty after filtering".to_string(),
                }),
                retry_count: 0,
            };
        }

        let mut unhealthy_providers: HashSet<String> = HashSet::new();
        let mut last_error: Option<LlmError> = None;
        let mut total_retries = 0u32;

        for entry in chain {
            if cancellation.is_cancelled() {
                return cancelled_outcome(total_retries);
            }

            if unhealthy_providers.contains(&entry.provider) {
                continue;
            }

            let Some(api_key) = api_keys.get(&entry.provider) else {
                continue;
            };

            let Some(provider_entry) = self.registry.get(&entry.provider) else {
                continue;
            };

            let capability = self.registry.capability(&entry.provider, &entry.model).unwrap_or_default();
            let defaults = model_defaults.resolve(&entry.provider, &entry.model);

            let request = ExtractRequest {
                prompt: prompt.to_string(),
                schema: schema.clone(),
                temperature: entry.temperature.unwrap_or(defaults.temperature),
                max_tokens: entry.max_tokens.unwrap_or(defaults.max_tokens),
                strict_mode: entry.strict_mode.unwrap_or(defaults.strict_mode),
                supports_structured_output: capability.supports_structured_output,
                timeout: Duration::from_secs(120),
            };

            let mut attempt = 0u32;
            loop {
                if cancellation.is_cancelled() {
                    return cancelled_outcome(total_retries);
                }

                let result = self.executor.execute(&provider_entry.api_config, api_key, &entry.model, &request).await;

                match result {
                    Ok(outcome) => {
                        return ChainOutcome {
                            success: true,
                            data: Some(outcome.data),
                            provider: Some(entry.provider.clone()),
                            model: Some(entry.model.clone()),
                            token_in: outcome.token_in,
                            token_out: outcome.token_out,
                            generation_id: outcome.generation_id,
                            error: None,
                            retry_count: total_retries,
                        };
                    }
                    Err(error) => {
                        let raw = executor_error_to_raw(&error, is_byok, entry.model.ends_with(":free"));
                        let classified = classifier::classify(&raw);

                        last_error = Some(classified.clone());

                        // Step 3: invalid_key skips the entry and marks the
                        // provider unhealthy for the rest of the job,
                        // overriding the table's fallback=no (spec §4.F).
                        if classified.category == ErrorCategory::InvalidKey {
                            unhealthy_providers.insert(entry.provider.clone());
                            break;
                        }

                        // Step 1: within-entry retry while retryable and
                        // attempts remain (covers rate_limit, whose table
                        // entry also sets should_fallback — S2 requires
                        // exhausting retries on the same entry first).
                        if classified.retryable && attempt + 1 < chain_config.max_retry_attempts {
                            let backoff = calculate_backoff(attempt, classified.category, chain_config);
                            tokio::time::sleep(backoff).await;
                            attempt += 1;
                            total_retries += 1;
                            continue;
                        }

                        // Step 2: retries exhausted or non-retryable;
                        // should_fallback=true advances to the next entry.
                        if classified.should_fallback {
                            break;
                        }

                        // should_fallback=false and no more retries
                        // (content_too_long, invalid_key already handled
                        // above): fatal for the whole chain.
                        return ChainOutcome {
                            success: false,
                            data: None,
                            provider: None,
                            model: None,
                            token_in: 0,
                            token_out: 0,
                            generation_id: None,
                            error: last_error,
                            retry_count: total_retries,
                        };
                    }
                }
            }
        }

        ChainOutcome {
            success: false,
            data: None,
            provider: None,
            model: None,
            token_in: 0,
            token_out: 0,
            generation_id: None,
            error: last_error,
            retry_count: total_retries,
        }
    }
}

fn cancelled_outcome(retry_count: u32) -> ChainOutcome {
    ChainOutcome {
        success: false,
        data: None,
        provider: None,
        model: None,
        token_in: 0,
        token_out: 0,
        generation_id: None,
        error: Some(LlmError {
            category: ErrorCategory::Cancelled,
            retryable: false,
            should_fallback: false,
            suggest_upgrade: false,
            user_message: "The job was cancelled.".to_string(),
            raw_message: "cancellation token was signalled".to_string(),
        }),
        retry_count,
    }
}

fn executor_error_to_raw(error: &LlmExecutorError, is_byok: bool, is_free_tier_model: bool) -> RawError {
    match error {
        LlmExecutorError::HttpStatus { status, body } => RawError { http_status: Some(*status), message: body.clone(), is_byok, is_free_tier_model },
        LlmExecutorError::Transport(e) => RawError { http_status: None, message: e.to_string(), is_byok, is_free_tier_model },
        LlmExecutorError::InvalidJson(message) => RawError { http_status: None, message: format!("response_format not supported: {message}"), is_byok, is_free_tier_model },
    }
}
