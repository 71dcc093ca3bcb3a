//! Concrete dynamic config document shapes (spec §4.B) and the glob matcher
//! used by the API-key loader's endpoint/referrer/URL-pattern restrictions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `config/blocklist.json` — IP allow-check middleware feed.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BlocklistDoc {
    #[serde(default)]
    pub blocked_ips: Vec<String>,
    #[serde(default)]
    pub blocked_cidrs: Vec<String>,
}

/// `config/logfilters.json` — dynamic per-record log filter rules.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogFiltersDoc {
    #[serde(default)]
    pub suppressed_fields: Vec<String>,
    #[serde(default)]
    pub min_level_by_target: HashMap<String, String>,
}

/// `config/model_defaults.json` — per-(provider, model) generation defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelDefault {
    pub temperature: f32,
    pub max_tokens: u32,
    pub strict_mode: bool,
}

impl Default for ModelDefault {
    fn default() -> Self {
        Self { temperature: 0.2, max_tokens: 4096, strict_mode: false }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelDefaultsDoc {
    /// Keyed by "provider/model".
    #[serde(default)]
    pub per_model: HashMap<String, ModelDefault>,
    /// Keyed by provider.
    #[serde(default)]
    pub per_provider: HashMap<String, ModelDefault>,
}

impl ModelDefaultsDoc {
    /// chain-entry override > per-model override > provider default >
    /// hard fallback (spec §4.B).
    pub fn resolve(&self, provider: &str, model: &str) -> ModelDefault {
        let key = format!("{provider}/{model}");
        if let Some(found) = self.per_model.get(&key) {
            return found.clone();
        }
        if let Some(found) = self.per_provider.get(provider) {
            return found.clone();
        }
        ModelDefault::default()
    }
}

/// `config/tier_settings.json` — overrides for the hard-coded tier table.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TierSettingsDoc {
    #[serde(default)]
    pub tiers: HashMap<String, crate::config::TierLimits>,
}

/// `config/api-keys.json` — synthetic API key identities.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyntheticApiKey {
    pub client_id: String,
    pub secret_hash: String,
    pub tier: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,
    #[serde(default)]
    pub allowed_referrers: Vec<String>,
    #[serde(default)]
    pub allowed_url_patterns: Vec<String>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub pinned_models: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApiKeyConfigDoc {
    #[serde(default)]
    pub keys: Vec<SyntheticApiKey>,
}

impl ApiKeyConfigDoc {
    pub fn find(&self, client_id: &str) -> Option<&SyntheticApiKey> {
        self.keys.iter().find(|k| k.client_id == client_id)
    }
}

/// `config/pricing.json` — USD per 1M tokens, input/output.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PricingDoc {
    #[serde(default)]
    pub per_model: HashMap<String, ModelPricing>,
    #[serde(default)]
    pub per_provider: HashMap<String, ModelPricing>,
    /// Substring-matched fallback heuristics, checked in order.
    #[serde(default)]
    pub pattern_fallbacks: Vec<(String, ModelPricing)>,
}

impl PricingDoc {
    pub fn resolve(&self, provider: &str, model: &str) -> Option<ModelPricing> {
        let key = format!("{provider}/{model}");
        if let Some(found) = self.per_model.get(&key) {
            return Some(*found);
        }
        if let Some(found) = self.per_provider.get(provider) {
            return Some(*found);
        }
        self.pattern_fallbacks
            .iter()
            .find(|(pattern, _)| model.contains(pattern.as_str()))
            .map(|(_, pricing)| *pricing)
    }
}

/// `config/provider_models.json` — models listed per provider.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProviderModelsDoc {
    #[serde(default)]
    pub models_by_provider: HashMap<String, Vec<String>>,
}

/// Glob match supporting `*` at the start, end, or a single interior
/// position (spec §4.B) — not a dependency, since the shape is fixed and
/// finite.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    match pattern.find('*') {
        None => pattern == candidate,
        Some(star_pos) => {
            if pattern.matches('*').count() > 1 {
                return glob_match_multi(pattern, candidate);
            }
            let prefix = &pattern[..star_pos];
            let suffix = &pattern[star_pos + 1..];
            candidate.len() >= prefix.len() + suffix.len()
                && candidate.starts_with(prefix)
                && candidate.ends_with(suffix)
        }
    }
}

/// Fallback for patterns with more than one `*`, handled by splitting on
/// every wildcard and requiring the fragments to appear in order.
fn glob_match_multi(pattern: &str, candidate: &str) -> bool {
    let mut rest = candidate;
    let parts: Vec<&str> = pattern.split('*').collect();

    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}
