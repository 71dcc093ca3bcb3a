//! Provider registry (spec §4.C): immutable-after-boot map of provider name
//! to API config, capability cache and status.
//!
//! Grounded on the teacher's tagged-variant provider dispatch (spec §9
//! "prefer a tagged-variant over inheritance") and its `RwLock`-guarded
//! capability-cache pattern in `config::models` generalized from a flat
//! struct to a keyed map.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Authentication scheme a provider's chat endpoint expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Bearer,
    HeaderKeyed,
    None,
}

/// Wire format the provider's chat completion expects/returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    OpenAi,
    Anthropic,
    Ollama,
}

/// Lifecycle status of a registered provider (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Beta,
    Decommissioned,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub chat_endpoint: String,
    pub auth_type: AuthType,
    #[serde(default)]
    pub custom_auth_header: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub allow_base_url_override: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PricingCapabilities {
    pub supports_pricing: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderEntry {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub required_features: Vec<String>,
    pub api_config: ApiConfig,
    pub pricing: PricingCapabilities,
    pub status: ProviderStatus,
}

/// Per (provider, model) capability, populated in bulk by the pricing loader
/// (spec §4.C: "pricing writes are single-directional").
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelCapability {
    pub supports_structured_output: bool,
    pub supports_strict_mode: bool,
    pub context_window: Option<u32>,
}

/// Immutable-after-boot provider map plus a mutable capability cache.
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderEntry>,
    capabilities: RwLock<HashMap<String, ModelCapability>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderEntry>) -> Self {
        let providers = providers.into_iter().map(|p| (p.name.clone(), p)).collect();
        Self { providers, capabilities: RwLock::new(HashMap::new()) }
    }

    /// Hard-coded fallback roster for boot, mirroring
    /// [`crate::config::TierDefaults::fallback`]'s role for tiers: enough to
    /// run end-to-end before an operator supplies their own provider list.
    pub fn bootstrap_default() -> Self {
        Self::new(vec![ProviderEntry {
            name: "openrouter".to_string(),
            display_name: "OpenRouter".to_string(),
            required_features: vec![],
            api_config: ApiConfig {
                base_url: "https://openrouter.ai/api/v1".to_string(),
                chat_endpoint: "/chat/completions".to_string(),
                auth_type: AuthType::Bearer,
                custom_auth_header: None,
                extra_headers: HashMap::new(),
                response_format: ResponseFormat::OpenAi,
                allow_base_url_override: false,
            },
            pricing: PricingCapabilities { supports_pricing: true },
            status: ProviderStatus::Active,
        }])
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderEntry> {
        self.providers.get(provider)
    }

    /// Providers eligible for a fresh chain resolution — decommissioned
    /// providers stay registered so old chain snapshots still resolve, but
    /// are excluded here (spec §4.C).
    pub fn list_for_user(&self) -> Vec<&ProviderEntry> {
        self.providers.values().filter(|p| p.status != ProviderStatus::Decommissioned).collect()
    }

    fn capability_key(provider: &str, model: &str) -> String {
        format!("{provider}/{model}")
    }

    pub fn capability(&self, provider: &str, model: &str) -> Option<ModelCapability> {
        let key = Self::capability_key(provider, model);
        self.capabilities.read().unwrap().get(&key).cloned()
    }

    /// Bulk-replace capabilities, taking the write lock once (spec §4.C /
    /// §5 "bulk writes take the write lock once").
    pub fn set_capabilities(&self, entries: HashMap<String, ModelCapability>) {
        let mut guard = self.capabilities.write().unwrap();
        *guard = entries;
    }

    pub fn set_capability(&self, provider: &str, model: &str, capability: ModelCapability) {
        let key = Self::capability_key(provider, model);
        self.capabilities.write().unwrap().insert(key, capability);
    }
}
