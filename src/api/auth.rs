//! Identity resolution (spec §1 "JWT verification... treated as an external
//! `verify(token) -> {user_id, tier, features}` call"): this module owns only
//! the trait seam and a concrete resolver over this crate's own identity
//! sources (persisted API keys, synthetic dynamic-config keys). No JWT/JWKS
//! logic lives here or anywhere in this crate — an operator wires in a real
//! identity-provider-backed `Authenticator` at the edge.
//!
//! Grounded on the webhook dispatcher's local hex/HMAC primitives, reused
//! here for key hashing so the store never holds a secret in the clear.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::dynamic_config::DynamicConfigRegistry;
use crate::store::partitions::encode_api_key_key;
use crate::store::FjallStore;

/// Identity-source-agnostic principal (spec §3 supplemental): both a
/// persisted `ApiKey` and a synthetic dynamic-config key resolve to this same
/// shape, so the rest of the core never branches on where a caller came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub tier: String,
    pub features: Vec<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, bearer: &str) -> Option<Identity>;
}

fn hex_encode(bytes: impl AsRef<[u8]>) -> String {
    use std::fmt::Write;
    bytes.as_ref().iter().fold(String::with_capacity(bytes.as_ref().len() * 2), |mut acc, byte| {
        let _ = write!(acc, "{byte:02x}");
        acc
    })
}

fn hash_secret(secret: &str) -> String {
    hex_encode(Sha256::digest(secret.as_bytes()))
}

/// Resolves bearer tokens against this crate's own two identity sources.
/// Persisted keys are the default path (`POST /api-keys`-issued); synthetic
/// keys (`client_id.secret`) come from the `api-keys.json` dynamic config
/// document and exist for callers an operator provisions out-of-band.
pub struct StoreAuthenticator {
    store: FjallStore,
    dynamic_config: Arc<DynamicConfigRegistry>,
}

impl StoreAuthenticator {
    pub fn new(store: FjallStore, dynamic_config: Arc<DynamicConfigRegistry>) -> Self {
        Self { store, dynamic_config }
    }

    fn verify_persisted(&self, bearer: &str) -> Option<Identity> {
        let key_hash = hash_secret(bearer);
        let key = self.store.get_json::<crate::jobs::model::ApiKey>(&self.store.api_keys, &encode_api_key_key(&key_hash)).ok().flatten()?;
        if !key.is_active(Utc::now()) {
            return None;
        }
        Some(Identity { user_id: key.user_id, tier: key.tier, features: key.scopes })
    }

    async fn verify_synthetic(&self, bearer: &str) -> Option<Identity> {
        let (client_id, secret) = bearer.split_once('.')?;
        let doc = self.dynamic_config.api_keys.current().await;
        let entry = doc.find(client_id)?;

        let got = hash_secret(secret);
        if !bool::from(got.as_bytes().ct_eq(entry.secret_hash.as_bytes())) {
            return None;
        }

        Some(Identity { user_id: format!("synthetic:{client_id}"), tier: entry.tier.clone(), features: entry.features.clone() })
    }
}

#[async_trait]
impl Authenticator for StoreAuthenticator {
    async fn verify(&self, bearer: &str) -> Option<Identity> {
        if let Some(identity) = self.verify_persisted(bearer) {
            return Some(identity);
        }
        self.verify_synthetic(bearer).await
    }
}
