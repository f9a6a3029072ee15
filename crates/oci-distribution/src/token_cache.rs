use crate::reference::Reference;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::debug;

/// Lifetime assumed for bearer tokens whose response carries no `expires_in`.
const DEFAULT_TOKEN_EXPIRATION_SECS: u64 = 60;

/// A token granted during the OAuth2-like workflow for OCI registries.
#[derive(Deserialize, Clone)]
#[serde(untagged)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RegistryToken {
    Token {
        token: String,
        #[serde(default)]
        expires_in: Option<u64>,
    },
    AccessToken {
        access_token: String,
        #[serde(default)]
        expires_in: Option<u64>,
    },
}

#[derive(Clone)]
pub(crate) enum RegistryTokenType {
    Bearer(RegistryToken),
    Basic(String, String),
    /// The registry did not ask for credentials.
    Anonymous,
}

impl RegistryToken {
    pub fn bearer_token(&self) -> String {
        format!("Bearer {}", self.token())
    }

    pub fn token(&self) -> &str {
        match self {
            RegistryToken::Token { token, .. } => token,
            RegistryToken::AccessToken { access_token, .. } => access_token,
        }
    }

    fn expires_in(&self) -> u64 {
        match self {
            RegistryToken::Token { expires_in, .. }
            | RegistryToken::AccessToken { expires_in, .. } => {
                expires_in.unwrap_or(DEFAULT_TOKEN_EXPIRATION_SECS)
            }
        }
    }
}

/// Desired operation for registry authentication
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegistryOperation {
    /// Authenticate for push operations
    Push,
    /// Authenticate for pull operations
    Pull,
}

pub(crate) fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

type CacheKey = (String, String, RegistryOperation);

#[derive(Default, Clone)]
pub(crate) struct TokenCache {
    // (registry, repository, scope) -> (token, expiration)
    tokens: Arc<RwLock<BTreeMap<CacheKey, (RegistryTokenType, u64)>>>,
}

impl TokenCache {
    pub(crate) fn new() -> Self {
        TokenCache::default()
    }

    /// Stores `token`. It stops being served at the earlier of its own expiry
    /// and `not_after`, the expiry of the credential that obtained it.
    pub(crate) async fn insert(
        &self,
        reference: &Reference,
        op: RegistryOperation,
        token: RegistryTokenType,
        not_after: Option<u64>,
    ) {
        let own = match token {
            RegistryTokenType::Basic(_, _) | RegistryTokenType::Anonymous => u64::MAX,
            RegistryTokenType::Bearer(ref t) => now_epoch_secs().saturating_add(t.expires_in()),
        };
        let expiration = not_after.map_or(own, |limit| own.min(limit));
        let registry = reference.resolve_registry().to_string();
        let repository = reference.repository().to_string();
        debug!(%registry, %repository, ?op, %expiration, "Inserting token");
        self.tokens
            .write()
            .await
            .insert((registry, repository, op), (token, expiration));
    }

    pub(crate) async fn get(
        &self,
        reference: &Reference,
        op: RegistryOperation,
    ) -> Option<RegistryTokenType> {
        let registry = reference.resolve_registry().to_string();
        let repository = reference.repository().to_string();
        let tokens = self.tokens.read().await;
        match tokens.get(&(registry.clone(), repository.clone(), op)) {
            Some((token, expiration)) => {
                if now_epoch_secs() > *expiration {
                    debug!(%registry, %repository, ?op, %expiration, miss=false, expired=true, "Fetching token");
                    None
                } else {
                    debug!(%registry, %repository, ?op, %expiration, miss=false, expired=false, "Fetching token");
                    Some(token.clone())
                }
            }
            None => {
                debug!(%registry, %repository, ?op, miss=true, "Fetching token");
                None
            }
        }
    }

    pub(crate) async fn contains_key(&self, reference: &Reference, op: RegistryOperation) -> bool {
        self.get(reference, op).await.is_some()
    }

    /// Drops every token held for `registry`, whichever repository it was scoped to.
    pub(crate) async fn remove_registry(&self, registry: &str) {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|(r, _, _), _| r != registry);
        debug!(%registry, dropped = before - tokens.len(), "Forgetting tokens");
    }
}
