//! Credentials for registry hosts.
//!
//! A [`CredentialBroker`] caches [`AuthMaterial`] per host (and optionally per
//! repository) and asks a [`CredentialProvider`] for fresh material when an
//! entry is missing or about to expire. The broker belongs to whoever runs
//! the copy; it is never shared process wide and never written to disk.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oci_distribution::secrets::RegistryAuth;
use thiserror::Error;
use tracing::{debug, instrument};

/// Entries this close to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 30;

/// Failures of a [`CredentialProvider`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CredentialProviderError {
    /// The provider could not produce credentials.
    #[error("credential provider failed for {host}: {message}")]
    Failed {
        /// Host credentials were requested for
        host: String,
        /// Provider supplied detail
        message: String,
    },
    /// An authorization token could not be decoded.
    #[error("malformed authorization token for {host}: {reason}")]
    MalformedToken {
        /// Host the token was issued for
        host: String,
        /// What was wrong with it
        reason: String,
    },
}

/// The secret part of [`AuthMaterial`].
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    /// No credentials
    Anonymous,
    /// Username and password
    Basic {
        /// Username
        username: String,
        /// Password or token
        password: String,
    },
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Anonymous => f.write_str("Anonymous"),
            Secret::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Which requests a piece of [`AuthMaterial`] applies to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AuthScope {
    /// Every repository on a host
    Host(String),
    /// One repository on a host
    Repository {
        /// Registry host
        host: String,
        /// Repository path
        repository: String,
    },
}

impl AuthScope {
    /// The host this scope belongs to.
    pub fn host(&self) -> &str {
        match self {
            AuthScope::Host(host) => host,
            AuthScope::Repository { host, .. } => host,
        }
    }
}

/// Credentials with their scope and expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthMaterial {
    /// The credentials themselves
    pub secret: Secret,
    /// When the credentials stop working, if known
    pub expires_at: Option<DateTime<Utc>>,
    /// Requests the credentials apply to
    pub scope: AuthScope,
}

impl AuthMaterial {
    /// Anonymous access to a whole host.
    pub fn anonymous(host: &str) -> Self {
        AuthMaterial {
            secret: Secret::Anonymous,
            expires_at: None,
            scope: AuthScope::Host(host.to_owned()),
        }
    }

    /// Returns true if the material expires within the skew window.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at <= now + Duration::seconds(EXPIRY_SKEW_SECS),
            None => false,
        }
    }

    /// The credentials in the form the registry client takes.
    pub fn registry_auth(&self) -> RegistryAuth {
        match &self.secret {
            Secret::Anonymous => RegistryAuth::Anonymous,
            Secret::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
        }
    }

    /// Expiry as seconds since the epoch, for bounding derived tokens.
    pub fn not_after(&self) -> Option<u64> {
        self.expires_at.map(|at| at.timestamp().max(0) as u64)
    }
}

/// What a provider hands back for a host.
#[derive(Clone, PartialEq, Eq)]
pub struct ProvidedCredentials {
    /// Username
    pub username: String,
    /// Password or token
    pub password: String,
    /// When the credentials stop working, if known
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for ProvidedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvidedCredentials")
            .field("username", &self.username)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A source of credentials for registry hosts.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credentials for `host`, or `None` to access it anonymously.
    async fn get_token(
        &self,
        host: &str,
    ) -> Result<Option<ProvidedCredentials>, CredentialProviderError>;
}

/// Never supplies credentials.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn get_token(
        &self,
        _host: &str,
    ) -> Result<Option<ProvidedCredentials>, CredentialProviderError> {
        Ok(None)
    }
}

/// A fixed map of host to username and password.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, (String, String)>,
}

impl StaticCredentials {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds credentials for `host`.
    pub fn with(mut self, host: &str, username: &str, password: &str) -> Self {
        self.entries
            .insert(host.to_owned(), (username.to_owned(), password.to_owned()));
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_token(
        &self,
        host: &str,
    ) -> Result<Option<ProvidedCredentials>, CredentialProviderError> {
        Ok(self
            .entries
            .get(host)
            .map(|(username, password)| ProvidedCredentials {
                username: username.clone(),
                password: password.clone(),
                expires_at: None,
            }))
    }
}

/// An opaque `base64(user:password)` token and its expiry, as issued by
/// cloud registry token services.
#[derive(Clone)]
pub struct AuthorizationToken {
    /// The encoded token
    pub token: String,
    /// When the token stops working
    pub expires_at: Option<DateTime<Utc>>,
}

/// Something that can issue [`AuthorizationToken`]s.
#[async_trait]
pub trait AuthorizationTokenSource: Send + Sync {
    /// Issues a token for `host`.
    async fn authorization_token(
        &self,
        host: &str,
    ) -> Result<AuthorizationToken, CredentialProviderError>;
}

/// A token handed in up front, e.g. from the command line.
#[async_trait]
impl AuthorizationTokenSource for AuthorizationToken {
    async fn authorization_token(
        &self,
        _host: &str,
    ) -> Result<AuthorizationToken, CredentialProviderError> {
        Ok(self.clone())
    }
}

/// Turns an [`AuthorizationTokenSource`] into a [`CredentialProvider`].
pub struct AuthorizationTokenProvider<S> {
    source: S,
}

impl<S: AuthorizationTokenSource> AuthorizationTokenProvider<S> {
    /// Wraps `source`.
    pub fn new(source: S) -> Self {
        AuthorizationTokenProvider { source }
    }
}

#[async_trait]
impl<S: AuthorizationTokenSource> CredentialProvider for AuthorizationTokenProvider<S> {
    async fn get_token(
        &self,
        host: &str,
    ) -> Result<Option<ProvidedCredentials>, CredentialProviderError> {
        let issued = self.source.authorization_token(host).await?;
        let (username, password) = decode_authorization_token(host, &issued.token)?;
        Ok(Some(ProvidedCredentials {
            username,
            password,
            expires_at: issued.expires_at,
        }))
    }
}

/// Splits `base64(user:password)` at the first colon.
pub fn decode_authorization_token(
    host: &str,
    token: &str,
) -> Result<(String, String), CredentialProviderError> {
    let malformed = |reason: String| CredentialProviderError::MalformedToken {
        host: host.to_owned(),
        reason,
    };
    let decoded = base64::decode(token.trim()).map_err(|e| malformed(e.to_string()))?;
    let decoded = String::from_utf8(decoded).map_err(|e| malformed(e.to_string()))?;
    match decoded.split_once(':') {
        Some((user, password)) if !user.is_empty() => {
            Ok((user.to_owned(), password.to_owned()))
        }
        _ => Err(malformed("expected user:password".to_owned())),
    }
}

/// Caches credentials per host and repository.
pub struct CredentialBroker {
    provider: Arc<dyn CredentialProvider>,
    entries: Mutex<HashMap<AuthScope, AuthMaterial>>,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("CredentialBroker")
            .field("scopes", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CredentialBroker {
    /// A broker that asks `provider` on a cache miss.
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        CredentialBroker {
            provider,
            entries: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// A broker that only ever hands out anonymous access.
    pub fn anonymous() -> Self {
        Self::new(Arc::new(NoCredentials))
    }

    /// Credentials for `repository` on `host`.
    ///
    /// At most one provider call per host is in flight; concurrent callers
    /// wait for it and reuse its result.
    #[instrument(level = "debug", skip(self))]
    pub async fn credentials_for(
        &self,
        host: &str,
        repository: &str,
    ) -> Result<AuthMaterial, CredentialProviderError> {
        if let Some(found) = self.lookup(host, repository) {
            return Ok(found);
        }

        let slot = self.slot(host);
        let _guard = slot.lock().await;
        if let Some(found) = self.lookup(host, repository) {
            return Ok(found);
        }

        debug!(%host, "requesting credentials from provider");
        let material = match self.provider.get_token(host).await? {
            Some(provided) => AuthMaterial {
                secret: Secret::Basic {
                    username: provided.username,
                    password: provided.password,
                },
                expires_at: provided.expires_at,
                scope: AuthScope::Host(host.to_owned()),
            },
            None => AuthMaterial::anonymous(host),
        };
        self.entries()
            .insert(material.scope.clone(), material.clone());
        Ok(material)
    }

    /// Drops every entry for `host`, so the next request goes to the
    /// provider.
    pub fn invalidate(&self, host: &str) {
        debug!(%host, "invalidating cached credentials");
        self.entries().retain(|scope, _| scope.host() != host);
    }

    /// Pre-populates the cache.
    pub fn seed(&self, material: AuthMaterial) {
        self.entries().insert(material.scope.clone(), material);
    }

    fn lookup(&self, host: &str, repository: &str) -> Option<AuthMaterial> {
        let entries = self.entries();
        let by_repository = AuthScope::Repository {
            host: host.to_owned(),
            repository: repository.to_owned(),
        };
        [by_repository, AuthScope::Host(host.to_owned())]
            .iter()
            .filter_map(|scope| entries.get(scope))
            .find(|m| !m.is_expired())
            .cloned()
    }

    fn slot(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(host.to_owned()).or_default().clone()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<AuthScope, AuthMaterial>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        expires_at: Option<DateTime<Utc>>,
    }

    #[async_trait]
    impl CredentialProvider for Counting {
        async fn get_token(
            &self,
            _host: &str,
        ) -> Result<Option<ProvidedCredentials>, CredentialProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Some(ProvidedCredentials {
                username: "AWS".to_owned(),
                password: format!("token-{}", n),
                expires_at: self.expires_at,
            }))
        }
    }

    fn counting(expires_at: Option<DateTime<Utc>>) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            expires_at,
        })
    }

    #[tokio::test]
    async fn caches_per_host() -> anyhow::Result<()> {
        let provider = counting(None);
        let broker = CredentialBroker::new(provider.clone());
        let first = broker.credentials_for("ecr.example", "app").await?;
        let second = broker.credentials_for("ecr.example", "other").await?;
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn invalidate_forces_one_refetch() -> anyhow::Result<()> {
        let provider = counting(None);
        let broker = CredentialBroker::new(provider.clone());
        broker.credentials_for("ecr.example", "app").await?;
        broker.invalidate("ecr.example");
        let fresh = broker.credentials_for("ecr.example", "app").await?;
        broker.credentials_for("ecr.example", "app").await?;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(matches!(fresh.secret, Secret::Basic { ref password, .. } if password == "token-1"));
        Ok(())
    }

    #[tokio::test]
    async fn expiring_material_is_refetched() -> anyhow::Result<()> {
        let provider = counting(Some(Utc::now() + Duration::seconds(10)));
        let broker = CredentialBroker::new(provider.clone());
        broker.credentials_for("ecr.example", "app").await?;
        broker.credentials_for("ecr.example", "app").await?;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn repository_entry_wins() -> anyhow::Result<()> {
        let broker = CredentialBroker::new(counting(None));
        broker.seed(AuthMaterial {
            secret: Secret::Basic {
                username: "host".to_owned(),
                password: "h".to_owned(),
            },
            expires_at: None,
            scope: AuthScope::Host("quay.io".to_owned()),
        });
        broker.seed(AuthMaterial {
            secret: Secret::Basic {
                username: "repo".to_owned(),
                password: "r".to_owned(),
            },
            expires_at: None,
            scope: AuthScope::Repository {
                host: "quay.io".to_owned(),
                repository: "org/app".to_owned(),
            },
        });
        let app = broker.credentials_for("quay.io", "org/app").await?;
        let other = broker.credentials_for("quay.io", "org/other").await?;
        assert!(matches!(app.secret, Secret::Basic { ref username, .. } if username == "repo"));
        assert!(matches!(other.secret, Secret::Basic { ref username, .. } if username == "host"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_provider_call() -> anyhow::Result<()> {
        let provider = counting(None);
        let broker = Arc::new(CredentialBroker::new(provider.clone()));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move { broker.credentials_for("ecr.example", "app").await })
            })
            .collect();
        for task in tasks {
            task.await??;
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn authorization_tokens_are_decoded() -> anyhow::Result<()> {
        let provider = AuthorizationTokenProvider::new(AuthorizationToken {
            token: base64::encode("AWS:pass:with:colons"),
            expires_at: None,
        });
        let provided = provider
            .get_token("ecr.example")
            .await?
            .expect("credentials");
        assert_eq!(provided.username, "AWS");
        assert_eq!(provided.password, "pass:with:colons");
        Ok(())
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(matches!(
            decode_authorization_token("h", "not base64!"),
            Err(CredentialProviderError::MalformedToken { .. })
        ));
        assert!(decode_authorization_token("h", &base64::encode("nocolon")).is_err());
    }

    #[tokio::test]
    async fn anonymous_broker_hands_out_anonymous() -> anyhow::Result<()> {
        let broker = CredentialBroker::anonymous();
        let material = broker.credentials_for("docker.io", "library/alpine").await?;
        assert_eq!(material.registry_auth(), RegistryAuth::Anonymous);
        Ok(())
    }

    #[test]
    fn secrets_are_redacted() {
        let secret = Secret::Basic {
            username: "u".to_owned(),
            password: "hunter2".to_owned(),
        };
        assert!(!format!("{:?}", secret).contains("hunter2"));
    }
}
