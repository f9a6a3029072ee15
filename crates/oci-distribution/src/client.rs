//! OCI distribution client
//!
//! The client speaks the blob and manifest halves of the distribution API:
//! existence probes, cross-repository mounts, monolithic uploads and raw
//! manifest transfer. Manifests are moved as bytes so that their digests
//! survive the round trip.

use crate::errors::*;
use crate::manifest::MANIFEST_MEDIA_TYPES;
use crate::secrets::RegistryAuth;
use crate::secrets::*;
use crate::sha256_digest;
use crate::Reference;

use crate::token_cache::{RegistryOperation, RegistryToken, RegistryTokenType, TokenCache};
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use hyperx::header::Header;
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode, Url};
use std::convert::TryFrom;
use tracing::{debug, trace, warn};
use www_authenticate::{Challenge, ChallengeFields, RawChallenge, WwwAuthenticate};

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// The OCI client connects to an OCI registry and moves manifests and blobs.
///
/// An OCI registry is a container registry that adheres to the OCI Distribution
/// specification. DockerHub is one example, as are ACR, GCR and Quay.
///
/// Most registries require at least an Oauth2 handshake. Call `auth()` with
/// the operation you are about to perform; the resulting token is cached per
/// repository and attached to every following request. A request that the
/// registry still refuses comes back as
/// [`OciDistributionError::Unauthorized`] so that the caller can drop its
/// credentials with `forget_registry()` and try again.
///
/// Cloning a client is cheap and clones share the token cache.
#[derive(Default, Clone)]
pub struct Client {
    config: ClientConfig,
    tokens: TokenCache,
    client: reqwest::Client,
}

/// A source that can provide a `ClientConfig`.
/// If you are using this crate in your own application, you can implement this
/// trait on your configuration type so that it can be passed to `Client::from_source`.
pub trait ClientConfigSource {
    /// Provides a `ClientConfig`.
    fn client_config(&self) -> ClientConfig;
}

impl TryFrom<ClientConfig> for Client {
    type Error = OciDistributionError;

    fn try_from(config: ClientConfig) -> Result<Self> {
        let mut client_builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certificates);

        client_builder = match () {
            #[cfg(feature = "native-tls")]
            () => client_builder.danger_accept_invalid_hostnames(config.accept_invalid_hostnames),
            #[cfg(not(feature = "native-tls"))]
            () => {
                warn!("Cannot change value of `accept_invalid_hostnames`: missing 'native-tls' feature");
                client_builder
            }
        };

        if let Some(timeout) = config.connect_timeout {
            client_builder = client_builder.connect_timeout(timeout);
        }

        for c in &config.extra_root_certificates {
            let cert = match c.encoding {
                CertificateEncoding::Der => reqwest::Certificate::from_der(c.data.as_slice())?,
                CertificateEncoding::Pem => reqwest::Certificate::from_pem(c.data.as_slice())?,
            };
            client_builder = client_builder.add_root_certificate(cert);
        }

        Ok(Self {
            config,
            tokens: TokenCache::new(),
            client: client_builder.build()?,
        })
    }
}

impl Client {
    /// Create a new client with the supplied config
    pub fn new(config: ClientConfig) -> Self {
        Client::try_from(config.clone()).unwrap_or_else(|err| {
            warn!("Cannot create OCI client from config: {:?}", err);
            warn!("Creating client with default configuration");
            Self {
                config,
                tokens: TokenCache::new(),
                client: reqwest::Client::new(),
            }
        })
    }

    /// Create a new client with the supplied config
    pub fn from_source(config_source: &impl ClientConfigSource) -> Self {
        Self::new(config_source.client_config())
    }

    /// Returns true if a live token for `operation` on `image`'s repository is cached.
    pub async fn is_authenticated(&self, image: &Reference, operation: RegistryOperation) -> bool {
        self.tokens.contains_key(image, operation).await
    }

    /// Drops every cached token for the registry that serves `image`.
    pub async fn forget_registry(&self, image: &Reference) {
        self.tokens.remove_registry(image.resolve_registry()).await
    }

    /// Perform an OAuth v2 auth request if necessary.
    ///
    /// This performs authorization and then stores the token internally to be used
    /// on other requests. `not_after` is the unix time at which `authentication`
    /// itself expires; tokens it obtains are not used past that point.
    pub async fn auth(
        &self,
        image: &Reference,
        authentication: &RegistryAuth,
        operation: RegistryOperation,
        not_after: Option<u64>,
    ) -> Result<()> {
        debug!("Authorizing for image: {:?}", image);
        // The version request will tell us where to go.
        let url = format!(
            "{}://{}/v2/",
            self.config.protocol.scheme_for(image.resolve_registry()),
            image.resolve_registry()
        );
        debug!(?url);
        let res = self.client.get(&url).send().await?;
        let dist_hdr = match res.headers().get(reqwest::header::WWW_AUTHENTICATE) {
            Some(h) => h,
            None => {
                self.tokens
                    .insert(image, operation, RegistryTokenType::Anonymous, not_after)
                    .await;
                return Ok(());
            }
        };

        let auth = WwwAuthenticate::parse_header(&dist_hdr.as_bytes().into())
            .map_err(|e| OciDistributionError::AuthenticationFailure(e.to_string()))?;
        // If challenge_opt is not set it means that no challenge was present, even though the header
        // was present.
        let challenge_opt = match auth.get::<BearerChallenge>() {
            Some(co) => co,
            None => {
                // Fall back to HTTP Basic Auth
                let token = match authentication {
                    RegistryAuth::Basic(username, password) => {
                        RegistryTokenType::Basic(username.to_string(), password.to_string())
                    }
                    RegistryAuth::Anonymous => RegistryTokenType::Anonymous,
                };
                self.tokens.insert(image, operation, token, not_after).await;
                return Ok(());
            }
        };

        // Allow for either push or pull authentication
        let scope = match operation {
            RegistryOperation::Pull => format!("repository:{}:pull", image.repository()),
            RegistryOperation::Push => format!("repository:{}:pull,push", image.repository()),
        };

        let challenge = &challenge_opt[0];
        let realm = challenge.realm.as_ref().ok_or_else(|| {
            OciDistributionError::AuthenticationFailure(format!(
                "bearer challenge from {} has no realm",
                url
            ))
        })?;
        let service = challenge.service.as_ref();
        let mut query = vec![("scope", &scope)];

        if let Some(s) = service {
            query.push(("service", s))
        }

        debug!(?realm, ?service, ?scope, "Making authentication call");

        let auth_res = self
            .client
            .get(realm)
            .query(&query)
            .apply_authentication(authentication)
            .send()
            .await?;

        match auth_res.status() {
            StatusCode::OK => {
                let text = auth_res.text().await?;
                trace!("Received response from auth request: {}", text);
                let token: RegistryToken = serde_json::from_str(&text).map_err(|e| {
                    OciDistributionError::AuthenticationFailure(format!(
                        "failed to decode registry token: {}",
                        e
                    ))
                })?;
                debug!("Successfully authorized for image '{:?}'", image);
                self.tokens
                    .insert(
                        image,
                        operation,
                        RegistryTokenType::Bearer(token),
                        not_after,
                    )
                    .await;
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(OciDistributionError::Unauthorized {
                    url: realm.to_string(),
                    status: auth_res.status().as_u16(),
                })
            }
            _ => {
                let reason = auth_res.text().await?;
                debug!("Failed to authenticate for image '{:?}': {}", image, reason);
                Err(OciDistributionError::AuthenticationFailure(reason))
            }
        }
    }

    /// Pull a manifest from the remote OCI Distribution service without decoding it.
    ///
    /// `accepted_media_types` defaults to every manifest type this crate
    /// knows when empty. Returns the exact body, its media type (with any
    /// parameters stripped) and its digest. The digest comes from the
    /// `Docker-Content-Digest` header, or is computed from the body when the
    /// registry does not send one.
    pub async fn pull_manifest_raw(
        &self,
        image: &Reference,
        accepted_media_types: &[&str],
    ) -> Result<(Bytes, String, String)> {
        let url = self.to_v2_manifest_url(image);
        debug!("Pulling image manifest from {}", url);
        let accept = if accepted_media_types.is_empty() {
            MANIFEST_MEDIA_TYPES
        } else {
            accepted_media_types
        };

        let res = RequestBuilderWrapper::from_client(self, |client| client.get(&url))
            .apply_accept(accept)
            .apply_auth(image, RegistryOperation::Pull)
            .await
            .into_request_builder()
            .send()
            .await?;

        if res.status() != StatusCode::OK {
            return Err(error_from_response(&url, res).await);
        }
        let headers = res.headers().clone();
        let media_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(strip_media_type_parameters)
            .unwrap_or_default();
        let body = res.bytes().await?;
        let digest = digest_header_value(&headers, Some(&body))?;
        trace!(%media_type, %digest, size = body.len(), "Pulled manifest");
        Ok((body, media_type, digest))
    }

    /// Stream a single blob from the registry.
    ///
    /// The bytes are not verified here; callers hash what they read.
    pub async fn pull_blob_stream(
        &self,
        image: &Reference,
        digest: &str,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let url = self.to_v2_blob_url(image.resolve_registry(), image.repository(), digest);
        debug!("Pulling blob from {}", url);
        let res = RequestBuilderWrapper::from_client(self, |client| client.get(&url))
            .apply_auth(image, RegistryOperation::Pull)
            .await
            .into_request_builder()
            .send()
            .await?;

        if res.status() != StatusCode::OK {
            return Err(error_from_response(&url, res).await);
        }
        Ok(res
            .bytes_stream()
            .map(|chunk| chunk.map_err(OciDistributionError::from))
            .boxed())
    }

    /// Ask whether the repository of `image` already holds the blob `digest`.
    pub async fn blob_exists(&self, image: &Reference, digest: &str) -> Result<bool> {
        let url = self.to_v2_blob_url(image.resolve_registry(), image.repository(), digest);
        let res = RequestBuilderWrapper::from_client(self, |client| client.head(&url))
            .apply_auth(image, RegistryOperation::Push)
            .await
            .into_request_builder()
            .send()
            .await?;
        trace!(%url, status = %res.status(), "Probed blob");
        match res.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_from_response(&url, res).await),
        }
    }

    /// Mount the blob `digest` from `source`'s repository into `image`'s.
    ///
    /// Both references must live on the same registry. Returns false when the
    /// registry declines the mount, in which case the blob has to be uploaded.
    pub async fn mount_blob(
        &self,
        image: &Reference,
        source: &Reference,
        digest: &str,
    ) -> Result<bool> {
        let base_url = self.to_v2_blob_upload_url(image);
        let url = Url::parse_with_params(
            &base_url,
            &[("mount", digest), ("from", source.repository())],
        )
        .map_err(|e| OciDistributionError::UrlParseError(e.to_string()))?;

        let res = RequestBuilderWrapper::from_client(self, |client| client.post(url.clone()))
            .apply_auth(image, RegistryOperation::Push)
            .await
            .into_request_builder()
            .header("Content-Length", 0)
            .send()
            .await?;

        match res.status() {
            StatusCode::CREATED => {
                debug!(%digest, from = %source.repository(), "Mounted blob");
                Ok(true)
            }
            StatusCode::ACCEPTED => {
                debug!(%digest, from = %source.repository(), "Registry declined mount");
                Ok(false)
            }
            _ => Err(error_from_response(url.as_str(), res).await),
        }
    }

    /// Upload a whole blob in one request.
    ///
    /// Returns the pullable URL of the blob.
    pub async fn push_blob(&self, image: &Reference, data: Bytes, digest: &str) -> Result<String> {
        if data.is_empty() && digest != sha256_digest(&[]) {
            return Err(OciDistributionError::PushNoDataError);
        }
        let location = self.begin_push_session(image).await?;
        let url = Url::parse_with_params(&location, &[("digest", digest)])
            .map_err(|e| OciDistributionError::UrlParseError(e.to_string()))?;

        let res = RequestBuilderWrapper::from_client(self, |client| client.put(url.clone()))
            .apply_auth(image, RegistryOperation::Push)
            .await
            .into_request_builder()
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", data.len())
            .body(data)
            .send()
            .await?;

        self.extract_location_header(image, res, StatusCode::CREATED)
            .await
    }

    /// Pushes a manifest body exactly as given.
    ///
    /// Returns the digest the registry assigned to it.
    pub async fn push_manifest_raw(
        &self,
        image: &Reference,
        body: Bytes,
        media_type: &str,
    ) -> Result<String> {
        let url = self.to_v2_manifest_url(image);
        debug!(%url, %media_type, "Pushing manifest");
        let computed = sha256_digest(&body);

        let res = RequestBuilderWrapper::from_client(self, |client| client.put(url.clone()))
            .apply_auth(image, RegistryOperation::Push)
            .await
            .into_request_builder()
            .header("Content-Type", media_type)
            .body(body)
            .send()
            .await?;

        if res.status() != StatusCode::CREATED {
            return Err(error_from_response(&url, res).await);
        }
        match res.headers().get(DOCKER_CONTENT_DIGEST) {
            Some(hv) => hv
                .to_str()
                .map(|s| s.to_string())
                .map_err(|e| OciDistributionError::ServerError {
                    code: StatusCode::CREATED.as_u16(),
                    url,
                    message: e.to_string(),
                }),
            None => Ok(computed),
        }
    }

    /// Begins a session to push a blob to the registry
    ///
    /// Returns URL with session UUID
    async fn begin_push_session(&self, image: &Reference) -> Result<String> {
        let url = &self.to_v2_blob_upload_url(image);
        let res = RequestBuilderWrapper::from_client(self, |client| client.post(url))
            .apply_auth(image, RegistryOperation::Push)
            .await
            .into_request_builder()
            .header("Content-Length", 0)
            .send()
            .await?;

        // OCI spec requires the status code be 202 Accepted to successfully begin the push process
        self.extract_location_header(image, res, StatusCode::ACCEPTED)
            .await
    }

    async fn extract_location_header(
        &self,
        image: &Reference,
        res: reqwest::Response,
        expected_status: StatusCode,
    ) -> Result<String> {
        if res.status() == expected_status {
            let location_header = res.headers().get("Location");
            match location_header {
                None => Err(OciDistributionError::RegistryNoLocationError),
                Some(lh) => self.location_header_to_url(image, lh),
            }
        } else {
            let url = res.url().to_string();
            Err(error_from_response(&url, res).await)
        }
    }

    /// Helper function to convert location header to URL
    ///
    /// Location may be absolute (containing the protocol and/or hostname), or relative (containing just the URL path)
    /// Returns a properly formatted absolute URL
    fn location_header_to_url(
        &self,
        image: &Reference,
        location_header: &reqwest::header::HeaderValue,
    ) -> Result<String> {
        let lh = location_header
            .to_str()
            .map_err(|e| OciDistributionError::UrlParseError(e.to_string()))?;
        if lh.starts_with("/v2/") {
            Ok(format!(
                "{}://{}{}",
                self.config.protocol.scheme_for(image.resolve_registry()),
                image.resolve_registry(),
                lh
            ))
        } else {
            Ok(lh.to_string())
        }
    }

    /// Convert a Reference to a v2 manifest URL.
    fn to_v2_manifest_url(&self, reference: &Reference) -> String {
        let target = reference
            .digest()
            .unwrap_or_else(|| reference.tag().unwrap_or("latest"));
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.config
                .protocol
                .scheme_for(reference.resolve_registry()),
            reference.resolve_registry(),
            reference.repository(),
            target,
        )
    }

    /// Convert a Reference to a v2 blob (layer) URL.
    fn to_v2_blob_url(&self, registry: &str, repository: &str, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            self.config.protocol.scheme_for(registry),
            registry,
            repository,
            digest,
        )
    }

    /// Convert a Reference to a v2 blob upload URL.
    fn to_v2_blob_upload_url(&self, reference: &Reference) -> String {
        self.to_v2_blob_url(
            reference.resolve_registry(),
            reference.repository(),
            "uploads/",
        )
    }
}

/// Turns a non-success response into the matching error.
///
/// The OCI spec technically does not allow any codes but 200, 500, 401, and 404.
/// Obviously, HTTP servers are going to send other codes. This tries to catch the
/// obvious ones (401/403, 404, 4XX, 5XX).
async fn error_from_response(url: &str, res: reqwest::Response) -> OciDistributionError {
    let status = res.status();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => OciDistributionError::Unauthorized {
            url: url.to_string(),
            status: status.as_u16(),
        },
        StatusCode::NOT_FOUND => OciDistributionError::NotFound(url.to_string()),
        s => {
            let text = match res.text().await {
                Ok(t) => t,
                Err(e) => return e.into(),
            };
            if s.is_client_error() {
                // According to the OCI spec, we should see an error in the message body.
                if let Ok(envelope) = serde_json::from_str::<OciEnvelope>(&text) {
                    return OciDistributionError::RegistryError {
                        envelope,
                        url: url.to_string(),
                    };
                }
            }
            OciDistributionError::ServerError {
                code: s.as_u16(),
                url: url.to_string(),
                message: text,
            }
        }
    }
}

/// The request builder wrapper allows to be instantiated from a
/// `Client` and allows composable operations on the request builder,
/// to produce a `RequestBuilder` object that can be executed.
struct RequestBuilderWrapper<'a> {
    client: &'a Client,
    request_builder: RequestBuilder,
}

// RequestBuilderWrapper type management
impl<'a> RequestBuilderWrapper<'a> {
    /// Create a `RequestBuilderWrapper` from a `Client` instance, by
    /// instantiating the internal `RequestBuilder` with the provided
    /// function `f`.
    fn from_client(
        client: &'a Client,
        f: impl Fn(&reqwest::Client) -> RequestBuilder,
    ) -> RequestBuilderWrapper<'a> {
        let request_builder = f(&client.client);
        RequestBuilderWrapper {
            client,
            request_builder,
        }
    }

    // Produces a final `RequestBuilder` out of this `RequestBuilderWrapper`
    fn into_request_builder(self) -> RequestBuilder {
        self.request_builder
    }
}

// Composable functions applicable to a `RequestBuilderWrapper`
impl<'a> RequestBuilderWrapper<'a> {
    fn apply_accept(self, accept: &[&str]) -> RequestBuilderWrapper<'a> {
        RequestBuilderWrapper {
            client: self.client,
            request_builder: self
                .request_builder
                .header("Accept", Vec::from(accept).join(", ")),
        }
    }

    /// Updates request as necessary for authentication.
    ///
    /// If a bearer token is cached for the repository, it goes in an
    /// Authorization header. If the registry asked for HTTP Basic Auth
    /// instead, those credentials are attached.
    async fn apply_auth(self, image: &Reference, op: RegistryOperation) -> RequestBuilderWrapper<'a> {
        let request_builder = match self.client.tokens.get(image, op).await {
            Some(RegistryTokenType::Bearer(token)) => {
                trace!("Using bearer token authentication.");
                self.request_builder
                    .header(reqwest::header::AUTHORIZATION, token.bearer_token())
            }
            Some(RegistryTokenType::Basic(username, password)) => {
                trace!("Using HTTP basic authentication.");
                self.request_builder.basic_auth(username, Some(password))
            }
            Some(RegistryTokenType::Anonymous) | None => self.request_builder,
        };
        RequestBuilderWrapper {
            client: self.client,
            request_builder,
        }
    }
}

/// The encoding of the certificate
#[derive(Debug, Clone)]
pub enum CertificateEncoding {
    #[allow(missing_docs)]
    Der,
    #[allow(missing_docs)]
    Pem,
}

/// A x509 certificate
#[derive(Debug, Clone)]
pub struct Certificate {
    /// Which encoding is used by the certificate
    pub encoding: CertificateEncoding,

    /// Actual certificate
    pub data: Vec<u8>,
}

/// A client configuration
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Which protocol the client should use
    pub protocol: ClientProtocol,

    /// Accept invalid hostname. Defaults to false
    pub accept_invalid_hostnames: bool,

    /// Accept invalid certificates. Defaults to false
    pub accept_invalid_certificates: bool,

    /// A list of extra root certificate to trust. This can be used to connect
    /// to servers using self-signed certificates
    pub extra_root_certificates: Vec<Certificate>,

    /// How long to wait for a TCP connection before giving up
    pub connect_timeout: Option<std::time::Duration>,
}

/// The protocol that the client should use to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientProtocol {
    #[allow(missing_docs)]
    Http,
    #[allow(missing_docs)]
    Https,
    #[allow(missing_docs)]
    HttpsExcept(Vec<String>),
}

impl Default for ClientProtocol {
    fn default() -> Self {
        ClientProtocol::Https
    }
}

impl ClientProtocol {
    fn scheme_for(&self, registry: &str) -> &str {
        match self {
            ClientProtocol::Https => "https",
            ClientProtocol::Http => "http",
            ClientProtocol::HttpsExcept(exceptions) => {
                if exceptions.iter().any(|e| e == registry) {
                    "http"
                } else {
                    "https"
                }
            }
        }
    }
}

#[derive(Clone)]
struct BearerChallenge {
    pub realm: Option<String>,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl Challenge for BearerChallenge {
    fn challenge_name() -> &'static str {
        "Bearer"
    }

    fn from_raw(raw: RawChallenge) -> Option<Self> {
        match raw {
            RawChallenge::Token68(_) => None,
            RawChallenge::Fields(mut map) => Some(BearerChallenge {
                realm: map.remove("realm"),
                scope: map.remove("scope"),
                service: map.remove("service"),
            }),
        }
    }

    fn into_raw(self) -> RawChallenge {
        let mut map = ChallengeFields::new();
        if let Some(realm) = self.realm {
            map.insert_static_quoting("realm", realm);
        }
        if let Some(scope) = self.scope {
            map.insert_static_quoting("scope", scope);
        }
        if let Some(service) = self.service {
            map.insert_static_quoting("service", service);
        }
        RawChallenge::Fields(map)
    }
}

fn strip_media_type_parameters(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Extract `Docker-Content-Digest` header from manifest GET or HEAD request.
/// Can optionally supply a response body (i.e. the manifest itself) to
/// fallback to manually hashing this content. This should only be done if the
/// response body contains the image manifest.
fn digest_header_value(headers: &HeaderMap, body: Option<&[u8]>) -> Result<String> {
    let digest_header = headers.get(DOCKER_CONTENT_DIGEST);
    match digest_header {
        None => {
            if let Some(body) = body {
                // Fallback to hashing payload (tested with ECR)
                let hex = sha256_digest(body);
                debug!(%hex, "Computed digest of manifest payload.");
                Ok(hex)
            } else {
                Err(OciDistributionError::ServerError {
                    code: StatusCode::OK.as_u16(),
                    url: String::new(),
                    message: "registry did not return a digest header".to_string(),
                })
            }
        }
        Some(hv) => hv
            .to_str()
            .map(|s| s.to_string())
            .map_err(|e| OciDistributionError::ServerError {
                code: StatusCode::OK.as_u16(),
                url: String::new(),
                message: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::TryFrom;

    const APP_IMAGE_NO_TAG: &str = "quay.io/org/app";
    const APP_IMAGE_TAG: &str = "quay.io/org/app:v1";
    const APP_IMAGE_DIGEST: &str = "quay.io/org/app@sha256:51d9b231d5129e3ffc267c9d455c49d789bf3167b611a07ab6e4b3304c96b0e7";
    const APP_IMAGE_TAG_AND_DIGEST: &str = "quay.io/org/app:v1@sha256:51d9b231d5129e3ffc267c9d455c49d789bf3167b611a07ab6e4b3304c96b0e7";
    const DOCKER_IO_IMAGE: &str = "docker.io/library/hello-world:latest";

    fn reference(s: &str) -> Reference {
        Reference::try_from(s).expect("failed to parse reference")
    }

    fn build(wrapper: RequestBuilderWrapper) -> reqwest::Request {
        wrapper
            .into_request_builder()
            .build()
            .expect("request builds")
    }

    #[test]
    fn test_apply_accept() {
        let client = Client::default();
        let request = build(
            RequestBuilderWrapper::from_client(&client, |client| {
                client.get("https://example.com/v2/")
            })
            .apply_accept(MANIFEST_MEDIA_TYPES),
        );
        assert_eq!(
            request.headers()["Accept"],
            MANIFEST_MEDIA_TYPES.join(", ").as_str()
        );
    }

    #[tokio::test]
    async fn test_apply_auth_no_token() {
        let client = Client::default();
        let request = build(
            RequestBuilderWrapper::from_client(&client, |client| {
                client.get("https://example.com/v2/")
            })
            .apply_auth(&reference(APP_IMAGE_TAG), RegistryOperation::Pull)
            .await,
        );
        assert!(!request.headers().contains_key("Authorization"));
    }

    #[tokio::test]
    async fn test_apply_auth_bearer_token() {
        let client = Client::default();
        client
            .tokens
            .insert(
                &reference(APP_IMAGE_TAG),
                RegistryOperation::Pull,
                RegistryTokenType::Bearer(RegistryToken::Token {
                    token: "opaque-token".to_string(),
                    expires_in: Some(300),
                }),
                None,
            )
            .await;
        let request = build(
            RequestBuilderWrapper::from_client(&client, |client| {
                client.get("https://example.com/v2/")
            })
            .apply_auth(&reference(APP_IMAGE_TAG), RegistryOperation::Pull)
            .await,
        );
        assert_eq!(request.headers()["Authorization"], "Bearer opaque-token");
    }

    #[tokio::test]
    async fn test_apply_auth_basic() {
        let client = Client::default();
        let image = reference(APP_IMAGE_TAG);
        client
            .tokens
            .insert(
                &image,
                RegistryOperation::Push,
                RegistryTokenType::Basic("user".to_string(), "pass".to_string()),
                None,
            )
            .await;
        let request = build(
            RequestBuilderWrapper::from_client(&client, |client| {
                client.get("https://example.com/v2/")
            })
            .apply_auth(&image, RegistryOperation::Push)
            .await,
        );
        // base64("user:pass")
        assert_eq!(request.headers()["Authorization"], "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn forget_registry_drops_tokens() {
        let client = Client::default();
        let image = reference(APP_IMAGE_TAG);
        client
            .tokens
            .insert(
                &image,
                RegistryOperation::Pull,
                RegistryTokenType::Anonymous,
                None,
            )
            .await;
        assert!(client.is_authenticated(&image, RegistryOperation::Pull).await);
        client.forget_registry(&image).await;
        assert!(!client.is_authenticated(&image, RegistryOperation::Pull).await);
    }

    #[test]
    fn test_to_v2_blob_url() {
        let image = reference(APP_IMAGE_TAG);
        let blob_url = Client::default().to_v2_blob_url(
            image.registry(),
            image.repository(),
            "sha256:deadbeef",
        );
        assert_eq!(
            blob_url,
            "https://quay.io/v2/org/app/blobs/sha256:deadbeef"
        )
    }

    #[test]
    fn test_to_v2_manifest() {
        let c = Client::default();

        for &(image, expected_uri) in [
            (APP_IMAGE_NO_TAG, "https://quay.io/v2/org/app/manifests/latest"),
            (APP_IMAGE_TAG, "https://quay.io/v2/org/app/manifests/v1"),
            (APP_IMAGE_DIGEST, "https://quay.io/v2/org/app/manifests/sha256:51d9b231d5129e3ffc267c9d455c49d789bf3167b611a07ab6e4b3304c96b0e7"),
            (APP_IMAGE_TAG_AND_DIGEST, "https://quay.io/v2/org/app/manifests/sha256:51d9b231d5129e3ffc267c9d455c49d789bf3167b611a07ab6e4b3304c96b0e7"),
            (DOCKER_IO_IMAGE, "https://index.docker.io/v2/library/hello-world/manifests/latest"),
            ].iter() {
                assert_eq!(c.to_v2_manifest_url(&reference(image)), expected_uri);
            }
    }

    #[test]
    fn test_to_v2_blob_upload_url() {
        let blob_url = Client::default().to_v2_blob_upload_url(&reference(APP_IMAGE_TAG));

        assert_eq!(
            blob_url,
            "https://quay.io/v2/org/app/blobs/uploads/"
        )
    }

    #[test]
    fn manifest_url_generation_respects_http_protocol() {
        let c = Client::new(ClientConfig {
            protocol: ClientProtocol::Http,
            ..Default::default()
        });
        assert_eq!(
            "http://quay.io/v2/hello/manifests/v1",
            c.to_v2_manifest_url(&reference("quay.io/hello:v1"))
        );
    }

    #[test]
    fn url_generation_honours_exception_list() {
        let insecure_registries = vec!["localhost:5000".to_owned(), "oci.registry.local".to_owned()];
        let c = Client::new(ClientConfig {
            protocol: ClientProtocol::HttpsExcept(insecure_registries),
            ..Default::default()
        });
        assert_eq!(
            "https://quay.io/v2/hello/manifests/v1",
            c.to_v2_manifest_url(&reference("quay.io/hello:v1"))
        );
        assert_eq!(
            "http://oci.registry.local/v2/hello/manifests/v1",
            c.to_v2_manifest_url(&reference("oci.registry.local/hello:v1"))
        );
        assert_eq!(
            "http://localhost:5000/v2/team/app/blobs/sha256:ff",
            c.to_v2_blob_url("localhost:5000", "team/app", "sha256:ff")
        );
    }

    #[test]
    fn relative_location_is_made_absolute() {
        let c = Client::default();
        let image = reference(APP_IMAGE_TAG);
        let relative = reqwest::header::HeaderValue::from_static("/v2/org/app/blobs/uploads/1234");
        assert_eq!(
            c.location_header_to_url(&image, &relative).expect("url"),
            "https://quay.io/v2/org/app/blobs/uploads/1234"
        );
        let absolute =
            reqwest::header::HeaderValue::from_static("https://storage.example/upload?id=1");
        assert_eq!(
            c.location_header_to_url(&image, &absolute).expect("url"),
            "https://storage.example/upload?id=1"
        );
    }

    #[test]
    fn digest_header_is_preferred_over_body_hash() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            digest_header_value(&headers, Some(b"hellobytes")).expect("digest"),
            "sha256:fdbd95aafcbc814a2600fcc54c1e1706f52d2f9bf45cf53254f25bcd7599ce99"
        );
        assert!(digest_header_value(&headers, None).is_err());

        headers.insert(
            DOCKER_CONTENT_DIGEST,
            reqwest::header::HeaderValue::from_static("sha256:abc"),
        );
        assert_eq!(
            digest_header_value(&headers, Some(b"hellobytes")).expect("digest"),
            "sha256:abc"
        );
    }

    #[test]
    fn media_type_parameters_are_stripped() {
        assert_eq!(
            strip_media_type_parameters("application/vnd.oci.image.manifest.v1+json; charset=utf-8"),
            "application/vnd.oci.image.manifest.v1+json"
        );
    }

    #[test]
    fn test_registry_token_deserialize() {
        // both 'token' and 'access_token' fields, 'token' field takes precedence
        let rt: RegistryToken =
            serde_json::from_str(r#"{"access_token": "xyz", "token": "abc"}"#).expect("token");
        assert_eq!(rt.token(), "abc");

        // numeric 'token' field, but string 'access_token' field does not result in parse error
        let rt: RegistryToken =
            serde_json::from_str(r#"{"access_token": "xyz", "token": 300}"#).expect("token");
        assert_eq!(rt.token(), "xyz");

        // non-string fields do not break parsing
        assert!(serde_json::from_str::<RegistryToken>(
            r#"{"aaa": 300, "access_token": "xyz", "token": "abc", "zzz": 600}"#
        )
        .is_ok());

        for bad in &[
            r#"{"token": 300}"#,
            r#"{"access_token": {"some": "thing"}}"#,
            r#"{"some": "thing"}"#,
            r#"{"token": "abc""#,
        ] {
            assert!(serde_json::from_str::<RegistryToken>(bad).is_err(), "{}", bad);
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_pull_manifest_public() {
        let c = Client::default();
        let image = reference(DOCKER_IO_IMAGE);
        c.auth(&image, &RegistryAuth::Anonymous, RegistryOperation::Pull, None)
            .await
            .expect("authenticated");
        let (body, media_type, digest) = c
            .pull_manifest_raw(&image, &[])
            .await
            .expect("pulled manifest");
        assert!(crate::manifest::is_manifest_list(&media_type));
        assert!(digest.starts_with("sha256:"));
        assert!(!body.is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_blob_exists_requires_auth() {
        let c = Client::default();
        let image = reference(DOCKER_IO_IMAGE);
        let err = c
            .blob_exists(&image, "sha256:ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff")
            .await
            .expect_err("anonymous HEAD is refused");
        assert!(err.is_unauthorized());
    }
}
