//! Configuration for a copy
//!
//! Build a [`Config`] with [`Config::new`] and set the fields you need, or turn
//! on the "cli" feature and use [`Config::new_from_flags`].

use std::path::PathBuf;
use std::sync::Arc;

use oci_distribution::client::{ClientConfig, ClientConfigSource, ClientProtocol};
use oci_distribution::manifest::Platform;
#[cfg(feature = "cli")]
use structopt::StructOpt;
use thiserror::Error;

use crate::compression::CompressionFormat;
use crate::copy::{CopyOptions, ImageListSelection};
use crate::credentials::{
    decode_authorization_token, CredentialProvider, CredentialProviderError, NoCredentials,
    StaticCredentials,
};
#[cfg(any(feature = "cli", feature = "docs"))]
use crate::manifest::parse_platform;
use crate::reference::{resolve, ImageReference, ParseError};

const DEFAULT_DAEMON_SOCKET: &str = "/var/run/docker.sock";
const DEFAULT_MAX_PARALLEL_BLOB_COPIES: usize = 6;

/// Problems with a [`Config`] that only show once it is used.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A locator did not parse
    #[error(transparent)]
    Locator(#[from] ParseError),
    /// Credentials were given for a destination that is not a registry
    #[error("credentials were given but {0} is not a registry")]
    NotARegistry(String),
    /// Only one way of passing credentials may be used
    #[error("{0}")]
    ConflictingCredentials(&'static str),
    /// The authorization token could not be decoded
    #[error(transparent)]
    Token(#[from] CredentialProviderError),
}

/// Everything needed to run one copy.
///
/// This can be filled in manually or, if you are exposing a CLI, with
/// [`Config::new_from_flags`] (this requires the "cli" feature to be enabled).
#[derive(Clone, Debug)]
pub struct Config {
    /// Locator of the image to read
    pub source: String,
    /// Locator to write the image to
    pub destination: String,
    /// Username for the destination registry
    pub username: Option<String>,
    /// Password for the destination registry
    pub password: Option<String>,
    /// A `base64(user:password)` token for the destination registry
    pub authorization_token: Option<String>,
    /// Registries to talk to over plain HTTP
    pub insecure_registries: Vec<String>,
    /// Accept any TLS certificate
    pub insecure_skip_tls_verify: bool,
    /// How many blobs may be in flight at once
    pub max_parallel_blob_copies: usize,
    /// Drop signatures instead of copying them
    pub remove_signatures: bool,
    /// Fail rather than change any manifest digest
    pub preserve_digests: bool,
    /// Recompress layers already compressed with another format
    pub force_compression_format: bool,
    /// Compression to use when compressing layers
    pub compression_format: Option<CompressionFormat>,
    /// Copy every image of a manifest list
    pub all_images: bool,
    /// Platform to pick out of a manifest list
    pub platform: Option<Platform>,
    /// Where the local daemon listens
    pub daemon_socket: PathBuf,
}

impl Config {
    /// A config copying `source` to `destination` with every other value
    /// defaulted.
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Config {
            source: source.into(),
            destination: destination.into(),
            username: None,
            password: None,
            authorization_token: None,
            insecure_registries: Vec::new(),
            insecure_skip_tls_verify: false,
            max_parallel_blob_copies: DEFAULT_MAX_PARALLEL_BLOB_COPIES,
            remove_signatures: false,
            preserve_digests: false,
            force_compression_format: false,
            compression_format: None,
            all_images: false,
            platform: None,
            daemon_socket: PathBuf::from(DEFAULT_DAEMON_SOCKET),
        }
    }

    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(version: &str) -> Self {
        let app = Opts::clap().version(version);
        Opts::from_clap(&app.get_matches()).into()
    }

    /// The options handed to the copy orchestrator.
    pub fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            remove_signatures: self.remove_signatures,
            preserve_digests: self.preserve_digests,
            force_compression_format: self.force_compression_format,
            compression_format: self.compression_format,
            max_parallel_blob_copies: self.max_parallel_blob_copies,
            image_list_selection: if self.all_images {
                ImageListSelection::CopyAllImages
            } else {
                ImageListSelection::CopySystemImage
            },
            platform: self.platform.clone(),
        }
    }

    /// Builds the credential provider for the destination registry.
    ///
    /// Credentials only ever go to the destination host; every other host is
    /// accessed anonymously.
    pub fn credential_provider(&self) -> Result<Arc<dyn CredentialProvider>, ConfigError> {
        if self.username.is_none()
            && self.password.is_none()
            && self.authorization_token.is_none()
        {
            return Ok(Arc::new(NoCredentials));
        }
        if self.authorization_token.is_some()
            && (self.username.is_some() || self.password.is_some())
        {
            return Err(ConfigError::ConflictingCredentials(
                "a username/password and an authorization token can not both be given",
            ));
        }

        let host = match resolve(&self.destination)? {
            ImageReference::Registry(r) => r.registry().to_owned(),
            other => return Err(ConfigError::NotARegistry(other.to_string())),
        };
        let (username, password) =
            match (&self.username, &self.password, &self.authorization_token) {
                (_, _, Some(token)) => decode_authorization_token(&host, token)?,
                (Some(username), Some(password), None) => (username.clone(), password.clone()),
                _ => {
                    return Err(ConfigError::ConflictingCredentials(
                        "a username needs a password and a password needs a username",
                    ))
                }
            };
        Ok(Arc::new(
            StaticCredentials::new().with(&host, &username, &password),
        ))
    }
}

impl ClientConfigSource for Config {
    fn client_config(&self) -> ClientConfig {
        let protocol = if self.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(self.insecure_registries.clone())
        };
        ClientConfig {
            protocol,
            accept_invalid_certificates: self.insecure_skip_tls_verify,
            ..Default::default()
        }
    }
}

/// CLI options that can be configured for a copy
///
/// These can be parsed from args using `Opts::from_args()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "imgcopy",
    about = "Copies container images between registries, directories, archives and the local daemon"
)]
pub struct Opts {
    #[structopt(help = "The image to copy, e.g. docker://quay.io/org/app:v1")]
    source: String,

    #[structopt(help = "Where to copy the image to, e.g. dir:/var/tmp/app")]
    destination: String,

    #[structopt(
        long = "username",
        env = "IMGCOPY_USERNAME",
        help = "Username for the destination registry"
    )]
    username: Option<String>,

    #[structopt(
        long = "password",
        env = "IMGCOPY_PASSWORD",
        hide_env_values = true,
        help = "Password for the destination registry"
    )]
    password: Option<String>,

    #[structopt(
        long = "authorization-token",
        env = "IMGCOPY_AUTHORIZATION_TOKEN",
        hide_env_values = true,
        help = "A base64 encoded user:password token for the destination registry, as issued by cloud registry token services"
    )]
    authorization_token: Option<String>,

    #[structopt(
        long = "insecure-registries",
        env = "IMGCOPY_INSECURE_REGISTRIES",
        use_delimiter = true,
        help = "Registries to access over plain HTTP, separated by ','"
    )]
    insecure_registries: Vec<String>,

    #[structopt(
        long = "insecure-skip-tls-verify",
        help = "Accept invalid TLS certificates"
    )]
    insecure_skip_tls_verify: bool,

    #[structopt(
        long = "max-parallel-blob-copies",
        default_value = "6",
        env = "IMGCOPY_MAX_PARALLEL_BLOB_COPIES",
        help = "How many blobs may be transferred at once"
    )]
    max_parallel_blob_copies: usize,

    #[structopt(long = "remove-signatures", help = "Do not copy signatures")]
    remove_signatures: bool,

    #[structopt(
        long = "preserve-digests",
        help = "Fail rather than change any manifest digest"
    )]
    preserve_digests: bool,

    #[structopt(
        long = "force-compression",
        help = "Recompress layers already compressed with another format"
    )]
    force_compression_format: bool,

    #[structopt(
        long = "compression-format",
        env = "IMGCOPY_COMPRESSION_FORMAT",
        help = "Compression to use for layers (gzip or zstd)"
    )]
    compression_format: Option<CompressionFormat>,

    #[structopt(
        short = "a",
        long = "all",
        help = "Copy every image of a manifest list, not only the one for this platform"
    )]
    all_images: bool,

    #[structopt(
        long = "platform",
        env = "IMGCOPY_PLATFORM",
        parse(try_from_str = parse_platform),
        help = "The os/arch[/variant] to pick out of a manifest list. Defaults to the platform of this machine"
    )]
    platform: Option<Platform>,

    #[structopt(
        long = "daemon-socket",
        env = "IMGCOPY_DAEMON_SOCKET",
        default_value = DEFAULT_DAEMON_SOCKET,
        help = "The unix socket the local Docker daemon listens on"
    )]
    daemon_socket: PathBuf,
}

#[cfg(any(feature = "cli", feature = "docs"))]
impl From<Opts> for Config {
    fn from(opts: Opts) -> Self {
        Config {
            source: opts.source,
            destination: opts.destination,
            username: opts.username,
            password: opts.password,
            authorization_token: opts.authorization_token,
            insecure_registries: opts.insecure_registries,
            insecure_skip_tls_verify: opts.insecure_skip_tls_verify,
            max_parallel_blob_copies: opts.max_parallel_blob_copies,
            remove_signatures: opts.remove_signatures,
            preserve_digests: opts.preserve_digests,
            force_compression_format: opts.force_compression_format,
            compression_format: opts.compression_format,
            all_images: opts.all_images,
            platform: opts.platform,
            daemon_socket: opts.daemon_socket,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode(s: &str) -> String {
        base64::encode(s)
    }

    #[test]
    fn defaults_map_to_copy_options() {
        let options = Config::new("docker://alpine", "dir:/tmp/alpine").copy_options();
        assert_eq!(options.max_parallel_blob_copies, 6);
        assert_eq!(
            options.image_list_selection,
            ImageListSelection::CopySystemImage
        );
        assert!(options.validate().is_ok());
    }

    #[test]
    fn all_images_selects_the_whole_list() {
        let mut config = Config::new("docker://alpine", "dir:/tmp/alpine");
        config.all_images = true;
        assert_eq!(
            config.copy_options().image_list_selection,
            ImageListSelection::CopyAllImages
        );
    }

    #[test]
    fn insecure_registries_use_plain_http() {
        let mut config = Config::new("docker://alpine", "dir:/tmp/alpine");
        assert_eq!(config.client_config().protocol, ClientProtocol::Https);
        config.insecure_registries = vec!["localhost:5000".to_owned()];
        config.insecure_skip_tls_verify = true;
        let client_config = config.client_config();
        assert_eq!(
            client_config.protocol,
            ClientProtocol::HttpsExcept(vec!["localhost:5000".to_owned()])
        );
        assert!(client_config.accept_invalid_certificates);
    }

    #[tokio::test]
    async fn token_is_decoded_for_the_destination_host_only() -> anyhow::Result<()> {
        let mut config = Config::new("docker://alpine", "docker://quay.io/org/app:v1");
        config.authorization_token = Some(encode("AWS:secret"));
        let provider = config.credential_provider()?;

        let creds = provider.get_token("quay.io").await?.expect("credentials");
        assert_eq!(creds.username, "AWS");
        assert_eq!(creds.password, "secret");
        assert!(provider.get_token("docker.io").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn username_and_password() -> anyhow::Result<()> {
        let mut config = Config::new("dir:/tmp/app", "docker://localhost:5000/app:v1");
        config.username = Some("me".to_owned());
        config.password = Some("hunter2".to_owned());
        let provider = config.credential_provider()?;
        let creds = provider
            .get_token("localhost:5000")
            .await?
            .expect("credentials");
        assert_eq!(creds.username, "me");
        Ok(())
    }

    #[test]
    fn credential_misuse_is_refused() {
        let mut config = Config::new("docker://alpine", "docker://quay.io/org/app:v1");
        config.username = Some("me".to_owned());
        assert!(matches!(
            config.credential_provider(),
            Err(ConfigError::ConflictingCredentials(_))
        ));

        config.password = Some("pw".to_owned());
        config.authorization_token = Some(encode("a:b"));
        assert!(matches!(
            config.credential_provider(),
            Err(ConfigError::ConflictingCredentials(_))
        ));

        let mut config = Config::new("docker://alpine", "dir:/tmp/alpine");
        config.authorization_token = Some(encode("a:b"));
        assert!(matches!(
            config.credential_provider(),
            Err(ConfigError::NotARegistry(_))
        ));
    }

    #[test]
    fn no_credentials_is_anonymous() {
        let config = Config::new("docker://alpine", "dir:/tmp/alpine");
        assert!(config.credential_provider().is_ok());
    }
}
