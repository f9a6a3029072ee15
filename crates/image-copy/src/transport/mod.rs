//! `transport` contains the readers and writers for every place an image can
//! live.
//!
//! Each transport kind has an [`ImageSource`] and an [`ImageDestination`]
//! implementation. [`TransportContext`] opens the right one for an
//! [`ImageReference`].
pub mod archive;
#[cfg(unix)]
pub mod daemon;
pub mod dir;
pub mod registry;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use oci_distribution::client::ClientConfigSource;
use oci_distribution::Client;
use tracing::{debug, instrument};

use crate::compression::LayerCompression;
use crate::credentials::CredentialBroker;
use crate::digest::Digest;
use crate::error::TransportError;
use crate::manifest::{Descriptor, RawManifest};
use crate::policy::Signature;
use crate::reference::ImageReference;

/// A stream of blob chunks.
pub type BlobStream = BoxStream<'static, Result<Bytes, TransportError>>;

const DEFAULT_DAEMON_SOCKET: &str = "/var/run/docker.sock";

/// Reads an image.
///
/// # Example
///  ```rust
/// use async_trait::async_trait;
/// use futures::StreamExt;
/// use image_copy::digest::Digest;
/// use image_copy::error::TransportError;
/// use image_copy::manifest::{Descriptor, RawManifest};
/// use image_copy::policy::Signature;
/// use image_copy::reference::ImageReference;
/// use image_copy::transport::{BlobStream, ImageSource};
/// use std::collections::HashMap;
///
/// struct InMemorySource {
///     reference: ImageReference,
///     manifest: RawManifest,
///     blobs: HashMap<String, bytes::Bytes>,
/// }
///
/// #[async_trait]
/// impl ImageSource for InMemorySource {
///     fn reference(&self) -> &ImageReference {
///         &self.reference
///     }
///
///     async fn get_manifest(&self, _instance: Option<&Digest>) -> Result<RawManifest, TransportError> {
///         Ok(self.manifest.clone())
///     }
///
///     async fn get_blob(&self, descriptor: &Descriptor) -> Result<BlobStream, TransportError> {
///         let data = self
///             .blobs
///             .get(&descriptor.digest)
///             .cloned()
///             .ok_or_else(|| TransportError::NotFound(descriptor.digest.clone()))?;
///         Ok(futures::stream::once(async move { Ok::<_, TransportError>(data) }).boxed())
///     }
///
///     async fn get_signatures(&self, _manifest: &Digest) -> Result<Vec<Signature>, TransportError> {
///         Ok(vec![])
///     }
/// }
/// ```
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// The reference this source reads.
    fn reference(&self) -> &ImageReference;

    /// The top level manifest, or the list instance with digest `instance`.
    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<RawManifest, TransportError>;

    /// The content of a blob. The bytes are not verified.
    async fn get_blob(&self, descriptor: &Descriptor) -> Result<BlobStream, TransportError>;

    /// Signatures stored for the manifest with digest `manifest`.
    async fn get_signatures(&self, manifest: &Digest) -> Result<Vec<Signature>, TransportError>;
}

/// Writes an image.
///
/// Nothing written is visible under the destination's name until
/// [`commit`](ImageDestination::commit) succeeds, for transports where that
/// distinction exists.
#[async_trait]
pub trait ImageDestination: Send + Sync {
    /// The reference this destination writes.
    fn reference(&self) -> &ImageReference;

    /// How this destination wants layers compressed.
    fn desired_layer_compression(&self) -> LayerCompression;

    /// Returns true if manifest lists can be stored.
    fn supports_manifest_lists(&self) -> bool;

    /// Returns true if signatures can be stored.
    fn supports_signatures(&self) -> bool;

    /// Returns true if the blob is already present.
    async fn blob_exists(&self, descriptor: &Descriptor) -> Result<bool, TransportError>;

    /// Makes a blob from `from` available without uploading it. Returns false
    /// when that is not possible.
    async fn try_mount_blob(
        &self,
        _descriptor: &Descriptor,
        _from: &ImageReference,
    ) -> Result<bool, TransportError> {
        Ok(false)
    }

    /// Stores a blob whose bytes have been verified against `descriptor`.
    async fn put_blob(&self, descriptor: &Descriptor, data: Bytes) -> Result<(), TransportError>;

    /// Stores a manifest, as a list instance when `instance` is given.
    /// Returns the digest it is stored under.
    async fn put_manifest(
        &self,
        manifest: &RawManifest,
        instance: Option<&Digest>,
    ) -> Result<Digest, TransportError>;

    /// Stores signatures for the manifest with digest `manifest`.
    async fn put_signatures(
        &self,
        manifest: &Digest,
        signatures: &[Signature],
    ) -> Result<(), TransportError>;

    /// Makes the written image visible.
    async fn commit(&self) -> Result<(), TransportError>;
}

/// Everything needed to open transports: credentials, registry client
/// settings and the daemon's socket.
#[derive(Clone)]
pub struct TransportContext {
    broker: Arc<CredentialBroker>,
    client: Client,
    daemon_socket: PathBuf,
}

impl TransportContext {
    /// A context with default registry settings.
    pub fn new(broker: Arc<CredentialBroker>) -> Self {
        TransportContext {
            broker,
            client: Client::default(),
            daemon_socket: PathBuf::from(DEFAULT_DAEMON_SOCKET),
        }
    }

    /// Uses the registry settings of `source`.
    pub fn with_client_config_source(mut self, source: &impl ClientConfigSource) -> Self {
        self.client = Client::from_source(source);
        self
    }

    /// Talks to the daemon on `socket`.
    pub fn with_daemon_socket(mut self, socket: impl Into<PathBuf>) -> Self {
        self.daemon_socket = socket.into();
        self
    }

    /// The credential broker.
    pub fn broker(&self) -> &Arc<CredentialBroker> {
        &self.broker
    }

    /// Opens a reader for `reference`.
    #[instrument(level = "info", skip(self))]
    pub async fn open_source(
        &self,
        reference: &ImageReference,
    ) -> Result<Box<dyn ImageSource>, TransportError> {
        debug!(transport = %reference.transport(), "opening source");
        let source: Box<dyn ImageSource> = match reference {
            ImageReference::Registry(r) => Box::new(registry::RegistrySource::new(
                self.client.clone(),
                self.broker.clone(),
                r.clone(),
            )),
            ImageReference::Directory(path) => Box::new(dir::DirSource::open(path).await?),
            ImageReference::Archive { path, reference: tag } => {
                Box::new(archive::ArchiveSource::open(path, tag.clone()).await?)
            }
            ImageReference::Daemon(name) => self.open_daemon_source(name).await?,
        };
        Ok(source)
    }

    /// Opens a writer for `reference`.
    #[instrument(level = "info", skip(self))]
    pub async fn open_destination(
        &self,
        reference: &ImageReference,
    ) -> Result<Box<dyn ImageDestination>, TransportError> {
        debug!(transport = %reference.transport(), "opening destination");
        let destination: Box<dyn ImageDestination> = match reference {
            ImageReference::Registry(r) => Box::new(registry::RegistryDestination::new(
                self.client.clone(),
                self.broker.clone(),
                r.clone(),
            )),
            ImageReference::Directory(path) => {
                Box::new(dir::DirDestination::create(path).await?)
            }
            ImageReference::Archive { path, reference: tag } => {
                Box::new(archive::ArchiveDestination::create(path, tag.clone())?)
            }
            ImageReference::Daemon(name) => self.open_daemon_destination(name)?,
        };
        Ok(destination)
    }

    #[cfg(unix)]
    async fn open_daemon_source(
        &self,
        name: &crate::reference::DaemonReference,
    ) -> Result<Box<dyn ImageSource>, TransportError> {
        Ok(Box::new(
            daemon::DaemonSource::open(&self.daemon_socket, name).await?,
        ))
    }

    #[cfg(not(unix))]
    async fn open_daemon_source(
        &self,
        _name: &crate::reference::DaemonReference,
    ) -> Result<Box<dyn ImageSource>, TransportError> {
        Err(TransportError::Unsupported(
            "the docker-daemon transport needs a unix socket".to_owned(),
        ))
    }

    #[cfg(unix)]
    fn open_daemon_destination(
        &self,
        name: &crate::reference::DaemonReference,
    ) -> Result<Box<dyn ImageDestination>, TransportError> {
        Ok(Box::new(daemon::DaemonDestination::create(
            &self.daemon_socket,
            name,
        )?))
    }

    #[cfg(not(unix))]
    fn open_daemon_destination(
        &self,
        _name: &crate::reference::DaemonReference,
    ) -> Result<Box<dyn ImageDestination>, TransportError> {
        Err(TransportError::Unsupported(
            "the docker-daemon transport needs a unix socket".to_owned(),
        ))
    }
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("broker", &self.broker)
            .field("daemon_socket", &self.daemon_socket)
            .finish()
    }
}
