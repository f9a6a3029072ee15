//! Images laid out in a local directory, addressed as `dir:/path`.
//!
//! ```text
//! version                    transport version marker
//! manifest.json              top level manifest
//! <hex>.manifest.json        list instances
//! <hex>                      blobs
//! signature-<n>              signatures of the top level manifest
//! <hex>.signature-<n>        signatures of list instances
//! ```
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use super::{BlobStream, ImageDestination, ImageSource};
use crate::compression::LayerCompression;
use crate::digest::Digest;
use crate::error::TransportError;
use crate::manifest::{descriptor_digest, Descriptor, RawManifest};
use crate::policy::Signature;
use crate::reference::ImageReference;

const VERSION_FILE: &str = "version";
const VERSION: &str = "Directory Transport Version: 1.1\n";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureEnvelope {
    payload: String,
    signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_id: Option<String>,
}

fn blob_path(root: &Path, digest: &Digest) -> PathBuf {
    root.join(digest.hex())
}

fn manifest_path(root: &Path, instance: Option<&Digest>) -> PathBuf {
    match instance {
        Some(d) => root.join(format!("{}.manifest.json", d.hex())),
        None => root.join(MANIFEST_FILE),
    }
}

fn signature_path(root: &Path, instance: Option<&Digest>, index: usize) -> PathBuf {
    match instance {
        Some(d) => root.join(format!("{}.signature-{}", d.hex(), index + 1)),
        None => root.join(format!("signature-{}", index + 1)),
    }
}

fn invalid_digest(descriptor: &Descriptor) -> impl FnOnce(crate::digest::DigestError) -> TransportError + '_ {
    move |e| TransportError::Invalid(format!("{}: {}", descriptor.digest, e))
}

async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, TransportError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes `data` to `path` through a temporary file in the same directory,
/// so readers never see a partial file.
pub(crate) async fn write_atomic(path: PathBuf, data: Bytes) -> Result<(), TransportError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
    Ok(())
}

/// Reads an image from a directory.
pub struct DirSource {
    root: PathBuf,
    reference: ImageReference,
}

impl DirSource {
    /// Opens the image stored under `root`.
    pub async fn open(root: &Path) -> Result<Self, TransportError> {
        if tokio::fs::metadata(root).await.is_err() {
            return Err(TransportError::NotFound(root.display().to_string()));
        }
        if read_if_exists(&root.join(VERSION_FILE)).await?.is_none() {
            return Err(TransportError::Invalid(format!(
                "{} has no {} file",
                root.display(),
                VERSION_FILE
            )));
        }
        Ok(DirSource {
            root: root.to_owned(),
            reference: ImageReference::Directory(root.to_owned()),
        })
    }

    async fn top_level_digest(&self) -> Result<Option<Digest>, TransportError> {
        Ok(read_if_exists(&manifest_path(&self.root, None))
            .await?
            .map(|m| Digest::sha256(&m)))
    }
}

#[async_trait]
impl ImageSource for DirSource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<RawManifest, TransportError> {
        let path = manifest_path(&self.root, instance);
        let bytes = read_if_exists(&path)
            .await?
            .ok_or_else(|| TransportError::NotFound(path.display().to_string()))?;
        RawManifest::detect(bytes).map_err(|e| TransportError::Invalid(e.to_string()))
    }

    async fn get_blob(&self, descriptor: &Descriptor) -> Result<BlobStream, TransportError> {
        let digest = descriptor_digest(descriptor).map_err(invalid_digest(descriptor))?;
        let path = blob_path(&self.root, &digest);
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransportError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ReaderStream::new(file)
            .map_err(TransportError::from)
            .boxed())
    }

    async fn get_signatures(&self, manifest: &Digest) -> Result<Vec<Signature>, TransportError> {
        let instance = match self.top_level_digest().await? {
            Some(top) if &top == manifest => None,
            _ => Some(manifest),
        };
        let mut signatures = Vec::new();
        while let Some(data) =
            read_if_exists(&signature_path(&self.root, instance, signatures.len())).await?
        {
            let envelope: SignatureEnvelope = serde_json::from_slice(&data)?;
            let decode = |s: &str| {
                base64::decode(s).map_err(|e| TransportError::Invalid(format!("signature: {}", e)))
            };
            signatures.push(Signature {
                payload: decode(&envelope.payload)?,
                signature: decode(&envelope.signature)?,
                key_id: envelope.key_id,
            });
        }
        Ok(signatures)
    }
}

/// Writes an image into a directory.
pub struct DirDestination {
    root: PathBuf,
    reference: ImageReference,
    top_level: Mutex<Option<Digest>>,
}

impl DirDestination {
    /// Prepares `root` for a new image.
    ///
    /// An existing directory is only reused when it already holds an image;
    /// its previous contents are removed.
    #[instrument(level = "debug")]
    pub async fn create(root: &Path) -> Result<Self, TransportError> {
        match tokio::fs::read_dir(root).await {
            Ok(mut entries) => {
                let is_image = tokio::fs::metadata(root.join(VERSION_FILE)).await.is_ok();
                let mut stale = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    stale.push(entry.path());
                }
                if !stale.is_empty() && !is_image {
                    return Err(TransportError::Invalid(format!(
                        "refusing to overwrite {}: not an image directory",
                        root.display()
                    )));
                }
                for path in stale {
                    debug!(path = %path.display(), "removing previous image content");
                    if tokio::fs::metadata(&path).await?.is_dir() {
                        tokio::fs::remove_dir_all(&path).await?;
                    } else {
                        tokio::fs::remove_file(&path).await?;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(root).await?;
            }
            Err(e) => return Err(e.into()),
        }
        write_atomic(root.join(VERSION_FILE), Bytes::from_static(VERSION.as_bytes())).await?;
        Ok(DirDestination {
            root: root.to_owned(),
            reference: ImageReference::Directory(root.to_owned()),
            top_level: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ImageDestination for DirDestination {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        LayerCompression::PreserveOriginal
    }

    fn supports_manifest_lists(&self) -> bool {
        true
    }

    fn supports_signatures(&self) -> bool {
        true
    }

    async fn blob_exists(&self, descriptor: &Descriptor) -> Result<bool, TransportError> {
        let digest = descriptor_digest(descriptor).map_err(invalid_digest(descriptor))?;
        match tokio::fs::metadata(blob_path(&self.root, &digest)).await {
            Ok(meta) => Ok(meta.len() as i64 == descriptor.size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_blob(&self, descriptor: &Descriptor, data: Bytes) -> Result<(), TransportError> {
        let digest = descriptor_digest(descriptor).map_err(invalid_digest(descriptor))?;
        write_atomic(blob_path(&self.root, &digest), data).await
    }

    async fn put_manifest(
        &self,
        manifest: &RawManifest,
        instance: Option<&Digest>,
    ) -> Result<Digest, TransportError> {
        let digest = manifest.digest();
        let path = match instance {
            Some(_) => manifest_path(&self.root, Some(&digest)),
            None => {
                *self
                    .top_level
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(digest.clone());
                manifest_path(&self.root, None)
            }
        };
        write_atomic(path, manifest.bytes.clone()).await?;
        Ok(digest)
    }

    async fn put_signatures(
        &self,
        manifest: &Digest,
        signatures: &[Signature],
    ) -> Result<(), TransportError> {
        let is_top_level = self
            .top_level
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            == Some(manifest);
        let instance = if is_top_level { None } else { Some(manifest) };
        for (index, signature) in signatures.iter().enumerate() {
            let envelope = SignatureEnvelope {
                payload: base64::encode(&signature.payload),
                signature: base64::encode(&signature.signature),
                key_id: signature.key_id.clone(),
            };
            write_atomic(
                signature_path(&self.root, instance, index),
                serde_json::to_vec(&envelope)?.into(),
            )
            .await?;
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
