//! `docker save` tarballs, addressed as `docker-archive:/path[:name:tag]`.
//!
//! The tarball holds a `manifest.json` listing, per image, its config file,
//! its tags and its layer files. There is no registry manifest inside, so
//! the source synthesizes a Docker schema2 manifest from that listing.
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use oci_distribution::manifest::{
    OciDescriptor, OciManifest, IMAGE_DOCKER_CONFIG_MEDIA_TYPE, IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
    IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use super::{BlobStream, ImageDestination, ImageSource};
use crate::compression::{sniff, CompressionFormat, LayerCompression};
use crate::digest::Digest;
use crate::error::TransportError;
use crate::manifest::{Descriptor, Manifest, RawManifest};
use crate::policy::Signature;
use crate::reference::{DockerReference, ImageReference};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveImage {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

#[derive(Clone, Copy, Debug)]
struct EntryPosition {
    offset: u64,
    size: u64,
}

fn entry_name(path: &Path) -> String {
    let name = path.to_string_lossy();
    name.trim_start_matches("./").to_owned()
}

fn blocking_error(e: tokio::task::JoinError) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::Other, e))
}

/// Where each file of a tarball starts and how long it is.
#[derive(Debug)]
struct ArchiveIndex {
    path: PathBuf,
    entries: HashMap<String, EntryPosition>,
}

impl ArchiveIndex {
    fn build(path: &Path) -> io::Result<Self> {
        let mut archive = tar::Archive::new(File::open(path)?);
        let mut entries = HashMap::new();
        for entry in archive.entries()? {
            let entry = entry?;
            if entry.header().entry_type().is_dir() {
                continue;
            }
            entries.insert(
                entry_name(&entry.path()?),
                EntryPosition {
                    offset: entry.raw_file_position(),
                    size: entry.size(),
                },
            );
        }
        Ok(ArchiveIndex {
            path: path.to_owned(),
            entries,
        })
    }

    fn position(&self, name: &str) -> io::Result<EntryPosition> {
        self.entries
            .get(name.trim_start_matches("./"))
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} is not in {}", name, self.path.display()),
                )
            })
    }

    fn open(&self, name: &str) -> io::Result<io::Take<File>> {
        let position = self.position(name)?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(position.offset))?;
        Ok(file.take(position.size))
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        self.open(name)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Hashes an entry and sniffs its compression without loading it whole.
    fn describe_layer(&self, name: &str) -> io::Result<OciDescriptor> {
        let mut reader = self.open(name)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        let mut compression = None;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if size == 0 {
                compression = sniff(&buf[..n]);
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        let media_type = match compression {
            Some(CompressionFormat::Gzip) => IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
            _ => IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
        };
        Ok(OciDescriptor {
            media_type: media_type.to_owned(),
            digest: format!("sha256:{:x}", hasher.finalize()),
            size: size as i64,
            urls: None,
            annotations: None,
        })
    }
}

fn select_image(
    images: Vec<ArchiveImage>,
    wanted: Option<&DockerReference>,
    path: &Path,
) -> Result<ArchiveImage, TransportError> {
    let wanted = match wanted {
        Some(w) => w,
        None if images.len() == 1 => {
            return images
                .into_iter()
                .next()
                .ok_or_else(|| TransportError::Invalid("empty archive".to_owned()))
        }
        None => {
            return Err(TransportError::Invalid(format!(
                "{} holds {} images; name the one to read",
                path.display(),
                images.len()
            )))
        }
    };
    images
        .into_iter()
        .find(|image| {
            image.repo_tags.iter().flatten().any(|tag| {
                DockerReference::try_from(tag.as_str())
                    .map(|r| r.whole() == wanted.whole())
                    .unwrap_or(false)
            })
        })
        .ok_or_else(|| TransportError::NotFound(format!("{} in {}", wanted, path.display())))
}

/// Reads one image out of a `docker save` tarball.
pub struct ArchiveSource {
    index: std::sync::Arc<ArchiveIndex>,
    reference: ImageReference,
    manifest: RawManifest,
    blobs: HashMap<String, String>,
}

impl ArchiveSource {
    /// Indexes the tarball at `path` and picks the image tagged `tag`, or the
    /// only image when no tag is given.
    pub async fn open(path: &Path, tag: Option<DockerReference>) -> Result<Self, TransportError> {
        let reference = ImageReference::Archive {
            path: path.to_owned(),
            reference: tag.clone(),
        };
        Self::open_as(path, tag, reference).await
    }

    /// Like [`open`](Self::open), reporting `reference` as the source.
    #[instrument(level = "debug", skip(reference))]
    pub(crate) async fn open_as(
        path: &Path,
        tag: Option<DockerReference>,
        reference: ImageReference,
    ) -> Result<Self, TransportError> {
        if tokio::fs::metadata(path).await.is_err() {
            return Err(TransportError::NotFound(path.display().to_string()));
        }
        let owned = path.to_owned();
        let (index, manifest, blobs) = tokio::task::spawn_blocking(
            move || -> Result<_, TransportError> {
                let index = ArchiveIndex::build(&owned)?;
                let images: Vec<ArchiveImage> =
                    serde_json::from_slice(&index.read(MANIFEST_FILE)?)?;
                let image = select_image(images, tag.as_ref(), &owned)?;

                let mut blobs = HashMap::new();
                let config_bytes = index.read(&image.config)?;
                let config = OciDescriptor {
                    media_type: IMAGE_DOCKER_CONFIG_MEDIA_TYPE.to_owned(),
                    digest: Digest::sha256(&config_bytes).to_string(),
                    size: config_bytes.len() as i64,
                    urls: None,
                    annotations: None,
                };
                blobs.insert(config.digest.clone(), image.config.clone());
                let mut layers = Vec::with_capacity(image.layers.len());
                for name in &image.layers {
                    let layer = index.describe_layer(name)?;
                    blobs.insert(layer.digest.clone(), name.clone());
                    layers.push(layer);
                }
                let manifest = OciManifest {
                    schema_version: 2,
                    media_type: Some(IMAGE_MANIFEST_MEDIA_TYPE.to_owned()),
                    config,
                    layers,
                    annotations: None,
                };
                let manifest = RawManifest::new(
                    serde_json::to_vec(&manifest)?,
                    IMAGE_MANIFEST_MEDIA_TYPE,
                );
                Ok((index, manifest, blobs))
            },
        )
        .await
        .map_err(blocking_error)??;
        debug!(blobs = blobs.len(), "indexed archive");
        Ok(ArchiveSource {
            index: std::sync::Arc::new(index),
            reference,
            manifest,
            blobs,
        })
    }
}

#[async_trait]
impl ImageSource for ArchiveSource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<RawManifest, TransportError> {
        match instance {
            None => Ok(self.manifest.clone()),
            Some(d) => Err(TransportError::NotFound(format!(
                "manifest {} (archives hold no manifest lists)",
                d
            ))),
        }
    }

    async fn get_blob(&self, descriptor: &Descriptor) -> Result<BlobStream, TransportError> {
        let name = self
            .blobs
            .get(&descriptor.digest)
            .ok_or_else(|| TransportError::NotFound(descriptor.digest.clone()))?;
        let position = self.index.position(name)?;
        let mut file = tokio::fs::File::open(&self.index.path).await?;
        file.seek(SeekFrom::Start(position.offset)).await?;
        Ok(ReaderStream::new(file.take(position.size))
            .map_err(TransportError::from)
            .boxed())
    }

    async fn get_signatures(&self, _manifest: &Digest) -> Result<Vec<Signature>, TransportError> {
        Ok(vec![])
    }
}

/// Collects blobs and writes a `docker save` tarball on commit.
pub struct ArchiveDestination {
    path: PathBuf,
    tag: Option<DockerReference>,
    reference: ImageReference,
    staging: tempfile::TempDir,
    staged: Mutex<HashSet<String>>,
    manifest: Mutex<Option<RawManifest>>,
}

impl ArchiveDestination {
    /// A destination writing to `path`, tagging the image `tag`.
    pub fn create(path: &Path, tag: Option<DockerReference>) -> Result<Self, TransportError> {
        let reference = ImageReference::Archive {
            path: path.to_owned(),
            reference: tag.clone(),
        };
        Self::create_as(path, tag, reference)
    }

    pub(crate) fn create_as(
        path: &Path,
        tag: Option<DockerReference>,
        reference: ImageReference,
    ) -> Result<Self, TransportError> {
        Ok(ArchiveDestination {
            path: path.to_owned(),
            tag,
            reference,
            staging: tempfile::tempdir()?,
            staged: Mutex::new(HashSet::new()),
            manifest: Mutex::new(None),
        })
    }

    fn staged(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.staged
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn write_archive(
    target: &Path,
    staging: &Path,
    manifest: &OciManifest,
    tag: Option<&DockerReference>,
) -> Result<(), TransportError> {
    let blob = |digest: &str| -> Result<PathBuf, TransportError> {
        let d: Digest = digest
            .parse()
            .map_err(|e| TransportError::Invalid(format!("{}: {}", digest, e)))?;
        Ok(staging.join(d.hex()))
    };
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut builder = tar::Builder::new(tmp);

    let config: Digest = manifest
        .config
        .digest
        .parse()
        .map_err(|e| TransportError::Invalid(format!("config digest: {}", e)))?;
    let config_name = format!("{}.json", config.hex());
    builder.append_path_with_name(blob(&manifest.config.digest)?, &config_name)?;

    let mut layer_names = Vec::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        let d: Digest = layer
            .digest
            .parse()
            .map_err(|e| TransportError::Invalid(format!("layer digest: {}", e)))?;
        let name = format!("{}/layer.tar", d.hex());
        builder.append_path_with_name(blob(&layer.digest)?, &name)?;
        layer_names.push(name);
    }

    let listing = vec![ArchiveImage {
        config: config_name,
        repo_tags: tag.map(|t| {
            vec![format!(
                "{}:{}",
                t.full_name(),
                t.tag().unwrap_or("latest")
            )]
        }),
        layers: layer_names,
    }];
    let listing = serde_json::to_vec(&listing)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(listing.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, MANIFEST_FILE, &listing[..])?;

    let tmp = builder.into_inner()?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl ImageDestination for ArchiveDestination {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        LayerCompression::Decompress
    }

    fn supports_manifest_lists(&self) -> bool {
        false
    }

    fn supports_signatures(&self) -> bool {
        false
    }

    async fn blob_exists(&self, descriptor: &Descriptor) -> Result<bool, TransportError> {
        Ok(self.staged().contains(&descriptor.digest))
    }

    async fn put_blob(&self, descriptor: &Descriptor, data: Bytes) -> Result<(), TransportError> {
        let digest: Digest = descriptor
            .digest
            .parse()
            .map_err(|e| TransportError::Invalid(format!("{}: {}", descriptor.digest, e)))?;
        super::dir::write_atomic(self.staging.path().join(digest.hex()), data).await?;
        self.staged().insert(descriptor.digest.clone());
        Ok(())
    }

    async fn put_manifest(
        &self,
        manifest: &RawManifest,
        instance: Option<&Digest>,
    ) -> Result<Digest, TransportError> {
        if instance.is_some() || manifest.is_list() {
            return Err(TransportError::Unsupported(
                "docker archives can not hold manifest lists".to_owned(),
            ));
        }
        *self
            .manifest
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(manifest.clone());
        Ok(manifest.digest())
    }

    async fn put_signatures(
        &self,
        _manifest: &Digest,
        signatures: &[Signature],
    ) -> Result<(), TransportError> {
        if signatures.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Unsupported(
                "docker archives can not hold signatures".to_owned(),
            ))
        }
    }

    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    async fn commit(&self) -> Result<(), TransportError> {
        let raw = self
            .manifest
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::Invalid("no manifest was written".to_owned()))?;
        let manifest = match raw.parse().map_err(|e| TransportError::Invalid(e.to_string()))? {
            Manifest::Image(m) => m,
            Manifest::List(_) => {
                return Err(TransportError::Unsupported(
                    "docker archives can not hold manifest lists".to_owned(),
                ))
            }
        };
        let target = self.path.clone();
        let staging = self.staging.path().to_owned();
        let tag = self.tag.clone();
        tokio::task::spawn_blocking(move || {
            write_archive(&target, &staging, &manifest, tag.as_ref())
        })
        .await
        .map_err(blocking_error)?
    }
}
