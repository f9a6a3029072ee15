//! In-memory sources, destinations and credential providers shared by the
//! copy scenarios.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use image_copy::compression::LayerCompression;
use image_copy::credentials::{
    CredentialBroker, CredentialProvider, CredentialProviderError, ProvidedCredentials, Secret,
};
use image_copy::digest::Digest;
use image_copy::error::TransportError;
use image_copy::manifest::{Descriptor, RawManifest};
use image_copy::policy::Signature;
use image_copy::reference::{resolve, ImageReference};
use image_copy::transport::{BlobStream, ImageDestination, ImageSource};
use oci_distribution::manifest::{
    ImageIndexEntry, OciImageIndex, OciManifest, Platform, IMAGE_CONFIG_MEDIA_TYPE,
    IMAGE_LAYER_GZIP_MEDIA_TYPE, OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE,
};
use tokio_util::sync::CancellationToken;

pub fn reference(locator: &str) -> ImageReference {
    resolve(locator).expect("valid locator")
}

pub fn descriptor(media_type: &str, data: &[u8]) -> Descriptor {
    Descriptor {
        media_type: media_type.to_owned(),
        digest: Digest::sha256(data).to_string(),
        size: data.len() as i64,
        ..Default::default()
    }
}

/// A gzip layer whose bytes do not need to be valid gzip, as long as nothing
/// recompresses it.
pub fn layer(seed: &str) -> (Descriptor, Bytes) {
    let data = Bytes::from(format!("layer {}", seed));
    (descriptor(IMAGE_LAYER_GZIP_MEDIA_TYPE, &data), data)
}

/// One image: a manifest, its config and layers.
#[derive(Clone)]
pub struct TestImage {
    pub manifest: RawManifest,
    pub blobs: Vec<(Descriptor, Bytes)>,
}

impl TestImage {
    pub fn new(name: &str, layers: usize) -> Self {
        let config = Bytes::from(format!("{{\"name\":\"{}\"}}", name));
        let config_descriptor = descriptor(IMAGE_CONFIG_MEDIA_TYPE, &config);
        let layers: Vec<(Descriptor, Bytes)> = (0..layers)
            .map(|i| layer(&format!("{}-{}", name, i)))
            .collect();
        let manifest = OciManifest {
            config: config_descriptor.clone(),
            layers: layers.iter().map(|(d, _)| d.clone()).collect(),
            ..Default::default()
        };
        let bytes = serde_json::to_vec(&manifest).expect("manifest serializes");
        let mut blobs = vec![(config_descriptor, config)];
        blobs.extend(layers);
        TestImage {
            manifest: RawManifest::new(bytes, OCI_IMAGE_MEDIA_TYPE),
            blobs,
        }
    }

    pub fn digest(&self) -> Digest {
        self.manifest.digest()
    }
}

/// An index over `images`, each tagged with the matching platform.
pub fn index(images: &[(&TestImage, &str, &str)]) -> RawManifest {
    let index = OciImageIndex {
        schema_version: 2,
        media_type: Some(OCI_IMAGE_INDEX_MEDIA_TYPE.to_owned()),
        manifests: images
            .iter()
            .map(|(image, os, arch)| ImageIndexEntry {
                media_type: OCI_IMAGE_MEDIA_TYPE.to_owned(),
                digest: image.digest().to_string(),
                size: image.manifest.bytes.len() as i64,
                platform: Some(Platform {
                    os: (*os).to_owned(),
                    architecture: (*arch).to_owned(),
                    ..Default::default()
                }),
                annotations: None,
            })
            .collect(),
        annotations: None,
    };
    RawManifest::new(
        serde_json::to_vec(&index).expect("index serializes"),
        OCI_IMAGE_INDEX_MEDIA_TYPE,
    )
}

pub struct FakeSource {
    reference: ImageReference,
    top: RawManifest,
    instances: HashMap<String, RawManifest>,
    blobs: HashMap<String, Bytes>,
    signatures: HashMap<String, Vec<Signature>>,
    gate: Option<Gate>,
    pub blob_reads: AtomicUsize,
}

impl FakeSource {
    pub fn single(locator: &str, image: &TestImage) -> Self {
        let mut source = Self::empty(locator, image.manifest.clone());
        source.add(image);
        source
    }

    pub fn list(locator: &str, list: RawManifest, images: &[&TestImage]) -> Self {
        let mut source = Self::empty(locator, list);
        for image in images {
            source.add(image);
        }
        source
    }

    fn empty(locator: &str, top: RawManifest) -> Self {
        FakeSource {
            reference: reference(locator),
            top,
            instances: HashMap::new(),
            blobs: HashMap::new(),
            signatures: HashMap::new(),
            gate: None,
            blob_reads: AtomicUsize::new(0),
        }
    }

    fn add(&mut self, image: &TestImage) {
        self.instances
            .insert(image.digest().to_string(), image.manifest.clone());
        for (d, data) in &image.blobs {
            self.blobs.insert(d.digest.clone(), data.clone());
        }
    }

    pub fn with_signatures(mut self, manifest: &Digest, signatures: Vec<Signature>) -> Self {
        self.signatures.insert(manifest.to_string(), signatures);
        self
    }

    /// Requires credentials for every blob read.
    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Replaces the stored bytes of a blob with as many different bytes,
    /// leaving its descriptor alone.
    pub fn corrupt(&mut self, digest: &str) {
        if let Some(data) = self.blobs.get_mut(digest) {
            *data = Bytes::from(vec![b'x'; data.len()]);
        }
    }
}

#[async_trait]
impl ImageSource for FakeSource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<RawManifest, TransportError> {
        match instance {
            None => Ok(self.top.clone()),
            Some(d) => self
                .instances
                .get(&d.to_string())
                .cloned()
                .ok_or_else(|| TransportError::NotFound(d.to_string())),
        }
    }

    async fn get_blob(&self, descriptor: &Descriptor) -> Result<BlobStream, TransportError> {
        self.blob_reads.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.check().await?;
        }
        let data = self
            .blobs
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(descriptor.digest.clone()))?;
        let half = data.len() / 2;
        let chunks: Vec<Result<Bytes, TransportError>> =
            vec![Ok(data.slice(..half)), Ok(data.slice(half..))];
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn get_signatures(&self, manifest: &Digest) -> Result<Vec<Signature>, TransportError> {
        Ok(self
            .signatures
            .get(&manifest.to_string())
            .cloned()
            .unwrap_or_default())
    }
}

/// Requires credentials from a broker on every call and refuses any
/// password other than `accepted`.
pub struct Gate {
    pub broker: Arc<CredentialBroker>,
    pub host: String,
    pub accepted: String,
}

impl Gate {
    async fn check(&self) -> Result<(), TransportError> {
        let material = self.broker.credentials_for(&self.host, "app").await?;
        match material.secret {
            Secret::Basic { password, .. } if password == self.accepted => Ok(()),
            _ => Err(TransportError::AuthRequired {
                host: self.host.clone(),
            }),
        }
    }
}

pub struct FakeDestination {
    reference: ImageReference,
    compression: LayerCompression,
    lists: bool,
    signatures_supported: bool,
    gate: Option<Gate>,
    fail_blob: Option<String>,
    cancel_after: Option<(usize, CancellationToken)>,
    pub blobs: Mutex<HashMap<String, Bytes>>,
    pub blob_writes: Mutex<Vec<String>>,
    pub manifests: Mutex<Vec<(RawManifest, Option<Digest>)>>,
    pub signatures: Mutex<HashMap<String, Vec<Signature>>>,
    pub committed: AtomicUsize,
}

impl FakeDestination {
    pub fn new(locator: &str) -> Self {
        FakeDestination {
            reference: reference(locator),
            compression: LayerCompression::PreserveOriginal,
            lists: true,
            signatures_supported: true,
            gate: None,
            fail_blob: None,
            cancel_after: None,
            blobs: Mutex::new(HashMap::new()),
            blob_writes: Mutex::new(Vec::new()),
            manifests: Mutex::new(Vec::new()),
            signatures: Mutex::new(HashMap::new()),
            committed: AtomicUsize::new(0),
        }
    }

    pub fn without_lists(mut self) -> Self {
        self.lists = false;
        self
    }

    pub fn without_signatures(mut self) -> Self {
        self.signatures_supported = false;
        self
    }

    pub fn wanting(mut self, compression: LayerCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_on(mut self, digest: &str) -> Self {
        self.fail_blob = Some(digest.to_owned());
        self
    }

    pub fn cancelling_after(mut self, writes: usize, cancel: CancellationToken) -> Self {
        self.cancel_after = Some((writes, cancel));
        self
    }

    pub fn seed(&self, image: &TestImage) {
        let mut blobs = self.blobs.lock().unwrap();
        for (d, data) in &image.blobs {
            blobs.insert(d.digest.clone(), data.clone());
        }
    }

    pub fn blob_writes(&self) -> usize {
        self.blob_writes.lock().unwrap().len()
    }

    pub fn manifest_writes(&self) -> usize {
        self.manifests.lock().unwrap().len()
    }

    async fn authorize(&self) -> Result<(), TransportError> {
        match &self.gate {
            Some(gate) => gate.check().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ImageDestination for FakeDestination {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        self.compression
    }

    fn supports_manifest_lists(&self) -> bool {
        self.lists
    }

    fn supports_signatures(&self) -> bool {
        self.signatures_supported
    }

    async fn blob_exists(&self, descriptor: &Descriptor) -> Result<bool, TransportError> {
        self.authorize().await?;
        Ok(self.blobs.lock().unwrap().contains_key(&descriptor.digest))
    }

    async fn put_blob(&self, descriptor: &Descriptor, data: Bytes) -> Result<(), TransportError> {
        self.authorize().await?;
        if self.fail_blob.as_deref() == Some(descriptor.digest.as_str()) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(descriptor.digest.clone(), data);
        let writes = {
            let mut log = self.blob_writes.lock().unwrap();
            log.push(descriptor.digest.clone());
            log.len()
        };
        if let Some((after, cancel)) = &self.cancel_after {
            if writes >= *after {
                cancel.cancel();
            }
        }
        Ok(())
    }

    async fn put_manifest(
        &self,
        manifest: &RawManifest,
        instance: Option<&Digest>,
    ) -> Result<Digest, TransportError> {
        self.authorize().await?;
        self.manifests
            .lock()
            .unwrap()
            .push((manifest.clone(), instance.cloned()));
        Ok(manifest.digest())
    }

    async fn put_signatures(
        &self,
        manifest: &Digest,
        signatures: &[Signature],
    ) -> Result<(), TransportError> {
        self.signatures
            .lock()
            .unwrap()
            .insert(manifest.to_string(), signatures.to_vec());
        Ok(())
    }

    async fn commit(&self) -> Result<(), TransportError> {
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out `token-1`, `token-2`, ... and counts how often it was asked.
#[derive(Default)]
pub struct CountingProvider {
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl CountingProvider {
    pub fn slow(delay: Duration) -> Self {
        CountingProvider {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for CountingProvider {
    async fn get_token(
        &self,
        _host: &str,
    ) -> Result<Option<ProvidedCredentials>, CredentialProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Some(ProvidedCredentials {
            username: "AWS".to_owned(),
            password: format!("token-{}", n),
            expires_at: None,
        }))
    }
}
