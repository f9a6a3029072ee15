//! Images in a registry, addressed as `docker://host/repository[:tag][@digest]`.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{
    OciDescriptor, OciManifest, IMAGE_CONFIG_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE,
};
use oci_distribution::{Client, RegistryOperation};
use tracing::{debug, instrument, warn};

use super::{BlobStream, ImageDestination, ImageSource};
use crate::compression::LayerCompression;
use crate::credentials::CredentialBroker;
use crate::digest::Digest;
use crate::error::TransportError;
use crate::manifest::{Descriptor, RawManifest};
use crate::policy::Signature;
use crate::reference::{DockerReference, ImageReference};

/// Media type of a signature payload layer.
pub const SIMPLE_SIGNING_MEDIA_TYPE: &str = "application/vnd.dev.cosign.simplesigning.v1+json";
/// Annotation carrying the base64 signature of a payload layer.
pub const SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";
/// Annotation carrying the id of the signing key, when known.
pub const KEY_ID_ANNOTATION: &str = "dev.cosignproject.cosign/keyid";

/// The tag signatures for `manifest` are stored under.
pub fn signature_tag(manifest: &Digest) -> String {
    format!("{}-{}.sig", manifest.algorithm().as_str(), manifest.hex())
}

#[derive(Clone)]
struct Remote {
    client: Client,
    broker: Arc<CredentialBroker>,
    reference: DockerReference,
}

impl Remote {
    fn host(&self) -> &str {
        self.reference.registry()
    }

    async fn authorize(&self, operation: RegistryOperation) -> Result<(), TransportError> {
        if self
            .client
            .is_authenticated(&self.reference, operation)
            .await
        {
            return Ok(());
        }
        let material = self
            .broker
            .credentials_for(self.host(), self.reference.repository())
            .await?;
        let result = self
            .client
            .auth(
                &self.reference,
                &material.registry_auth(),
                operation,
                material.not_after(),
            )
            .await;
        self.check(result).await
    }

    /// Converts a wire result. Refusals also drop the tokens cached for the
    /// host, so that the retry after the broker refreshes starts clean.
    async fn check<T>(&self, result: Result<T, OciDistributionError>) -> Result<T, TransportError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_unauthorized() {
                    warn!(host = %self.host(), "registry refused our credentials");
                    self.client.forget_registry(&self.reference).await;
                }
                Err(TransportError::from_registry(self.host(), err))
            }
        }
    }

    async fn pull_manifest(&self, target: &DockerReference) -> Result<RawManifest, TransportError> {
        self.authorize(RegistryOperation::Pull).await?;
        let result = self.client.pull_manifest_raw(target, &[]).await;
        let (bytes, media_type, _) = self.check(result).await?;
        if media_type.is_empty() {
            Ok(RawManifest::detect(bytes).map_err(|e| TransportError::Invalid(e.to_string()))?)
        } else {
            Ok(RawManifest::new(bytes, media_type))
        }
    }

    async fn pull_blob(&self, digest: &str) -> Result<BlobStream, TransportError> {
        self.authorize(RegistryOperation::Pull).await?;
        let result = self.client.pull_blob_stream(&self.reference, digest).await;
        let stream = self.check(result).await?;
        let host = self.host().to_owned();
        Ok(stream
            .map_err(move |e| TransportError::from_registry(&host, e))
            .boxed())
    }

    async fn blob_exists(&self, digest: &str) -> Result<bool, TransportError> {
        self.authorize(RegistryOperation::Push).await?;
        let result = self.client.blob_exists(&self.reference, digest).await;
        self.check(result).await
    }

    async fn push_blob(&self, data: Bytes, digest: &str) -> Result<(), TransportError> {
        self.authorize(RegistryOperation::Push).await?;
        let result = self.client.push_blob(&self.reference, data, digest).await;
        self.check(result).await.map(|_| ())
    }

    async fn push_manifest(
        &self,
        target: &DockerReference,
        manifest: &RawManifest,
    ) -> Result<Digest, TransportError> {
        self.authorize(RegistryOperation::Push).await?;
        let result = self
            .client
            .push_manifest_raw(target, manifest.bytes.clone(), &manifest.media_type)
            .await;
        let reported = self.check(result).await?;
        let digest = manifest.digest();
        if reported != digest.to_string() {
            warn!(%reported, computed = %digest, "registry reported a different manifest digest");
        }
        Ok(digest)
    }

    fn signature_reference(&self, manifest: &Digest) -> Result<DockerReference, TransportError> {
        self.reference
            .clone_with_tag(&signature_tag(manifest))
            .map_err(|e| TransportError::Invalid(e.to_string()))
    }
}

async fn read_all(mut stream: BlobStream) -> Result<Bytes, TransportError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Reads images from a registry.
pub struct RegistrySource {
    remote: Remote,
    reference: ImageReference,
}

impl RegistrySource {
    /// A source for `reference`, authenticating through `broker`.
    pub fn new(client: Client, broker: Arc<CredentialBroker>, reference: DockerReference) -> Self {
        RegistrySource {
            reference: ImageReference::Registry(reference.clone()),
            remote: Remote {
                client,
                broker,
                reference,
            },
        }
    }
}

#[async_trait]
impl ImageSource for RegistrySource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    #[instrument(level = "debug", skip(self), fields(image = %self.reference))]
    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<RawManifest, TransportError> {
        match instance {
            Some(digest) => {
                let target = self.remote.reference.clone_with_digest(&digest.to_string());
                self.remote.pull_manifest(&target).await
            }
            None => self.remote.pull_manifest(&self.remote.reference).await,
        }
    }

    async fn get_blob(&self, descriptor: &Descriptor) -> Result<BlobStream, TransportError> {
        self.remote.pull_blob(&descriptor.digest).await
    }

    #[instrument(level = "debug", skip(self), fields(image = %self.reference))]
    async fn get_signatures(&self, manifest: &Digest) -> Result<Vec<Signature>, TransportError> {
        let target = self.remote.signature_reference(manifest)?;
        let raw = match self.remote.pull_manifest(&target).await {
            Ok(raw) => raw,
            Err(TransportError::NotFound(_)) => {
                debug!(%manifest, "no signatures stored");
                return Ok(vec![]);
            }
            Err(e) => return Err(e),
        };
        let parsed: OciManifest = serde_json::from_slice(&raw.bytes)?;

        let mut signatures = Vec::new();
        for layer in parsed
            .layers
            .iter()
            .filter(|l| l.media_type == SIMPLE_SIGNING_MEDIA_TYPE)
        {
            let annotations = layer.annotations.as_ref();
            let encoded = match annotations.and_then(|a| a.get(SIGNATURE_ANNOTATION)) {
                Some(encoded) => encoded,
                None => {
                    debug!(digest = %layer.digest, "signature layer without signature annotation");
                    continue;
                }
            };
            let signature = base64::decode(encoded)
                .map_err(|e| TransportError::Invalid(format!("signature encoding: {}", e)))?;
            let payload = read_all(self.remote.pull_blob(&layer.digest).await?).await?;
            if Digest::sha256(&payload).to_string() != layer.digest {
                return Err(TransportError::Invalid(format!(
                    "signature payload does not match {}",
                    layer.digest
                )));
            }
            signatures.push(Signature {
                payload: payload.to_vec(),
                signature,
                key_id: annotations.and_then(|a| a.get(KEY_ID_ANNOTATION)).cloned(),
            });
        }
        Ok(signatures)
    }
}

/// Writes images to a registry.
pub struct RegistryDestination {
    remote: Remote,
    reference: ImageReference,
}

impl RegistryDestination {
    /// A destination for `reference`, authenticating through `broker`.
    pub fn new(client: Client, broker: Arc<CredentialBroker>, reference: DockerReference) -> Self {
        RegistryDestination {
            reference: ImageReference::Registry(reference.clone()),
            remote: Remote {
                client,
                broker,
                reference,
            },
        }
    }

    async fn push_if_missing(&self, data: Bytes) -> Result<OciDescriptor, TransportError> {
        let digest = Digest::sha256(&data).to_string();
        if !self.remote.blob_exists(&digest).await? {
            self.remote.push_blob(data.clone(), &digest).await?;
        }
        Ok(OciDescriptor {
            media_type: String::new(),
            digest,
            size: data.len() as i64,
            urls: None,
            annotations: None,
        })
    }
}

#[async_trait]
impl ImageDestination for RegistryDestination {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        LayerCompression::Compress
    }

    fn supports_manifest_lists(&self) -> bool {
        true
    }

    fn supports_signatures(&self) -> bool {
        true
    }

    async fn blob_exists(&self, descriptor: &Descriptor) -> Result<bool, TransportError> {
        self.remote.blob_exists(&descriptor.digest).await
    }

    async fn try_mount_blob(
        &self,
        descriptor: &Descriptor,
        from: &ImageReference,
    ) -> Result<bool, TransportError> {
        let source = match from {
            ImageReference::Registry(r) if r.registry() == self.remote.host() => r,
            _ => return Ok(false),
        };
        if source.repository() == self.remote.reference.repository() {
            return Ok(false);
        }
        self.remote.authorize(RegistryOperation::Push).await?;
        let result = self
            .remote
            .client
            .mount_blob(&self.remote.reference, source, &descriptor.digest)
            .await;
        match self.remote.check(result).await {
            Ok(mounted) => Ok(mounted),
            Err(e @ TransportError::AuthRequired { .. }) => Err(e),
            Err(e) => {
                debug!(error = %e, digest = %descriptor.digest, "mount failed, uploading instead");
                Ok(false)
            }
        }
    }

    async fn put_blob(&self, descriptor: &Descriptor, data: Bytes) -> Result<(), TransportError> {
        self.remote.push_blob(data, &descriptor.digest).await
    }

    #[instrument(level = "debug", skip(self, manifest), fields(image = %self.reference))]
    async fn put_manifest(
        &self,
        manifest: &RawManifest,
        instance: Option<&Digest>,
    ) -> Result<Digest, TransportError> {
        let target = match instance {
            Some(_) => self
                .remote
                .reference
                .clone_with_digest(&manifest.digest().to_string()),
            None => self.remote.reference.clone(),
        };
        self.remote.push_manifest(&target, manifest).await
    }

    #[instrument(level = "debug", skip(self, signatures), fields(image = %self.reference, count = signatures.len()))]
    async fn put_signatures(
        &self,
        manifest: &Digest,
        signatures: &[Signature],
    ) -> Result<(), TransportError> {
        if signatures.is_empty() {
            return Ok(());
        }
        let mut layers = Vec::with_capacity(signatures.len());
        for signature in signatures {
            let mut layer = self
                .push_if_missing(Bytes::from(signature.payload.clone()))
                .await?;
            layer.media_type = SIMPLE_SIGNING_MEDIA_TYPE.to_owned();
            let mut annotations = HashMap::new();
            annotations.insert(
                SIGNATURE_ANNOTATION.to_owned(),
                base64::encode(&signature.signature),
            );
            if let Some(key_id) = &signature.key_id {
                annotations.insert(KEY_ID_ANNOTATION.to_owned(), key_id.clone());
            }
            layer.annotations = Some(annotations);
            layers.push(layer);
        }
        let mut config = self.push_if_missing(Bytes::from_static(b"{}")).await?;
        config.media_type = IMAGE_CONFIG_MEDIA_TYPE.to_owned();

        let body = serde_json::to_vec(&OciManifest {
            schema_version: 2,
            media_type: Some(OCI_IMAGE_MEDIA_TYPE.to_owned()),
            config,
            layers,
            annotations: None,
        })?;
        let target = self.remote.signature_reference(manifest)?;
        self.remote
            .push_manifest(&target, &RawManifest::new(body, OCI_IMAGE_MEDIA_TYPE))
            .await
            .map(|_| ())
    }

    async fn commit(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reference::resolve;

    fn destination(locator: &str) -> RegistryDestination {
        let reference = match resolve(locator).expect("valid") {
            ImageReference::Registry(r) => r,
            other => panic!("not a registry reference: {}", other),
        };
        RegistryDestination::new(
            Client::default(),
            Arc::new(CredentialBroker::anonymous()),
            reference,
        )
    }

    #[test]
    fn signature_tags_follow_the_attachment_convention() {
        let digest = Digest::sha256(b"manifest");
        assert_eq!(
            signature_tag(&digest),
            format!("sha256-{}.sig", digest.hex())
        );
        let dst = destination("docker://quay.io/org/app:v1");
        let target = dst.remote.signature_reference(&digest).expect("valid tag");
        assert_eq!(target.tag(), Some(signature_tag(&digest).as_str()));
        assert_eq!(target.digest(), None);
    }

    #[tokio::test]
    async fn mounting_needs_the_same_registry() -> anyhow::Result<()> {
        let dst = destination("docker://quay.io/org/app:v1");
        let descriptor = Descriptor {
            media_type: oci_distribution::manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE.to_owned(),
            digest: Digest::sha256(b"layer").to_string(),
            size: 5,
            urls: None,
            annotations: None,
        };
        let elsewhere = resolve("docker://ghcr.io/org/app:v1")?;
        let local = resolve("dir:/tmp/app")?;
        let same_repo = resolve("docker://quay.io/org/app:v0")?;
        assert!(!dst.try_mount_blob(&descriptor, &elsewhere).await?);
        assert!(!dst.try_mount_blob(&descriptor, &local).await?);
        assert!(!dst.try_mount_blob(&descriptor, &same_repo).await?);
        Ok(())
    }

    #[test]
    fn registries_want_compressed_layers() {
        let dst = destination("docker://quay.io/org/app:v1");
        assert_eq!(dst.desired_layer_compression(), LayerCompression::Compress);
        assert!(dst.supports_manifest_lists());
        assert!(dst.supports_signatures());
    }

    #[tokio::test]
    #[ignore]
    async fn pulls_a_public_manifest() -> anyhow::Result<()> {
        let source = RegistrySource::new(
            Client::default(),
            Arc::new(CredentialBroker::anonymous()),
            DockerReference::try_from("docker.io/library/hello-world:latest")?,
        );
        let manifest = source.get_manifest(None).await?;
        assert!(manifest.parse().is_ok());
        Ok(())
    }
}
