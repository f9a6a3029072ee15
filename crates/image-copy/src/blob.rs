//! Moving single blobs between a source and a destination.
use std::convert::TryFrom;

use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};

use crate::compression::{LayerAction, Transformer};
use crate::error::{BlobError, TransportError};
use crate::manifest::{descriptor_digest, Descriptor};
use crate::transport::{ImageDestination, ImageSource};

/// Blob operations for one copy, all bound to its cancellation token.
///
/// Source blobs are never buffered as read: each chunk is hashed and pushed
/// through the layer transform as it arrives. The transformed blob is held in
/// memory until it is stored, since destinations take whole blobs.
pub struct BlobSession<'a> {
    source: &'a dyn ImageSource,
    destination: &'a dyn ImageDestination,
    cancel: CancellationToken,
}

impl<'a> BlobSession<'a> {
    /// A session between `source` and `destination`.
    pub fn new(
        source: &'a dyn ImageSource,
        destination: &'a dyn ImageDestination,
        cancel: CancellationToken,
    ) -> Self {
        BlobSession {
            source,
            destination,
            cancel,
        }
    }

    /// Reads a blob from the source, checking size and digest as it streams
    /// and applying `action` on the way. Returns the descriptor and bytes to
    /// store, which are only handed out once the source bytes verified.
    #[instrument(level = "debug", skip(self, descriptor), fields(digest = %descriptor.digest))]
    pub async fn fetch_verified(
        &self,
        descriptor: &Descriptor,
        action: LayerAction,
    ) -> Result<(Descriptor, Bytes), BlobError> {
        let expected = descriptor_digest(descriptor)
            .map_err(|e| TransportError::Invalid(e.to_string()))?;
        let expected_size = u64::try_from(descriptor.size)
            .map_err(|_| TransportError::Invalid(format!("negative size {}", descriptor.size)))?;
        let mut transformer = Transformer::new(descriptor, action)?;

        let mut stream = self.cancellable(self.source.get_blob(descriptor)).await??;
        let mut verifier = expected.verifier();
        // Decoder failures on bytes that later fail verification are
        // reported as the mismatch.
        let mut transformed = Ok(());
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(BlobError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let chunk = match chunk {
                Some(chunk) => chunk?,
                None => break,
            };
            verifier.update(&chunk);
            if verifier.written() > expected_size {
                return Err(BlobError::SizeMismatch {
                    expected: expected_size,
                    actual: verifier.written(),
                });
            }
            if transformed.is_ok() {
                transformed = transformer.write(&chunk);
            }
        }

        if verifier.written() != expected_size {
            return Err(BlobError::SizeMismatch {
                expected: expected_size,
                actual: verifier.written(),
            });
        }
        let actual = verifier.finish();
        if actual != expected {
            return Err(BlobError::DigestMismatch { expected, actual });
        }
        transformed?;
        trace!(size = expected_size, ?action, "blob verified");
        Ok(transformer.finish()?)
    }

    /// Returns true if the destination already holds the blob.
    pub async fn exists_at_destination(&self, descriptor: &Descriptor) -> Result<bool, BlobError> {
        Ok(self
            .cancellable(self.destination.blob_exists(descriptor))
            .await??)
    }

    /// Asks the destination to take the blob over from the source's
    /// repository.
    pub async fn mount_at_destination(&self, descriptor: &Descriptor) -> Result<bool, BlobError> {
        Ok(self
            .cancellable(
                self.destination
                    .try_mount_blob(descriptor, self.source.reference()),
            )
            .await??)
    }

    /// Writes verified bytes to the destination.
    pub async fn store(&self, descriptor: &Descriptor, data: Bytes) -> Result<(), BlobError> {
        Ok(self
            .cancellable(self.destination.put_blob(descriptor, data))
            .await??)
    }

    async fn cancellable<T>(
        &self,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, BlobError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BlobError::Cancelled),
            out = fut => Ok(out),
        }
    }
}
