//! The copy orchestrator.
//!
//! A copy runs through fixed phases (see [`CopyPhase`]). Blobs are always
//! complete at the destination before any manifest referencing them is
//! written, and no manifest is written once anything has failed.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures::future::try_join_all;
use oci_distribution::manifest::{OciManifest, Platform};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::blob::BlobSession;
use crate::compression::{self, CompressionFormat, CompressionRequest, LayerAction};
use crate::credentials::CredentialBroker;
use crate::digest::Digest;
use crate::error::{BlobError, CopyError, CopyErrorKind, CopyPhase, TransportError};
use crate::manifest::{host_platform, select_instance, Descriptor, Manifest, RawManifest};
use crate::policy::{Admission, Signature, TrustPolicy};
use crate::reference::{resolve, ParseError};
use crate::transport::{ImageDestination, ImageSource, TransportContext};

const DEFAULT_MAX_PARALLEL_BLOB_COPIES: usize = 6;

/// Which images of a manifest list to copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageListSelection {
    /// Only the instance for one platform, written as a plain image
    CopySystemImage,
    /// Every instance, plus the list itself
    CopyAllImages,
}

impl Default for ImageListSelection {
    fn default() -> Self {
        ImageListSelection::CopySystemImage
    }
}

/// Knobs for a single copy.
#[derive(Clone, Debug)]
pub struct CopyOptions {
    /// Do not read or write signatures, unless the trust policy needs them
    pub remove_signatures: bool,
    /// Fail rather than change any manifest digest
    pub preserve_digests: bool,
    /// Recompress layers already compressed with another format
    pub force_compression_format: bool,
    /// Compression to use when compressing layers (gzip if unset)
    pub compression_format: Option<CompressionFormat>,
    /// How many blobs may be in flight at once
    pub max_parallel_blob_copies: usize,
    /// Which images of a manifest list to copy
    pub image_list_selection: ImageListSelection,
    /// The platform to select with [`ImageListSelection::CopySystemImage`];
    /// the host platform if unset
    pub platform: Option<Platform>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions {
            remove_signatures: false,
            preserve_digests: false,
            force_compression_format: false,
            compression_format: None,
            max_parallel_blob_copies: DEFAULT_MAX_PARALLEL_BLOB_COPIES,
            image_list_selection: ImageListSelection::default(),
            platform: None,
        }
    }
}

impl CopyOptions {
    /// Checks that the options do not contradict each other.
    pub fn validate(&self) -> Result<(), String> {
        if self.preserve_digests && self.force_compression_format {
            return Err("preserve_digests and force_compression_format are mutually exclusive".to_owned());
        }
        if self.force_compression_format && self.compression_format.is_none() {
            return Err("force_compression_format needs a compression_format".to_owned());
        }
        if self.max_parallel_blob_copies == 0 {
            return Err("max_parallel_blob_copies must be at least 1".to_owned());
        }
        Ok(())
    }
}

/// What a successful copy did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyResult {
    /// Digest of the top level manifest as written
    pub manifest_digest: Digest,
    /// Digests of every manifest written, instances first
    pub written_digests: Vec<Digest>,
    /// Blobs transferred
    pub blobs_copied: usize,
    /// Blobs already present (or mounted) at the destination
    pub blobs_skipped: usize,
    /// Bytes written to the destination
    pub bytes_copied: u64,
}

/// Copies the image at `source` to `destination`.
///
/// Both are locator strings such as `docker://quay.io/org/app:v1` or
/// `dir:/tmp/app`. The copy stops with [`CopyErrorKind::Cancelled`] soon
/// after `cancel` fires.
#[instrument(level = "info", skip(policy, options, context, cancel))]
pub async fn copy_image(
    source: &str,
    destination: &str,
    policy: &TrustPolicy,
    options: &CopyOptions,
    context: &TransportContext,
    cancel: CancellationToken,
) -> Result<CopyResult, CopyError> {
    options
        .validate()
        .map_err(at(CopyPhase::Start, "options", CopyErrorKind::InvalidOptions))?;

    let src_ref = resolve(source).map_err(at(CopyPhase::ResolvingRefs, source, CopyErrorKind::Parse))?;
    let dst_ref =
        resolve(destination).map_err(at(CopyPhase::ResolvingRefs, destination, CopyErrorKind::Parse))?;

    let src = race(&cancel, context.open_source(&src_ref))
        .await
        .ok_or_else(|| CopyError::new(CopyPhase::ResolvingRefs, source, CopyErrorKind::Cancelled))?
        .map_err(at(CopyPhase::ResolvingRefs, source, CopyErrorKind::from))?;
    let dst = race(&cancel, context.open_destination(&dst_ref))
        .await
        .ok_or_else(|| CopyError::new(CopyPhase::ResolvingRefs, destination, CopyErrorKind::Cancelled))?
        .map_err(at(CopyPhase::ResolvingRefs, destination, CopyErrorKind::from))?;

    copy_between(&*src, &*dst, policy, options, context.broker(), cancel).await
}

/// Copies between transports that are already open.
#[instrument(
    level = "info",
    skip(source, destination, policy, options, broker, cancel),
    fields(source = %source.reference(), destination = %destination.reference())
)]
pub async fn copy_between(
    source: &dyn ImageSource,
    destination: &dyn ImageDestination,
    policy: &TrustPolicy,
    options: &CopyOptions,
    broker: &CredentialBroker,
    cancel: CancellationToken,
) -> Result<CopyResult, CopyError> {
    options
        .validate()
        .map_err(at(CopyPhase::Start, "options", CopyErrorKind::InvalidOptions))?;
    let session = CopySession {
        source,
        destination,
        options,
        broker,
        blobs: BlobSession::new(source, destination, cancel.clone()),
        cancel,
        copied: AtomicUsize::new(0),
        skipped: AtomicUsize::new(0),
        bytes: AtomicU64::new(0),
    };
    session.run(policy).await
}

fn at<E, K>(
    phase: CopyPhase,
    resource: impl fmt::Display,
    kind: impl FnOnce(E) -> K,
) -> impl FnOnce(E) -> CopyError
where
    K: Into<CopyErrorKind>,
{
    let resource = resource.to_string();
    move |e| CopyError::new(phase, resource, kind(e))
}

fn invalid(e: impl fmt::Display) -> CopyErrorKind {
    CopyErrorKind::Transport(TransportError::Invalid(e.to_string()))
}

async fn race<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// One image manifest to copy, with its signatures.
struct Instance {
    digest: Digest,
    raw: RawManifest,
    manifest: OciManifest,
    signatures: Vec<Signature>,
}

enum Plan {
    Single(Instance),
    List {
        raw: RawManifest,
        signatures: Vec<Signature>,
        instances: Vec<Instance>,
    },
}

impl Plan {
    fn instances(&self) -> Vec<&Instance> {
        match self {
            Plan::Single(i) => vec![i],
            Plan::List { instances, .. } => instances.iter().collect(),
        }
    }
}

#[derive(Clone, Debug)]
struct BlobJob {
    descriptor: Descriptor,
    action: LayerAction,
}

struct CopySession<'a> {
    source: &'a dyn ImageSource,
    destination: &'a dyn ImageDestination,
    options: &'a CopyOptions,
    broker: &'a CredentialBroker,
    blobs: BlobSession<'a>,
    cancel: CancellationToken,
    copied: AtomicUsize,
    skipped: AtomicUsize,
    bytes: AtomicU64,
}

impl<'a> CopySession<'a> {
    fn src(&self) -> String {
        self.source.reference().to_string()
    }

    fn dst(&self) -> String {
        self.destination.reference().to_string()
    }

    fn check_cancelled(&self, phase: CopyPhase, resource: &str) -> Result<(), CopyError> {
        if self.cancel.is_cancelled() {
            Err(CopyError::new(phase, resource, CopyErrorKind::Cancelled))
        } else {
            Ok(())
        }
    }

    /// Runs a transport call raced against cancellation, retrying once with
    /// fresh credentials if the first attempt was refused.
    async fn call<T, F, Fut>(&self, phase: CopyPhase, resource: &str, op: F) -> Result<T, CopyError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let cancelled = || CopyError::new(phase, resource, CopyErrorKind::Cancelled);
        let result = match race(&self.cancel, op()).await.ok_or_else(cancelled)? {
            Err(TransportError::AuthRequired { host }) => {
                warn!(%host, %resource, "credentials refused, refreshing");
                self.broker.invalidate(&host);
                race(&self.cancel, op()).await.ok_or_else(cancelled)?
            }
            other => other,
        };
        result.map_err(|e| CopyError::new(phase, resource, e))
    }

    async fn retry_on_auth<T, F, Fut>(&self, op: F) -> Result<T, BlobError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BlobError>>,
    {
        match op().await {
            Err(BlobError::Transport(TransportError::AuthRequired { host })) => {
                warn!(%host, "credentials refused, refreshing");
                self.broker.invalidate(&host);
                op().await
            }
            other => other,
        }
    }

    async fn run(&self, policy: &TrustPolicy) -> Result<CopyResult, CopyError> {
        let (top, signatures) = self.evaluate_policy(policy).await?;
        let plan = self.fetch_manifests(top, signatures).await?;
        let jobs = self.diff_layers(&plan).await?;
        let replacements = self.copy_blobs(jobs).await?;
        self.write_manifests(plan, &replacements).await
    }

    #[instrument(level = "info", skip(self, policy))]
    async fn evaluate_policy(
        &self,
        policy: &TrustPolicy,
    ) -> Result<(RawManifest, Vec<Signature>), CopyError> {
        let src = self.src();
        let reference = self.source.reference();
        let top = self
            .call(CopyPhase::EvaluatingPolicy, &src, || {
                self.source.get_manifest(None)
            })
            .await?;
        if let Some(pinned) = reference.pinned_digest() {
            let pinned = pinned.map_err(at(CopyPhase::ResolvingRefs, &src, |e| {
                CopyErrorKind::Parse(ParseError::InvalidDigest(e))
            }))?;
            let actual = Digest::of(pinned.algorithm(), &top.bytes);
            if actual != pinned {
                return Err(CopyError::new(
                    CopyPhase::EvaluatingPolicy,
                    &src,
                    CopyErrorKind::DigestMismatch {
                        expected: pinned,
                        actual,
                    },
                ));
            }
        }

        let wanted = policy.needs_signatures(reference) || !self.options.remove_signatures;
        let signatures = if wanted {
            let digest = top.digest();
            self.call(CopyPhase::EvaluatingPolicy, &src, || {
                self.source.get_signatures(&digest)
            })
            .await?
        } else {
            vec![]
        };

        match policy.admit(reference, &top.bytes, &signatures) {
            Admission::Admitted => {
                info!(signatures = signatures.len(), "source admitted by trust policy");
                let signatures = if self.options.remove_signatures {
                    vec![]
                } else {
                    signatures
                };
                Ok((top, signatures))
            }
            Admission::Rejected(reason) => Err(CopyError::new(
                CopyPhase::EvaluatingPolicy,
                src,
                CopyErrorKind::PolicyRejected(reason),
            )),
        }
    }

    async fn fetch_instance(&self, expected: &str) -> Result<Instance, CopyError> {
        let phase = CopyPhase::FetchingManifest;
        let digest: Digest = expected
            .parse()
            .map_err(at(phase, expected, |e| CopyErrorKind::Parse(ParseError::InvalidDigest(e))))?;
        let raw = self
            .call(phase, expected, || self.source.get_manifest(Some(&digest)))
            .await?;
        let actual = Digest::of(digest.algorithm(), &raw.bytes);
        if actual != digest {
            return Err(CopyError::new(
                phase,
                expected,
                CopyErrorKind::DigestMismatch {
                    expected: digest,
                    actual,
                },
            ));
        }
        let manifest = match raw.parse().map_err(at(phase, expected, invalid))? {
            Manifest::Image(m) => m,
            Manifest::List(_) => {
                return Err(CopyError::new(
                    phase,
                    expected,
                    CopyErrorKind::Unsupported("nested manifest lists".to_owned()),
                ))
            }
        };
        let signatures = if self.options.remove_signatures {
            vec![]
        } else {
            self.call(phase, expected, || self.source.get_signatures(&digest))
                .await?
        };
        Ok(Instance {
            digest,
            raw,
            manifest,
            signatures,
        })
    }

    #[instrument(level = "info", skip(self, top, signatures), fields(media_type = %top.media_type))]
    async fn fetch_manifests(
        &self,
        top: RawManifest,
        signatures: Vec<Signature>,
    ) -> Result<Plan, CopyError> {
        let phase = CopyPhase::FetchingManifest;
        let src = self.src();
        self.check_cancelled(phase, &src)?;
        let index = match top.parse().map_err(at(phase, &src, invalid))? {
            Manifest::Image(manifest) => {
                return Ok(Plan::Single(Instance {
                    digest: top.digest(),
                    raw: top,
                    manifest,
                    signatures,
                }))
            }
            Manifest::List(index) => index,
        };

        match self.options.image_list_selection {
            ImageListSelection::CopySystemImage => {
                if !signatures.is_empty() {
                    return Err(CopyError::new(
                        phase,
                        &src,
                        CopyErrorKind::InvalidOptions(
                            "copying one image out of a signed list would invalidate its signatures; remove signatures to proceed"
                                .to_owned(),
                        ),
                    ));
                }
                let platform = self.options.platform.clone().unwrap_or_else(host_platform);
                let entry = select_instance(&index, &platform).ok_or_else(|| {
                    CopyError::new(
                        phase,
                        &src,
                        CopyErrorKind::Unsupported(format!(
                            "no image for platform {}/{}",
                            platform.os, platform.architecture
                        )),
                    )
                })?;
                debug!(digest = %entry.digest, "selected instance");
                Ok(Plan::Single(self.fetch_instance(&entry.digest).await?))
            }
            ImageListSelection::CopyAllImages => {
                if !self.destination.supports_manifest_lists() {
                    return Err(CopyError::new(
                        phase,
                        self.dst(),
                        CopyErrorKind::Unsupported(format!(
                            "{} destinations can not hold manifest lists",
                            self.destination.reference().transport()
                        )),
                    ));
                }
                let mut instances = Vec::with_capacity(index.manifests.len());
                for entry in &index.manifests {
                    instances.push(self.fetch_instance(&entry.digest).await?);
                }
                Ok(Plan::List {
                    raw: top,
                    signatures,
                    instances,
                })
            }
        }
    }

    #[instrument(level = "info", skip(self, plan))]
    async fn diff_layers(&self, plan: &Plan) -> Result<Vec<BlobJob>, CopyError> {
        let phase = CopyPhase::DiffingLayers;
        let desired = self.destination.desired_layer_compression();
        let request = CompressionRequest {
            format: self.options.compression_format,
            force: self.options.force_compression_format,
        };

        let mut jobs: Vec<BlobJob> = Vec::new();
        let mut seen = HashMap::new();
        let mut any_change = false;
        for instance in plan.instances() {
            let mut changes = false;
            for descriptor in std::iter::once(&instance.manifest.config).chain(&instance.manifest.layers) {
                let action = compression::decide(descriptor, desired, request);
                if action != LayerAction::Reuse {
                    if self.options.preserve_digests {
                        return Err(CopyError::new(
                            phase,
                            &descriptor.digest,
                            CopyErrorKind::Unsupported(format!(
                                "{} needs {:?} for {}, which would change its digest",
                                self.dst(),
                                action,
                                descriptor.media_type
                            )),
                        ));
                    }
                    compression::transformed_media_type(&descriptor.media_type, action).map_err(
                        |e| CopyError::new(phase, &descriptor.digest, CopyErrorKind::Unsupported(e.to_string())),
                    )?;
                    changes = true;
                }
                if seen.insert(descriptor.digest.clone(), action).is_none() {
                    jobs.push(BlobJob {
                        descriptor: descriptor.clone(),
                        action,
                    });
                }
            }
            if changes && !instance.signatures.is_empty() {
                return Err(CopyError::new(
                    phase,
                    &instance.digest,
                    CopyErrorKind::InvalidOptions(
                        "layers must be recompressed, which would invalidate the manifest's signatures; remove signatures to proceed"
                            .to_owned(),
                    ),
                ));
            }
            any_change |= changes;
        }

        let mut signed = plan.instances().iter().any(|i| !i.signatures.is_empty());
        if let Plan::List { signatures, .. } = plan {
            if any_change && !signatures.is_empty() {
                return Err(CopyError::new(
                    phase,
                    self.src(),
                    CopyErrorKind::InvalidOptions(
                        "instances must be rewritten, which would invalidate the list's signatures; remove signatures to proceed"
                            .to_owned(),
                    ),
                ));
            }
            signed |= !signatures.is_empty();
        }
        if signed && !self.destination.supports_signatures() {
            return Err(CopyError::new(
                phase,
                self.dst(),
                CopyErrorKind::Unsupported(format!(
                    "{} destinations can not store signatures; remove signatures to proceed",
                    self.destination.reference().transport()
                )),
            ));
        }

        // Only untouched blobs can already be at the destination under
        // their current digest.
        let semaphore = Semaphore::new(self.options.max_parallel_blob_copies);
        let probes = jobs.into_iter().map(|job| {
            let semaphore = &semaphore;
            async move {
                if job.action != LayerAction::Reuse {
                    return Ok::<_, CopyError>(Some(job));
                }
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| CopyError::new(phase, &job.descriptor.digest, CopyErrorKind::Cancelled))?;
                self.check_cancelled(phase, &job.descriptor.digest)?;
                let blobs = &self.blobs;
                let descriptor = &job.descriptor;
                let present = self
                    .retry_on_auth(|| async move {
                        if blobs.exists_at_destination(descriptor).await? {
                            return Ok(true);
                        }
                        blobs.mount_at_destination(descriptor).await
                    })
                    .await
                    .map_err(|e| CopyError::new(phase, &job.descriptor.digest, e))?;
                if present {
                    debug!(digest = %job.descriptor.digest, "blob already at destination");
                    self.skipped.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                } else {
                    Ok(Some(job))
                }
            }
        });
        let to_copy: Vec<BlobJob> = try_join_all(probes).await?.into_iter().flatten().collect();
        info!(
            copy = to_copy.len(),
            skip = self.skipped.load(Ordering::SeqCst),
            "layer diff complete"
        );
        Ok(to_copy)
    }

    async fn copy_one(&self, job: &BlobJob) -> Result<Option<Descriptor>, BlobError> {
        let (stored, data) = self.blobs.fetch_verified(&job.descriptor, job.action).await?;
        let size = data.len() as u64;
        self.blobs.store(&stored, data).await?;
        self.copied.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(size, Ordering::SeqCst);
        debug!(digest = %stored.digest, size, "blob copied");
        Ok(if stored.digest != job.descriptor.digest {
            Some(stored)
        } else {
            None
        })
    }

    #[instrument(level = "info", skip(self, jobs), fields(count = jobs.len()))]
    async fn copy_blobs(&self, jobs: Vec<BlobJob>) -> Result<HashMap<String, Descriptor>, CopyError> {
        let phase = CopyPhase::CopyingBlobs;
        let semaphore = Semaphore::new(self.options.max_parallel_blob_copies);
        let copies = jobs.iter().map(|job| {
            let semaphore = &semaphore;
            async move {
                let digest = &job.descriptor.digest;
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| CopyError::new(phase, digest, CopyErrorKind::Cancelled))?;
                self.check_cancelled(phase, digest)?;
                let stored = self
                    .retry_on_auth(|| self.copy_one(job))
                    .await
                    .map_err(|e| CopyError::new(phase, digest, e))?;
                Ok::<_, CopyError>(stored.map(|d| (digest.clone(), d)))
            }
        });
        let replacements = try_join_all(copies).await?.into_iter().flatten().collect();
        Ok(replacements)
    }

    async fn write_instance(
        &self,
        instance: &Instance,
        replacements: &HashMap<String, Descriptor>,
        as_instance: bool,
    ) -> Result<(Digest, Option<RawManifest>), CopyError> {
        let phase = CopyPhase::WritingManifest;
        let rewritten = if replacements.is_empty() {
            None
        } else {
            instance
                .raw
                .with_replaced_layers(replacements)
                .map_err(at(phase, &instance.digest, invalid))?
        };
        let raw = rewritten.as_ref().unwrap_or(&instance.raw);
        let digest = self
            .call(phase, &instance.digest.to_string(), || {
                self.destination
                    .put_manifest(raw, as_instance.then(|| &instance.digest))
            })
            .await?;
        self.write_signatures(&digest, &instance.signatures).await?;
        Ok((digest, rewritten))
    }

    async fn write_signatures(&self, digest: &Digest, signatures: &[Signature]) -> Result<(), CopyError> {
        if signatures.is_empty() {
            return Ok(());
        }
        self.call(CopyPhase::WritingManifest, &digest.to_string(), || {
            self.destination.put_signatures(digest, signatures)
        })
        .await
    }

    #[instrument(level = "info", skip(self, plan, replacements))]
    async fn write_manifests(
        &self,
        plan: Plan,
        replacements: &HashMap<String, Descriptor>,
    ) -> Result<CopyResult, CopyError> {
        let phase = CopyPhase::WritingManifest;
        let dst = self.dst();
        self.check_cancelled(phase, &dst)?;

        let mut written = Vec::new();
        let top = match &plan {
            Plan::Single(instance) => {
                let (digest, _) = self.write_instance(instance, replacements, false).await?;
                written.push(digest.clone());
                digest
            }
            Plan::List {
                raw,
                signatures,
                instances,
            } => {
                let mut rewritten = HashMap::new();
                for instance in instances {
                    let (digest, changed) = self.write_instance(instance, replacements, true).await?;
                    if let Some(changed) = changed {
                        rewritten.insert(instance.digest.to_string(), (digest.clone(), changed.bytes.len()));
                    }
                    written.push(digest);
                }
                let list = raw
                    .with_replaced_instances(&rewritten)
                    .map_err(at(phase, &dst, invalid))?;
                let digest = self
                    .call(phase, &dst, || self.destination.put_manifest(&list, None))
                    .await?;
                self.write_signatures(&digest, signatures).await?;
                written.push(digest.clone());
                digest
            }
        };
        self.call(phase, &dst, || self.destination.commit()).await?;

        let result = CopyResult {
            manifest_digest: top,
            written_digests: written,
            blobs_copied: self.copied.load(Ordering::SeqCst),
            blobs_skipped: self.skipped.load(Ordering::SeqCst),
            bytes_copied: self.bytes.load(Ordering::SeqCst),
        };
        info!(
            digest = %result.manifest_digest,
            copied = result.blobs_copied,
            skipped = result.blobs_skipped,
            bytes = result.bytes_copied,
            "copy complete"
        );
        Ok(result)
    }
}
