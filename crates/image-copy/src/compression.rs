//! Layer compression: detection, negotiation and the actual transform.
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use oci_distribution::manifest as wire;
use thiserror::Error;
use zstd::stream::write::{Decoder as ZstdDecoder, Encoder as ZstdEncoder};

use crate::digest::Digest;
use crate::manifest::Descriptor;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// A layer compression algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionFormat {
    /// gzip, supported everywhere
    Gzip,
    /// zstd, OCI media types only
    Zstd,
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionFormat::Gzip => f.write_str("gzip"),
            CompressionFormat::Zstd => f.write_str("zstd"),
        }
    }
}

impl FromStr for CompressionFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(CompressionFormat::Gzip),
            "zstd" => Ok(CompressionFormat::Zstd),
            other => Err(format!("unknown compression format {:?}", other)),
        }
    }
}

/// What a destination wants done with layer compression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerCompression {
    /// Store layers as they come
    PreserveOriginal,
    /// Store layers compressed
    Compress,
    /// Store layers uncompressed
    Decompress,
}

/// The transform applied to one blob on its way to the destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayerAction {
    /// Copy the bytes unchanged
    Reuse,
    /// Compress with the given format, decompressing first if needed
    Compress(CompressionFormat),
    /// Store the uncompressed tar stream
    Decompress,
}

/// Failures of the compression transform.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// The media type has no counterpart in the target compression.
    #[error("no media type for {media_type} with {action:?}")]
    NoMediaType {
        /// Original media type
        media_type: String,
        /// Requested transform
        action: LayerAction,
    },
    /// The data could not be (de)compressed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A previous chunk already failed.
    #[error("transform used after a failure")]
    Poisoned,
}

/// The copy options that influence compression.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompressionRequest {
    /// Format to use when compressing
    pub format: Option<CompressionFormat>,
    /// Recompress layers already compressed with another format
    pub force: bool,
}

/// Returns true for media types that describe filesystem layers.
pub fn is_layer(media_type: &str) -> bool {
    media_type.starts_with("application/vnd.oci.image.layer.")
        || media_type.starts_with("application/vnd.docker.image.rootfs.")
}

/// The compression named by a layer media type; `None` means a plain tar.
pub fn detect(media_type: &str) -> Option<CompressionFormat> {
    if media_type.ends_with("+gzip") || media_type.ends_with(".tar.gzip") {
        Some(CompressionFormat::Gzip)
    } else if media_type.ends_with("+zstd") {
        Some(CompressionFormat::Zstd)
    } else {
        None
    }
}

/// The compression recognized from the first bytes of a blob.
pub fn sniff(data: &[u8]) -> Option<CompressionFormat> {
    if data.starts_with(GZIP_MAGIC) {
        Some(CompressionFormat::Gzip)
    } else if data.starts_with(ZSTD_MAGIC) {
        Some(CompressionFormat::Zstd)
    } else {
        None
    }
}

/// Decides how to transform `descriptor` for a destination that wants
/// `desired`.
pub fn decide(
    descriptor: &Descriptor,
    desired: LayerCompression,
    request: CompressionRequest,
) -> LayerAction {
    if !is_layer(&descriptor.media_type)
        || descriptor.media_type == wire::IMAGE_DOCKER_FOREIGN_LAYER_MEDIA_TYPE
    {
        return LayerAction::Reuse;
    }
    let current = detect(&descriptor.media_type);
    let target = request.format.unwrap_or(CompressionFormat::Gzip);
    match (desired, current) {
        (LayerCompression::Decompress, Some(_)) => LayerAction::Decompress,
        (LayerCompression::Decompress, None) => LayerAction::Reuse,
        (LayerCompression::Compress, None) => LayerAction::Compress(target),
        (_, Some(fmt)) if request.force && request.format.is_some() && fmt != target => {
            LayerAction::Compress(target)
        }
        (LayerCompression::PreserveOriginal, None)
            if request.force && request.format.is_some() =>
        {
            LayerAction::Compress(target)
        }
        _ => LayerAction::Reuse,
    }
}

/// The media type of a layer after `action`.
pub fn transformed_media_type(media_type: &str, action: LayerAction) -> Result<String, CompressionError> {
    use wire::*;
    let docker = media_type.starts_with("application/vnd.docker.");
    let mapped = match (action, docker) {
        (LayerAction::Reuse, _) => Some(media_type),
        (LayerAction::Decompress, true) => Some(IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE),
        (LayerAction::Decompress, false) => Some(IMAGE_LAYER_MEDIA_TYPE),
        (LayerAction::Compress(CompressionFormat::Gzip), true) => {
            Some(IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE)
        }
        (LayerAction::Compress(CompressionFormat::Gzip), false) => {
            Some(IMAGE_LAYER_GZIP_MEDIA_TYPE)
        }
        (LayerAction::Compress(CompressionFormat::Zstd), false) => {
            Some(IMAGE_LAYER_ZSTD_MEDIA_TYPE)
        }
        (LayerAction::Compress(CompressionFormat::Zstd), true) => None,
    };
    mapped
        .map(str::to_owned)
        .ok_or_else(|| CompressionError::NoMediaType {
            media_type: media_type.to_owned(),
            action,
        })
}

enum Sink {
    Plain(Vec<u8>),
    Gzip(GzEncoder<Vec<u8>>),
    Zstd(ZstdEncoder<'static, Vec<u8>>),
}

impl Sink {
    fn new(action: LayerAction) -> io::Result<Self> {
        Ok(match action {
            LayerAction::Reuse | LayerAction::Decompress => Sink::Plain(Vec::new()),
            LayerAction::Compress(CompressionFormat::Gzip) => {
                Sink::Gzip(GzEncoder::new(Vec::new(), Compression::default()))
            }
            LayerAction::Compress(CompressionFormat::Zstd) => {
                Sink::Zstd(ZstdEncoder::new(Vec::new(), zstd::DEFAULT_COMPRESSION_LEVEL)?)
            }
        })
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Sink::Plain(out) => Ok(out),
            Sink::Gzip(encoder) => encoder.finish(),
            Sink::Zstd(encoder) => encoder.finish(),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(out) => out.write(buf),
            Sink::Gzip(encoder) => encoder.write(buf),
            Sink::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(out) => out.flush(),
            Sink::Gzip(encoder) => encoder.flush(),
            Sink::Zstd(encoder) => encoder.flush(),
        }
    }
}

enum Stage {
    // Not enough bytes yet to tell how the input is compressed.
    Sniffing(Vec<u8>, Sink),
    Copy(Sink),
    Gunzip(GzDecoder<Sink>),
    Unzstd(ZstdDecoder<'static, Sink>),
}

impl Stage {
    fn open(head: Vec<u8>, sink: Sink) -> io::Result<Self> {
        let mut stage = match sniff(&head) {
            None => Stage::Copy(sink),
            Some(CompressionFormat::Gzip) => Stage::Gunzip(GzDecoder::new(sink)),
            Some(CompressionFormat::Zstd) => Stage::Unzstd(ZstdDecoder::new(sink)?),
        };
        stage.write_all(&head)?;
        Ok(stage)
    }

    fn into_sink(self) -> io::Result<Sink> {
        match self {
            Stage::Sniffing(head, sink) => Stage::open(head, sink)?.into_sink(),
            Stage::Copy(sink) => Ok(sink),
            Stage::Gunzip(decoder) => decoder.finish(),
            Stage::Unzstd(mut decoder) => {
                decoder.flush()?;
                Ok(decoder.into_inner())
            }
        }
    }
}

impl Write for Stage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stage::Sniffing(head, _) => {
                head.extend_from_slice(buf);
                Ok(buf.len())
            }
            Stage::Copy(sink) => sink.write(buf),
            Stage::Gunzip(decoder) => decoder.write(buf),
            Stage::Unzstd(decoder) => decoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stage::Sniffing(..) => Ok(()),
            Stage::Copy(sink) => sink.flush(),
            Stage::Gunzip(decoder) => decoder.flush(),
            Stage::Unzstd(decoder) => decoder.flush(),
        }
    }
}

/// Applies a [`LayerAction`] to a blob as its chunks arrive.
///
/// Compressed input is recognized from its first bytes and decoded on the
/// fly, so gzip and zstd layers can be turned into either format or into a
/// plain tar. Only the transformed output is kept.
pub struct Transformer {
    original: Descriptor,
    action: LayerAction,
    media_type: String,
    stage: Option<Stage>,
}

impl Transformer {
    /// Prepares `action` for the blob `descriptor`. Fails up front when the
    /// result would have no media type.
    pub fn new(descriptor: &Descriptor, action: LayerAction) -> Result<Self, CompressionError> {
        let media_type = transformed_media_type(&descriptor.media_type, action)?;
        let sink = Sink::new(action)?;
        let stage = if action == LayerAction::Reuse {
            Stage::Copy(sink)
        } else {
            Stage::Sniffing(Vec::with_capacity(ZSTD_MAGIC.len()), sink)
        };
        Ok(Transformer {
            original: descriptor.clone(),
            action,
            media_type,
            stage: Some(stage),
        })
    }

    /// Feeds the next chunk of the original blob.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), CompressionError> {
        let mut stage = self.stage.take().ok_or(CompressionError::Poisoned)?;
        stage.write_all(chunk)?;
        self.stage = Some(match stage {
            Stage::Sniffing(head, sink) if head.len() >= ZSTD_MAGIC.len() => Stage::open(head, sink)?,
            other => other,
        });
        Ok(())
    }

    /// Completes the transform, returning the descriptor and bytes to store.
    pub fn finish(mut self) -> Result<(Descriptor, Bytes), CompressionError> {
        let stage = self.stage.take().ok_or(CompressionError::Poisoned)?;
        let out = Bytes::from(stage.into_sink()?.finish()?);
        if self.action == LayerAction::Reuse {
            return Ok((self.original, out));
        }
        let descriptor = Descriptor {
            media_type: self.media_type,
            digest: Digest::sha256(&out).to_string(),
            size: out.len() as i64,
            urls: None,
            annotations: self.original.annotations,
        };
        Ok((descriptor, out))
    }
}
