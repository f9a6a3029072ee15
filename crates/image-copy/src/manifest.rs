//! Manifests as raw bytes plus a parsed view, platform selection and
//! in-place descriptor rewriting.
use std::collections::HashMap;

use bytes::Bytes;
use oci_distribution::manifest::{
    self as wire, ImageIndexEntry, OciDescriptor, OciImageIndex, OciManifest, Platform,
};
use thiserror::Error;

use crate::digest::{Digest, DigestError};

/// A descriptor of a blob or manifest.
pub type Descriptor = OciDescriptor;

/// Errors produced while decoding or editing manifests.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The document is not valid JSON for its media type.
    #[error("malformed manifest: {0}")]
    Json(#[from] serde_json::Error),
    /// The media type is not a manifest type this engine understands.
    #[error("unsupported manifest media type {0:?}")]
    UnsupportedMediaType(String),
    /// A descriptor carries an invalid digest.
    #[error(transparent)]
    Digest(#[from] DigestError),
    /// The manifest is not shaped the way the edit expects.
    #[error("cannot edit manifest: {0}")]
    Shape(String),
}

/// A manifest exactly as stored, with its media type.
///
/// The bytes are never re-serialized unless a descriptor in them changes, so
/// the digest of an untouched manifest survives the copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawManifest {
    /// The manifest document
    pub bytes: Bytes,
    /// Its media type, without parameters
    pub media_type: String,
}

/// The parsed form of a [`RawManifest`].
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    /// A single image: config plus layers
    Image(OciManifest),
    /// A manifest list or OCI index: one entry per platform
    List(OciImageIndex),
}

impl RawManifest {
    /// Wraps `bytes` with an explicit media type.
    pub fn new(bytes: impl Into<Bytes>, media_type: impl Into<String>) -> Self {
        RawManifest {
            bytes: bytes.into(),
            media_type: media_type.into(),
        }
    }

    /// Wraps `bytes`, taking the media type from the document itself.
    ///
    /// Documents without a `mediaType` field are treated as OCI indexes when
    /// they have a `manifests` array and as OCI image manifests otherwise.
    pub fn detect(bytes: impl Into<Bytes>) -> Result<Self, ManifestError> {
        let bytes = bytes.into();
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let media_type = match value.get("mediaType").and_then(|m| m.as_str()) {
            Some(m) => m.to_owned(),
            None if value.get("manifests").is_some() => wire::OCI_IMAGE_INDEX_MEDIA_TYPE.to_owned(),
            None => wire::OCI_IMAGE_MEDIA_TYPE.to_owned(),
        };
        Ok(RawManifest { bytes, media_type })
    }

    /// The sha256 digest of the bytes.
    pub fn digest(&self) -> Digest {
        Digest::sha256(&self.bytes)
    }

    /// True for manifest lists and OCI indexes.
    pub fn is_list(&self) -> bool {
        wire::is_manifest_list(&self.media_type)
    }

    /// Decodes the document according to its media type.
    pub fn parse(&self) -> Result<Manifest, ManifestError> {
        match self.media_type.as_str() {
            wire::IMAGE_MANIFEST_MEDIA_TYPE | wire::OCI_IMAGE_MEDIA_TYPE => {
                Ok(Manifest::Image(serde_json::from_slice(&self.bytes)?))
            }
            wire::IMAGE_MANIFEST_LIST_MEDIA_TYPE | wire::OCI_IMAGE_INDEX_MEDIA_TYPE => {
                Ok(Manifest::List(serde_json::from_slice(&self.bytes)?))
            }
            other => Err(ManifestError::UnsupportedMediaType(other.to_owned())),
        }
    }

    /// Returns a copy whose layer descriptors are replaced according to
    /// `replacements` (keyed by the old layer digest).
    ///
    /// The document is edited as JSON so fields this crate does not model
    /// are kept. Returns `None` when no layer matched.
    pub fn with_replaced_layers(
        &self,
        replacements: &HashMap<String, Descriptor>,
    ) -> Result<Option<RawManifest>, ManifestError> {
        let mut value: serde_json::Value = serde_json::from_slice(&self.bytes)?;
        let layers = value
            .get_mut("layers")
            .and_then(|l| l.as_array_mut())
            .ok_or_else(|| ManifestError::Shape("manifest has no layers array".to_owned()))?;
        let mut changed = false;
        for layer in layers.iter_mut() {
            let old = layer.get("digest").and_then(|d| d.as_str()).unwrap_or_default();
            if let Some(new) = replacements.get(old) {
                if new.digest == old {
                    continue;
                }
                layer["mediaType"] = new.media_type.clone().into();
                layer["digest"] = new.digest.clone().into();
                layer["size"] = new.size.into();
                changed = true;
            }
        }
        if !changed {
            return Ok(None);
        }
        Ok(Some(RawManifest {
            bytes: serde_json::to_vec(&value)?.into(),
            media_type: self.media_type.clone(),
        }))
    }

    /// Returns a copy of a list whose entries for rewritten instances point
    /// at the new manifests. `rewritten` maps old instance digests to the new
    /// digest and size.
    pub fn with_replaced_instances(
        &self,
        rewritten: &HashMap<String, (Digest, usize)>,
    ) -> Result<RawManifest, ManifestError> {
        if rewritten.is_empty() {
            return Ok(self.clone());
        }
        let mut value: serde_json::Value = serde_json::from_slice(&self.bytes)?;
        let entries = value
            .get_mut("manifests")
            .and_then(|m| m.as_array_mut())
            .ok_or_else(|| ManifestError::Shape("list has no manifests array".to_owned()))?;
        for entry in entries.iter_mut() {
            let old = entry.get("digest").and_then(|d| d.as_str()).unwrap_or_default();
            if let Some((digest, size)) = rewritten.get(old) {
                entry["digest"] = digest.to_string().into();
                entry["size"] = (*size).into();
            }
        }
        Ok(RawManifest {
            bytes: serde_json::to_vec(&value)?.into(),
            media_type: self.media_type.clone(),
        })
    }
}

/// Parses the digest of a descriptor.
pub fn descriptor_digest(descriptor: &Descriptor) -> Result<Digest, DigestError> {
    descriptor.digest.parse()
}

/// The platform of the running process, in the Go naming the registries use.
pub fn host_platform() -> Platform {
    let architecture = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        "arm" => "arm",
        other => other,
    };
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    Platform {
        architecture: architecture.to_owned(),
        os: os.to_owned(),
        variant: if architecture == "arm64" {
            Some("v8".to_owned())
        } else {
            None
        },
        ..Default::default()
    }
}

/// Parses `os/arch[/variant]`.
pub fn parse_platform(s: &str) -> Result<Platform, String> {
    let mut parts = s.split('/');
    let (os, architecture) = match (parts.next(), parts.next()) {
        (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => (os, arch),
        _ => return Err(format!("platform {:?} is not of the form os/arch[/variant]", s)),
    };
    let variant = parts.next().map(str::to_owned);
    if parts.next().is_some() {
        return Err(format!("platform {:?} has too many components", s));
    }
    Ok(Platform {
        os: os.to_owned(),
        architecture: architecture.to_owned(),
        variant,
        ..Default::default()
    })
}

/// Picks the list entry built for `wanted`.
///
/// OS and architecture must match. When `wanted` names a variant an entry
/// with the same variant is preferred; `arm64` entries without a variant are
/// taken as `v8`.
pub fn select_instance<'a>(index: &'a OciImageIndex, wanted: &Platform) -> Option<&'a ImageIndexEntry> {
    let candidates: Vec<&ImageIndexEntry> = index
        .manifests
        .iter()
        .filter(|e| {
            e.platform
                .as_ref()
                .map(|p| p.os == wanted.os && p.architecture == wanted.architecture)
                .unwrap_or(false)
        })
        .collect();
    let normalized_variant = |p: &Platform| -> Option<String> {
        match (&p.variant, p.architecture.as_str()) {
            (None, "arm64") => Some("v8".to_owned()),
            (v, _) => v.clone(),
        }
    };
    let wanted_variant = normalized_variant(wanted);
    candidates
        .iter()
        .find(|e| {
            e.platform.as_ref().map(normalized_variant).unwrap_or(None) == wanted_variant
        })
        .or_else(|| candidates.first())
        .copied()
}

#[cfg(test)]
mod test {
    use super::*;

    const IMAGE: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 2,
            "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar",
                "size": 10,
                "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111"
            }
        ],
        "x-vendor": {"kept": true}
    }"#;

    fn index(platforms: &[(&str, &str, Option<&str>)]) -> OciImageIndex {
        OciImageIndex {
            schema_version: 2,
            media_type: Some(wire::OCI_IMAGE_INDEX_MEDIA_TYPE.to_owned()),
            manifests: platforms
                .iter()
                .enumerate()
                .map(|(i, (os, arch, variant))| ImageIndexEntry {
                    media_type: wire::OCI_IMAGE_MEDIA_TYPE.to_owned(),
                    digest: format!("sha256:{:064}", i),
                    size: 1,
                    platform: Some(Platform {
                        os: os.to_string(),
                        architecture: arch.to_string(),
                        variant: variant.map(str::to_owned),
                        ..Default::default()
                    }),
                    annotations: None,
                })
                .collect(),
            annotations: None,
        }
    }

    #[test]
    fn parses_by_media_type() {
        let raw = RawManifest::new(IMAGE.as_bytes().to_vec(), wire::IMAGE_MANIFEST_MEDIA_TYPE);
        match raw.parse().expect("parsed") {
            Manifest::Image(m) => assert_eq!(m.layers.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        let unknown = RawManifest::new(IMAGE.as_bytes().to_vec(), "text/plain");
        assert!(matches!(
            unknown.parse(),
            Err(ManifestError::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn detect_reads_media_type_field() {
        let raw = RawManifest::detect(IMAGE.as_bytes().to_vec()).expect("json");
        assert_eq!(raw.media_type, wire::IMAGE_MANIFEST_MEDIA_TYPE);
        let index = RawManifest::detect(br#"{"schemaVersion":2,"manifests":[]}"#.to_vec())
            .expect("json");
        assert!(index.is_list());
    }

    #[test]
    fn replacing_layers_keeps_unknown_fields() {
        let raw = RawManifest::new(IMAGE.as_bytes().to_vec(), wire::IMAGE_MANIFEST_MEDIA_TYPE);
        let mut replacements = HashMap::new();
        replacements.insert(
            "sha256:1111111111111111111111111111111111111111111111111111111111111111".to_owned(),
            Descriptor {
                media_type: wire::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE.to_owned(),
                digest: "sha256:2222222222222222222222222222222222222222222222222222222222222222"
                    .to_owned(),
                size: 7,
                urls: None,
                annotations: None,
            },
        );
        let rewritten = raw
            .with_replaced_layers(&replacements)
            .expect("edited")
            .expect("changed");
        let value: serde_json::Value = serde_json::from_slice(&rewritten.bytes).expect("json");
        assert_eq!(value["x-vendor"]["kept"], true);
        assert_eq!(value["layers"][0]["size"], 7);
        assert_ne!(rewritten.digest(), raw.digest());

        assert!(raw
            .with_replaced_layers(&HashMap::new())
            .expect("edited")
            .is_none());
    }

    #[test]
    fn selects_matching_platform() {
        let idx = index(&[
            ("linux", "amd64", None),
            ("linux", "arm", Some("v6")),
            ("linux", "arm", Some("v7")),
            ("linux", "arm64", None),
        ]);
        let pick = |s: &str| {
            select_instance(&idx, &parse_platform(s).expect("platform"))
                .map(|e| e.digest.clone())
        };
        assert_eq!(pick("linux/amd64"), Some(idx.manifests[0].digest.clone()));
        assert_eq!(pick("linux/arm/v7"), Some(idx.manifests[2].digest.clone()));
        assert_eq!(pick("linux/arm64/v8"), Some(idx.manifests[3].digest.clone()));
        assert_eq!(pick("windows/amd64"), None);
    }

    #[test]
    fn platform_strings() {
        assert!(parse_platform("linux").is_err());
        assert!(parse_platform("linux/arm/v7/extra").is_err());
        let p = parse_platform("linux/arm/v7").expect("platform");
        assert_eq!(p.variant.as_deref(), Some("v7"));
    }
}
