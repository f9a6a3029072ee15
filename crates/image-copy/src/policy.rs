//! Deciding whether an image may be copied.
//!
//! A [`TrustPolicy`] is an ordered list of rules. The rule with the most
//! specific scope matching the source reference wins; see
//! [`ImageReference::policy_scopes`] for the scope order. Evaluation never
//! fails open: anything the evaluator can not check is a rejection.
use std::convert::TryFrom;
use std::fmt;

use chrono::{DateTime, Utc};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature as EcdsaSignature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::digest::Digest;
use crate::reference::{DaemonReference, DockerReference, ImageReference};

/// What a rule demands of an image.
#[derive(Clone, Debug)]
pub enum PolicyRequirement {
    /// Refuse the image
    Reject,
    /// Accept the image without looking at it
    InsecureAcceptAnything,
    /// Accept the image only with a valid signature by one of these keys
    SignedBy(KeySet),
}

/// Where a rule applies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyScope {
    /// Anything no other rule matches
    Default,
    /// A repository, namespace, host or path, as produced by
    /// [`ImageReference::policy_scopes`]
    Scope(String),
}

/// A scope with its requirement.
#[derive(Clone, Debug)]
pub struct PolicyRule {
    /// Where the rule applies
    pub scope: PolicyScope,
    /// What it demands
    pub requirement: PolicyRequirement,
}

/// A set of public keys trusted to sign images.
#[derive(Clone, Debug, Default)]
pub struct KeySet {
    /// The keys
    pub keys: Vec<TrustedKey>,
}

/// A P-256 public key.
#[derive(Clone)]
pub struct TrustedKey {
    /// Identifier signatures may name
    pub key_id: String,
    /// The key
    pub key: VerifyingKey,
    /// After this instant signatures by the key are not trusted
    pub not_after: Option<DateTime<Utc>>,
}

impl fmt::Debug for TrustedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedKey")
            .field("key_id", &self.key_id)
            .field("not_after", &self.not_after)
            .finish()
    }
}

impl TrustedKey {
    /// Wraps an already parsed key.
    pub fn new(key_id: &str, key: VerifyingKey) -> Self {
        TrustedKey {
            key_id: key_id.to_owned(),
            key,
            not_after: None,
        }
    }

    /// Parses a `PUBLIC KEY` PEM document.
    pub fn from_pem(key_id: &str, pem: &str) -> Result<Self, String> {
        let key = VerifyingKey::from_public_key_pem(pem).map_err(|e| e.to_string())?;
        Ok(Self::new(key_id, key))
    }

    /// Stops trusting the key after `not_after`.
    pub fn expiring(mut self, not_after: DateTime<Utc>) -> Self {
        self.not_after = Some(not_after);
        self
    }
}

/// A detached signature over a simple signing payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    /// The signed JSON document
    pub payload: Vec<u8>,
    /// DER encoded ECDSA P-256 signature over `payload`
    pub signature: Vec<u8>,
    /// The signing key, if the signature names it
    pub key_id: Option<String>,
}

/// The outcome of a policy check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The image may be copied
    Admitted,
    /// The image may not be copied, and why
    Rejected(String),
}

#[derive(Serialize, Deserialize)]
struct SimpleSigning {
    critical: Critical,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    optional: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
struct Critical {
    identity: Identity,
    image: Image,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize, Deserialize)]
struct Identity {
    #[serde(rename = "docker-reference")]
    docker_reference: String,
}

#[derive(Serialize, Deserialize)]
struct Image {
    #[serde(rename = "docker-manifest-digest")]
    docker_manifest_digest: String,
}

/// Builds a simple signing payload binding `reference` to `manifest_digest`.
pub fn simple_signing_payload(reference: &str, manifest_digest: &Digest) -> Vec<u8> {
    let doc = SimpleSigning {
        critical: Critical {
            identity: Identity {
                docker_reference: reference.to_owned(),
            },
            image: Image {
                docker_manifest_digest: manifest_digest.to_string(),
            },
            kind: "atomic container signature".to_owned(),
        },
        optional: None,
    };
    // Serializing plain strings can not fail.
    serde_json::to_vec(&doc).unwrap_or_default()
}

/// An ordered set of rules.
#[derive(Clone, Debug, Default)]
pub struct TrustPolicy {
    rules: Vec<PolicyRule>,
}

impl TrustPolicy {
    /// A policy with the given rules.
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        TrustPolicy { rules }
    }

    /// A policy that admits every image.
    pub fn accept_anything() -> Self {
        Self::new(vec![PolicyRule {
            scope: PolicyScope::Default,
            requirement: PolicyRequirement::InsecureAcceptAnything,
        }])
    }

    /// The requirement that applies to `reference`, if any rule matches.
    pub fn requirement_for(&self, reference: &ImageReference) -> Option<&PolicyRequirement> {
        reference
            .policy_scopes()
            .iter()
            .find_map(|scope| {
                self.rules
                    .iter()
                    .find(|r| matches!(&r.scope, PolicyScope::Scope(s) if s == scope))
            })
            .or_else(|| self.rules.iter().find(|r| r.scope == PolicyScope::Default))
            .map(|r| &r.requirement)
    }

    /// Returns true if admitting `reference` requires its signatures.
    pub fn needs_signatures(&self, reference: &ImageReference) -> bool {
        matches!(
            self.requirement_for(reference),
            Some(PolicyRequirement::SignedBy(_))
        )
    }

    /// Decides whether the image named by `reference`, whose manifest is
    /// `manifest`, may be copied.
    #[instrument(level = "info", skip(self, manifest, signatures), fields(signatures = signatures.len()))]
    pub fn admit(
        &self,
        reference: &ImageReference,
        manifest: &[u8],
        signatures: &[Signature],
    ) -> Admission {
        let admission = match self.requirement_for(reference) {
            None => Admission::Rejected(format!("no policy rule applies to {}", reference)),
            Some(PolicyRequirement::Reject) => {
                Admission::Rejected(format!("policy rejects {}", reference))
            }
            Some(PolicyRequirement::InsecureAcceptAnything) => Admission::Admitted,
            Some(PolicyRequirement::SignedBy(keys)) => {
                keys.admit(identity_of(reference), manifest, signatures, Utc::now())
            }
        };
        debug!(?admission, "trust policy evaluated");
        admission
    }
}

fn identity_of(reference: &ImageReference) -> Option<&DockerReference> {
    match reference {
        ImageReference::Registry(r) => Some(r),
        ImageReference::Daemon(DaemonReference::Named(r)) => Some(r),
        ImageReference::Archive { reference, .. } => reference.as_ref(),
        _ => None,
    }
}

impl KeySet {
    /// A set of the given keys.
    pub fn new(keys: Vec<TrustedKey>) -> Self {
        KeySet { keys }
    }

    fn admit(
        &self,
        identity: Option<&DockerReference>,
        manifest: &[u8],
        signatures: &[Signature],
        now: DateTime<Utc>,
    ) -> Admission {
        if signatures.is_empty() {
            return Admission::Rejected("image is not signed".to_owned());
        }
        let mut reasons = Vec::with_capacity(signatures.len());
        for signature in signatures {
            match self.check(identity, manifest, signature, now) {
                Ok(()) => return Admission::Admitted,
                Err(reason) => reasons.push(reason),
            }
        }
        Admission::Rejected(format!("no valid signature: {}", reasons.join("; ")))
    }

    fn check(
        &self,
        identity: Option<&DockerReference>,
        manifest: &[u8],
        signature: &Signature,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let candidates: Vec<&TrustedKey> = match &signature.key_id {
            Some(id) => self.keys.iter().filter(|k| &k.key_id == id).collect(),
            None => self.keys.iter().collect(),
        };
        if candidates.is_empty() {
            return Err(match &signature.key_id {
                Some(id) => format!("unknown key {}", id),
                None => "no trusted keys".to_owned(),
            });
        }
        let parsed = EcdsaSignature::from_der(&signature.signature)
            .map_err(|_| "malformed signature".to_owned())?;

        let mut last = String::new();
        for key in candidates {
            if matches!(key.not_after, Some(at) if at < now) {
                last = format!("key {} has expired", key.key_id);
                continue;
            }
            if key.key.verify(&signature.payload, &parsed).is_err() {
                last = format!("signature does not verify with key {}", key.key_id);
                continue;
            }
            return check_payload(identity, manifest, &signature.payload);
        }
        Err(last)
    }
}

fn check_payload(
    identity: Option<&DockerReference>,
    manifest: &[u8],
    payload: &[u8],
) -> Result<(), String> {
    let doc: SimpleSigning =
        serde_json::from_slice(payload).map_err(|e| format!("malformed payload: {}", e))?;
    let signed: Digest = doc
        .critical
        .image
        .docker_manifest_digest
        .parse()
        .map_err(|e| format!("malformed payload: {}", e))?;
    if Digest::of(signed.algorithm(), manifest) != signed {
        return Err(format!("signature is for manifest {}", signed));
    }
    if let Some(expected) = identity {
        let claimed = DockerReference::try_from(doc.critical.identity.docker_reference.as_str())
            .map_err(|e| format!("malformed identity: {}", e))?;
        if claimed.full_name() != expected.full_name() {
            return Err(format!(
                "signature identity {} does not match {}",
                claimed.full_name(),
                expected.full_name()
            ));
        }
    }
    Ok(())
}
