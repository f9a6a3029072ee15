//! An OCI Distribution client for moving manifests and blobs between an OCI
//! compliant remote store and the caller.
#![cfg_attr(not(test), deny(missing_docs))]

pub mod client;
pub mod errors;
pub mod manifest;
mod reference;
pub mod secrets;
mod token_cache;

#[doc(inline)]
pub use client::Client;
#[doc(inline)]
pub use reference::{ParseError, Reference};
#[doc(inline)]
pub use token_cache::RegistryOperation;

/// Computes the `sha256:` prefixed digest of a byte slice
pub fn sha256_digest(bytes: &[u8]) -> String {
    use sha2::Digest;
    format!("sha256:{:x}", sha2::Sha256::digest(bytes))
}
