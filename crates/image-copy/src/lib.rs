//! A transfer engine for container images.
//!
//! `image-copy` reads an image (manifest, config and layer blobs, and
//! optionally a multi-platform manifest list with its signatures) from one
//! location and writes it to another. Locations are given as locator strings
//! such as `docker://quay.io/org/app:v1`, `dir:/tmp/app`,
//! `docker-archive:/tmp/app.tar:app:v1` or `docker-daemon:app:v1`.
//!
//! The entry point is [`copy_image`]:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use image_copy::{copy_image, CopyOptions, CredentialBroker, TransportContext, TrustPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), image_copy::CopyError> {
//! let context = TransportContext::new(Arc::new(CredentialBroker::anonymous()));
//! let result = copy_image(
//!     "docker://docker.io/library/alpine:3.18",
//!     "dir:/tmp/alpine",
//!     &TrustPolicy::accept_anything(),
//!     &CopyOptions::default(),
//!     &context,
//!     CancellationToken::new(),
//! )
//! .await?;
//! println!("{}", result.manifest_digest);
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

pub mod blob;
pub mod compression;
pub mod config;
pub mod copy;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod policy;
pub mod reference;
pub mod transport;

pub use copy::{copy_between, copy_image, CopyOptions, CopyResult, ImageListSelection};
pub use credentials::{CredentialBroker, CredentialProvider};
pub use error::{CopyError, CopyErrorKind, CopyPhase};
pub use policy::{PolicyRequirement, TrustPolicy};
pub use reference::{resolve, ImageReference};
pub use transport::TransportContext;
