//! Image locators and their parsed form.
//!
//! A locator is a transport prefix followed by a transport specific part:
//!
//! | locator                          | transport |
//! |----------------------------------|-----------|
//! | `docker://quay.io/org/app:v1`    | registry  |
//! | `dir:/var/tmp/app`               | directory |
//! | `docker-daemon:app:v1`           | daemon    |
//! | `docker-archive:/tmp/app.tar:app:v1` | archive |
use std::convert::TryFrom;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::digest::{Digest, DigestError};

/// A registry style reference, normalized the way Docker does it.
pub type DockerReference = oci_distribution::Reference;

const REGISTRY_PREFIX: &str = "docker://";
const DIRECTORY_PREFIX: &str = "dir:";
const DAEMON_PREFIX: &str = "docker-daemon:";
const ARCHIVE_PREFIX: &str = "docker-archive:";

/// Errors produced while resolving a locator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The locator does not start with a known transport prefix.
    #[error("locator {0:?} has no recognized transport prefix")]
    UnknownTransport(String),
    /// A `dir:` or `docker-archive:` locator without a path.
    #[error("{0} locator has an empty path")]
    EmptyPath(TransportKind),
    /// The repository, tag or digest part is malformed.
    #[error("invalid reference {locator:?}: {source}")]
    InvalidReference {
        /// The offending part of the locator
        locator: String,
        /// What the reference grammar rejected
        source: oci_distribution::ParseError,
    },
    /// A daemon image id is not a valid digest.
    #[error(transparent)]
    InvalidDigest(#[from] DigestError),
    /// The transport cannot address images by digest.
    #[error("{0} references can not contain a digest")]
    DigestNotAllowed(TransportKind),
    /// The transport needs a tag to name the image.
    #[error("{0} reference {1:?} has neither a tag nor a digest")]
    MissingTag(TransportKind, String),
}

/// The kinds of storage an image can be copied from or to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// A registry speaking the distribution API
    Registry,
    /// A local directory
    Directory,
    /// The local container daemon
    Daemon,
    /// A `docker save` tarball
    Archive,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Registry => "docker",
            TransportKind::Directory => "dir",
            TransportKind::Daemon => "docker-daemon",
            TransportKind::Archive => "docker-archive",
        };
        f.write_str(name)
    }
}

/// How an image is named inside the local daemon.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DaemonReference {
    /// A tagged repository name
    Named(DockerReference),
    /// An image id (`sha256:...`)
    ImageId(Digest),
}

/// A parsed image locator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImageReference {
    /// `docker://` images in a registry
    Registry(DockerReference),
    /// `dir:` images laid out in a directory
    Directory(PathBuf),
    /// `docker-daemon:` images held by the local daemon
    Daemon(DaemonReference),
    /// `docker-archive:` images inside a `docker save` tarball
    Archive {
        /// Where the tarball lives
        path: PathBuf,
        /// Which image of the tarball, or the tag to write
        reference: Option<DockerReference>,
    },
}

impl ImageReference {
    /// The transport this reference belongs to.
    pub fn transport(&self) -> TransportKind {
        match self {
            ImageReference::Registry(_) => TransportKind::Registry,
            ImageReference::Directory(_) => TransportKind::Directory,
            ImageReference::Daemon(_) => TransportKind::Daemon,
            ImageReference::Archive { .. } => TransportKind::Archive,
        }
    }

    /// The digest this reference pins its manifest to, if any.
    pub fn pinned_digest(&self) -> Option<Result<Digest, DigestError>> {
        match self {
            ImageReference::Registry(r) => r.digest().map(str::parse),
            _ => None,
        }
    }

    /// Trust policy scopes that cover this reference, most specific first.
    ///
    /// Registry names yield the repository, then each enclosing namespace and
    /// finally the host. Paths yield the path and then its ancestors.
    pub fn policy_scopes(&self) -> Vec<String> {
        match self {
            ImageReference::Registry(r) | ImageReference::Daemon(DaemonReference::Named(r)) => {
                repository_scopes(r)
            }
            ImageReference::Directory(path) | ImageReference::Archive { path, .. } => {
                path_scopes(path)
            }
            ImageReference::Daemon(DaemonReference::ImageId(_)) => vec![],
        }
    }
}

fn repository_scopes(r: &DockerReference) -> Vec<String> {
    let mut scopes = vec![];
    let mut name = r.full_name();
    scopes.push(name.clone());
    while let Some(idx) = name.rfind('/') {
        name.truncate(idx);
        scopes.push(name.clone());
    }
    scopes
}

fn path_scopes(path: &Path) -> Vec<String> {
    path.ancestors()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().into_owned())
        .collect()
}

/// Parses a locator string into an [`ImageReference`].
///
/// This is pure: the same string always yields the same reference, and the
/// `Display` form of the result resolves back to an equal reference.
pub fn resolve(locator: &str) -> Result<ImageReference, ParseError> {
    if let Some(rest) = locator.strip_prefix(REGISTRY_PREFIX) {
        return Ok(ImageReference::Registry(parse_docker(rest)?));
    }
    if let Some(rest) = locator.strip_prefix(DIRECTORY_PREFIX) {
        if rest.is_empty() {
            return Err(ParseError::EmptyPath(TransportKind::Directory));
        }
        return Ok(ImageReference::Directory(PathBuf::from(rest)));
    }
    if let Some(rest) = locator.strip_prefix(DAEMON_PREFIX) {
        return resolve_daemon(rest).map(ImageReference::Daemon);
    }
    if let Some(rest) = locator.strip_prefix(ARCHIVE_PREFIX) {
        return resolve_archive(rest);
    }
    Err(ParseError::UnknownTransport(locator.to_owned()))
}

fn parse_docker(s: &str) -> Result<DockerReference, ParseError> {
    DockerReference::try_from(s).map_err(|source| ParseError::InvalidReference {
        locator: s.to_owned(),
        source,
    })
}

fn resolve_daemon(rest: &str) -> Result<DaemonReference, ParseError> {
    if rest.starts_with("sha256:") {
        return Ok(DaemonReference::ImageId(rest.parse()?));
    }
    let r = parse_docker(rest)?;
    if r.digest().is_some() {
        return Err(ParseError::DigestNotAllowed(TransportKind::Daemon));
    }
    if r.tag().is_none() {
        return Err(ParseError::MissingTag(TransportKind::Daemon, rest.to_owned()));
    }
    Ok(DaemonReference::Named(r))
}

/// Splits `path[:reference]` at the first colon. Archive paths containing a
/// colon can not be expressed; the text after it is always read as the
/// reference.
fn resolve_archive(rest: &str) -> Result<ImageReference, ParseError> {
    let (path, reference) = match rest.split_once(':') {
        Some((path, reference)) => (path, Some(reference)),
        None => (rest, None),
    };
    if path.is_empty() {
        return Err(ParseError::EmptyPath(TransportKind::Archive));
    }
    let reference = match reference {
        Some(r) => {
            let r = parse_docker(r)?;
            if r.digest().is_some() {
                return Err(ParseError::DigestNotAllowed(TransportKind::Archive));
            }
            if r.tag().is_none() {
                return Err(ParseError::MissingTag(
                    TransportKind::Archive,
                    r.whole(),
                ));
            }
            Some(r)
        }
        None => None,
    };
    Ok(ImageReference::Archive {
        path: PathBuf::from(path),
        reference,
    })
}

impl FromStr for ImageReference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        resolve(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageReference::Registry(r) => write!(f, "{}{}", REGISTRY_PREFIX, r),
            ImageReference::Directory(path) => write!(f, "{}{}", DIRECTORY_PREFIX, path.display()),
            ImageReference::Daemon(DaemonReference::Named(r)) => {
                write!(f, "{}{}", DAEMON_PREFIX, r)
            }
            ImageReference::Daemon(DaemonReference::ImageId(d)) => {
                write!(f, "{}{}", DAEMON_PREFIX, d)
            }
            ImageReference::Archive { path, reference } => {
                write!(f, "{}{}", ARCHIVE_PREFIX, path.display())?;
                if let Some(r) = reference {
                    write!(f, ":{}", r)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest(locator,
        case("docker://alpine"),
        case("docker://quay.io/org/app:v1"),
        case("docker://alpine@sha256:48d9183eb12a05c99bcc0bf44a003607b8e941e1d4f41f9ad12bdcc4b5672f86"),
        case("dir:/var/tmp/app"),
        case("dir:relative/app"),
        case("docker-daemon:app:v1"),
        case("docker-daemon:sha256:48d9183eb12a05c99bcc0bf44a003607b8e941e1d4f41f9ad12bdcc4b5672f86"),
        case("docker-archive:/tmp/app.tar"),
        case("docker-archive:/tmp/app.tar:quay.io/org/app:v1"),
    )]
    fn display_round_trips(locator: &str) {
        let first = resolve(locator).expect("valid locator");
        assert_eq!(first, resolve(locator).expect("valid locator"));
        let again = resolve(&first.to_string()).expect("canonical form resolves");
        assert_eq!(first, again);
    }

    #[test]
    fn registry_references_are_normalized() {
        let r = resolve("docker://alpine").expect("valid locator");
        assert_eq!(r.transport(), TransportKind::Registry);
        assert_eq!(r.to_string(), "docker://docker.io/library/alpine");
    }

    #[test]
    fn archive_reference_is_optional() {
        match resolve("docker-archive:/tmp/app.tar:app:v2").expect("valid locator") {
            ImageReference::Archive { path, reference } => {
                assert_eq!(path, PathBuf::from("/tmp/app.tar"));
                assert_eq!(reference.expect("reference").tag(), Some("v2"));
            }
            other => panic!("unexpected reference {:?}", other),
        }
    }

    #[test]
    fn archive_paths_end_at_the_first_colon() {
        assert!(matches!(
            resolve("docker-archive:/tmp/build:/app.tar"),
            Err(ParseError::InvalidReference { .. })
        ));
        assert!(matches!(
            resolve("docker-archive:/tmp/odd:name.tar"),
            Err(ParseError::MissingTag(TransportKind::Archive, _))
        ));
        match resolve("docker-archive:/tmp/odd:name.tar:v1").expect("valid locator") {
            ImageReference::Archive { path, reference } => {
                assert_eq!(path, PathBuf::from("/tmp/odd"));
                assert_eq!(reference.expect("reference").tag(), Some("v1"));
            }
            other => panic!("unexpected reference {:?}", other),
        }
    }

    #[rstest(locator,
        case("alpine"),
        case("oci:/tmp/layout"),
        case(""),
    )]
    fn unknown_prefix(locator: &str) {
        assert!(matches!(
            resolve(locator),
            Err(ParseError::UnknownTransport(_))
        ));
    }

    #[test]
    fn malformed_parts_are_reported() {
        assert!(matches!(
            resolve("docker://quay.io/Org/App"),
            Err(ParseError::InvalidReference { .. })
        ));
        assert_eq!(
            resolve("dir:"),
            Err(ParseError::EmptyPath(TransportKind::Directory))
        );
        assert_eq!(
            resolve("docker-daemon:app"),
            Err(ParseError::MissingTag(TransportKind::Daemon, "app".to_owned()))
        );
        assert!(matches!(
            resolve("docker-daemon:sha256:abc"),
            Err(ParseError::InvalidDigest(_))
        ));
        assert_eq!(
            resolve("docker-archive:/tmp/a.tar:app@sha256:48d9183eb12a05c99bcc0bf44a003607b8e941e1d4f41f9ad12bdcc4b5672f86"),
            Err(ParseError::DigestNotAllowed(TransportKind::Archive))
        );
    }

    #[test]
    fn policy_scopes_run_from_specific_to_general() {
        let r = resolve("docker://quay.io/org/team/app:v1").expect("valid locator");
        assert_eq!(
            r.policy_scopes(),
            vec![
                "quay.io/org/team/app",
                "quay.io/org/team",
                "quay.io/org",
                "quay.io"
            ]
        );
        let d = resolve("dir:/var/tmp/app").expect("valid locator");
        assert_eq!(d.policy_scopes(), vec!["/var/tmp/app", "/var/tmp", "/var", "/"]);
    }
}
