use std::convert::TryFrom;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

/// NAME_TOTAL_LENGTH_MAX is the maximum total number of characters in a repository name.
const NAME_TOTAL_LENGTH_MAX: usize = 255;

const DOCKER_HUB_DOMAIN: &str = "docker.io";
const DOCKER_HUB_LEGACY_DOMAIN: &str = "index.docker.io";
const DOCKER_HUB_OFFICIAL_REPO_PREFIX: &str = "library/";

lazy_static! {
    // Grammar from github.com/distribution/reference, anchored.
    static ref REFERENCE_REGEX: Regex = Regex::new(concat!(
        r"^((?:(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])",
        r"(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*(?::[0-9]+)?/)?",
        r"[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*",
        r"(?:/[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*)*)",
        r"(?::([\w][\w.-]{0,127}))?",
        r"(?:@([A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}))?$"
    ))
    .expect("reference grammar is a valid regex");
    static ref TAG_REGEX: Regex =
        Regex::new(r"^[\w][\w.-]{0,127}$").expect("tag grammar is a valid regex");
}

/// Errors produced while parsing an image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The digest part is not `algorithm:hex`
    DigestInvalidFormat,
    /// Repository names must be lowercase
    NameContainsUppercase,
    /// No repository name was given
    NameEmpty,
    /// The repository name is longer than the allowed maximum
    NameTooLong,
    /// The string does not follow the reference grammar
    ReferenceInvalidFormat,
    /// The tag part is not a valid tag
    TagInvalidFormat,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestInvalidFormat => write!(f, "invalid digest format"),
            ParseError::NameContainsUppercase => write!(f, "repository name must be lowercase"),
            ParseError::NameEmpty => write!(f, "repository name must have at least one component"),
            ParseError::NameTooLong => write!(
                f,
                "repository name must not be more than {} characters",
                NAME_TOTAL_LENGTH_MAX
            ),
            ParseError::ReferenceInvalidFormat => write!(f, "invalid reference format"),
            ParseError::TagInvalidFormat => write!(f, "invalid tag format"),
        }
    }
}

impl Error for ParseError {}

/// Reference provides a general type to represent any way of referencing images within an OCI registry.
///
/// Short names are normalized the way Docker does it, so `alpine` and
/// `docker.io/library/alpine` parse to the same reference.
///
/// # Examples
///
/// Parsing a tagged image reference:
///
/// ```
/// use oci_distribution::Reference;
///
/// let reference: Reference = "docker.io/library/hello-world:latest".parse().unwrap();
///
/// assert_eq!("docker.io/library/hello-world:latest", reference.whole().as_str());
/// assert_eq!("docker.io", reference.registry());
/// assert_eq!("library/hello-world", reference.repository());
/// assert_eq!(Some("latest"), reference.tag());
/// assert_eq!(None, reference.digest());
/// ```
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    /// registry returns the name of the registry.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// resolve_registry returns the host that serves the registry API.
    ///
    /// Docker Hub is addressed as `docker.io` in references but answers on
    /// `index.docker.io`.
    pub fn resolve_registry(&self) -> &str {
        match self.registry.as_str() {
            DOCKER_HUB_DOMAIN => DOCKER_HUB_LEGACY_DOMAIN,
            other => other,
        }
    }

    /// repository returns the name of the repository.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// tag returns the object's tag, if present.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// digest returns the object's digest, if present.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Returns the same repository addressed by `digest` instead of a tag.
    pub fn clone_with_digest(&self, digest: &str) -> Self {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_owned()),
        }
    }

    /// Returns the same repository addressed by `tag`.
    pub fn clone_with_tag(&self, tag: &str) -> Result<Self, ParseError> {
        if !TAG_REGEX.is_match(tag) {
            return Err(ParseError::TagInvalidFormat);
        }
        Ok(Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_owned()),
            digest: None,
        })
    }

    /// full_name returns the registry and repository joined by a slash.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// whole returns the whole reference.
    pub fn whole(&self) -> String {
        let mut s = self.full_name();
        if let Some(t) = self.tag() {
            s.push(':');
            s.push_str(t);
        }
        if let Some(d) = self.digest() {
            s.push('@');
            s.push_str(d);
        }
        s
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::try_from(s)
    }
}

impl TryFrom<String> for Reference {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        TryFrom::try_from(s.as_str())
    }
}

impl TryFrom<&str> for Reference {
    type Error = ParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() {
            return Err(ParseError::NameEmpty);
        }
        let captures = match REFERENCE_REGEX.captures(s) {
            Some(c) => c,
            None => return Err(classify_failure(s)),
        };
        let name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let (registry, repository) = split_domain(name);
        if repository.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ParseError::NameTooLong);
        }

        Ok(Reference {
            registry,
            repository,
            tag: captures.get(2).map(|m| m.as_str().to_owned()),
            digest: captures.get(3).map(|m| m.as_str().to_owned()),
        })
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        reference.whole()
    }
}

/// Splits a name into its registry domain and repository path, applying the
/// Docker Hub defaults.
fn split_domain(name: &str) -> (String, String) {
    let (domain, remainder) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_owned(), rest.to_owned())
        }
        _ => (DOCKER_HUB_DOMAIN.to_owned(), name.to_owned()),
    };
    let domain = if domain == DOCKER_HUB_LEGACY_DOMAIN {
        DOCKER_HUB_DOMAIN.to_owned()
    } else {
        domain
    };
    let remainder = if domain == DOCKER_HUB_DOMAIN && !remainder.contains('/') {
        format!("{}{}", DOCKER_HUB_OFFICIAL_REPO_PREFIX, remainder)
    } else {
        remainder
    };
    (domain, remainder)
}

/// Works out which part of an unparseable reference is at fault.
fn classify_failure(s: &str) -> ParseError {
    let (name, digest) = match s.split_once('@') {
        Some((n, d)) => (n, Some(d)),
        None => (s, None),
    };
    if let Some(d) = digest {
        let valid = d
            .split_once(':')
            .map(|(alg, hex)| {
                !alg.is_empty()
                    && hex.len() >= 32
                    && hex.chars().all(|c| c.is_ascii_hexdigit())
            })
            .unwrap_or(false);
        if !valid {
            return ParseError::DigestInvalidFormat;
        }
    }
    let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    let path = match name[last_slash..].rfind(':') {
        Some(i) => {
            if !TAG_REGEX.is_match(&name[last_slash + i + 1..]) {
                return ParseError::TagInvalidFormat;
            }
            &name[..last_slash + i]
        }
        None => name,
    };
    if path.is_empty() || path.ends_with('/') {
        return ParseError::NameEmpty;
    }
    let repository = path.split_once('/').map(|(_, r)| r).unwrap_or(path);
    if repository.chars().any(|c| c.is_ascii_uppercase()) {
        return ParseError::NameContainsUppercase;
    }
    ParseError::ReferenceInvalidFormat
}

#[cfg(test)]
mod test {
    use super::*;

    mod parse {
        use super::*;
        use rstest::rstest;

        const DIGEST: &str =
            "sha256:f29dba55022eec8c0ce1cbfaaed45f2352ab3fbbb1cdcd5ea30ca3513deb70c9";

        fn must_parse(image: &str) -> Reference {
            Reference::try_from(image).expect("could not parse reference")
        }

        #[rstest(input, registry, repository, tag, digest,
            case("quay.io/hello:v1", "quay.io", "hello", Some("v1"), None),
            case("quay.io/hello", "quay.io", "hello", None, None),
            case("localhost:5000/team/app:1.0", "localhost:5000", "team/app", Some("1.0"), None),
            case("localhost/app", "localhost", "app", None, None),
            case("alpine", "docker.io", "library/alpine", None, None),
            case("alpine:3.18", "docker.io", "library/alpine", Some("3.18"), None),
            case("someuser/app", "docker.io", "someuser/app", None, None),
            case("index.docker.io/library/busybox", "docker.io", "library/busybox", None, None),
            case("someendpoint/alpine", "docker.io", "someendpoint/alpine", None, None),
        )]
        fn parses_components(
            input: &str,
            registry: &str,
            repository: &str,
            tag: Option<&str>,
            digest: Option<&str>,
        ) {
            let reference = must_parse(input);
            assert_eq!(reference.registry(), registry);
            assert_eq!(reference.repository(), repository);
            assert_eq!(reference.tag(), tag);
            assert_eq!(reference.digest(), digest);
        }

        #[test]
        fn digest_only() {
            let reference = must_parse(&format!("alpine@{}", DIGEST));
            assert_eq!(reference.repository(), "library/alpine");
            assert_eq!(reference.digest(), Some(DIGEST));
            assert_eq!(reference.tag(), None);
        }

        #[test]
        fn tag_and_digest() {
            let reference = must_parse(&format!("quay.io/hello:v1@{}", DIGEST));
            assert_eq!(reference.tag(), Some("v1"));
            assert_eq!(reference.digest(), Some(DIGEST));
        }

        #[test]
        fn whole_round_trips() {
            for input in &[
                "alpine",
                "quay.io/org/app:v2",
                "localhost:5000/a/b/c@sha256:f29dba55022eec8c0ce1cbfaaed45f2352ab3fbbb1cdcd5ea30ca3513deb70c9",
            ] {
                let reference = must_parse(input);
                assert_eq!(must_parse(&reference.whole()), reference);
            }
        }

        #[test]
        fn docker_hub_resolves_to_index() {
            assert_eq!(must_parse("alpine").resolve_registry(), "index.docker.io");
            assert_eq!(must_parse("ghcr.io/a/b").resolve_registry(), "ghcr.io");
        }

        #[test]
        fn name_too_long() {
            assert_eq!(
                Reference::try_from(format!(
                    "quay.io/{}",
                    (0..256).map(|_| "a").collect::<String>()
                ))
                .err(),
                Some(ParseError::NameTooLong)
            );
        }

        #[rstest(input, expected,
            case("", ParseError::NameEmpty),
            case("quay.io/Org/App", ParseError::NameContainsUppercase),
            case("quay.io/app:-bad", ParseError::TagInvalidFormat),
            case("quay.io/app@sha256:xyz", ParseError::DigestInvalidFormat),
            case("quay.io/app@", ParseError::DigestInvalidFormat),
        )]
        fn rejects_malformed(input: &str, expected: ParseError) {
            assert_eq!(Reference::try_from(input).err(), Some(expected));
        }

        #[test]
        fn clone_with_tag_validates() {
            let reference = must_parse("quay.io/app:v1");
            let sig = reference
                .clone_with_tag("sha256-abc.sig")
                .expect("valid tag");
            assert_eq!(sig.whole(), "quay.io/app:sha256-abc.sig");
            assert!(reference.clone_with_tag(".bad").is_err());
        }
    }
}
