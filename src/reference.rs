//! Image reference parsing.
//!
//! Splits `[registry/][repository/]image[:tag|@digest]` into its components,
//! filling in Docker Hub defaults for whatever is omitted.

use std::fmt;

use crate::error::{PullError, Result};

/// Registry used when the reference names none.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Repository namespace used when the reference names none.
pub const DEFAULT_REPOSITORY: &str = "library";

/// Tag used when the reference carries neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Hostnames that users type for Docker Hub but which don't serve the v2 API.
const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io"];

/// What the reference pins: a mutable tag or an immutable digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tag(String),
    Digest(String),
}

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, possibly with a port (e.g. `localhost:5000`)
    pub registry: String,
    /// Repository path in front of the image name (e.g. `library`, `org/team`)
    pub repository: String,
    /// Image name (last path segment)
    pub image: String,
    pub target: Target,
}

impl ImageReference {
    /// Parse a reference string.
    ///
    /// - `hello-world` → registry-1.docker.io / library / hello-world : latest
    /// - `abc/hello-world:1` → registry-1.docker.io / abc / hello-world : 1
    /// - `mcr.microsoft.com/lib/hello-world@sha256:…` → digest-pinned
    ///
    /// A leading segment is only treated as a registry if it contains a `.` or
    /// a `:`, so `library/foo` stays on Docker Hub.
    pub fn parse(reference: &str) -> Result<Self> {
        let trimmed = reference.trim();
        let invalid = |reason: &str| PullError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("empty reference"));
        }

        let mut segments: Vec<&str> = trimmed.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty path segment"));
        }

        // `split` always yields at least one segment
        let last = segments.pop().unwrap_or_default();
        let (image, target) = if let Some((image, digest)) = last.split_once('@') {
            if digest.is_empty() {
                return Err(invalid("empty digest after '@'"));
            }
            (image, Target::Digest(digest.to_string()))
        } else if let Some((image, tag)) = last.rsplit_once(':') {
            if tag.is_empty() {
                return Err(invalid("empty tag after ':'"));
            }
            (image, Target::Tag(tag.to_string()))
        } else {
            (last, Target::Tag(DEFAULT_TAG.to_string()))
        };

        if image.is_empty() {
            return Err(invalid("no image name"));
        }

        let registry = match segments.first() {
            Some(first) if first.contains('.') || first.contains(':') => {
                let host = segments.remove(0);
                if DOCKER_HUB_ALIASES.contains(&host) {
                    DEFAULT_REGISTRY.to_string()
                } else {
                    host.to_string()
                }
            }
            _ => DEFAULT_REGISTRY.to_string(),
        };

        let repository = if segments.is_empty() {
            DEFAULT_REPOSITORY.to_string()
        } else {
            segments.join("/")
        };

        Ok(ImageReference {
            registry,
            repository,
            image: image.to_string(),
            target,
        })
    }

    /// Repository name as used in registry API paths: `<repository>/<image>`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.repository, self.image)
    }

    /// The tag, or the digest for digest-pinned references.
    pub fn tag_or_digest(&self) -> &str {
        match &self.target {
            Target::Tag(tag) => tag,
            Target::Digest(digest) => digest,
        }
    }

    pub fn is_default_registry(&self) -> bool {
        self.registry == DEFAULT_REGISTRY
    }

    /// Fully-qualified name, tag or digest. Docker Hub images keep the short
    /// `repository/image:tag` form that `docker load` expects.
    pub fn repo_tag(&self) -> String {
        let name = if self.is_default_registry() {
            self.name()
        } else {
            format!("{}/{}", self.registry, self.name())
        };
        match &self.target {
            Target::Tag(tag) => format!("{name}:{tag}"),
            Target::Digest(digest) => format!("{name}@{digest}"),
        }
    }

    /// `RepoTags` for the archive's `manifest.json`.
    ///
    /// `docker load` only accepts `name:tag` there, so a digest-pinned pull
    /// is written untagged.
    pub fn load_tags(&self) -> Vec<String> {
        match self.target {
            Target::Tag(_) => vec![self.repo_tag()],
            Target::Digest(_) => Vec::new(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = match self.target {
            Target::Tag(_) => ':',
            Target::Digest(_) => '@',
        };
        write!(
            f,
            "{}/{}{}{}",
            self.registry,
            self.name(),
            sep,
            self.tag_or_digest()
        )
    }
}
