use std::path::{Path, PathBuf};

use crate::reference::ImageReference;

/// Registry credentials supplied on the command line.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Keep passwords out of debug logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything the pull pipeline needs besides the reference itself.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Registry to talk to (taken from the reference)
    pub registry: String,
    pub credentials: Option<Credentials>,
    /// Where the finished archive is written
    pub output_path: PathBuf,
    /// Scratch directory the archive tree is built in
    pub work_dir: PathBuf,
    /// Maximum number of layers downloaded at once
    pub jobs: usize,
    /// Leave the working directory behind when the pull fails
    pub keep_work_dir: bool,
}

impl PullConfig {
    /// Build a config with the default output and working paths for `reference`.
    pub fn new(reference: &ImageReference) -> Self {
        let output_path = default_output_path(reference);
        let work_dir = default_work_dir(reference, &output_path);
        Self {
            registry: reference.registry.clone(),
            credentials: None,
            output_path,
            work_dir,
            jobs: 1,
            keep_work_dir: false,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Override the output path; the working directory follows it.
    pub fn with_output(mut self, reference: &ImageReference, output_path: PathBuf) -> Self {
        self.work_dir = default_work_dir(reference, &output_path);
        self.output_path = output_path;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn keep_work_dir(mut self, keep: bool) -> Self {
        self.keep_work_dir = keep;
        self
    }
}

/// `<repository>_<image>.tar` in the current directory.
pub fn default_output_path(reference: &ImageReference) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}.tar",
        sanitize(&reference.repository),
        sanitize(&reference.image)
    ))
}

/// `tmp_<image>_<tag>` next to the output file, so the final rename stays on
/// one filesystem.
fn default_work_dir(reference: &ImageReference, output_path: &Path) -> PathBuf {
    let name = format!(
        "tmp_{}_{}",
        sanitize(&reference.image),
        sanitize(reference.tag_or_digest())
    );
    match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
        _ => PathBuf::from(name),
    }
}

fn sanitize(s: &str) -> String {
    s.replace(|c: char| !c.is_alphanumeric() && c != '-' && c != '.', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let r = ImageReference::parse("hello-world").unwrap();
        let cfg = PullConfig::new(&r);
        assert_eq!(cfg.registry, "registry-1.docker.io");
        assert_eq!(cfg.output_path, PathBuf::from("library_hello-world.tar"));
        assert_eq!(cfg.work_dir, PathBuf::from("tmp_hello-world_latest"));
        assert_eq!(cfg.jobs, 1);
        assert!(cfg.credentials.is_none());
    }

    #[test]
    fn test_digest_and_nested_repo_are_sanitized() {
        let r = ImageReference::parse("ghcr.io/org/team/app@sha256:abc").unwrap();
        let cfg = PullConfig::new(&r);
        assert_eq!(cfg.output_path, PathBuf::from("org_team_app.tar"));
        assert_eq!(cfg.work_dir, PathBuf::from("tmp_app_sha256_abc"));
    }

    #[test]
    fn test_work_dir_follows_output() {
        let r = ImageReference::parse("alpine:3").unwrap();
        let cfg = PullConfig::new(&r).with_output(&r, PathBuf::from("/data/out/alpine.tar"));
        assert_eq!(cfg.work_dir, PathBuf::from("/data/out/tmp_alpine_3"));
    }

    #[test]
    fn test_jobs_is_at_least_one() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(PullConfig::new(&r).with_jobs(0).jobs, 1);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let c = Credentials::new("bob", "hunter2");
        let s = format!("{c:?}");
        assert!(s.contains("bob"));
        assert!(!s.contains("hunter2"));
    }
}
