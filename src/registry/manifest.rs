//! Manifest resolution.
//!
//! A tag either resolves to a single schema-2 manifest or, for
//! multi-platform images, to a manifest list. The list is a terminal outcome:
//! no platform is picked on the user's behalf.

use oci_spec::image::Platform;
use serde::Deserialize;

use super::RegistrySession;
use super::manifest_url;
use crate::error::{PlatformChoice, PullError, Result};
use crate::reference::ImageReference;

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";

/// A content descriptor (config or layer).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: Option<String>,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    /// Alternate download locations (foreign layers)
    #[serde(default)]
    pub urls: Vec<String>,
}

impl Descriptor {
    /// The hex part of `algorithm:hex`, after [`validate_digest`].
    pub fn hex(&self) -> Result<&str> {
        validate_digest(&self.digest)
    }

    /// First 12 hex characters, for display.
    pub fn short(&self) -> &str {
        let hex = self.hex().unwrap_or(&self.digest);
        hex.get(..12).unwrap_or(hex)
    }
}

/// Check that `digest` is `<algorithm>:<hex>` and return the hex part.
///
/// The hex part ends up in file names and URLs, so only lowercase
/// alphanumeric algorithms and lowercase hex are accepted; `sha256` and
/// `sha512` must also have their exact lengths.
pub fn validate_digest(digest: &str) -> Result<&str> {
    let malformed = || PullError::Format(format!("malformed digest '{digest}'"));
    let (algorithm, hex) = digest.split_once(':').ok_or_else(malformed)?;

    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    let hex_ok = !hex.is_empty() && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    let length_ok = match algorithm {
        "sha256" => hex.len() == 64,
        "sha512" => hex.len() == 128,
        _ => true,
    };

    if algorithm_ok && hex_ok && length_ok {
        Ok(hex)
    } else {
        Err(malformed())
    }
}

/// Image manifest, Docker schema 2 (the OCI image manifest has the same shape).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformManifest {
    pub digest: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub platform: Option<Platform>,
}

impl PlatformManifest {
    /// `os/architecture[/variant]`, or `unknown`.
    pub fn platform_label(&self) -> String {
        match &self.platform {
            Some(p) => {
                let mut label = format!("{}/{}", p.os(), p.architecture());
                if let Some(variant) = p.variant() {
                    label.push('/');
                    label.push_str(variant);
                }
                label
            }
            None => "unknown".to_string(),
        }
    }
}

/// Docker manifest list or OCI image index.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<PlatformManifest>,
}

impl ManifestList {
    pub fn choices(&self) -> Vec<PlatformChoice> {
        self.manifests
            .iter()
            .map(|m| PlatformChoice {
                platform: m.platform_label(),
                digest: m.digest.clone(),
            })
            .collect()
    }
}

/// Terminal outcomes of a successful resolution.
#[derive(Debug)]
pub enum Resolution {
    Resolved(Manifest),
    ResolvedList(ManifestList),
}

/// Which representation is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    SingleManifest,
    ManifestList,
}

impl Attempt {
    fn accept(self) -> String {
        match self {
            Attempt::SingleManifest => format!("{DOCKER_MANIFEST_V2}, {OCI_MANIFEST_V1}"),
            Attempt::ManifestList => format!("{DOCKER_MANIFEST_LIST_V2}, {OCI_INDEX_V1}"),
        }
    }
}

/// Fetch the manifest for `reference`.
///
/// Asks for a single manifest first; on a non-200 (other than 401) asks once
/// more for a manifest list. 401, or failure of both attempts, is fatal.
pub async fn resolve(session: &RegistrySession<'_>, reference: &ImageReference) -> Result<Resolution> {
    let url = manifest_url(&session.registry, &session.repository, reference.tag_or_digest());
    let token = session.token().await?;
    let failed = |status: u16, message: String| PullError::Resolution {
        reference: reference.to_string(),
        status: Some(status),
        message,
    };

    let mut attempt = Attempt::SingleManifest;
    loop {
        let headers = session.headers(token.as_ref(), Some(&attempt.accept()))?;
        let response = session.transport().get(&url, headers).await?;
        tracing::debug!(url = %url, status = response.status, attempt = ?attempt, "manifest response");

        match (attempt, response.status) {
            (_, 200) => {
                let body = response.bytes().await.map_err(|e| PullError::Resolution {
                    reference: reference.to_string(),
                    status: None,
                    message: format!("failed to read manifest body: {e}"),
                })?;
                return parse_manifest(&body);
            }
            (_, 401) => return Err(failed(401, "unauthorized [HTTP 401]".into())),
            (Attempt::SingleManifest, status) => {
                tracing::info!(status, "no single manifest, asking for a manifest list");
                attempt = Attempt::ManifestList;
            }
            (Attempt::ManifestList, status) => {
                return Err(failed(status, format!("no manifest or manifest list [HTTP {status}]")));
            }
        }
    }
}

/// Classify a manifest body by its shape rather than by what was asked for.
pub fn parse_manifest(body: &[u8]) -> Result<Resolution> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| PullError::Format(format!("manifest is not JSON: {e}")))?;

    let schema_version = value.get("schemaVersion").and_then(|v| v.as_u64());
    if schema_version != Some(2) {
        return Err(PullError::Format(format!(
            "unsupported manifest schema version {}",
            schema_version.map_or_else(|| "(missing)".to_string(), |v| v.to_string())
        )));
    }

    if value.get("manifests").is_some() {
        let list: ManifestList = serde_json::from_value(value)
            .map_err(|e| PullError::Format(format!("invalid manifest list: {e}")))?;
        Ok(Resolution::ResolvedList(list))
    } else {
        let manifest: Manifest = serde_json::from_value(value)
            .map_err(|e| PullError::Format(format!("invalid manifest: {e}")))?;
        for descriptor in std::iter::once(&manifest.config).chain(&manifest.layers) {
            validate_digest(&descriptor.digest)?;
        }
        Ok(Resolution::Resolved(manifest))
    }
}
