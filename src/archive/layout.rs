//! The legacy `docker save` directory layout.
//!
//! ```text
//! manifest.json
//! repositories
//! <config hex>.json
//! <pseudo id>/VERSION
//! <pseudo id>/json
//! <pseudo id>/layer.tar
//! ```
//!
//! Layer directories are named by a pseudo ID chained through the parent
//! layer. It is only used to link the directories together and is not the ID
//! a Docker engine would assign.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::error::{IoContext, PullError, Result};
use crate::reference::ImageReference;
use crate::registry::manifest::Descriptor;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const REPOSITORIES_FILE: &str = "repositories";
pub const LAYER_TAR: &str = "layer.tar";
pub const LAYER_VERSION: &str = "1.0";

/// One entry of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// `repositories`: name → tag → pseudo ID of the top layer.
pub type Repositories = BTreeMap<String, BTreeMap<String, String>>;

/// A layer's place in the chain and on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRecord {
    /// Registry blob digest
    pub digest: String,
    pub parent: Option<String>,
    pub pseudo_id: String,
    pub directory: PathBuf,
}

impl LayerRecord {
    pub fn layer_tar(&self) -> PathBuf {
        self.directory.join(LAYER_TAR)
    }

    /// Path of the layer tar inside the archive.
    pub fn archive_path(&self) -> String {
        format!("{}/{LAYER_TAR}", self.pseudo_id)
    }

    pub fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.directory)
            .io_context(|| format!("cannot create layer directory {}", self.directory.display()))
    }
}

/// `sha256("<parent>\n<digest>\n")`, with an empty parent for the base layer.
pub fn pseudo_layer_id(parent: Option<&str>, digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}\n{}\n", parent.unwrap_or(""), digest).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Chain `layers` in manifest order. The first layer has no parent.
pub fn plan_layers(layers: &[Descriptor], work_dir: &Path) -> Result<Vec<LayerRecord>> {
    if layers.is_empty() {
        return Err(PullError::Format("manifest has no layers".into()));
    }

    let mut records: Vec<LayerRecord> = Vec::with_capacity(layers.len());
    for layer in layers {
        let parent = records.last().map(|r| r.pseudo_id.clone());
        let pseudo_id = pseudo_layer_id(parent.as_deref(), &layer.digest);
        records.push(LayerRecord {
            digest: layer.digest.clone(),
            parent,
            directory: work_dir.join(&pseudo_id),
            pseudo_id,
        });
    }
    Ok(records)
}

/// The `json` used for every layer but the top one.
pub fn empty_layer_config() -> Value {
    json!({
        "created": "1970-01-01T00:00:00Z",
        "container_config": {
            "Hostname": "",
            "Domainname": "",
            "User": "",
            "AttachStdin": false,
            "AttachStdout": false,
            "AttachStderr": false,
            "Tty": false,
            "OpenStdin": false,
            "StdinOnce": false,
            "Env": null,
            "Cmd": null,
            "Image": "",
            "Volumes": null,
            "WorkingDir": "",
            "Entrypoint": null,
            "OnBuild": null,
            "Labels": null
        }
    })
}

/// Build the `json` document for one layer.
///
/// The top layer gets the image config minus `history` and `rootfs` (any
/// casing; some registries emit `rootfS`). Everything else gets the empty
/// template. Both get `id` and, below the base, `parent`.
pub fn layer_json(record: &LayerRecord, is_last: bool, config: &[u8]) -> Result<Value> {
    let mut object = if is_last {
        strip_config(config)?
    } else {
        empty_layer_config().as_object().cloned().unwrap_or_default()
    };

    object.insert("id".into(), Value::String(record.pseudo_id.clone()));
    if let Some(parent) = &record.parent {
        object.insert("parent".into(), Value::String(parent.clone()));
    }
    Ok(Value::Object(object))
}

fn strip_config(config: &[u8]) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_slice(config)
        .map_err(|e| PullError::Format(format!("image config is not JSON: {e}")))?;
    let Value::Object(mut object) = value else {
        return Err(PullError::Format("image config is not a JSON object".into()));
    };

    if !object.keys().any(|k| k.eq_ignore_ascii_case("rootfs")) {
        return Err(PullError::Format("image config has no rootfs".into()));
    }
    object.retain(|k, _| !k.eq_ignore_ascii_case("history") && !k.eq_ignore_ascii_case("rootfs"));
    Ok(object)
}

/// Write `VERSION` and `json` into the layer directory.
pub fn write_layer_metadata(record: &LayerRecord, json: &Value) -> Result<()> {
    let version = record.directory.join("VERSION");
    fs::write(&version, LAYER_VERSION).io_context(|| format!("cannot write {}", version.display()))?;
    let path = record.directory.join("json");
    fs::write(&path, serde_json::to_vec(json)?).io_context(|| format!("cannot write {}", path.display()))
}

/// Write the metadata of every layer; the top layer is the one whose digest
/// matches the last manifest entry.
pub fn write_all_layer_metadata(records: &[LayerRecord], config: &[u8]) -> Result<()> {
    let last = records.last().map(|r| r.digest.as_str());
    for record in records {
        let json = layer_json(record, Some(record.digest.as_str()) == last, config)?;
        write_layer_metadata(record, &json)?;
    }
    Ok(())
}

/// Store the verbatim config blob as `<hex>.json`; returns the file name.
pub fn write_config(work_dir: &Path, config_hex: &str, config: &[u8]) -> Result<String> {
    let name = format!("{config_hex}.json");
    let path = work_dir.join(&name);
    fs::write(&path, config).io_context(|| format!("cannot write {}", path.display()))?;
    Ok(name)
}

pub fn manifest_entry(reference: &ImageReference, config_name: &str, records: &[LayerRecord]) -> DockerManifestEntry {
    DockerManifestEntry {
        config: config_name.to_string(),
        repo_tags: reference.load_tags(),
        layers: records.iter().map(LayerRecord::archive_path).collect(),
    }
}

pub fn repositories(reference: &ImageReference, records: &[LayerRecord]) -> Repositories {
    let mut tags = BTreeMap::new();
    if let Some(top) = records.last() {
        tags.insert(reference.tag_or_digest().to_string(), top.pseudo_id.clone());
    }
    let mut repos = Repositories::new();
    repos.insert(reference.name(), tags);
    repos
}

/// Write `manifest.json` and `repositories`.
pub fn write_index_files(
    work_dir: &Path,
    reference: &ImageReference,
    config_name: &str,
    records: &[LayerRecord],
) -> Result<()> {
    let manifest = vec![manifest_entry(reference, config_name, records)];
    let path = work_dir.join(MANIFEST_FILE);
    fs::write(&path, serde_json::to_vec(&manifest)?).io_context(|| format!("cannot write {}", path.display()))?;

    let path = work_dir.join(REPOSITORIES_FILE);
    fs::write(&path, serde_json::to_vec(&repositories(reference, records))?)
        .io_context(|| format!("cannot write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYER_A: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const LAYER_C: &str = "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";
    const ID_A: &str = "2c70aaf6b3fc0daabac2c0ee3418eba01cc8a1e58fde00d320ce0182f417c63a";
    const ID_C: &str = "37d40461cd89196caa2e630293caff26413a9fd997f6ced591a53e68c63d8bb9";

    fn desc(digest: &str) -> Descriptor {
        Descriptor {
            media_type: None,
            digest: digest.to_string(),
            size: 0,
            urls: Vec::new(),
        }
    }

    fn config() -> Vec<u8> {
        br#"{"architecture":"amd64","config":{"Cmd":["/hello"]},"history":[{"created_by":"x"}],"rootfS":{"type":"layers","diff_ids":[]},"os":"linux"}"#.to_vec()
    }

    #[test]
    fn test_pseudo_id_of_base_layer() {
        assert_eq!(pseudo_layer_id(None, LAYER_A), ID_A);
        assert_eq!(pseudo_layer_id(Some(""), LAYER_A), ID_A);
    }

    #[test]
    fn test_pseudo_id_chains_through_parent() {
        assert_eq!(pseudo_layer_id(Some(ID_A), LAYER_C), ID_C);
    }

    #[test]
    fn test_plan_layers() {
        let records = plan_layers(&[desc(LAYER_A), desc(LAYER_C)], Path::new("/w")).unwrap();
        assert_eq!(records[0].pseudo_id, ID_A);
        assert_eq!(records[0].parent, None);
        assert_eq!(records[0].directory, PathBuf::from(format!("/w/{ID_A}")));
        assert_eq!(records[1].pseudo_id, ID_C);
        assert_eq!(records[1].parent.as_deref(), Some(ID_A));
        assert_eq!(records[1].archive_path(), format!("{ID_C}/layer.tar"));
    }

    #[test]
    fn test_plan_rejects_empty_manifest() {
        assert!(matches!(plan_layers(&[], Path::new("/w")), Err(PullError::Format(_))));
    }

    #[test]
    fn test_top_layer_json_strips_history_and_rootfs() {
        let records = plan_layers(&[desc(LAYER_A), desc(LAYER_C)], Path::new("/w")).unwrap();
        let json = layer_json(&records[1], true, &config()).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.keys().any(|k| k.eq_ignore_ascii_case("history") || k.eq_ignore_ascii_case("rootfs")));
        assert_eq!(obj["architecture"], "amd64");
        assert_eq!(obj["id"], ID_C);
        assert_eq!(obj["parent"], ID_A);
        // config key order is kept, injected keys go last
        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        assert_eq!(keys, ["architecture", "config", "os", "id", "parent"]);
    }

    #[test]
    fn test_lower_layer_json_is_template() {
        let records = plan_layers(&[desc(LAYER_A), desc(LAYER_C)], Path::new("/w")).unwrap();
        let json = layer_json(&records[0], false, &config()).unwrap();
        let mut expected = empty_layer_config();
        expected["id"] = Value::String(ID_A.into());
        assert_eq!(json, expected);
        assert!(json.get("parent").is_none());
    }

    #[test]
    fn test_config_without_rootfs_is_rejected() {
        let records = plan_layers(&[desc(LAYER_A)], Path::new("/w")).unwrap();
        let err = layer_json(&records[0], true, br#"{"history":[]}"#).unwrap_err();
        assert!(matches!(err, PullError::Format(_)));
        assert!(layer_json(&records[0], true, b"[1,2]").is_err());
    }

    #[test]
    fn test_write_layout() {
        let dir = tempfile::tempdir().unwrap();
        let reference = ImageReference::parse("hello-world").unwrap();
        let records = plan_layers(&[desc(LAYER_A), desc(LAYER_C)], dir.path()).unwrap();
        for r in &records {
            r.create_dir().unwrap();
        }
        write_all_layer_metadata(&records, &config()).unwrap();
        let name = write_config(dir.path(), "bbbb", &config()).unwrap();
        write_index_files(dir.path(), &reference, &name, &records).unwrap();

        assert_eq!(fs::read_to_string(records[0].directory.join("VERSION")).unwrap(), "1.0");
        let top: Value = serde_json::from_slice(&fs::read(records[1].directory.join("json")).unwrap()).unwrap();
        assert_eq!(top["id"], ID_C);
        assert!(top.get("rootfS").is_none());
        assert_eq!(fs::read(dir.path().join("bbbb.json")).unwrap(), config());

        let manifest: Vec<DockerManifestEntry> =
            serde_json::from_slice(&fs::read(dir.path().join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(
            manifest,
            vec![DockerManifestEntry {
                config: "bbbb.json".into(),
                repo_tags: vec!["library/hello-world:latest".into()],
                layers: vec![format!("{ID_A}/layer.tar"), format!("{ID_C}/layer.tar")],
            }]
        );

        let repos: Repositories =
            serde_json::from_slice(&fs::read(dir.path().join(REPOSITORIES_FILE)).unwrap()).unwrap();
        assert_eq!(repos["library/hello-world"]["latest"], ID_C);
        assert_eq!(repos.len(), 1);
    }

    #[test]
    fn test_digest_pull_is_untagged() {
        let reference = ImageReference::parse(&format!("busybox@{LAYER_C}")).unwrap();
        let records = plan_layers(&[desc(LAYER_A)], Path::new("/w")).unwrap();
        let entry = manifest_entry(&reference, "bbbb.json", &records);
        assert!(entry.repo_tags.is_empty());
        let json = serde_json::to_value(vec![entry]).unwrap();
        assert_eq!(json[0]["RepoTags"], serde_json::json!([]));
    }

    #[test]
    fn test_repeated_top_digest_gets_config_everywhere() {
        // the top layer is identified by digest, so a repeated digest matches too
        let records = plan_layers(&[desc(LAYER_A), desc(LAYER_A)], Path::new("/w")).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<LayerRecord> = records
            .into_iter()
            .map(|r| LayerRecord {
                directory: dir.path().join(&r.pseudo_id),
                ..r
            })
            .collect();
        for r in &records {
            r.create_dir().unwrap();
        }
        write_all_layer_metadata(&records, &config()).unwrap();
        for r in &records {
            let v: Value = serde_json::from_slice(&fs::read(r.directory.join("json")).unwrap()).unwrap();
            assert_eq!(v["architecture"], "amd64");
        }
    }
}
