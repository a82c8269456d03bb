use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{PullError, Result};

use super::layout::{DockerManifestEntry, MANIFEST_FILE, REPOSITORIES_FILE};

/// What a written archive turned out to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: usize,
}

/// Re-read a finished archive and check that everything `manifest.json`
/// points at is really there.
pub fn verify_archive(path: &Path) -> Result<ArchiveSummary> {
    let io_err = |source: std::io::Error| PullError::Archive {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(io_err)?;
    let mut archive = tar::Archive::new(file);

    let mut seen: HashSet<String> = HashSet::new();
    let mut manifest_data: Option<Vec<DockerManifestEntry>> = None;

    for entry_result in archive.entries().map_err(io_err)? {
        let mut entry = entry_result.map_err(io_err)?;
        let entry_path = entry.path().map_err(io_err)?.to_string_lossy().to_string();

        if entry_path == MANIFEST_FILE {
            let mut content = String::new();
            entry.read_to_string(&mut content).map_err(io_err)?;
            manifest_data = Some(
                serde_json::from_str(&content)
                    .map_err(|e| PullError::Format(format!("archive manifest.json: {e}")))?,
            );
        }
        seen.insert(entry_path);
    }

    let entries = manifest_data.ok_or_else(|| PullError::Format("manifest.json not found in archive".into()))?;
    let me = entries
        .into_iter()
        .next()
        .ok_or_else(|| PullError::Format("empty manifest.json in archive".into()))?;

    let missing: Vec<&String> = std::iter::once(&me.config)
        .chain(me.layers.iter())
        .filter(|p| !seen.contains(p.as_str()))
        .collect();
    if !missing.is_empty() {
        return Err(PullError::Format(format!(
            "archive is missing {}",
            missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        )));
    }
    if !seen.contains(REPOSITORIES_FILE) {
        return Err(PullError::Format("repositories not found in archive".into()));
    }

    Ok(ArchiveSummary {
        config: me.config,
        repo_tags: me.repo_tags,
        layers: me.layers.len(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::archive::assemble::assemble;

    fn build(work: &Path, manifest: &str, with_layer: bool) {
        fs::create_dir_all(work.join("id1")).unwrap();
        if with_layer {
            fs::write(work.join("id1/layer.tar"), b"x").unwrap();
        }
        fs::write(work.join("cfg.json"), b"{}").unwrap();
        fs::write(work.join(MANIFEST_FILE), manifest).unwrap();
        fs::write(work.join(REPOSITORIES_FILE), b"{}").unwrap();
    }

    const MANIFEST: &str = r#"[{"Config":"cfg.json","RepoTags":["library/a:latest"],"Layers":["id1/layer.tar"]}]"#;

    #[test]
    fn test_complete_archive() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("w");
        build(&work, MANIFEST, true);
        let out = dir.path().join("a.tar");
        assemble(&work, &out).unwrap();

        let summary = verify_archive(&out).unwrap();
        assert_eq!(summary.config, "cfg.json");
        assert_eq!(summary.repo_tags, vec!["library/a:latest"]);
        assert_eq!(summary.layers, 1);
    }

    #[test]
    fn test_missing_layer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("w");
        build(&work, MANIFEST, false);
        let out = dir.path().join("a.tar");
        assemble(&work, &out).unwrap();

        let err = verify_archive(&out).unwrap_err();
        assert!(err.to_string().contains("id1/layer.tar"));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("w");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("x"), b"x").unwrap();
        let out = dir.path().join("a.tar");
        assemble(&work, &out).unwrap();
        assert!(matches!(verify_archive(&out), Err(PullError::Format(_))));
    }
}
