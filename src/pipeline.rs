//! Reference → token → manifest → blobs → legacy layout → archive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use futures::{StreamExt, TryStreamExt};

use crate::archive::{self, ArchiveSummary, LayerRecord, layout};
use crate::config::PullConfig;
use crate::error::{IoContext, PullError, Result};
use crate::reference::ImageReference;
use crate::registry::blob::{self, LayerTransfer, TransferObserver};
use crate::registry::manifest::{self, Manifest, Resolution};
use crate::registry::{RegistrySession, Transport};

/// A finished pull.
#[derive(Debug)]
pub struct PullOutcome {
    pub output: PathBuf,
    /// Archive size in bytes
    pub size: u64,
    pub layers: Vec<LayerRecord>,
    pub transfers: Vec<LayerTransfer>,
    pub summary: ArchiveSummary,
}

/// Pull `reference` and write it as a legacy archive to `config.output_path`.
///
/// Layers are downloaded up to `config.jobs` at a time, but the parent chain
/// is planned up front and metadata is written in manifest order, so the
/// result does not depend on download timing. On failure the working
/// directory is removed unless `config.keep_work_dir` is set; no archive is
/// left behind either way.
pub async fn pull(
    transport: &dyn Transport,
    config: &PullConfig,
    reference: &ImageReference,
    observer: &dyn TransferObserver,
) -> Result<PullOutcome> {
    let session = RegistrySession::connect(
        transport,
        &config.registry,
        &reference.name(),
        config.credentials.clone(),
    )
    .await?;

    let manifest = match manifest::resolve(&session, reference).await? {
        Resolution::Resolved(manifest) => manifest,
        Resolution::ResolvedList(list) => {
            return Err(PullError::PlatformSelectionRequired {
                reference: reference.to_string(),
                platforms: list.choices(),
            });
        }
    };
    tracing::info!(
        reference = %reference,
        layers = manifest.layers.len(),
        config = %manifest.config.digest,
        "resolved manifest"
    );

    let records = layout::plan_layers(&manifest.layers, &config.work_dir)?;
    let config_hex = manifest.config.hex()?.to_string();

    prepare_work_dir(&config.work_dir)?;
    let result = match build_tree(&session, config, reference, &manifest, &records, &config_hex, observer).await {
        Ok(transfers) => finish(config, records, transfers).await,
        Err(e) => Err(e),
    };

    if result.is_err() {
        if config.keep_work_dir {
            tracing::warn!(dir = %config.work_dir.display(), "keeping working directory for inspection");
        } else {
            archive::remove_work_dir(&config.work_dir);
        }
    }
    result
}

/// Remove everything a cancelled or failed run may have left behind.
pub fn discard(config: &PullConfig) {
    if !config.keep_work_dir {
        archive::remove_work_dir(&config.work_dir);
    }
    let _ = fs::remove_file(archive::assemble::partial_path(&config.output_path));
}

/// Start from an empty working directory.
fn prepare_work_dir(work_dir: &Path) -> Result<()> {
    if work_dir.exists() {
        tracing::debug!(dir = %work_dir.display(), "removing stale working directory");
        fs::remove_dir_all(work_dir).io_context(|| format!("cannot clear {}", work_dir.display()))?;
    }
    fs::create_dir_all(work_dir).io_context(|| format!("cannot create {}", work_dir.display()))?;
    tracing::info!(dir = %work_dir.display(), "building image structure");
    Ok(())
}

async fn build_tree(
    session: &RegistrySession<'_>,
    config: &PullConfig,
    reference: &ImageReference,
    manifest: &Manifest,
    records: &[LayerRecord],
    config_hex: &str,
    observer: &dyn TransferObserver,
) -> Result<Vec<LayerTransfer>> {
    let token = session.token().await?;
    let image_config = blob::fetch_config(session, token.as_ref(), &manifest.config).await?;
    let config_name = layout::write_config(&config.work_dir, config_hex, &image_config)?;

    let downloads = records.iter().zip(&manifest.layers).map(|(record, descriptor)| async move {
        record.create_dir()?;
        // Tokens are short-lived; a long pull can outlast the first one.
        let token = session.token().await?;
        tracing::info!(layer = descriptor.short(), id = %record.pseudo_id, "downloading layer");
        let transfer = blob::fetch_layer(
            session,
            token.as_ref(),
            descriptor,
            &record.pseudo_id,
            &record.layer_tar(),
            observer,
        )
        .await?;
        Ok::<_, PullError>(transfer)
    });
    let transfers: Vec<LayerTransfer> = futures::stream::iter(downloads)
        .buffered(config.jobs.max(1))
        .try_collect()
        .await?;

    layout::write_all_layer_metadata(records, &image_config)?;
    layout::write_index_files(&config.work_dir, reference, &config_name, records)?;
    Ok(transfers)
}

/// Tar, fsync and re-read the archive on the blocking pool.
async fn finish(config: &PullConfig, records: Vec<LayerRecord>, transfers: Vec<LayerTransfer>) -> Result<PullOutcome> {
    let work_dir = config.work_dir.clone();
    let output = config.output_path.clone();
    let (size, summary) = tokio::task::spawn_blocking(move || {
        let size = archive::assemble(&work_dir, &output)?;
        match archive::verify_archive(&output) {
            Ok(summary) => Ok((size, summary)),
            Err(e) => {
                let _ = fs::remove_file(&output);
                Err(e)
            }
        }
    })
    .await
    .map_err(|e| PullError::Io {
        context: "archive task failed".to_string(),
        source: io::Error::other(e),
    })??;

    Ok(PullOutcome {
        output: config.output_path.clone(),
        size,
        layers: records,
        transfers,
        summary,
    })
}
