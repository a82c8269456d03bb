use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{PullError, Result};

/// Tar the *contents* of `work_dir` into `output`, then remove `work_dir`.
///
/// The archive is written to `<output>.part` and renamed into place only once
/// it is complete, so a failed run never leaves a file at `output`. Returns
/// the archive size in bytes.
pub fn assemble(work_dir: &Path, output: &Path) -> Result<u64> {
    let partial = partial_path(output);
    let archive_err = |source: io::Error| PullError::Archive {
        path: output.to_path_buf(),
        source,
    };

    if let Err(e) = write_tar(work_dir, &partial).and_then(|_| fs::rename(&partial, output)) {
        let _ = fs::remove_file(&partial);
        return Err(archive_err(e));
    }
    let size = fs::metadata(output).map_err(archive_err)?.len();
    tracing::info!(output = %output.display(), size, "archive written");

    remove_work_dir(work_dir);
    Ok(size)
}

/// `<output>.part`
pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Best-effort removal; failure is only logged.
pub fn remove_work_dir(work_dir: &Path) -> bool {
    match fs::remove_dir_all(work_dir) {
        Ok(()) => {
            tracing::debug!(dir = %work_dir.display(), "removed working directory");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!(dir = %work_dir.display(), error = %e, "could not remove working directory");
            false
        }
    }
}

fn write_tar(work_dir: &Path, path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    append_tree(&mut builder, work_dir, Path::new(""))?;

    let writer = builder.into_inner()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Append `root/rel` recursively, in sorted order so repeated runs produce
/// the same archive.
fn append_tree<W: Write>(builder: &mut tar::Builder<W>, root: &Path, rel: &Path) -> io::Result<()> {
    let mut entries = fs::read_dir(root.join(rel))?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = rel.join(entry.file_name());
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            builder.append_dir(&name, &path)?;
            append_tree(builder, root, &name)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }
    Ok(())
}
