//! Config and layer blob downloads.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use flate2::write::GzDecoder;
use futures::StreamExt;
use reqwest::Url;

use super::manifest::Descriptor;
use super::{AccessToken, RegistrySession, blob_url};
use crate::error::{PullError, Result};

/// Upper bound on a single write to disk.
pub const CHUNK_SIZE: usize = 64 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Receives transfer progress. Implementations must not fail; the download
/// carries on regardless of what they do.
///
/// `id` identifies one download. A manifest may list the same digest more
/// than once, so observers key on `id`, not on the digest.
pub trait TransferObserver: Send + Sync {
    fn layer_started(&self, _id: &str, _digest: &str, _content_length: Option<u64>) {}
    fn layer_progress(&self, _id: &str, _received: u64) {}
    fn layer_finished(&self, _id: &str, _digest: &str, _received: u64) {}
}

/// Discards all progress.
impl TransferObserver for () {}

/// Outcome of one layer download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerTransfer {
    /// Bytes received over the wire
    pub received: u64,
    /// Bytes written to `layer.tar` (after decompression)
    pub written: u64,
    /// Declared `Content-Length`, if any
    pub content_length: Option<u64>,
}

/// Download the image config blob into memory.
pub async fn fetch_config(
    session: &RegistrySession<'_>,
    token: Option<&AccessToken>,
    descriptor: &Descriptor,
) -> Result<Vec<u8>> {
    let url = blob_url(&session.registry, &session.repository, &descriptor.digest);
    let response = session
        .transport()
        .get(&url, session.headers(token, None)?)
        .await?;
    if response.status != 200 {
        return Err(PullError::Transfer {
            digest: descriptor.digest.clone(),
            message: format!("config blob request returned HTTP {}", response.status),
        });
    }
    response.bytes().await.map_err(|e| PullError::Transfer {
        digest: descriptor.digest.clone(),
        message: format!("failed to read config blob: {e}"),
    })
}

/// Stream a layer blob to `destination`, gunzipping it if needed.
///
/// The registry blob endpoint is tried first, then each of the descriptor's
/// `urls`. Only a response that never reaches 200 moves on to the next
/// candidate; a failure mid-stream is fatal. Progress is reported under `id`.
pub async fn fetch_layer(
    session: &RegistrySession<'_>,
    token: Option<&AccessToken>,
    descriptor: &Descriptor,
    id: &str,
    destination: &Path,
    observer: &dyn TransferObserver,
) -> Result<LayerTransfer> {
    let digest = descriptor.digest.as_str();
    let mut candidates = vec![blob_url(&session.registry, &session.repository, digest)];
    candidates.extend(descriptor.urls.iter().cloned());

    let mut failures = Vec::new();
    for url in &candidates {
        // Registry tokens stay on the registry host.
        let token = if same_host(url, &session.registry) { token } else { None };
        let headers = session.headers(token, None)?;

        let response = match session.transport().get(url, headers).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(digest, url = %url, error = %e, "layer request failed");
                failures.push(format!("{url}: {e}"));
                continue;
            }
        };
        if response.status != 200 {
            tracing::warn!(digest, url = %url, status = response.status, "layer request rejected");
            failures.push(format!("{url}: HTTP {}", response.status));
            continue;
        }

        let content_length = response.content_length();
        observer.layer_started(id, digest, content_length);
        let (received, written) = stream_to_file(id, digest, response.into_body(), destination, observer).await?;
        observer.layer_finished(id, digest, received);

        tracing::info!(digest, received, written, content_length = ?content_length, "layer downloaded");
        return Ok(LayerTransfer {
            received,
            written,
            content_length,
        });
    }

    Err(PullError::Transfer {
        digest: digest.to_string(),
        message: format!("no candidate URL succeeded ({})", failures.join("; ")),
    })
}

fn same_host(url: &str, registry: &str) -> bool {
    Url::parse(url)
        .ok()
        .map(|u| match (u.host_str(), u.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}") == registry,
            (Some(host), None) => host == registry,
            _ => false,
        })
        .unwrap_or(false)
}

async fn stream_to_file(
    id: &str,
    digest: &str,
    mut body: super::BodyStream,
    destination: &Path,
    observer: &dyn TransferObserver,
) -> Result<(u64, u64)> {
    let transfer_err = |message: String| PullError::Transfer {
        digest: digest.to_string(),
        message,
    };
    let path = destination.to_path_buf();

    let mut sink: Option<LayerSink> = None;
    // Bytes held back until there are enough to look for the gzip magic.
    let mut prefix: Vec<u8> = Vec::new();
    let mut received = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| transfer_err(format!("stream interrupted: {e}")))?;
        if chunk.is_empty() {
            continue;
        }
        received += chunk.len() as u64;

        let data = if sink.is_some() {
            chunk
        } else {
            prefix.extend_from_slice(&chunk);
            if prefix.len() < GZIP_MAGIC.len() {
                observer.layer_progress(id, received);
                continue;
            }
            let gzip = prefix.starts_with(&GZIP_MAGIC);
            sink = Some(
                open_sink(&path, gzip)
                    .await
                    .map_err(|e| transfer_err(format!("cannot create {}: {e}", path.display())))?,
            );
            std::mem::take(&mut prefix)
        };
        if let Some(open) = sink.take() {
            sink = Some(
                write_chunk(open, data)
                    .await
                    .map_err(|e| transfer_err(format!("write to {} failed: {e}", path.display())))?,
            );
        }
        observer.layer_progress(id, received);
    }

    let sink = match sink {
        Some(sink) => sink,
        // Fewer than two bytes arrived: cannot be gzip.
        None => {
            let sink = open_sink(&path, false)
                .await
                .map_err(|e| transfer_err(format!("cannot create {}: {e}", path.display())))?;
            write_chunk(sink, prefix)
                .await
                .map_err(|e| transfer_err(format!("write to {} failed: {e}", path.display())))?
        }
    };
    let written = blocking(move || sink.finish())
        .await
        .map_err(|e| transfer_err(format!("cannot finish {}: {e}", path.display())))?;
    Ok((received, written))
}

/// Run file I/O on the blocking pool so one slow disk write or fsync does
/// not stall the other downloads polled on the same task.
async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(io::Error::other)?
}

async fn open_sink(path: &Path, gzip: bool) -> io::Result<LayerSink> {
    let path = path.to_path_buf();
    blocking(move || LayerSink::create(&path, gzip)).await
}

async fn write_chunk(mut sink: LayerSink, data: Vec<u8>) -> io::Result<LayerSink> {
    blocking(move || {
        for piece in data.chunks(CHUNK_SIZE) {
            sink.write_all(piece)?;
        }
        Ok(sink)
    })
    .await
}

/// Where downloaded bytes go: straight to disk, or through a gunzip.
enum LayerSink {
    Plain(CountingWriter<BufWriter<File>>),
    Gzip(GzDecoder<CountingWriter<BufWriter<File>>>),
}

impl LayerSink {
    fn create(path: &Path, gzip: bool) -> io::Result<Self> {
        let file = CountingWriter::new(BufWriter::new(File::create(path)?));
        Ok(if gzip {
            LayerSink::Gzip(GzDecoder::new(file))
        } else {
            LayerSink::Plain(file)
        })
    }

    /// Flush everything to disk and return the number of bytes written.
    fn finish(self) -> io::Result<u64> {
        let mut inner = match self {
            LayerSink::Plain(w) => w,
            LayerSink::Gzip(decoder) => decoder.finish()?,
        };
        inner.flush()?;
        let written = inner.count;
        inner.inner.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(written)
    }
}

impl Write for LayerSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LayerSink::Plain(w) => w.write(buf),
            LayerSink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LayerSink::Plain(w) => w.flush(),
            LayerSink::Gzip(w) => w.flush(),
        }
    }
}

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
