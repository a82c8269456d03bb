use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::Duration;

use crossterm::style::Stylize;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressState, ProgressStyle};

use crate::registry::blob::TransferObserver;

/// A simple spinner for long-running stages.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    fn with_bar(bar: ProgressBar, message: impl Into<String>) -> Self {
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.dim} {msg}")
                .unwrap(),
        );
        bar.set_message(message.into());
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    /// Clear the spinner and print a `✔ message` line to stderr.
    pub fn finish(self, message: impl Into<String>) {
        let quiet = self.bar.is_hidden();
        self.bar.finish_and_clear();
        if !quiet {
            eprintln!("{} {}", "✔".green(), message.into());
        }
    }

    pub fn abandon(self) {
        self.bar.finish_and_clear();
    }
}

/// One byte-level bar per layer download, keyed by download id.
pub struct TransferBars {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl TransferBars {
    pub fn new(quiet: bool) -> Self {
        let multi = if quiet {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// A stage spinner drawn above the layer bars.
    pub fn spinner(&self, message: impl Into<String>) -> Spinner {
        Spinner::with_bar(self.multi.add(ProgressBar::new_spinner()), message)
    }

    /// A writer for log output that clears the bars while it writes.
    pub fn log_writer(&self) -> LogWriter {
        LogWriter {
            multi: self.multi.clone(),
        }
    }

    fn bar(&self, id: &str) -> Option<ProgressBar> {
        self.bars.lock().ok()?.get(id).cloned()
    }
}

/// Stderr, with the progress bars suspended around each write.
#[derive(Clone)]
pub struct LogWriter {
    multi: MultiProgress,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.multi.suspend(|| io::stderr().write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.multi.suspend(|| io::stderr().write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

fn sized_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.dim} {msg} [{bar:20}] {bytes}/{total_bytes} ({elapsed_precise:.>5})",
    )
    .unwrap()
    .with_key("elapsed_precise", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
        let _ = write!(w, "{}s", state.elapsed().as_secs());
    })
    .progress_chars("━╸░")
}

fn unsized_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.dim} {msg} {bytes} ({elapsed_precise:.>5})")
        .unwrap()
        .with_key("elapsed_precise", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
            let _ = write!(w, "{}s", state.elapsed().as_secs());
        })
}

fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map_or(digest, |(_, hex)| hex);
    hex.get(..12).unwrap_or(hex)
}

impl TransferObserver for TransferBars {
    fn layer_started(&self, id: &str, digest: &str, content_length: Option<u64>) {
        let bar = match content_length {
            Some(total) => {
                let bar = self.multi.add(ProgressBar::new(total));
                bar.set_style(sized_style());
                bar
            }
            None => {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(unsized_style());
                bar
            }
        };
        bar.set_message(short_digest(digest).to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(id.to_string(), bar);
        }
    }

    fn layer_progress(&self, id: &str, received: u64) {
        if let Some(bar) = self.bar(id) {
            bar.set_position(received);
        }
    }

    fn layer_finished(&self, id: &str, digest: &str, received: u64) {
        let bar = self.bars.lock().ok().and_then(|mut bars| bars.remove(id));
        if let Some(bar) = bar {
            bar.finish_and_clear();
            self.multi.remove(&bar);
            if !self.multi.is_hidden() {
                let _ = self.multi.println(format!(
                    "{} Layer {} ({})",
                    "✔".green(),
                    short_digest(digest),
                    format_bytes(received)
                ));
            }
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return if size.fract() < 0.05 {
                format!("{:.0} {unit}", size)
            } else {
                format!("{:.1} {unit}", size)
            };
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}
