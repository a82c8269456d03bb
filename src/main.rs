mod archive;
mod cmd;
mod config;
mod error;
mod pipeline;
mod progress;
mod reference;
mod registry;

use anyhow::Result;
use clap::Parser;
use clap::error::ErrorKind;
use tracing_subscriber::EnvFilter;

use crate::progress::{LogWriter, TransferBars};

#[derive(Parser)]
#[command(name = "imagepull")]
#[command(about = "Pull an image from a Docker registry into a `docker load` archive")]
#[command(version)]
#[command(override_usage = "imagepull [OPTIONS] <REFERENCE> [OUTPUT] | <REFERENCE> <USERNAME> <PASSWORD> [OUTPUT]")]
struct Cli {
    /// Image reference: [registry/][repository/]image[:tag|@digest]
    reference: String,

    /// [output_path], [username password] or [username password output_path]
    #[arg(num_args = 0..=3, value_name = "ARGS")]
    args: Vec<String>,

    /// Number of layers downloaded in parallel
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    /// Keep the working directory when the pull fails
    #[arg(long)]
    keep_temp: bool,

    /// Only print errors
    #[arg(short, long)]
    quiet: bool,
}

/// Log lines go to stderr through `writer` so they do not tear the progress bars.
fn init_tracing(writer: LogWriter) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(move || writer.clone())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let bars = TransferBars::new(cli.quiet);
    init_tracing(bars.log_writer());

    cmd::pull::run(
        cmd::pull::PullOptions {
            reference: cli.reference,
            args: cli.args,
            jobs: cli.jobs,
            keep_temp: cli.keep_temp,
            quiet: cli.quiet,
        },
        bars,
    )
    .await
}
