use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use crossterm::style::{self, Stylize};

use crate::config::{Credentials, PullConfig};
use crate::error::{PlatformChoice, PullError};
use crate::pipeline;
use crate::progress::{TransferBars, format_bytes};
use crate::reference::ImageReference;
use crate::registry::HttpTransport;

/// Options for one `imagepull` invocation, as parsed from the command line.
pub struct PullOptions {
    pub reference: String,
    pub args: Vec<String>,
    pub jobs: usize,
    pub keep_temp: bool,
    pub quiet: bool,
}

/// What the trailing positional arguments turned out to be.
#[derive(Debug, PartialEq, Eq)]
struct Positional {
    output: Option<PathBuf>,
    credentials: Option<Credentials>,
}

/// `[output]`, `[username password]` or `[username password output]`.
fn interpret_args(args: &[String]) -> Result<Positional> {
    let (output, credentials) = match args {
        [] => (None, None),
        [output] => (Some(output), None),
        [user, pass] => (None, Some(Credentials::new(user, pass))),
        [user, pass, output] => (Some(output), Some(Credentials::new(user, pass))),
        _ => anyhow::bail!("expected at most 3 arguments after the image reference, got {}", args.len()),
    };
    Ok(Positional {
        output: output.map(PathBuf::from),
        credentials,
    })
}

pub async fn run(opts: PullOptions, bars: TransferBars) -> Result<()> {
    let reference = ImageReference::parse(&opts.reference)?;
    let positional = interpret_args(&opts.args)?;

    let mut config = PullConfig::new(&reference)
        .with_credentials(positional.credentials)
        .with_jobs(opts.jobs)
        .keep_work_dir(opts.keep_temp);
    if let Some(output) = positional.output {
        config = config.with_output(&reference, output);
    }

    if !opts.quiet {
        print_summary(&reference, &config);
    }

    let transport = HttpTransport::new().context("Failed to set up the HTTP client")?;
    let spinner = bars.spinner(format!("Pulling {}...", reference.repo_tag()));

    let result = tokio::select! {
        result = pipeline::pull(&transport, &config, &reference, &bars) => result,
        _ = tokio::signal::ctrl_c() => {
            spinner.abandon();
            pipeline::discard(&config);
            anyhow::bail!("Interrupted, partial download removed");
        }
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(PullError::PlatformSelectionRequired { reference, platforms }) => {
            spinner.abandon();
            print_platforms(&platforms);
            anyhow::bail!(
                "{reference} is a multi-platform image; pull one of the digests above as <name>@<digest>"
            );
        }
        Err(e) => {
            spinner.abandon();
            return Err(e).with_context(|| format!("Failed to pull {}", reference.repo_tag()));
        }
    };

    let tags = if outcome.summary.repo_tags.is_empty() {
        format!("{} (untagged)", reference.repo_tag())
    } else {
        outcome.summary.repo_tags.join(", ")
    };
    spinner.finish(format!("Pulled {} layers for {}", outcome.layers.len(), tags));
    if !opts.quiet {
        eprintln!(
            "{} Wrote {} ({})",
            "✔".green(),
            style::style(outcome.output.display()).cyan(),
            format_bytes(outcome.size)
        );
        eprintln!(
            "{} docker load -i {}",
            "Load with".dim(),
            outcome.output.display()
        );
    }
    Ok(())
}

fn print_summary(reference: &ImageReference, config: &PullConfig) {
    let mut stderr = io::stderr();
    let _ = writeln!(stderr, "{} {}", "Registry".dim(), reference.registry);
    let _ = writeln!(
        stderr,
        "{} {}",
        "Image".dim(),
        style::style(reference.repo_tag()).green().bold()
    );
    if let Some(credentials) = &config.credentials {
        let _ = writeln!(stderr, "{} {}", "User".dim(), credentials.username);
    }
    let _ = writeln!(
        stderr,
        "{} {}",
        "Output".dim(),
        style::style(config.output_path.display()).dim()
    );
    let _ = writeln!(stderr);
}

fn print_platforms(platforms: &[PlatformChoice]) {
    let mut stderr = io::stderr();
    let _ = writeln!(
        stderr,
        "{} This tag is a manifest list; available platforms:",
        "!".yellow().bold()
    );
    let width = platforms.iter().map(|p| p.platform.len()).max().unwrap_or(0);
    for p in platforms {
        let _ = writeln!(
            stderr,
            "  {:<width$}  {}",
            p.platform,
            style::style(&p.digest).dim()
        );
    }
    let _ = writeln!(stderr);
}
