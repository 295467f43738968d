//! RangeSync - a zsync-compatible delta download client

use clap::Parser;
use rangesync::cli::Cli;
use rangesync::config::Config;
use rangesync::control::{parse_control, SessionParams};
use rangesync::error::{Error, Result};
use rangesync::fetch::{RangeFetcher, RemoteFetchAdapter};
use rangesync::http::HttpRangeClient;
use rangesync::progress::FetchProgress;
use rangesync::session::{SessionStatus, SyncSession, VerifyOutcome};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_default(),
    };

    run(cli, config).await?;
    Ok(())
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("rangesync=info"),
        1 => EnvFilter::new("rangesync=debug"),
        2 => EnvFilter::new("rangesync=trace"),
        _ => EnvFilter::new("trace"),
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let http = HttpRangeClient::new(&config, cli.referer.clone())?;

    // Acquire the control file; when fetched over HTTP the final URL
    // (after redirects) becomes the base for relative target URLs.
    let (control_bytes, base_url) = if is_url(&cli.control) {
        let (bytes, final_url) = http.get_following_redirects(&cli.control).await?;
        tracing::info!(url = %final_url, len = bytes.len(), "fetched control file");
        (bytes.to_vec(), Some(final_url))
    } else {
        let bytes = std::fs::read(&cli.control)
            .map_err(|e| Error::io(format!("reading control file {}", cli.control), e))?;
        (bytes, cli.referer.clone())
    };

    if let Some(path) = &cli.save_control {
        std::fs::write(path, &control_bytes)
            .map_err(|e| Error::io("saving control file", e))?;
    }

    let control = parse_control(&control_bytes[..]).await?;
    let output = match &cli.output {
        Some(path) => path.clone(),
        None => PathBuf::from(default_output_name(&control.params, base_url.as_deref())?),
    };
    let out_dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut session = SyncSession::from_control(control, out_dir).await?;
    let part_path = with_suffix(&output, ".part");

    // Seed order: explicit -i files, the current output if it exists, and
    // any partial file left behind by an interrupted run.
    let mut seeds = cli.inputs.clone();
    if output.exists() {
        seeds.push(output.clone());
    }
    if part_path.exists() {
        seeds.push(part_path.clone());
    }

    for seed in &seeds {
        match session.submit_seed_path(seed).await {
            Ok(_) => {}
            Err(e) if !e.is_fatal() => {
                tracing::warn!(seed = %seed.display(), error = %e, "skipping unreadable seed");
            }
            Err(e) => return Err(e),
        }
    }

    session.rename_scratch(&part_path).await?;

    if session.status() == SessionStatus::Complete {
        tracing::info!("local seeds covered the whole file; nothing to download");
    } else {
        let urls = resolve_urls(&session.params().urls, base_url.as_deref());
        if urls.is_empty() {
            return Err(Error::control(
                "control file lists no usable URL (use -u to supply a base)",
            ));
        }

        let show_progress =
            cli.progress || (config.progress && std::io::stderr().is_terminal() && !cli.json);
        let todo_bytes = session.blocks_todo() * session.params().block_size as u64;
        let progress = FetchProgress::new(show_progress, todo_bytes);

        let mut adapter = RemoteFetchAdapter::new(
            RangeFetcher::Http(http),
            urls,
            config.max_url_strikes,
            config.max_ranges_per_request,
        );
        adapter.run(&mut session, &progress).await?;
        progress.finish();
    }

    let stats = session.stats();
    match session.complete().await? {
        VerifyOutcome::Corrupt => {
            // The partial file stays on disk for inspection and reuse.
            return Err(Error::FinalChecksumMismatch { part: part_path });
        }
        outcome => {
            tracing::info!(
                blocks_from_seeds = stats.blocks_from_seeds,
                blocks_from_remote = stats.blocks_from_remote,
                bytes_received = stats.bytes_received,
                verified = matches!(outcome, VerifyOutcome::Verified),
                "transfer complete"
            );
        }
    }

    session.finalize(&output).await?;
    Ok(())
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Append a suffix to a path without touching its extension
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Output name: the `Filename` header, else the alphanumeric prefix of
/// the control URL's basename (then of any target URL's).
fn default_output_name(params: &SessionParams, base_url: Option<&str>) -> Result<String> {
    if let Some(name) = &params.filename {
        return Ok(name.clone());
    }
    for url in base_url.into_iter().chain(params.urls.iter().map(String::as_str)) {
        let basename = url.trim_end_matches('/').rsplit('/').next().unwrap_or("");
        let prefix: String = basename
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        if !prefix.is_empty() {
            return Ok(prefix);
        }
    }
    Err(Error::control("cannot derive an output name; use -o"))
}

/// Resolve the control file's URL list against the base URL; relative
/// entries without a base are dropped with a warning.
fn resolve_urls(urls: &[String], base_url: Option<&str>) -> Vec<String> {
    let base = base_url.and_then(|b| Url::parse(b).ok());
    let mut out = Vec::new();
    for url in urls {
        if let Ok(abs) = Url::parse(url) {
            out.push(abs.to_string());
            continue;
        }
        match base.as_ref().and_then(|b| b.join(url).ok()) {
            Some(abs) => out.push(abs.to_string()),
            None => {
                tracing::warn!(url = %url, "ignoring relative URL without a usable base");
            }
        }
    }
    out
}
