//! CLI argument parsing for RangeSync

use clap::Parser;
use std::path::PathBuf;

/// RangeSync - a zsync-compatible delta download client
#[derive(Parser, Debug)]
#[command(name = "rangesync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// URL or local path of the .zsync control file
    pub control: String,

    /// Final output path [default: the control file's Filename header]
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Seed file to read existing blocks from (can be given multiple times)
    #[arg(short = 'i', long = "input", action = clap::ArgAction::Append)]
    pub inputs: Vec<PathBuf>,

    /// Save the fetched control file to this path
    #[arg(short = 'k', long = "save-control")]
    pub save_control: Option<PathBuf>,

    /// Referer sent with requests and used to resolve relative URLs
    #[arg(short = 'u', long = "referer")]
    pub referer: Option<String>,

    /// Show a progress bar
    #[arg(short = 'P', long)]
    pub progress: bool,

    /// Configuration file path
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output logs as JSON
    #[arg(long)]
    pub json: bool,
}
