//! Command-line definitions for the wsferry binary

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::BASE_URL_ENV;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "wsferry - JSON requests and chunked uploads over WebSocket"
)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (default: ~/.config/wsferry/wsferry.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Server base address (ws://host[:port][/prefix]); overrides the config file
    #[arg(long, env = BASE_URL_ENV, global = true)]
    pub base_url: Option<String>,

    /// Append a line per request/upload outcome to this file
    #[arg(long, global = true)]
    pub journal: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send JSON requests over the control socket concurrently and print each response
    Exec {
        /// One JSON object per request
        #[arg(required = true)]
        requests: Vec<String>,
    },
    /// Upload a file to a transfer id issued by the server
    Upload(UploadOpts),
}

#[derive(Clone, Debug, clap::Args)]
pub struct UploadOpts {
    /// File to upload
    pub file: PathBuf,

    /// Transfer id issued by the server
    #[arg(long)]
    pub id: Uuid,

    /// Skip the first N bytes (the server already has them)
    #[arg(long)]
    pub resume_from: Option<u64>,

    /// Bytes per data frame; overrides the config file
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Do not draw a progress bar
    #[arg(short, long)]
    pub quiet: bool,
}
