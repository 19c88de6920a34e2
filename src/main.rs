//! wsferry - command-line client for the control and upload sockets

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use wsferry::channel;
use wsferry::cli::{Cli, Command, UploadOpts};
use wsferry::config::ClientConfig;
use wsferry::journal::{Journal, NoopJournal, TextJournal};
use wsferry::logging::init_logging;
use wsferry::progress::TransferBar;
use wsferry::protocol::timeouts::PROGRESS_TICK_MS;
use wsferry::source::{ByteSource, FileSource};
use wsferry::uploader::Uploader;
use wsferry::url::BaseUrl;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut cfg = ClientConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.base_url {
        cfg.base_url = url;
    }
    let base = cfg.base()?;

    let journal: Box<dyn Journal> = match &cli.journal {
        Some(p) => Box::new(
            TextJournal::new(p).with_context(|| format!("open journal {}", p.display()))?,
        ),
        None => Box::new(NoopJournal),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match cli.command {
        Command::Exec { requests } => rt.block_on(exec(&base, &requests, journal.as_ref())),
        Command::Upload(opts) => rt.block_on(upload(&base, &cfg, opts, journal.as_ref())),
    }
}

async fn exec(base: &BaseUrl, requests: &[String], journal: &dyn Journal) -> Result<()> {
    let payloads = requests
        .iter()
        .map(|r| serde_json::from_str::<Value>(r).with_context(|| format!("parse request {r:?}")))
        .collect::<Result<Vec<_>>>()?;

    channel::install(base.control_url());
    let ch = channel::ensure_connection()
        .await
        .with_context(|| format!("connect {}", base.control_url()))?;

    let results = join_all(payloads.iter().map(|p| ch.execute(p))).await;
    channel::shutdown_global();

    let mut failed = 0;
    for (req, res) in requests.iter().zip(results) {
        match res {
            Ok(resp) => {
                journal.request(req, "ok");
                println!("{}", resp);
            }
            Err(e) => {
                journal.request(req, &e.to_string());
                eprintln!("{}: {}", req, e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} requests failed", failed, requests.len());
    }
    Ok(())
}

async fn upload(base: &BaseUrl, cfg: &ClientConfig, opts: UploadOpts, journal: &dyn Journal) -> Result<()> {
    let source = FileSource::open(&opts.file)
        .with_context(|| format!("open {}", opts.file.display()))?;
    let size = source.len();
    let id = opts.id.to_string();

    let mut up = Uploader::for_transfer(source, base, &id)?
        .with_block_size(opts.block_size.unwrap_or(cfg.block_size))?;
    if let Some(offset) = opts.resume_from {
        up = up.resume_from(offset)?;
    }
    let up = Arc::new(up);

    {
        let up = Arc::clone(&up);
        ctrlc::set_handler(move || up.abort()).context("install Ctrl-C handler")?;
    }

    let label = opts
        .file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| id.clone());
    let bar = if opts.quiet {
        TransferBar::hidden()
    } else {
        TransferBar::new(size, &label)
    };

    journal.upload_start(&id, &opts.file, size);
    up.start()?;

    let mut tick = tokio::time::interval(Duration::from_millis(PROGRESS_TICK_MS));
    let outcome = loop {
        tokio::select! {
            res = up.wait() => break res,
            _ = tick.tick() => bar.set_position(up.bytes_sent()),
        }
    };

    match outcome {
        Ok(()) => {
            bar.finish_success(up.bytes_sent());
            journal.upload_done(&id, up.bytes_sent(), bar.elapsed_secs());
            Ok(())
        }
        Err(e) => {
            let msg = up.error().unwrap_or_else(|| e.to_string());
            bar.finish_error(&msg);
            journal.upload_failed(&id, up.bytes_sent(), &msg);
            Err(e).with_context(|| format!("upload {}", opts.file.display()))
        }
    }
}
