use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Append-only record of what the CLI did, one line per event.
pub trait Journal: Send + Sync {
    fn upload_start(&self, _transfer: &str, _src: &Path, _bytes: u64) {}
    fn upload_done(&self, _transfer: &str, _bytes: u64, _seconds: f64) {}
    fn upload_failed(&self, _transfer: &str, _bytes: u64, _msg: &str) {}
    fn request(&self, _request: &str, _outcome: &str) {}
}

pub struct NoopJournal;
impl Journal for NoopJournal {}

pub struct TextJournal {
    file: Mutex<File>,
}

impl TextJournal {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Journal for TextJournal {
    fn upload_start(&self, transfer: &str, src: &Path, bytes: u64) {
        self.line(&format!(
            "UPLOAD id={} src={} bytes={}",
            transfer,
            src.display(),
            bytes
        ));
    }
    fn upload_done(&self, transfer: &str, bytes: u64, seconds: f64) {
        self.line(&format!("DONE id={transfer} bytes={bytes} seconds={seconds:.3}"));
    }
    fn upload_failed(&self, transfer: &str, bytes: u64, msg: &str) {
        self.line(&format!("FAILED id={transfer} bytes={bytes} msg={msg}"));
    }
    fn request(&self, request: &str, outcome: &str) {
        self.line(&format!("REQUEST req={request} result={outcome}"));
    }
}
