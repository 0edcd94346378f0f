use buildloop_core::{Result, runtime_dir};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Appends timestamped run diagnostics to a log file under the runtime dir,
/// mirroring to stderr when verbose mode is on. Log-write failures are
/// swallowed by the convenience methods so diagnostics never take a build
/// down with them.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("run.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Record a run event. Mirrored to stderr when verbose.
    pub fn event(&self, msg: &str) {
        if self.verbose {
            eprintln!("[buildloop] {msg}");
        }
        let _ = self.append_log_line(&format!("{} EVENT {msg}", Utc::now().to_rfc3339()));
    }

    /// Record a warning — always written to stderr and the log file.
    pub fn warn(&self, msg: &str) {
        eprintln!("[buildloop WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
