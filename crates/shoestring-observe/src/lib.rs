use anyhow::Result;
use chrono::Utc;
use shoestring_core::runtime_dir;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Run log plus optional verbose mirror to stderr. Every pipeline stage
/// transition lands in `.shoestring/observe.log` regardless of verbosity.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Log a message to stderr with a `[shoestring]` prefix when verbose
    /// mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[shoestring] {msg}");
        }
    }

    /// Log a warning to stderr and to the log file, always.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[shoestring WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    /// Record one pipeline stage transition for a subtask.
    pub fn stage_log(&self, task_id: u64, stage: &str, detail: &str) {
        self.verbose_log(&format!("task {task_id}: {stage} {detail}"));
        let _ = self.append_log_line(&format!(
            "{} STAGE task={task_id} stage={stage} {detail}",
            Utc::now().to_rfc3339()
        ));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_transitions_land_in_the_log_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let observer = Observer::new(dir.path()).expect("observer");
        observer.stage_log(3, "skills", "selected=python-style");
        observer.warn_log("model returned unparseable plan");

        let log = std::fs::read_to_string(dir.path().join(".shoestring/observe.log"))
            .expect("log file");
        assert!(log.contains("STAGE task=3 stage=skills selected=python-style"));
        assert!(log.contains("WARN model returned unparseable plan"));
    }

    #[test]
    fn verbose_defaults_off() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut observer = Observer::new(dir.path()).expect("observer");
        assert!(!observer.is_verbose());
        observer.set_verbose(true);
        assert!(observer.is_verbose());
    }
}
