//! Operator event log: monthly rolling append-only file plus stdout echo.
//!
//! This is observable server behavior (distinct from the `tracing`
//! diagnostics): every line is stamped `YYYY-MM-DD HH:MM:SS` and appended to
//! `cute_server_YYYYMM.log` in the configured directory. Broadcast to
//! observers is done by the engine, which owns the subscriber list.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use tracing::warn;

pub struct EventLog {
    dir: PathBuf,
    echo_stdout: bool,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            echo_stdout: true,
        }
    }

    /// Silence the stdout echo (tests).
    pub fn quiet(mut self) -> Self {
        self.echo_stdout = false;
        self
    }

    /// Stamp, append to the monthly file, echo to stdout. Returns the
    /// stamped line so the caller can fan it out to observers.
    pub fn log_to_file(&self, text: &str) -> String {
        let now = Local::now();
        let line = format!("{} {}", now.format("%Y-%m-%d %H:%M:%S"), text);
        let path = self
            .dir
            .join(format!("cute_server_{}.log", now.format("%Y%m")));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!(error = %e, "event log write failed");
                }
            }
            Err(e) => warn!(error = %e, path = %path.display(), "event log open failed"),
        }
        if self.echo_stdout {
            println!("{line}");
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_stamped_lines_to_monthly_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).quiet();
        let line = log.log_to_file("control activated");
        assert!(line.ends_with("control activated"));
        // "YYYY-MM-DD HH:MM:SS " prefix is 20 chars.
        assert_eq!(&line[4..5], "-");
        assert_eq!(&line[19..20], " ");

        let name = format!("cute_server_{}.log", Local::now().format("%Y%m"));
        let content = std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert!(content.contains("control activated"));

        log.log_to_file("second line");
        let name = format!("cute_server_{}.log", Local::now().format("%Y%m"));
        let content = std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
