//! Append-only activity log for a run.

use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Info,
    Error,
}

/// Writes timestamped lines to `activity.log` in the output directory.
/// Logging failures are ignored by callers so they never break a run.
pub struct RunLogger {
    log_path: PathBuf,
}

impl RunLogger {
    pub fn new(out_dir: &Path) -> crate::Result<Self> {
        std::fs::create_dir_all(out_dir)?;
        Ok(Self { log_path: out_dir.join("activity.log") })
    }

    pub fn log(
        &self,
        level: LogLevel,
        url: Option<&str>,
        event: &str,
        details: Option<&str>,
    ) -> crate::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.log_path)?;

        let level_str = match level {
            LogLevel::Info => "INFO ",
            LogLevel::Error => "ERROR",
        };

        writeln!(
            file,
            "{} {} {} {} {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            level_str,
            event,
            url.unwrap_or("*"),
            details.unwrap_or("")
        )?;

        Ok(())
    }

    pub fn info(&self, url: Option<&str>, event: &str, details: Option<&str>) -> crate::Result<()> {
        self.log(LogLevel::Info, url, event, details)
    }

    pub fn error(&self, url: Option<&str>, event: &str, details: Option<&str>) -> crate::Result<()> {
        self.log(LogLevel::Error, url, event, details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_appending_lines() {
        let dir = std::env::temp_dir().join(format!("siteparity-log-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let logger = RunLogger::new(&dir).expect("logger");
        logger.info(None, "run_start", Some("3 urls")).expect("log");
        logger.error(Some("https://o/x"), "fetch_failed", Some("timeout")).expect("log");

        let content = std::fs::read_to_string(dir.join("activity.log")).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("INFO  run_start * 3 urls"));
        assert!(lines[1].contains("ERROR fetch_failed https://o/x timeout"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
