//! CSV report streams and run-level counters.

use crate::error::Result;
use crate::types::{RunCounters, RunSummary};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// UTF-8 byte-order mark so spreadsheet tools pick the right encoding.
const BOM: &str = "\u{FEFF}";

const REPORT_HEADER: &[&str] =
    &["Original URL", "Migration URL", "Metric", "Original Value", "Migration Value", "Pass or Fail"];
const STORED_REPORT_HEADER: &[&str] = &[
    "Original URL (Stored Data)",
    "Migration URL",
    "Metric",
    "Original Value",
    "Migration Value",
    "Pass or Fail",
];
const ERROR_HEADER: &[&str] = &["URL", "Error"];

/// An append-only CSV sink, created lazily on first write.
struct ReportStream {
    path: PathBuf,
    file: File,
    lines: u64,
}

impl ReportStream {
    fn create(path: PathBuf, header: &[&str]) -> Result<Self> {
        let mut file = OpenOptions::new().create(true).truncate(true).write(true).open(&path)?;
        file.write_all(BOM.as_bytes())?;
        file.write_all(csv_line(header).as_bytes())?;
        Ok(Self { path, file, lines: 1 })
    }

    fn write_row(&mut self, fields: &[&str]) -> Result<()> {
        self.file.write_all(csv_line(fields).as_bytes())?;
        self.lines += 1;
        Ok(())
    }
}

pub struct Reporter {
    dir: PathBuf,
    stamp: String,
    stored: bool,
    report: Option<ReportStream>,
    error: Option<ReportStream>,
    counters: RunCounters,
}

impl Reporter {
    pub fn new(dir: &Path, stored: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            stamp: chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string(),
            stored,
            report: None,
            error: None,
            counters: RunCounters::default(),
        })
    }

    fn report_stream(&mut self) -> Result<&mut ReportStream> {
        if self.report.is_none() {
            let path = self.dir.join(format!("report_{}.csv", self.stamp));
            let header = if self.stored { STORED_REPORT_HEADER } else { REPORT_HEADER };
            self.report = Some(ReportStream::create(path, header)?);
        }
        Ok(self.report.as_mut().expect("stream just created"))
    }

    fn error_stream(&mut self) -> Result<&mut ReportStream> {
        if self.error.is_none() {
            let path = self.dir.join(format!("errors_{}.csv", self.stamp));
            self.error = Some(ReportStream::create(path, ERROR_HEADER)?);
        }
        Ok(self.error.as_mut().expect("stream just created"))
    }

    pub fn report_row(
        &mut self,
        original_url: &str,
        migration_url: &str,
        metric: &str,
        original_value: &str,
        migration_value: &str,
        passed: bool,
    ) -> Result<()> {
        let verdict = if passed { "Pass" } else { "Fail" };
        self.report_stream()?.write_row(&[
            original_url,
            migration_url,
            metric,
            original_value,
            migration_value,
            verdict,
        ])
    }

    /// One row per permanently-failed or transport-error URL.
    pub fn error_row(&mut self, url: &str, error: &str) -> Result<()> {
        self.counters.urls_with_fetch_errors += 1;
        self.error_stream()?.write_row(&[url, error])
    }

    pub fn counters_mut(&mut self) -> &mut RunCounters {
        &mut self.counters
    }

    /// Total lines written across both streams, headers included.
    pub fn lines_written(&self) -> u64 {
        self.report.as_ref().map(|s| s.lines).unwrap_or(0)
            + self.error.as_ref().map(|s| s.lines).unwrap_or(0)
    }

    pub fn summary(&self) -> RunSummary {
        let mut files = Vec::new();
        if let Some(s) = &self.report {
            files.push(s.path.clone());
        }
        if let Some(s) = &self.error {
            files.push(s.path.clone());
        }
        RunSummary {
            urls_with_failed_tests: self.counters.urls_with_failed_tests,
            urls_with_fetch_errors: self.counters.urls_with_fetch_errors,
            report_files: files,
        }
    }
}

fn csv_line(fields: &[&str]) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&csv_escape(field));
    }
    out.push('\n');
    out
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
