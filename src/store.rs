//! Loading of the URL universe and of previously-saved report data.

use crate::error::{ParityError, Result};
use crate::types::{UrlRecord, NA};
use std::collections::HashMap;
use std::path::Path;

const METRIC_SUFFIXES: &[&str] = &[" (difference only)", " (missing in target only)"];

/// Load the ordered `url,section` mapping the run iterates over.
pub fn load_url_map(path: &Path) -> Result<Vec<UrlRecord>> {
    let text = std::fs::read_to_string(path)?;
    let mut out = Vec::new();
    for record in parse_csv(&text) {
        if record.is_empty() || record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let url = record[0].trim().to_string();
        if url.eq_ignore_ascii_case("url") {
            // header row
            continue;
        }
        let section = record.get(1).map(|s| s.trim()).unwrap_or("").to_string();
        if section.is_empty() {
            return Err(ParityError::config(format!("url '{url}' has no section")));
        }
        out.push(UrlRecord { url, section });
    }
    if out.is_empty() {
        return Err(ParityError::config(format!("no urls in {}", path.display())));
    }
    Ok(out)
}

/// A previously-saved report, used to reconstruct the origin side of the
/// comparison without re-fetching the pre-migration site.
#[derive(Debug, Default)]
pub struct StoredRun {
    // url -> [(metric, original value)]
    rows: HashMap<String, Vec<(String, String)>>,
}

impl StoredRun {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut rows: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for (idx, record) in parse_csv(&text).into_iter().enumerate() {
            if idx == 0 {
                // header row
                continue;
            }
            if record.len() < 4 {
                continue;
            }
            let url = record[0].trim().to_string();
            let metric = base_metric(record[2].trim());
            let value = record[3].clone();
            rows.entry(url).or_default().push((metric, value));
        }
        if rows.is_empty() {
            return Err(ParityError::config(format!(
                "no stored rows in {}",
                path.display()
            )));
        }
        Ok(Self { rows })
    }

    /// The stored origin value for (url, metric display name), `N/A` when
    /// the stored run never recorded that metric for that URL.
    pub fn origin_value(&self, url: &str, metric: &str) -> String {
        let wanted = base_metric(metric);
        self.rows
            .get(url)
            .and_then(|metrics| {
                metrics.iter().find(|(m, _)| *m == wanted).map(|(_, v)| v.clone())
            })
            .unwrap_or_else(|| NA.to_string())
    }
}

/// Strip the output-mode suffix a stored run may have appended to a metric
/// name, so rows match their configured test across output modes.
fn base_metric(metric: &str) -> String {
    for suffix in METRIC_SUFFIXES {
        if let Some(stripped) = metric.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    metric.to_string()
}

/// Quote-aware CSV parsing; handles embedded commas, doubled quotes and
/// newlines inside quoted fields (report values can be pretty-printed JSON).
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(text);
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                other => field.push(other),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => {
                record.push(std::mem::take(&mut field));
            }
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            other => field.push(other),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}
