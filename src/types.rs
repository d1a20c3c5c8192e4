use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use url::Url;

/// Sentinel for "selector had no match" / absent data.
pub const NA: &str = "N/A";
/// Sentinel for "selector matched an empty string".
pub const EMPTY: &str = "EMPTY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain(pub String);

impl Domain {
    /// Canonicalize host to a stable key: lowercase + IDNA/Punycode
    fn canonicalize(host: &str) -> String {
        let lower = host.to_ascii_lowercase();
        idna::domain_to_ascii(&lower).unwrap_or(lower)
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        url.host_str().map(|h| Domain(Self::canonicalize(h)))
    }

    /// Build a Domain from raw user text (CLI, settings files, etc.)
    pub fn from_raw(host: &str) -> Self {
        Domain(Self::canonicalize(host))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Origin,
    Target,
}

/// One entry of the URL universe under test. Identity is the url string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRecord {
    pub url: String,
    pub section: String,
}

/// A completed HTTP exchange for one endpoint of a pair.
///
/// `first_headers`/`last_headers` are raw header blocks (status line +
/// headers); they differ when the request went through a redirect chain.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub endpoint: Endpoint,
    pub url: String,
    pub status_line: String,
    pub first_headers: String,
    pub last_headers: String,
    pub body: String,
    pub http_code: u16,
}

/// A failed HTTP exchange. Retryable failures (timeout, connection refused)
/// requeue the whole URL; terminal ones go straight to the error report.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub message: String,
    pub retryable: bool,
}

impl FetchFailure {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self { message: msg.into(), retryable: true }
    }
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self { message: msg.into(), retryable: false }
    }
}

/// Response source a selector is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Body,
    FirstHeader,
    LastHeader,
}

/// Closed set of comparison strategies. The `*_difference` / `*_missing`
/// entries are the output-mode variants substituted for their base strategy
/// when the run's output mode matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    #[serde(rename = "compare_case_insensitive")]
    CaseInsensitive,
    #[serde(rename = "compare_comma_separated")]
    CommaSeparated,
    #[serde(rename = "compare_date")]
    Date,
    #[serde(rename = "compare_presence")]
    Presence,
    #[serde(rename = "compare_with_regex")]
    WithRegex,
    #[serde(rename = "compare_with_transform")]
    WithTransform,
    #[serde(rename = "compare_images")]
    Images,
    #[serde(rename = "compare_images_count")]
    ImagesCount,
    #[serde(rename = "compare_schemas")]
    Schemas,
    #[serde(rename = "compare_schemas_difference")]
    SchemasDifference,
    #[serde(rename = "compare_schemas_missing")]
    SchemasMissing,
    #[serde(rename = "compare_gtm_data")]
    GtmData,
    #[serde(rename = "compare_gtm_data_difference")]
    GtmDataDifference,
    #[serde(rename = "compare_gtm_data_missing")]
    GtmDataMissing,
}

impl Strategy {
    /// The output-mode variant for this strategy, when one exists.
    pub fn mode_variant(self, mode: OutputMode) -> Option<Strategy> {
        match (self, mode) {
            (Strategy::Schemas, OutputMode::Difference) => Some(Strategy::SchemasDifference),
            (Strategy::Schemas, OutputMode::Missing) => Some(Strategy::SchemasMissing),
            (Strategy::GtmData, OutputMode::Difference) => Some(Strategy::GtmDataDifference),
            (Strategy::GtmData, OutputMode::Missing) => Some(Strategy::GtmDataMissing),
            _ => None,
        }
    }
}

/// Run-level narrowing of structural comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    None,
    Missing,
    Difference,
}

/// One extraction + comparison rule.
///
/// A spec with no source/selector is a name-only placeholder: it extracts
/// `N/A` on both sides unless its callback supplies the values itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub source: Option<SourceKind>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub selector_target: Option<String>,
    #[serde(default)]
    pub callback: Option<Strategy>,
    #[serde(default)]
    pub callback_args: Vec<String>,
}

/// A group of tests applying to `all` sections or a comma-separated list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestGroup {
    pub sections: String,
    pub tests: Vec<TestSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    pub pattern: String,
    pub replace: String,
}

fn default_batch() -> usize {
    25
}
fn default_timeout() -> u64 {
    30
}

/// Immutable run configuration, constructed once at startup and passed
/// explicitly to every component that needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Target (post-migration) host, bare domain without scheme.
    pub domain: String,
    #[serde(default)]
    pub auth: Option<BasicAuth>,
    #[serde(default = "default_batch")]
    pub batch: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub sleep_secs: u64,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default)]
    pub rewrites: Vec<RewriteRule>,
    pub tests: Vec<TestGroup>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunCounters {
    pub urls_with_failed_tests: usize,
    pub urls_with_fetch_errors: usize,
    pub retry_counts: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub urls_with_failed_tests: usize,
    pub urls_with_fetch_errors: usize,
    pub report_files: Vec<PathBuf>,
}

impl RunSummary {
    pub fn clean(&self) -> bool {
        self.urls_with_failed_tests == 0 && self.urls_with_fetch_errors == 0
    }
}
