//! Batch orchestrator: windows the URL queue, fetches origin/target pairs
//! concurrently, drives extraction and comparison, and feeds the reporter.

use crate::compare::{self, CompareCx, Verdict};
use crate::error::Result;
use crate::extract::extract;
use crate::fetch::Fetcher;
use crate::log::RunLogger;
use crate::normalize::{target_url, UrlRules};
use crate::registry::TestRegistry;
use crate::report::Reporter;
use crate::store::StoredRun;
use crate::types::{Endpoint, FetchOutcome, RunSummary, Settings, UrlRecord};
use futures_util::future::join_all;
use std::collections::VecDeque;
use std::time::Duration;

/// A URL that failed transport is requeued at the tail up to this many times
/// before it is written off as permanently failed.
const MAX_RETRIES: u32 = 3;

/// Where the origin side of each comparison comes from.
pub enum OriginSource {
    /// Fetch the pre-migration site live.
    Live,
    /// Reconstruct origin values from a previously-saved report.
    Stored(StoredRun),
}

#[derive(Debug, Clone)]
struct QueueEntry {
    url: String,
    section: String,
    attempts: u32,
}

enum PairOutcome {
    Fetched { origin: Option<FetchOutcome>, target: FetchOutcome },
    Retry(String),
    Failed(String),
}

pub struct Engine<'a> {
    pub settings: &'a Settings,
    pub registry: &'a TestRegistry,
    pub rules: &'a UrlRules,
    pub fetcher: &'a dyn Fetcher,
    pub logger: &'a RunLogger,
}

impl<'a> Engine<'a> {
    /// Run the whole URL set to completion. Batches are strictly sequential;
    /// within one batch every (origin, target) pair is in flight at once.
    pub async fn run(
        &self,
        urls: Vec<UrlRecord>,
        origin_source: &OriginSource,
        reporter: &mut Reporter,
    ) -> Result<RunSummary> {
        let mut queue: VecDeque<QueueEntry> = urls
            .into_iter()
            .skip(self.settings.offset)
            .map(|r| QueueEntry { url: r.url, section: r.section, attempts: 0 })
            .collect();

        let _ = self.logger.info(
            None,
            "run_start",
            Some(&format!("{} urls, batch {}", queue.len(), self.settings.batch)),
        );

        let mut batch_no = 0usize;
        while !queue.is_empty() {
            if batch_no > 0 && self.settings.sleep_secs > 0 {
                tokio::time::sleep(Duration::from_secs(self.settings.sleep_secs)).await;
            }
            batch_no += 1;

            let window: Vec<QueueEntry> =
                (0..self.settings.batch).filter_map(|_| queue.pop_front()).collect();
            let _ = self.logger.info(
                None,
                "batch_start",
                Some(&format!("batch {} ({} urls)", batch_no, window.len())),
            );

            let outcomes =
                join_all(window.iter().map(|entry| self.fetch_pair(entry, origin_source))).await;

            for (entry, outcome) in window.into_iter().zip(outcomes) {
                match outcome {
                    PairOutcome::Fetched { origin, target } => {
                        self.process(&entry, origin.as_ref(), &target, origin_source, reporter)?;
                    }
                    PairOutcome::Retry(message) => {
                        let tries = entry.attempts + 1;
                        if tries <= MAX_RETRIES {
                            reporter.counters_mut().retry_counts.insert(entry.url.clone(), tries);
                            let _ = self.logger.info(
                                Some(&entry.url),
                                "requeued",
                                Some(&format!("attempt {}: {}", tries, message)),
                            );
                            queue.push_back(QueueEntry { attempts: tries, ..entry });
                        } else {
                            let _ = self.logger.error(Some(&entry.url), "gave_up", Some(&message));
                            reporter.error_row(&entry.url, &message)?;
                        }
                    }
                    PairOutcome::Failed(message) => {
                        let _ = self.logger.error(Some(&entry.url), "fetch_failed", Some(&message));
                        reporter.error_row(&entry.url, &message)?;
                    }
                }
            }
        }

        let summary = reporter.summary();
        let _ = self.logger.info(
            None,
            "run_done",
            Some(&format!(
                "{} urls with failed tests, {} fetch errors",
                summary.urls_with_failed_tests, summary.urls_with_fetch_errors
            )),
        );
        Ok(summary)
    }

    /// Fetch both endpoints for one URL. A retryable failure on either leg
    /// discards both results and requeues the URL.
    async fn fetch_pair(&self, entry: &QueueEntry, origin_source: &OriginSource) -> PairOutcome {
        let migration_url = match target_url(&entry.url, self.rules) {
            Ok(u) => u,
            Err(e) => return PairOutcome::Failed(e.to_string()),
        };
        let auth = self.settings.auth.as_ref();

        match origin_source {
            OriginSource::Live => {
                let (origin, target) = tokio::join!(
                    self.fetcher.fetch(Endpoint::Origin, &entry.url, None),
                    self.fetcher.fetch(Endpoint::Target, &migration_url, auth),
                );
                match (origin, target) {
                    (Ok(origin), Ok(target)) => {
                        PairOutcome::Fetched { origin: Some(origin), target }
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        if e.retryable {
                            PairOutcome::Retry(e.message)
                        } else {
                            PairOutcome::Failed(e.message)
                        }
                    }
                }
            }
            OriginSource::Stored(_) => {
                match self.fetcher.fetch(Endpoint::Target, &migration_url, auth).await {
                    Ok(target) => PairOutcome::Fetched { origin: None, target },
                    Err(e) if e.retryable => PairOutcome::Retry(e.message),
                    Err(e) => PairOutcome::Failed(e.message),
                }
            }
        }
    }

    fn process(
        &self,
        entry: &QueueEntry,
        origin: Option<&FetchOutcome>,
        target: &FetchOutcome,
        origin_source: &OriginSource,
        reporter: &mut Reporter,
    ) -> Result<()> {
        let migration_url = target_url(&entry.url, self.rules)?;
        let cx = CompareCx {
            mode: self.settings.output_mode,
            current_url: &entry.url,
            rules: self.rules,
            stored_origin: matches!(origin_source, OriginSource::Stored(_)),
        };

        let mut any_failed = false;
        for spec in self.registry.applicable_tests(&entry.section) {
            let metric = compare::display_name(spec, self.settings.output_mode);
            let origin_raw = match (origin_source, origin) {
                (OriginSource::Stored(run), _) => run.origin_value(&entry.url, &spec.name),
                (OriginSource::Live, Some(outcome)) => extract(spec, Endpoint::Origin, outcome)?,
                (OriginSource::Live, None) => continue,
            };
            let target_raw = extract(spec, Endpoint::Target, target)?;

            let cmp = compare::compare(spec, &origin_raw, &target_raw, &cx)?;
            if cmp.verdict == Verdict::Skip {
                continue;
            }
            let passed = cmp.verdict == Verdict::Pass;
            if !passed {
                any_failed = true;
            }
            reporter.report_row(
                &entry.url,
                &migration_url,
                &metric,
                &cmp.origin,
                &cmp.target,
                passed,
            )?;
        }

        if any_failed {
            reporter.counters_mut().urls_with_failed_tests += 1;
            let _ = self.logger.info(Some(&entry.url), "tests_failed", None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TestRegistry;
    use crate::types::{
        BasicAuth, FetchFailure, OutputMode, SourceKind, TestGroup, TestSpec,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Scripted fetcher: per-URL canned responses or failure scripts.
    struct ScriptedFetcher {
        pages: HashMap<String, (u16, String)>,
        // urls that always fail transport, with a hit counter
        flaky: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedFetcher {
        fn new(pages: &[(&str, u16, &str)], flaky: &[&str]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(u, code, body)| (u.to_string(), (*code, body.to_string())))
                    .collect(),
                flaky: Mutex::new(flaky.iter().map(|u| (u.to_string(), 0)).collect()),
            }
        }

        fn flaky_hits(&self, url: &str) -> u32 {
            *self.flaky.lock().expect("lock").get(url).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(
            &self,
            endpoint: Endpoint,
            url: &str,
            _auth: Option<&BasicAuth>,
        ) -> std::result::Result<FetchOutcome, FetchFailure> {
            if let Some(hits) = self.flaky.lock().expect("lock").get_mut(url) {
                *hits += 1;
                return Err(FetchFailure::retryable("connection refused"));
            }
            let (code, body) = self
                .pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchFailure::retryable(format!("no route to {url}")))?;
            let status_line = format!("HTTP/1.1 {code} XX");
            let headers = format!("{status_line}\r\ncontent-type: text/html");
            Ok(FetchOutcome {
                endpoint,
                url: url.to_string(),
                status_line,
                first_headers: headers.clone(),
                last_headers: headers,
                body,
                http_code: code,
            })
        }
    }

    fn settings() -> Settings {
        Settings {
            domain: "new.example.com".into(),
            auth: None,
            batch: 2,
            offset: 0,
            timeout_secs: 5,
            sleep_secs: 0,
            output_mode: OutputMode::None,
            rewrites: vec![],
            tests: vec![TestGroup {
                sections: "all".into(),
                tests: vec![
                    TestSpec {
                        id: "title".into(),
                        name: "Title".into(),
                        source: Some(SourceKind::Body),
                        selector: Some(r"<title>(?P<result>[^<]*)</title>".into()),
                        selector_target: None,
                        callback: None,
                        callback_args: vec![],
                    },
                    TestSpec {
                        id: "http-status".into(),
                        name: "HTTP status".into(),
                        source: Some(SourceKind::LastHeader),
                        selector: Some(r"HTTP/[\d.]+ (?P<result>\d+)".into()),
                        selector_target: None,
                        callback: None,
                        callback_args: vec![],
                    },
                ],
            }],
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("siteparity-engine-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    async fn run_engine(
        settings: &Settings,
        fetcher: &dyn Fetcher,
        urls: Vec<UrlRecord>,
        dir: &PathBuf,
    ) -> (RunSummary, String) {
        let registry = TestRegistry::new(&settings.tests);
        let rules = UrlRules::from_settings(settings).expect("rules");
        let logger = RunLogger::new(dir).expect("logger");
        let mut reporter = Reporter::new(dir, false).expect("reporter");
        let engine = Engine { settings, registry: &registry, rules: &rules, fetcher, logger: &logger };
        let summary = engine
            .run(urls, &OriginSource::Live, &mut reporter)
            .await
            .expect("run");
        let report = summary
            .report_files
            .iter()
            .find(|p| p.file_name().map(|n| n.to_string_lossy().starts_with("report")) == Some(true))
            .map(|p| std::fs::read_to_string(p).expect("read report"))
            .unwrap_or_default();
        (summary, report)
    }

    #[tokio::test]
    async fn matching_titles_pass_end_to_end() {
        let s = settings();
        let fetcher = ScriptedFetcher::new(
            &[
                ("https://old.example.com/a", 200, "<title>Hello</title>"),
                ("https://new.example.com/a", 200, "<title>Hello</title>"),
            ],
            &[],
        );
        let dir = temp_dir("pass");
        let urls = vec![UrlRecord { url: "https://old.example.com/a".into(), section: "post".into() }];
        let (summary, report) = run_engine(&s, &fetcher, urls, &dir).await;

        assert_eq!(summary.urls_with_failed_tests, 0);
        assert_eq!(summary.urls_with_fetch_errors, 0);
        assert!(report.contains("https://old.example.com/a,https://new.example.com/a,Title,Hello,Hello,Pass"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn status_mismatch_fails_with_both_codes() {
        let mut s = settings();
        s.tests[0].tests.remove(0); // keep only the http-status test
        let fetcher = ScriptedFetcher::new(
            &[
                ("https://old.example.com/a", 200, "<html></html>"),
                ("https://new.example.com/a", 301, "<html></html>"),
            ],
            &[],
        );
        let dir = temp_dir("status");
        let urls = vec![UrlRecord { url: "https://old.example.com/a".into(), section: "post".into() }];
        let (summary, report) = run_engine(&s, &fetcher, urls, &dir).await;

        assert_eq!(summary.urls_with_failed_tests, 1);
        assert!(report.contains("HTTP status,200,301,Fail"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn transport_failures_retry_three_times_then_error_once() {
        let s = settings();
        let fetcher = ScriptedFetcher::new(
            &[("https://new.example.com/a", 200, "<title>x</title>")],
            &["https://old.example.com/a"],
        );
        let dir = temp_dir("retry");
        let urls = vec![UrlRecord { url: "https://old.example.com/a".into(), section: "post".into() }];
        let (summary, report) = run_engine(&s, &fetcher, urls, &dir).await;

        // initial attempt + 3 retries
        assert_eq!(fetcher.flaky_hits("https://old.example.com/a"), 4);
        assert_eq!(summary.urls_with_fetch_errors, 1);
        // never reached the comparison report
        assert!(!report.contains("https://old.example.com/a"));
        let errors = summary
            .report_files
            .iter()
            .find(|p| p.file_name().map(|n| n.to_string_lossy().starts_with("errors")) == Some(true))
            .map(|p| std::fs::read_to_string(p).expect("read errors"))
            .expect("error stream exists");
        assert_eq!(errors.matches("https://old.example.com/a").count(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn offset_skips_leading_urls() {
        let mut s = settings();
        s.offset = 1;
        let fetcher = ScriptedFetcher::new(
            &[
                ("https://old.example.com/b", 200, "<title>B</title>"),
                ("https://new.example.com/b", 200, "<title>B</title>"),
            ],
            &[],
        );
        let dir = temp_dir("offset");
        let urls = vec![
            UrlRecord { url: "https://old.example.com/a".into(), section: "post".into() },
            UrlRecord { url: "https://old.example.com/b".into(), section: "post".into() },
        ];
        let (summary, report) = run_engine(&s, &fetcher, urls, &dir).await;

        assert_eq!(summary.urls_with_fetch_errors, 0);
        assert!(!report.contains("/a,"));
        assert!(report.contains("https://old.example.com/b"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn stored_origin_skips_origin_fetch() {
        let s = settings();
        let fetcher = ScriptedFetcher::new(
            &[("https://new.example.com/a", 200, "<title>Hello</title>")],
            &[],
        );
        let dir = temp_dir("stored");
        let stored_csv = dir.join("previous.csv");
        std::fs::create_dir_all(&dir).expect("dir");
        std::fs::write(
            &stored_csv,
            "Original URL,Migration URL,Metric,Original Value,Migration Value,Pass or Fail\n\
             https://old.example.com/a,https://new.example.com/a,Title,Hello,old,Fail\n\
             https://old.example.com/a,https://new.example.com/a,HTTP status,200,200,Pass\n",
        )
        .expect("write stored");

        let registry = TestRegistry::new(&s.tests);
        let rules = UrlRules::from_settings(&s).expect("rules");
        let logger = RunLogger::new(&dir).expect("logger");
        let mut reporter = Reporter::new(&dir, true).expect("reporter");
        let engine = Engine {
            settings: &s,
            registry: &registry,
            rules: &rules,
            fetcher: &fetcher,
            logger: &logger,
        };
        let stored = StoredRun::load(&stored_csv).expect("stored");
        let urls = vec![UrlRecord { url: "https://old.example.com/a".into(), section: "post".into() }];
        let summary = engine
            .run(urls, &OriginSource::Stored(stored), &mut reporter)
            .await
            .expect("run");

        assert_eq!(summary.urls_with_fetch_errors, 0);
        assert_eq!(summary.urls_with_failed_tests, 0);
        let report = std::fs::read_to_string(&summary.report_files[0]).expect("read");
        assert!(report.contains("Original URL (Stored Data)"));
        assert!(report.contains("Title,Hello,Hello,Pass"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn stored_matching_uses_the_section_scoped_definition() {
        let mut s = settings();
        s.tests[0].tests.truncate(1); // keep the all-group Title only
        s.tests.push(TestGroup {
            sections: "post".into(),
            tests: vec![TestSpec {
                id: "title".into(),
                name: "Post title".into(),
                source: Some(SourceKind::Body),
                selector: Some(r"<title>(?P<result>[^<]*)</title>".into()),
                selector_target: None,
                callback: None,
                callback_args: vec![],
            }],
        });
        let fetcher = ScriptedFetcher::new(
            &[("https://new.example.com/a", 200, "<title>Hello</title>")],
            &[],
        );
        let dir = temp_dir("stored-section");
        std::fs::create_dir_all(&dir).expect("dir");
        let stored_csv = dir.join("previous.csv");
        std::fs::write(
            &stored_csv,
            "Original URL,Migration URL,Metric,Original Value,Migration Value,Pass or Fail\n\
             https://old.example.com/a,https://new.example.com/a,Post title,Hello,Hello,Pass\n\
             https://old.example.com/a,https://new.example.com/a,Title,WRONG,WRONG,Pass\n",
        )
        .expect("write stored");

        let registry = TestRegistry::new(&s.tests);
        let rules = UrlRules::from_settings(&s).expect("rules");
        let logger = RunLogger::new(&dir).expect("logger");
        let mut reporter = Reporter::new(&dir, true).expect("reporter");
        let engine = Engine {
            settings: &s,
            registry: &registry,
            rules: &rules,
            fetcher: &fetcher,
            logger: &logger,
        };
        let stored = StoredRun::load(&stored_csv).expect("stored");
        let urls = vec![UrlRecord { url: "https://old.example.com/a".into(), section: "post".into() }];
        let summary = engine
            .run(urls, &OriginSource::Stored(stored), &mut reporter)
            .await
            .expect("run");

        // the post-scoped redefinition of the test id wins over the all group,
        // so the stored row is matched under its display name
        assert_eq!(summary.urls_with_failed_tests, 0);
        let report = std::fs::read_to_string(&summary.report_files[0]).expect("read");
        assert!(report.contains("Post title,Hello,Hello,Pass"));
        assert!(!report.contains("WRONG"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn retry_count_never_exceeds_the_retry_cap() {
        let s = settings();
        let fetcher = ScriptedFetcher::new(
            &[("https://new.example.com/a", 200, "<title>x</title>")],
            &["https://old.example.com/a"],
        );
        let dir = temp_dir("retry-cap");
        let registry = TestRegistry::new(&s.tests);
        let rules = UrlRules::from_settings(&s).expect("rules");
        let logger = RunLogger::new(&dir).expect("logger");
        let mut reporter = Reporter::new(&dir, false).expect("reporter");
        let engine = Engine {
            settings: &s,
            registry: &registry,
            rules: &rules,
            fetcher: &fetcher,
            logger: &logger,
        };
        let urls = vec![UrlRecord { url: "https://old.example.com/a".into(), section: "post".into() }];
        engine
            .run(urls, &OriginSource::Live, &mut reporter)
            .await
            .expect("run");

        assert_eq!(
            reporter.counters_mut().retry_counts.get("https://old.example.com/a"),
            Some(&MAX_RETRIES)
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn logging_failures_do_not_break_the_run() {
        let s = settings();
        let fetcher = ScriptedFetcher::new(
            &[
                ("https://old.example.com/a", 200, "<title>Hello</title>"),
                ("https://new.example.com/a", 200, "<title>Hello</title>"),
            ],
            &[],
        );
        let log_dir = temp_dir("logless");
        let out_dir = temp_dir("logless-out");
        let logger = RunLogger::new(&log_dir).expect("logger");
        // every subsequent log write fails with NotFound
        std::fs::remove_dir_all(&log_dir).expect("remove log dir");

        let registry = TestRegistry::new(&s.tests);
        let rules = UrlRules::from_settings(&s).expect("rules");
        let mut reporter = Reporter::new(&out_dir, false).expect("reporter");
        let engine = Engine {
            settings: &s,
            registry: &registry,
            rules: &rules,
            fetcher: &fetcher,
            logger: &logger,
        };
        let urls = vec![UrlRecord { url: "https://old.example.com/a".into(), section: "post".into() }];
        let summary = engine
            .run(urls, &OriginSource::Live, &mut reporter)
            .await
            .expect("run despite dead logger");

        assert!(summary.clean());
        let report = std::fs::read_to_string(&summary.report_files[0]).expect("read");
        assert!(report.contains("Title,Hello,Hello,Pass"));
        let _ = std::fs::remove_dir_all(&out_dir);
    }
}
