//! Settings loading and fail-fast validation.

use crate::error::{ParityError, Result};
use crate::extract::compile_selector;
use crate::types::{Settings, Strategy};
use regex::Regex;
use std::path::{Path, PathBuf};

pub fn load_settings(path: &Path) -> Result<Settings> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ParityError::config(format!("cannot read {}: {}", path.display(), e)))?;
    let settings: Settings = serde_json::from_str(&text)
        .map_err(|e| ParityError::config(format!("invalid settings {}: {}", path.display(), e)))?;
    Ok(settings)
}

/// Default report location: `~/.siteparity/reports`.
pub fn default_report_dir() -> Result<PathBuf> {
    let user_dirs = directories::UserDirs::new()
        .ok_or_else(|| ParityError::config("could not determine home directory"))?;
    Ok(user_dirs.home_dir().join(".siteparity").join("reports"))
}

impl Settings {
    /// Validate everything that would otherwise fail mid-run: domain shape,
    /// batch size, every selector and every callback pattern. Runs before
    /// any fetching so configuration errors abort the whole run up front.
    pub fn validate(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            return Err(ParityError::config("domain is required"));
        }
        if self.domain.contains('/') || self.domain.contains(':') {
            return Err(ParityError::config(format!(
                "domain '{}' must be a bare host, without scheme or path",
                self.domain
            )));
        }
        if self.batch == 0 {
            return Err(ParityError::config("batch must be at least 1"));
        }
        for rule in &self.rewrites {
            Regex::new(&rule.pattern).map_err(|e| {
                ParityError::config(format!("bad rewrite pattern '{}': {}", rule.pattern, e))
            })?;
        }

        for group in &self.tests {
            if group.sections.split(',').all(|s| s.trim().is_empty()) {
                return Err(ParityError::config("test group with empty sections list"));
            }
            let mut seen = std::collections::HashSet::new();
            for spec in &group.tests {
                if spec.id.trim().is_empty() {
                    return Err(ParityError::config(format!(
                        "test '{}' has an empty id",
                        spec.name
                    )));
                }
                if !seen.insert(spec.id.as_str()) {
                    return Err(ParityError::config(format!(
                        "test id '{}' duplicated within group '{}'",
                        spec.id, group.sections
                    )));
                }
                for selector in [&spec.selector, &spec.selector_target].into_iter().flatten() {
                    compile_selector(selector)?;
                }
                validate_callback(spec.callback, &spec.callback_args, &spec.id)?;
            }
        }
        Ok(())
    }
}

fn validate_callback(callback: Option<Strategy>, args: &[String], id: &str) -> Result<()> {
    if args.len() > 3 {
        return Err(ParityError::config(format!("test '{id}': more than 3 callback args")));
    }
    let compile = |pattern: &String| {
        Regex::new(pattern).map(|_| ()).map_err(|e| {
            ParityError::config(format!("test '{id}': bad callback pattern '{pattern}': {e}"))
        })
    };
    match callback {
        Some(Strategy::WithRegex) => {
            if args.is_empty() {
                return Err(ParityError::config(format!(
                    "test '{id}': compare_with_regex needs a pattern"
                )));
            }
            args.iter().try_for_each(compile)?;
        }
        Some(Strategy::WithTransform) => {
            if args.len() < 2 {
                return Err(ParityError::config(format!(
                    "test '{id}': compare_with_transform needs two patterns"
                )));
            }
            args.iter().try_for_each(compile)?;
        }
        Some(Strategy::Images) | Some(Strategy::ImagesCount) => {
            args.iter().try_for_each(compile)?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SourceKind, TestGroup, TestSpec};

    fn base_settings() -> Settings {
        Settings {
            domain: "new.example.com".into(),
            auth: None,
            batch: 10,
            offset: 0,
            timeout_secs: 30,
            sleep_secs: 0,
            output_mode: Default::default(),
            rewrites: vec![],
            tests: vec![TestGroup {
                sections: "all".into(),
                tests: vec![TestSpec {
                    id: "title".into(),
                    name: "Title".into(),
                    source: Some(SourceKind::Body),
                    selector: Some(r"<title>(?P<result>[^<]*)</title>".into()),
                    selector_target: None,
                    callback: None,
                    callback_args: vec![],
                }],
            }],
        }
    }

    #[test]
    fn valid_settings_pass() {
        base_settings().validate().expect("valid");
    }

    #[test]
    fn domain_must_be_bare_host() {
        let mut s = base_settings();
        s.domain = "https://new.example.com".into();
        assert!(s.validate().is_err());
        s.domain = "".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn zero_batch_is_rejected() {
        let mut s = base_settings();
        s.batch = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn selectors_must_carry_the_result_group() {
        let mut s = base_settings();
        s.tests[0].tests[0].selector = Some(r"<title>([^<]*)</title>".into());
        assert!(s.validate().is_err());
    }

    #[test]
    fn duplicate_ids_within_a_group_are_rejected() {
        let mut s = base_settings();
        let dup = s.tests[0].tests[0].clone();
        s.tests[0].tests.push(dup);
        assert!(s.validate().is_err());
    }

    #[test]
    fn transform_needs_two_patterns() {
        let mut s = base_settings();
        s.tests[0].tests[0].callback = Some(Strategy::WithTransform);
        s.tests[0].tests[0].callback_args = vec![r"(?P<n>\w+)".into()];
        assert!(s.validate().is_err());
        s.tests[0].tests[0].callback_args =
            vec![r"(?P<n>\w+)".into(), r"(?P<n>\w+)".into()];
        s.validate().expect("valid");
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let json = r#"{
            "domain": "new.example.com",
            "tests": [
                {"sections": "all", "tests": [
                    {"id": "status", "name": "HTTP status",
                     "source": "last_header",
                     "selector": "HTTP/[\\d.]+ (?P<result>\\d+)"}
                ]},
                {"sections": "post,page", "tests": [
                    {"id": "gtm", "name": "GTM data",
                     "source": "body",
                     "selector": "dataLayer = (?P<result>\\{.*?\\});",
                     "callback": "compare_gtm_data"}
                ]}
            ]
        }"#;
        let s: Settings = serde_json::from_str(json).expect("parse");
        assert_eq!(s.batch, 25);
        assert_eq!(s.timeout_secs, 30);
        assert_eq!(s.tests[1].tests[0].callback, Some(Strategy::GtmData));
        s.validate().expect("valid");
    }
}
