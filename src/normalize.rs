//! Text and URL canonicalization shared by nearly every comparison.

use crate::error::{ParityError, Result};
use crate::types::{Domain, RewriteRule, Settings};
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

static WHITESPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static WP_UPLOADS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:/wp)?(?:/wp-content)?(/uploads/)").expect("valid regex"));
static CDN_SUFFIX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\?auto.*$").expect("valid regex"));

/// Decode HTML/XML entities and fold typographic punctuation to ASCII.
///
/// Entities are decoded until stable, so double-encoded text such as
/// `&amp;amp;` reduces all the way down.
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(text: &str) -> String {
    let mut decoded = html_escape::decode_html_entities(text).into_owned();
    // terminates: each pass that changes anything strictly shortens the text
    loop {
        let next = html_escape::decode_html_entities(&decoded).into_owned();
        if next == decoded {
            break;
        }
        decoded = next;
    }
    let mut out = String::with_capacity(decoded.len());
    for c in decoded.chars() {
        match c {
            // smart single quotes, low-9, high-reversed-9
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => out.push('\''),
            // smart double quotes, low/high variants
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => out.push('"'),
            // hyphen, non-breaking hyphen, figure/en/em/horizontal-bar dashes
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}' => {
                out.push('-')
            }
            '\u{2026}' => out.push_str("..."),
            '\u{00AB}' | '\u{00BB}' => out.push('"'),
            '\u{2039}' | '\u{203A}' => out.push('\''),
            '\u{2020}' => out.push('+'),
            '\u{2021}' => out.push_str("++"),
            '\u{2022}' => out.push('*'),
            '\u{2032}' => out.push('\''),
            '\u{2033}' => out.push('"'),
            '\u{2035}' => out.push('`'),
            '\u{2036}' => out.push('"'),
            other => out.push(other),
        }
    }
    out
}

/// Collapse runs of whitespace to single spaces and trim.
pub fn collapse_ws(text: &str) -> String {
    WHITESPACE_REGEX.replace_all(text, " ").trim().to_string()
}

/// Target domain plus the compiled URL-rewrite patterns, read-only for the
/// whole run.
#[derive(Debug)]
pub struct UrlRules {
    pub domain: Domain,
    pub rewrites: Vec<(Regex, String)>,
}

impl UrlRules {
    pub fn new(domain: &str, rules: &[RewriteRule]) -> Result<Self> {
        let mut rewrites = Vec::with_capacity(rules.len());
        for rule in rules {
            let re = Regex::new(&rule.pattern).map_err(|e| {
                ParityError::config(format!("bad rewrite pattern '{}': {}", rule.pattern, e))
            })?;
            rewrites.push((re, rule.replace.clone()));
        }
        Ok(Self { domain: Domain::from_raw(domain), rewrites })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(&settings.domain, &settings.rewrites)
    }

    fn apply_rewrites(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (re, rep) in &self.rewrites {
            out = re.replace_all(&out, rep.as_str()).into_owned();
        }
        out
    }
}

/// Reduce a URL to a comparable, host-relative form.
///
/// Only activates when `text` is an absolute http(s) URL whose host is the
/// target domain or the host of the URL currently under comparison; anything
/// else is returned unchanged. When active: rewrite patterns run in order
/// (each over the previous output), the result is reduced to its path, a
/// leading `/wp` and/or `/wp-content` before `/uploads/` is stripped along
/// with any `?auto...` CDN suffix, and the query string is dropped.
pub fn canonicalize_url(text: &str, current_url: &str, rules: &UrlRules) -> String {
    let candidate = text.trim();
    let parsed = match Url::parse(candidate) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => u,
        _ => return text.to_string(),
    };
    let host = match Domain::from_url(&parsed) {
        Some(h) => h,
        None => return text.to_string(),
    };
    let context_host = Url::parse(current_url).ok().and_then(|u| Domain::from_url(&u));
    if host != rules.domain && Some(&host) != context_host.as_ref() {
        return text.to_string();
    }

    let rewritten = rules.apply_rewrites(candidate);
    let mut relative = match Url::parse(&rewritten) {
        Ok(u) => {
            let mut rel = u.path().to_string();
            if let Some(q) = u.query() {
                rel.push('?');
                rel.push_str(q);
            }
            rel
        }
        // a rewrite produced something that no longer parses; compare as-is
        Err(_) => rewritten,
    };
    relative = WP_UPLOADS_REGEX.replace(&relative, "$1").into_owned();
    relative = CDN_SUFFIX_REGEX.replace(&relative, "").into_owned();
    match relative.split('?').next() {
        Some(path) => path.to_string(),
        None => relative,
    }
}

/// Derive the post-migration URL actually fetched for the target endpoint:
/// rewrite patterns over the full URL string, then the host swapped to the
/// target domain (scheme preserved).
pub fn target_url(url: &str, rules: &UrlRules) -> Result<String> {
    let rewritten = rules.apply_rewrites(url);
    let mut parsed =
        Url::parse(&rewritten).map_err(|_| ParityError::InvalidUrl(rewritten.clone()))?;
    parsed
        .set_host(Some(&rules.domain.0))
        .map_err(|_| ParityError::InvalidUrl(rules.domain.0.clone()))?;
    Ok(parsed.to_string())
}
