//! Comparison strategy library.
//!
//! Every strategy is a pure function from the two extracted values to a
//! verdict plus the values to display in the report; nothing is rewritten
//! by reference.

use crate::error::{ParityError, Result};
use crate::normalize::{canonicalize_url, normalize, UrlRules};
use crate::schema::{
    diff_is_empty, extract_schema_graph, parse_datetime, parse_payload, recursive_diff, SchemaCx,
};
use crate::types::{OutputMode, Strategy, TestSpec, EMPTY, NA};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Tri-state outcome: `Skip` omits the test from the report entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone)]
pub struct Comparison {
    pub verdict: Verdict,
    pub origin: String,
    pub target: String,
}

impl Comparison {
    fn passed(passed: bool, origin: impl Into<String>, target: impl Into<String>) -> Self {
        let verdict = if passed { Verdict::Pass } else { Verdict::Fail };
        Self { verdict, origin: origin.into(), target: target.into() }
    }
    fn skip(origin: impl Into<String>, target: impl Into<String>) -> Self {
        Self { verdict: Verdict::Skip, origin: origin.into(), target: target.into() }
    }
}

/// Read-only comparison context for one (URL, test) pair.
#[derive(Debug, Clone, Copy)]
pub struct CompareCx<'a> {
    pub mode: OutputMode,
    pub current_url: &'a str,
    pub rules: &'a UrlRules,
    /// Origin values came from a stored report rather than a live fetch.
    pub stored_origin: bool,
}

impl<'a> CompareCx<'a> {
    fn schema_cx(&self) -> SchemaCx<'a> {
        SchemaCx { current_url: self.current_url, rules: self.rules }
    }
}

/// The strategy actually run for this spec under the given output mode.
pub fn effective_strategy(spec: &TestSpec, mode: OutputMode) -> Option<Strategy> {
    let base = spec.callback?;
    Some(base.mode_variant(mode).unwrap_or(base))
}

/// Display name for the report's Metric column. When an output-mode variant
/// was substituted the name gains its suffix, once.
pub fn display_name(spec: &TestSpec, mode: OutputMode) -> String {
    let suffix = match spec.callback.and_then(|base| base.mode_variant(mode)) {
        Some(Strategy::SchemasDifference) | Some(Strategy::GtmDataDifference) => {
            " (difference only)"
        }
        Some(Strategy::SchemasMissing) | Some(Strategy::GtmDataMissing) => {
            " (missing in target only)"
        }
        _ => return spec.name.clone(),
    };
    if spec.name.ends_with(suffix) {
        spec.name.clone()
    } else {
        format!("{}{}", spec.name, suffix)
    }
}

/// Dispatch the extracted pair to the spec's strategy.
pub fn compare(spec: &TestSpec, origin: &str, target: &str, cx: &CompareCx) -> Result<Comparison> {
    let Some(strategy) = effective_strategy(spec, cx.mode) else {
        return Ok(default_compare(origin, target, cx));
    };
    match strategy {
        Strategy::CaseInsensitive => Ok(compare_case_insensitive(origin, target, cx)),
        Strategy::CommaSeparated => Ok(compare_comma_separated(origin, target)),
        Strategy::Date => Ok(compare_date(origin, target)),
        Strategy::Presence => Ok(compare_presence(origin, target)),
        Strategy::WithRegex => compare_with_regex(spec, origin, target, cx),
        Strategy::WithTransform => {
            let (po, pt) = transform_args(&spec.callback_args)?;
            Ok(compare_with_transform(origin, target, &po, &pt))
        }
        Strategy::Images => compare_images(spec, origin, target, cx, false),
        Strategy::ImagesCount => compare_images(spec, origin, target, cx, true),
        Strategy::Schemas
        | Strategy::SchemasDifference
        | Strategy::SchemasMissing => compare_schemas(strategy, origin, target, cx),
        Strategy::GtmData
        | Strategy::GtmDataDifference
        | Strategy::GtmDataMissing => Ok(compare_gtm(strategy, origin, target, cx)),
    }
}

fn canon_text(value: &str, cx: &CompareCx) -> String {
    canonicalize_url(&normalize(value), cx.current_url, cx.rules)
}

/// Default rule: normalize (and URL-canonicalize URL-like values), then
/// exact equality.
fn default_compare(origin: &str, target: &str, cx: &CompareCx) -> Comparison {
    let passed = canon_text(origin, cx) == canon_text(target, cx);
    Comparison::passed(passed, origin, target)
}

fn compare_case_insensitive(origin: &str, target: &str, cx: &CompareCx) -> Comparison {
    let passed = canon_text(origin, cx).to_uppercase() == canon_text(target, cx).to_uppercase();
    Comparison::passed(passed, origin, target)
}

/// Order-independent set comparison of comma-separated lists; duplicates
/// are preserved (multiset equality).
fn compare_comma_separated(origin: &str, target: &str) -> Comparison {
    let split = |v: &str| {
        let mut parts: Vec<String> =
            v.split(',').map(|p| normalize(p.trim())).filter(|p| !p.is_empty()).collect();
        parts.sort();
        parts
    };
    Comparison::passed(split(origin) == split(target), origin, target)
}

fn compare_date(origin: &str, target: &str) -> Comparison {
    let passed = match (parse_datetime(origin), parse_datetime(target)) {
        (_, None) => false,
        (None, Some(_)) => false,
        (Some(o), Some(t)) => o == t,
    };
    Comparison::passed(passed, origin, target)
}

fn compare_presence(origin: &str, target: &str) -> Comparison {
    let reduce = |v: &str| if v == NA || v == EMPTY { "Missing" } else { "Present" };
    let o = reduce(origin);
    let t = reduce(target);
    Comparison::passed(o == t, o, t)
}

/// Re-extract both sides through `callback_args[0]` (origin only when it was
/// live-fetched; stored data already holds the re-extracted value), then
/// defer to compare_with_transform when its two patterns were supplied, else
/// fall back to the default rule.
fn compare_with_regex(
    spec: &TestSpec,
    origin: &str,
    target: &str,
    cx: &CompareCx,
) -> Result<Comparison> {
    let pattern = spec
        .callback_args
        .first()
        .ok_or_else(|| ParityError::config(format!("{}: compare_with_regex needs a pattern", spec.id)))?;
    let re = compile(pattern)?;
    let origin_val =
        if cx.stored_origin { origin.to_string() } else { re_extract(&re, origin) };
    let target_val = re_extract(&re, target);

    if let (Some(po), Some(pt)) = (spec.callback_args.get(1), spec.callback_args.get(2)) {
        return Ok(compare_with_transform(&origin_val, &target_val, &compile(po)?, &compile(pt)?));
    }
    let passed = canon_text(&origin_val, cx) == canon_text(&target_val, cx);
    Ok(Comparison::passed(passed, origin_val, target_val))
}

fn re_extract(re: &Regex, value: &str) -> String {
    match re.captures(value) {
        None => NA.to_string(),
        Some(caps) => {
            let m = caps
                .name(crate::extract::RESULT_GROUP)
                .or_else(|| caps.get(1))
                .or_else(|| caps.get(0));
            match m {
                None => NA.to_string(),
                Some(m) if m.as_str().is_empty() => EMPTY.to_string(),
                Some(m) => m.as_str().to_string(),
            }
        }
    }
}

fn transform_args(args: &[String]) -> Result<(Regex, Regex)> {
    match args {
        [po, pt, ..] => Ok((compile(po)?, compile(pt)?)),
        _ => Err(ParityError::config("compare_with_transform needs two patterns")),
    }
}

/// Run each side's pattern globally and compare every named capture group's
/// occurrences positionally, case-insensitively after normalization.
fn compare_with_transform(origin: &str, target: &str, po: &Regex, pt: &Regex) -> Comparison {
    let go = collect_groups(po, origin);
    let gt = collect_groups(pt, target);
    let names: BTreeSet<&String> = go.keys().chain(gt.keys()).collect();
    static NONE: Vec<String> = Vec::new();

    let mut passed = true;
    for name in &names {
        let vo = go.get(*name).unwrap_or(&NONE);
        let vt = gt.get(*name).unwrap_or(&NONE);
        if vo.len() != vt.len() {
            passed = false;
            break;
        }
        if vo.iter().zip(vt).any(|(a, b)| {
            normalize(a).to_uppercase() != normalize(b).to_uppercase()
        }) {
            passed = false;
            break;
        }
    }
    Comparison::passed(passed, format_groups(&go), format_groups(&gt))
}

fn collect_groups(re: &Regex, text: &str) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for caps in re.captures_iter(text) {
        for name in re.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                out.entry(name.to_string()).or_default().push(m.as_str().to_string());
            }
        }
    }
    out
}

fn format_groups(groups: &BTreeMap<String, Vec<String>>) -> String {
    if groups.is_empty() {
        return NA.to_string();
    }
    groups
        .iter()
        .map(|(name, values)| format!("{}: {}", name, values.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract every `<img>` as a `"src (alt)"` line, src reduced through URL
/// canonicalization, blank alt shown as `EMPTY`.
fn compare_images(
    spec: &TestSpec,
    origin: &str,
    target: &str,
    cx: &CompareCx,
    count_only: bool,
) -> Result<Comparison> {
    let remove = match spec.callback_args.first() {
        Some(pattern) => Some(compile(pattern)?),
        None => None,
    };
    let o = image_list(origin, remove.as_ref(), cx);
    let t = image_list(target, remove.as_ref(), cx);
    let passed = if count_only { line_count(&o) == line_count(&t) } else { o == t };
    Ok(Comparison::passed(passed, o, t))
}

fn image_list(raw: &str, remove: Option<&Regex>, cx: &CompareCx) -> String {
    if raw == NA || raw == EMPTY {
        return NA.to_string();
    }
    let cleaned = match remove {
        Some(re) => re.replace_all(raw, "").into_owned(),
        None => raw.to_string(),
    };
    let fragment = Html::parse_fragment(&cleaned);
    let mut lines = Vec::new();
    if let Ok(sel) = Selector::parse("img") {
        for img in fragment.select(&sel) {
            let src = img.value().attr("src").unwrap_or("");
            let src = canonicalize_url(&normalize(src), cx.current_url, cx.rules);
            let alt = img.value().attr("alt").map(str::trim).unwrap_or("");
            let alt = if alt.is_empty() { EMPTY } else { alt };
            lines.push(format!("{} ({})", src, alt));
        }
    }
    if lines.is_empty() { NA.to_string() } else { lines.join("\n") }
}

fn line_count(list: &str) -> usize {
    if list == NA { 0 } else { list.lines().count() }
}

fn compare_schemas(
    strategy: Strategy,
    origin: &str,
    target: &str,
    cx: &CompareCx,
) -> Result<Comparison> {
    let scx = cx.schema_cx();
    let vo = extract_schema_graph(origin, &scx)?.unwrap_or(Value::String(NA.into()));
    let vt = extract_schema_graph(target, &scx)?.unwrap_or(Value::String(NA.into()));
    Ok(structural_compare(strategy, &vo, &vt, cx))
}

fn compare_gtm(strategy: Strategy, origin: &str, target: &str, cx: &CompareCx) -> Comparison {
    let sentinel = |v: &str| v == NA || v == EMPTY;
    if sentinel(origin) && sentinel(target) {
        // no payload on either side: not a meaningful comparison
        return Comparison::skip(origin, target);
    }
    let (display_o, vo) = parse_payload(origin);
    let (display_t, vt) = parse_payload(target);
    let mut cmp = structural_compare(strategy, &vo, &vt, cx);
    match strategy {
        Strategy::GtmData => {
            cmp.origin = display_o;
            cmp.target = display_t;
        }
        // only the origin display narrows to the missing subtree
        Strategy::GtmDataMissing => cmp.target = display_t,
        _ => {}
    }
    cmp
}

/// Shared verdict/display logic for the structural strategies and their
/// output-mode variants.
fn structural_compare(strategy: Strategy, vo: &Value, vt: &Value, cx: &CompareCx) -> Comparison {
    let scx = cx.schema_cx();
    let only_in_origin = recursive_diff(vo, vt, &scx);
    let only_in_target = recursive_diff(vt, vo, &scx);
    match strategy {
        Strategy::SchemasMissing | Strategy::GtmDataMissing => Comparison::passed(
            diff_is_empty(&only_in_origin),
            pretty(&only_in_origin),
            pretty(vt),
        ),
        Strategy::SchemasDifference | Strategy::GtmDataDifference => Comparison::passed(
            diff_is_empty(&only_in_origin) && diff_is_empty(&only_in_target),
            pretty(&only_in_origin),
            pretty(&only_in_target),
        ),
        _ => Comparison::passed(
            diff_is_empty(&only_in_origin) && diff_is_empty(&only_in_target),
            pretty(vo),
            pretty(vt),
        ),
    }
}

fn pretty(v: &Value) -> String {
    if let Value::String(s) = v {
        return s.clone();
    }
    serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| ParityError::config(format!("bad callback pattern '{}': {}", pattern, e)))
}
