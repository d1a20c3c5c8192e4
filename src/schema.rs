//! Structured-data parsing, schema.org canonicalization and recursive
//! diffing.

use crate::error::{ParityError, Result};
use crate::normalize::{canonicalize_url, collapse_ws, normalize, UrlRules};
use crate::types::{EMPTY, NA};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{json, Map, Value};
use std::sync::LazyLock;

static TRAILING_COMMA_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("valid regex"));
static SINGLE_QUOTED_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([{,]\s*)'([^']*)'\s*:"#).expect("valid regex"));
static UNQUOTED_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([{,]\s*)([A-Za-z_$][A-Za-z0-9_$-]*)\s*:"#).expect("valid regex")
});

/// Comparison context threaded through canonicalization and diffing.
#[derive(Debug, Clone, Copy)]
pub struct SchemaCx<'a> {
    pub current_url: &'a str,
    pub rules: &'a UrlRules,
}

/// Parse JSON, tolerating trailing commas and single-quoted or unquoted
/// object keys (rewritten to strict JSON before a second attempt).
pub fn parse_lenient(text: &str) -> std::result::Result<Value, String> {
    match serde_json::from_str(text) {
        Ok(v) => Ok(v),
        Err(first) => {
            let repaired = repair_json(text);
            serde_json::from_str(&repaired).map_err(|_| format!("Unparseable JSON: {first}"))
        }
    }
}

fn repair_json(text: &str) -> String {
    let out = TRAILING_COMMA_REGEX.replace_all(text, "$1");
    let out = SINGLE_QUOTED_KEY_REGEX.replace_all(&out, "$1\"$2\":");
    UNQUOTED_KEY_REGEX.replace_all(&out, "$1\"$2\":").into_owned()
}

/// Turn a raw extracted value into (display text, diff value).
///
/// The `N/A`/`EMPTY` sentinels pass through as the display value. A parse
/// failure records the error string in place of the value, wrapped in a
/// one-element array for diff purposes — two sides failing identically
/// therefore compare equal, a known modeling choice.
pub fn parse_payload(raw: &str) -> (String, Value) {
    if raw == NA || raw == EMPTY {
        return (raw.to_string(), json!([raw]));
    }
    match parse_lenient(raw) {
        Ok(v) => (raw.to_string(), v),
        Err(e) => (e.clone(), json!([e])),
    }
}

fn is_schema_org_context(v: Option<&Value>) -> bool {
    match v {
        Some(Value::String(s)) => {
            let s = s.trim().trim_end_matches('/');
            s == "https://schema.org" || s == "http://schema.org"
        }
        _ => false,
    }
}

/// Harvest every `<script type="application/ld+json">` block from `html`
/// and merge the schema.org ones into a single canonicalized
/// `{@context, @graph: [...]}` document. `None` when no block survives.
pub fn extract_schema_graph(html: &str, cx: &SchemaCx) -> Result<Option<Value>> {
    let doc = Html::parse_document(html);
    let mut items: Vec<(Option<String>, Value)> = Vec::new();
    if let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) {
        for script in doc.select(&sel) {
            let text: String = script.text().collect();
            let Ok(mut value) = parse_lenient(text.trim()) else { continue };
            // unwrap a single-element top-level array
            if let Value::Array(arr) = &value {
                if arr.len() == 1 {
                    value = arr[0].clone();
                }
            }
            let Some(obj) = value.as_object() else { continue };
            if !is_schema_org_context(obj.get("@context")) {
                continue;
            }
            match obj.get("@graph") {
                Some(Value::Array(arr)) => {
                    for item in arr {
                        items.push((None, item.clone()));
                    }
                }
                Some(Value::Object(map)) => {
                    for (k, item) in map {
                        items.push((Some(k.clone()), item.clone()));
                    }
                }
                _ => {
                    let mut rest = obj.clone();
                    rest.remove("@context");
                    items.push((None, Value::Object(rest)));
                }
            }
        }
    }
    if items.is_empty() {
        return Ok(None);
    }

    let graph = if items.iter().any(|(k, _)| k.is_some()) {
        let mut map = Map::new();
        for (idx, (key, item)) in items.into_iter().enumerate() {
            map.insert(key.unwrap_or_else(|| idx.to_string()), item);
        }
        Value::Object(map)
    } else {
        Value::Array(items.into_iter().map(|(_, v)| v).collect())
    };
    let doc = json!({ "@context": "https://schema.org", "@graph": graph });
    canonicalize_schema(&doc, cx).map(Some)
}

/// Canonicalize a schema.org document for identity-based diffing: URL
/// string leaves reduced through `canonicalize_url`, `articleBody` key
/// casing fixed, and `@graph`/`itemListElement` arrays re-keyed from
/// position to a synthetic `@type`-derived key.
pub fn canonicalize_schema(value: &Value, cx: &SchemaCx) -> Result<Value> {
    if !is_schema_document(value) {
        return Ok(value.clone());
    }
    canon_value(value, None, cx)
}

fn is_schema_document(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| is_schema_org_context(obj.get("@context")) && obj.contains_key("@graph"))
        .unwrap_or(false)
}

fn canon_value(value: &Value, key: Option<&str>, cx: &SchemaCx) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(canonicalize_url(s, cx.current_url, cx.rules))),
        Value::Array(items) => {
            if matches!(key, Some("@graph") | Some("itemListElement")) {
                rekey_items(items, cx)
            } else {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(canon_value(item, None, cx)?);
                }
                Ok(Value::Array(out))
            }
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                let nk = if k.eq_ignore_ascii_case("articlebody") {
                    "articleBody".to_string()
                } else {
                    k.clone()
                };
                let canon = canon_value(v, Some(&nk), cx)?;
                out.insert(nk, canon);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Re-key array entries from positional index to a key derived from `@type`
/// so structurally-reordered graphs align by identity rather than position.
fn rekey_items(items: &[Value], cx: &SchemaCx) -> Result<Value> {
    let mut out = Map::new();
    for (position, item) in items.iter().enumerate() {
        let canon = canon_value(item, None, cx)?;
        let base = type_key(&canon);
        let key = disambiguate(&out, &base, position, &canon)?;
        out.insert(key, canon);
    }
    Ok(Value::Object(out))
}

fn type_key(item: &Value) -> String {
    match item.get("@type") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => {
            let joined: Vec<&str> = parts.iter().filter_map(|v| v.as_str()).collect();
            if joined.is_empty() { "item".to_string() } else { joined.join("_") }
        }
        _ => "item".to_string(),
    }
}

/// Candidate keys in order: bare type, then `#<position>`, `#<name>`,
/// `#<@id>` suffixes. Still colliding after all four is fatal.
fn disambiguate(
    existing: &Map<String, Value>,
    base: &str,
    position: usize,
    item: &Value,
) -> Result<String> {
    if !existing.contains_key(base) {
        return Ok(base.to_string());
    }
    let by_position = format!("{base}#{position}");
    if !existing.contains_key(&by_position) {
        return Ok(by_position);
    }
    if let Some(name) = item.get("name").and_then(|v| v.as_str()) {
        let by_name = format!("{base}#{name}");
        if !existing.contains_key(&by_name) {
            return Ok(by_name);
        }
    }
    if let Some(id) = item.get("@id").and_then(|v| v.as_str()) {
        let by_id = format!("{base}#{id}");
        if !existing.contains_key(&by_id) {
            return Ok(by_id);
        }
    }
    Err(ParityError::SchemaCollision(base.to_string()))
}

/// Everything in `a` that is missing from (or differs in) `b`.
///
/// Nested structures recurse and are included only when the sub-diff is
/// non-empty; scalar pairs are excluded when equal under whitespace-collapsed
/// normalization, date/time instant equality, or URL canonicalization.
pub fn recursive_diff(a: &Value, b: &Value, cx: &SchemaCx) -> Value {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            let mut out = Map::new();
            for (k, va) in ma {
                match mb.get(k) {
                    None => {
                        out.insert(k.clone(), va.clone());
                    }
                    Some(vb) => diff_into(&mut out, k, va, vb, cx),
                }
            }
            Value::Object(out)
        }
        (Value::Array(aa), Value::Array(ab)) => {
            let mut out = Map::new();
            for (i, va) in aa.iter().enumerate() {
                match ab.get(i) {
                    None => {
                        out.insert(i.to_string(), va.clone());
                    }
                    Some(vb) => diff_into(&mut out, &i.to_string(), va, vb, cx),
                }
            }
            Value::Object(out)
        }
        _ => {
            if scalar_eq(a, b, cx) {
                Value::Object(Map::new())
            } else {
                a.clone()
            }
        }
    }
}

fn diff_into(out: &mut Map<String, Value>, key: &str, va: &Value, vb: &Value, cx: &SchemaCx) {
    if is_container(va) && is_container(vb) {
        let sub = recursive_diff(va, vb, cx);
        if !diff_is_empty(&sub) {
            out.insert(key.to_string(), sub);
        }
    } else if !scalar_eq(va, vb, cx) {
        out.insert(key.to_string(), va.clone());
    }
}

fn is_container(v: &Value) -> bool {
    v.is_object() || v.is_array()
}

pub fn diff_is_empty(v: &Value) -> bool {
    v.as_object().map(|m| m.is_empty()).unwrap_or(false)
}

fn scalar_eq(a: &Value, b: &Value, cx: &SchemaCx) -> bool {
    if a == b {
        return true;
    }
    let (sa, sb) = match (value_text(a), value_text(b)) {
        (Some(sa), Some(sb)) => (sa, sb),
        _ => return false,
    };
    if collapse_ws(&normalize(&sa)) == collapse_ws(&normalize(&sb)) {
        return true;
    }
    if let (Some(da), Some(db)) = (parse_datetime(&sa), parse_datetime(&sb)) {
        if da == db {
            return true;
        }
    }
    canonicalize_url(&sa, cx.current_url, cx.rules)
        == canonicalize_url(&sb, cx.current_url, cx.rules)
}

fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse the common date/time shapes seen in feeds and structured data into
/// a comparable instant.
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(t) {
        return Some(dt.with_timezone(&Utc));
    }
    let stripped = t.strip_suffix(" UTC").or_else(|| t.strip_suffix(" GMT")).unwrap_or(t);
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(stripped, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(stripped, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}
