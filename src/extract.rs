//! Applies a test spec's selector to a response source.

use crate::error::{ParityError, Result};
use crate::types::{Endpoint, FetchOutcome, SourceKind, TestSpec, EMPTY, NA};
use regex::Regex;

/// Name of the capture group every selector must define.
pub const RESULT_GROUP: &str = "result";

/// Run the spec's selector over the chosen response source.
///
/// Returns `N/A` when nothing matched (or the spec is a name-only
/// placeholder with no source/selector), `EMPTY` when the `result` group
/// matched an empty string, the captured text otherwise.
pub fn extract(spec: &TestSpec, endpoint: Endpoint, outcome: &FetchOutcome) -> Result<String> {
    let selector = match endpoint {
        Endpoint::Target => spec.selector_target.as_ref().or(spec.selector.as_ref()),
        Endpoint::Origin => spec.selector.as_ref(),
    };
    let (Some(source), Some(selector)) = (spec.source, selector) else {
        // name-only placeholder: intentionally unextractable
        return Ok(NA.to_string());
    };
    let text = match source {
        SourceKind::Body => &outcome.body,
        SourceKind::FirstHeader => &outcome.first_headers,
        SourceKind::LastHeader => &outcome.last_headers,
    };
    let re = compile_selector(selector)?;
    Ok(match re.captures(text).and_then(|caps| caps.name(RESULT_GROUP)) {
        None => NA.to_string(),
        Some(m) if m.as_str().is_empty() => EMPTY.to_string(),
        Some(m) => m.as_str().to_string(),
    })
}

/// Compile a selector, requiring the `result` named group. Also used by the
/// settings validation pass so bad selectors abort before any fetching.
pub fn compile_selector(selector: &str) -> Result<Regex> {
    let re = Regex::new(selector)
        .map_err(|e| ParityError::config(format!("bad selector '{}': {}", selector, e)))?;
    if !re.capture_names().flatten().any(|n| n == RESULT_GROUP) {
        return Err(ParityError::config(format!(
            "selector '{}' has no '{}' capture group",
            selector, RESULT_GROUP
        )));
    }
    Ok(re)
}
