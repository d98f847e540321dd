//! Text extraction primitives used by response-reading plugins.
//!
//! Every function here fails softly: a missing match, a malformed pattern or
//! an unparsable document is logged and reported as `None`, never as a panic
//! or an error the caller has to handle.

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tracing::warn;
use url::Url;

/// One step of a JSON path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonStep {
    Key(String),
    Index(usize),
}

/// Searches `text` for `pattern` and returns the requested capture group.
///
/// `group` counts capturing groups from zero, so `0` selects the first
/// parenthesised group. A pattern without any capturing group yields the
/// whole match when `group` is `0`.
pub fn regex_search(text: &str, pattern: &str, group: usize) -> Option<String> {
    let regex = match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => {
            warn!("Invalid regular expression '{}': {}", pattern, e);
            return None;
        }
    };
    let captures = regex.captures(text)?;
    let selected = if regex.captures_len() == 1 && group == 0 {
        captures.get(0)
    } else {
        captures.get(group + 1)
    };
    selected.map(|m| m.as_str().to_string())
}

/// Finds `tag` elements whose attributes match every pattern in
/// `attributes` and returns the `extract` attribute of the last match.
///
/// Patterns are regular expressions anchored at the start of the attribute
/// value; an attribute named in `attributes` but absent on the element makes
/// the element ineligible.
pub fn html_search(
    text: &str,
    tag: &str,
    attributes: &BTreeMap<String, String>,
    extract: &str,
) -> Option<String> {
    let selector = match Selector::parse(tag) {
        Ok(selector) => selector,
        Err(e) => {
            warn!("Invalid HTML tag selector '{}': {:?}", tag, e);
            return None;
        }
    };

    let mut matchers = Vec::with_capacity(attributes.len());
    for (name, pattern) in attributes {
        match Regex::new(&format!("^(?:{pattern})")) {
            Ok(regex) => matchers.push((name.as_str(), regex)),
            Err(e) => {
                warn!("Invalid attribute pattern '{}' for '{}': {}", pattern, name, e);
                return None;
            }
        }
    }

    let document = Html::parse_document(text);
    let mut found = None;
    for element in document.select(&selector) {
        let element = element.value();
        let matches_all = matchers.iter().all(|(name, regex)| {
            element
                .attr(name)
                .is_some_and(|value| regex.is_match(value))
        });
        if matches_all {
            if let Some(value) = element.attr(extract) {
                found = Some(value.to_string());
            }
        }
    }
    found
}

/// Splits a JSON path such as `env.production[0]."with space"[3]` into steps.
///
/// Returns `None` when the path is malformed (unterminated quote or bracket,
/// non-numeric index).
pub fn parse_json_filter(path: &str) -> Option<Vec<JsonStep>> {
    let mut steps = Vec::new();
    let mut key = String::new();
    let mut chars = path.chars();

    fn flush(key: &mut String, steps: &mut Vec<JsonStep>) {
        if !key.is_empty() {
            steps.push(JsonStep::Key(std::mem::take(key)));
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '.' => flush(&mut key, &mut steps),
            '[' => {
                flush(&mut key, &mut steps);
                let mut digits = String::new();
                loop {
                    match chars.next()? {
                        ']' => break,
                        d => digits.push(d),
                    }
                }
                steps.push(JsonStep::Index(digits.trim().parse().ok()?));
            }
            '"' => {
                flush(&mut key, &mut steps);
                let mut quoted = String::new();
                loop {
                    match chars.next()? {
                        '"' => break,
                        q => quoted.push(q),
                    }
                }
                steps.push(JsonStep::Key(quoted));
            }
            other => key.push(other),
        }
    }
    flush(&mut key, &mut steps);
    Some(steps)
}

/// Follows `path` through the JSON document in `text`.
///
/// Strings are returned without quotes; any other value is returned in its
/// compact JSON form.
pub fn json_lookup(text: &str, path: &str) -> Option<String> {
    let Some(steps) = parse_json_filter(path) else {
        warn!("Malformed JSON path '{}'", path);
        return None;
    };
    let document: JsonValue = match serde_json::from_str(text) {
        Ok(document) => document,
        Err(e) => {
            warn!("Response is not valid JSON, cannot apply '{}': {}", path, e);
            return None;
        }
    };

    let mut current = &document;
    for step in &steps {
        current = match step {
            JsonStep::Key(key) => match current.get(key.as_str()) {
                Some(next) => next,
                None => {
                    warn!("Key '{}' not found in JSON. Cannot extract value.", key);
                    return None;
                }
            },
            JsonStep::Index(index) => match current.get(*index) {
                Some(next) => next,
                None => {
                    warn!("JSON array index {} doesn't exist. Cannot extract value.", index);
                    return None;
                }
            },
        };
    }

    match current {
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Base that relative references are resolved against, so their path,
/// query and fragment can still be read.
const RELATIVE_BASE: &str = "http://relative.invalid/";

/// Extracts one component from a URL.
///
/// `element` is one of `scheme`, `netloc`, `path`, `fragment`, `query` (the
/// raw query string) or `query.<name>` (a single decoded parameter).
/// Relative references such as `/dashboard?code=xyz` are accepted and have
/// no scheme or netloc.
pub fn url_component(raw: &str, element: &str) -> Option<String> {
    let raw = raw.trim();
    let parsed = match Url::parse(raw) {
        Ok(parsed) => Some(parsed),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(RELATIVE_BASE).and_then(|base| base.join(raw)).ok()
        }
        Err(_) => None,
    };
    let Some(parsed) = parsed else {
        warn!("Cannot parse URL '{}'", raw);
        return None;
    };
    let relative = !raw.contains("://");

    let value = match element.split_once('.') {
        Some(("query", name)) => parsed
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned()),
        _ => match element {
            "scheme" if relative => None,
            "scheme" => Some(parsed.scheme().to_string()),
            "netloc" if relative => None,
            "netloc" => netloc(raw),
            "path" => Some(parsed.path().to_string()),
            "fragment" => parsed.fragment().map(str::to_string),
            "query" => parsed.query().map(str::to_string),
            other => {
                warn!("Unknown URL element '{}'", other);
                None
            }
        },
    };
    value.filter(|v| !v.is_empty())
}

/// The authority exactly as written, explicit default ports included.
fn netloc(raw: &str) -> Option<String> {
    let (_, rest) = raw.split_once("://")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Some(rest[..end].to_string())
}
