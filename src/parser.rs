//! Extracts tab groups from free-form model output.
//!
//! Models wrap JSON in prose, code fences and trailing commas. Candidates are
//! pulled out with three strategies, tried in order, and the first one that
//! parses and validates wins:
//!
//! 1. balanced-bracket scan over `[`..`]` and `{`..`}` spans, whichever opens first
//! 2. greedy span from the first opener to the last closer
//! 3. an `OUTPUT:` / `groups:` marker followed by a bracketed span
//!
//! The parser is a pure function; it never panics on arbitrary input.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use crate::error::ParseError;

const NAME_MAX_CHARS: usize = 50;

/// Accepted id-bearing field names, in priority order.
const ID_FIELDS: [&str; 4] = ["ids", "tabIds", "tabs", "indices"];

const REASONING_FIELDS: [&str; 2] = ["reasoning", "explanation"];

static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[A-Za-z0-9_+-]*").expect("fence pattern"));
static GREEDY_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[.*\]").expect("array pattern"));
static GREEDY_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("object pattern"));
static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:output|groups)\s*:").expect("marker pattern"));
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([\]}])").expect("trailing comma pattern"));

/// One validated group. `ids` are deduplicated and ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedGroup {
    pub name: String,
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Groups {
        groups: Vec<ParsedGroup>,
        reasoning: Option<String>,
    },
    /// Tab index to category label.
    Categories(BTreeMap<i64, String>),
}

/// Parse model output into groups or a category map.
pub fn parse(raw: &str) -> Result<ParseOutcome, ParseError> {
    let text = strip_fences(raw);
    let candidates = candidates(&text);
    if candidates.is_empty() {
        tracing::debug!("no bracketed span in model output");
        return Err(ParseError::NoJson);
    }

    let mut best = ParseError::NoJson;
    for candidate in &candidates {
        let Some(value) = parse_json(candidate) else {
            continue;
        };
        match interpret(value, raw) {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                if rank(&e) >= rank(&best) {
                    best = e;
                }
            }
        }
    }

    tracing::debug!(reason = %best, candidates = candidates.len(), "model output rejected");
    Err(best)
}

fn rank(err: &ParseError) -> u8 {
    match err {
        ParseError::NoJson => 0,
        ParseError::Invalid { .. } => 1,
        ParseError::NoValidGroups => 2,
    }
}

fn strip_fences(raw: &str) -> String {
    FENCE.replace_all(raw, "").trim().to_string()
}

/// Candidate spans in strategy order, duplicates removed.
fn candidates(text: &str) -> Vec<String> {
    let arrays = balanced_spans(text, '[', ']');
    let objects = balanced_spans(text, '{', '}');
    let array_first = match (text.find('['), text.find('{')) {
        (Some(a), Some(o)) => a < o,
        (Some(_), None) => true,
        _ => false,
    };
    let mut found: Vec<&str> = if array_first {
        arrays.into_iter().chain(objects).collect()
    } else {
        objects.into_iter().chain(arrays).collect()
    };

    if let Some(m) = GREEDY_ARRAY.find(text).or_else(|| GREEDY_OBJECT.find(text)) {
        found.push(m.as_str());
    }

    if let Some(m) = MARKER.find(text) {
        if let Some(span) = balanced_spans(&text[m.end()..], '[', ']').first().copied() {
            found.push(span);
        }
    }

    let mut seen = BTreeSet::new();
    found
        .into_iter()
        .filter(|span| seen.insert(*span))
        .map(str::to_string)
        .collect()
}

/// Every top-level `open`..`close` span, tracking nesting depth only.
fn balanced_spans(text: &str, open: char, close: char) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (i, c) in text.char_indices() {
        if c == open {
            if depth == 0 {
                start = i;
            }
            depth += 1;
        } else if c == close && depth > 0 {
            depth -= 1;
            if depth == 0 {
                spans.push(&text[start..i + c.len_utf8()]);
            }
        }
    }
    spans
}

fn parse_json(candidate: &str) -> Option<Value> {
    serde_json::from_str(candidate).ok().or_else(|| {
        let repaired = TRAILING_COMMA.replace_all(candidate, "$1");
        serde_json::from_str(&repaired).ok()
    })
}

/// Richer `{reasoning, groups}` shape first, then a bare list, then a category map.
fn interpret(value: Value, raw: &str) -> Result<ParseOutcome, ParseError> {
    match value {
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("groups") {
                let reasoning = REASONING_FIELDS
                    .iter()
                    .find_map(|field| map.get(*field).and_then(Value::as_str))
                    .map(str::to_string);
                return validate_groups(items).map(|groups| ParseOutcome::Groups { groups, reasoning });
            }
            categories(&map)
                .map(ParseOutcome::Categories)
                .ok_or_else(|| ParseError::invalid("object is neither groups nor a category map", raw))
        }
        Value::Array(items) => validate_groups(&items).map(|groups| ParseOutcome::Groups {
            groups,
            reasoning: None,
        }),
        _ => Err(ParseError::invalid("expected a list of groups", raw)),
    }
}

fn validate_groups(items: &[Value]) -> Result<Vec<ParsedGroup>, ParseError> {
    let groups: Vec<ParsedGroup> = items.iter().filter_map(validate_group).collect();
    if groups.is_empty() {
        return Err(ParseError::NoValidGroups);
    }
    Ok(groups)
}

fn validate_group(value: &Value) -> Option<ParsedGroup> {
    let obj = value.as_object()?;
    let name = obj.get("name")?.as_str()?.trim();
    if name.is_empty() || name.chars().count() > NAME_MAX_CHARS {
        return None;
    }

    let listed = ID_FIELDS.iter().find_map(|field| {
        obj.get(*field)
            .and_then(Value::as_array)
            .filter(|ids| !ids.is_empty())
    })?;

    let ids: BTreeSet<i64> = listed.iter().filter_map(as_id).collect();
    if ids.is_empty() {
        return None;
    }

    Some(ParsedGroup {
        name: name.to_string(),
        ids: ids.into_iter().collect(),
    })
}

fn as_id(value: &Value) -> Option<i64> {
    let id = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    (id >= 0).then_some(id)
}

fn categories(map: &Map<String, Value>) -> Option<BTreeMap<i64, String>> {
    let labels: BTreeMap<i64, String> = map
        .iter()
        .filter_map(|(key, label)| {
            let index: i64 = key.trim().parse::<i64>().ok().filter(|i| *i >= 0)?;
            let label = label.as_str()?.trim();
            (!label.is_empty()).then(|| (index, label.to_string()))
        })
        .collect();
    (!labels.is_empty()).then_some(labels)
}
