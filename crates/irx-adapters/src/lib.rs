//! Export API response parsing, field normalization and record projection.

use std::collections::{BTreeMap, HashSet};

use irx_core::{CollectionEntry, FieldSpec, NormalizedRecord, RawRecord, MULTI_VALUE_DELIMITER};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "irx-adapters";

pub const NUM_FOUND_PATH: &str = "response.numFound";
pub const DOCS_PATH: &str = "response.docs";

/// The API answered, but not in the `{response: {numFound, docs}}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("response from {url} is missing `{path}`")]
    MissingPath { url: String, path: &'static str },
    #[error("response from {url} has a non-object document at `{path}[{index}]`")]
    NotAnObject {
        url: String,
        path: &'static str,
        index: usize,
    },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub fn parse_num_found(url: &str, body: &JsonValue) -> Result<u64, SchemaError> {
    json_path(body, &["response", "numFound"])
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| SchemaError::MissingPath {
            url: url.to_string(),
            path: NUM_FOUND_PATH,
        })
}

pub fn parse_docs(url: &str, mut body: JsonValue) -> Result<Vec<RawRecord>, SchemaError> {
    let missing = || SchemaError::MissingPath {
        url: url.to_string(),
        path: DOCS_PATH,
    };
    let docs = body
        .get_mut("response")
        .and_then(|r| r.get_mut("docs"))
        .map(JsonValue::take)
        .ok_or_else(missing)?;
    let JsonValue::Array(docs) = docs else {
        return Err(missing());
    };

    docs.into_iter()
        .enumerate()
        .map(|(index, doc)| match doc {
            JsonValue::Object(map) => Ok(map),
            _ => Err(SchemaError::NotAnObject {
                url: url.to_string(),
                path: DOCS_PATH,
                index,
            }),
        })
        .collect()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Python-style title casing: first letter of every alphabetic run upper, rest lower.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_word = false;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if in_word {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(ch);
            in_word = false;
        }
    }
    out
}

/// Canonical string for one raw field value. Never fails; unexpected JSON types
/// become `""` with a warning.
pub fn normalize_value(spec: &FieldSpec, field: &str, value: Option<&JsonValue>) -> String {
    let flattened = match value {
        None | Some(JsonValue::Null) => return String::new(),
        Some(JsonValue::String(text)) => {
            let cleaned: String = text.chars().filter(|c| *c != '\n' && *c != '\r').collect();
            match spec.identifier_prefix() {
                Some(prefix) if spec.is_identifier(field) => match cleaned.strip_prefix(prefix) {
                    Some(stripped) => stripped.to_string(),
                    None => cleaned,
                },
                _ => cleaned,
            }
        }
        Some(JsonValue::Array(items)) => {
            let strings: Option<Vec<&str>> = items.iter().map(JsonValue::as_str).collect();
            match strings {
                Some(strings) => strings.join(MULTI_VALUE_DELIMITER),
                None => {
                    warn!(field, "array holds non-string values; using empty value");
                    return String::new();
                }
            }
        }
        Some(other) => {
            warn!(field, kind = json_kind(other), "unexpected value type; using empty value");
            return String::new();
        }
    };

    if spec.is_document_type(field) {
        title_case(&flattened)
    } else {
        flattened
    }
}

pub fn project_record(record: &RawRecord, spec: &FieldSpec) -> NormalizedRecord {
    NormalizedRecord::new(
        spec.fields()
            .iter()
            .map(|field| (field.clone(), normalize_value(spec, field, record.get(field))))
            .collect(),
    )
}

pub fn project(records: &[RawRecord], spec: &FieldSpec) -> Vec<NormalizedRecord> {
    records.iter().map(|record| project_record(record, spec)).collect()
}

/// True when the page has documents but none of them carries any requested field.
pub fn page_lacks_all_fields(records: &[RawRecord], spec: &FieldSpec) -> bool {
    !records.is_empty()
        && records
            .iter()
            .all(|record| spec.fields().iter().all(|field| !record.contains_key(field)))
}

/// One output row per delimited piece of `field`; empty pieces produce no row.
pub fn explode(records: &[NormalizedRecord], field: &str, delimiter: &str) -> Vec<NormalizedRecord> {
    records
        .iter()
        .flat_map(|record| {
            let value = record.get(field).unwrap_or_default();
            value
                .split(delimiter)
                .filter(|piece| !piece.is_empty())
                .map(|piece| record.with_value(field, piece))
                .collect::<Vec<_>>()
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCount {
    pub value: String,
    pub count: usize,
}

/// Occurrences of each value of a multi-valued field, most frequent first.
pub fn facet_counts(records: &[NormalizedRecord], field: &str) -> Vec<FacetCount> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        for piece in record
            .get(field)
            .unwrap_or_default()
            .split(MULTI_VALUE_DELIMITER)
            .filter(|piece| !piece.is_empty())
        {
            *counts.entry(piece).or_default() += 1;
        }
    }

    let mut out: Vec<FacetCount> = counts
        .into_iter()
        .map(|(value, count)| FacetCount {
            value: value.to_string(),
            count,
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    out
}

pub const TITLE_LINK_HEADER: [&str; 2] = ["Title", "Link"];

/// Legacy two-column export: item title and a viewable link built from the identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleLinkLayout {
    pub title_field: String,
    pub item_url: String,
}

impl TitleLinkLayout {
    pub fn new(title_field: impl Into<String>, item_url: impl Into<String>) -> Self {
        Self {
            title_field: title_field.into(),
            item_url: item_url.into(),
        }
    }

    pub fn project(&self, records: &[RawRecord], spec: &FieldSpec) -> Vec<NormalizedRecord> {
        let id_field = spec.primary_identifier().unwrap_or("PID");
        records
            .iter()
            .map(|record| {
                let title = normalize_value(spec, &self.title_field, record.get(&self.title_field));
                let id = normalize_value(spec, id_field, record.get(id_field));
                let link = if id.is_empty() {
                    String::new()
                } else {
                    format!("{}{}", self.item_url, id)
                };
                NormalizedRecord::new(vec![
                    (TITLE_LINK_HEADER[0].to_string(), title),
                    (TITLE_LINK_HEADER[1].to_string(), link),
                ])
            })
            .collect()
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn trailing_identifier(href: &str) -> Option<String> {
    let href = href.trim_end_matches('/');
    let digits: String = href
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Collections listed on the repository's browse page (`div.collections-title > a`).
pub fn parse_collection_list(html: &str) -> Result<Vec<CollectionEntry>, AdapterError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("div.collections-title > a")
        .map_err(|e| AdapterError::Message(e.to_string()))?;

    let mut seen_names = HashSet::new();
    let mut seen_ids = HashSet::new();
    let mut entries = Vec::new();
    for link in document.select(&selector) {
        let Some(name) = text_or_none(link.text().collect::<String>()) else {
            continue;
        };
        let Some(id) = link.value().attr("href").and_then(trailing_identifier) else {
            warn!(name = %name, "collection link without a numeric identifier; skipping");
            continue;
        };
        if !seen_names.insert(name.clone()) || !seen_ids.insert(id.clone()) {
            continue;
        }
        entries.push(CollectionEntry::new(name, id));
    }
    Ok(entries)
}
