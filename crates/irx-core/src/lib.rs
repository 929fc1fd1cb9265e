//! Core domain model for IRX: collections, field specs, records and page requests.

use std::collections::HashSet;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "irx-core";

/// Separator used when a multi-valued field is flattened into one cell.
pub const MULTI_VALUE_DELIMITER: &str = ";";

pub const DEFAULT_API_URL: &str =
    "https://repository.library.noaa.gov/fedora/export/download/collection/";
pub const DEFAULT_ITEM_URL: &str = "https://repository.library.noaa.gov/view/noaa/";
pub const DEFAULT_IDENTIFIER_PREFIX: &str = "noaa:";

/// Raw API document, verbatim from `response.docs`.
pub type RawRecord = Map<String, JsonValue>;

/// Caller input rejected before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid date {input:?}: expected YYYY-MM-DD")]
    InvalidDate { input: String },
    #[error("invalid date range: from {from} is after until {until}")]
    InvertedDateRange { from: NaiveDate, until: NaiveDate },
    #[error("unknown collection {0:?}: not a name or identifier in the collection map")]
    UnknownCollection(String),
    #[error("duplicate collection {0:?} in collection map")]
    DuplicateCollection(String),
    #[error("field spec must name at least one field")]
    EmptyFieldSpec,
    #[error("field {0:?} appears more than once in the field spec")]
    DuplicateField(String),
    #[error("field {0:?} is not part of the field spec")]
    UnknownField(String),
    #[error("page size must be greater than zero")]
    ZeroPageSize,
    #[error("invalid delimiter {0:?}: expected a single ASCII character")]
    InvalidDelimiter(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub name: String,
    pub id: CollectionId,
}

impl CollectionEntry {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: CollectionId::new(id),
        }
    }

    /// File/table friendly name: lowercase, spaces to underscores, parenthesised
    /// suffix dropped.
    pub fn slug(&self) -> String {
        let lowered = self.name.replace(' ', "_").to_lowercase();
        let cut = match lowered.find('(') {
            Some(idx) => &lowered[..idx],
            None => lowered.as_str(),
        };
        let slug = cut.trim_end_matches('_');
        if slug.is_empty() {
            format!("collection_{}", self.id)
        } else {
            slug.to_string()
        }
    }
}

/// Read-only display-name -> identifier table built once per session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectionMap {
    entries: Vec<CollectionEntry>,
}

impl CollectionMap {
    pub fn new(entries: Vec<CollectionEntry>) -> Result<Self, ValidationError> {
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for entry in &entries {
            if !names.insert(entry.name.as_str()) {
                return Err(ValidationError::DuplicateCollection(entry.name.clone()));
            }
            if !ids.insert(entry.id.as_str()) {
                return Err(ValidationError::DuplicateCollection(entry.id.to_string()));
            }
        }
        Ok(Self { entries })
    }

    /// The NOAA Institutional Repository collections.
    pub fn noaa_default() -> Self {
        let entries = [
            ("National Environmental Policy Act (NEPA)", "1"),
            ("Weather Research and Forecasting Innovation Act", "23702"),
            ("Coral Reef Conservation Program (CRCP)", "3"),
            ("Ocean Exploration Program (OER)", "4"),
            ("National Marine Fisheries Service (NMFS)", "5"),
            ("National Weather Service (NWS)", "6"),
            ("Office of Oceanic and Atmospheric Research (OAR)", "7"),
            ("National Ocean Service (NOS)", "8"),
            (
                "National Environmental Satellite and Data Information Service (NESDIS)",
                "9",
            ),
            ("Sea Grant Publications", "11"),
            ("Education and Outreach", "12"),
            ("NOAA General Documents", "10031"),
            ("NOAA International Agreements", "11879"),
            ("Office of Marine and Aviation Operations (OMAO)", "16402"),
            ("Integrated Ecosystem Assessment (IEA)", "22022"),
            ("NOAA Cooperative Institutes", "23649"),
        ]
        .into_iter()
        .map(|(name, id)| CollectionEntry::new(name, id))
        .collect();
        Self { entries }
    }

    /// Accepts either a display name or an identifier present in the map.
    pub fn resolve(&self, name_or_id: &str) -> Result<&CollectionEntry, ValidationError> {
        let needle = name_or_id.trim();
        self.entries
            .iter()
            .find(|e| e.name == needle)
            .or_else(|| self.entries.iter().find(|e| e.id.as_str() == needle))
            .ok_or_else(|| ValidationError::UnknownCollection(name_or_id.to_string()))
    }

    pub fn entries(&self) -> &[CollectionEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollectionEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Inclusive-exclusive `[from, until)` filter attached to every fetch of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub until: NaiveDate,
}

impl DateRange {
    pub fn parse(from: &str, until: &str) -> Result<Self, ValidationError> {
        let from = parse_day(from)?;
        let until = parse_day(until)?;
        if from > until {
            return Err(ValidationError::InvertedDateRange { from, until });
        }
        Ok(Self { from, until })
    }

    pub fn from_param(&self) -> String {
        day_param(self.from)
    }

    pub fn until_param(&self) -> String {
        day_param(self.until)
    }
}

fn parse_day(input: &str) -> Result<NaiveDate, ValidationError> {
    let invalid = || ValidationError::InvalidDate {
        input: input.to_string(),
    };
    // chrono tolerates unpadded fields; the API only takes the padded form.
    if input.len() != 10 {
        return Err(invalid());
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d").map_err(|_| invalid())
}

fn day_param(day: NaiveDate) -> String {
    day.format("%Y-%m-%dT00:00:00Z").to_string()
}

/// Ordered list of projected fields plus the roles some of them play.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    fields: Vec<String>,
    identifier_fields: Vec<String>,
    document_type_fields: Vec<String>,
    identifier_prefix: Option<String>,
}

impl FieldSpec {
    pub fn new<I, S>(fields: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(ValidationError::EmptyFieldSpec);
        }
        let mut seen = HashSet::new();
        for field in &fields {
            if !seen.insert(field.as_str()) {
                return Err(ValidationError::DuplicateField(field.clone()));
            }
        }
        Ok(Self {
            fields,
            identifier_fields: Vec::new(),
            document_type_fields: Vec::new(),
            identifier_prefix: None,
        })
    }

    pub fn noaa_default() -> Self {
        Self {
            fields: [
                "PID",
                "mods.title",
                "mods.type_of_resource",
                "mods.sm_localcorpname",
                "mods.sm_digital_object_identifier",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            identifier_fields: vec!["PID".to_string()],
            document_type_fields: vec!["mods.type_of_resource".to_string()],
            identifier_prefix: Some(DEFAULT_IDENTIFIER_PREFIX.to_string()),
        }
    }

    pub fn with_identifier_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identifier_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_document_type_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_type_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_identifier_prefix(mut self, prefix: Option<String>) -> Self {
        self.identifier_prefix = prefix.filter(|p| !p.is_empty());
        self
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    pub fn require(&self, field: &str) -> Result<(), ValidationError> {
        if self.contains(field) {
            Ok(())
        } else {
            Err(ValidationError::UnknownField(field.to_string()))
        }
    }

    pub fn is_identifier(&self, field: &str) -> bool {
        self.identifier_fields.iter().any(|f| f == field)
    }

    pub fn is_document_type(&self, field: &str) -> bool {
        self.document_type_fields.iter().any(|f| f == field)
    }

    pub fn identifier_fields(&self) -> &[String] {
        &self.identifier_fields
    }

    pub fn document_type_fields(&self) -> &[String] {
        &self.document_type_fields
    }

    pub fn identifier_prefix(&self) -> Option<&str> {
        self.identifier_prefix.as_deref()
    }

    /// First identifier field, used to derive item links.
    pub fn primary_identifier(&self) -> Option<&str> {
        self.identifier_fields.first().map(String::as_str)
    }
}

/// One projected row: every FieldSpec field, in FieldSpec order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedRecord {
    values: Vec<(String, String)>,
}

impl NormalizedRecord {
    pub fn new(values: Vec<(String, String)>) -> Self {
        Self { values }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.as_str())
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(_, value)| value.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.values
    }

    /// Copy of this record with one field replaced.
    pub fn with_value(&self, field: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        let values = self
            .values
            .iter()
            .map(|(name, v)| {
                if name == field {
                    (name.clone(), value.clone())
                } else {
                    (name.clone(), v.clone())
                }
            })
            .collect();
        Self { values }
    }

    pub fn to_raw(&self) -> RawRecord {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), JsonValue::String(value.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One HTTP call against the export endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub base_url: String,
    pub collection: CollectionId,
    pub offset: Option<u64>,
    pub limit: u64,
}

impl PageRequest {
    /// `rows=0` request used to read `numFound`.
    pub fn count_only(base_url: impl Into<String>, collection: CollectionId) -> Self {
        Self {
            base_url: base_url.into(),
            collection,
            offset: None,
            limit: 0,
        }
    }

    pub fn url(&self, date_range: Option<&DateRange>) -> String {
        let mut query = vec![format!("rows={}", self.limit)];
        if let Some(offset) = self.offset {
            query.push(format!("start={offset}"));
        }
        if let Some(range) = date_range {
            query.push(format!("from={}", range.from_param()));
            query.push(format!("until={}", range.until_param()));
        }
        format!("{}{}?{}", self.base_url, self.collection, query.join("&"))
    }
}
