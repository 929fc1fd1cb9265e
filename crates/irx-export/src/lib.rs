//! Export pipeline: count, paginate, fetch, project, dedupe and write.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use irx_adapters::{
    explode, facet_counts as count_facets, normalize_value, page_lacks_all_fields,
    parse_collection_list, parse_docs, parse_num_found, project, AdapterError, FacetCount,
    SchemaError, TitleLinkLayout, TITLE_LINK_HEADER,
};
use irx_core::{
    CollectionEntry, CollectionId, CollectionMap, DateRange, FieldSpec, NormalizedRecord,
    PageRequest, RawRecord, ValidationError, DEFAULT_API_URL, DEFAULT_ITEM_URL,
    MULTI_VALUE_DELIMITER,
};
use irx_storage::{
    DelimitedFormat, FetchError, HttpClientConfig, HttpFetcher, JsonSource, OutputStore,
    StoredOutput,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "irx-export";

pub const DEFAULT_PAGE_SIZE: u64 = 1500;
pub const DEFAULT_COLLECTIONS_FILE: &str = "collections.yaml";
pub const DEFAULT_TITLE_FIELD: &str = "mods.title";
pub const DEFAULT_COLLECTIONS_PAGE_URL: &str = "https://repository.library.noaa.gov/browse/collections";
pub const ALL_ITEMS_TABLE: &str = "all_unique_items";
pub const DATABASE_METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("unexpected response: {0}")]
    Schema(#[from] SchemaError),
    #[error("collection list: {0}")]
    Discovery(#[from] AdapterError),
    #[error("encoding row: {0}")]
    Encode(#[from] csv::Error),
    #[error("writing database: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Output(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Fetch,
    Schema,
    Output,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Validation => "validation",
            Self::Fetch => "fetch",
            Self::Schema => "schema",
            Self::Output => "output",
        };
        f.write_str(label)
    }
}

impl ExportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) => FailureKind::Validation,
            // 2xx with a body that is not JSON
            Self::Fetch(FetchError::Decode { .. }) => FailureKind::Schema,
            Self::Fetch(_) => FailureKind::Fetch,
            Self::Schema(_) | Self::Discovery(_) => FailureKind::Schema,
            Self::Encode(_) | Self::Database(_) | Self::Output(_) => FailureKind::Output,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub api_url: String,
    pub item_url: String,
    pub output_dir: PathBuf,
    pub page_size: u64,
    pub delimiter: u8,
    pub title_field: String,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
    pub collections_file: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            item_url: DEFAULT_ITEM_URL.to_string(),
            output_dir: PathBuf::from("./output"),
            page_size: DEFAULT_PAGE_SIZE,
            delimiter: b'|',
            title_field: DEFAULT_TITLE_FIELD.to_string(),
            user_agent: "irx/0.1".to_string(),
            http_timeout_secs: None,
            collections_file: PathBuf::from(DEFAULT_COLLECTIONS_FILE),
        }
    }
}

impl ExportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: std::env::var("IRX_API_URL").unwrap_or(defaults.api_url),
            item_url: std::env::var("IRX_ITEM_URL").unwrap_or(defaults.item_url),
            output_dir: std::env::var("IRX_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            page_size: std::env::var("IRX_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_size),
            delimiter: std::env::var("IRX_DELIMITER")
                .ok()
                .and_then(|v| parse_delimiter(&v).ok())
                .unwrap_or(defaults.delimiter),
            title_field: std::env::var("IRX_TITLE_FIELD").unwrap_or(defaults.title_field),
            user_agent: std::env::var("IRX_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("IRX_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            collections_file: std::env::var("IRX_COLLECTIONS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.collections_file),
        }
    }

    pub fn format(&self) -> DelimitedFormat {
        DelimitedFormat::new(self.delimiter)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Accepts a single ASCII character or one of `pipe`, `tab`, `comma`.
pub fn parse_delimiter(input: &str) -> Result<u8, ValidationError> {
    match input {
        "|" | "pipe" => Ok(b'|'),
        "\t" | "\\t" | "tab" => Ok(b'\t'),
        "," | "comma" => Ok(b','),
        other if other.len() == 1 && other.is_ascii() && !matches!(other, "\n" | "\r" | "\"") => {
            Ok(other.as_bytes()[0])
        }
        other => Err(ValidationError::InvalidDelimiter(other.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegistryId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCollection {
    pub name: String,
    pub id: RegistryId,
}

/// `collections.yaml`: the collection map and, optionally, the field spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRegistry {
    #[serde(default)]
    pub collections: Vec<RegistryCollection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier_prefix: Option<String>,
}

impl CollectionRegistry {
    /// `Ok(None)` when the file does not exist.
    pub async fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))
            .map(Some)
    }

    pub fn from_map(map: &CollectionMap) -> Self {
        Self {
            collections: map
                .iter()
                .map(|entry| RegistryCollection {
                    name: entry.name.clone(),
                    id: RegistryId::Text(entry.id.to_string()),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("serializing collection registry")
    }

    /// Falls back to the NOAA map when no collections are listed.
    pub fn collection_map(&self) -> Result<CollectionMap, ValidationError> {
        if self.collections.is_empty() {
            return Ok(CollectionMap::noaa_default());
        }
        CollectionMap::new(
            self.collections
                .iter()
                .map(|c| CollectionEntry::new(c.name.clone(), c.id.to_string()))
                .collect(),
        )
    }

    /// Unset keys keep the NOAA defaults; an empty `identifier_prefix` disables stripping.
    pub fn field_spec(&self) -> Result<FieldSpec, ValidationError> {
        let defaults = FieldSpec::noaa_default();
        let fields = if self.fields.is_empty() {
            defaults.fields().to_vec()
        } else {
            self.fields.clone()
        };
        let identifier_fields = self
            .identifier_fields
            .clone()
            .unwrap_or_else(|| defaults.identifier_fields().to_vec());
        let document_type_fields = self
            .document_type_fields
            .clone()
            .unwrap_or_else(|| defaults.document_type_fields().to_vec());
        let prefix = match &self.identifier_prefix {
            Some(prefix) => Some(prefix.clone()),
            None => defaults.identifier_prefix().map(String::from),
        };
        Ok(FieldSpec::new(fields)?
            .with_identifier_fields(identifier_fields)
            .with_document_type_fields(document_type_fields)
            .with_identifier_prefix(prefix))
    }
}

/// Lazy sequence of page requests covering `[0, total_rows)`.
///
/// Fewer rows than one page yields a single request without `start`; otherwise
/// pages are contiguous and the last one is clamped to the remainder. Clone (or
/// [`PagePlan::restart`]) to walk it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePlan {
    base_url: String,
    collection: CollectionId,
    total_rows: u64,
    page_size: u64,
    next_offset: u64,
}

impl PagePlan {
    pub fn new(
        base_url: impl Into<String>,
        collection: CollectionId,
        total_rows: u64,
        page_size: u64,
    ) -> Result<Self, ValidationError> {
        if page_size == 0 {
            return Err(ValidationError::ZeroPageSize);
        }
        Ok(Self {
            base_url: base_url.into(),
            collection,
            total_rows,
            page_size,
            next_offset: 0,
        })
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn restart(&self) -> Self {
        Self {
            next_offset: 0,
            ..self.clone()
        }
    }

    fn remaining_pages(&self) -> u64 {
        let remaining = self.total_rows.saturating_sub(self.next_offset);
        if remaining == 0 {
            0
        } else if self.total_rows < self.page_size {
            1
        } else {
            remaining.div_ceil(self.page_size)
        }
    }

    fn request(&self, offset: Option<u64>, limit: u64) -> PageRequest {
        PageRequest {
            base_url: self.base_url.clone(),
            collection: self.collection.clone(),
            offset,
            limit,
        }
    }
}

impl Iterator for PagePlan {
    type Item = PageRequest;

    fn next(&mut self) -> Option<PageRequest> {
        if self.next_offset >= self.total_rows {
            return None;
        }
        let request = if self.total_rows < self.page_size {
            self.request(None, self.total_rows)
        } else {
            let limit = self.page_size.min(self.total_rows - self.next_offset);
            self.request(Some(self.next_offset), limit)
        };
        self.next_offset += request.limit;
        Some(request)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let pages = usize::try_from(self.remaining_pages()).unwrap_or(usize::MAX);
        (pages, Some(pages))
    }
}

impl ExactSizeIterator for PagePlan {}

/// Reads `numFound` with a `rows=0` request and turns it into a [`PagePlan`].
pub struct Paginator<'a> {
    source: &'a dyn JsonSource,
    base_url: &'a str,
    page_size: u64,
}

impl<'a> Paginator<'a> {
    pub fn new(
        source: &'a dyn JsonSource,
        base_url: &'a str,
        page_size: u64,
    ) -> Result<Self, ValidationError> {
        if page_size == 0 {
            return Err(ValidationError::ZeroPageSize);
        }
        Ok(Self {
            source,
            base_url,
            page_size,
        })
    }

    pub async fn count_rows(
        &self,
        collection: &CollectionId,
        date_range: Option<&DateRange>,
    ) -> Result<u64, ExportError> {
        let url = PageRequest::count_only(self.base_url, collection.clone()).url(date_range);
        let body = self.source.get_json(&url).await?;
        Ok(parse_num_found(&url, &body)?)
    }

    pub async fn plan(
        &self,
        collection: &CollectionId,
        date_range: Option<&DateRange>,
    ) -> Result<PagePlan, ExportError> {
        let total_rows = self.count_rows(collection, date_range).await?;
        Ok(PagePlan::new(
            self.base_url,
            collection.clone(),
            total_rows,
            self.page_size,
        )?)
    }
}

/// One page of raw documents.
pub async fn fetch_page(
    source: &dyn JsonSource,
    request: &PageRequest,
    date_range: Option<&DateRange>,
) -> Result<Vec<RawRecord>, ExportError> {
    let url = request.url(date_range);
    let body = source.get_json(&url).await?;
    Ok(parse_docs(&url, body)?)
}

/// Projected rows in page order, with the column names used for the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputDataset {
    columns: Vec<String>,
    records: Vec<NormalizedRecord>,
}

impl OutputDataset {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            records: Vec::new(),
        }
    }

    pub fn collect<I>(columns: Vec<String>, pages: I) -> Self
    where
        I: IntoIterator<Item = Vec<NormalizedRecord>>,
    {
        let mut dataset = Self::new(columns);
        for page in pages {
            dataset.push_page(page);
        }
        dataset
    }

    pub fn push_page(&mut self, page: Vec<NormalizedRecord>) {
        self.records.extend(page);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<NormalizedRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops rows whose encoded line matches an earlier row; the first one wins.
    /// Returns the number of rows removed.
    pub fn dedup(&mut self, format: DelimitedFormat) -> Result<usize, csv::Error> {
        let before = self.records.len();
        let mut seen = HashSet::with_capacity(before);
        let mut kept = Vec::with_capacity(before);
        for record in std::mem::take(&mut self.records) {
            let line = format.encode_row(record.values())?;
            if seen.insert(line) {
                kept.push(record);
            }
        }
        self.records = kept;
        Ok(before - self.records.len())
    }

    /// Header first, then one line per record. Nothing lands at `file_name`
    /// unless every row was written.
    pub fn write(
        &self,
        store: &OutputStore,
        file_name: &str,
        format: DelimitedFormat,
    ) -> Result<StoredOutput, ExportError> {
        let mut file = store.create_file(file_name)?;
        file.write_bytes(&format.encode_row(&self.columns)?)?;
        for record in &self.records {
            file.write_bytes(&format.encode_row(record.values())?)?;
        }
        Ok(file.finish()?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Layout {
    /// One column per field spec entry.
    #[default]
    Fields,
    /// `Title`, `Link`.
    TitleLink,
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub date_range: Option<DateRange>,
    pub layout: Layout,
    /// Emit one row per `;`-separated value of this column.
    pub explode: Option<String>,
    /// Overrides the dated default file name.
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub collections: Vec<CollectionId>,
    pub pages_fetched: usize,
    pub rows_fetched: usize,
    pub rows_before_dedupe: usize,
    pub rows_written: usize,
    pub output_path: String,
    pub output_bytes: usize,
    pub output_sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub collection: Option<CollectionId>,
    pub rows: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: usize,
    pub database_path: String,
    pub metadata_path: String,
    pub tables: Vec<TableSummary>,
}

struct TableRows {
    name: String,
    entry: Option<CollectionEntry>,
    rows: Vec<NormalizedRecord>,
}

/// SQLite output: one `TEXT` column per field plus an autoincrement `id`.
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub async fn create(path: &Path) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn write_table(
        &self,
        table: &str,
        columns: &[String],
        rows: &[NormalizedRecord],
    ) -> Result<u64, sqlx::Error> {
        let create = create_table_sql(table, columns);
        let insert = insert_sql(table, columns);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&create).execute(&mut *tx).await?;
        let mut inserted = 0;
        for row in rows {
            let mut query = sqlx::query(&insert);
            for value in row.values() {
                query = query.bind(value.to_owned());
            }
            inserted += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `mods.title` -> `mods_title`; a field literally named `id` becomes `field_id`.
pub fn column_name(field: &str) -> String {
    let name = field.replace('.', "_");
    if name.eq_ignore_ascii_case("id") {
        format!("field_{name}")
    } else {
        name
    }
}

fn create_table_sql(table: &str, columns: &[String]) -> String {
    let columns = columns
        .iter()
        .map(|c| format!("{} TEXT", quote_ident(&column_name(c))))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY AUTOINCREMENT, {columns})",
        quote_ident(table)
    )
}

fn insert_sql(table: &str, columns: &[String]) -> String {
    let names = columns
        .iter()
        .map(|c| quote_ident(&column_name(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let params = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({names}) VALUES ({params})",
        quote_ident(table)
    )
}

fn database_metadata(stem: &str, tables: &[TableRows]) -> JsonValue {
    let described: Map<String, JsonValue> = tables
        .iter()
        .map(|table| {
            let description = match &table.entry {
                Some(entry) => format!("Items in {} collection", entry.name),
                None => "Unique items across all collections".to_string(),
            };
            (table.name.clone(), json!({ "description": description }))
        })
        .collect();
    let mut databases = Map::new();
    databases.insert(
        stem.to_string(),
        json!({
            "title": "Institutional Repository data",
            "description": "Table for each collection as well as a table for all unique items.",
            "tables": described,
        }),
    );
    json!({ "databases": databases })
}

fn today_stamp() -> String {
    Utc::now().format("%Y_%m_%d").to_string()
}

/// One export session: configuration, collection map and field spec, used from a
/// single task. Pages are fetched one at a time.
pub struct Exporter {
    config: ExportConfig,
    collections: CollectionMap,
    fields: FieldSpec,
    source: Box<dyn JsonSource>,
    store: OutputStore,
}

impl Exporter {
    pub fn new(
        config: ExportConfig,
        collections: CollectionMap,
        fields: FieldSpec,
        source: Box<dyn JsonSource>,
    ) -> Self {
        let store = OutputStore::new(config.output_dir.clone());
        Self {
            config,
            collections,
            fields,
            source,
            store,
        }
    }

    /// HTTP-backed session; collections and fields come from the registry file
    /// when present.
    pub async fn from_config(config: ExportConfig) -> anyhow::Result<Self> {
        let registry = CollectionRegistry::load(&config.collections_file).await?;
        let (collections, fields) = match &registry {
            Some(registry) => (registry.collection_map()?, registry.field_spec()?),
            None => (CollectionMap::noaa_default(), FieldSpec::noaa_default()),
        };
        let source = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::new(config, collections, fields, Box::new(source)))
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn collections(&self) -> &CollectionMap {
        &self.collections
    }

    pub fn field_spec(&self) -> &FieldSpec {
        &self.fields
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    pub fn columns(&self, layout: Layout) -> Vec<String> {
        match layout {
            Layout::Fields => self.fields.fields().to_vec(),
            Layout::TitleLink => TITLE_LINK_HEADER.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn ensure_page_size(&self) -> Result<(), ValidationError> {
        if self.config.page_size == 0 {
            Err(ValidationError::ZeroPageSize)
        } else {
            Ok(())
        }
    }

    fn validate(&self, options: &ExportOptions) -> Result<(), ValidationError> {
        self.ensure_page_size()?;
        if let Some(field) = &options.explode {
            if !self.columns(options.layout).iter().any(|c| c == field) {
                return Err(ValidationError::UnknownField(field.clone()));
            }
        }
        Ok(())
    }

    fn dated_file_name(&self, stem: &str) -> String {
        format!(
            "{stem}_{}.{}",
            today_stamp(),
            self.config.format().file_extension()
        )
    }

    /// Page plan for one collection (issues the count request).
    pub async fn plan(
        &self,
        name_or_id: &str,
        date_range: Option<&DateRange>,
    ) -> Result<PagePlan, ExportError> {
        let entry = self.collections.resolve(name_or_id)?;
        let paginator = Paginator::new(&*self.source, &self.config.api_url, self.config.page_size)?;
        paginator.plan(&entry.id, date_range).await
    }

    async fn fetch_pages(
        &self,
        entry: &CollectionEntry,
        date_range: Option<&DateRange>,
    ) -> Result<Vec<Vec<RawRecord>>, ExportError> {
        let paginator = Paginator::new(&*self.source, &self.config.api_url, self.config.page_size)?;
        let plan = paginator.plan(&entry.id, date_range).await?;
        info!(
            collection = %entry.id,
            name = %entry.name,
            total_rows = plan.total_rows(),
            pages = plan.len(),
            "planned collection fetch"
        );

        let mut pages = Vec::with_capacity(plan.len());
        for request in plan {
            let page = fetch_page(&*self.source, &request, date_range).await?;
            let offset = request.offset.unwrap_or(0);
            if page_lacks_all_fields(&page, &self.fields) {
                warn!(
                    collection = %entry.id,
                    offset,
                    docs = page.len(),
                    "page has none of the requested fields"
                );
            }
            info!(collection = %entry.id, offset, limit = request.limit, docs = page.len(), "fetched page");
            pages.push(page);
        }
        Ok(pages)
    }

    fn project_page(&self, page: &[RawRecord], options: &ExportOptions) -> Vec<NormalizedRecord> {
        let rows = match options.layout {
            Layout::Fields => project(page, &self.fields),
            Layout::TitleLink => {
                TitleLinkLayout::new(self.config.title_field.clone(), self.config.item_url.clone())
                    .project(page, &self.fields)
            }
        };
        match &options.explode {
            Some(field) => explode(&rows, field, MULTI_VALUE_DELIMITER),
            None => rows,
        }
    }

    fn write_delimited(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        collections: Vec<CollectionId>,
        pages: &[Vec<RawRecord>],
        options: &ExportOptions,
        file_name: &str,
    ) -> Result<ExportSummary, ExportError> {
        let format = self.config.format();
        let mut dataset = OutputDataset::collect(
            self.columns(options.layout),
            pages.iter().map(|page| self.project_page(page, options)),
        );
        let rows_before_dedupe = dataset.len();
        let removed = dataset.dedup(format)?;
        let stored = dataset.write(&self.store, file_name, format)?;
        info!(
            path = %stored.path.display(),
            rows = dataset.len(),
            duplicates = removed,
            bytes = stored.byte_size,
            "wrote export"
        );

        Ok(ExportSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            collections,
            pages_fetched: pages.len(),
            rows_fetched: pages.iter().map(Vec::len).sum(),
            rows_before_dedupe,
            rows_written: dataset.len(),
            output_path: stored.path.display().to_string(),
            output_bytes: stored.byte_size,
            output_sha256: stored.sha256,
        })
    }

    /// `<collection slug>_<YYYY_MM_DD>.<ext>` unless a file name is given.
    pub async fn export_collection(
        &self,
        name_or_id: &str,
        options: &ExportOptions,
    ) -> Result<ExportSummary, ExportError> {
        let entry = self.collections.resolve(name_or_id)?.clone();
        self.validate(options)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("export_run", %run_id, collection = %entry.id);
        async {
            let pages = self
                .fetch_pages(&entry, options.date_range.as_ref())
                .await?;
            let file_name = options
                .file_name
                .clone()
                .unwrap_or_else(|| self.dated_file_name(&entry.slug()));
            self.write_delimited(
                run_id,
                started_at,
                vec![entry.id.clone()],
                &pages,
                options,
                &file_name,
            )
        }
        .instrument(span)
        .await
    }

    /// Every collection in map order, deduplicated, as `all_collections_<YYYY_MM_DD>.<ext>`.
    pub async fn export_all(&self, options: &ExportOptions) -> Result<ExportSummary, ExportError> {
        self.validate(options)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("export_run", %run_id, collection = "all");
        async {
            let mut pages = Vec::new();
            let mut ids = Vec::with_capacity(self.collections.len());
            for entry in self.collections.iter() {
                pages.extend(
                    self.fetch_pages(entry, options.date_range.as_ref())
                        .await?,
                );
                ids.push(entry.id.clone());
            }
            let file_name = options
                .file_name
                .clone()
                .unwrap_or_else(|| self.dated_file_name("all_collections"));
            self.write_delimited(run_id, started_at, ids, &pages, options, &file_name)
        }
        .instrument(span)
        .await
    }

    /// Raw documents of one collection as a pretty-printed JSON array.
    pub async fn export_json(
        &self,
        name_or_id: &str,
        date_range: Option<&DateRange>,
    ) -> Result<ExportSummary, ExportError> {
        let entry = self.collections.resolve(name_or_id)?.clone();
        self.ensure_page_size()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("export_run", %run_id, collection = %entry.id);
        async {
            let pages = self.fetch_pages(&entry, date_range).await?;
            let records: Vec<&RawRecord> = pages.iter().flatten().collect();
            let bytes =
                serde_json::to_vec_pretty(&records).context("serializing raw records")?;
            let file_name = format!("{}_{}.json", entry.slug(), today_stamp());
            let stored = self.store.store_bytes(&file_name, &bytes)?;
            info!(path = %stored.path.display(), records = records.len(), "wrote json export");

            Ok::<_, ExportError>(ExportSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                collections: vec![entry.id.clone()],
                pages_fetched: pages.len(),
                rows_fetched: records.len(),
                rows_before_dedupe: records.len(),
                rows_written: records.len(),
                output_path: stored.path.display().to_string(),
                output_bytes: stored.byte_size,
                output_sha256: stored.sha256,
            })
        }
        .instrument(span)
        .await
    }

    /// `collections-<MM-DD-YYYY>.db` with one table per collection plus
    /// `all_unique_items`, and a `metadata.json` describing them. Everything is
    /// fetched before the database file is touched.
    pub async fn export_database(
        &self,
        date_range: Option<&DateRange>,
    ) -> Result<DatabaseSummary, ExportError> {
        self.ensure_page_size()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("export_run", %run_id, collection = "database");
        async {
            let mut tables = Vec::with_capacity(self.collections.len() + 1);
            let mut names = HashSet::from([ALL_ITEMS_TABLE.to_string()]);
            let mut pages_fetched = 0;
            for entry in self.collections.iter() {
                let pages = self.fetch_pages(entry, date_range).await?;
                pages_fetched += pages.len();
                let rows: Vec<NormalizedRecord> = pages
                    .iter()
                    .flat_map(|page| project(page, &self.fields))
                    .collect();
                let mut name = entry.slug();
                if !names.insert(name.clone()) {
                    name = format!("{name}_{}", entry.id);
                    names.insert(name.clone());
                }
                tables.push(TableRows {
                    name,
                    entry: Some(entry.clone()),
                    rows,
                });
            }

            let mut all = OutputDataset::collect(
                self.fields.fields().to_vec(),
                tables.iter().map(|table| table.rows.clone()),
            );
            all.dedup(self.config.format())?;
            tables.push(TableRows {
                name: ALL_ITEMS_TABLE.to_string(),
                entry: None,
                rows: all.into_records(),
            });

            let stem = format!("collections-{}", Utc::now().format("%m-%d-%Y"));
            let (database_path, table_summaries) =
                self.write_database(&format!("{stem}.db"), &tables).await?;

            let metadata = serde_json::to_vec_pretty(&database_metadata(&stem, &tables))
                .context("serializing database metadata")?;
            let metadata_out = self.store.store_bytes(DATABASE_METADATA_FILE, &metadata)?;
            info!(
                path = %database_path.display(),
                tables = table_summaries.len(),
                "wrote database"
            );

            Ok::<_, ExportError>(DatabaseSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                pages_fetched,
                database_path: database_path.display().to_string(),
                metadata_path: metadata_out.path.display().to_string(),
                tables: table_summaries,
            })
        }
        .instrument(span)
        .await
    }

    /// Builds the database under a `.partial` name and renames it over any
    /// previous file once every table is committed.
    async fn write_database(
        &self,
        db_name: &str,
        tables: &[TableRows],
    ) -> Result<(PathBuf, Vec<TableSummary>), ExportError> {
        self.store.ensure_root()?;
        let partial_name = format!("{db_name}.partial");
        self.store.remove_if_exists(&partial_name)?;
        let partial = self.store.path_for(&partial_name);
        let columns = self.fields.fields();

        let sink = match SqliteSink::create(&partial).await {
            Ok(sink) => sink,
            Err(err) => {
                self.discard_partial(&partial_name);
                return Err(err.into());
            }
        };
        let written = async {
            let mut summaries = Vec::with_capacity(tables.len());
            for table in tables {
                let rows = sink.write_table(&table.name, columns, &table.rows).await?;
                summaries.push(TableSummary {
                    name: table.name.clone(),
                    collection: table.entry.as_ref().map(|e| e.id.clone()),
                    rows,
                });
            }
            Ok::<_, sqlx::Error>(summaries)
        }
        .await;
        sink.close().await;

        let summaries = match written {
            Ok(summaries) => summaries,
            Err(err) => {
                self.discard_partial(&partial_name);
                return Err(err.into());
            }
        };

        let path = self.store.path_for(db_name);
        if let Err(err) = tokio::fs::rename(&partial, &path).await {
            self.discard_partial(&partial_name);
            return Err(anyhow::Error::new(err)
                .context(format!("moving {} into place", path.display()))
                .into());
        }
        Ok((path, summaries))
    }

    fn discard_partial(&self, partial_name: &str) {
        if let Err(err) = self.store.remove_if_exists(partial_name) {
            warn!(error = %err, "could not remove partial database");
        }
    }

    /// Value counts of one field across one collection (or all of them when
    /// `name_or_id` is `None`). The field does not need to be in the field spec.
    pub async fn facet_counts(
        &self,
        name_or_id: Option<&str>,
        field: &str,
        date_range: Option<&DateRange>,
    ) -> Result<Vec<FacetCount>, ExportError> {
        let entries = match name_or_id {
            Some(name_or_id) => vec![self.collections.resolve(name_or_id)?.clone()],
            None => self.collections.entries().to_vec(),
        };
        if field.trim().is_empty() {
            return Err(ValidationError::UnknownField(field.to_string()).into());
        }
        self.ensure_page_size()?;

        let run_id = Uuid::new_v4();
        let span = info_span!("facet_run", %run_id, field);
        async {
            let mut rows = Vec::new();
            for entry in &entries {
                for page in self.fetch_pages(entry, date_range).await? {
                    rows.extend(page.iter().map(|raw| {
                        NormalizedRecord::new(vec![(
                            field.to_string(),
                            normalize_value(&self.fields, field, raw.get(field)),
                        )])
                    }));
                }
            }
            let counts = count_facets(&rows, field);
            info!(records = rows.len(), distinct = counts.len(), "counted facet values");
            Ok::<_, ExportError>(counts)
        }
        .instrument(span)
        .await
    }
}

/// Scrapes the repository's collection browse page into a collection map.
pub async fn discover_collections(
    fetcher: &HttpFetcher,
    url: &str,
) -> Result<CollectionMap, ExportError> {
    let html = fetcher.get_text(url).await?;
    let entries = parse_collection_list(&html)?;
    info!(url, collections = entries.len(), "discovered collections");
    Ok(CollectionMap::new(entries)?)
}
