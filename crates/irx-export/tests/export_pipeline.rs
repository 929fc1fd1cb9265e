use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use irx_core::{CollectionEntry, CollectionMap, DateRange, FieldSpec, ValidationError};
use irx_export::{
    ExportConfig, ExportError, ExportOptions, Exporter, FailureKind, Layout, ALL_ITEMS_TABLE,
};
use irx_storage::{FetchError, JsonSource};
use serde_json::{json, Value as JsonValue};

const BASE: &str = "http://repo.test/collection/";

#[derive(Clone, Default)]
struct FakeSource {
    responses: Arc<HashMap<String, Result<JsonValue, u16>>>,
    requested: Arc<Mutex<Vec<String>>>,
}

impl FakeSource {
    fn new(responses: Vec<(String, Result<JsonValue, u16>)>) -> Self {
        Self {
            responses: Arc::new(responses.into_iter().collect()),
            requested: Arc::default(),
        }
    }

    fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl JsonSource for FakeSource {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        self.requested.lock().unwrap().push(url.to_string());
        match self.responses.get(url) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(status)) => Err(FetchError::HttpStatus {
                status: *status,
                url: url.to_string(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

fn count(id: &str, n: u64) -> (String, Result<JsonValue, u16>) {
    (
        format!("{BASE}{id}?rows=0"),
        Ok(json!({ "response": { "numFound": n, "docs": [] } })),
    )
}

fn page(url_suffix: &str, docs: JsonValue) -> (String, Result<JsonValue, u16>) {
    (
        format!("{BASE}{url_suffix}"),
        Ok(json!({ "response": { "numFound": 0, "docs": docs } })),
    )
}

fn doc(pid: u32, title: &str) -> JsonValue {
    json!({ "PID": format!("noaa:{pid}"), "mods.title": title })
}

fn fields() -> FieldSpec {
    FieldSpec::new(["PID", "mods.title"])
        .unwrap()
        .with_identifier_fields(["PID"])
        .with_identifier_prefix(Some("noaa:".to_string()))
}

fn collections() -> CollectionMap {
    CollectionMap::new(vec![
        CollectionEntry::new("Test Collection (TC)", "6"),
        CollectionEntry::new("Second Collection", "7"),
    ])
    .unwrap()
}

fn exporter(out: &Path, page_size: u64, source: &FakeSource, fields: FieldSpec) -> Exporter {
    let config = ExportConfig {
        api_url: BASE.to_string(),
        item_url: "https://repo.test/view/".to_string(),
        output_dir: out.to_path_buf(),
        page_size,
        ..Default::default()
    };
    Exporter::new(config, collections(), fields, Box::new(source.clone()))
}

fn read(path: &str) -> String {
    std::fs::read_to_string(path).expect("read output")
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn single_page_export_dedupes_rows_under_a_header() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![
        count("6", 3),
        page(
            "6?rows=3",
            json!([doc(1, "A"), doc(2, "B"), doc(1, "A")]),
        ),
    ]);
    let exporter = exporter(dir.path(), 5, &source, fields());

    let summary = exporter
        .export_collection("Test Collection (TC)", &ExportOptions::default())
        .await
        .unwrap();

    assert_eq!(read(&summary.output_path), "PID|mods.title\n1|A\n2|B\n");
    assert_eq!(summary.pages_fetched, 1);
    assert_eq!(summary.rows_before_dedupe, 3);
    assert_eq!(summary.rows_written, 2);
    assert_eq!(summary.collections.len(), 1);
    assert_eq!(summary.output_sha256.len(), 64);

    let file_name = Path::new(&summary.output_path)
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    assert!(file_name.starts_with("test_collection_"), "{file_name}");
    assert!(file_name.ends_with(".csv"), "{file_name}");
}

#[tokio::test]
async fn pagination_issues_clamped_contiguous_requests() {
    let dir = tempfile::tempdir().unwrap();
    let docs = |range: std::ops::Range<u32>| {
        JsonValue::Array(range.map(|i| doc(i, &format!("T{i}"))).collect())
    };
    let source = FakeSource::new(vec![
        count("6", 12),
        page("6?rows=5&start=0", docs(0..5)),
        page("6?rows=5&start=5", docs(5..10)),
        page("6?rows=2&start=10", docs(10..12)),
    ]);
    let exporter = exporter(dir.path(), 5, &source, fields());

    let summary = exporter
        .export_collection("6", &ExportOptions::default())
        .await
        .unwrap();

    assert_eq!(
        source.requested(),
        vec![
            format!("{BASE}6?rows=0"),
            format!("{BASE}6?rows=5&start=0"),
            format!("{BASE}6?rows=5&start=5"),
            format!("{BASE}6?rows=2&start=10"),
        ]
    );
    assert_eq!(summary.pages_fetched, 3);
    assert_eq!(summary.rows_written, 12);

    let body = read(&summary.output_path);
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 13);
    assert_eq!(lines[1], "0|T0");
    assert_eq!(lines[12], "11|T11");
}

#[tokio::test]
async fn server_error_fails_the_export_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let source = FakeSource::new(vec![count("6", 3), (format!("{BASE}6?rows=3"), Err(500))]);
    let exporter = exporter(&out, 5, &source, fields());

    let err = exporter
        .export_collection("6", &ExportOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Fetch);
    assert!(err.to_string().contains(&format!("{BASE}6?rows=3")));
    assert_eq!(file_count(&out), 0);
}

#[tokio::test]
async fn malformed_page_is_a_schema_failure() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![
        count("6", 2),
        (format!("{BASE}6?rows=2"), Ok(json!({ "response": {} }))),
    ]);
    let exporter = exporter(dir.path(), 5, &source, fields());

    let err = exporter
        .export_collection("6", &ExportOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Schema);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_any_request() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![count("6", 3)]);

    let err = exporter(dir.path(), 5, &source, fields())
        .export_collection("Unknown", &ExportOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExportError::Validation(ValidationError::UnknownCollection(_))
    ));

    let options = ExportOptions {
        explode: Some("mods.subject".to_string()),
        ..Default::default()
    };
    let err = exporter(dir.path(), 5, &source, fields())
        .export_collection("6", &options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);

    let err = exporter(dir.path(), 0, &source, fields())
        .export_all(&ExportOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExportError::Validation(ValidationError::ZeroPageSize)
    ));

    assert!(source.requested().is_empty());
}

#[tokio::test]
async fn failed_count_request_stops_before_any_page() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let source = FakeSource::new(vec![(format!("{BASE}6?rows=0"), Err(500))]);
    let exporter = exporter(&out, 5, &source, fields());

    let err = exporter
        .export_collection("6", &ExportOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Fetch);
    assert_eq!(source.requested(), vec![format!("{BASE}6?rows=0")]);
    assert_eq!(file_count(&out), 0);
}

#[tokio::test]
async fn count_without_num_found_is_a_schema_failure() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let source = FakeSource::new(vec![(
        format!("{BASE}6?rows=0"),
        Ok(json!({ "response": { "docs": [] } })),
    )]);
    let exporter = exporter(&out, 5, &source, fields());

    let err = exporter
        .export_collection("6", &ExportOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Schema);
    assert!(err.to_string().contains("response.numFound"));
    assert_eq!(source.requested(), vec![format!("{BASE}6?rows=0")]);
    assert_eq!(file_count(&out), 0);
}

#[tokio::test]
async fn failed_table_write_leaves_no_database_behind() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![
        count("6", 1),
        page("6?rows=1", json!([{ "a.b": "x", "a_b": "y" }])),
        count("7", 0),
    ]);
    // both fields map to the column `a_b`
    let clashing = FieldSpec::new(["a.b", "a_b"]).unwrap();
    let exporter = exporter(dir.path(), 5, &source, clashing);

    let err = exporter.export_database(None).await.unwrap_err();

    assert_eq!(err.kind(), FailureKind::Output);
    assert!(matches!(err, ExportError::Database(_)));
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn date_range_is_sent_on_every_request() {
    let dir = tempfile::tempdir().unwrap();
    let dates = "from=2020-01-01T00:00:00Z&until=2020-02-01T00:00:00Z";
    let source = FakeSource::new(vec![
        (
            format!("{BASE}6?rows=0&{dates}"),
            Ok(json!({ "response": { "numFound": 1, "docs": [] } })),
        ),
        page(&format!("6?rows=1&{dates}"), json!([doc(9, "Dated")])),
    ]);
    let exporter = exporter(dir.path(), 5, &source, fields());
    let options = ExportOptions {
        date_range: Some(DateRange::parse("2020-01-01", "2020-02-01").unwrap()),
        file_name: Some("dated.csv".to_string()),
        ..Default::default()
    };

    let summary = exporter.export_collection("6", &options).await.unwrap();
    assert_eq!(read(&summary.output_path), "PID|mods.title\n9|Dated\n");
    assert!(summary.output_path.ends_with("dated.csv"));
}

#[tokio::test]
async fn export_all_concatenates_in_map_order_and_dedupes_across_collections() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![
        count("6", 2),
        page("6?rows=2", json!([doc(2, "B"), doc(1, "A")])),
        count("7", 2),
        page("7?rows=2", json!([doc(1, "A"), doc(3, "C")])),
    ]);
    let exporter = exporter(dir.path(), 5, &source, fields());

    let summary = exporter.export_all(&ExportOptions::default()).await.unwrap();

    assert_eq!(read(&summary.output_path), "PID|mods.title\n2|B\n1|A\n3|C\n");
    assert_eq!(summary.collections.len(), 2);
    assert_eq!(summary.rows_before_dedupe, 4);
    assert!(summary.output_path.contains("all_collections_"));
}

#[tokio::test]
async fn title_link_layout_with_exploded_titles() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![
        count("6", 2),
        page(
            "6?rows=2",
            json!([
                { "PID": "noaa:10", "mods.title": ["First", "Second"] },
                { "PID": null, "mods.title": "Orphan" }
            ]),
        ),
    ]);
    let exporter = exporter(dir.path(), 5, &source, fields());
    let options = ExportOptions {
        layout: Layout::TitleLink,
        explode: Some("Title".to_string()),
        file_name: Some("links.csv".to_string()),
        ..Default::default()
    };

    let summary = exporter.export_collection("6", &options).await.unwrap();
    assert_eq!(
        read(&summary.output_path),
        "Title|Link\nFirst|https://repo.test/view/10\nSecond|https://repo.test/view/10\nOrphan|\n"
    );
}

#[tokio::test]
async fn json_export_keeps_raw_documents() {
    let dir = tempfile::tempdir().unwrap();
    let raw = json!([{ "PID": "noaa:1", "mods.title": "A", "extra": [1, 2] }]);
    let source = FakeSource::new(vec![count("6", 1), page("6?rows=1", raw.clone())]);
    let exporter = exporter(dir.path(), 5, &source, fields());

    let summary = exporter.export_json("6", None).await.unwrap();
    let written: JsonValue = serde_json::from_str(&read(&summary.output_path)).unwrap();
    assert_eq!(written, raw);
    assert!(summary.output_path.ends_with(".json"));
}

#[tokio::test]
async fn facet_counts_across_all_collections() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![
        count("6", 2),
        page(
            "6?rows=2",
            json!([
                { "mods.subject": ["Weather", "Climate"] },
                { "mods.subject": "Weather" }
            ]),
        ),
        count("7", 1),
        page("7?rows=1", json!([{ "mods.subject": ["Climate", "Weather"] }])),
    ]);
    let exporter = exporter(dir.path(), 5, &source, fields());

    let counts = exporter
        .facet_counts(None, "mods.subject", None)
        .await
        .unwrap();
    let pairs: Vec<(&str, usize)> = counts.iter().map(|c| (c.value.as_str(), c.count)).collect();
    assert_eq!(pairs, vec![("Weather", 3), ("Climate", 2)]);
}

#[tokio::test]
async fn database_export_writes_tables_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![
        count("6", 2),
        page("6?rows=2", json!([doc(1, "A"), doc(2, "B")])),
        count("7", 2),
        page("7?rows=2", json!([doc(2, "B"), doc(3, "C")])),
    ]);
    let exporter = exporter(dir.path(), 5, &source, fields());

    let summary = exporter.export_database(None).await.unwrap();
    let rows: Vec<(&str, u64)> = summary
        .tables
        .iter()
        .map(|t| (t.name.as_str(), t.rows))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("test_collection", 2),
            ("second_collection", 2),
            (ALL_ITEMS_TABLE, 3)
        ]
    );

    let pool = sqlx::SqlitePool::connect(&format!("sqlite://{}", summary.database_path))
        .await
        .unwrap();
    let titles: Vec<String> =
        sqlx::query_scalar("SELECT mods_title FROM all_unique_items ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(titles, vec!["A", "B", "C"]);
    pool.close().await;

    let metadata: JsonValue = serde_json::from_str(&read(&summary.metadata_path)).unwrap();
    let stem = Path::new(&summary.database_path)
        .file_stem()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    assert_eq!(
        metadata["databases"][&stem]["tables"]["test_collection"]["description"],
        "Items in Test Collection (TC) collection"
    );
    assert!(!Path::new(&format!("{}.partial", summary.database_path)).exists());
}

#[tokio::test]
async fn plan_counts_once_and_sizes_pages() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![count("7", 3001)]);
    let exporter = exporter(dir.path(), 1500, &source, fields());

    let plan = exporter.plan("Second Collection", None).await.unwrap();
    assert_eq!(plan.total_rows(), 3001);
    let limits: Vec<u64> = plan.map(|r| r.limit).collect();
    assert_eq!(limits, vec![1500, 1500, 1]);
    assert_eq!(source.requested(), vec![format!("{BASE}7?rows=0")]);
}
