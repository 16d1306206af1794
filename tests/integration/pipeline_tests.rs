use crate::{create_test_fetcher, listing_page};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tidemark::checkpoint::{CheckpointError, CheckpointStore, Cursor};
use tidemark::config::{CorruptionPolicy, FieldRule};
use tidemark::dataset::{CsvStore, DatasetError, IncrementalMerger, Record, SqliteStore};
use tidemark::pipeline::{Pipeline, SelectorExtractor, WorkUnit};
use tidemark::{IngestError, MetricsRegistry};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dataset_path(dir: &Path) -> std::path::PathBuf {
    dir.join("listings.csv")
}

fn checkpoint_path(dir: &Path) -> std::path::PathBuf {
    dir.join("checkpoint.json")
}

fn create_test_merger(dir: &Path) -> IncrementalMerger {
    IncrementalMerger::new(Box::new(CsvStore::new(dataset_path(dir))), "id")
}

/// Builds a two-worker pipeline writing into `dir`
fn create_test_pipeline(dir: &Path, metrics: Arc<MetricsRegistry>) -> Pipeline {
    create_test_pipeline_with(dir, create_test_merger(dir), metrics)
}

fn create_test_pipeline_with(
    dir: &Path,
    merger: IncrementalMerger,
    metrics: Arc<MetricsRegistry>,
) -> Pipeline {
    let extractor = SelectorExtractor::new(
        "div.item",
        &[
            (
                "id".to_string(),
                FieldRule {
                    selector: None,
                    attribute: Some("data-id".to_string()),
                },
            ),
            (
                "name".to_string(),
                FieldRule {
                    selector: Some("h2".to_string()),
                    attribute: None,
                },
            ),
        ],
    )
    .expect("Failed to build extractor")
    .with_unit_key("id");

    Pipeline::new(
        Arc::new(create_test_fetcher(&["TestBot/1.0"], 2, metrics.clone())),
        Arc::new(extractor),
        Arc::new(merger),
        CheckpointStore::new(checkpoint_path(dir), CorruptionPolicy::Fail),
        metrics,
        2,
    )
}

/// Mounts `/list/{page}` answering with the given items
async fn mount_page(server: &MockServer, page: u64, items: &[(&str, &str)], expected: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/list/{}", page)))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(items)))
        .expect(expected)
        .mount(server)
        .await;
}

fn page_units(server: &MockServer, pages: u64) -> Vec<WorkUnit> {
    (0..pages)
        .map(|page| WorkUnit::new(page, format!("{}/list/{}", server.uri(), page)))
        .collect()
}

fn sorted_keys(dir: &Path) -> Vec<String> {
    let mut keys: Vec<String> = create_test_merger(dir)
        .known_keys()
        .expect("Failed to read dataset")
        .into_iter()
        .collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn test_full_run_merges_and_checkpoints() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    mount_page(&mock_server, 0, &[("A1", "Lamp"), ("A2", "Desk")], 1).await;
    mount_page(&mock_server, 1, &[("A3", "Chair"), ("A1", "Lamp v2")], 1).await;
    mount_page(&mock_server, 2, &[("A4", "Shelf")], 1).await;

    let metrics = Arc::new(MetricsRegistry::new(10));
    let mut pipeline = create_test_pipeline(dir.path(), metrics.clone());

    let report = pipeline.run(page_units(&mock_server, 3)).await.unwrap();

    assert_eq!(report.completed, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.cursor, Cursor::Completed(2));
    assert!(!report.interrupted);

    // A1 appears on two pages but is stored once
    assert_eq!(sorted_keys(dir.path()), vec!["A1", "A2", "A3", "A4"]);

    let checkpoint = CheckpointStore::read(&checkpoint_path(dir.path()))
        .unwrap()
        .expect("Checkpoint should exist");
    assert_eq!(checkpoint.cursor, Cursor::Completed(2));

    assert_eq!(metrics.counter("units.completed"), 3);
    assert_eq!(metrics.snapshot().timers["unit"].count, 3);
}

#[tokio::test]
async fn test_resume_skips_checkpointed_units() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let mut store = CheckpointStore::new(checkpoint_path(dir.path()), CorruptionPolicy::Fail);
    store.advance(1).unwrap();

    mount_page(&mock_server, 0, &[("A1", "Lamp")], 0).await;
    mount_page(&mock_server, 1, &[("A2", "Desk")], 0).await;
    mount_page(&mock_server, 2, &[("A3", "Chair")], 1).await;
    mount_page(&mock_server, 3, &[("A4", "Shelf")], 1).await;

    let mut pipeline = create_test_pipeline(dir.path(), Arc::new(MetricsRegistry::new(10)));
    let report = pipeline.run(page_units(&mock_server, 4)).await.unwrap();

    assert_eq!(report.skipped, 2);
    assert_eq!(report.completed, 2);
    assert_eq!(report.cursor, Cursor::Completed(3));
    assert_eq!(sorted_keys(dir.path()), vec!["A3", "A4"]);
}

#[tokio::test]
async fn test_failed_unit_pins_checkpoint_until_retried() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    mount_page(&mock_server, 0, &[("A1", "Lamp")], 1).await;
    Mock::given(method("GET"))
        .and(path("/list/1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;
    mount_page(&mock_server, 2, &[("A3", "Chair")], 1).await;

    let metrics = Arc::new(MetricsRegistry::new(10));
    let mut pipeline = create_test_pipeline(dir.path(), metrics.clone());
    let report = pipeline.run(page_units(&mock_server, 3)).await.unwrap();

    // Unit 2 finished, but the gap at unit 1 holds the cursor back
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.cursor, Cursor::Completed(0));
    assert_eq!(metrics.counter("units.failed"), 1);
    assert_eq!(metrics.snapshot().errors.get("fatal"), Some(&1));

    // Second run once the page is back: unit 1 is fetched, unit 2 again
    mock_server.reset().await;
    mount_page(&mock_server, 0, &[("A1", "Lamp")], 0).await;
    mount_page(&mock_server, 1, &[("A2", "Desk")], 1).await;
    mount_page(&mock_server, 2, &[("A3", "Chair")], 1).await;

    let mut pipeline = create_test_pipeline(dir.path(), Arc::new(MetricsRegistry::new(10)));
    let report = pipeline.run(page_units(&mock_server, 3)).await.unwrap();

    assert_eq!(report.completed, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.cursor, Cursor::Completed(2));
    assert_eq!(sorted_keys(dir.path()), vec!["A1", "A2", "A3"]);
}

#[tokio::test]
async fn test_skip_known_keys() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    create_test_merger(dir.path())
        .merge(vec![Record::from_pairs([("id", "B1"), ("name", "Known")])])
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/dp/B1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(&[("B1", "x")])))
        .expect(0)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dp/B2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(&[("B2", "New")])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let units = vec![
        WorkUnit::new(0, format!("{}/dp/B1", mock_server.uri())).with_key("B1"),
        WorkUnit::new(1, format!("{}/dp/B2", mock_server.uri())).with_key("B2"),
    ];

    let mut pipeline = create_test_pipeline(dir.path(), Arc::new(MetricsRegistry::new(10)))
        .with_skip_known_keys(true);
    let report = pipeline.run(units).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(report.cursor, Cursor::Completed(1));
    assert_eq!(sorted_keys(dir.path()), vec!["B1", "B2"]);
}

#[tokio::test]
async fn test_cancelled_run_dispatches_nothing() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    mount_page(&mock_server, 0, &[("A1", "Lamp")], 0).await;

    let mut pipeline = create_test_pipeline(dir.path(), Arc::new(MetricsRegistry::new(10)));
    pipeline.cancellation_token().cancel();

    let report = pipeline.run(page_units(&mock_server, 1)).await.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.completed, 0);
    assert_eq!(report.cursor, Cursor::Start);
    assert!(!checkpoint_path(dir.path()).exists());
}

#[tokio::test]
async fn test_corrupt_checkpoint_aborts_run() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    std::fs::write(checkpoint_path(dir.path()), "{\"cursor\": 4, \"updat").unwrap();
    mount_page(&mock_server, 0, &[("A1", "Lamp")], 0).await;

    let mut pipeline = create_test_pipeline(dir.path(), Arc::new(MetricsRegistry::new(10)));
    let result = pipeline.run(page_units(&mock_server, 1)).await;

    assert!(matches!(
        result,
        Err(IngestError::Checkpoint(CheckpointError::Corrupt { .. }))
    ));
    assert!(!dataset_path(dir.path()).exists());
}

#[tokio::test]
async fn test_corrupt_sqlite_dataset_aborts_run() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let db_path = dir.path().join("data.db");
    std::fs::write(&db_path, vec![b'Z'; 4096]).unwrap();
    mount_page(&mock_server, 0, &[("A1", "Lamp")], 1).await;

    let merger = IncrementalMerger::new(Box::new(SqliteStore::new(&db_path, "id")), "id");
    let metrics = Arc::new(MetricsRegistry::new(10));
    let mut pipeline = create_test_pipeline_with(dir.path(), merger, metrics.clone());
    let result = pipeline.run(page_units(&mock_server, 1)).await;

    // A damaged dataset stops the run instead of counting as a failed unit
    assert!(
        matches!(result, Err(IngestError::Dataset(DatasetError::Corrupt { .. }))),
        "{:?}",
        result
    );
    assert_eq!(metrics.counter("units.failed"), 0);
    assert!(!checkpoint_path(dir.path()).exists());
    assert_eq!(std::fs::read(&db_path).unwrap(), vec![b'Z'; 4096]);
}
