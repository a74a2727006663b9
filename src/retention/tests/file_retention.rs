use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use common::CatalogHandle;
use common::model::{ProcessOrigin, ProducingProcess, StatusLog, StorageDefinition};
use common::testing::InMemoryCatalog;
use retention::testing::InMemoryDatasetConnector;
use retention::{NO_DATA, RetentionRunner};
use serde_json::json;

const SERIES: i32 = 12;
const BACKUP_PROVIDER: i32 = 5;

fn storage(backup: bool, zip: bool) -> StorageDefinition {
    serde_json::from_value(json!({
        "id": 4,
        "name": "grid retention",
        "data_series_id": SERIES,
        "data_provider_id": BACKUP_PROVIDER,
        "service_instance_id": 2,
        "keep_data": 1,
        "keep_data_unit": "d",
        "backup": backup,
        "zip": zip,
        "active": true,
        "uri": "/archive"
    }))
    .unwrap()
}

fn catalog(source: &Path, destination: &Path) -> InMemoryCatalog {
    InMemoryCatalog::new()
        .with_semantics(SERIES, "GRID-geotiff")
        .with_grid_source(
            SERIES,
            &format!("file://{}", source.display()),
            "grid/prec_%YYYY%MM%DD.tif",
        )
        .with_provider(BACKUP_PROVIDER, &format!("file://{}", destination.display()))
}

fn runner(catalog: &InMemoryCatalog) -> RetentionRunner {
    let handle = CatalogHandle::new(Some(Arc::new(catalog.clone())));
    RetentionRunner::new(Arc::new(handle), Arc::new(InMemoryDatasetConnector::new()))
}

async fn seed(dir: &Path, names: &[String]) {
    tokio::fs::create_dir_all(dir).await.unwrap();
    for name in names {
        tokio::fs::write(dir.join(name), name.as_bytes()).await.unwrap();
    }
}

async fn list(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return names;
    };
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().into_string().unwrap());
    }
    names.sort();
    names
}

fn old_files() -> Vec<String> {
    vec![
        "prec_20200101.tif".to_string(),
        "prec_20200102.tif".to_string(),
        "prec_20200103.tif".to_string(),
    ]
}

#[tokio::test]
async fn test_backup_moves_old_files() {
    let source = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    seed(&source.path().join("grid"), &old_files()).await;

    let catalog = catalog(source.path(), destination.path());
    let report = runner(&catalog).run(&storage(true, false)).await;

    assert!(report.result, "{}", report.description);
    assert!(report.description.starts_with("moved files: 3"));
    assert_eq!(
        report.data_timestamp,
        Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap())
    );
    assert!(list(&source.path().join("grid")).await.is_empty());
    assert_eq!(
        list(&destination.path().join("archive").join("grid")).await,
        old_files()
    );

    let logs = catalog.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].service_instance_id, 2);
    assert_eq!(logs[0].entry.process_id, 4);
    assert_eq!(logs[0].entry.status, StatusLog::Done);
    assert!(logs[0].messages.is_empty());
}

#[tokio::test]
async fn test_zip_backup_writes_one_archive() {
    let source = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    seed(&source.path().join("grid"), &old_files()).await;

    let catalog = catalog(source.path(), destination.path());
    let report = runner(&catalog).run(&storage(true, true)).await;

    assert!(report.result, "{}", report.description);
    assert!(list(&source.path().join("grid")).await.is_empty());

    let archived = list(&destination.path().join("archive").join("grid")).await;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0], Utc::now().format("%Y%m%d.zip").to_string());

    let bytes = std::fs::read(
        destination
            .path()
            .join("archive")
            .join("grid")
            .join(&archived[0]),
    )
    .unwrap();
    let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    assert_eq!(archive.len(), 3);
}

#[tokio::test]
async fn test_second_zip_run_appends_to_archive() {
    let source = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    let grid = source.path().join("grid");
    let catalog = catalog(source.path(), destination.path());
    let runner = runner(&catalog);

    seed(&grid, &["prec_20200101.tif".to_string()]).await;
    let first = runner.run(&storage(true, true)).await;
    assert!(first.result, "{}", first.description);

    seed(&grid, &["prec_20200102.tif".to_string()]).await;
    let second = runner.run(&storage(true, true)).await;
    assert!(second.result, "{}", second.description);
    assert!(list(&grid).await.is_empty());

    let backup = destination.path().join("archive").join("grid");
    let archived = list(&backup).await;
    assert_eq!(archived.len(), 1, "{archived:?}");

    let bytes = std::fs::read(backup.join(&archived[0])).unwrap();
    let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    let mut entries: Vec<String> = archive.file_names().map(str::to_string).collect();
    entries.sort();
    assert_eq!(entries, vec!["prec_20200101.tif", "prec_20200102.tif"]);
}

#[tokio::test]
async fn test_removal_keeps_recent_files() {
    let source = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    let recent = Utc::now().format("prec_%Y%m%d.tif").to_string();
    let mut names = old_files();
    names.push(recent.clone());
    names.push("readme.txt".to_string());
    seed(&source.path().join("grid"), &names).await;

    let catalog = catalog(source.path(), destination.path());
    let report = runner(&catalog).run(&storage(false, false)).await;

    assert!(report.result, "{}", report.description);
    assert!(report.description.starts_with("removed files: 3"));
    assert_eq!(
        list(&source.path().join("grid")).await,
        vec![recent, "readme.txt".to_string()]
    );
    assert!(list(destination.path()).await.is_empty());
}

#[tokio::test]
async fn test_nothing_eligible_is_logged_with_message() {
    let source = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    tokio::fs::create_dir_all(source.path().join("grid")).await.unwrap();

    let catalog = catalog(source.path(), destination.path());
    let report = runner(&catalog).run(&storage(true, false)).await;

    assert!(report.result);
    assert_eq!(report.status, StatusLog::Done);
    assert_eq!(report.description, NO_DATA);

    let logs = catalog.logs();
    assert_eq!(logs[0].messages.len(), 1);
    assert_eq!(logs[0].messages[0].description, NO_DATA);
}

#[tokio::test]
async fn test_unknown_series_type_fails_the_run() {
    let source = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    let catalog = catalog(source.path(), destination.path()).with_semantics(SERIES, "GRID-gdal");

    let report = runner(&catalog).run(&storage(false, false)).await;

    assert!(!report.result);
    assert_eq!(report.status, StatusLog::Error);
    assert_eq!(report.description, "Invalid data series type: GRID-gdal");

    let logs = catalog.logs();
    assert_eq!(logs[0].entry.status, StatusLog::Error);
    assert_eq!(logs[0].messages[0].description, report.description);
}

#[tokio::test]
async fn test_erase_all_with_filter_archives_history() {
    let source = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    let recent = Utc::now().format("prec_%Y%m%d.tif").to_string();
    seed(&source.path().join("grid"), &[recent]).await;

    let producer = ProducingProcess {
        origin: ProcessOrigin::Collector,
        process_id: 30,
        service_instance_id: 1,
    };
    let catalog = catalog(source.path(), destination.path())
        .with_producer(SERIES, producer.clone())
        .with_producer_logs(30, 4, 0);

    let mut storage = storage(false, false);
    storage.keep_data = 0;
    storage.filter = true;

    let report = runner(&catalog).run(&storage).await;

    assert!(report.result, "{}", report.description);
    assert!(list(&source.path().join("grid")).await.is_empty());

    let historics = catalog.historics();
    assert_eq!(historics.len(), 1);
    assert_eq!(historics[0].0, 4);
    assert_eq!(historics[0].1, producer);
    assert_eq!(historics[0].2.archived, 4);
    assert_eq!(catalog.producer_logs(30), None);
}

#[tokio::test]
async fn test_series_kind_is_resolved_once() {
    let source = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    tokio::fs::create_dir_all(source.path().join("grid")).await.unwrap();

    let catalog = catalog(source.path(), destination.path());
    let runner = runner(&catalog);
    runner.run(&storage(false, false)).await;
    runner.run(&storage(false, false)).await;

    assert_eq!(catalog.semantics_lookups(), 1);
    assert_eq!(catalog.logs().len(), 2);
}
