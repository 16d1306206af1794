use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tidemark::checkpoint::{CheckpointStore, Cursor};
use tidemark::config::CorruptionPolicy;
use tidemark::dataset::{
    CsvStore, DatasetError, DatasetLock, IncrementalMerger, Record, SqliteStore,
};

fn batch(writer: usize, size: usize) -> Vec<Record> {
    (0..size)
        .map(|i| {
            Record::from_pairs([
                ("id".to_string(), format!("w{}-{:03}", writer, i)),
                ("title".to_string(), format!("Item {} from writer {}", i, writer)),
            ])
        })
        .collect()
}

#[test]
fn test_concurrent_csv_merges_keep_every_row() {
    let dir = TempDir::new().unwrap();
    let path = Arc::new(dir.path().join("items.csv"));

    let handles: Vec<_> = (0..4)
        .map(|writer| {
            let path = path.clone();
            thread::spawn(move || {
                // Each writer has its own merger, as separate processes would
                let merger = IncrementalMerger::new(Box::new(CsvStore::new(path.as_path())), "id");
                for chunk in batch(writer, 20).chunks(5) {
                    merger.merge(chunk.to_vec()).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let merger = IncrementalMerger::new(Box::new(CsvStore::new(path.as_path())), "id");
    let dataset = merger.load().unwrap();
    assert_eq!(dataset.len(), 80);
    assert_eq!(merger.known_keys().unwrap().len(), 80);
    assert_eq!(dataset.columns[0], "id");
}

#[test]
fn test_concurrent_sqlite_merges_on_shared_keys() {
    let dir = TempDir::new().unwrap();
    let path = Arc::new(dir.path().join("items.db"));

    let handles: Vec<_> = (0..3)
        .map(|writer| {
            let path = path.clone();
            thread::spawn(move || {
                let merger = IncrementalMerger::new(
                    Box::new(SqliteStore::new(path.as_path(), "id")),
                    "id",
                )
                .with_tie_break("version");

                for version in 0..5 {
                    let records = (0..10)
                        .map(|i| {
                            Record::from_pairs([
                                ("id".to_string(), format!("shared-{}", i)),
                                ("version".to_string(), (version * 10 + writer).to_string()),
                            ])
                        })
                        .collect();
                    merger.merge(records).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let dataset = IncrementalMerger::new(Box::new(SqliteStore::new(path.as_path(), "id")), "id")
        .load()
        .unwrap();

    // Ten keys, each holding the highest version any writer produced
    assert_eq!(dataset.len(), 10);
    assert!(dataset.rows.iter().all(|row| row.get("version") == Some("42")));
}

#[test]
fn test_merge_times_out_while_lock_is_held() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("items.csv");

    let _held = DatasetLock::acquire(&path, None).unwrap();

    let merger = IncrementalMerger::new(Box::new(CsvStore::new(path.clone())), "id")
        .with_lock_timeout(Duration::from_millis(100));
    let result = merger.merge(batch(0, 1));

    assert!(matches!(result, Err(DatasetError::LockTimeout { .. })));
    assert!(!path.exists());
}

#[test]
fn test_checkpoint_survives_reopen_after_many_advances() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state").join("checkpoint.json");

    {
        let mut store = CheckpointStore::new(&path, CorruptionPolicy::Fail);
        assert_eq!(store.load().unwrap(), Cursor::Start);
        for completed in 0..50 {
            store.advance(completed).unwrap();
        }
    }

    // No temporary files are left next to the checkpoint
    let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("checkpoint.json")]);

    let mut reopened = CheckpointStore::new(&path, CorruptionPolicy::Fail);
    assert_eq!(reopened.load().unwrap(), Cursor::Completed(49));
    assert_eq!(reopened.cursor().next_unit(), 50);
}
