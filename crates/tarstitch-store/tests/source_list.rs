//! Archives built from an explicit source list instead of a prefix listing

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::{Cursor, Read};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tarstitch_formats::PartLimits;
use tarstitch_store::{
    ArchiveReport, ArchiveRequest, AssemblyConfig, MemoryStore, ObjectRef, RetryPolicy,
    StoreError, StoreResult, create_archive, manifest_entries,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const LIMITS: PartLimits = PartLimits::new(1024, 64 * 1024, 10_000);

fn config() -> AssemblyConfig {
    AssemblyConfig::default()
        .with_threads(2)
        .with_part_limits(LIMITS)
        .with_retry_policy(RetryPolicy::none())
}

async fn create(store: &Arc<MemoryStore>, request: &ArchiveRequest) -> StoreResult<ArchiveReport> {
    let cancel = CancellationToken::new();
    create_archive(store.clone(), &config(), request, &cancel).await
}

fn member_names_and_data(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut reader = tar::Archive::new(Cursor::new(archive));
    reader.set_ignore_zeros(true);
    let mut members = Vec::new();
    for entry in reader.entries().expect("entries should open") {
        let mut entry = entry.expect("member should parse");
        let name = entry.path().expect("path").to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).expect("read member");
        members.push((name, data));
    }
    members
}

/// Objects spread over two buckets plus a list naming them out of key order
fn seeded() -> (Arc<MemoryStore>, String, Vec<(String, Vec<u8>)>) {
    let store = Arc::new(MemoryStore::with_limits(LIMITS));
    let objects = vec![
        ("src", "reports/z.csv", vec![b'z'; 4000]),
        ("media", "clips/a, b.mp4", vec![b'a'; 90_000]),
        ("src", "reports/empty.csv", Vec::new()),
    ];

    let mut list = String::from("bucket,key,size,etag\n");
    let mut expected = Vec::new();
    for (bucket, key, data) in objects {
        let etag = store.insert(bucket, key, data.clone());
        let quoted = format!("\"{}\"", key.replace('"', "\"\""));
        list.push_str(&format!("{bucket},{quoted},{},{etag}\n", data.len()));
        expected.push((key.to_string(), data));
    }
    // Not named by the list, so never archived
    store.insert("src", "reports/other.csv", vec![b'o'; 10]);
    (store, list, expected)
}

#[tokio::test]
async fn test_archive_from_list_in_store() {
    let (store, list, expected) = seeded();
    store.insert("lists", "batch.csv", list.into_bytes());

    let request = ArchiveRequest::from_source_list(
        "s3://lists/batch.csv",
        true,
        ObjectRef::new("dest", "batch.tar"),
    )
    .with_delete_source(true);
    let report = create(&store, &request)
        .await
        .expect("archive should be created");

    assert_eq!(report.entries, 3);
    assert_eq!(report.deleted, 3);

    let archive = store.get("dest", "batch.tar").expect("archive");
    let members = member_names_and_data(&archive);
    assert_eq!(members[0].0, "manifest.csv");
    // List order, not key order
    assert_eq!(&members[1..], &expected[..]);

    assert_eq!(store.keys("src"), vec!["reports/other.csv".to_string()]);
    assert!(store.keys("media").is_empty());
    assert_eq!(store.keys("lists"), vec!["batch.csv".to_string()]);
}

#[tokio::test]
async fn test_archive_from_local_list() {
    let (store, list, expected) = seeded();
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("batch.csv");
    std::fs::write(&path, list).expect("write list");
    let location = path.to_string_lossy().into_owned();

    let entries = manifest_entries(store.as_ref(), &location, false)
        .await
        .expect("list should load");
    let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["reports/z.csv", "clips/a, b.mp4", "reports/empty.csv"]
    );

    let request =
        ArchiveRequest::from_source_list(location, false, ObjectRef::new("dest", "local.tar"));
    create(&store, &request)
        .await
        .expect("archive should be created");

    let archive = store.get("dest", "local.tar").expect("archive");
    assert_eq!(&member_names_and_data(&archive)[1..], &expected[..]);
    assert_eq!(store.keys("src").len(), 3);
}

#[tokio::test]
async fn test_stale_list_is_drift() {
    let store = Arc::new(MemoryStore::with_limits(LIMITS));
    let etag = store.insert("src", "data.bin", vec![7u8; 5000]);
    // Size recorded before the object grew
    store.insert("lists", "stale.csv", format!("src,data.bin,4000,{etag}\n"));

    let request = ArchiveRequest::from_source_list(
        "s3://lists/stale.csv",
        false,
        ObjectRef::new("dest", "stale.tar"),
    );
    let err = create(&store, &request)
        .await
        .expect_err("recorded size no longer matches");
    assert!(err.is_drift(), "unexpected error: {err}");
    assert_eq!(store.pending_uploads(), 0);
    assert!(store.get("dest", "stale.tar").is_none());
}

#[tokio::test]
async fn test_missing_or_empty_list() {
    let store = Arc::new(MemoryStore::with_limits(LIMITS));

    let missing = ArchiveRequest::from_source_list(
        "s3://lists/missing.csv",
        false,
        ObjectRef::new("dest", "out.tar"),
    );
    let err = create(&store, &missing)
        .await
        .expect_err("list does not exist");
    assert!(err.is_not_found(), "unexpected error: {err}");

    store.insert("lists", "header-only.csv", &b"bucket,key,size,etag\n"[..]);
    let empty = ArchiveRequest::from_source_list(
        "s3://lists/header-only.csv",
        false,
        ObjectRef::new("dest", "out.tar"),
    );
    let err = create(&store, &empty).await.expect_err("header only");
    assert!(matches!(err, StoreError::EmptySource { .. }));

    let local = ArchiveRequest::from_source_list(
        "/nonexistent/tarstitch/list.csv",
        false,
        ObjectRef::new("dest", "out.tar"),
    );
    let err = create(&store, &local)
        .await
        .expect_err("local list does not exist");
    assert!(matches!(err, StoreError::Io(_)));
}
