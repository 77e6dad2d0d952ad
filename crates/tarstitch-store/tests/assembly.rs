//! Archive assembly against the in-memory store

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tarstitch_formats::{
    ArchiveLayoutEngine, ManifestOptions, ManifestReader, PartLimits, SplitStrategy,
};
use tarstitch_store::{
    ArchiveAssembler, ArchiveReport, ArchiveRequest, AssemblyConfig, DriftCheck, MemoryStore,
    ObjectRef, ObjectStore, RetryPolicy, StoreError, StoreResult, create_archive, list_entries,
};
use tokio_util::sync::CancellationToken;

const LIMITS: PartLimits = PartLimits::new(1024, 64 * 1024, 10_000);

fn object_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
        jitter: false,
    }
}

fn config() -> AssemblyConfig {
    AssemblyConfig::default()
        .with_threads(4)
        .with_part_limits(LIMITS)
        .with_retry_policy(fast_retries())
}

async fn create(store: &Arc<MemoryStore>, request: &ArchiveRequest) -> StoreResult<ArchiveReport> {
    let cancel = CancellationToken::new();
    create_archive(store.clone(), &config(), request, &cancel).await
}

/// Store with a mix of small, empty, directory-marker and large sources
fn seeded_store() -> (Arc<MemoryStore>, Vec<(String, Vec<u8>)>) {
    let store = Arc::new(MemoryStore::with_limits(LIMITS));
    let long_name = format!("logs/{}/deep.log", "nested".repeat(20));
    let objects = vec![
        ("logs/a.log".to_string(), object_bytes(1, 100)),
        ("logs/empty.log".to_string(), Vec::new()),
        ("logs/big.bin".to_string(), object_bytes(2, 300_000)),
        ("logs/quoted, \"name\".txt".to_string(), object_bytes(3, 700)),
        (long_name, object_bytes(4, 5_000)),
    ];
    store.insert("src", "logs/", Vec::new());
    store.insert("src", "logs/sub/", Vec::new());
    for (key, data) in &objects {
        store.insert("src", key, data.clone());
    }
    // Listing order is key order
    let mut expected = objects;
    expected.sort_by(|a, b| a.0.cmp(&b.0));
    (store, expected)
}

/// All members of a tar stream, manifest included
fn read_members(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut reader = tar::Archive::new(Cursor::new(archive));
    reader.set_ignore_zeros(true);
    reader
        .entries()
        .expect("entries should open")
        .map(|entry| {
            let mut entry = entry.expect("member should parse");
            let name = entry
                .path()
                .expect("path should decode")
                .to_string_lossy()
                .into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).expect("data should read");
            (name, data)
        })
        .collect()
}

fn member_name_at(archive: &[u8], offset: u64) -> String {
    let mut reader = tar::Archive::new(Cursor::new(&archive[offset as usize..]));
    let entry = reader
        .entries()
        .expect("entries should open")
        .next()
        .expect("a member should start here")
        .expect("member should parse");
    entry
        .path()
        .expect("path should decode")
        .to_string_lossy()
        .into_owned()
}

#[tokio::test]
async fn test_archive_round_trip() {
    let (store, expected) = seeded_store();
    let request = ArchiveRequest::new(
        ObjectRef::new("src", "logs/"),
        ObjectRef::new("dest", "archive.tar"),
    )
    .with_manifest(ManifestOptions::default().with_header_row(true));

    let report = create(&store, &request)
        .await
        .expect("archive should be created");

    assert_eq!(report.entries, expected.len());
    assert_eq!(report.deleted, 0);
    assert!(report.archive.copied_parts > 0);
    assert_eq!(store.pending_uploads(), 0);

    let archive = store.get("dest", "archive.tar").expect("archive");
    assert_eq!(archive.len() as u64, report.archive.size);
    assert_eq!(archive.len() % 512, 0);

    let members = read_members(&archive);
    assert_eq!(members.len(), expected.len() + 1);
    let (manifest_name, manifest_body) = &members[0];
    assert_eq!(manifest_name, "manifest.csv");
    assert_eq!(&members[1..], &expected[..]);

    assert_eq!(report.archive.manifest.size, manifest_body.len() as u64);
    assert_eq!(
        report.archive.manifest.checksum,
        hex::encode(md5::compute(manifest_body).0)
    );

    let records = ManifestReader::from_bytes(manifest_body)
        .read_records()
        .expect("manifest should parse");
    assert_eq!(records.len(), expected.len());
    for (record, (key, data)) in records.iter().zip(&expected) {
        assert_eq!(&record.name, key);
        assert_eq!(record.size, data.len() as u64);
        assert_eq!(record.checksum, hex::encode(md5::compute(data).0));
        assert_eq!(&member_name_at(&archive, record.offset), key);
    }
}

#[tokio::test]
async fn test_split_strategies_produce_identical_archives() {
    let (store, _) = seeded_store();
    let source = ObjectRef::new("src", "logs/");

    let mut archives = Vec::new();
    let mut parts = Vec::new();
    let strategies = [
        ("mid.tar", SplitStrategy::Midpoint),
        ("min.tar", SplitStrategy::Minimum),
    ];
    for (key, strategy) in strategies {
        let request = ArchiveRequest::new(source.clone(), ObjectRef::new("dest", key));
        let report = create_archive(
            store.clone(),
            &config().with_split_strategy(strategy),
            &request,
            &CancellationToken::new(),
        )
        .await
        .expect("archive should be created");
        archives.push(store.get("dest", key).expect("archive"));
        parts.push(report.archive.parts);
    }

    assert_eq!(archives[0], archives[1]);
    assert!(parts[0] > parts[1]);
}

#[tokio::test]
async fn test_destination_inside_source_is_skipped() {
    let (store, expected) = seeded_store();
    store.insert("src", "logs/zz-archive.tar", object_bytes(9, 2048));
    let request = ArchiveRequest::new(
        ObjectRef::new("src", "logs/"),
        ObjectRef::new("src", "logs/zz-archive.tar"),
    );

    let report = create(&store, &request)
        .await
        .expect("archive should be created");
    assert_eq!(report.entries, expected.len());

    let archive = store.get("src", "logs/zz-archive.tar").expect("archive");
    let names: Vec<_> = read_members(&archive)
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert!(!names.iter().any(|name| name == "logs/zz-archive.tar"));
}

#[tokio::test]
async fn test_delete_source_after_archive() {
    let (store, expected) = seeded_store();
    let request = ArchiveRequest::new(
        ObjectRef::new("src", "logs/"),
        ObjectRef::new("dest", "archive.tar"),
    )
    .with_delete_source(true);

    let report = create(&store, &request)
        .await
        .expect("archive should be created");

    assert_eq!(report.deleted, expected.len());
    // Directory markers are not archived and stay behind
    assert_eq!(store.keys("src"), vec!["logs/", "logs/sub/"]);
    assert!(store.get("dest", "archive.tar").is_some());
}

#[tokio::test]
async fn test_empty_source() {
    let store = Arc::new(MemoryStore::with_limits(LIMITS));
    store.insert("src", "only/", Vec::new());
    let request = ArchiveRequest::new(
        ObjectRef::new("src", "only/"),
        ObjectRef::new("dest", "archive.tar"),
    );

    let err = create(&store, &request)
        .await
        .expect_err("nothing to archive");
    assert!(matches!(err, StoreError::EmptySource { .. }));
    assert_eq!(store.pending_uploads(), 0);
}

#[tokio::test]
async fn test_invalid_config_rejected_before_store_calls() {
    let (store, _) = seeded_store();
    let request = ArchiveRequest::new(
        ObjectRef::new("src", "logs/"),
        ObjectRef::new("dest", "archive.tar"),
    );

    let err = create_archive(
        store.clone(),
        &config().with_threads(0),
        &request,
        &CancellationToken::new(),
    )
    .await
    .expect_err("zero threads must fail");
    assert!(err.is_configuration_error());
    assert_eq!(store.part_writes(), 0);
    assert_eq!(store.head_calls(), 0);
}

#[tokio::test]
async fn test_drift_aborts_upload() {
    let (store, _) = seeded_store();
    let entries = list_entries(store.as_ref(), "src", "logs/")
        .await
        .expect("listing should succeed");
    let layout = ArchiveLayoutEngine::new()
        .layout(&entries)
        .expect("layout should succeed");

    // Resized after layout
    store.insert("src", "logs/big.bin", object_bytes(2, 300_001));

    let assembler = ArchiveAssembler::new(store.clone(), config());
    let destination = ObjectRef::new("dest", "archive.tar");
    let err = assembler
        .assemble(&layout, &destination, &CancellationToken::new())
        .await
        .expect_err("drift must be detected");

    assert!(err.is_drift());
    let StoreError::Drift {
        key,
        expected_size,
        actual_size,
        ..
    } = err
    else {
        panic!("expected drift error");
    };
    assert_eq!(key, "logs/big.bin");
    assert_eq!((expected_size, actual_size), (300_000, 300_001));
    assert_eq!(store.pending_uploads(), 0);
    assert!(store.get("dest", "archive.tar").is_none());
}

#[tokio::test]
async fn test_drift_check_off_skips_head_requests() {
    let (store, _) = seeded_store();
    let request = ArchiveRequest::new(
        ObjectRef::new("src", "logs/"),
        ObjectRef::new("dest", "archive.tar"),
    );

    create_archive(
        store.clone(),
        &config().with_drift_check(DriftCheck::Off),
        &request,
        &CancellationToken::new(),
    )
    .await
    .expect("archive should be created");
    assert_eq!(store.head_calls(), 0);
}

#[tokio::test]
async fn test_permanent_part_failure_aborts_upload() {
    let (store, _) = seeded_store();
    store.fail_part_writes(1, false);
    let request = ArchiveRequest::new(
        ObjectRef::new("src", "logs/"),
        ObjectRef::new("dest", "archive.tar"),
    );

    let err = create(&store, &request)
        .await
        .expect_err("permanent failure must surface");

    assert!(matches!(err, StoreError::Backend { .. }));
    assert!(!err.should_retry());
    assert_eq!(store.pending_uploads(), 0);
    assert!(store.get("dest", "archive.tar").is_none());
}

#[tokio::test]
async fn test_transient_part_failures_are_retried() {
    let (store, _) = seeded_store();
    store.fail_part_writes(2, true);
    let request = ArchiveRequest::new(
        ObjectRef::new("src", "logs/"),
        ObjectRef::new("dest", "archive.tar"),
    );

    let report = create_archive(
        store.clone(),
        &config().with_threads(1),
        &request,
        &CancellationToken::new(),
    )
    .await
    .expect("retries should recover");

    assert_eq!(store.part_writes(), report.archive.parts + 2);
    assert!(store.get("dest", "archive.tar").is_some());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let (store, _) = seeded_store();
    let request = ArchiveRequest::new(
        ObjectRef::new("src", "logs/"),
        ObjectRef::new("dest", "archive.tar"),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = create_archive(store.clone(), &config(), &request, &cancel)
        .await
        .expect_err("cancelled run must fail");
    assert!(matches!(err, StoreError::Cancelled));
    assert_eq!(store.pending_uploads(), 0);
    assert_eq!(store.part_writes(), 0);
}

#[tokio::test]
async fn test_store_limits_enforced_on_completion() {
    // The store rejects parts below its minimum even if the planner was told otherwise
    let limits = PartLimits::new(4096, 64 * 1024, 10_000);
    let store = Arc::new(MemoryStore::with_limits(limits));
    for index in 0..4 {
        store.insert("src", &format!("f{index}"), object_bytes(index, 3000));
    }
    let request = ArchiveRequest::new(ObjectRef::new("src", "f"), ObjectRef::new("dest", "a.tar"));

    let err = create(&store, &request)
        .await
        .expect_err("undersized parts must be rejected");
    assert!(matches!(
        err,
        StoreError::Rejected {
            operation: "complete_multipart_upload",
            ..
        }
    ));
    assert_eq!(store.pending_uploads(), 0);
    let written = store.list_objects("dest", "").await.expect("list");
    assert!(written.is_empty());
}
