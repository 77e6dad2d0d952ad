//! Archive creation on the directory-backed store

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::{Cursor, Read};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tarstitch_formats::PartLimits;
use tarstitch_store::{
    ArchiveRequest, AssemblyConfig, FsStore, ObjectRef, ObjectStore, create_archive,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_source(root: &std::path::Path, key: &str, data: &[u8]) {
    let path = root.join("src").join(key);
    std::fs::create_dir_all(path.parent().expect("key has a parent")).expect("mkdir");
    std::fs::write(path, data).expect("write source");
}

#[tokio::test]
async fn test_archive_on_disk() {
    let dir = TempDir::new().expect("tempdir");
    let sources: Vec<(String, Vec<u8>)> = vec![
        ("photos/2024/a.jpg".to_string(), vec![1u8; 3000]),
        ("photos/2024/b.jpg".to_string(), (0..20_000u32).map(|i| (i % 7) as u8).collect()),
        ("photos/readme.txt".to_string(), b"holiday".to_vec()),
    ];
    for (key, data) in &sources {
        write_source(dir.path(), key, data);
    }
    std::fs::create_dir_all(dir.path().join("src/photos/empty-dir")).expect("mkdir");

    let store = Arc::new(FsStore::new(dir.path()));
    let config = AssemblyConfig::default()
        .with_threads(3)
        .with_part_limits(PartLimits::new(1024, 8192, 1000));
    let request = ArchiveRequest::new(
        ObjectRef::new("src", "photos/"),
        ObjectRef::new("dest", "backups/photos.tar"),
    )
    .with_delete_source(true);

    let report = create_archive(store.clone(), &config, &request, &CancellationToken::new())
        .await
        .expect("archive should be created");
    assert_eq!(report.entries, 3);
    assert_eq!(report.deleted, 3);
    assert!(report.archive.copied_parts > 0);

    let archive = std::fs::read(dir.path().join("dest/backups/photos.tar")).expect("read archive");
    assert_eq!(archive.len() as u64, report.archive.size);

    let mut reader = tar::Archive::new(Cursor::new(&archive[..]));
    reader.set_ignore_zeros(true);
    let mut members = Vec::new();
    for entry in reader.entries().expect("entries should open") {
        let mut entry = entry.expect("member should parse");
        let name = entry.path().expect("path").to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).expect("read member");
        members.push((name, data));
    }
    assert_eq!(members[0].0, "manifest.csv");
    assert_eq!(&members[1..], &sources[..]);

    // Sources are gone, the empty directory marker is left alone
    let remaining = store.list_objects("src", "").await.expect("list");
    let keys: Vec<_> = remaining.iter().map(|object| object.key.as_str()).collect();
    assert_eq!(keys, vec!["photos/empty-dir/"]);
    let pending = store.list_multipart_uploads("dest", "").await;
    assert!(pending.expect("list").is_empty());
}
