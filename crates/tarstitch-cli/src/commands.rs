//! Subcommand implementations

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tarstitch_formats::{ArchiveLayoutEngine, ManifestObject};
use tarstitch_store::{
    ArchiveRequest, FsStore, abort_all_uploads, create_archive, list_entries, parse_store_url,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::{CreateArgs, LayoutArgs, PartsArgs, SweepArgs};

pub async fn create(
    store: Arc<FsStore>,
    args: &CreateArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let (source, destination) = args.source_and_destination()?;
    let config = args.config()?;
    let request = ArchiveRequest {
        source,
        destination,
        manifest: args.manifest.options(),
        delete_source: args.delete_source,
    };

    let report = create_archive(store, &config, &request, cancel)
        .await
        .with_context(|| {
            format!(
                "creating {} from {}",
                request.destination, request.source
            )
        })?;

    let ManifestObject {
        name,
        size,
        checksum,
        ..
    } = &report.archive.manifest;
    println!("archive:    {}", report.archive.destination);
    println!("size:       {} bytes", report.archive.size);
    println!("etag:       {}", report.archive.etag);
    println!("entries:    {}", report.entries);
    println!(
        "parts:      {} ({} server-side copies)",
        report.archive.parts, report.archive.copied_parts
    );
    println!("manifest:   {name} ({size} bytes, md5 {checksum})");
    if args.delete_source {
        println!("deleted:    {}", report.deleted);
    }
    Ok(())
}

pub async fn layout(store: Arc<FsStore>, args: &LayoutArgs) -> Result<()> {
    let source = parse_store_url(&args.source)?;
    let entries = list_entries(store.as_ref(), &source.bucket, &source.key).await?;
    if entries.is_empty() {
        bail!("no objects found under {}", args.source);
    }

    let layout = ArchiveLayoutEngine::new()
        .with_options(args.manifest.options())
        .layout(&entries)?;
    info!(
        "{} entries, manifest span {} bytes, archive {} bytes, {} iterations",
        entries.len(),
        layout.manifest_span(),
        layout.total_len(),
        layout.iterations()
    );

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(layout.manifest().body())?;
    stdout.flush()?;
    Ok(())
}

pub fn parts(args: &PartsArgs) -> Result<()> {
    let range = args.parts.limits().solve_unsigned(args.size)?;
    let chosen = range.chosen(args.parts.split_strategy);
    println!("size:       {} bytes", args.size);
    println!("min parts:  {}", range.min_parts);
    println!("max parts:  {}", range.max_parts);
    println!("midpoint:   {}", range.midpoint);
    println!(
        "chosen:     {} (~{} bytes each)",
        chosen,
        args.size.div_ceil(chosen)
    );
    Ok(())
}

pub async fn sweep(store: Arc<FsStore>, args: &SweepArgs) -> Result<()> {
    let location = parse_store_url(&args.location)?;
    let aborted = abort_all_uploads(store.as_ref(), &location.bucket, &location.key).await?;
    println!("aborted {aborted} uploads under {}", args.location);
    Ok(())
}
