//! End-to-end archive creation: list, lay out, assemble, clean up

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use tarstitch_formats::{ArchiveLayoutEngine, ManifestOptions};

use crate::assemble::{ArchiveAssembler, AssembledArchive};
use crate::config::AssemblyConfig;
use crate::delete::delete_entries;
use crate::error::{StoreError, StoreResult};
use crate::listing::{list_entries, manifest_entries};
use crate::traits::ObjectStore;
use crate::types::ObjectRef;

/// Where the objects to archive come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSet {
    /// Every object under a bucket and key prefix
    Prefix(ObjectRef),
    /// Objects named by a source list, read from a local path or a store URL
    Manifest {
        /// Local path or `scheme://bucket/key`
        location: String,
        /// Drop the first row of the list
        skip_header: bool,
    },
}

impl std::fmt::Display for SourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prefix(prefix) => write!(f, "{prefix}"),
            Self::Manifest { location, .. } => write!(f, "source list {location}"),
        }
    }
}

/// What to archive and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    /// Objects to archive
    pub source: SourceSet,
    /// Destination object
    pub destination: ObjectRef,
    /// Manifest member settings
    pub manifest: ManifestOptions,
    /// Delete the archived sources after the archive is complete
    pub delete_source: bool,
}

impl ArchiveRequest {
    /// Archive everything under `source` into `destination`
    pub fn new(source: ObjectRef, destination: ObjectRef) -> Self {
        Self {
            source: SourceSet::Prefix(source),
            destination,
            manifest: ManifestOptions::default(),
            delete_source: false,
        }
    }

    /// Archive the objects named by the source list at `location`
    pub fn from_source_list(
        location: impl Into<String>,
        skip_header: bool,
        destination: ObjectRef,
    ) -> Self {
        Self {
            source: SourceSet::Manifest {
                location: location.into(),
                skip_header,
            },
            destination,
            manifest: ManifestOptions::default(),
            delete_source: false,
        }
    }

    /// Set the manifest options
    #[must_use]
    pub fn with_manifest(mut self, manifest: ManifestOptions) -> Self {
        self.manifest = manifest;
        self
    }

    /// Remove the sources once the archive is written
    #[must_use]
    pub fn with_delete_source(mut self, delete_source: bool) -> Self {
        self.delete_source = delete_source;
        self
    }
}

/// Summary of a finished archive run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    /// The written archive
    pub archive: AssembledArchive,
    /// Members archived, manifest excluded
    pub entries: usize,
    /// Sources deleted afterwards
    pub deleted: usize,
    /// Rounds the manifest fixed point needed
    pub iterations: usize,
}

/// Archive every object of the request's source set
///
/// The destination key is skipped if the source set contains it, so
/// re-running into the same location does not archive the previous output.
pub async fn create_archive(
    store: Arc<dyn ObjectStore>,
    config: &AssemblyConfig,
    request: &ArchiveRequest,
    cancel: &CancellationToken,
) -> StoreResult<ArchiveReport> {
    config.validate()?;

    let mut entries = match &request.source {
        SourceSet::Prefix(prefix) => {
            list_entries(store.as_ref(), &prefix.bucket, &prefix.key).await?
        }
        SourceSet::Manifest {
            location,
            skip_header,
        } => manifest_entries(store.as_ref(), location, *skip_header).await?,
    };
    let destination = &request.destination;
    entries.retain(|entry| {
        entry.object() != Some((destination.bucket.as_str(), destination.key.as_str()))
    });
    if entries.is_empty() {
        return Err(StoreError::EmptySource {
            source_set: request.source.to_string(),
        });
    }

    let layout = ArchiveLayoutEngine::new()
        .with_options(request.manifest.clone())
        .layout(&entries)?;
    info!(
        "Laid out {} entries in {} bytes after {} iterations",
        entries.len(),
        layout.total_len(),
        layout.iterations()
    );

    let assembler = ArchiveAssembler::new(Arc::clone(&store), config.clone());
    let archive = assembler.assemble(&layout, destination, cancel).await?;

    let deleted = if request.delete_source {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        delete_entries(store.as_ref(), &entries).await?
    } else {
        0
    };

    Ok(ArchiveReport {
        archive,
        entries: entries.len(),
        deleted,
        iterations: layout.iterations(),
    })
}
