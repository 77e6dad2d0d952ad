//! Concurrent multipart assembly of a laid-out archive
//!
//! Parts of an [`AssemblyPlan`] are fed through a bounded channel to a fixed
//! pool of workers. Each worker writes one part at a time and reports the
//! result on an acknowledgement channel. A ledger tracks acknowledgements
//! by part number; the destination is completed only when every planned
//! part has been acknowledged exactly once. Any failure aborts the whole
//! upload.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tarstitch_formats::{ArchiveLayout, ManifestObject, SourceFingerprint};

use crate::config::{AssemblyConfig, DriftCheck};
use crate::error::{StoreError, StoreResult};
use crate::plan::{AssemblyPlan, PartPiece, PartPlanner, PartSource, PlannedPart};
use crate::retry::RetryPolicy;
use crate::traits::ObjectStore;
use crate::types::{CompletedPart, ObjectRef};

type Ack = StoreResult<CompletedPart>;

/// Outcome of a completed assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledArchive {
    /// Where the archive was written
    pub destination: ObjectRef,
    /// Entity tag of the completed object
    pub etag: String,
    /// Archive size in bytes
    pub size: u64,
    /// Number of multipart parts
    pub parts: usize,
    /// Parts written by server-side copy
    pub copied_parts: usize,
    /// Description of the manifest member
    pub manifest: ManifestObject,
}

/// Writes archives into an object store
pub struct ArchiveAssembler {
    store: Arc<dyn ObjectStore>,
    config: AssemblyConfig,
}

impl ArchiveAssembler {
    /// Create an assembler writing through `store`
    pub fn new(store: Arc<dyn ObjectStore>, config: AssemblyConfig) -> Self {
        Self { store, config }
    }

    /// Active configuration
    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Plan the multipart parts for `layout` without touching the store
    pub fn plan(&self, layout: &ArchiveLayout) -> StoreResult<AssemblyPlan> {
        self.config.validate()?;
        let planner = PartPlanner::new(self.config.part_limits, self.config.split_strategy);
        Ok(planner.plan(&layout.segments())?)
    }

    /// Write `layout` to `destination`
    ///
    /// Configuration and planning errors are raised before any store call.
    /// Once the multipart upload exists, any failure or cancellation aborts
    /// it before the error is returned.
    pub async fn assemble(
        &self,
        layout: &ArchiveLayout,
        destination: &ObjectRef,
        cancel: &CancellationToken,
    ) -> StoreResult<AssembledArchive> {
        let plan = self.plan(layout)?;
        let size = plan.total_len();
        let parts = plan.len();
        let copied_parts = plan.copy_count();

        info!(
            "Assembling {} bytes into {} as {} parts ({} server-side copies)",
            size, destination, parts, copied_parts
        );

        let ObjectRef { bucket, key } = destination;
        let retry = &self.config.retry_policy;
        let upload_id = retry
            .run("create_multipart_upload", cancel, || {
                self.store.create_multipart_upload(bucket, key)
            })
            .await?;
        debug!("Created upload {} for {}", upload_id, destination);

        let written = self
            .write_parts(plan, destination, &upload_id, cancel)
            .await;
        let completed = match written {
            Ok(completed) => completed,
            Err(e) => {
                self.abort(destination, &upload_id).await;
                return Err(e);
            }
        };

        let completion = retry
            .run("complete_multipart_upload", cancel, || {
                self.store
                    .complete_multipart_upload(bucket, key, &upload_id, &completed)
            })
            .await;
        let etag = match completion {
            Ok(etag) => etag,
            Err(e) => {
                self.abort(destination, &upload_id).await;
                return Err(e);
            }
        };

        info!("Completed {} ({} bytes, etag {})", destination, size, etag);
        Ok(AssembledArchive {
            destination: destination.clone(),
            etag,
            size,
            parts,
            copied_parts,
            manifest: layout.manifest().describe(bucket.as_str()),
        })
    }

    async fn abort(&self, destination: &ObjectRef, upload_id: &str) {
        warn!("Aborting upload {} for {}", upload_id, destination);
        if let Err(e) = self
            .store
            .abort_multipart_upload(&destination.bucket, &destination.key, upload_id)
            .await
        {
            let e = StoreError::AbortFailed {
                bucket: destination.bucket.clone(),
                key: destination.key.clone(),
                upload_id: upload_id.to_string(),
                source: Box::new(e),
            };
            warn!("{}", e);
        }
    }

    /// Run the worker pool and return the acknowledged parts in order
    async fn write_parts(
        &self,
        plan: AssemblyPlan,
        destination: &ObjectRef,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<CompletedPart>> {
        let expected = plan.parts().iter().map(|part| part.part_number).collect();
        let mut ledger = AckLedger::new(upload_id, expected);
        let threads = self.config.threads.min(plan.len()).max(1);
        let token = cancel.child_token();

        let (work_tx, work_rx) = mpsc::channel::<PlannedPart>(threads * 2);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (ack_tx, mut ack_rx) = mpsc::channel::<Ack>(threads);

        let writer = Arc::new(PartWriter {
            store: Arc::clone(&self.store),
            destination: destination.clone(),
            upload_id: upload_id.to_string(),
            drift_check: self.config.drift_check,
            retry_policy: self.config.retry_policy.clone(),
        });

        let mut workers = JoinSet::new();
        for _ in 0..threads {
            workers.spawn(run_worker(
                Arc::clone(&writer),
                Arc::clone(&work_rx),
                ack_tx.clone(),
                token.clone(),
            ));
        }
        drop(ack_tx);

        let feeder_token = token.clone();
        workers.spawn(async move {
            for part in plan.into_parts() {
                tokio::select! {
                    () = feeder_token.cancelled() => break,
                    sent = work_tx.send(part) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        collect_acks(&mut ack_rx, &mut ledger, &token).await;

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                ledger.fail(StoreError::Worker(e.to_string()));
            }
        }

        ledger.finish(cancel.is_cancelled())
    }
}

/// Acknowledgements of one upload, keyed by part number
#[derive(Debug)]
struct AckLedger {
    upload_id: String,
    expected: BTreeSet<u32>,
    received: BTreeMap<u32, CompletedPart>,
    failure: Option<StoreError>,
}

impl AckLedger {
    fn new(upload_id: &str, expected: BTreeSet<u32>) -> Self {
        Self {
            upload_id: upload_id.to_string(),
            expected,
            received: BTreeMap::new(),
            failure: None,
        }
    }

    /// Record one acknowledgement, returning false once the upload has failed
    fn record(&mut self, ack: Ack) -> bool {
        match ack {
            Ok(part) if self.received.contains_key(&part.part_number) => {
                self.fail(StoreError::DuplicatePart {
                    upload_id: self.upload_id.clone(),
                    part_number: part.part_number,
                });
            }
            Ok(part) if !self.expected.contains(&part.part_number) => {
                self.fail(StoreError::UnexpectedPart {
                    upload_id: self.upload_id.clone(),
                    part_number: part.part_number,
                });
            }
            Ok(part) => {
                self.received.insert(part.part_number, part);
            }
            Err(e) => {
                warn!("Part failed for upload {}: {}", self.upload_id, e);
                self.fail(e);
            }
        }
        self.failure.is_none()
    }

    /// Keep the first failure
    fn fail(&mut self, error: StoreError) {
        self.failure.get_or_insert(error);
    }

    /// Parts in ascending order once every planned part arrived exactly once
    fn finish(self, cancelled: bool) -> StoreResult<Vec<CompletedPart>> {
        if let Some(e) = self.failure {
            return Err(e);
        }
        if cancelled {
            return Err(StoreError::Cancelled);
        }

        let missing: Vec<u32> = self
            .expected
            .iter()
            .filter(|number| !self.received.contains_key(number))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::MissingParts {
                upload_id: self.upload_id,
                missing,
            });
        }
        Ok(self.received.into_values().collect())
    }
}

/// Drain `acks` into `ledger` until every sender is gone
///
/// The first failure cancels `token` so the remaining workers stop early.
async fn collect_acks(
    acks: &mut mpsc::Receiver<Ack>,
    ledger: &mut AckLedger,
    token: &CancellationToken,
) {
    while let Some(ack) = acks.recv().await {
        if !ledger.record(ack) {
            token.cancel();
        }
    }
}

/// Everything a worker needs to write parts of one upload
struct PartWriter {
    store: Arc<dyn ObjectStore>,
    destination: ObjectRef,
    upload_id: String,
    drift_check: DriftCheck,
    retry_policy: RetryPolicy,
}

impl PartWriter {
    async fn write(&self, part: &PlannedPart, cancel: &CancellationToken) -> Ack {
        let operation = if part.is_copy() {
            "upload_part_copy"
        } else {
            "upload_part"
        };
        let etag = self
            .retry_policy
            .run(operation, cancel, || self.attempt(part))
            .await?;
        debug!(
            "Wrote part {} ({} bytes at offset {})",
            part.part_number, part.len, part.offset
        );
        Ok(CompletedPart {
            part_number: part.part_number,
            etag,
        })
    }

    async fn attempt(&self, part: &PlannedPart) -> StoreResult<String> {
        let ObjectRef { bucket, key } = &self.destination;
        let upload_id = self.upload_id.as_str();
        match &part.source {
            PartSource::Copy {
                source,
                range,
                expected,
            } => {
                self.verify(source, expected).await?;
                self.store
                    .upload_part_copy(source, *range, bucket, key, upload_id, part.part_number)
                    .await
            }
            PartSource::Upload(pieces) => {
                let mut body = BytesMut::with_capacity(part.len as usize);
                for piece in pieces {
                    match piece {
                        PartPiece::Inline(bytes) => body.extend_from_slice(bytes),
                        PartPiece::Remote {
                            source,
                            range,
                            expected,
                        } => {
                            self.verify(source, expected).await?;
                            let data = self
                                .store
                                .get_object_range(&source.bucket, &source.key, *range)
                                .await?;
                            if data.len() as u64 != range.len {
                                return Err(StoreError::Rejected {
                                    operation: "get_object_range",
                                    bucket: source.bucket.clone(),
                                    key: source.key.clone(),
                                    reason: format!(
                                        "returned {} of {} bytes",
                                        data.len(),
                                        range.len
                                    ),
                                });
                            }
                            body.extend_from_slice(&data);
                        }
                    }
                }
                self.store
                    .upload_part(bucket, key, upload_id, part.part_number, body.freeze())
                    .await
            }
        }
    }

    /// Compare a source with its layout-time fingerprint
    async fn verify(&self, source: &ObjectRef, expected: &SourceFingerprint) -> StoreResult<()> {
        if self.drift_check == DriftCheck::Off {
            return Ok(());
        }
        let current = self.store.head_object(&source.bucket, &source.key).await?;
        if current.size != expected.size || current.etag != expected.checksum {
            return Err(StoreError::Drift {
                bucket: source.bucket.clone(),
                key: source.key.clone(),
                expected_size: expected.size,
                actual_size: current.size,
                expected_checksum: expected.checksum.clone(),
                actual_checksum: current.etag,
            });
        }
        Ok(())
    }
}

async fn run_worker(
    writer: Arc<PartWriter>,
    work: Arc<Mutex<mpsc::Receiver<PlannedPart>>>,
    acks: mpsc::Sender<Ack>,
    token: CancellationToken,
) {
    loop {
        let next = {
            let mut work = work.lock().await;
            tokio::select! {
                biased;
                () = token.cancelled() => None,
                part = work.recv() => part,
            }
        };
        let Some(part) = next else {
            break;
        };

        let result = writer.write(&part, &token).await;
        if matches!(result, Err(StoreError::Cancelled)) || acks.send(result).await.is_err() {
            break;
        }
    }
}
