//! Single-transfer state machine: admission, chunk buffering, flushing,
//! completion and failure.
//!
//! The manager performs no scheduling of its own. The owning connection
//! decides when to run flushes, timeouts and cleanups; every method here is
//! synchronous apart from the file I/O it is asked to do.

use std::path::PathBuf;
use std::sync::Arc;

use dropline_protocol::messages::{FileComplete, FileStart};
use dropline_protocol::{ErrorCode, ServerStatus, TransferProgress};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::chunked::{FlushBatch, calculate_file_checksum};
use crate::cleanup::{CleanupGeneration, CleanupTask};
use crate::fs::{ChunkFile, FileSystem};
use crate::types::{Transfer, TransferStatus};
use crate::validation::{Rejection, TransferPolicy};

/// How many missing indices an incomplete-transfer message lists.
const MISSING_CHUNKS_SHOWN: usize = 10;

/// Result of offering a chunk to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Buffered. `flush_due` asks the caller to schedule a flush.
    Accepted { flush_due: bool },
    Dropped(DropReason),
}

/// Why a chunk was silently discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotReceiving,
    NoTransfer,
    WrongTransfer,
    TransferClosed,
    Duplicate,
    IndexOutOfRange,
    Oversized,
}

/// A transfer that reached a final state.
pub struct Concluded {
    /// Outcome to send as `file_complete`.
    pub report: FileComplete,
    /// Deferred leftover removal; run it on a later scheduler tick.
    pub cleanup: CleanupTask,
}

/// What [`TransferManager::begin_finish`] produced.
pub enum FinishStep {
    /// Concluded without disk work (missing chunks).
    Done(Concluded),
    /// Disk work to run off the async runtime.
    Pending(Completion),
}

/// Final flush, close, optional checksum and move of a finished transfer.
///
/// Owns everything it needs so it can run on a blocking thread.
pub struct Completion {
    transfer_id: String,
    fs: Arc<dyn FileSystem>,
    file: Option<Arc<dyn ChunkFile>>,
    pending: Option<FlushBatch>,
    temp_path: PathBuf,
    final_path: PathBuf,
    /// Set when the file must be verified before it is placed.
    expected_checksum: Option<String>,
}

/// Result of [`Completion::run`], handed back to [`TransferManager::complete`].
pub struct Completed {
    transfer_id: String,
    result: Result<(), Outcome>,
}

impl Completed {
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl Completion {
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    /// Does the blocking work. Never touches manager state.
    pub fn run(self) -> Completed {
        let result = self.place_file();
        Completed {
            transfer_id: self.transfer_id,
            result,
        }
    }

    fn place_file(&self) -> Result<(), Outcome> {
        if let Some(batch) = &self.pending {
            batch
                .write()
                .map_err(|e| disk_failure(format!("Failed to write file: {e}"), false))?;
        }
        if let Some(file) = &self.file {
            if let Err(e) = file.close() {
                warn!(transfer_id = %self.transfer_id, "failed to close temp file: {e}");
            }
        }

        if let Some(expected) = &self.expected_checksum {
            let actual = calculate_file_checksum(self.fs.as_ref(), &self.temp_path)
                .map_err(|e| disk_failure(format!("Failed to read file: {e}"), false))?;
            if &actual != expected {
                return Err(Outcome::Failure {
                    code: ErrorCode::ChecksumMismatch,
                    message: TransferError::ChecksumMismatch {
                        expected: expected.clone(),
                        actual,
                    }
                    .to_string(),
                    partial_target: false,
                });
            }
        }

        if self.fs.exists(&self.final_path) {
            debug!(path = %self.final_path.display(), "replacing existing file");
            self.fs
                .remove_file(&self.final_path)
                .map_err(|e| disk_failure(format!("Failed to replace existing file: {e}"), false))?;
        }

        self.fs.move_file(&self.temp_path, &self.final_path).map_err(|e| {
            let partial = self.fs.exists(&self.final_path);
            disk_failure(format!("Failed to move file: {e}"), partial)
        })
    }
}

fn disk_failure(message: String, partial_target: bool) -> Outcome {
    Outcome::Failure {
        code: ErrorCode::DiskError,
        message,
        partial_target,
    }
}

enum Outcome {
    Success,
    Failure {
        code: ErrorCode,
        message: String,
        partial_target: bool,
    },
}

/// Owns at most one [`Transfer`].
pub struct TransferManager {
    policy: TransferPolicy,
    fs: Arc<dyn FileSystem>,
    generation: CleanupGeneration,
    active: Option<Transfer>,
}

impl TransferManager {
    pub fn new(policy: TransferPolicy, fs: Arc<dyn FileSystem>, generation: CleanupGeneration) -> Self {
        Self {
            policy,
            fs,
            generation,
            active: None,
        }
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    pub fn active(&self) -> Option<&Transfer> {
        self.active.as_ref()
    }

    pub fn progress(&self) -> Option<TransferProgress> {
        self.active.as_ref().map(Transfer::progress)
    }

    /// Deadline of the transfer while it is still receiving.
    pub fn deadline(&self) -> Option<Instant> {
        self.active
            .as_ref()
            .filter(|t| t.status == TransferStatus::Receiving)
            .map(|t| t.deadline)
    }

    /// Admits a new transfer and opens its temp file.
    pub fn start(&mut self, status: ServerStatus, req: &FileStart) -> Result<(), Rejection> {
        if !status.accepts_transfers() {
            return Err(Rejection::NotConnected);
        }
        if let Some(active) = &self.active {
            debug!(
                transfer_id = %req.transfer_id,
                active = %active.transfer_id,
                "rejecting concurrent transfer"
            );
            return Err(Rejection::TransferInProgress);
        }
        self.policy.check_admission(req)?;

        let temp_dir = self.policy.temp_dir();
        for dir in [&self.policy.storage_dir, &temp_dir] {
            self.fs.create_dir_all(dir).map_err(|e| {
                warn!(dir = %dir.display(), "cannot create storage directory: {e}");
                Rejection::StorageUnavailable(e.to_string())
            })?;
        }

        // Unique per transfer: every conclusion advances the generation.
        let temp_path = temp_dir.join(format!(
            "{}-{}.part",
            self.generation.current(),
            sanitize_id(&req.transfer_id)
        ));
        let final_path = self.policy.storage_dir.join(&req.file_name);
        let file = self.fs.create_file(&temp_path).map_err(|e| {
            warn!(path = %temp_path.display(), "cannot create temp file: {e}");
            Rejection::TempFile(e.to_string())
        })?;

        let deadline = Instant::now() + self.policy.timeout();
        info!(
            transfer_id = %req.transfer_id,
            file_name = %req.file_name,
            file_size = req.file_size,
            total_chunks = req.total_chunks,
            "transfer started"
        );
        self.active = Some(Transfer::new(req, temp_path, final_path, file, deadline));
        Ok(())
    }

    /// Buffers a chunk. Never touches the disk.
    pub fn receive_chunk(
        &mut self,
        status: ServerStatus,
        transfer_id: &str,
        chunk_index: u32,
        data: Vec<u8>,
    ) -> ChunkOutcome {
        if let Err(reason) = self.check_chunk(status, transfer_id, chunk_index, data.len() as u64) {
            debug!(transfer_id, chunk_index, ?reason, "chunk dropped");
            return ChunkOutcome::Dropped(reason);
        }

        if let Some(t) = self.active.as_mut() {
            t.record_chunk(chunk_index, data.len() as u64);
            t.pending.insert(chunk_index, data);
        }
        ChunkOutcome::Accepted {
            flush_due: self.schedule_flush(),
        }
    }

    fn check_chunk(
        &self,
        status: ServerStatus,
        transfer_id: &str,
        chunk_index: u32,
        len: u64,
    ) -> Result<(), DropReason> {
        if status != ServerStatus::ReceivingFile {
            return Err(DropReason::NotReceiving);
        }
        let t = self.active.as_ref().ok_or(DropReason::NoTransfer)?;
        if t.transfer_id != transfer_id {
            return Err(DropReason::WrongTransfer);
        }
        if t.status != TransferStatus::Receiving {
            return Err(DropReason::TransferClosed);
        }
        if t.has_chunk(chunk_index) {
            return Err(DropReason::Duplicate);
        }
        if chunk_index >= t.total_chunks {
            return Err(DropReason::IndexOutOfRange);
        }
        if len > t.chunk_size || t.bytes_received() + len > t.file_size {
            return Err(DropReason::Oversized);
        }
        Ok(())
    }

    /// Marks a flush as scheduled once pending bytes reach the threshold.
    /// Returns `true` only for the call that set the flag.
    pub fn schedule_flush(&mut self) -> bool {
        let threshold = self.policy.flush_threshold;
        match self.active.as_mut() {
            Some(t)
                if t.status == TransferStatus::Receiving
                    && !t.flush_scheduled
                    && t.pending.bytes() >= threshold =>
            {
                t.flush_scheduled = true;
                true
            }
            _ => false,
        }
    }

    /// Detaches the pending buffer for a scheduled flush and clears the flag.
    pub fn take_flush(&mut self) -> Option<FlushBatch> {
        let t = self
            .active
            .as_mut()
            .filter(|t| t.status == TransferStatus::Receiving)?;
        t.flush_scheduled = false;
        detach_pending(t)
    }

    /// Writes whatever is pending, synchronously. Returns bytes written.
    pub fn flush_now(&mut self) -> Result<u64, TransferError> {
        match self.active.as_mut().and_then(detach_pending) {
            Some(batch) => batch.write(),
            None => Ok(0),
        }
    }

    /// Handles `file_end` synchronously. `None` when no receiving transfer
    /// matches.
    pub fn finish(&mut self, transfer_id: &str) -> Option<Concluded> {
        match self.begin_finish(transfer_id)? {
            FinishStep::Done(done) => Some(done),
            FinishStep::Pending(job) => {
                let completed = job.run();
                self.complete(completed)
            }
        }
    }

    /// First half of `file_end`: checks completeness and, if every chunk
    /// arrived, detaches the disk work into a [`Completion`].
    ///
    /// The transfer stays `Completing` until [`complete`](Self::complete) is
    /// called with the job's result; chunks and timeouts are ignored
    /// meanwhile.
    pub fn begin_finish(&mut self, transfer_id: &str) -> Option<FinishStep> {
        let t = match self.active.as_mut() {
            Some(t) if t.transfer_id == transfer_id && t.status == TransferStatus::Receiving => t,
            _ => {
                debug!(transfer_id, "file_end ignored: no matching transfer");
                return None;
            }
        };

        if t.received_chunks() != t.total_chunks {
            let (missing, truncated) = t.missing_chunks(MISSING_CHUNKS_SHOWN);
            let list = missing.iter().map(u32::to_string).collect::<Vec<_>>().join(", ");
            let message = format!("Missing chunks: {list}{}", if truncated { "..." } else { "" });
            return self
                .fail(ErrorCode::IncompleteTransfer, message)
                .map(FinishStep::Done);
        }

        t.status = TransferStatus::Completing;
        t.flush_scheduled = false;
        let pending = detach_pending(t);
        let job = Completion {
            transfer_id: t.transfer_id.clone(),
            fs: Arc::clone(&self.fs),
            file: t.file.take(),
            pending,
            temp_path: t.temp_path.clone(),
            final_path: t.final_path.clone(),
            expected_checksum: self
                .policy
                .verify_checksum
                .then(|| t.expected_checksum.clone()),
        };
        Some(FinishStep::Pending(job))
    }

    /// Second half of `file_end`: concludes the transfer a [`Completion`]
    /// was detached from. Stale results are ignored.
    pub fn complete(&mut self, completed: Completed) -> Option<Concluded> {
        match &self.active {
            Some(t)
                if t.transfer_id == completed.transfer_id
                    && t.status == TransferStatus::Completing => {}
            _ => {
                debug!(transfer_id = %completed.transfer_id, "completion ignored: transfer gone");
                return None;
            }
        }
        match completed.result {
            Ok(()) => self.conclude(Outcome::Success),
            Err(outcome) => self.conclude(outcome),
        }
    }

    /// Fails the active transfer, in any state.
    pub fn fail(&mut self, code: ErrorCode, message: impl Into<String>) -> Option<Concluded> {
        self.conclude(Outcome::Failure {
            code,
            message: message.into(),
            partial_target: false,
        })
    }

    /// Fails the transfer with `TIMEOUT` once its deadline has passed.
    pub fn expire(&mut self) -> Option<Concluded> {
        let deadline = self.deadline()?;
        if Instant::now() < deadline {
            return None;
        }
        self.fail(ErrorCode::Timeout, "Global timeout exceeded")
    }

    /// Fails the transfer because the client went away.
    pub fn abort(&mut self) -> Option<Concluded> {
        self.fail(ErrorCode::ConnectionLost, "Connection lost")
    }

    fn conclude(&mut self, outcome: Outcome) -> Option<Concluded> {
        let mut t = self.active.take()?;
        close_file(&mut t);

        let mut leftovers = vec![t.temp_path.clone()];
        let report = match outcome {
            Outcome::Success => {
                t.status = TransferStatus::Complete;
                info!(
                    transfer_id = %t.transfer_id,
                    path = %t.final_path.display(),
                    bytes = t.bytes_received(),
                    elapsed_ms = t.started_at.elapsed().as_millis() as u64,
                    "transfer complete"
                );
                FileComplete {
                    transfer_id: t.transfer_id.clone(),
                    success: true,
                    file_path: Some(t.final_path.display().to_string()),
                    error: None,
                    error_code: None,
                    received_chunks: t.received_chunks(),
                    received_bytes: t.bytes_received(),
                }
            }
            Outcome::Failure {
                code,
                message,
                partial_target,
            } => {
                t.status = TransferStatus::Error;
                warn!(transfer_id = %t.transfer_id, %code, "transfer failed: {message}");
                if partial_target {
                    leftovers.push(t.final_path.clone());
                }
                FileComplete {
                    transfer_id: t.transfer_id.clone(),
                    success: false,
                    file_path: None,
                    error: Some(message),
                    error_code: Some(code),
                    received_chunks: t.received_chunks(),
                    received_bytes: t.bytes_received(),
                }
            }
        };

        let cleanup = CleanupTask::begin(&self.generation, leftovers, self.fs.clone());
        Some(Concluded { report, cleanup })
    }
}

fn detach_pending(t: &mut Transfer) -> Option<FlushBatch> {
    if t.pending.is_empty() {
        return None;
    }
    let file = t.file.clone()?;
    Some(FlushBatch::new(
        t.transfer_id.clone(),
        file,
        t.chunk_size,
        t.pending.take(),
    ))
}

fn close_file(t: &mut Transfer) {
    if let Some(file) = t.file.take() {
        if let Err(e) = file.close() {
            warn!(transfer_id = %t.transfer_id, "failed to close temp file: {e}");
        }
    }
}

/// Keeps temp file names portable whatever the client sends as an id.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .take(64)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
