//! Background write pipeline.
//!
//! Records submitted to a [`StagingWriter`] accumulate in an unbuilt staging
//! buffer owned by a worker thread. The buffer is applied through the batch
//! write path when it reaches the batch threshold, when the flush interval
//! passes with pending work, or on an explicit [`StagingWriter::flush`].
//! Searches keep reading the last swapped snapshot until the batch lands.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use tracing::{debug, error, info, warn};

use super::lifecycle::WriteReport;
use crate::defect::DefectRecord;
use crate::error::{KbError, KbResult};
use crate::knowledge::KnowledgeBase;
use crate::types::FacetVectors;

enum Command {
    Submit(Box<DefectRecord>, FacetVectors),
    Flush(Sender<KbResult<WriteReport>>),
    Shutdown,
}

pub struct StagingWriter {
    sender: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl StagingWriter {
    pub fn spawn(kb: Arc<KnowledgeBase>, batch_threshold: usize, flush_interval: Duration) -> Self {
        let (sender, receiver) = unbounded();
        let batch_threshold = batch_threshold.max(1);
        let worker = std::thread::Builder::new()
            .name("bugscout-staging".to_string())
            .spawn(move || run_worker(kb, receiver, batch_threshold, flush_interval))
            .map_err(|e| error!(error = %e, "failed to spawn staging worker"))
            .ok();

        Self { sender, worker }
    }

    /// Spawns a writer using the knowledge base's `[staging]` settings.
    pub fn from_settings(kb: Arc<KnowledgeBase>) -> Self {
        let staging = kb.settings().staging.clone();
        Self::spawn(
            kb,
            staging.batch_threshold,
            Duration::from_millis(staging.flush_interval_ms),
        )
    }

    /// Queues a pre-embedded record. Returns false when the worker is gone.
    pub fn submit(&self, record: DefectRecord, vectors: FacetVectors) -> bool {
        self.sender
            .send(Command::Submit(Box::new(record), vectors))
            .is_ok()
    }

    /// Applies every pending record now and returns the batch report.
    pub fn flush(&self) -> KbResult<WriteReport> {
        let (reply, response) = bounded(1);
        self.sender
            .send(Command::Flush(reply))
            .map_err(|_| KbError::StagingClosed)?;
        response.recv().map_err(|_| KbError::StagingClosed)?
    }

    /// Flushes pending work and joins the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.sender.send(Command::Shutdown);
            if worker.join().is_err() {
                error!("staging worker panicked");
            }
        }
    }
}

impl Drop for StagingWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    kb: Arc<KnowledgeBase>,
    receiver: Receiver<Command>,
    batch_threshold: usize,
    flush_interval: Duration,
) {
    let mut pending: Vec<(DefectRecord, FacetVectors)> = Vec::new();
    let mut oldest: Option<Instant> = None;

    loop {
        let timeout = match oldest {
            Some(since) => flush_interval.saturating_sub(since.elapsed()),
            None => flush_interval,
        };

        match receiver.recv_timeout(timeout) {
            Ok(Command::Submit(record, vectors)) => {
                pending.push((*record, vectors));
                oldest.get_or_insert_with(Instant::now);
                if pending.len() >= batch_threshold {
                    debug!(pending = pending.len(), "batch threshold reached");
                    apply_logged(&kb, &mut pending);
                    oldest = None;
                }
            }
            Ok(Command::Flush(reply)) => {
                let result = kb.add_batch(std::mem::take(&mut pending));
                oldest = None;
                let _ = reply.send(result);
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                apply_logged(&kb, &mut pending);
                info!("staging worker stopped");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !pending.is_empty() {
                    debug!(pending = pending.len(), "flush interval elapsed");
                    apply_logged(&kb, &mut pending);
                }
                oldest = None;
            }
        }
    }
}

fn apply_logged(kb: &KnowledgeBase, pending: &mut Vec<(DefectRecord, FacetVectors)>) {
    if pending.is_empty() {
        return;
    }
    let count = pending.len();
    match kb.add_batch(std::mem::take(pending)) {
        Ok(report) if report.is_complete() => {
            info!(records = count, "staged batch applied");
        }
        Ok(report) => {
            let failed: Vec<_> = report
                .failed_facets()
                .iter()
                .map(|f| f.as_str())
                .collect();
            warn!(records = count, failed = ?failed, "staged batch applied with failed facets");
        }
        Err(e) => error!(records = count, error = %e, "staged batch failed"),
    }
}
