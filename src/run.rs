//! Job execution.
//!
//! Jobs run in planned order. Each successful transcode becomes an
//! [`OutputResult`] that is written to the cache before the next job starts,
//! so an interrupted run leaves exactly the completed prefix recorded and a
//! rerun plans only what is left.
//!
//! With `workers > 1` jobs are transcoded in batches of `workers` on the
//! rayon pool. Results of a batch are still persisted one at a time, in
//! planned order, on the calling thread: there is never more than one cache
//! writer.
//!
//! A failed transcode is journaled and skipped; it is not recorded, so the
//! next run retries it. Cancellation is checked before every job
//! (sequential) or every batch (parallel), never mid-transcode.

use crate::cache::{DerivationCache, OutputResult};
use crate::config::TaskConfig;
use crate::imaging::{Destination, TranscodeError, TranscodeRequest, Transcoded, Transcoder};
use crate::journal::{Journal, JournalEvent};
use crate::naming::Target;
use crate::plan::{Plan, PlannedOutput};
use crate::source::SourceImage;
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag shared with whoever may stop the run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the runner did.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Successful outputs with the index of their source.
    pub results: Vec<(usize, OutputResult)>,
    pub failed: usize,
    pub persist_failures: usize,
    /// Jobs never started because the run was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.results.len()
    }
}

/// Execution settings.
pub struct Runner<'a> {
    pub transcoder: &'a dyn Transcoder,
    pub tasks: &'a [TaskConfig],
    pub workers: usize,
    pub cancel: CancelToken,
}

fn request_for(job: &PlannedOutput, source: &SourceImage, task: &TaskConfig) -> TranscodeRequest {
    TranscodeRequest {
        source: source.path.clone(),
        width: job.descriptor.width,
        height: job.descriptor.height,
        encode: task.encode.clone(),
        destination: match &job.descriptor.target {
            Target::File(path) => Destination::File(path.clone()),
            Target::Inline => Destination::Inline,
        },
    }
}

impl Runner<'_> {
    /// Run every job of `plan` against `sources`, persisting into `cache`.
    pub fn run(
        &self,
        plan: &Plan,
        sources: &[SourceImage],
        cache: &mut DerivationCache,
        journal: &mut Journal,
    ) -> RunReport {
        let jobs: Vec<&PlannedOutput> = plan.jobs().collect();
        let total = jobs.len();
        let batch = self.workers.max(1);
        let mut report = RunReport::default();

        for (batch_index, chunk) in jobs.chunks(batch).enumerate() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                report.skipped = total - batch_index * batch;
                journal.push(JournalEvent::Cancelled {
                    remaining: report.skipped,
                });
                break;
            }

            let outcomes: Vec<Result<Transcoded, TranscodeError>> = if chunk.len() == 1 {
                chunk
                    .iter()
                    .map(|job| self.transcode(job, sources))
                    .collect()
            } else {
                chunk
                    .par_iter()
                    .map(|job| self.transcode(job, sources))
                    .collect()
            };

            for (offset, (job, outcome)) in chunk.iter().zip(outcomes).enumerate() {
                let index = batch_index * batch + offset + 1;
                self.settle(job, outcome, index, total, sources, cache, journal, &mut report);
            }
        }
        report
    }

    fn transcode(
        &self,
        job: &PlannedOutput,
        sources: &[SourceImage],
    ) -> Result<Transcoded, TranscodeError> {
        let task = &self.tasks[job.task];
        self.transcoder
            .transcode(&request_for(job, &sources[job.source], task))
    }

    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        job: &PlannedOutput,
        outcome: Result<Transcoded, TranscodeError>,
        index: usize,
        total: usize,
        sources: &[SourceImage],
        cache: &mut DerivationCache,
        journal: &mut Journal,
        report: &mut RunReport,
    ) {
        let source = &sources[job.source];
        let descriptor = &job.descriptor;
        match outcome {
            Ok(transcoded) => {
                let result = OutputResult::new(descriptor, transcoded);
                journal.push(JournalEvent::Created {
                    index,
                    total,
                    source: source.name.clone(),
                    task: descriptor.task.clone(),
                    width: descriptor.width,
                    target: match descriptor.file() {
                        Some(path) => path.display().to_string(),
                        None => "inline".to_string(),
                    },
                });
                if let Err(e) = cache.record_result(source, result.clone()) {
                    report.persist_failures += 1;
                    journal.push(JournalEvent::PersistFailed {
                        reason: e.to_string(),
                    });
                }
                report.results.push((job.source, result));
            }
            Err(TranscodeError::UnsupportedFormat(reason)) => {
                report.failed += 1;
                journal.push(JournalEvent::Unsupported {
                    source: source.name.clone(),
                    task: descriptor.task.clone(),
                    reason,
                });
            }
            Err(e) => {
                report.failed += 1;
                journal.push(JournalEvent::Failed {
                    index,
                    total,
                    source: source.name.clone(),
                    task: descriptor.task.clone(),
                    width: descriptor.width,
                    reason: e.to_string(),
                });
            }
        }
    }
}
