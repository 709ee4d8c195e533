//! Submission executor: hands queue entries to the batch service in order.

use crate::error::{Error, Result};
use crate::model::{FailedSubmission, QueueEntry, Submission, SubmissionReport, submission_dir};
use crate::queue::QueueStore;
use crate::slurm::BatchService;
use crate::telemetry::metrics;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consecutive rejections after which the batch service is presumed down.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 10;

/// Settings for a submission pass.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Pause after each accepted submission.
    pub submit_delay: Duration,
    pub failure_threshold: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            submit_delay: Duration::ZERO,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

pub struct SubmissionExecutor<'a, S> {
    service: &'a S,
    store: &'a QueueStore,
    config: ExecutorConfig,
}

impl<'a, S: BatchService> SubmissionExecutor<'a, S> {
    pub fn new(service: &'a S, store: &'a QueueStore, config: ExecutorConfig) -> Self {
        Self {
            service,
            store,
            config,
        }
    }

    /// Submit `entries` one at a time, unlinking each only after the batch
    /// service accepted it.
    ///
    /// Stops early once `failure_threshold` submissions in a row fail. If
    /// nothing was accepted by then the service is treated as unreachable
    /// and [`Error::ServiceUnavailable`] is returned; otherwise the partial
    /// report comes back with `tripped` set.
    pub async fn submit_all(&self, entries: &[QueueEntry]) -> Result<SubmissionReport> {
        let mut report = SubmissionReport::default();
        let mut consecutive_failures = 0;

        for entry in entries {
            let descriptor = match entry.descriptor() {
                Ok(Some(descriptor)) => descriptor,
                Ok(None) => {
                    debug!(entry = %entry.name, "entry already consumed, skipping");
                    report.skipped.push(entry.name.clone());
                    continue;
                }
                Err(e) => {
                    warn!(entry = %entry.name, error = %e, "unreadable queue entry, skipping");
                    report.skipped.push(entry.name.clone());
                    continue;
                }
            };
            let workdir = submission_dir(&descriptor);

            match self.service.submit(&descriptor, &workdir).await {
                Ok(job_id) => {
                    consecutive_failures = 0;
                    info!(entry = %entry.name, %job_id, "submitted");
                    metrics::jobs_submitted().add(1, &[]);

                    match self.store.remove(entry) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(entry = %entry.name, "entry was removed concurrently")
                        }
                        // Left behind, a later turn may submit it again.
                        Err(e) => warn!(entry = %entry.name, error = %e, "failed to unlink submitted entry"),
                    }

                    report.submitted.push(Submission {
                        name: entry.name.clone(),
                        job_id,
                    });

                    if !self.config.submit_delay.is_zero() {
                        tokio::time::sleep(self.config.submit_delay).await;
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        entry = %entry.name,
                        error = %e,
                        consecutive_failures,
                        "submit failed, entry stays queued"
                    );
                    metrics::submit_failures().add(1, &[]);
                    report.failed.push(FailedSubmission {
                        name: entry.name.clone(),
                        error: e.to_string(),
                    });

                    if consecutive_failures >= self.config.failure_threshold {
                        if report.submitted.is_empty() {
                            return Err(Error::ServiceUnavailable {
                                failures: consecutive_failures,
                            });
                        }
                        warn!(
                            submitted = report.submitted.len(),
                            "batch service keeps rejecting work, ending pass early"
                        );
                        report.tripped = true;
                        break;
                    }
                }
            }
        }

        Ok(report)
    }
}
