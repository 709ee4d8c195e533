//! Admission controller: one scheduling turn.
//!
//! A turn checks how much room the batch service has for this identity,
//! takes the scheduler lock, and drains the queue up to that room. Full
//! queue and lost lock races both end the turn quietly; only a batch
//! service that refuses everything is an error.

use crate::error::Result;
use crate::lock::{self, Acquire, LockOptions};
use crate::model::{Capacity, TurnOutcome};
use crate::queue::QueueStore;
use crate::slurm::BatchService;
use crate::telemetry::metrics;
use crate::telemetry::turn::{record_turn_result, start_turn_span};
use opentelemetry::KeyValue;
use std::time::Instant;
use tracing::{Instrument, info, warn};

use super::executor::{ExecutorConfig, SubmissionExecutor};

/// Batch size for the driver's first turn. Running jobs take it from there.
pub const INITIAL_BATCH: usize = 10;

/// Configuration for the admission controller.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Most jobs this identity may have queued or running.
    pub ceiling: usize,
    /// Extra cap on submissions per turn. `None` for cascade turns.
    pub batch_limit: Option<usize>,
    pub lock: LockOptions,
    pub executor: ExecutorConfig,
}

impl AdmissionConfig {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            batch_limit: None,
            lock: LockOptions::default(),
            executor: ExecutorConfig::default(),
        }
    }

    pub fn batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }
}

pub struct AdmissionController<S> {
    service: S,
    store: QueueStore,
    config: AdmissionConfig,
}

impl<S: BatchService> AdmissionController<S> {
    pub fn new(service: S, store: QueueStore, config: AdmissionConfig) -> Self {
        Self {
            service,
            store,
            config,
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Current room on the batch service. Never cached.
    pub async fn capacity(&self) -> Result<Capacity> {
        let active = self.service.active_count().await?;
        Ok(Capacity::new(self.config.ceiling, active))
    }

    /// Run one scheduling turn on behalf of `owner`.
    pub async fn run_turn(&self, owner: &str) -> Result<TurnOutcome> {
        let span = start_turn_span(owner, self.store.dir());
        let started = Instant::now();

        let result = self.turn(owner).instrument(span.clone()).await;

        let label = match &result {
            Ok(outcome) => {
                record_turn_result(&span, outcome.label(), outcome.submitted().len());
                outcome.label()
            }
            Err(_) => {
                record_turn_result(&span, "fatal", 0);
                "fatal"
            }
        };
        metrics::turns().add(1, &[KeyValue::new("outcome", label)]);
        metrics::turn_duration_ms().record(
            started.elapsed().as_millis() as f64,
            &[KeyValue::new("outcome", label)],
        );

        result
    }

    async fn turn(&self, owner: &str) -> Result<TurnOutcome> {
        let capacity = self.capacity().await?;
        if capacity.is_exhausted() {
            info!(
                active = capacity.active,
                ceiling = capacity.ceiling,
                "batch queue is full, nothing to do"
            );
            return Ok(TurnOutcome::QueueFull { capacity });
        }

        let guard = match lock::acquire(self.store.dir(), owner, self.config.lock)? {
            Acquire::Acquired(guard) => guard,
            Acquire::Denied { holder } => {
                info!(
                    holder = holder.as_deref().unwrap_or("unknown"),
                    "another scheduler is running, yielding"
                );
                metrics::lock_denied().add(1, &[]);
                return Ok(TurnOutcome::Denied { holder });
            }
        };

        // The guard releases the lock when dropped, including on `?` below.
        let limit = match self.config.batch_limit {
            Some(batch) => capacity.available().min(batch),
            None => capacity.available(),
        };
        let mut entries = self.store.list_pending()?;
        entries.truncate(limit);

        let executor = SubmissionExecutor::new(&self.service, &self.store, self.config.executor);
        let report = executor
            .submit_all(&entries)
            .await
            .inspect_err(|e| warn!(error = %e, "submission pass failed"))?;

        // Jobs have gone out by now; a failed listing must not hide that.
        let remaining = match self.store.len() {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "could not count remaining queue entries");
                None
            }
        };
        guard.release();

        info!(
            submitted = report.submitted.len(),
            failed = report.failed.len(),
            remaining = ?remaining,
            available = capacity.available(),
            "turn finished"
        );
        if remaining == Some(0) {
            info!("queue drained");
        }

        Ok(TurnOutcome::Drained {
            capacity,
            report,
            remaining,
        })
    }
}
