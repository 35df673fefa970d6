//! Outer polling loop.
//!
//! Each batch takes the grouping window (unconsumed reviewed pages up to the
//! first unreviewed one), claims the pages in it that still need OCR, seeds
//! the result map with pages an earlier run already extracted, and then runs
//! the worker pool and the grouping engine side by side.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::error::PipelineError;
use super::events::{EventBus, PipelineEvent};
use super::grouping::{GroupingEngine, GroupingOutcome};
use super::pool::{PoolReport, WorkerPool};
use super::reclaim::Reclaimer;
use super::results::{PageResult, ResultMap};
use crate::config::PipelineConfig;
use crate::ocr::{Credential, OcrClient};
use crate::repository::{ClaimOptions, DbContext};

/// What one batch did.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Pages in the grouping window.
    pub window: usize,
    /// Pages claimed for OCR.
    pub claimed: usize,
    /// Already-extracted pages seeded into the result map.
    pub seeded: usize,
    pub pool: PoolReport,
    pub grouping: GroupingOutcome,
}

impl BatchReport {
    pub fn made_progress(&self) -> bool {
        self.pool.succeeded > 0 || self.grouping.consumed > 0
    }
}

/// Totals over a `run_once` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub reclaimed: usize,
    pub extracted: usize,
    pub consumed: usize,
    pub groups_completed: usize,
}

pub struct PipelineRunner {
    ctx: DbContext,
    pool: WorkerPool,
    credentials: Vec<Credential>,
    config: PipelineConfig,
    claim: ClaimOptions,
    reclaimer: Reclaimer,
    events: EventBus,
}

impl PipelineRunner {
    pub fn new(
        ctx: DbContext,
        client: Arc<dyn OcrClient>,
        credentials: Vec<Credential>,
        config: PipelineConfig,
        events: EventBus,
    ) -> Self {
        let claim = ClaimOptions::new(config.stuck_timeout());
        let pool = WorkerPool::new(
            ctx.work_items(),
            client,
            config.retry_policy(),
            claim.clone(),
            config.bookmark_marker.clone(),
            events.clone(),
        );
        let reclaimer = Reclaimer::new(ctx.work_items(), config.stuck_timeout(), events.clone());
        Self {
            ctx,
            pool,
            credentials,
            config,
            claim,
            reclaimer,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn workers(&self) -> usize {
        self.credentials.len()
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if self.credentials.is_empty() {
            return Err(PipelineError::NoCredentials);
        }
        info!("Pipeline starting with {} worker(s)", self.workers());
        self.reclaimer.sweep().await?;
        let mut last_sweep = Instant::now();

        while !cancel.is_cancelled() {
            if last_sweep.elapsed() >= self.config.reclaim_interval() {
                if let Err(e) = self.reclaimer.sweep().await {
                    warn!("Stuck-job sweep failed: {}", e);
                }
                last_sweep = Instant::now();
            }

            let progressed = match self.run_batch(cancel).await {
                Ok(report) => report.made_progress(),
                Err(e) => {
                    error!("Batch failed: {}", e);
                    false
                }
            };

            if !progressed && !cancel.is_cancelled() {
                let idle = self.config.idle_interval();
                self.events.emit(PipelineEvent::Idle {
                    next_check_secs: idle.as_secs(),
                });
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }

        info!("Pipeline stopped");
        Ok(())
    }

    /// Process batches until one makes no progress, then return.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunSummary, PipelineError> {
        if self.credentials.is_empty() {
            return Err(PipelineError::NoCredentials);
        }
        let mut summary = RunSummary {
            reclaimed: self.reclaimer.sweep().await?,
            ..RunSummary::default()
        };

        while !cancel.is_cancelled() {
            let report = self.run_batch(cancel).await?;
            if report.window == 0 {
                break;
            }
            summary.batches += 1;
            summary.extracted += report.pool.succeeded;
            summary.consumed += report.grouping.consumed;
            summary.groups_completed += report.grouping.completed_groups.len();
            if !report.made_progress() {
                break;
            }
        }
        Ok(summary)
    }

    /// Build and process one batch.
    pub async fn run_batch(&self, cancel: &CancellationToken) -> Result<BatchReport, PipelineError> {
        let items = self.ctx.work_items();
        let window = items.grouping_window(self.config.batch_size).await?;
        let Some(last) = window.last().map(|item| item.sequence_number) else {
            return Ok(BatchReport::default());
        };

        let claimed = items
            .claim_up_to(Some(last), self.config.batch_size, &self.claim)
            .await?;

        let results = Arc::new(ResultMap::new());
        let mut seeded = 0;
        for item in window.iter().filter(|item| item.processed) {
            results.insert(PageResult {
                item_id: item.id,
                sequence_number: item.sequence_number,
                text: item.extracted_text.clone().unwrap_or_default(),
                is_bookmark: item.is_bookmark,
            });
            seeded += 1;
        }

        // Only the end of known intake closes the trailing group.
        let close_at_end = !items.has_unconsumed_after(last).await?;
        let sequence: Vec<i64> = window.iter().map(|item| item.sequence_number).collect();

        self.events.emit(PipelineEvent::BatchStarted {
            items: window.len(),
            to_ocr: claimed.len(),
            workers: self.workers(),
        });

        let claimed_count = claimed.len();
        let pool_done = CancellationToken::new();
        let engine = GroupingEngine::new(
            self.ctx.groups(),
            results.clone(),
            self.events.clone(),
            self.config.grouping_poll(),
            self.config.grouping_retry(),
        );

        let pool_run = async {
            let report = self
                .pool
                .run(claimed, &self.credentials, results.clone(), cancel)
                .await;
            pool_done.cancel();
            report
        };
        let (pool, grouping) = tokio::join!(
            pool_run,
            engine.run(&sequence, close_at_end, &pool_done, cancel)
        );

        self.events.emit(PipelineEvent::BatchFinished {
            succeeded: pool.succeeded,
            failed_attempts: pool.failed_attempts,
            consumed: grouping.consumed,
            leftover: window.len() - grouping.consumed,
        });

        Ok(BatchReport {
            window: window.len(),
            claimed: claimed_count,
            seeded,
            pool,
            grouping,
        })
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), PipelineError>>,
}

/// Runs a pipeline in a background task.
pub struct RunnerHandle {
    runner: Arc<PipelineRunner>,
    running: Mutex<Option<Running>>,
}

impl RunnerHandle {
    pub fn new(runner: PipelineRunner) -> Self {
        Self {
            runner: Arc::new(runner),
            running: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        self.runner.events()
    }

    /// Spawn the loop. Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            warn!("Pipeline is already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let runner = self.runner.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { runner.run(&token).await });
        *running = Some(Running { cancel, task });
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Cancel the loop and wait for it to wind down.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match running {
            Some(Running { cancel, task }) => {
                cancel.cancel();
                task.await?
            }
            None => Ok(()),
        }
    }
}
