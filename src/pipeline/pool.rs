//! OCR worker pool.
//!
//! One worker per credential pulls claimed items from a shared queue, runs
//! OCR through the retry policy and publishes the text to the result map.
//! A worker that gives up on an item hands the item back to the queue and
//! retires for the rest of the batch.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{EventBus, PipelineEvent};
use super::queue::WorkQueue;
use super::results::{PageResult, ResultMap};
use crate::models::WorkItem;
use crate::ocr::{is_bookmark_text, Credential, OcrClient, OcrError, RetryError, RetryPolicy};
use crate::repository::{ClaimOptions, WorkItemRepository};

/// Totals for one pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub succeeded: usize,
    pub failed_attempts: usize,
    pub retired_workers: usize,
    /// Requeued items another process claimed before we could.
    pub skipped: usize,
    /// Items still queued when the last worker exited.
    pub leftover: Vec<i32>,
}

#[derive(Debug, Default)]
struct WorkerReport {
    completed: usize,
    failed_attempts: usize,
    retired: bool,
    skipped: usize,
}

enum ItemFailure {
    Cancelled,
    Failed { attempts: u32, error: String },
}

#[derive(Clone)]
pub struct WorkerPool {
    items: WorkItemRepository,
    client: Arc<dyn OcrClient>,
    retry: RetryPolicy,
    claim: ClaimOptions,
    bookmark_marker: String,
    events: EventBus,
}

impl WorkerPool {
    pub fn new(
        items: WorkItemRepository,
        client: Arc<dyn OcrClient>,
        retry: RetryPolicy,
        claim: ClaimOptions,
        bookmark_marker: impl Into<String>,
        events: EventBus,
    ) -> Self {
        Self {
            items,
            client,
            retry,
            claim,
            bookmark_marker: bookmark_marker.into(),
            events,
        }
    }

    /// Process `batch` with one worker per credential until the queue drains,
    /// every worker retires, or `cancel` fires.
    ///
    /// Items left in the queue afterwards are returned in the report with
    /// their claims released.
    pub async fn run(
        &self,
        batch: Vec<WorkItem>,
        credentials: &[Credential],
        results: Arc<ResultMap>,
        cancel: &CancellationToken,
    ) -> PoolReport {
        let queue = Arc::new(WorkQueue::new(batch));

        let handles: Vec<_> = credentials
            .iter()
            .cloned()
            .map(|credential| {
                let pool = self.clone();
                let queue = queue.clone();
                let results = results.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move { pool.work(credential, queue, results, cancel).await })
            })
            .collect();

        let mut report = PoolReport::default();
        for joined in join_all(handles).await {
            match joined {
                Ok(worker) => {
                    report.succeeded += worker.completed;
                    report.failed_attempts += worker.failed_attempts;
                    report.skipped += worker.skipped;
                    if worker.retired {
                        report.retired_workers += 1;
                    }
                }
                Err(e) => warn!("OCR worker task failed: {}", e),
            }
        }

        // Never-popped items still hold our claim. Requeued ones were
        // released already; releasing again is harmless.
        let leftover: Vec<i32> = queue.drain().into_iter().map(|q| q.item.id).collect();
        if !leftover.is_empty() {
            match self.items.release_claims(&leftover).await {
                Ok(released) => debug!("Released {} unprocessed claim(s)", released),
                Err(e) => warn!("Failed to release leftover claims: {}", e),
            }
        }
        report.leftover = leftover;
        report
    }

    async fn work(
        self,
        credential: Credential,
        queue: Arc<WorkQueue>,
        results: Arc<ResultMap>,
        cancel: CancellationToken,
    ) -> WorkerReport {
        let worker = credential.index;
        let mut report = WorkerReport::default();
        self.events.emit(PipelineEvent::WorkerStarted { worker });

        while !cancel.is_cancelled() {
            let Some(queued) = queue.pop() else {
                break;
            };
            let item = queued.item;

            if queued.requeued {
                match self.items.reclaim(item.id, &self.claim).await {
                    Ok(true) => {}
                    Ok(false) => {
                        self.events.emit(PipelineEvent::ItemSkipped {
                            worker,
                            sequence_number: item.sequence_number,
                        });
                        report.skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!("Failed to re-claim page #{}: {}", item.sequence_number, e);
                        let sequence_number = item.sequence_number;
                        queue.requeue(item);
                        self.events.emit(PipelineEvent::WorkerRetired {
                            worker,
                            sequence_number,
                        });
                        report.retired = true;
                        break;
                    }
                }
            }

            self.events.emit(PipelineEvent::ItemClaimed {
                worker,
                sequence_number: item.sequence_number,
            });

            let (outcome, failed_attempts) = self.process(worker, &credential, &item, &cancel).await;
            report.failed_attempts += failed_attempts;

            match outcome {
                Ok(result) => {
                    results.insert(result);
                    report.completed += 1;
                }
                Err(ItemFailure::Cancelled) => {
                    if let Err(e) = self.items.release_claim(item.id).await {
                        warn!("Failed to release page #{}: {}", item.sequence_number, e);
                    }
                    break;
                }
                Err(ItemFailure::Failed { attempts, error }) => {
                    let sequence_number = item.sequence_number;
                    self.events.emit(PipelineEvent::ItemFailed {
                        worker,
                        sequence_number,
                        attempts,
                        error,
                    });
                    if let Err(e) = self.items.release_claim(item.id).await {
                        warn!("Failed to release page #{}: {}", sequence_number, e);
                    }
                    queue.requeue(item);
                    self.events.emit(PipelineEvent::ItemRequeued {
                        worker,
                        sequence_number,
                    });
                    self.events.emit(PipelineEvent::WorkerRetired {
                        worker,
                        sequence_number,
                    });
                    report.retired = true;
                    break;
                }
            }
        }

        self.events.emit(PipelineEvent::WorkerStopped {
            worker,
            completed: report.completed,
        });
        report
    }

    /// OCR one claimed item and persist the text.
    ///
    /// Returns the outcome and the number of failed attempts, which have
    /// already been added to the item's failure counter.
    async fn process(
        &self,
        worker: usize,
        credential: &Credential,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> (Result<PageResult, ItemFailure>, usize) {
        let image = match self.items.store().read(item.image_path()).await {
            Ok(image) => image,
            Err(e) => {
                let error = e.to_string();
                self.record_failure(item, &error).await;
                return (
                    Err(ItemFailure::Failed { attempts: 0, error }),
                    1,
                );
            }
        };

        let image = image.as_slice();
        let mut failures = 0u32;
        let max_attempts = self.retry.max_attempts.max(1);
        let outcome = self
            .retry
            .run(
                cancel,
                // Each failed attempt is on record before the backoff starts.
                move |_| async move {
                    let result = self.client.extract(image, &item.mime_type, credential).await;
                    if let Err(e) = &result {
                        self.record_failure(item, &e.to_string()).await;
                    }
                    result
                },
                |attempt, e: &OcrError| {
                    failures += 1;
                    if attempt < max_attempts {
                        self.events.emit(PipelineEvent::ItemRetry {
                            worker,
                            sequence_number: item.sequence_number,
                            attempt,
                            max_attempts,
                            error: e.to_string(),
                        });
                    }
                },
            )
            .await;
        let failed_attempts = failures as usize;

        let text = match outcome {
            Ok(text) => text,
            Err(RetryError::Cancelled { .. }) => {
                return (Err(ItemFailure::Cancelled), failed_attempts)
            }
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                return (
                    Err(ItemFailure::Failed {
                        attempts,
                        error: last_error,
                    }),
                    failed_attempts,
                )
            }
        };

        let is_bookmark = is_bookmark_text(&text, &self.bookmark_marker);
        if let Err(e) = self.items.mark_completed(item.id, &text, is_bookmark).await {
            let error = format!("failed to store OCR text: {e}");
            self.record_failure(item, &error).await;
            return (
                Err(ItemFailure::Failed {
                    attempts: failures,
                    error,
                }),
                failed_attempts + 1,
            );
        }

        self.events.emit(PipelineEvent::ItemCompleted {
            worker,
            sequence_number: item.sequence_number,
            is_bookmark,
            chars: text.chars().count(),
        });

        (
            Ok(PageResult {
                item_id: item.id,
                sequence_number: item.sequence_number,
                text,
                is_bookmark,
            }),
            failed_attempts,
        )
    }

    async fn record_failure(&self, item: &WorkItem, error: &str) {
        if let Err(e) = self.items.record_failures(item.id, 1, error).await {
            warn!(
                "Failed to record failures for page #{}: {}",
                item.sequence_number, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::pipeline::testing::{reviewed_pages, ScriptedClient};
    use crate::repository::context::testing::setup_test_db;

    fn pool(ctx: &crate::repository::DbContext, client: ScriptedClient) -> WorkerPool {
        pool_with(ctx, client, Duration::from_millis(1), EventBus::default())
    }

    fn pool_with(
        ctx: &crate::repository::DbContext,
        client: ScriptedClient,
        base_delay: Duration,
        events: EventBus,
    ) -> WorkerPool {
        WorkerPool::new(
            ctx.work_items(),
            Arc::new(client),
            RetryPolicy::new(3, base_delay),
            ClaimOptions::new(Duration::from_secs(600)),
            "BOOKMARK",
            events,
        )
    }

    #[tokio::test]
    async fn test_all_items_reach_result_map() {
        let (ctx, _dir) = setup_test_db().await;
        reviewed_pages(&ctx, &["one", "BOOKMARK", "two", "three"]).await;
        let opts = ClaimOptions::new(Duration::from_secs(600));
        let batch = ctx.work_items().claim_batch(10, &opts).await.unwrap();

        let results = Arc::new(ResultMap::new());
        let credentials = vec![
            Credential::new(0, vec!["a".into()]),
            Credential::new(1, vec!["b".into()]),
        ];
        let report = pool(&ctx, ScriptedClient::default())
            .run(batch, &credentials, results.clone(), &CancellationToken::new())
            .await;

        assert_eq!(report.succeeded, 4);
        assert!(report.leftover.is_empty());
        assert_eq!(results.len(), 4);
        assert!(results.get(2).unwrap().is_bookmark);
        assert_eq!(results.get(4).unwrap().text, "three");

        let item = ctx.work_items().get_by_sequence(3).await.unwrap().unwrap();
        assert!(item.processed);
        assert!(!item.in_flight);
    }

    #[tokio::test]
    async fn test_failing_credential_retires_and_requeues() {
        let (ctx, _dir) = setup_test_db().await;
        reviewed_pages(&ctx, &["p1", "p2"]).await;
        let opts = ClaimOptions::new(Duration::from_secs(600));
        let batch = ctx.work_items().claim_batch(10, &opts).await.unwrap();

        let results = Arc::new(ResultMap::new());
        let credentials = vec![Credential::new(0, vec!["bad".into()])];
        let client = ScriptedClient::default().failing_credential(0);
        let report = pool(&ctx, client)
            .run(batch, &credentials, results.clone(), &CancellationToken::new())
            .await;

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed_attempts, 3);
        assert_eq!(report.retired_workers, 1);
        assert_eq!(report.leftover.len(), 2);
        assert!(results.is_empty());

        // Both pages are eligible again; the first one carries the failures.
        let first = ctx.work_items().get_by_sequence(1).await.unwrap().unwrap();
        assert_eq!(first.failure_count, 3);
        assert!(!first.in_flight);
        let second = ctx.work_items().get_by_sequence(2).await.unwrap().unwrap();
        assert_eq!(second.failure_count, 0);
        assert!(!second.in_flight);
        assert_eq!(ctx.work_items().claim_batch(10, &opts).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_recorded_before_backoff() {
        let (ctx, _dir) = setup_test_db().await;
        reviewed_pages(&ctx, &["p1"]).await;
        let opts = ClaimOptions::new(Duration::from_secs(600));
        let batch = ctx.work_items().claim_batch(10, &opts).await.unwrap();

        let client = ScriptedClient::default().failing_credential(0);
        let pool = pool_with(&ctx, client, Duration::from_millis(200), EventBus::default());
        let credentials = [Credential::new(0, vec!["bad".into()])];
        let cancel = CancellationToken::new();

        // Look at the row during the first backoff sleep.
        let during = async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            ctx.work_items().get_by_sequence(1).await.unwrap().unwrap()
        };
        let (report, during) = tokio::join!(
            pool.run(batch, &credentials, Arc::new(ResultMap::new()), &cancel),
            during
        );

        assert_eq!(during.failure_count, 1);
        assert_eq!(
            during.last_error.as_deref(),
            Some("OCR service error: 503 - unavailable")
        );
        assert_eq!(report.failed_attempts, 3);
        let after = ctx.work_items().get_by_sequence(1).await.unwrap().unwrap();
        assert_eq!(after.failure_count, 3);
    }

    #[tokio::test]
    async fn test_final_attempt_reports_failure_not_retry() {
        let (ctx, _dir) = setup_test_db().await;
        reviewed_pages(&ctx, &["p1"]).await;
        let opts = ClaimOptions::new(Duration::from_secs(600));
        let batch = ctx.work_items().claim_batch(10, &opts).await.unwrap();

        let events = EventBus::default();
        let client = ScriptedClient::default().failing_credential(0);
        pool_with(&ctx, client, Duration::from_millis(1), events.clone())
            .run(
                batch,
                &[Credential::new(0, vec!["bad".into()])],
                Arc::new(ResultMap::new()),
                &CancellationToken::new(),
            )
            .await;

        let history = events.history();
        let retries: Vec<u32> = history
            .iter()
            .filter_map(|r| match r.event {
                PipelineEvent::ItemRetry { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1, 2]);
        assert!(history.iter().any(|r| matches!(
            r.event,
            PipelineEvent::ItemFailed {
                sequence_number: 1,
                attempts: 3,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_requeued_item_picked_up_by_healthy_worker() {
        let (ctx, _dir) = setup_test_db().await;
        let pages: Vec<String> = (1..=10).map(|n| format!("p{n}")).collect();
        let pages: Vec<&str> = pages.iter().map(String::as_str).collect();
        reviewed_pages(&ctx, &pages).await;
        let opts = ClaimOptions::new(Duration::from_secs(600));
        let batch = ctx.work_items().claim_batch(20, &opts).await.unwrap();

        let results = Arc::new(ResultMap::new());
        let credentials = vec![
            Credential::new(0, vec!["bad".into()]),
            Credential::new(1, vec!["good".into()]),
        ];
        // The healthy worker is still busy with the tail when page 1 comes back.
        let client = ScriptedClient::default()
            .failing_credential(0)
            .with_delay(Duration::from_millis(10));
        let report = pool(&ctx, client)
            .run(batch, &credentials, results.clone(), &CancellationToken::new())
            .await;

        assert_eq!(report.retired_workers, 1);
        assert_eq!(report.succeeded, 10);
        assert!(report.leftover.is_empty());
        for seq in 1..=10 {
            assert!(results.get(seq).is_some(), "page {seq} lost");
        }
    }

    #[tokio::test]
    async fn test_cancelled_pool_releases_claims() {
        let (ctx, _dir) = setup_test_db().await;
        reviewed_pages(&ctx, &["p1", "p2"]).await;
        let opts = ClaimOptions::new(Duration::from_secs(600));
        let batch = ctx.work_items().claim_batch(10, &opts).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = pool(&ctx, ScriptedClient::default())
            .run(
                batch,
                &[Credential::new(0, vec!["k".into()])],
                Arc::new(ResultMap::new()),
                &cancel,
            )
            .await;

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.leftover.len(), 2);
        let counts = ctx.work_items().counts().await.unwrap();
        assert_eq!(counts.in_flight, 0);
        assert_eq!(counts.pending, 2);
    }
}
