//! Work item repository: intake, claiming, completion and recovery.
//!
//! Sequence allocation and claiming each run inside a transaction holding
//! their advisory lock, so concurrent processes never hand out the same
//! sequence number or claim the same page twice. Plain status updates on a
//! single row run without a lock.

use std::time::Duration;

use diesel::dsl::{self, count_star};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::models::{NewWorkItem, WorkItemRecord};
use super::pool::{DbError, DbPool, LockKey};
use super::util::to_diesel_error;
use super::{now_timestamp, timestamp_before};
use crate::models::{IntakeFile, WorkItem, WorkItemCounts};
use crate::schema::work_items;
use crate::storage::{detect_mime, PageStore};
use crate::{with_advisory_lock, with_conn};

/// Identity of the claimant and how long its claims stay valid.
#[derive(Debug, Clone)]
pub struct ClaimOptions {
    pub claimant: String,
    /// A claim older than this is treated as abandoned.
    pub stuck_timeout: Duration,
}

impl ClaimOptions {
    pub fn new(stuck_timeout: Duration) -> Self {
        Self {
            claimant: default_claimant(),
            stuck_timeout,
        }
    }
}

/// `hostname:pid` of the current process.
pub fn default_claimant() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}:{}", host, std::process::id())
}

/// Diesel-based work item repository.
#[derive(Clone)]
pub struct WorkItemRepository {
    pool: DbPool,
    store: PageStore,
}

impl WorkItemRepository {
    pub fn new(pool: DbPool, store: PageStore) -> Self {
        Self { pool, store }
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    /// Store uploaded pages and assign them consecutive sequence numbers.
    ///
    /// Reading the current maximum, writing the images and inserting the rows
    /// all happen under the sequence allocation lock.
    pub async fn intake(&self, files: Vec<IntakeFile>) -> Result<Vec<WorkItem>, DbError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.clone();
        let now = now_timestamp();

        let records = with_advisory_lock!(self.pool, LockKey::SequenceAllocation, conn => {
            let current: Option<i64> = work_items::table
                .select(dsl::max(work_items::sequence_number))
                .first(conn)
                .await?;
            let first = current.unwrap_or(0) + 1;

            for (offset, file) in files.iter().enumerate() {
                let sequence_number = first + offset as i64;
                let mime_type = detect_mime(&file.data);
                let storage_path =
                    PageStore::raw_path(sequence_number, &file.original_name, mime_type);
                store
                    .write(&storage_path, &file.data)
                    .await
                    .map_err(to_diesel_error)?;

                diesel::insert_into(work_items::table)
                    .values(NewWorkItem {
                        sequence_number,
                        original_name: &file.original_name,
                        storage_path: &storage_path,
                        mime_type,
                        size_bytes: file.data.len() as i64,
                        created_at: &now,
                    })
                    .execute(conn)
                    .await?;
            }

            let last = first + files.len() as i64 - 1;
            work_items::table
                .filter(work_items::sequence_number.between(first, last))
                .order(work_items::sequence_number.asc())
                .load::<WorkItemRecord>(conn)
                .await
        })?;

        tracing::info!(
            "Intake stored {} page(s) starting at sequence {}",
            records.len(),
            records.iter().next().map(|r| r.sequence_number).unwrap_or_default()
        );
        Ok(records.into_iter().map(WorkItem::from).collect())
    }

    /// Claim the lowest-sequence eligible item.
    pub async fn claim_next(&self, options: &ClaimOptions) -> Result<Option<WorkItem>, DbError> {
        Ok(self.claim_batch(1, options).await?.into_iter().next())
    }

    /// Claim up to `limit` eligible items in sequence order.
    pub async fn claim_batch(
        &self,
        limit: i64,
        options: &ClaimOptions,
    ) -> Result<Vec<WorkItem>, DbError> {
        self.claim_up_to(None, limit, options).await
    }

    /// Claim eligible items with sequence numbers up to `max_sequence`.
    ///
    /// An item is eligible when it is reviewed, unprocessed, not consumed,
    /// not held by a live claim, and lies before the first unreviewed page.
    pub async fn claim_up_to(
        &self,
        max_sequence: Option<i64>,
        limit: i64,
        options: &ClaimOptions,
    ) -> Result<Vec<WorkItem>, DbError> {
        let cutoff = timestamp_before(options.stuck_timeout);
        let claimant = options.claimant.clone();
        let now = now_timestamp();

        let records = with_advisory_lock!(self.pool, LockKey::JobClaim, conn => {
            let barrier: Option<i64> = work_items::table
                .filter(work_items::consumed_at.is_null())
                .filter(work_items::is_reviewed.eq(false))
                .select(dsl::min(work_items::sequence_number))
                .first(conn)
                .await?;

            let mut query = work_items::table
                .filter(work_items::processed.eq(false))
                .filter(work_items::is_reviewed.eq(true))
                .filter(work_items::consumed_at.is_null())
                .filter(
                    work_items::in_flight
                        .eq(false)
                        .or(work_items::claimed_at.assume_not_null().lt(cutoff.as_str())),
                )
                .order(work_items::sequence_number.asc())
                .limit(limit)
                .into_boxed();
            if let Some(barrier) = barrier {
                query = query.filter(work_items::sequence_number.lt(barrier));
            }
            if let Some(max_sequence) = max_sequence {
                query = query.filter(work_items::sequence_number.le(max_sequence));
            }

            let mut records: Vec<WorkItemRecord> = query.load(conn).await?;
            let ids: Vec<i32> = records.iter().map(|r| r.id).collect();
            if !ids.is_empty() {
                diesel::update(work_items::table.filter(work_items::id.eq_any(ids)))
                    .set((
                        work_items::in_flight.eq(true),
                        work_items::claimed_at.eq(Some(now.as_str())),
                        work_items::claimed_by.eq(Some(claimant.as_str())),
                    ))
                    .execute(conn)
                    .await?;
            }
            for record in &mut records {
                record.in_flight = true;
                record.claimed_at = Some(now.clone());
                record.claimed_by = Some(claimant.clone());
            }
            Ok(records)
        })?;

        if !records.is_empty() {
            tracing::debug!("Claimed {} work item(s)", records.len());
        }
        Ok(records.into_iter().map(WorkItem::from).collect())
    }

    /// Re-claim one specific item that was released back to the queue.
    ///
    /// The item must still be eligible the way `claim_up_to` defines it.
    /// Returns false when it was processed, claimed elsewhere, un-reviewed,
    /// or now lies behind an unreviewed page.
    pub async fn reclaim(&self, item_id: i32, options: &ClaimOptions) -> Result<bool, DbError> {
        let cutoff = timestamp_before(options.stuck_timeout);
        let claimant = options.claimant.clone();
        let now = now_timestamp();

        with_advisory_lock!(self.pool, LockKey::JobClaim, conn => {
            let barrier: Option<i64> = work_items::table
                .filter(work_items::consumed_at.is_null())
                .filter(work_items::is_reviewed.eq(false))
                .select(dsl::min(work_items::sequence_number))
                .first(conn)
                .await?;

            let rows = diesel::update(
                work_items::table
                    .filter(work_items::id.eq(item_id))
                    .filter(work_items::sequence_number.lt(barrier.unwrap_or(i64::MAX)))
                    .filter(work_items::is_reviewed.eq(true))
                    .filter(work_items::processed.eq(false))
                    .filter(work_items::consumed_at.is_null())
                    .filter(
                        work_items::in_flight
                            .eq(false)
                            .or(work_items::claimed_at.assume_not_null().lt(cutoff.as_str())),
                    ),
            )
            .set((
                work_items::in_flight.eq(true),
                work_items::claimed_at.eq(Some(now.as_str())),
                work_items::claimed_by.eq(Some(claimant.as_str())),
            ))
            .execute(conn)
            .await?;
            Ok(rows == 1)
        })
    }

    /// Persist extracted text. This is the only place `processed` becomes true.
    pub async fn mark_completed(
        &self,
        item_id: i32,
        text: &str,
        is_bookmark: bool,
    ) -> Result<(), DbError> {
        let now = now_timestamp();
        with_conn!(self.pool, conn => {
            diesel::update(work_items::table.find(item_id))
                .set((
                    work_items::processed.eq(true),
                    work_items::processed_at.eq(Some(now.as_str())),
                    work_items::in_flight.eq(false),
                    work_items::extracted_text.eq(Some(text)),
                    work_items::is_bookmark.eq(is_bookmark),
                ))
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    /// Add `failures` to the failure counter and record the latest error.
    pub async fn record_failures(
        &self,
        item_id: i32,
        failures: i32,
        last_error: &str,
    ) -> Result<(), DbError> {
        if failures <= 0 {
            return Ok(());
        }
        with_conn!(self.pool, conn => {
            diesel::update(work_items::table.find(item_id))
                .set((
                    work_items::failure_count.eq(work_items::failure_count + failures),
                    work_items::last_error.eq(Some(last_error)),
                ))
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    /// Drop the claim on one item so it becomes eligible again.
    pub async fn release_claim(&self, item_id: i32) -> Result<(), DbError> {
        self.release_claims(&[item_id]).await.map(|_| ())
    }

    /// Drop the claims on several items.
    pub async fn release_claims(&self, item_ids: &[i32]) -> Result<usize, DbError> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let ids = item_ids.to_vec();
        with_conn!(self.pool, conn => {
            diesel::update(
                work_items::table
                    .filter(work_items::id.eq_any(ids))
                    .filter(work_items::processed.eq(false)),
            )
            .set(work_items::in_flight.eq(false))
            .execute(&mut conn)
            .await
        })
    }

    /// Release claims older than `timeout`. Returns how many were released.
    pub async fn reset_stuck(&self, timeout: Duration) -> Result<usize, DbError> {
        let cutoff = timestamp_before(timeout);
        with_conn!(self.pool, conn => {
            diesel::update(
                work_items::table
                    .filter(work_items::in_flight.eq(true))
                    .filter(work_items::claimed_at.lt(cutoff.as_str())),
            )
            .set(work_items::in_flight.eq(false))
            .execute(&mut conn)
            .await
        })
    }

    /// Unconsumed reviewed items in sequence order, up to the first unreviewed one.
    ///
    /// This is the list the grouping engine walks.
    pub async fn grouping_window(&self, limit: i64) -> Result<Vec<WorkItem>, DbError> {
        with_conn!(self.pool, conn => {
            let barrier: Option<i64> = work_items::table
                .filter(work_items::consumed_at.is_null())
                .filter(work_items::is_reviewed.eq(false))
                .select(dsl::min(work_items::sequence_number))
                .first(&mut conn)
                .await?;

            let mut query = work_items::table
                .filter(work_items::consumed_at.is_null())
                .filter(work_items::is_reviewed.eq(true))
                .order(work_items::sequence_number.asc())
                .limit(limit)
                .into_boxed();
            if let Some(barrier) = barrier {
                query = query.filter(work_items::sequence_number.lt(barrier));
            }
            query
                .load::<WorkItemRecord>(&mut conn)
                .await
                .map(|records| records.into_iter().map(WorkItem::from).collect())
        })
    }

    /// Whether any unconsumed item comes after `sequence_number`.
    pub async fn has_unconsumed_after(&self, sequence_number: i64) -> Result<bool, DbError> {
        with_conn!(self.pool, conn => {
            let count: i64 = work_items::table
                .filter(work_items::consumed_at.is_null())
                .filter(work_items::sequence_number.gt(sequence_number))
                .select(count_star())
                .first(&mut conn)
                .await?;
            Ok(count > 0)
        })
    }

    pub async fn get(&self, item_id: i32) -> Result<Option<WorkItem>, DbError> {
        with_conn!(self.pool, conn => {
            work_items::table
                .find(item_id)
                .first::<WorkItemRecord>(&mut conn)
                .await
                .optional()
                .map(|opt| opt.map(WorkItem::from))
        })
    }

    pub async fn get_by_sequence(&self, sequence_number: i64) -> Result<Option<WorkItem>, DbError> {
        with_conn!(self.pool, conn => {
            work_items::table
                .filter(work_items::sequence_number.eq(sequence_number))
                .first::<WorkItemRecord>(&mut conn)
                .await
                .optional()
                .map(|opt| opt.map(WorkItem::from))
        })
    }

    /// Items in sequence order, starting after `after_sequence`.
    pub async fn list(&self, after_sequence: i64, limit: i64) -> Result<Vec<WorkItem>, DbError> {
        with_conn!(self.pool, conn => {
            work_items::table
                .filter(work_items::sequence_number.gt(after_sequence))
                .order(work_items::sequence_number.asc())
                .limit(limit)
                .load::<WorkItemRecord>(&mut conn)
                .await
                .map(|records| records.into_iter().map(WorkItem::from).collect())
        })
    }

    /// Set the review flag on the given sequence numbers.
    pub async fn set_reviewed(
        &self,
        sequence_numbers: &[i64],
        reviewed: bool,
    ) -> Result<usize, DbError> {
        if sequence_numbers.is_empty() {
            return Ok(0);
        }
        let sequences = sequence_numbers.to_vec();
        with_conn!(self.pool, conn => {
            diesel::update(
                work_items::table.filter(work_items::sequence_number.eq_any(sequences)),
            )
            .set(work_items::is_reviewed.eq(reviewed))
            .execute(&mut conn)
            .await
        })
    }

    /// Set the review flag on every unconsumed item.
    pub async fn set_all_reviewed(&self, reviewed: bool) -> Result<usize, DbError> {
        with_conn!(self.pool, conn => {
            diesel::update(work_items::table.filter(work_items::consumed_at.is_null()))
                .set(work_items::is_reviewed.eq(reviewed))
                .execute(&mut conn)
                .await
        })
    }

    /// Store an edited image for a page and point the item at it.
    ///
    /// Returns the stored relative path, or None if no such item exists.
    pub async fn attach_edited_image(
        &self,
        sequence_number: i64,
        original_name: &str,
        data: &[u8],
    ) -> Result<Option<String>, DbError> {
        if self.get_by_sequence(sequence_number).await?.is_none() {
            return Ok(None);
        }
        let path = PageStore::edited_path(sequence_number, original_name, detect_mime(data));
        self.store
            .write(&path, data)
            .await
            .map_err(to_diesel_error)?;

        let stored = path.clone();
        with_conn!(self.pool, conn => {
            diesel::update(
                work_items::table.filter(work_items::sequence_number.eq(sequence_number)),
            )
            .set(work_items::edited_path.eq(Some(stored.as_str())))
            .execute(&mut conn)
            .await?;
            Ok(Some(path))
        })
    }

    /// Counters for status reporting.
    pub async fn counts(&self) -> Result<WorkItemCounts, DbError> {
        with_conn!(self.pool, conn => {
            let total: i64 = work_items::table
                .select(count_star())
                .first(&mut conn)
                .await?;
            let unreviewed: i64 = work_items::table
                .filter(work_items::is_reviewed.eq(false))
                .filter(work_items::consumed_at.is_null())
                .select(count_star())
                .first(&mut conn)
                .await?;
            let pending: i64 = work_items::table
                .filter(work_items::is_reviewed.eq(true))
                .filter(work_items::processed.eq(false))
                .filter(work_items::in_flight.eq(false))
                .filter(work_items::consumed_at.is_null())
                .select(count_star())
                .first(&mut conn)
                .await?;
            let in_flight: i64 = work_items::table
                .filter(work_items::in_flight.eq(true))
                .select(count_star())
                .first(&mut conn)
                .await?;
            let processed: i64 = work_items::table
                .filter(work_items::processed.eq(true))
                .select(count_star())
                .first(&mut conn)
                .await?;
            let consumed: i64 = work_items::table
                .filter(work_items::consumed_at.is_not_null())
                .select(count_star())
                .first(&mut conn)
                .await?;
            let bookmarks: i64 = work_items::table
                .filter(work_items::is_bookmark.eq(true))
                .select(count_star())
                .first(&mut conn)
                .await?;
            let failing: i64 = work_items::table
                .filter(work_items::processed.eq(false))
                .filter(work_items::failure_count.gt(0))
                .select(count_star())
                .first(&mut conn)
                .await?;

            Ok(WorkItemCounts {
                total,
                unreviewed,
                pending,
                in_flight,
                processed,
                consumed,
                bookmarks,
                failing,
            })
        })
    }

    #[cfg(test)]
    pub(crate) async fn backdate_claim(&self, item_id: i32, age: Duration) -> Result<(), DbError> {
        let claimed_at = timestamp_before(age);
        with_conn!(self.pool, conn => {
            diesel::update(work_items::table.find(item_id))
                .set(work_items::claimed_at.eq(Some(claimed_at.as_str())))
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::context::testing::setup_test_db;

    fn pages(names: &[&str]) -> Vec<IntakeFile> {
        names
            .iter()
            .map(|name| IntakeFile::new(format!("{name}.png"), name.as_bytes().to_vec()))
            .collect()
    }

    fn options() -> ClaimOptions {
        ClaimOptions {
            claimant: "test-host:1".to_string(),
            stuck_timeout: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn test_intake_assigns_consecutive_sequences() {
        let (ctx, _dir) = setup_test_db().await;
        let repo = ctx.work_items();

        let first = repo.intake(pages(&["a", "b"])).await.unwrap();
        let second = repo.intake(pages(&["c"])).await.unwrap();

        let sequences: Vec<i64> = first
            .iter()
            .chain(second.iter())
            .map(|i| i.sequence_number)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(second[0].storage_path, "raw/3.png");
        assert_eq!(repo.store().read("raw/1.png").await.unwrap(), b"a");
        assert!(!first[0].processed && !first[0].in_flight);
    }

    #[tokio::test]
    async fn test_concurrent_intake_never_duplicates_sequences() {
        let (ctx, _dir) = setup_test_db().await;

        let mut handles = Vec::new();
        for worker in 0..4 {
            let repo = ctx.work_items();
            handles.push(tokio::spawn(async move {
                let names: Vec<String> = (0..5).map(|n| format!("w{worker}-{n}")).collect();
                let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                repo.intake(pages(&refs)).await.unwrap()
            }));
        }
        let mut sequences = Vec::new();
        for handle in handles {
            sequences.extend(handle.await.unwrap().into_iter().map(|i| i.sequence_number));
        }
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_claim_requires_review_and_stops_at_unreviewed_page() {
        let (ctx, _dir) = setup_test_db().await;
        let repo = ctx.work_items();
        repo.intake(pages(&["a", "b", "c", "d"])).await.unwrap();

        assert!(repo.claim_next(&options()).await.unwrap().is_none());

        // Page 3 is still in review, so 4 must wait even though it is reviewed.
        repo.set_reviewed(&[1, 2, 4], true).await.unwrap();
        let claimed = repo.claim_batch(10, &options()).await.unwrap();
        let sequences: Vec<i64> = claimed.iter().map(|i| i.sequence_number).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert!(claimed.iter().all(|i| i.in_flight));
        assert_eq!(claimed[0].claimed_by.as_deref(), Some("test-host:1"));
    }

    #[tokio::test]
    async fn test_claimed_items_are_not_claimed_again() {
        let (ctx, _dir) = setup_test_db().await;
        let repo = ctx.work_items();
        repo.intake(pages(&["a", "b"])).await.unwrap();
        repo.set_all_reviewed(true).await.unwrap();

        let first = repo.claim_next(&options()).await.unwrap().unwrap();
        let second = repo.claim_next(&options()).await.unwrap().unwrap();
        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
        assert!(repo.claim_next(&options()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let (ctx, _dir) = setup_test_db().await;
        let repo = ctx.work_items();
        let names: Vec<String> = (0..12).map(|n| format!("p{n}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        repo.intake(pages(&refs)).await.unwrap();
        repo.set_all_reviewed(true).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let repo = ctx.work_items();
            handles.push(tokio::spawn(async move {
                repo.claim_batch(5, &options()).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.extend(handle.await.unwrap().into_iter().map(|i| i.id));
        }
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert_eq!(total, 12);
    }

    #[tokio::test]
    async fn test_stale_claim_is_claimable_again() {
        let (ctx, _dir) = setup_test_db().await;
        let repo = ctx.work_items();
        repo.intake(pages(&["a"])).await.unwrap();
        repo.set_all_reviewed(true).await.unwrap();

        let item = repo.claim_next(&options()).await.unwrap().unwrap();
        assert!(repo.claim_next(&options()).await.unwrap().is_none());

        repo.backdate_claim(item.id, Duration::from_secs(601))
            .await
            .unwrap();
        let again = repo.claim_next(&options()).await.unwrap().unwrap();
        assert_eq!(again.id, item.id);
    }

    #[tokio::test]
    async fn test_reclaim_honours_review_barrier() {
        let (ctx, _dir) = setup_test_db().await;
        let repo = ctx.work_items();
        repo.intake(pages(&["a", "b", "c"])).await.unwrap();
        repo.set_all_reviewed(true).await.unwrap();
        let claimed = repo.claim_batch(3, &options()).await.unwrap();
        let (b, c) = (claimed[1].id, claimed[2].id);
        repo.release_claims(&[b, c]).await.unwrap();

        // Page 2 goes back to review: it and everything after it must wait.
        repo.set_reviewed(&[2], false).await.unwrap();
        assert!(!repo.reclaim(b, &options()).await.unwrap());
        assert!(!repo.reclaim(c, &options()).await.unwrap());
        assert!(!repo.get(c).await.unwrap().unwrap().in_flight);

        repo.set_reviewed(&[2], true).await.unwrap();
        assert!(repo.reclaim(b, &options()).await.unwrap());
        assert!(repo.reclaim(c, &options()).await.unwrap());
        assert!(!repo.reclaim(c, &options()).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_stuck_respects_timeout() {
        let (ctx, _dir) = setup_test_db().await;
        let repo = ctx.work_items();
        repo.intake(pages(&["a", "b"])).await.unwrap();
        repo.set_all_reviewed(true).await.unwrap();
        let claimed = repo.claim_batch(2, &options()).await.unwrap();

        repo.backdate_claim(claimed[0].id, Duration::from_secs(9 * 60))
            .await
            .unwrap();
        repo.backdate_claim(claimed[1].id, Duration::from_secs(11 * 60))
            .await
            .unwrap();

        let reset = repo.reset_stuck(Duration::from_secs(600)).await.unwrap();
        assert_eq!(reset, 1);
        assert!(repo.get(claimed[0].id).await.unwrap().unwrap().in_flight);
        assert!(!repo.get(claimed[1].id).await.unwrap().unwrap().in_flight);
    }

    #[tokio::test]
    async fn test_failures_accumulate_and_completion_clears_claim() {
        let (ctx, _dir) = setup_test_db().await;
        let repo = ctx.work_items();
        repo.intake(pages(&["a"])).await.unwrap();
        repo.set_all_reviewed(true).await.unwrap();
        let item = repo.claim_next(&options()).await.unwrap().unwrap();

        repo.record_failures(item.id, 2, "timeout").await.unwrap();
        repo.record_failures(item.id, 1, "HTTP 502").await.unwrap();
        repo.release_claim(item.id).await.unwrap();
        let failed = repo.get(item.id).await.unwrap().unwrap();
        assert_eq!(failed.failure_count, 3);
        assert_eq!(failed.last_error.as_deref(), Some("HTTP 502"));
        assert!(!failed.in_flight);

        assert!(repo.reclaim(item.id, &options()).await.unwrap());
        repo.mark_completed(item.id, "page text", false).await.unwrap();
        let done = repo.get(item.id).await.unwrap().unwrap();
        assert!(done.processed && !done.in_flight);
        assert_eq!(done.extracted_text.as_deref(), Some("page text"));
        assert!(!repo.reclaim(item.id, &options()).await.unwrap());
    }

    #[tokio::test]
    async fn test_grouping_window_and_tail_detection() {
        let (ctx, _dir) = setup_test_db().await;
        let repo = ctx.work_items();
        repo.intake(pages(&["a", "b", "c"])).await.unwrap();
        repo.set_reviewed(&[1, 2], true).await.unwrap();

        let window = repo.grouping_window(100).await.unwrap();
        assert_eq!(window.len(), 2);
        assert!(repo.has_unconsumed_after(2).await.unwrap());
        assert!(!repo.has_unconsumed_after(3).await.unwrap());
    }

    #[tokio::test]
    async fn test_attach_edited_image() {
        let (ctx, _dir) = setup_test_db().await;
        let repo = ctx.work_items();
        repo.intake(pages(&["a"])).await.unwrap();

        let path = repo
            .attach_edited_image(1, "fixed.png", b"cleaned")
            .await
            .unwrap();
        assert_eq!(path.as_deref(), Some("edited/1.png"));
        assert!(repo
            .attach_edited_image(9, "x.png", b"x")
            .await
            .unwrap()
            .is_none());

        repo.set_reviewed(&[1], true).await.unwrap();
        let item = repo.get_by_sequence(1).await.unwrap().unwrap();
        assert_eq!(item.image_path(), "edited/1.png");
    }

    #[tokio::test]
    async fn test_counts() {
        let (ctx, _dir) = setup_test_db().await;
        let repo = ctx.work_items();
        repo.intake(pages(&["a", "b", "c"])).await.unwrap();
        repo.set_reviewed(&[1, 2], true).await.unwrap();
        let item = repo.claim_next(&options()).await.unwrap().unwrap();
        repo.mark_completed(item.id, "BOOKMARK", true).await.unwrap();

        let counts = repo.counts().await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.unreviewed, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processed, 1);
        assert_eq!(counts.bookmarks, 1);
        assert_eq!(counts.in_flight, 0);
    }
}
