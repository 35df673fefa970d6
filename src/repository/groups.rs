//! Page group repository.
//!
//! Groups are written only by the grouping engine. Every write runs under
//! the grouping lock and only touches pages that are not consumed yet, so
//! two engines on one database cannot place the same page twice. Writes are
//! idempotent so the engine can retry a failed commit at the same cursor.

use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::models::{NewPageGroup, PageGroupRecord, WorkItemRecord};
use super::now_timestamp;
use super::pool::{DbError, DbPool, LockKey};
use crate::models::{GroupCounts, PageGroup, WorkItem};
use crate::schema::{page_groups, work_items};
use crate::{with_advisory_lock, with_conn};

/// Outcome of [`GroupRepository::open_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAllocation {
    Created(i32),
    /// An empty open group was already there.
    Existing(i32),
    /// Another engine already grouped the page or holds an open group.
    Taken,
}

/// Diesel-based page group repository.
#[derive(Clone)]
pub struct GroupRepository {
    pool: DbPool,
}

impl GroupRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get an empty open group for `first_item`, the page about to start it.
    ///
    /// An empty open group left by an earlier call is handed back instead of
    /// allocating another one, so a retried call never leaves a stray group.
    /// If `first_item` was already grouped, or an open group already holds
    /// pages, another engine got there first and nothing is written.
    pub async fn open_group(&self, first_item: i32) -> Result<GroupAllocation, DbError> {
        let now = now_timestamp();
        with_advisory_lock!(self.pool, LockKey::Grouping, conn => {
            let consumed: Option<Option<String>> = work_items::table
                .find(first_item)
                .select(work_items::consumed_at)
                .first::<Option<String>>(conn)
                .await
                .optional()?;
            if matches!(consumed, Some(Some(_))) {
                return Ok(GroupAllocation::Taken);
            }

            let open: Option<(i32, i32)> = page_groups::table
                .filter(page_groups::is_complete.eq(false))
                .order(page_groups::id.desc())
                .select((page_groups::id, page_groups::page_count))
                .first::<(i32, i32)>(conn)
                .await
                .optional()?;
            match open {
                Some((id, 0)) => Ok(GroupAllocation::Existing(id)),
                Some(_) => Ok(GroupAllocation::Taken),
                None => {
                    let id = diesel::insert_into(page_groups::table)
                        .values(NewPageGroup {
                            is_complete: false,
                            page_count: 0,
                            created_at: &now,
                        })
                        .returning(page_groups::id)
                        .get_result::<i32>(conn)
                        .await?;
                    Ok(GroupAllocation::Created(id))
                }
            }
        })
    }

    /// Place a content page in a group and mark it consumed.
    ///
    /// Returns true when the page now holds exactly this placement, including
    /// when an earlier attempt already wrote it. Returns false when the page
    /// was grouped somewhere else.
    pub async fn assign_page(
        &self,
        item_id: i32,
        group_id: i32,
        position: i32,
    ) -> Result<bool, DbError> {
        let now = now_timestamp();
        with_advisory_lock!(self.pool, LockKey::Grouping, conn => {
            let rows = diesel::update(
                work_items::table
                    .filter(work_items::id.eq(item_id))
                    .filter(work_items::consumed_at.is_null()),
            )
            .set((
                work_items::group_id.eq(Some(group_id)),
                work_items::position_in_group.eq(Some(position)),
                work_items::consumed_at.eq(Some(now.as_str())),
            ))
            .execute(conn)
            .await?;

            if rows == 0 {
                let placed: Option<(Option<i32>, Option<i32>)> = work_items::table
                    .find(item_id)
                    .select((work_items::group_id, work_items::position_in_group))
                    .first::<(Option<i32>, Option<i32>)>(conn)
                    .await
                    .optional()?;
                return Ok(placed == Some((Some(group_id), Some(position))));
            }

            diesel::update(
                page_groups::table
                    .filter(page_groups::id.eq(group_id))
                    .filter(page_groups::page_count.lt(position)),
            )
            .set(page_groups::page_count.eq(position))
            .execute(conn)
            .await?;
            Ok(true)
        })
    }

    /// Mark a bookmark page consumed. Bookmarks never belong to a group.
    ///
    /// Returns false if the page was already consumed.
    pub async fn consume_bookmark(&self, item_id: i32) -> Result<bool, DbError> {
        let now = now_timestamp();
        with_advisory_lock!(self.pool, LockKey::Grouping, conn => {
            let rows = diesel::update(
                work_items::table
                    .filter(work_items::id.eq(item_id))
                    .filter(work_items::consumed_at.is_null()),
            )
            .set((
                work_items::consumed_at.eq(Some(now.as_str())),
                work_items::group_id.eq(None::<i32>),
                work_items::position_in_group.eq(None::<i32>),
            ))
            .execute(conn)
            .await?;
            Ok(rows > 0)
        })
    }

    /// Close a group. Returns false if it was already closed.
    pub async fn close_group(&self, group_id: i32) -> Result<bool, DbError> {
        let now = now_timestamp();
        with_advisory_lock!(self.pool, LockKey::Grouping, conn => {
            let rows = diesel::update(
                page_groups::table
                    .filter(page_groups::id.eq(group_id))
                    .filter(page_groups::is_complete.eq(false)),
            )
            .set((
                page_groups::is_complete.eq(true),
                page_groups::completed_at.eq(Some(now.as_str())),
            ))
            .execute(conn)
            .await?;
            Ok(rows > 0)
        })
    }

    /// The most recent group still open, if any.
    pub async fn latest_open(&self) -> Result<Option<PageGroup>, DbError> {
        with_conn!(self.pool, conn => {
            page_groups::table
                .filter(page_groups::is_complete.eq(false))
                .order(page_groups::id.desc())
                .first::<PageGroupRecord>(&mut conn)
                .await
                .optional()
                .map(|opt| opt.map(PageGroup::from))
        })
    }

    pub async fn get(&self, group_id: i32) -> Result<Option<PageGroup>, DbError> {
        with_conn!(self.pool, conn => {
            page_groups::table
                .find(group_id)
                .first::<PageGroupRecord>(&mut conn)
                .await
                .optional()
                .map(|opt| opt.map(PageGroup::from))
        })
    }

    /// Groups in allocation order.
    pub async fn list(&self, limit: i64) -> Result<Vec<PageGroup>, DbError> {
        with_conn!(self.pool, conn => {
            page_groups::table
                .order(page_groups::id.asc())
                .limit(limit)
                .load::<PageGroupRecord>(&mut conn)
                .await
                .map(|records| records.into_iter().map(PageGroup::from).collect())
        })
    }

    /// Member pages ordered by position.
    pub async fn members(&self, group_id: i32) -> Result<Vec<WorkItem>, DbError> {
        with_conn!(self.pool, conn => {
            work_items::table
                .filter(work_items::group_id.eq(group_id))
                .order(work_items::position_in_group.asc())
                .load::<WorkItemRecord>(&mut conn)
                .await
                .map(|records| records.into_iter().map(WorkItem::from).collect())
        })
    }

    pub async fn counts(&self) -> Result<GroupCounts, DbError> {
        with_conn!(self.pool, conn => {
            let complete: i64 = page_groups::table
                .filter(page_groups::is_complete.eq(true))
                .select(count_star())
                .first(&mut conn)
                .await?;
            let open: i64 = page_groups::table
                .filter(page_groups::is_complete.eq(false))
                .select(count_star())
                .first(&mut conn)
                .await?;
            Ok(GroupCounts { complete, open })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::GroupAllocation;
    use crate::models::IntakeFile;
    use crate::repository::context::testing::setup_test_db;

    fn pages(names: &[&str]) -> Vec<IntakeFile> {
        names
            .iter()
            .map(|n| IntakeFile::new(format!("{n}.png"), n.as_bytes().to_vec()))
            .collect()
    }

    #[tokio::test]
    async fn test_group_lifecycle() {
        let (ctx, _dir) = setup_test_db().await;
        let items = ctx.work_items();
        let groups = ctx.groups();
        let stored = items.intake(pages(&["a", "b"])).await.unwrap();

        let group_id = match groups.open_group(stored[0].id).await.unwrap() {
            GroupAllocation::Created(id) => id,
            other => panic!("expected a new group, got {other:?}"),
        };
        assert_eq!(groups.latest_open().await.unwrap().unwrap().id, group_id);

        assert!(groups.assign_page(stored[1].id, group_id, 2).await.unwrap());
        assert!(groups.assign_page(stored[0].id, group_id, 1).await.unwrap());
        // Retrying a commit must not change anything.
        assert!(groups.assign_page(stored[0].id, group_id, 1).await.unwrap());

        let members = groups.members(group_id).await.unwrap();
        let order: Vec<i64> = members.iter().map(|m| m.sequence_number).collect();
        assert_eq!(order, vec![1, 2]);
        assert!(members.iter().all(|m| m.is_consumed()));

        assert!(groups.close_group(group_id).await.unwrap());
        assert!(!groups.close_group(group_id).await.unwrap());
        let group = groups.get(group_id).await.unwrap().unwrap();
        assert!(group.is_complete);
        assert_eq!(group.page_count, 2);
        assert!(groups.latest_open().await.unwrap().is_none());

        let counts = groups.counts().await.unwrap();
        assert_eq!((counts.complete, counts.open), (1, 0));
    }

    #[tokio::test]
    async fn test_bookmark_consumed_without_group() {
        let (ctx, _dir) = setup_test_db().await;
        let stored = ctx.work_items().intake(pages(&["mark"])).await.unwrap();

        assert!(ctx.groups().consume_bookmark(stored[0].id).await.unwrap());
        assert!(!ctx.groups().consume_bookmark(stored[0].id).await.unwrap());

        let item = ctx.work_items().get(stored[0].id).await.unwrap().unwrap();
        assert!(item.is_consumed());
        assert!(item.group_id.is_none());
        assert!(ctx.groups().list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_group_reuses_empty_group() {
        let (ctx, _dir) = setup_test_db().await;
        let stored = ctx.work_items().intake(pages(&["a"])).await.unwrap();
        let groups = ctx.groups();

        // A second call after a lost reply hands back the same group.
        let first = groups.open_group(stored[0].id).await.unwrap();
        let second = groups.open_group(stored[0].id).await.unwrap();
        let GroupAllocation::Created(id) = first else {
            panic!("expected a new group, got {first:?}");
        };
        assert_eq!(second, GroupAllocation::Existing(id));
        assert_eq!(groups.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_writer_cannot_take_grouped_pages() {
        let (ctx, _dir) = setup_test_db().await;
        let stored = ctx.work_items().intake(pages(&["a", "b"])).await.unwrap();
        let groups = ctx.groups();

        let GroupAllocation::Created(id) = groups.open_group(stored[0].id).await.unwrap() else {
            panic!("expected a new group");
        };
        assert!(groups.assign_page(stored[0].id, id, 1).await.unwrap());

        // A stale writer sees the page as taken and cannot open a rival group.
        assert_eq!(
            groups.open_group(stored[0].id).await.unwrap(),
            GroupAllocation::Taken
        );
        assert_eq!(
            groups.open_group(stored[1].id).await.unwrap(),
            GroupAllocation::Taken
        );
        assert!(!groups.assign_page(stored[0].id, id + 1, 1).await.unwrap());
        assert!(!groups.assign_page(stored[0].id, id, 2).await.unwrap());
        assert!(!groups.consume_bookmark(stored[0].id).await.unwrap());

        let item = ctx.work_items().get(stored[0].id).await.unwrap().unwrap();
        assert_eq!((item.group_id, item.position_in_group), (Some(id), Some(1)));
        assert_eq!(groups.list(10).await.unwrap().len(), 1);
        assert_eq!(groups.get(id).await.unwrap().unwrap().page_count, 1);
    }
}
