//! Sequential grouping of OCR results.
//!
//! Workers finish pages in any order, but groups are assembled strictly by
//! sequence number. The engine walks the batch with a cursor and waits at
//! each position until that page's text is in the result map.
//!
//! Decisions come from [`Segmenter`], a pure state machine. Writes go through
//! a [`GroupSink`]. The segmenter state only advances after the sink write for
//! that step succeeded, so a failed write is retried at the same cursor and
//! every write must be idempotent.
//!
//! A sink write that finds its page already grouped elsewhere means another
//! engine is working the same database. The engine stops at that page and
//! leaves the rest to the next batch, which resyncs from the database.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{EventBus, PipelineEvent};
use super::results::{PageResult, ResultMap};
use crate::repository::{DbError, GroupAllocation, GroupRepository};

/// A group left open by an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenGroup {
    pub id: i32,
    pub page_count: i32,
}

/// Persistence for grouping decisions.
#[async_trait]
pub trait GroupSink: Send + Sync {
    /// The open group an earlier run left behind, if any.
    async fn resume_open_group(&self) -> Result<Option<OpenGroup>, DbError>;
    /// Open a group for `first_item`, or hand back the empty one already open.
    async fn open_group(&self, first_item: i32) -> Result<GroupAllocation, DbError>;
    /// False when the page is already placed somewhere else.
    async fn assign_page(&self, item_id: i32, group_id: i32, position: i32)
        -> Result<bool, DbError>;
    /// False when the bookmark was already consumed.
    async fn consume_bookmark(&self, item_id: i32) -> Result<bool, DbError>;
    /// False when the group was already closed.
    async fn close_group(&self, group_id: i32) -> Result<bool, DbError>;
}

#[async_trait]
impl GroupSink for GroupRepository {
    async fn resume_open_group(&self) -> Result<Option<OpenGroup>, DbError> {
        Ok(self.latest_open().await?.map(|g| OpenGroup {
            id: g.id,
            page_count: g.page_count,
        }))
    }

    async fn open_group(&self, first_item: i32) -> Result<GroupAllocation, DbError> {
        GroupRepository::open_group(self, first_item).await
    }

    async fn assign_page(
        &self,
        item_id: i32,
        group_id: i32,
        position: i32,
    ) -> Result<bool, DbError> {
        GroupRepository::assign_page(self, item_id, group_id, position).await
    }

    async fn consume_bookmark(&self, item_id: i32) -> Result<bool, DbError> {
        GroupRepository::consume_bookmark(self, item_id).await
    }

    async fn close_group(&self, group_id: i32) -> Result<bool, DbError> {
        GroupRepository::close_group(self, group_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    Open { id: i32, pages: i32 },
}

/// The next write needed for the page under the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// A bookmark ends the open group.
    Close { group_id: i32, pages: i32 },
    /// The bookmark itself is consumed without a group.
    ConsumeBookmark,
    /// A content page arrived with no group open.
    Open,
    Assign { group_id: i32, position: i32 },
}

/// Pure grouping state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segmenter {
    state: GroupState,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self {
            state: GroupState::Idle,
        }
    }
}

impl Segmenter {
    pub fn resume(open: Option<OpenGroup>) -> Self {
        let state = match open {
            Some(group) => GroupState::Open {
                id: group.id,
                pages: group.page_count,
            },
            None => GroupState::Idle,
        };
        Self { state }
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn next_action(&self, is_bookmark: bool) -> Action {
        match (is_bookmark, self.state) {
            (true, GroupState::Open { id, pages }) if pages > 0 => Action::Close {
                group_id: id,
                pages,
            },
            // An empty open group survives the bookmark and takes the next page.
            (true, _) => Action::ConsumeBookmark,
            (false, GroupState::Idle) => Action::Open,
            (false, GroupState::Open { id, pages }) => Action::Assign {
                group_id: id,
                position: pages + 1,
            },
        }
    }

    /// Record a persisted action. Returns true when the page is finished.
    ///
    /// `opened` is the id of the group an `Open` action allocated.
    pub fn apply(&mut self, action: Action, opened: Option<i32>) -> bool {
        match action {
            Action::Close { .. } => {
                self.state = GroupState::Idle;
                false
            }
            Action::ConsumeBookmark => true,
            Action::Open => {
                if let Some(id) = opened {
                    self.state = GroupState::Open { id, pages: 0 };
                }
                false
            }
            Action::Assign { group_id, position } => {
                self.state = GroupState::Open {
                    id: group_id,
                    pages: position,
                };
                true
            }
        }
    }

    /// The group to close when the batch reached the end of known intake.
    pub fn closable(&self) -> Option<(i32, i32)> {
        match self.state {
            GroupState::Open { id, pages } if pages > 0 => Some((id, pages)),
            _ => None,
        }
    }
}

/// How a grouping run ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupingOutcome {
    pub consumed: usize,
    pub completed_groups: Vec<i32>,
    /// Group still open when the run ended.
    pub open_group: Option<i32>,
    /// First page the run could not consume because its text never arrived.
    pub stalled_at: Option<i64>,
    /// First page another engine had already grouped.
    pub conflict_at: Option<i64>,
    pub cancelled: bool,
}

enum Wait {
    Ready(PageResult),
    Stalled,
    Cancelled,
}

enum Step {
    Consumed,
    Conflict,
    Cancelled,
}

pub struct GroupingEngine<S> {
    sink: S,
    results: Arc<ResultMap>,
    events: EventBus,
    poll_interval: Duration,
    retry_delay: Duration,
}

impl<S: GroupSink> GroupingEngine<S> {
    pub fn new(
        sink: S,
        results: Arc<ResultMap>,
        events: EventBus,
        poll_interval: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            sink,
            results,
            events,
            poll_interval,
            retry_delay,
        }
    }

    /// Consume `sequence` in order.
    ///
    /// Waits for each page's result while the pool is running. Once
    /// `pool_done` fires, a missing result stops the run there and leaves the
    /// open group for the next batch. With `close_at_end`, a group still open
    /// after the last page is closed.
    pub async fn run(
        &self,
        sequence: &[i64],
        close_at_end: bool,
        pool_done: &CancellationToken,
        cancel: &CancellationToken,
    ) -> GroupingOutcome {
        let mut outcome = GroupingOutcome::default();
        let first = sequence.first().copied().unwrap_or_default();

        let Some(resumed) = self
            .persist(first, cancel, || self.sink.resume_open_group())
            .await
        else {
            outcome.cancelled = true;
            return outcome;
        };
        if let Some(group) = resumed {
            debug!("Continuing group {} at page {}", group.id, group.page_count + 1);
        }
        let mut segmenter = Segmenter::resume(resumed);

        for &sequence_number in sequence {
            let result = match self.wait_for(sequence_number, pool_done, cancel).await {
                Wait::Ready(result) => result,
                Wait::Stalled => {
                    self.events
                        .emit(PipelineEvent::GroupingStalled { sequence_number });
                    outcome.stalled_at = Some(sequence_number);
                    break;
                }
                Wait::Cancelled => {
                    outcome.cancelled = true;
                    break;
                }
            };

            match self
                .consume(&mut segmenter, &result, &mut outcome, cancel)
                .await
            {
                Step::Consumed => {}
                Step::Conflict => {
                    warn!("Page #{} was grouped by another engine", sequence_number);
                    self.events
                        .emit(PipelineEvent::GroupingConflict { sequence_number });
                    outcome.conflict_at = Some(sequence_number);
                    break;
                }
                Step::Cancelled => {
                    outcome.cancelled = true;
                    break;
                }
            }
            self.results.remove(sequence_number);
            outcome.consumed += 1;
        }

        let finished =
            outcome.stalled_at.is_none() && outcome.conflict_at.is_none() && !outcome.cancelled;
        if finished && close_at_end {
            if let Some((group_id, pages)) = segmenter.closable() {
                let last = sequence.last().copied().unwrap_or_default();
                if let Some(closed) = self
                    .persist(last, cancel, || self.sink.close_group(group_id))
                    .await
                {
                    segmenter.apply(Action::Close { group_id, pages }, None);
                    if closed {
                        self.completed(group_id, pages, &mut outcome);
                    }
                }
            }
        }

        outcome.open_group = match segmenter.state() {
            GroupState::Open { id, .. } => Some(id),
            GroupState::Idle => None,
        };
        outcome
    }

    /// Apply every write one page needs.
    async fn consume(
        &self,
        segmenter: &mut Segmenter,
        result: &PageResult,
        outcome: &mut GroupingOutcome,
        cancel: &CancellationToken,
    ) -> Step {
        let seq = result.sequence_number;
        loop {
            let action = segmenter.next_action(result.is_bookmark);
            let opened = match action {
                Action::Close { group_id, pages } => {
                    let Some(closed) = self
                        .persist(seq, cancel, || self.sink.close_group(group_id))
                        .await
                    else {
                        return Step::Cancelled;
                    };
                    if closed {
                        self.completed(group_id, pages, outcome);
                    } else {
                        debug!("Group {} was already closed", group_id);
                    }
                    None
                }
                Action::ConsumeBookmark => {
                    let Some(fresh) = self
                        .persist(seq, cancel, || self.sink.consume_bookmark(result.item_id))
                        .await
                    else {
                        return Step::Cancelled;
                    };
                    if !fresh {
                        debug!("Bookmark #{} was already consumed", seq);
                    }
                    None
                }
                Action::Open => {
                    let Some(allocation) = self
                        .persist(seq, cancel, || self.sink.open_group(result.item_id))
                        .await
                    else {
                        return Step::Cancelled;
                    };
                    match allocation {
                        GroupAllocation::Created(group_id) => {
                            self.events.emit(PipelineEvent::GroupOpened { group_id });
                            Some(group_id)
                        }
                        GroupAllocation::Existing(group_id) => {
                            debug!("Reusing empty group {}", group_id);
                            Some(group_id)
                        }
                        GroupAllocation::Taken => return Step::Conflict,
                    }
                }
                Action::Assign { group_id, position } => {
                    let Some(placed) = self
                        .persist(seq, cancel, || {
                            self.sink.assign_page(result.item_id, group_id, position)
                        })
                        .await
                    else {
                        return Step::Cancelled;
                    };
                    if !placed {
                        return Step::Conflict;
                    }
                    None
                }
            };
            if segmenter.apply(action, opened) {
                return Step::Consumed;
            }
        }
    }

    fn completed(&self, group_id: i32, page_count: i32, outcome: &mut GroupingOutcome) {
        self.events.emit(PipelineEvent::GroupCompleted {
            group_id,
            page_count,
        });
        outcome.completed_groups.push(group_id);
    }

    async fn wait_for(
        &self,
        sequence_number: i64,
        pool_done: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Wait {
        loop {
            if let Some(result) = self.results.get(sequence_number) {
                return Wait::Ready(result);
            }
            if pool_done.is_cancelled() {
                // Last look; the final insert may race the done signal.
                return match self.results.get(sequence_number) {
                    Some(result) => Wait::Ready(result),
                    None => Wait::Stalled,
                };
            }
            tokio::select! {
                _ = cancel.cancelled() => return Wait::Cancelled,
                _ = pool_done.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Retry a sink write until it succeeds. None means cancelled.
    async fn persist<T, F, Fut>(
        &self,
        sequence_number: i64,
        cancel: &CancellationToken,
        mut write: F,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        loop {
            match write().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    self.events.emit(PipelineEvent::GroupingRetry {
                        sequence_number,
                        error: e.to_string(),
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
    }
}
