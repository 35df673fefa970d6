//! Stuck-job reclaimer.
//!
//! A crashed process leaves its claims behind. Any claim older than the
//! stuck timeout is released so the item becomes eligible again.

use std::time::Duration;

use tracing::debug;

use super::events::{EventBus, PipelineEvent};
use crate::repository::{DbError, WorkItemRepository};

#[derive(Clone)]
pub struct Reclaimer {
    items: WorkItemRepository,
    stuck_timeout: Duration,
    events: EventBus,
}

impl Reclaimer {
    pub fn new(items: WorkItemRepository, stuck_timeout: Duration, events: EventBus) -> Self {
        Self {
            items,
            stuck_timeout,
            events,
        }
    }

    /// Release abandoned claims. Returns how many were released.
    pub async fn sweep(&self) -> Result<usize, DbError> {
        let count = self.items.reset_stuck(self.stuck_timeout).await?;
        if count > 0 {
            self.events.emit(PipelineEvent::StuckReclaimed { count });
        } else {
            debug!("No stuck claims older than {:?}", self.stuck_timeout);
        }
        Ok(count)
    }
}
