//! Structured pipeline events.
//!
//! Every event is logged through `tracing` and broadcast to subscribers. A
//! bounded history lets a late subscriber (a status view attaching to a
//! running pipeline) replay what happened recently.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Records kept for replay.
pub const DEFAULT_HISTORY: usize = 500;

/// Broadcast buffer per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    BatchStarted {
        items: usize,
        to_ocr: usize,
        workers: usize,
    },
    BatchFinished {
        succeeded: usize,
        failed_attempts: usize,
        consumed: usize,
        leftover: usize,
    },
    Idle {
        next_check_secs: u64,
    },
    WorkerStarted {
        worker: usize,
    },
    WorkerStopped {
        worker: usize,
        completed: usize,
    },
    WorkerRetired {
        worker: usize,
        sequence_number: i64,
    },
    ItemClaimed {
        worker: usize,
        sequence_number: i64,
    },
    ItemSkipped {
        worker: usize,
        sequence_number: i64,
    },
    ItemCompleted {
        worker: usize,
        sequence_number: i64,
        is_bookmark: bool,
        chars: usize,
    },
    ItemRetry {
        worker: usize,
        sequence_number: i64,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    ItemFailed {
        worker: usize,
        sequence_number: i64,
        attempts: u32,
        error: String,
    },
    ItemRequeued {
        worker: usize,
        sequence_number: i64,
    },
    GroupOpened {
        group_id: i32,
    },
    GroupCompleted {
        group_id: i32,
        page_count: i32,
    },
    GroupingRetry {
        sequence_number: i64,
        error: String,
    },
    GroupingStalled {
        sequence_number: i64,
    },
    /// Another engine had already grouped this page.
    GroupingConflict {
        sequence_number: i64,
    },
    StuckReclaimed {
        count: usize,
    },
}

impl PipelineEvent {
    pub fn severity(&self) -> Severity {
        match self {
            Self::ItemCompleted { .. } | Self::GroupCompleted { .. } => Severity::Success,
            Self::ItemRetry { .. }
            | Self::ItemRequeued { .. }
            | Self::WorkerRetired { .. }
            | Self::GroupingStalled { .. }
            | Self::GroupingConflict { .. }
            | Self::StuckReclaimed { .. } => Severity::Warning,
            Self::ItemFailed { .. } | Self::GroupingRetry { .. } => Severity::Error,
            _ => Severity::Info,
        }
    }

    /// Worker that produced the event, if it came from a worker.
    pub fn worker(&self) -> Option<usize> {
        match self {
            Self::WorkerStarted { worker }
            | Self::WorkerStopped { worker, .. }
            | Self::WorkerRetired { worker, .. }
            | Self::ItemClaimed { worker, .. }
            | Self::ItemSkipped { worker, .. }
            | Self::ItemCompleted { worker, .. }
            | Self::ItemRetry { worker, .. }
            | Self::ItemFailed { worker, .. }
            | Self::ItemRequeued { worker, .. } => Some(*worker),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatchStarted {
                items,
                to_ocr,
                workers,
            } => write!(
                f,
                "Batch of {items} page(s), {to_ocr} to OCR with {workers} worker(s)"
            ),
            Self::BatchFinished {
                succeeded,
                failed_attempts,
                consumed,
                leftover,
            } => write!(
                f,
                "Batch finished: {succeeded} extracted, {failed_attempts} failed attempt(s), \
                 {consumed} grouped, {leftover} left for next run"
            ),
            Self::Idle { next_check_secs } => {
                write!(f, "No work, checking again in {next_check_secs}s")
            }
            Self::WorkerStarted { .. } => write!(f, "Worker started"),
            Self::WorkerStopped { completed, .. } => {
                write!(f, "Worker stopped after {completed} page(s)")
            }
            Self::WorkerRetired {
                sequence_number, ..
            } => write!(f, "Worker retired after giving up on page #{sequence_number}"),
            Self::ItemClaimed {
                sequence_number, ..
            } => write!(f, "Processing page #{sequence_number}"),
            Self::ItemSkipped {
                sequence_number, ..
            } => write!(f, "Page #{sequence_number} was taken by another process"),
            Self::ItemCompleted {
                sequence_number,
                is_bookmark,
                chars,
                ..
            } => {
                if *is_bookmark {
                    write!(f, "Page #{sequence_number} is a bookmark")
                } else {
                    write!(f, "Page #{sequence_number} done ({chars} chars)")
                }
            }
            Self::ItemRetry {
                sequence_number,
                attempt,
                max_attempts,
                error,
                ..
            } => write!(
                f,
                "Page #{sequence_number} attempt {attempt}/{max_attempts} failed: {error}"
            ),
            Self::ItemFailed {
                sequence_number,
                attempts,
                error,
                ..
            } => write!(
                f,
                "Page #{sequence_number} failed after {attempts} attempt(s): {error}"
            ),
            Self::ItemRequeued {
                sequence_number, ..
            } => write!(f, "Page #{sequence_number} returned to the queue"),
            Self::GroupOpened { group_id } => write!(f, "Group {group_id} opened"),
            Self::GroupCompleted {
                group_id,
                page_count,
            } => write!(f, "Group {group_id} complete with {page_count} page(s)"),
            Self::GroupingRetry {
                sequence_number,
                error,
            } => write!(
                f,
                "Grouping write for page #{sequence_number} failed, retrying: {error}"
            ),
            Self::GroupingStalled { sequence_number } => write!(
                f,
                "Grouping paused at page #{sequence_number}, waiting for its text"
            ),
            Self::GroupingConflict { sequence_number } => write!(
                f,
                "Page #{sequence_number} was already grouped by another process, resyncing"
            ),
            Self::StuckReclaimed { count } => {
                write!(f, "Released {count} stuck claim(s)")
            }
        }
    }
}

/// One event as seen by subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub worker: Option<usize>,
    pub severity: Severity,
    pub message: String,
    pub event: PipelineEvent,
}

/// Fan-out of pipeline events with a replay buffer.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
    history: Arc<Mutex<VecDeque<EventRecord>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl EventBus {
    pub fn new(history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            history: Arc::new(Mutex::new(VecDeque::with_capacity(history_capacity))),
            capacity: history_capacity,
        }
    }

    /// Log, record and broadcast an event.
    pub fn emit(&self, event: PipelineEvent) {
        let record = EventRecord {
            timestamp: Utc::now(),
            worker: event.worker(),
            severity: event.severity(),
            message: event.to_string(),
            event,
        };

        let worker = record.worker.map(|w| w as i64).unwrap_or(-1);
        match record.severity {
            Severity::Error => tracing::error!(worker, "{}", record.message),
            Severity::Warning => tracing::warn!(worker, "{}", record.message),
            Severity::Info | Severity::Success => tracing::info!(worker, "{}", record.message),
        }

        if self.capacity > 0 {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    /// Recent events, oldest first.
    pub fn history(&self) -> Vec<EventRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::new(3);
        for group_id in 1..=5 {
            bus.emit(PipelineEvent::GroupOpened { group_id });
        }
        let history = bus.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].event, PipelineEvent::GroupOpened { group_id: 3 });
        assert_eq!(history[2].message, "Group 5 opened");
    }

    #[tokio::test]
    async fn test_subscribers_receive_records() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(PipelineEvent::ItemRetry {
            worker: 2,
            sequence_number: 7,
            attempt: 1,
            max_attempts: 3,
            error: "timeout".to_string(),
        });

        let record = rx.recv().await.unwrap();
        assert_eq!(record.worker, Some(2));
        assert_eq!(record.severity, Severity::Warning);
        assert_eq!(record.message, "Page #7 attempt 1/3 failed: timeout");
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let json = serde_json::to_value(PipelineEvent::GroupCompleted {
            group_id: 4,
            page_count: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "group_completed");
        assert_eq!(json["group_id"], 4);
    }
}
