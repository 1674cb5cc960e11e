//! Per-task fan-out of research events to connected observers.
//!
//! Each task id maps to its own observer set behind its own lock, so
//! register/unregister/broadcast on one task are mutually exclusive while
//! different tasks never contend. Every observer owns a bounded queue; a
//! broadcast never waits on a slow observer; a full or closed queue is a
//! delivery failure and the observer is pruned after the sweep.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::services::research_events::ResearchEvent;

struct Observer {
    id: Uuid,
    tx: mpsc::Sender<Arc<ResearchEvent>>,
}

#[derive(Default)]
struct Topic {
    observers: Vec<Observer>,
    /// Set once the topic has been emptied and unlinked from the map.
    retired: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct ProgressBus {
    topics: Arc<DashMap<Uuid, Arc<Mutex<Topic>>>>,
    capacity: usize,
}

impl ProgressBus {
    pub fn new(observer_queue_capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: observer_queue_capacity.max(1),
        }
    }

    pub fn register(&self, task_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let observer_id = Uuid::new_v4();

        loop {
            let topic = self
                .topics
                .entry(task_id)
                .or_insert_with(|| Arc::new(Mutex::new(Topic::default())))
                .clone();

            let mut guard = topic.lock();
            if guard.retired {
                // Lost a race with the last unregister; the entry is gone now.
                continue;
            }
            guard.observers.push(Observer {
                id: observer_id,
                tx: tx.clone(),
            });
            break;
        }

        tracing::debug!(
            "[PROGRESS_BUS] Observer {} registered for task {}",
            observer_id,
            task_id
        );

        Subscription {
            bus: self.clone(),
            task_id,
            observer_id,
            rx,
        }
    }

    /// Removes one observer. Returns false if it was already gone.
    pub fn unregister(&self, task_id: Uuid, observer_id: Uuid) -> bool {
        let Some(topic) = self.topic(task_id) else {
            return false;
        };

        let mut guard = topic.lock();
        let before = guard.observers.len();
        guard.observers.retain(|o| o.id != observer_id);
        let removed = guard.observers.len() != before;
        self.retire_if_empty(task_id, &topic, &mut guard);

        if removed {
            tracing::debug!(
                "[PROGRESS_BUS] Observer {} unregistered from task {}",
                observer_id,
                task_id
            );
        }
        removed
    }

    pub fn broadcast(&self, task_id: Uuid, event: ResearchEvent) -> BroadcastOutcome {
        self.broadcast_if(task_id, event, || true)
    }

    /// Broadcasts only if `live` still holds once the observer set is locked.
    /// A publisher that flips the condition before its own broadcast is then
    /// never overtaken by an event this call decided to send.
    pub fn broadcast_if(
        &self,
        task_id: Uuid,
        event: ResearchEvent,
        live: impl FnOnce() -> bool,
    ) -> BroadcastOutcome {
        let Some(topic) = self.topic(task_id) else {
            return BroadcastOutcome::default();
        };

        let mut guard = topic.lock();
        if !live() {
            return BroadcastOutcome::default();
        }
        let event = Arc::new(event);
        let mut outcome = BroadcastOutcome::default();
        let mut failed = Vec::new();

        for observer in &guard.observers {
            match observer.tx.try_send(event.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "[PROGRESS_BUS] Observer {} of task {} is not keeping up, dropping it",
                        observer.id,
                        task_id
                    );
                    failed.push(observer.id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(
                        "[PROGRESS_BUS] Observer {} of task {} is gone",
                        observer.id,
                        task_id
                    );
                    failed.push(observer.id);
                }
            }
        }

        if !failed.is_empty() {
            outcome.dropped = failed.len();
            guard.observers.retain(|o| !failed.contains(&o.id));
            self.retire_if_empty(task_id, &topic, &mut guard);
        }

        outcome
    }

    pub fn count(&self, task_id: Uuid) -> usize {
        self.topic(task_id)
            .map(|topic| topic.lock().observers.len())
            .unwrap_or(0)
    }

    /// Number of tasks with at least one observer.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn topic(&self, task_id: Uuid) -> Option<Arc<Mutex<Topic>>> {
        self.topics.get(&task_id).map(|entry| entry.value().clone())
    }

    // Caller holds the topic lock, so no register can slip in between the
    // emptiness check and the removal.
    fn retire_if_empty(&self, task_id: Uuid, topic: &Arc<Mutex<Topic>>, guard: &mut Topic) {
        if guard.observers.is_empty() && !guard.retired {
            guard.retired = true;
            self.topics
                .remove_if(&task_id, |_, current| Arc::ptr_eq(current, topic));
        }
    }
}

/// A registered observer. Dropping it unregisters exactly once.
pub struct Subscription {
    bus: ProgressBus,
    task_id: Uuid,
    observer_id: Uuid,
    rx: mpsc::Receiver<Arc<ResearchEvent>>,
}

impl Subscription {
    /// Next event, or `None` once the bus has dropped this observer.
    pub async fn recv(&mut self) -> Option<Arc<ResearchEvent>> {
        self.rx.recv().await
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn observer_id(&self) -> Uuid {
        self.observer_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(self.task_id, self.observer_id);
    }
}
