use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use timelocker_domain::OperationOutcome;
use timelocker_engine::{cancel_flag, CancelFlag};

/// Phase of a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Running,
    Completed(OperationOutcome),
}

#[derive(Debug, Clone)]
pub struct TaskState {
    pub repository: String,
    pub cancel: CancelFlag,
    pub phase: TaskPhase,
}

/// In-process registry of orchestrated operations, keyed by operation id.
///
/// Cancellation is cooperative: `cancel` flips a flag that the engine loop
/// checks at event boundaries, so a running backup stops at the next event
/// rather than mid-write.
#[derive(Default)]
pub struct TaskRegistry {
    inner: Mutex<HashMap<Uuid, TaskState>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new running operation and return its cancellation flag.
    pub fn register(&self, operation_id: Uuid, repository: &str) -> CancelFlag {
        let cancel = cancel_flag();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.insert(
            operation_id,
            TaskState {
                repository: repository.to_string(),
                cancel: cancel.clone(),
                phase: TaskPhase::Running,
            },
        );
        cancel
    }

    /// Record the terminal outcome. The entry is retained for status
    /// queries until process exit.
    pub fn complete(&self, operation_id: Uuid, outcome: OperationOutcome) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = inner.get_mut(&operation_id) {
            state.phase = TaskPhase::Completed(outcome);
        }
    }

    /// Request cancellation. Returns true only when the operation exists
    /// and is still running; cancelling a completed operation is a no-op
    /// returning false.
    pub fn cancel(&self, operation_id: Uuid) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.get(&operation_id) {
            Some(state) if state.phase == TaskPhase::Running => {
                state.cancel.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, operation_id: Uuid) -> Option<TaskState> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.get(&operation_id).cloned()
    }

    /// Operations still running, as (operation id, repository) pairs.
    pub fn active(&self) -> Vec<(Uuid, String)> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .iter()
            .filter(|(_, state)| state.phase == TaskPhase::Running)
            .map(|(id, state)| (*id, state.repository.clone()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.values().filter(|state| state.phase == TaskPhase::Running).count()
    }
}
