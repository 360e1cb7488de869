use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use timelocker_domain::OperationStatus;

use crate::error::EventsError;

/// Receives every published status event. Handlers run synchronously on the
/// publisher's thread and must not block; sinks with slow consumers push to
/// their own queue.
pub trait StatusSink: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn handle(&self, status: &OperationStatus) -> Result<(), EventsError>;
}

/// Process-wide status publisher.
///
/// Delivery is best-effort: a failing sink is logged and skipped, never
/// propagated to the publisher. Ordering is FIFO per publishing thread;
/// nothing is promised across threads.
#[derive(Default)]
pub struct StatusBus {
    sinks: Mutex<Vec<Arc<dyn StatusSink>>>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn StatusSink>) {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(sink = sink.name(), "status sink registered");
        sinks.push(sink);
    }

    pub fn publish(&self, status: &OperationStatus) {
        let sinks = {
            let guard = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
            guard.clone()
        };
        for sink in sinks {
            if let Err(e) = sink.handle(status) {
                warn!(
                    sink = sink.name(),
                    operation_id = %status.operation_id,
                    error = %e,
                    "status sink failed; skipping"
                );
            }
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use timelocker_domain::{OperationState, OperationType};
    use uuid::Uuid;

    struct Counter {
        seen: AtomicUsize,
    }

    impl StatusSink for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn handle(&self, _status: &OperationStatus) -> Result<(), EventsError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl StatusSink for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn handle(&self, _status: &OperationStatus) -> Result<(), EventsError> {
            Err(EventsError::Sink("boom".into()))
        }
    }

    fn status() -> OperationStatus {
        OperationStatus::new(
            Uuid::new_v4(),
            OperationType::Backup,
            OperationState::Running,
            "running",
        )
    }

    #[test]
    fn delivers_to_all_sinks() {
        let bus = StatusBus::new();
        let a = Arc::new(Counter { seen: AtomicUsize::new(0) });
        let b = Arc::new(Counter { seen: AtomicUsize::new(0) });
        bus.register(a.clone());
        bus.register(b.clone());

        bus.publish(&status());
        bus.publish(&status());

        assert_eq!(a.seen.load(Ordering::SeqCst), 2);
        assert_eq!(b.seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_sink_is_skipped_not_propagated() {
        let bus = StatusBus::new();
        let counter = Arc::new(Counter { seen: AtomicUsize::new(0) });
        bus.register(Arc::new(Failing));
        bus.register(counter.clone());

        bus.publish(&status());
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
    }
}
