use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::StudioError;

/// RAII guard for one worker slot; the slot is released when dropped.
///
/// The scheduler moves the permit into the worker task so the slot stays
/// occupied until execution has been finalized.
pub struct WorkerPermit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for WorkerPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPermit").finish()
    }
}

/// Bounded pool of execution slots.
#[derive(Debug, Clone)]
pub struct WorkerSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerSlots {
    /// `capacity` is raised to at least one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    ///
    /// Returns [`StudioError::SchedulerShutdown`] once [`Self::close`] has been
    /// called.
    pub async fn acquire(&self) -> Result<WorkerPermit, StudioError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| WorkerPermit { permit })
            .map_err(|_| StudioError::SchedulerShutdown)
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<WorkerPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| WorkerPermit { permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Stop handing out slots. Pending and future acquires fail.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slots_are_bounded_and_released_on_drop() {
        let slots = WorkerSlots::new(2);
        let a = slots.acquire().await.unwrap();
        let _b = slots.try_acquire().expect("second slot");
        assert!(slots.try_acquire().is_none());
        assert_eq!(slots.in_use(), 2);
        drop(a);
        assert_eq!(slots.in_use(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[tokio::test]
    async fn closed_slots_reject_acquire() {
        let slots = WorkerSlots::new(0);
        assert_eq!(slots.capacity(), 1);
        slots.close();
        assert!(matches!(
            slots.acquire().await,
            Err(StudioError::SchedulerShutdown)
        ));
    }
}
