use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use tokio::sync::{
    OwnedRwLockReadGuard, OwnedRwLockWriteGuard, OwnedSemaphorePermit, RwLock, Semaphore,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("service is shutting down")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Executing(usize),
    /// An installation is queued and waits for these executions to finish.
    DrainingForInstall(usize),
    Installing,
}

/// Admission control shared by every request.
///
/// Executions share the barrier and then compete for one of `capacity`
/// permits. Installations take the barrier exclusively. The barrier is a
/// fair lock, so once an installation is queued no new execution gets past
/// it and installations are admitted one at a time in arrival order.
#[derive(Debug)]
pub struct SchedulingGate {
    barrier: Arc<RwLock<()>>,
    slots: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    executing: AtomicUsize,
    pending_installs: AtomicUsize,
    installing: AtomicBool,
    closed: AtomicBool,
}

impl SchedulingGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            barrier: Arc::new(RwLock::new(())),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[tracing::instrument(skip(self))]
    pub async fn acquire_execution_slot(&self) -> Result<ExecutionSlot, GateError> {
        self.ensure_open()?;
        let shared = self.barrier.clone().read_owned().await;
        self.ensure_open()?;
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;
        self.counters.executing.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Execution slot acquired");

        Ok(ExecutionSlot {
            _permit: permit,
            _shared: shared,
            counters: self.counters.clone(),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn acquire_installation_barrier(&self) -> Result<InstallationBarrier, GateError> {
        self.ensure_open()?;
        let pending = PendingInstall::new(self.counters.clone());
        let exclusive = self.barrier.clone().write_owned().await;
        self.counters.installing.store(true, Ordering::SeqCst);
        drop(pending);

        if let Err(e) = self.ensure_open() {
            self.counters.installing.store(false, Ordering::SeqCst);
            return Err(e);
        }
        tracing::debug!("Installation barrier acquired");

        Ok(InstallationBarrier {
            _exclusive: exclusive,
            counters: self.counters.clone(),
        })
    }

    pub fn state(&self) -> GateState {
        let executing = self.counters.executing.load(Ordering::SeqCst);
        if self.counters.installing.load(Ordering::SeqCst) {
            GateState::Installing
        } else if self.counters.pending_installs.load(Ordering::SeqCst) > 0 {
            GateState::DrainingForInstall(executing)
        } else if executing > 0 {
            GateState::Executing(executing)
        } else {
            GateState::Idle
        }
    }

    /// Rejects every acquisition from now on. Holders keep their slots.
    pub fn close(&self) {
        self.counters.closed.store(true, Ordering::SeqCst);
        self.slots.close();
    }

    fn ensure_open(&self) -> Result<(), GateError> {
        if self.counters.closed.load(Ordering::SeqCst) {
            Err(GateError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Held for the whole compile and run of one submission.
#[derive(Debug)]
pub struct ExecutionSlot {
    _permit: OwnedSemaphorePermit,
    _shared: OwnedRwLockReadGuard<()>,
    counters: Arc<Counters>,
}

impl ExecutionSlot {
    pub fn release(self) {}
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        self.counters.executing.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Proof of exclusive access. Registry mutations require a reference to one.
#[derive(Debug)]
pub struct InstallationBarrier {
    _exclusive: OwnedRwLockWriteGuard<()>,
    counters: Arc<Counters>,
}

impl InstallationBarrier {
    pub fn release(self) {}
}

impl Drop for InstallationBarrier {
    fn drop(&mut self) {
        self.counters.installing.store(false, Ordering::SeqCst);
    }
}

struct PendingInstall(Arc<Counters>);

impl PendingInstall {
    fn new(counters: Arc<Counters>) -> Self {
        counters.pending_installs.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for PendingInstall {
    fn drop(&mut self) {
        self.0.pending_installs.fetch_sub(1, Ordering::SeqCst);
    }
}
