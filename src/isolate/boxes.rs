use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Hands out isolate box ids so that no two live sandboxes share one.
#[derive(Debug)]
pub struct BoxPool {
    free: Mutex<VecDeque<u32>>,
    available: Arc<Semaphore>,
}

impl BoxPool {
    pub fn new(size: u32) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((0..size).collect()),
            available: Arc::new(Semaphore::new(size as usize)),
        })
    }

    pub async fn lease(self: &Arc<Self>) -> Option<BoxLease> {
        let permit = self.available.clone().acquire_owned().await.ok()?;
        let id = self.free.lock().ok()?.pop_front()?;

        Some(BoxLease {
            id,
            pool: self.clone(),
            _permit: permit,
        })
    }
}

#[derive(Debug)]
pub struct BoxLease {
    id: u32,
    pool: Arc<BoxPool>,
    _permit: OwnedSemaphorePermit,
}

impl BoxLease {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        if let Ok(mut free) = self.pool.free.lock() {
            free.push_back(self.id);
        }
    }
}
