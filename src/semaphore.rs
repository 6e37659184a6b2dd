use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A lightweight counting semaphore bounding concurrent connection tasks
pub(crate) struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: SemaphoreInner {
                permissions: <_>::default(),
                capacity,
                cv: Condvar::new(),
            }
            .into(),
        }
    }
    /// Acquires permission, blocks until it is available
    pub(crate) fn acquire(&self) -> SemaphoreGuard {
        let mut count = self.inner.permissions.lock();
        while *count == self.inner.capacity {
            self.inner.cv.wait(&mut count);
        }
        *count += 1;
        SemaphoreGuard {
            inner: self.inner.clone(),
        }
    }
}

struct SemaphoreInner {
    permissions: Mutex<usize>,
    capacity: usize,
    cv: Condvar,
}

pub(crate) struct SemaphoreGuard {
    inner: Arc<SemaphoreInner>,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        *self.inner.permissions.lock() -= 1;
        self.inner.cv.notify_one();
    }
}

#[cfg(test)]
mod test {
    use super::Semaphore;

    #[test]
    fn test_acquire_release() {
        let semaphore = Semaphore::new(2);
        let first = semaphore.acquire();
        let second = semaphore.acquire();
        drop(first);
        let _third = semaphore.acquire();
        drop(second);
    }
}
