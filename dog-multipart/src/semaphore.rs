use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::observability::UploadObserver;
use crate::{MultipartError, MultipartResult};

/// Process-wide gate on concurrent part uploads.
///
/// Backed by a tokio [`Semaphore`], which serves waiters in FIFO order, so a
/// part that started waiting first is uploaded first. Demand (tasks waiting
/// for or holding a permit) is reported to the observer on every change.
#[derive(Clone)]
pub struct UploadSemaphore {
    permits: Arc<Semaphore>,
    limit: usize,
    demand: Arc<AtomicI64>,
    observer: Arc<dyn UploadObserver>,
}

impl UploadSemaphore {
    pub fn new(limit: usize, observer: Arc<dyn UploadObserver>) -> Self {
        observer.set_semaphore_limit(limit);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            demand: Arc::new(AtomicI64::new(0)),
            observer,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits not held by any upload
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn demand(&self) -> i64 {
        self.demand.load(Ordering::SeqCst)
    }

    /// Wait for an upload permit. Dropping the future while it waits
    /// withdraws the demand again
    pub async fn acquire(&self) -> MultipartResult<UploadPermit> {
        let demand = Demand::enter(self.demand.clone(), self.observer.clone());
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MultipartError::SessionCanceled)?;
        Ok(UploadPermit {
            _permit: permit,
            _demand: demand,
        })
    }
}

struct Demand {
    counter: Arc<AtomicI64>,
    observer: Arc<dyn UploadObserver>,
}

impl Demand {
    fn enter(counter: Arc<AtomicI64>, observer: Arc<dyn UploadObserver>) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        observer.set_semaphore_demand(now);
        Self { counter, observer }
    }
}

impl Drop for Demand {
    fn drop(&mut self) {
        let now = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
        self.observer.set_semaphore_demand(now);
    }
}

/// Right to have one part in flight. Released on drop
pub struct UploadPermit {
    _permit: OwnedSemaphorePermit,
    _demand: Demand,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::LiveMetrics;
    use std::time::Duration;

    #[tokio::test]
    async fn reports_limit_and_demand() {
        let metrics = Arc::new(LiveMetrics::new());
        let semaphore = UploadSemaphore::new(2, metrics.clone());
        assert_eq!(metrics.semaphore_limit(), 2);

        let first = semaphore.acquire().await.unwrap();
        let second = semaphore.acquire().await.unwrap();
        assert_eq!(semaphore.available(), 0);
        assert_eq!(metrics.semaphore_demand(), 2);

        drop(first);
        drop(second);
        assert_eq!(metrics.semaphore_demand(), 0);
        assert_eq!(metrics.semaphore_peak_demand(), 2);
        assert_eq!(semaphore.available(), 2);
    }

    #[tokio::test]
    async fn abandoned_wait_withdraws_demand() {
        let metrics = Arc::new(LiveMetrics::new());
        let semaphore = UploadSemaphore::new(1, metrics.clone());
        let _held = semaphore.acquire().await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(20), semaphore.acquire()).await;
        assert!(waited.is_err());
        assert_eq!(semaphore.demand(), 1);
        assert_eq!(metrics.semaphore_peak_demand(), 2);
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let semaphore = UploadSemaphore::new(1, Arc::new(crate::NoopObserver));
        let held = semaphore.acquire().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for id in 0..4 {
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.unwrap();
                tx.send(id).unwrap();
            }));
            // Let the task reach the wait queue before the next one starts.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        let order: Vec<i32> = (0..4).map(|_| rx.try_recv().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
