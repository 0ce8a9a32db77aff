use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Backend operations observed by the request duration metric. One label per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PutObject,
    GetObject,
    HeadObject,
    DeleteObject,
    DeleteObjects,
    CreateMultipartUpload,
    UploadPart,
    UploadPartCopy,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    GetInfoObject,
    PutInfoObject,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PutObject => "put_object",
            Self::GetObject => "get_object",
            Self::HeadObject => "head_object",
            Self::DeleteObject => "delete_object",
            Self::DeleteObjects => "delete_objects",
            Self::CreateMultipartUpload => "create_multipart_upload",
            Self::UploadPart => "upload_part",
            Self::UploadPartCopy => "upload_part_copy",
            Self::CompleteMultipartUpload => "complete_multipart_upload",
            Self::AbortMultipartUpload => "abort_multipart_upload",
            Self::GetInfoObject => "get_info_object",
            Self::PutInfoObject => "put_info_object",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for upload pipeline measurements.
///
/// The hosting process owns the sink and decides how (and whether) values are
/// exported. The pipeline only calls into it around backend calls, spool
/// writes and upload semaphore transitions; it never keeps metric state of its own.
pub trait UploadObserver: Send + Sync {
    /// Duration of one backend request
    fn record_request_duration(&self, _operation: Operation, _duration: Duration) {}

    /// Duration of one chunk write to the local spool
    fn record_disk_write_duration(&self, _duration: Duration) {}

    /// Number of tasks waiting for or holding an upload permit
    fn set_semaphore_demand(&self, _demand: i64) {}

    /// Limit of concurrent upload permits
    fn set_semaphore_limit(&self, _limit: usize) {}
}

/// Observer that discards everything
#[derive(Debug, Clone, Default)]
pub struct NoopObserver;

impl UploadObserver for NoopObserver {}

/// Await `fut` and report its duration under `operation`
pub async fn timed<F, T>(observer: &dyn UploadObserver, operation: Operation, fut: F) -> T
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let output = fut.await;
    observer.record_request_duration(operation, started.elapsed());
    output
}

/// Aggregated durations for one label
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurationStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl DurationStats {
    fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.max = self.max.max(duration);
    }

    /// Mean duration, if anything was recorded
    pub fn average(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        Some(self.total / self.count as u32)
    }
}

/// In-process metrics collector for upload pipelines
pub struct LiveMetrics {
    requests: RwLock<HashMap<Operation, DurationStats>>,
    disk_writes: RwLock<DurationStats>,
    semaphore_demand: AtomicI64,
    semaphore_peak_demand: AtomicI64,
    semaphore_limit: AtomicU64,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            disk_writes: RwLock::new(DurationStats::default()),
            semaphore_demand: AtomicI64::new(0),
            semaphore_peak_demand: AtomicI64::new(0),
            semaphore_limit: AtomicU64::new(0),
        }
    }

    /// Stats for a single backend operation
    pub fn request_stats(&self, operation: Operation) -> DurationStats {
        self.requests
            .read()
            .get(&operation)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of recorded requests for `operation`
    pub fn request_count(&self, operation: Operation) -> u64 {
        self.request_stats(operation).count
    }

    pub fn disk_write_stats(&self) -> DurationStats {
        self.disk_writes.read().clone()
    }

    pub fn semaphore_demand(&self) -> i64 {
        self.semaphore_demand.load(Ordering::Relaxed)
    }

    /// Highest demand seen since creation
    pub fn semaphore_peak_demand(&self) -> i64 {
        self.semaphore_peak_demand.load(Ordering::Relaxed)
    }

    pub fn semaphore_limit(&self) -> u64 {
        self.semaphore_limit.load(Ordering::Relaxed)
    }
}

impl Default for LiveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadObserver for LiveMetrics {
    fn record_request_duration(&self, operation: Operation, duration: Duration) {
        self.requests
            .write()
            .entry(operation)
            .or_default()
            .record(duration);
    }

    fn record_disk_write_duration(&self, duration: Duration) {
        self.disk_writes.write().record(duration);
    }

    fn set_semaphore_demand(&self, demand: i64) {
        self.semaphore_demand.store(demand, Ordering::Relaxed);
        self.semaphore_peak_demand.fetch_max(demand, Ordering::Relaxed);
    }

    fn set_semaphore_limit(&self, limit: usize) {
        self.semaphore_limit.store(limit as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timed_records_under_operation_label() {
        let metrics = LiveMetrics::new();
        let value = timed(&metrics, Operation::UploadPart, async { 7 }).await;

        assert_eq!(value, 7);
        assert_eq!(metrics.request_count(Operation::UploadPart), 1);
        assert_eq!(metrics.request_count(Operation::CompleteMultipartUpload), 0);
    }

    #[test]
    fn duration_stats_track_count_and_max() {
        let metrics = LiveMetrics::new();
        metrics.record_disk_write_duration(Duration::from_millis(4));
        metrics.record_disk_write_duration(Duration::from_millis(10));

        let stats = metrics.disk_write_stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max, Duration::from_millis(10));
        assert_eq!(stats.average(), Some(Duration::from_millis(7)));
    }

    #[test]
    fn semaphore_gauges_keep_peak() {
        let metrics = LiveMetrics::new();
        metrics.set_semaphore_limit(10);
        metrics.set_semaphore_demand(3);
        metrics.set_semaphore_demand(1);

        assert_eq!(metrics.semaphore_limit(), 10);
        assert_eq!(metrics.semaphore_demand(), 1);
        assert_eq!(metrics.semaphore_peak_demand(), 3);
        assert_eq!(Operation::CreateMultipartUpload.to_string(), "create_multipart_upload");
    }
}
