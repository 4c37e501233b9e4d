use chrono::{DateTime, Utc};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, WearableError},
    sink::RemoteSink,
    types::{HealthSample, SyncConfig, WireHealthRecord},
};

/// Device the buffered samples are uploaded for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SyncTarget {
    device_id: String,
    device_name: String,
}

#[derive(Debug, Default)]
struct SyncBuffer {
    samples: VecDeque<HealthSample>,
    /// Samples ever removed from the head, by uploads, clears or the cap
    removed: u64,
}

impl SyncBuffer {
    fn drop_head(&mut self, count: usize) {
        let count = count.min(self.samples.len());
        self.samples.drain(..count);
        self.removed += count as u64;
    }
}

struct SyncInner {
    sink: Arc<dyn RemoteSink>,
    config: SyncConfig,
    buffer: RwLock<SyncBuffer>,
    target: RwLock<SyncTarget>,
    flush_guard: Mutex<()>,
    threshold_flush_pending: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
}

/// Buffers decoded samples and uploads them to a [`RemoteSink`]
///
/// Samples are kept in arrival order and uploaded in that order. Uploads
/// happen on a periodic timer, as soon as the buffer reaches the configured
/// threshold, or when [`force_sync_now`](Self::force_sync_now) is called.
///
/// # Delivery guarantees
///
/// - A flush sends a point-in-time snapshot of the buffer. Samples added while
///   the request is in flight are not part of it and stay queued.
/// - Only a confirmed upload removes samples, and it removes exactly the
///   snapshot. A failed upload leaves the buffer untouched.
/// - Flushes never overlap. A trigger that fires while a flush is in flight
///   waits for it and then sends whatever is still queued.
///
/// The service is cheap to clone; clones share the same buffer.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use wearlink::{DataSyncService, SinkConfig, SyncConfig};
/// # use wearlink::sink::{HttpSink, KeyValueTokenStore};
/// # use wearlink::storage::MemoryStore;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let tokens = Arc::new(KeyValueTokenStore::new(Arc::new(MemoryStore::default())));
/// let sink = Arc::new(HttpSink::new(&SinkConfig::default(), tokens)?);
/// let sync = DataSyncService::new(sink, SyncConfig::default());
///
/// sync.start("AA:BB:CC:DD:EE:FF", "Watch S3").await;
/// // ... samples arrive through add_data ...
/// if sync.force_sync_now().await.is_err() {
///     println!("{} samples still pending", sync.buffer_size().await);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DataSyncService {
    inner: Arc<SyncInner>,
}

impl DataSyncService {
    /// Create a stopped service uploading to `sink`
    #[must_use]
    pub fn new(sink: Arc<dyn RemoteSink>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                sink,
                config,
                buffer: RwLock::new(SyncBuffer::default()),
                target: RwLock::new(SyncTarget::default()),
                flush_guard: Mutex::new(()),
                threshold_flush_pending: AtomicBool::new(false),
                timer: Mutex::new(None),
                last_sync: RwLock::new(None),
            }),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Point uploads at a device and arm the periodic timer
    ///
    /// Any previous timer is cancelled. If samples are already buffered a
    /// flush is started right away instead of waiting for the first tick.
    pub async fn start(&self, device_id: &str, device_name: &str) {
        info!("Starting sync service for device: {}", device_name);

        *self.inner.target.write().await = SyncTarget {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
        };

        self.stop().await;

        let period = self.inner.config.sync_interval();
        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                debug!("Periodic sync tick");
                SyncInner::spawn_flush(&inner, "timer");
            }
        });
        *self.inner.timer.lock().await = Some(timer);

        if !self.inner.buffer.read().await.samples.is_empty() {
            SyncInner::spawn_flush(&self.inner, "start");
        }
    }

    /// Cancel the periodic timer
    ///
    /// The buffer is kept and an in-flight flush runs to completion.
    pub async fn stop(&self) {
        if let Some(timer) = self.inner.timer.lock().await.take() {
            timer.abort();
            info!("Sync service stopped");
        }
    }

    /// Whether the periodic timer is armed
    pub async fn is_running(&self) -> bool {
        self.inner
            .timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Append a sample to the tail of the buffer, returning the new length
    ///
    /// Reaching the flush threshold starts an immediate upload regardless of
    /// the timer.
    pub async fn add_data(&self, sample: HealthSample) -> usize {
        let len = {
            let mut buffer = self.inner.buffer.write().await;
            buffer.samples.push_back(sample);

            if let Some(cap) = self.inner.config.max_buffered_samples {
                let excess = buffer.samples.len().saturating_sub(cap);
                if excess > 0 {
                    warn!("Buffer cap of {} reached, dropping {} oldest", cap, excess);
                    buffer.drop_head(excess);
                }
            }
            buffer.samples.len()
        };
        debug!("Data added to buffer. Total: {} records", len);

        if len >= self.inner.config.flush_threshold
            && !self
                .inner
                .threshold_flush_pending
                .swap(true, Ordering::SeqCst)
        {
            info!("Buffer full, syncing immediately...");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                if let Err(e) = inner.flush().await {
                    debug!("Threshold sync failed: {}", e);
                }
                inner.threshold_flush_pending.store(false, Ordering::SeqCst);
            });
        }

        len
    }

    /// Upload the buffered samples
    ///
    /// Returns the number of samples uploaded, `0` when there was nothing to
    /// send.
    ///
    /// # Errors
    ///
    /// Returns [`WearableError::NoDevice`] if the service was never started,
    /// or the sink's error. On error the buffer is unchanged.
    pub async fn flush(&self) -> Result<usize> {
        self.inner.flush().await
    }

    /// Upload now, on behalf of the user
    ///
    /// # Errors
    ///
    /// Same as [`flush`](Self::flush).
    pub async fn force_sync_now(&self) -> Result<usize> {
        info!("Force sync triggered by user");
        self.flush().await
    }

    /// Number of samples waiting for upload
    pub async fn buffer_size(&self) -> usize {
        self.inner.buffer.read().await.samples.len()
    }

    /// Discard every buffered sample
    pub async fn clear_buffer(&self) {
        let mut buffer = self.inner.buffer.write().await;
        let len = buffer.samples.len();
        buffer.drop_head(len);
        info!("Buffer cleared ({} samples discarded)", len);
    }

    /// Time of the last successful upload
    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_sync.read().await
    }

    /// Device uploads are currently attributed to
    pub async fn device_id(&self) -> String {
        self.inner.target.read().await.device_id.clone()
    }
}

impl SyncInner {
    fn spawn_flush(inner: &Arc<Self>, trigger: &'static str) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            if let Err(e) = inner.flush().await {
                debug!("Sync triggered by {} failed: {}", trigger, e);
            }
        });
    }

    async fn flush(&self) -> Result<usize> {
        let _guard = self.flush_guard.lock().await;

        let (snapshot, removed_at_snapshot) = {
            let buffer = self.buffer.read().await;
            if buffer.samples.is_empty() {
                debug!("No data to sync");
                return Ok(0);
            }
            let snapshot: Vec<WireHealthRecord> =
                buffer.samples.iter().map(WireHealthRecord::from).collect();
            (snapshot, buffer.removed)
        };

        let target = self.target.read().await.clone();
        if target.device_id.is_empty() {
            warn!("Sync requested before a device was set, keeping {} samples", snapshot.len());
            return Err(WearableError::NoDevice);
        }

        info!(
            "Syncing {} records for {} to server...",
            snapshot.len(),
            target.device_name
        );

        match self.sink.send(&target.device_id, &snapshot).await {
            Ok(response) => {
                {
                    let mut buffer = self.buffer.write().await;
                    // Whatever left the head since the snapshot was part of it
                    let already_gone =
                        usize::try_from(buffer.removed - removed_at_snapshot).unwrap_or(usize::MAX);
                    buffer.drop_head(snapshot.len().saturating_sub(already_gone));
                }
                *self.last_sync.write().await = Some(Utc::now());
                info!(
                    "Sync successful, {} records uploaded: {}",
                    snapshot.len(),
                    response.message
                );
                Ok(snapshot.len())
            }
            Err(e) => {
                if e.requires_reauth() {
                    warn!("Sync rejected, credential needs refresh: {}", e);
                } else {
                    error!("Sync failed: {}", e);
                }
                Err(e)
            }
        }
    }
}

impl Drop for SyncInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample, RecordingSink};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn service(sink: &Arc<RecordingSink>) -> DataSyncService {
        DataSyncService::new(sink.clone(), SyncConfig::default())
    }

    #[tokio::test]
    async fn test_scenario_start_add_flush() {
        let sink = Arc::new(RecordingSink::default());
        let sync = service(&sink);

        sync.start("dev1", "Watch").await;
        assert_eq!(sync.add_data(sample(61)).await, 1);
        assert_eq!(sync.add_data(sample(62)).await, 2);

        assert_eq!(assert_ok!(sync.flush().await), 2);
        assert_eq!(sync.buffer_size().await, 0);
        assert!(sync.last_sync().await.is_some());

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, "dev1");
        let rates: Vec<u32> = batches[0].1.iter().map(|r| r.heart_rate).collect();
        assert_eq!(rates, vec![61, 62]);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let sync = service(&sink);

        assert_eq!(assert_ok!(sync.flush().await), 0);
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test]
    async fn test_flush_without_device_keeps_samples() {
        let sink = Arc::new(RecordingSink::default());
        let sync = service(&sink);

        sync.add_data(sample(60)).await;
        assert!(matches!(sync.flush().await, Err(WearableError::NoDevice)));
        assert_eq!(sync.buffer_size().await, 1);
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_samples_added_during_request() {
        let sink = Arc::new(RecordingSink::gated());
        sink.fail_next(500);
        let sync = service(&sink);
        sync.start("dev1", "Watch").await;

        sync.add_data(sample(60)).await;
        sync.add_data(sample(61)).await;

        let in_flight = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.flush().await })
        };
        sink.wait_until_started(1).await;

        sync.add_data(sample(62)).await;
        sink.release();

        assert_err!(in_flight.await.unwrap());
        assert_eq!(sync.buffer_size().await, 3);
        assert!(sync.last_sync().await.is_none());

        // The next flush sends all three, still in arrival order
        sink.release();
        assert_eq!(assert_ok!(sync.flush().await), 3);
        let rates: Vec<u32> = sink.batches()[1].1.iter().map(|r| r.heart_rate).collect();
        assert_eq!(rates, vec![60, 61, 62]);
    }

    #[tokio::test]
    async fn test_successful_flush_removes_only_snapshot() {
        let sink = Arc::new(RecordingSink::gated());
        let sync = service(&sink);
        sync.start("dev1", "Watch").await;

        sync.add_data(sample(70)).await;
        sync.add_data(sample(71)).await;

        let in_flight = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.flush().await })
        };
        sink.wait_until_started(1).await;

        sync.add_data(sample(72)).await;
        sink.release();

        assert_eq!(in_flight.await.unwrap().unwrap(), 2);
        assert_eq!(sync.buffer_size().await, 1);

        sink.release();
        assert_eq!(sync.flush().await.unwrap(), 1);

        let sent: Vec<u32> = sink
            .batches()
            .iter()
            .flat_map(|(_, records)| records.iter().map(|r| r.heart_rate))
            .collect();
        assert_eq!(sent, vec![70, 71, 72]);
    }

    #[tokio::test]
    async fn test_unauthorized_keeps_buffer() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_next(401);
        let sync = service(&sink);
        sync.start("dev1", "Watch").await;
        sync.add_data(sample(60)).await;

        let err = sync.force_sync_now().await.unwrap_err();
        assert!(err.requires_reauth());
        assert_eq!(sync.buffer_size().await, 1);

        assert_eq!(sync.force_sync_now().await.unwrap(), 1);
        assert_eq!(sync.buffer_size().await, 0);
    }

    #[tokio::test]
    async fn test_threshold_triggers_flush_at_100_not_99() {
        let sink = Arc::new(RecordingSink::default());
        let sync = service(&sink);
        sync.start("dev1", "Watch").await;

        for i in 0..99 {
            sync.add_data(sample(60 + i % 40)).await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.attempts(), 0);

        sync.add_data(sample(99)).await;
        assert!(sink.wait_for_attempts(1).await);
        assert_eq!(sink.batches()[0].1.len(), 100);
        assert_eq!(sync.buffer_size().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_flushes_are_serialized() {
        let sink = Arc::new(RecordingSink::gated());
        let sync = service(&sink);
        sync.start("dev1", "Watch").await;
        sync.add_data(sample(60)).await;
        sync.add_data(sample(61)).await;

        let first = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.flush().await })
        };
        sink.wait_until_started(1).await;
        let second = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.force_sync_now().await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // The second trigger is waiting on the guard, not sending
        assert_eq!(sink.started(), 1);

        sink.release();
        assert_eq!(first.await.unwrap().unwrap(), 2);
        assert_eq!(second.await.unwrap().unwrap(), 0);
        assert_eq!(sink.attempts(), 1);
    }

    #[tokio::test]
    async fn test_clear_during_flush_keeps_new_samples() {
        let sink = Arc::new(RecordingSink::gated());
        let sync = service(&sink);
        sync.start("dev1", "Watch").await;
        sync.add_data(sample(60)).await;

        let in_flight = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.flush().await })
        };
        sink.wait_until_started(1).await;

        sync.clear_buffer().await;
        sync.add_data(sample(90)).await;
        sink.release();

        assert_eq!(in_flight.await.unwrap().unwrap(), 1);
        assert_eq!(sync.buffer_size().await, 1);
    }

    #[tokio::test]
    async fn test_buffer_cap_drops_oldest() {
        let sink = Arc::new(RecordingSink::default());
        let config = SyncConfig {
            flush_threshold: 1_000,
            max_buffered_samples: Some(3),
            ..Default::default()
        };
        let sync = DataSyncService::new(sink.clone(), config);
        sync.start("dev1", "Watch").await;

        for bpm in 60..65 {
            sync.add_data(sample(bpm)).await;
        }
        assert_eq!(sync.buffer_size().await, 3);

        sync.flush().await.unwrap();
        let rates: Vec<u32> = sink.batches()[0].1.iter().map(|r| r.heart_rate).collect();
        assert_eq!(rates, vec![62, 63, 64]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_periodically() {
        let sink = Arc::new(RecordingSink::default());
        let sync = service(&sink);
        sync.start("dev1", "Watch").await;
        assert!(sync.is_running().await);

        sync.add_data(sample(60)).await;
        tokio::time::sleep(Duration::from_secs(29 * 60)).await;
        assert_eq!(sink.attempts(), 0);

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert!(sink.wait_for_attempts(1).await);
        assert_eq!(sync.buffer_size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer_but_keeps_buffer() {
        let sink = Arc::new(RecordingSink::default());
        let sync = service(&sink);
        sync.start("dev1", "Watch").await;
        sync.add_data(sample(60)).await;

        sync.stop().await;
        assert!(!sync.is_running().await);

        tokio::time::sleep(Duration::from_secs(2 * 60 * 60)).await;
        assert_eq!(sink.attempts(), 0);
        assert_eq!(sync.buffer_size().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_timer() {
        let sink = Arc::new(RecordingSink::default());
        let sync = service(&sink);
        sync.start("dev1", "Watch").await;

        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        sync.start("dev1", "Watch").await;
        sync.add_data(sample(60)).await;

        // The first timer would have fired at the 30 minute mark
        tokio::time::sleep(Duration::from_secs(21 * 60)).await;
        assert_eq!(sink.attempts(), 0);
        assert_eq!(sync.buffer_size().await, 1);

        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert!(sink.wait_for_attempts(1).await);
        assert_eq!(sink.attempts(), 1);
        assert_eq!(sync.buffer_size().await, 0);
    }

    #[tokio::test]
    async fn test_start_with_pending_samples_flushes_immediately() {
        let sink = Arc::new(RecordingSink::default());
        let sync = service(&sink);
        sync.start("dev1", "Watch").await;
        sync.add_data(sample(60)).await;
        sync.stop().await;

        sync.start("dev2", "Band").await;
        assert!(sink.wait_for_attempts(1).await);
        assert_eq!(sink.batches()[0].0, "dev2");
        assert_eq!(sync.device_id().await, "dev2");
    }

    #[tokio::test]
    async fn test_stop_does_not_cancel_in_flight_flush() {
        let sink = Arc::new(RecordingSink::gated());
        let sync = service(&sink);
        sync.start("dev1", "Watch").await;
        sync.add_data(sample(60)).await;

        let in_flight = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.flush().await })
        };
        sink.wait_until_started(1).await;

        sync.stop().await;
        sink.release();

        assert_eq!(in_flight.await.unwrap().unwrap(), 1);
        assert_eq!(sync.buffer_size().await, 0);
    }
}
