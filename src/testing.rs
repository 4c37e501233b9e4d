//! Scripted collaborators shared by the unit tests

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Notify, Semaphore};
use uuid::Uuid;

use crate::{
    ble::{Subscription, Transport},
    error::{Result, WearableError},
    sink::{RemoteSink, SinkResponse},
    types::{DiscoveredDevice, HealthSample, WireHealthRecord},
};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub fn sample(heart_rate: u32) -> HealthSample {
    HealthSample {
        heart_rate,
        spo2: 98,
        steps: 100,
        calories: 4.5,
        alert_score: None,
        timestamp: Utc::now(),
    }
}

pub fn sample_payload(heart_rate: u32) -> Vec<u8> {
    format!(r#"{{"hr":{heart_rate},"spo2":97,"steps":1200,"cal":55.5}}"#).into_bytes()
}

async fn wait_until(notify: &Notify, reached: impl Fn() -> bool) -> bool {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            let notified = notify.notified();
            if reached() {
                return;
            }
            notified.await;
        }
    })
    .await
    .is_ok()
}

/// Sink recording every batch, optionally holding each request until released
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<(String, Vec<WireHealthRecord>)>>,
    failures: Mutex<VecDeque<u16>>,
    gate: Option<Semaphore>,
    started: AtomicUsize,
    attempts: AtomicUsize,
    progress: Notify,
}

impl RecordingSink {
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        }
    }

    pub fn fail_next(&self, status: u16) {
        self.failures.lock().unwrap().push_back(status);
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn batches(&self) -> Vec<(String, Vec<WireHealthRecord>)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn wait_until_started(&self, count: usize) {
        assert!(
            wait_until(&self.progress, || self.started() >= count).await,
            "sink never received request {count}"
        );
    }

    pub async fn wait_for_attempts(&self, count: usize) -> bool {
        wait_until(&self.progress, || self.attempts() >= count).await
    }
}

#[async_trait]
impl RemoteSink for RecordingSink {
    async fn send(&self, device_id: &str, records: &[WireHealthRecord]) -> Result<SinkResponse> {
        self.batches
            .lock()
            .unwrap()
            .push((device_id.to_string(), records.to_vec()));
        self.started.fetch_add(1, Ordering::SeqCst);
        self.progress.notify_waiters();

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let failure = self.failures.lock().unwrap().pop_front();
        let result = match failure {
            Some(401) => Err(WearableError::Unauthorized("token expired".into())),
            Some(status) => Err(WearableError::Upload {
                status,
                message: "rejected".into(),
            }),
            None => Ok(SinkResponse {
                message: "ok".into(),
            }),
        };

        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.progress.notify_waiters();
        result
    }
}

/// Transport whose radio is a set of flags flipped by the test
pub struct MockTransport {
    permission: AtomicBool,
    devices: Mutex<Vec<DiscoveredDevice>>,
    links: Mutex<HashMap<String, bool>>,
    connect_results: Mutex<VecDeque<bool>>,
    connect_default: AtomicBool,
    connect_calls: AtomicUsize,
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>,
    unsubscribes: Arc<AtomicUsize>,
    reads: Mutex<HashMap<Uuid, Bytes>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    reported_transfer_size: Mutex<Option<usize>>,
    progress: Notify,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            permission: AtomicBool::new(true),
            devices: Mutex::default(),
            links: Mutex::default(),
            connect_results: Mutex::default(),
            connect_default: AtomicBool::new(true),
            connect_calls: AtomicUsize::new(0),
            subscribers: Mutex::default(),
            unsubscribes: Arc::new(AtomicUsize::new(0)),
            reads: Mutex::default(),
            writes: Mutex::default(),
            reported_transfer_size: Mutex::default(),
            progress: Notify::new(),
        }
    }
}

impl MockTransport {
    pub fn deny_permissions(&self) {
        self.permission.store(false, Ordering::SeqCst);
    }

    pub fn advertise(&self, id: &str, name: &str, rssi: i16) {
        self.devices.lock().unwrap().push(DiscoveredDevice {
            id: id.to_string(),
            name: name.to_string(),
            rssi,
        });
    }

    /// Flip the link state without going through connect/disconnect
    pub fn set_link(&self, id: &str, up: bool) {
        self.links.lock().unwrap().insert(id.to_string(), up);
    }

    pub fn queue_connect(&self, result: bool) {
        self.connect_results.lock().unwrap().push_back(result);
    }

    pub fn set_connect_default(&self, result: bool) {
        self.connect_default.store(result, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub async fn wait_for_connect_calls(&self, count: usize) -> bool {
        wait_until(&self.progress, || self.connect_calls() >= count).await
    }

    pub async fn wait_for_subscriber(&self, id: &str) -> bool {
        wait_until(&self.progress, || {
            self.subscribers.lock().unwrap().contains_key(id)
        })
        .await
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Deliver a notification chunk, `false` if nobody is subscribed
    pub fn push_chunk(&self, id: &str, chunk: &[u8]) -> bool {
        self.subscribers
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|sender| sender.send(Bytes::copy_from_slice(chunk)).is_ok())
    }

    pub fn set_read(&self, characteristic: Uuid, value: &[u8]) {
        self.reads
            .lock()
            .unwrap()
            .insert(characteristic, Bytes::copy_from_slice(value));
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    /// Transfer size granted on the next negotiations, unreported by default
    pub fn report_transfer_size(&self, size: usize) {
        *self.reported_transfer_size.lock().unwrap() = Some(size);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request_permissions(&self) -> Result<bool> {
        Ok(self.permission.load(Ordering::SeqCst))
    }

    async fn scan(&self, _duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn connect(&self, device_id: &str) -> Result<bool> {
        let result = self
            .connect_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.connect_default.load(Ordering::SeqCst));
        if result {
            self.set_link(device_id, true);
        }
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.progress.notify_waiters();
        Ok(result)
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        self.set_link(device_id, false);
        self.subscribers.lock().unwrap().remove(device_id);
        Ok(())
    }

    async fn is_connected(&self, device_id: &str) -> bool {
        self.links
            .lock()
            .unwrap()
            .get(device_id)
            .copied()
            .unwrap_or(false)
    }

    async fn read_characteristic(
        &self,
        _device_id: &str,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Bytes> {
        self.reads
            .lock()
            .unwrap()
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| WearableError::Protocol(format!("{characteristic} not readable")))
    }

    async fn write_characteristic(
        &self,
        _device_id: &str,
        _service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((characteristic, data.to_vec()));
        Ok(())
    }

    async fn subscribe(
        &self,
        device_id: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<Subscription> {
        let (sender, subscription) = Subscription::channel();
        self.subscribers
            .lock()
            .unwrap()
            .insert(device_id.to_string(), sender);
        self.progress.notify_waiters();

        let unsubscribes = Arc::clone(&self.unsubscribes);
        Ok(subscription.on_close(move || {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
        }))
    }

    async fn negotiate_transfer_size(&self, _device_id: &str, preferred: usize) -> Option<usize> {
        self.reported_transfer_size
            .lock()
            .unwrap()
            .map(|granted| granted.min(preferred))
    }
}
