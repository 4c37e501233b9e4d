use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    ble::Transport,
    error::{Result, WearableError},
    history::HealthHistory,
    protocol::{decode_sample, HealthStream},
    storage::{DeviceStore, KeyValueStore},
    sync::DataSyncService,
    types::{
        ConnectionState, DiscoveredDevice, HealthSample, SupervisorConfig, UserConfig,
        WearableDevice,
    },
    BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID, HEALTH_DATA_CHAR_UUID, HEALTH_SERVICE_UUID,
    USER_CONFIG_CHAR_UUID,
};

struct SupervisorInner {
    transport: Arc<dyn Transport>,
    devices: DeviceStore,
    health_history: HealthHistory,
    sync: DataSyncService,
    config: SupervisorConfig,
    state: watch::Sender<ConnectionState>,
    device: watch::Sender<Option<WearableDevice>>,
    latest_sample: watch::Sender<Option<HealthSample>>,
    reconnect_pending: AtomicBool,
    failed_attempts: AtomicU32,
    transfer_size: AtomicUsize,
    acquisition: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        for task in [
            self.acquisition.get_mut().take(),
            self.monitor.get_mut().take(),
            self.reconnect.get_mut().take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

/// Owner of the wearable device slot and its connection lifecycle
///
/// The supervisor connects to a wearable, streams its health records into
/// the [`DataSyncService`] and the chart [`HealthHistory`], and keeps the
/// link alive with a poll loop that schedules reconnects when it drops.
///
/// # State machine
///
/// ```text
/// Disconnected --connect--> Connecting --ok--> Connected
/// Connected    --poll sees link down--> Reconnecting
/// Reconnecting --attempt ok / link back--> Connected
/// Reconnecting --attempt fails--> Reconnecting (next poll schedules again)
/// any          --disconnect--> Disconnected
/// ```
///
/// At most one reconnect attempt is pending at any time. With a capped
/// [`ReconnectPolicy`](crate::ReconnectPolicy) the supervisor falls back to
/// `Disconnected` once the cap is reached and keeps the paired device on
/// record.
///
/// State, device and latest sample are published through
/// [`tokio::sync::watch`] channels for the presentation layer.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use wearlink::{ble::BtleplugTransport, storage::MemoryStore, sink::RemoteSink};
/// # use wearlink::{ConnectionSupervisor, DataSyncService, SupervisorConfig, SyncConfig};
/// # async fn demo(sink: Arc<dyn RemoteSink>) -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(BtleplugTransport::new().await?);
/// let sync = DataSyncService::new(sink, SyncConfig::default());
/// let supervisor = ConnectionSupervisor::new(
///     transport,
///     Arc::new(MemoryStore::default()),
///     sync,
///     SupervisorConfig::default(),
/// );
///
/// let found = supervisor.scan(supervisor.config().scan_timeout()).await?;
/// if let Some(first) = found.first() {
///     supervisor.connect(&first.id, &first.name).await?;
///     supervisor.start_monitoring().await;
/// }
///
/// let mut state = supervisor.watch_state();
/// while state.changed().await.is_ok() {
///     println!("Connection: {}", *state.borrow());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    /// Create a supervisor with an empty device slot
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
        sync: DataSyncService,
        config: SupervisorConfig,
    ) -> Self {
        let fallback_mtu = config.transfer.fallback_mtu;
        Self {
            inner: Arc::new(SupervisorInner {
                transport,
                devices: DeviceStore::new(Arc::clone(&store)),
                health_history: HealthHistory::new(store),
                sync,
                config,
                state: watch::Sender::new(ConnectionState::Disconnected),
                device: watch::Sender::new(None),
                latest_sample: watch::Sender::new(None),
                reconnect_pending: AtomicBool::new(false),
                failed_attempts: AtomicU32::new(0),
                transfer_size: AtomicUsize::new(fallback_mtu),
                acquisition: Mutex::new(None),
                monitor: Mutex::new(None),
                reconnect: Mutex::new(None),
            }),
        }
    }

    fn from_weak(weak: &Weak<SupervisorInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Device currently in the slot, if any
    #[must_use]
    pub fn device(&self) -> Option<WearableDevice> {
        self.inner.device.borrow().clone()
    }

    /// Notification transfer size of the current link in bytes
    ///
    /// Falls back to [`TransferConfig::fallback_mtu`](crate::TransferConfig::fallback_mtu)
    /// when the transport does not report a negotiated value.
    #[must_use]
    pub fn transfer_size(&self) -> usize {
        self.inner.transfer_size.load(Ordering::SeqCst)
    }

    /// Most recent decoded sample, cleared on disconnect
    #[must_use]
    pub fn latest_sample(&self) -> Option<HealthSample> {
        self.inner.latest_sample.borrow().clone()
    }

    /// Observe connection state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Observe the device slot
    #[must_use]
    pub fn watch_device(&self) -> watch::Receiver<Option<WearableDevice>> {
        self.inner.device.subscribe()
    }

    /// Observe decoded samples as they arrive
    #[must_use]
    pub fn watch_latest_sample(&self) -> watch::Receiver<Option<HealthSample>> {
        self.inner.latest_sample.subscribe()
    }

    /// Sync service the supervisor feeds
    #[must_use]
    pub fn sync(&self) -> &DataSyncService {
        &self.inner.sync
    }

    /// Chart history the supervisor feeds
    #[must_use]
    pub fn health_history(&self) -> &HealthHistory {
        &self.inner.health_history
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            info!("Connection state: {} -> {}", previous, state);
        }
    }

    /// Bring the pipeline back after an application restart
    ///
    /// The persisted device record is only advisory: its link state is
    /// checked against the transport and the record corrected if it was
    /// stale. A live link resumes acquisition, a dead one enters
    /// `Reconnecting`. Without a persisted device the most recent history
    /// entry is connected to, if there is one.
    ///
    /// A dead link gets a single scheduled reconnect attempt. Later attempts
    /// are driven by the poll loop, so call
    /// [`start_monitoring`](Self::start_monitoring) afterwards to keep
    /// retrying.
    ///
    /// # Errors
    ///
    /// Returns the store error if the persisted state cannot be read. A
    /// failing auto-connect is logged, not returned.
    pub async fn restore(&self) -> Result<Option<WearableDevice>> {
        let inner = &self.inner;

        if let Some(saved) = inner.devices.connected_device().await? {
            let link_up = inner.transport.is_connected(&saved.id).await;
            if link_up != saved.connected {
                info!(
                    "Persisted link state of {} was stale, now connected: {}",
                    saved.name, link_up
                );
                if let Err(e) = inner.devices.update_connection_status(link_up).await {
                    warn!("Failed to correct persisted device: {}", e);
                }
            }

            let device = saved.with_connected(link_up);
            if link_up {
                self.commit_connected(device.clone()).await;
            } else {
                inner.device.send_replace(Some(device.clone()));
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_reconnect().await;
            }
            return Ok(Some(device));
        }

        if let Some(recent) = inner.devices.history().await?.into_iter().next() {
            info!("Auto-connecting to last paired device: {}", recent.name);
            match self.set_device(recent).await {
                Ok(device) => return Ok(Some(device)),
                Err(e) => warn!("Auto-connect failed: {}", e),
            }
        }

        Ok(None)
    }

    /// Scan for wearables, one entry per device id
    ///
    /// # Errors
    ///
    /// Returns [`WearableError::PermissionDenied`] if Bluetooth access is
    /// refused, or the transport's scan error.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        if !self.inner.transport.request_permissions().await? {
            warn!("Bluetooth permission denied");
            return Err(WearableError::PermissionDenied);
        }

        info!("Scanning for devices...");
        let found = self.inner.transport.scan(duration).await?;

        let mut unique: Vec<DiscoveredDevice> = Vec::with_capacity(found.len());
        let mut index: HashMap<String, usize> = HashMap::new();
        for device in found {
            if let Some(&at) = index.get(&device.id) {
                if device.rssi > unique[at].rssi {
                    unique[at].rssi = device.rssi;
                }
            } else {
                index.insert(device.id.clone(), unique.len());
                unique.push(device);
            }
        }

        info!("Found {} device(s)", unique.len());
        Ok(unique)
    }

    /// Connect to a device by id
    ///
    /// A device already in the history keeps its recorded type and battery.
    ///
    /// # Errors
    ///
    /// See [`set_device`](Self::set_device).
    pub async fn connect(&self, device_id: &str, name: &str) -> Result<WearableDevice> {
        let device = match self.inner.devices.history_entry(device_id).await {
            Ok(Some(known)) => known,
            Ok(None) => WearableDevice::new(device_id, name),
            Err(e) => {
                debug!("History lookup failed: {}", e);
                WearableDevice::new(device_id, name)
            }
        };
        self.set_device(device).await
    }

    /// Make `device` the supervised device and connect to it
    ///
    /// A different device in the slot is disconnected first. On success the
    /// device is persisted, moved to the front of the history, and sample
    /// acquisition and sync start.
    ///
    /// # Errors
    ///
    /// Returns [`WearableError::ConnectionFailed`] if the link could not be
    /// established, or the transport's error. The state is `Disconnected`
    /// afterwards in both cases.
    pub async fn set_device(&self, device: WearableDevice) -> Result<WearableDevice> {
        if let Some(current) = self.device() {
            if current.id != device.id {
                self.disconnect().await;
            } else if self.state() == ConnectionState::Connected {
                debug!("Already connected to {}", current.name);
                return Ok(current);
            }
        }

        self.cancel_reconnect().await;
        self.stop_acquisition().await;

        info!("Connecting to device: {}", device);
        self.set_state(ConnectionState::Connecting);

        match self.inner.transport.connect(&device.id).await {
            Ok(true) => Ok(self.commit_connected(device).await),
            Ok(false) => {
                error!("Failed to connect to {}", device.name);
                self.set_state(ConnectionState::Disconnected);
                Err(WearableError::ConnectionFailed(device.id))
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", device.name, e);
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn commit_connected(&self, device: WearableDevice) -> WearableDevice {
        let inner = &self.inner;
        let device = device.with_connected(true);

        if let Err(e) = inner.devices.save_connected_device(&device).await {
            warn!("Failed to persist device: {}", e);
        }
        if let Err(e) = inner.devices.push_history(&device).await {
            warn!("Failed to update device history: {}", e);
        }

        inner.failed_attempts.store(0, Ordering::SeqCst);
        inner.reconnect_pending.store(false, Ordering::SeqCst);
        inner.device.send_replace(Some(device.clone()));
        self.set_state(ConnectionState::Connected);

        if let Err(e) = self.start_acquisition(&device).await {
            error!("Failed to start data acquisition: {}", e);
        }
        device
    }

    async fn start_acquisition(&self, device: &WearableDevice) -> Result<()> {
        let inner = &self.inner;
        self.stop_acquisition().await;

        let transfer = inner.config.transfer;
        let size = inner
            .transport
            .negotiate_transfer_size(&device.id, transfer.preferred_mtu)
            .await
            .unwrap_or(transfer.fallback_mtu);
        inner.transfer_size.store(size, Ordering::SeqCst);
        debug!("Transfer size for {}: {} bytes", device.name, size);

        inner.sync.start(&device.id, &device.name).await;

        let subscription = inner
            .transport
            .subscribe(&device.id, HEALTH_SERVICE_UUID, HEALTH_DATA_CHAR_UUID)
            .await?;
        let mut stream = HealthStream::spawn(subscription, &transfer);

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(sample) = stream.recv().await {
                let Some(supervisor) = Self::from_weak(&weak) else {
                    break;
                };
                supervisor.on_sample(sample).await;
            }
            debug!("Health data stream closed");
        });

        *inner.acquisition.lock().await = Some(task);
        info!("Health data acquisition started for {}", device.name);
        Ok(())
    }

    async fn stop_acquisition(&self) {
        if let Some(task) = self.inner.acquisition.lock().await.take() {
            task.abort();
            debug!("Health data acquisition stopped");
        }
    }

    async fn on_sample(&self, sample: HealthSample) {
        debug!(
            "Sample received: hr={} spo2={} steps={}",
            sample.heart_rate, sample.spo2, sample.steps
        );

        if let Err(e) = self.inner.health_history.add(&sample).await {
            warn!("Failed to update health history: {}", e);
        }
        self.inner.sync.add_data(sample.clone()).await;
        self.inner.latest_sample.send_replace(Some(sample));
    }

    /// Drop the link and forget the supervised device
    ///
    /// Buffered samples are discarded and the persisted device removed. The
    /// pairing history is kept. Transport errors are logged.
    pub async fn disconnect(&self) {
        info!("Disconnecting from device");
        let inner = &self.inner;

        self.cancel_reconnect().await;
        self.stop_acquisition().await;

        if let Some(device) = self.device() {
            if let Err(e) = inner.transport.disconnect(&device.id).await {
                warn!("Transport disconnect failed: {}", e);
            }
        }
        if let Err(e) = inner.devices.remove_connected_device().await {
            warn!("Failed to remove persisted device: {}", e);
        }

        inner.sync.stop().await;
        inner.sync.clear_buffer().await;

        inner.failed_attempts.store(0, Ordering::SeqCst);
        inner.latest_sample.send_replace(None);
        inner.device.send_replace(None);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Compare the known link state with the transport and react to changes
    ///
    /// Returns the state after the check.
    pub async fn poll_once(&self) -> ConnectionState {
        let Some(device) = self.device() else {
            return self.state();
        };
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            return state;
        }

        let link_up = self.inner.transport.is_connected(&device.id).await;
        match (state, link_up) {
            (ConnectionState::Connected, false) => {
                warn!("Connection lost to {}", device.name);
                if let Err(e) = self.inner.devices.update_connection_status(false).await {
                    warn!("Failed to persist connection status: {}", e);
                }
                self.stop_acquisition().await;
                self.inner
                    .device
                    .send_replace(Some(device.with_connected(false)));
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_reconnect().await;
            }
            (ConnectionState::Reconnecting, true) => {
                info!("Link to {} restored", device.name);
                self.cancel_reconnect().await;
                let restored = self.device_from_history(device).await;
                self.commit_connected(restored).await;
            }
            (ConnectionState::Reconnecting, false) => self.schedule_reconnect().await,
            _ => {}
        }

        self.state()
    }

    async fn device_from_history(&self, fallback: WearableDevice) -> WearableDevice {
        match self.inner.devices.history_entry(&fallback.id).await {
            Ok(Some(known)) => known,
            Ok(None) => fallback,
            Err(e) => {
                debug!("History lookup failed: {}", e);
                fallback
            }
        }
    }

    async fn schedule_reconnect(&self) {
        let inner = &self.inner;
        let failed = inner.failed_attempts.load(Ordering::SeqCst);
        if !inner.config.reconnect.allows_attempt(failed) {
            self.give_up(failed);
            return;
        }
        if inner.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already pending");
            return;
        }

        let delay = inner.config.reconnect.delay();
        debug!("Reconnect scheduled in {:?}", delay);

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(supervisor) = Self::from_weak(&weak) {
                supervisor.attempt_reconnect().await;
            }
        });
        *inner.reconnect.lock().await = Some(task);
    }

    async fn attempt_reconnect(&self) {
        let inner = &self.inner;
        let Some(current) = self.device() else {
            inner.reconnect_pending.store(false, Ordering::SeqCst);
            return;
        };
        if self.state() != ConnectionState::Reconnecting {
            inner.reconnect_pending.store(false, Ordering::SeqCst);
            return;
        }

        info!("Attempting to reconnect to {}", current.name);
        match inner.transport.connect(&current.id).await {
            Ok(true) => {
                let restored = self.device_from_history(current).await;
                self.commit_connected(restored).await;
                info!("Reconnected");
            }
            outcome => {
                let failed = inner.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                match outcome {
                    Err(e) => warn!("Reconnect attempt {} failed: {}", failed, e),
                    _ => warn!("Reconnect attempt {} failed", failed),
                }
                inner.reconnect_pending.store(false, Ordering::SeqCst);
                if !inner.config.reconnect.allows_attempt(failed) {
                    self.give_up(failed);
                }
            }
        }
    }

    fn give_up(&self, failed: u32) {
        warn!("Giving up reconnecting after {} failed attempts", failed);
        self.set_state(ConnectionState::Disconnected);
    }

    async fn cancel_reconnect(&self) {
        if let Some(task) = self.inner.reconnect.lock().await.take() {
            task.abort();
        }
        self.inner.reconnect_pending.store(false, Ordering::SeqCst);
    }

    /// Start polling the link every [`SupervisorConfig::poll_interval`]
    pub async fn start_monitoring(&self) {
        self.stop_monitoring().await;

        let period = self.inner.config.poll_interval();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(supervisor) = Self::from_weak(&weak) else {
                    break;
                };
                supervisor.poll_once().await;
            }
        });

        *self.inner.monitor.lock().await = Some(task);
        info!("Connection monitoring started");
    }

    /// Stop the poll loop
    pub async fn stop_monitoring(&self) {
        if let Some(task) = self.inner.monitor.lock().await.take() {
            task.abort();
            info!("Connection monitoring stopped");
        }
    }

    /// Stop every background task, keeping persisted state for the next [`restore`](Self::restore)
    pub async fn shutdown(&self) {
        self.stop_monitoring().await;
        self.cancel_reconnect().await;
        self.stop_acquisition().await;
        self.inner.sync.stop().await;
        info!("Supervisor shut down");
    }

    fn active_device(&self) -> Result<WearableDevice> {
        let device = self.device().ok_or(WearableError::NoDevice)?;
        if self.state() == ConnectionState::Connected {
            Ok(device)
        } else {
            Err(WearableError::Disconnected)
        }
    }

    /// Read the battery level of the connected device
    ///
    /// # Errors
    ///
    /// Returns [`WearableError::NoDevice`] or [`WearableError::Disconnected`]
    /// without a live device, the transport's read error, or
    /// [`WearableError::Protocol`] if the characteristic is empty.
    pub async fn refresh_battery(&self) -> Result<i16> {
        let device = self.active_device()?;
        let value = self
            .inner
            .transport
            .read_characteristic(&device.id, BATTERY_SERVICE_UUID, BATTERY_LEVEL_CHAR_UUID)
            .await?;
        let level = value
            .first()
            .copied()
            .map(i16::from)
            .ok_or_else(|| WearableError::Protocol("empty battery level".to_string()))?;

        self.inner.devices.update_battery_level(level).await?;
        self.inner.device.send_modify(|slot| {
            if let Some(current) = slot.as_mut().filter(|d| d.id == device.id) {
                current.battery = level;
            }
        });
        info!("Battery level of {}: {}%", device.name, level);
        Ok(level)
    }

    /// Read and decode the health characteristic once
    ///
    /// # Errors
    ///
    /// Returns the same link errors as [`refresh_battery`](Self::refresh_battery),
    /// or [`WearableError::ParseError`] if the value is not a health record.
    pub async fn read_current_sample(&self) -> Result<HealthSample> {
        let device = self.active_device()?;
        let value = self
            .inner
            .transport
            .read_characteristic(&device.id, HEALTH_SERVICE_UUID, HEALTH_DATA_CHAR_UUID)
            .await?;
        decode_sample(&value)
    }

    /// Send the user's body profile to the wearable
    ///
    /// # Errors
    ///
    /// Returns the same link errors as [`refresh_battery`](Self::refresh_battery),
    /// or the transport's write error.
    pub async fn write_user_config(&self, config: &UserConfig) -> Result<()> {
        let device = self.active_device()?;
        let payload = serde_json::to_vec(config)?;
        self.inner
            .transport
            .write_characteristic(&device.id, HEALTH_SERVICE_UUID, USER_CONFIG_CHAR_UUID, &payload)
            .await?;
        info!("User config written to {}", device.name);
        Ok(())
    }

    /// Pairing history, most recent first
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn history(&self) -> Result<Vec<WearableDevice>> {
        self.inner.devices.history().await
    }

    /// Remove a device from the pairing history
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn forget_device(&self, device_id: &str) -> Result<bool> {
        self.inner.devices.remove_from_history(device_id).await
    }

    /// Upload buffered samples now
    ///
    /// # Errors
    ///
    /// See [`DataSyncService::flush`].
    pub async fn force_sync(&self) -> Result<usize> {
        self.inner.sync.force_sync_now().await
    }

    /// Samples waiting for upload
    pub async fn pending_count(&self) -> usize {
        self.inner.sync.buffer_size().await
    }
}
