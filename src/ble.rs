use async_trait::async_trait;
use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, WearableError},
    types::DiscoveredDevice,
};

/// Platform BLE capability consumed by the supervisor
///
/// Implementations wrap a radio stack. Everything above this trait is
/// platform independent, which is also what lets the pipeline run against a
/// scripted transport in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ask the platform for Bluetooth access, `false` if denied or the radio is off
    async fn request_permissions(&self) -> Result<bool>;

    /// Scan for devices during `duration`
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>>;

    /// Connect to a device, `Ok(false)` when the link could not be established
    async fn connect(&self, device_id: &str) -> Result<bool>;

    /// Disconnect from a device
    async fn disconnect(&self, device_id: &str) -> Result<()>;

    /// Actual link state as reported by the platform
    async fn is_connected(&self, device_id: &str) -> bool;

    /// Read a characteristic value
    async fn read_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Bytes>;

    /// Write a characteristic value with response
    async fn write_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()>;

    /// Subscribe to change notifications of a characteristic
    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Subscription>;

    /// Negotiate the notification transfer size
    ///
    /// Returns `None` when the platform does not expose the negotiated value,
    /// in which case the caller assumes its configured fallback.
    async fn negotiate_transfer_size(&self, device_id: &str, preferred: usize) -> Option<usize>;
}

/// Live notification subscription for one characteristic
///
/// Chunks arrive in FIFO order. Dropping the subscription stops the
/// forwarding task and unsubscribes from the characteristic.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Bytes>,
    task: Option<JoinHandle<()>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a subscription fed by the returned sender
    #[must_use]
    pub fn channel() -> (mpsc::UnboundedSender<Bytes>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            sender,
            Self {
                receiver,
                task: None,
                on_close: None,
            },
        )
    }

    /// Attach the task that feeds this subscription, aborted on drop
    #[must_use]
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Attach a hook run once when the subscription is dropped
    #[must_use]
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Wait for the next raw chunk, `None` once the source is gone
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Stop receiving notifications
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("has_task", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

/// [`Transport`] backed by `btleplug`
pub struct BtleplugTransport {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    connect_timeout_ms: u64,
}

impl BtleplugTransport {
    /// Create a new transport on the platform Bluetooth manager
    ///
    /// # Errors
    ///
    /// Returns [`WearableError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            connect_timeout_ms: 30_000,
        })
    }

    /// Override the connection timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    async fn central(&self) -> Result<Adapter> {
        let adapters = self.manager.adapters().await?;
        adapters
            .into_iter()
            .next()
            .ok_or(WearableError::PermissionDenied)
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(device_id) {
            return Ok(peripheral.clone());
        }

        // Not seen by a scan in this session, ask the adapter for known devices
        let central = self.central().await?;
        for peripheral in central.peripherals().await? {
            if peripheral.id().to_string() == device_id {
                self.peripherals
                    .lock()
                    .await
                    .insert(device_id.to_string(), peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(WearableError::DeviceNotFound(device_id.to_string()))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or_else(|| {
                WearableError::Protocol(format!(
                    "Characteristic {characteristic} not found in service {service}"
                ))
            })
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn request_permissions(&self) -> Result<bool> {
        // Desktop stacks have no runtime prompt, an adapter being present is the grant
        Ok(!self.manager.adapters().await?.is_empty())
    }

    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        info!("Starting scan for wearables...");

        let central = self.central().await?;
        central.start_scan(ScanFilter::default()).await?;

        tokio::time::sleep(duration).await;

        central.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            // Unnamed advertisers are beacons and accessories, not wearables
            let Some(name) = properties.local_name else {
                continue;
            };

            // CoreBluetooth hides addresses, the platform id is unique everywhere
            let id = peripheral.id().to_string();
            let device = DiscoveredDevice {
                id: id.clone(),
                name,
                rssi: properties.rssi.unwrap_or(-100),
            };
            debug!("Found device: {} ({} dBm)", device.name, device.rssi);

            self.peripherals.lock().await.insert(id, peripheral);
            devices.push(device);
        }

        info!("Scan completed. Found {} device(s)", devices.len());
        Ok(devices)
    }

    async fn connect(&self, device_id: &str) -> Result<bool> {
        info!("Connecting to device: {}", device_id);

        let peripheral = self.peripheral(device_id).await?;
        if peripheral.is_connected().await.unwrap_or(false) {
            return Ok(true);
        }

        if !connect_within(device_id, self.connect_timeout_ms, peripheral.connect()).await? {
            return Ok(false);
        }

        peripheral.discover_services().await?;

        info!("Successfully connected to {}", device_id);
        Ok(true)
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self, device_id: &str) -> bool {
        match self.peripheral(device_id).await {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn read_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Bytes> {
        let peripheral = self.peripheral(device_id).await?;
        let characteristic = Self::find_characteristic(&peripheral, service, characteristic)?;
        let value = peripheral.read(&characteristic).await?;
        Ok(Bytes::from(value))
    }

    async fn write_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        let characteristic = Self::find_characteristic(&peripheral, service, characteristic)?;
        debug!("Writing {} bytes to {}", data.len(), characteristic.uuid);

        peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(|e| WearableError::Protocol(format!("Failed to write characteristic: {e}")))
    }

    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Subscription> {
        let peripheral = self.peripheral(device_id).await?;
        let characteristic = Self::find_characteristic(&peripheral, service, characteristic)?;

        let mut notifications = peripheral.notifications().await?;
        peripheral.subscribe(&characteristic).await?;

        let (sender, subscription) = Subscription::channel();
        let char_uuid = characteristic.uuid;
        let task = tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                if data.uuid == char_uuid && sender.send(Bytes::from(data.value)).is_err() {
                    break;
                }
            }
            debug!("Notification stream for {} ended", char_uuid);
        });

        let hook_peripheral = peripheral.clone();
        Ok(subscription.with_task(task).on_close(move || {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = hook_peripheral.unsubscribe(&characteristic).await {
                        debug!("Unsubscribe failed: {}", e);
                    }
                });
            }
        }))
    }

    async fn negotiate_transfer_size(&self, device_id: &str, preferred: usize) -> Option<usize> {
        // btleplug leaves MTU exchange to the OS and does not report the result
        debug!(
            "Transfer size for {} not reported by the platform (wanted {})",
            device_id, preferred
        );
        None
    }
}

/// Drive a connect future, mapping a rejected link to `Ok(false)`
///
/// # Errors
///
/// Returns [`WearableError::Timeout`] if the attempt does not finish within
/// `timeout_ms`.
async fn connect_within<F>(device_id: &str, timeout_ms: u64, connect: F) -> Result<bool>
where
    F: Future<Output = std::result::Result<(), btleplug::Error>>,
{
    match timeout(Duration::from_millis(timeout_ms), connect).await {
        Ok(Ok(())) => Ok(true),
        Ok(Err(e)) => {
            warn!("Connection to {} failed: {}", device_id, e);
            Ok(false)
        }
        Err(_) => {
            warn!("Connection to {} timed out after {}ms", device_id, timeout_ms);
            Err(WearableError::Timeout { timeout_ms })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HEALTH_DATA_CHAR_UUID, HEALTH_SERVICE_UUID};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_uuid_constants() {
        assert_eq!(
            HEALTH_SERVICE_UUID.to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
        assert_eq!(
            HEALTH_DATA_CHAR_UUID.to_string(),
            "beb5483e-36e1-4688-b7f5-ea07361b26a8"
        );
        assert_eq!(
            crate::BATTERY_LEVEL_CHAR_UUID.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }

    #[tokio::test]
    async fn test_subscription_delivers_in_order() {
        let (sender, mut subscription) = Subscription::channel();
        sender.send(Bytes::from_static(b"{\"hr\":")).unwrap();
        sender.send(Bytes::from_static(b"70}")).unwrap();
        drop(sender);

        assert_eq!(subscription.next_chunk().await.unwrap(), "{\"hr\":");
        assert_eq!(subscription.next_chunk().await.unwrap(), "70}");
        assert!(subscription.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_runs_close_hook_once() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let (_sender, subscription) = Subscription::channel();
        let subscription = subscription.on_close(move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });

        subscription.unsubscribe();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_an_error() {
        let outcome = connect_within("AA:01", 500, futures::future::pending()).await;
        assert!(matches!(
            outcome,
            Err(WearableError::Timeout { timeout_ms: 500 })
        ));
        assert!(outcome.unwrap_err().is_recoverable());
    }

    #[tokio::test]
    async fn test_connect_rejection_is_not_an_error() {
        let rejected = connect_within("AA:01", 500, async { Err(btleplug::Error::NotConnected) });
        assert!(!rejected.await.unwrap());

        let accepted = connect_within("AA:01", 500, async { Ok(()) });
        assert!(accepted.await.unwrap());
    }
}
