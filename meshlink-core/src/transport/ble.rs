//! Bluetooth Low Energy transport.
//!
//! Role mapping over the radio's GATT service is fixed: one write-only
//! channel to the device, one readable channel from it, and a small
//! notify-only counter whose value is irrelevant — receipt of any
//! notification on it solely signals that the from-device channel should be
//! drained by repeated reads until one comes back empty. When the counter
//! characteristic is absent or cannot notify, the transport degrades to
//! timed polling of the from-device channel.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{TransportError, is_auth_failure_text, is_link_dropped_text};
use crate::transport::{
    ConnectionState, DeviceInfo, FrameFanout, StateCell, Transport, TransportType,
};

/// Primary mesh-radio service.
const MESH_SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);
/// Write-only channel toward the device.
const TORADIO_UUID: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);
/// Read channel from the device.
const FROMRADIO_UUID: Uuid = Uuid::from_u128(0x2c55e69e_4993_11ed_b878_0242ac120002);
/// Pre-2.0 firmware exposes the read channel under this id.
const FROMRADIO_LEGACY_UUID: Uuid = Uuid::from_u128(0x8ba2bcc2_ee02_4a55_a531_c525c5e454d5);
/// Notify-only counter; its value is never inspected.
const FROMNUM_UUID: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);

/// Standard Device Information service and the fields read from it.
const DEVICE_INFO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
const MANUFACTURER_NAME_UUID: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
const MODEL_NUMBER_UUID: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
const FIRMWARE_REVISION_UUID: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
const SERIAL_NUMBER_UUID: Uuid = Uuid::from_u128(0x00002a25_0000_1000_8000_00805f9b34fb);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Polling cadence when the counter characteristic cannot notify.
const POLL_PERIOD: Duration = Duration::from_millis(100);
/// Consecutive auth-classified poll failures that force the error state.
const AUTH_ERROR_LIMIT: u32 = 3;
/// Largest write the device accepts in one attribute operation. Host stacks
/// negotiate the ATT MTU themselves; this tracks the usable chunk limit.
const WRITE_CHUNK_LIMIT: usize = 512;

/// Identification fields read opportunistically during service discovery.
/// Absent fields mean the read failed or the device does not expose them.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetadata {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub serial_number: Option<String>,
}

struct BleLink {
    peripheral: Peripheral,
    to_radio: Characteristic,
    from_radio: Characteristic,
    from_num: Option<Characteristic>,
    notifying: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct BleInner {
    adapter: Adapter,
    state: StateCell,
    data: FrameFanout,
    scanning: AtomicBool,
    disposed: AtomicBool,
    discovered: Mutex<HashMap<String, Peripheral>>,
    link: Mutex<Option<BleLink>>,
    metadata: StdMutex<DeviceMetadata>,
    consecutive_auth_errors: AtomicU32,
}

impl BleInner {
    /// Read the from-device channel until an empty read, publishing every
    /// frame. Notifications are already complete logical frames.
    async fn drain_from_radio(
        &self,
        peripheral: &Peripheral,
        from_radio: &Characteristic,
    ) -> Result<(), TransportError> {
        loop {
            let bytes = peripheral.read(from_radio).await?;
            if bytes.is_empty() {
                return Ok(());
            }
            self.data.publish(bytes);
        }
    }

    /// Track poll/drain errors, forcing the error state after
    /// [`AUTH_ERROR_LIMIT`] consecutive auth-classified failures. A user
    /// cancelling a pairing prompt surfaces only as generic read errors, so
    /// this is the one place that ambiguity becomes actionable.
    ///
    /// Returns `true` when the limit was hit and the caller must stop
    /// delivering and trigger teardown.
    fn note_drain_error(&self, error: &TransportError) -> bool {
        if is_auth_failure_text(&error.to_string()) {
            let count = self.consecutive_auth_errors.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(count, "auth-classified read failure: {error}");
            if count >= AUTH_ERROR_LIMIT {
                self.state.set(ConnectionState::Error);
                return true;
            }
        } else {
            self.consecutive_auth_errors.store(0, Ordering::SeqCst);
            debug!("read failure: {error}");
        }
        false
    }

    /// Resource teardown without touching the state cell. Always runs the
    /// full sequence: driver state can be inconsistent after cancelled
    /// operations even when we believe we are already disconnected.
    async fn teardown(&self) {
        let mut slot = self.link.lock().await;
        if let Some(link) = slot.take() {
            for task in &link.tasks {
                task.abort();
            }
            if link.notifying
                && let Some(from_num) = &link.from_num
            {
                let _ = link.peripheral.unsubscribe(from_num).await;
            }
            let _ = link.peripheral.disconnect().await;
        }
        self.consecutive_auth_errors.store(0, Ordering::SeqCst);
    }
}

pub struct BleTransport {
    inner: Arc<BleInner>,
}

impl BleTransport {
    /// Bind to the first available Bluetooth adapter.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                TransportError::ConnectionFailed("no bluetooth adapter present".to_string())
            })?;

        Ok(Self {
            inner: Arc::new(BleInner {
                adapter,
                state: StateCell::new(),
                data: FrameFanout::new(),
                scanning: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                discovered: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                metadata: StdMutex::new(DeviceMetadata::default()),
                consecutive_auth_errors: AtomicU32::new(0),
            }),
        })
    }

    /// Identification metadata read during the last service discovery.
    pub fn device_metadata(&self) -> DeviceMetadata {
        self.inner.metadata.lock().unwrap().clone()
    }

    async fn establish(&self, device: &DeviceInfo) -> Result<(), TransportError> {
        let peripheral = {
            let discovered = self.inner.discovered.lock().await;
            discovered
                .get(&device.id)
                .cloned()
                .ok_or_else(|| TransportError::DeviceNotFound(device.id.clone()))?
        };

        match time::timeout(CONNECT_TIMEOUT, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let text = e.to_string();
                if is_auth_failure_text(&text) {
                    return Err(TransportError::AuthenticationFailed(text));
                }
                return Err(TransportError::ConnectionFailed(text));
            }
            Err(_) => return Err(TransportError::Timeout(CONNECT_TIMEOUT)),
        }

        // A failure past this point must release the device handle before
        // the error is surfaced.
        let (to_radio, from_radio, from_num) =
            match Self::locate_characteristics(&peripheral).await {
                Ok(found) => found,
                Err(e) => {
                    let _ = peripheral.disconnect().await;
                    return Err(e);
                }
            };

        self.read_device_metadata(&peripheral, &peripheral.characteristics())
            .await;

        let mut tasks = Vec::new();
        tasks.push(self.spawn_disconnect_watcher(peripheral.id()));

        {
            let mut slot = self.inner.link.lock().await;
            *slot = Some(BleLink {
                peripheral: peripheral.clone(),
                to_radio,
                from_radio: from_radio.clone(),
                from_num: from_num.clone(),
                notifying: false,
                tasks,
            });
        }

        // Push-style delivery when the counter can notify, timed polling of
        // the from-device channel otherwise.
        match self.enable_notifications().await {
            Ok(()) => {
                let task = self.spawn_notification_loop(peripheral.clone(), from_radio.clone());
                if let Some(link) = self.inner.link.lock().await.as_mut() {
                    link.tasks.push(task);
                }
            }
            Err(e) => {
                warn!("push delivery unavailable, falling back to polling: {e}");
                let task = self.spawn_poll_loop(peripheral.clone(), from_radio.clone());
                if let Some(link) = self.inner.link.lock().await.as_mut() {
                    link.tasks.push(task);
                }
            }
        }

        // Flush anything the device queued while we were away.
        let inner = &self.inner;
        if let Err(e) = inner.drain_from_radio(&peripheral, &from_radio).await {
            debug!("initial drain failed: {e}");
        }

        Ok(())
    }

    async fn locate_characteristics(
        peripheral: &Peripheral,
    ) -> Result<(Characteristic, Characteristic, Option<Characteristic>), TransportError> {
        peripheral.discover_services().await?;
        let characteristics = peripheral.characteristics();

        let to_radio = characteristics
            .iter()
            .find(|c| c.uuid == TORADIO_UUID)
            .cloned()
            .ok_or_else(|| {
                TransportError::ConnectionFailed("to-device characteristic missing".to_string())
            })?;
        let from_radio = characteristics
            .iter()
            .find(|c| c.uuid == FROMRADIO_UUID || c.uuid == FROMRADIO_LEGACY_UUID)
            .cloned()
            .ok_or_else(|| {
                TransportError::ConnectionFailed("from-device characteristic missing".to_string())
            })?;
        let from_num = characteristics
            .iter()
            .find(|c| c.uuid == FROMNUM_UUID)
            .cloned();

        Ok((to_radio, from_radio, from_num))
    }

    /// Best-effort reads of standard device identification. Failures leave
    /// the fields unset; never fatal.
    async fn read_device_metadata(
        &self,
        peripheral: &Peripheral,
        characteristics: &std::collections::BTreeSet<Characteristic>,
    ) {
        let mut metadata = DeviceMetadata::default();

        for c in characteristics {
            if c.service_uuid != DEVICE_INFO_SERVICE_UUID {
                continue;
            }
            let field = match c.uuid {
                u if u == MANUFACTURER_NAME_UUID => &mut metadata.manufacturer,
                u if u == MODEL_NUMBER_UUID => &mut metadata.model,
                u if u == FIRMWARE_REVISION_UUID => &mut metadata.firmware,
                u if u == SERIAL_NUMBER_UUID => &mut metadata.serial_number,
                _ => continue,
            };
            match peripheral.read(c).await {
                Ok(bytes) => {
                    *field = Some(
                        String::from_utf8(bytes)
                            .unwrap_or_else(|e| hex::encode(e.into_bytes())),
                    );
                }
                Err(e) => debug!(uuid = %c.uuid, "device info read failed: {e}"),
            }
        }

        if metadata.manufacturer.is_some() || metadata.model.is_some() {
            info!(
                manufacturer = metadata.manufacturer.as_deref().unwrap_or("?"),
                model = metadata.model.as_deref().unwrap_or("?"),
                firmware = metadata.firmware.as_deref().unwrap_or("?"),
                "device identification"
            );
        }

        *self.inner.metadata.lock().unwrap() = metadata;
    }

    fn spawn_disconnect_watcher(&self, id: btleplug::platform::PeripheralId) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut events = match inner.adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("adapter event stream unavailable: {e}");
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event
                    && gone == id
                {
                    info!("peripheral disconnected");
                    inner.state.set(ConnectionState::Disconnected);
                    break;
                }
            }
        })
    }

    fn spawn_notification_loop(
        &self,
        peripheral: Peripheral,
        from_radio: Characteristic,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("notification stream unavailable: {e}");
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                if notification.uuid != FROMNUM_UUID {
                    continue;
                }
                // The counter value is irrelevant; any notification means
                // "drain the from-device channel now".
                match inner.drain_from_radio(&peripheral, &from_radio).await {
                    Ok(()) => {
                        inner.consecutive_auth_errors.store(0, Ordering::SeqCst);
                    }
                    Err(e) => {
                        if inner.note_drain_error(&e) {
                            // Teardown aborts this task too; run it detached
                            // so it completes regardless.
                            let inner = Arc::clone(&inner);
                            tokio::spawn(async move { inner.teardown().await });
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_poll_loop(
        &self,
        peripheral: Peripheral,
        from_radio: Characteristic,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = time::interval(POLL_PERIOD);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match inner.drain_from_radio(&peripheral, &from_radio).await {
                    Ok(()) => {
                        inner.consecutive_auth_errors.store(0, Ordering::SeqCst);
                    }
                    Err(e) => {
                        if inner.note_drain_error(&e) {
                            // Teardown aborts this task too; run it detached
                            // so it completes regardless.
                            let inner = Arc::clone(&inner);
                            tokio::spawn(async move { inner.teardown().await });
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Ble
    }

    fn requires_framing(&self) -> bool {
        // Inbound notifications are already complete logical frames.
        false
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    fn state_stream(&self) -> tokio::sync::broadcast::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    fn data_stream(&self) -> tokio::sync::broadcast::Receiver<Vec<u8>> {
        self.inner.data.subscribe()
    }

    async fn scan(
        &self,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<DeviceInfo>, TransportError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        if self.inner.scanning.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyScanning);
        }

        let mut events = match self.inner.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                self.inner.scanning.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let filter = ScanFilter {
            services: vec![MESH_SERVICE_UUID],
        };
        if let Err(e) = self.inner.adapter.start_scan(filter).await {
            self.inner.scanning.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let (tx, rx) = mpsc::channel(16);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let deadline = time::Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let event = match time::timeout(remaining, events.next()).await {
                    Ok(Some(event)) => event,
                    // Timeout reached or the event stream ended.
                    _ => break,
                };
                let CentralEvent::DeviceDiscovered(id) = event else {
                    continue;
                };
                let peripheral = match inner.adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(e) => {
                        debug!("discovered peripheral vanished: {e}");
                        continue;
                    }
                };
                let properties = match peripheral.properties().await {
                    Ok(Some(properties)) => properties,
                    _ => continue,
                };

                let address = peripheral.address().to_string();
                let info = DeviceInfo {
                    id: address.clone(),
                    name: properties
                        .local_name
                        .unwrap_or_else(|| address.clone()),
                    transport: TransportType::Ble,
                    address,
                    rssi: properties.rssi,
                };
                inner
                    .discovered
                    .lock()
                    .await
                    .insert(info.id.clone(), peripheral);

                // Receiver dropped means the caller cancelled the scan.
                if tx.send(info).await.is_err() {
                    break;
                }
            }

            // Release the discovery session on every exit path.
            if let Err(e) = inner.adapter.stop_scan().await {
                debug!("stop_scan failed: {e}");
            }
            inner.scanning.store(false, Ordering::SeqCst);
        });

        Ok(rx)
    }

    async fn connect(&self, device: &DeviceInfo) -> Result<(), TransportError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }

        match self.inner.state.get() {
            ConnectionState::Connected => {
                debug!("connect ignored: already connected");
                return Ok(());
            }
            ConnectionState::Connecting => {
                // An interrupted pairing prompt can leave the driver wedged
                // mid-connect; clean up everything and start over.
                warn!("connect while connecting: cleaning up and retrying");
                self.inner.teardown().await;
            }
            ConnectionState::Error => {
                self.inner.teardown().await;
            }
            _ => {}
        }

        self.inner.state.set(ConnectionState::Connecting);
        info!(device = %device.name, "connecting");

        match self.establish(device).await {
            Ok(()) => {
                self.inner.state.set(ConnectionState::Connected);
                info!(device = %device.name, "connected");
                Ok(())
            }
            Err(e) => {
                // Teardown precedes the surfaced error.
                self.inner.teardown().await;
                self.inner.state.set(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.state.set(ConnectionState::Disconnecting);
        self.inner.teardown().await;
        self.inner.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.inner.state.get() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let (peripheral, to_radio) = {
            let link = self.inner.link.lock().await;
            let link = link.as_ref().ok_or(TransportError::NotConnected)?;
            (link.peripheral.clone(), link.to_radio.clone())
        };

        // Callers submit one complete logical frame; chunking to the
        // transfer-unit limit happens here.
        for chunk in frame.chunks(WRITE_CHUNK_LIMIT) {
            if let Err(e) = peripheral
                .write(&to_radio, chunk, WriteType::WithResponse)
                .await
            {
                let text = e.to_string();
                if is_link_dropped_text(&text) {
                    // Transition proactively so downstream consumers don't
                    // have to infer the drop from a failed write.
                    self.inner.state.set(ConnectionState::Disconnected);
                    return Err(TransportError::LinkLost(text));
                }
                if is_auth_failure_text(&text) {
                    return Err(TransportError::AuthenticationFailed(text));
                }
                return Err(e.into());
            }
        }

        Ok(())
    }

    async fn poll_once(&self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.inner.state.get() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let (peripheral, from_radio) = {
            let link = self.inner.link.lock().await;
            let link = link.as_ref().ok_or(TransportError::NotConnected)?;
            (link.peripheral.clone(), link.from_radio.clone())
        };

        let bytes = peripheral.read(&from_radio).await?;
        if bytes.is_empty() {
            Ok(None)
        } else {
            self.inner.data.publish(bytes.clone());
            Ok(Some(bytes))
        }
    }

    async fn enable_notifications(&self) -> Result<(), TransportError> {
        let mut slot = self.inner.link.lock().await;
        let link = slot.as_mut().ok_or(TransportError::NotConnected)?;

        if link.notifying {
            return Ok(());
        }
        let from_num = link.from_num.as_ref().ok_or_else(|| {
            TransportError::ConnectionFailed("counter characteristic missing".to_string())
        })?;

        link.peripheral.subscribe(from_num).await?;
        link.notifying = true;
        debug!("subscribed to counter notifications");
        Ok(())
    }

    async fn read_rssi(&self) -> Option<i16> {
        let peripheral = {
            let link = self.inner.link.lock().await;
            link.as_ref().map(|link| link.peripheral.clone())?
        };
        match peripheral.properties().await {
            Ok(Some(properties)) => properties.rssi,
            _ => None,
        }
    }

    async fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        let _ = self.disconnect().await;
        self.inner.state.close();
        self.inner.data.close();
    }
}
