//! Wired serial transport.
//!
//! Fixed line configuration; the byte stream has no inherent message
//! boundaries, so `requires_framing` is declared and the length-prefixed
//! layer in [`crate::framing`] must sit above this transport. No signal
//! strength and no push-notification concept exist on this medium.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialPortType, SerialStream,
    StopBits,
};
use tracing::{debug, info, warn};

use crate::error::{TransportError, is_link_dropped_text};
use crate::transport::{
    ConnectionState, DeviceInfo, FrameFanout, StateCell, Transport, TransportType,
};

const BAUD_RATE: u32 = 115_200;
const READ_BUF_LEN: usize = 1024;

struct SerialLink {
    writer: WriteHalf<SerialStream>,
    read_task: JoinHandle<()>,
}

struct SerialInner {
    state: StateCell,
    data: FrameFanout,
    scanning: AtomicBool,
    disposed: AtomicBool,
    link: Mutex<Option<SerialLink>>,
}

impl SerialInner {
    fn spawn_read_loop(inner: &Arc<Self>, mut reader: ReadHalf<SerialStream>) -> JoinHandle<()> {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let mut buf = [0u8; READ_BUF_LEN];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        info!("serial port closed by peer");
                        inner.state.set(ConnectionState::Disconnected);
                        break;
                    }
                    Ok(n) => {
                        inner.data.publish(buf[..n].to_vec());
                    }
                    Err(e) => {
                        // Steady-state read errors surface only as a state
                        // transition, never to unrelated callers.
                        warn!("serial read failed: {e}");
                        inner.state.set(ConnectionState::Disconnected);
                        break;
                    }
                }
            }
        })
    }

    async fn open_port(inner: &Arc<Self>, path: &str) -> Result<(), TransportError> {
        let builder = tokio_serial::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(500));

        let mut stream = builder.open_native_async()?;

        // Assert the control lines; some adapters hold the device in reset
        // until DTR comes up. Drivers that reject the ioctl are tolerated.
        if let Err(e) = stream.write_data_terminal_ready(true) {
            debug!("could not assert DTR: {e}");
        }
        if let Err(e) = stream.write_request_to_send(true) {
            debug!("could not assert RTS: {e}");
        }

        let (reader, writer) = tokio::io::split(stream);
        let read_task = Self::spawn_read_loop(inner, reader);

        let mut link = inner.link.lock().await;
        *link = Some(SerialLink { writer, read_task });
        Ok(())
    }

    /// Resource teardown without touching the state cell.
    async fn teardown(&self) {
        let mut link = self.link.lock().await;
        if let Some(link) = link.take() {
            link.read_task.abort();
            // Dropping the writer half closes the port handle.
        }
    }
}

pub struct SerialTransport {
    inner: Arc<SerialInner>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SerialInner {
                state: StateCell::new(),
                data: FrameFanout::new(),
                scanning: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                link: Mutex::new(None),
            }),
        }
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Serial
    }

    fn requires_framing(&self) -> bool {
        true
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
        _timeout: Duration,
    ) -> Result<mpsc::Receiver<DeviceInfo>, TransportError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        if self.inner.scanning.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyScanning);
        }

        // Port enumeration completes immediately; results are still handed
        // out lazily to keep the scan contract uniform across transports.
        let ports = tokio_serial::available_ports();
        self.inner.scanning.store(false, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let ports = match ports {
                Ok(ports) => ports,
                Err(e) => {
                    warn!("serial port enumeration failed: {e}");
                    return;
                }
            };
            for port in ports {
                let name = match &port.port_type {
                    SerialPortType::UsbPort(usb) => usb
                        .product
                        .clone()
                        .unwrap_or_else(|| port.port_name.clone()),
                    _ => port.port_name.clone(),
                };
                let info = DeviceInfo {
                    id: port.port_name.clone(),
                    name,
                    transport: TransportType::Serial,
                    address: port.port_name.clone(),
                    rssi: None,
                };
                if tx.send(info).await.is_err() {
                    break;
                }
            }
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
                warn!("connect while connecting: cleaning up and retrying");
                self.inner.teardown().await;
            }
            ConnectionState::Error => {
                self.inner.teardown().await;
            }
            _ => {}
        }

        self.inner.state.set(ConnectionState::Connecting);
        info!(port = %device.id, baud = BAUD_RATE, "opening serial port");

        match SerialInner::open_port(&self.inner, &device.id).await {
            Ok(()) => {
                self.inner.state.set(ConnectionState::Connected);
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

        let mut link = self.inner.link.lock().await;
        let link = link.as_mut().ok_or(TransportError::NotConnected)?;

        let result = async {
            link.writer.write_all(frame).await?;
            link.writer.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if is_link_dropped_text(&e.to_string()) {
                    self.inner.state.set(ConnectionState::Disconnected);
                    Err(TransportError::LinkLost(e.to_string()))
                } else {
                    Err(TransportError::Io(e))
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<Option<Vec<u8>>, TransportError> {
        // The read loop is always pushing; there is nothing to poll for.
        Ok(None)
    }

    async fn enable_notifications(&self) -> Result<(), TransportError> {
        debug!("serial transport has no notification concept");
        Ok(())
    }

    async fn read_rssi(&self) -> Option<i16> {
        None
    }

    async fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        let _ = self.disconnect().await;
        self.inner.state.close();
        self.inner.data.close();
    }
}
