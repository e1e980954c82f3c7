//! The capability contract every physical transport must satisfy, plus the
//! shared state/data fan-out plumbing both variants build on.

pub mod ble;
pub mod serial;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::TransportError;

/// Which physical transport a device was discovered on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum TransportType {
    Ble,
    Serial,
}

/// Connection lifecycle of a transport instance.
///
/// Not strictly linear: both `Error` and `Disconnected` may re-enter
/// `Connecting`. Owned exclusively by the transport; observers only read it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// Immutable discovery record produced by `scan`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Transport-scoped identifier used to address the device in `connect`.
    pub id: String,
    pub name: String,
    pub transport: TransportType,
    pub address: String,
    pub rssi: Option<i16>,
}

impl DeviceInfo {
    /// Discovery record for a serial port known by path, without scanning.
    pub fn serial_port(path: &str) -> Self {
        Self {
            id: path.to_string(),
            name: path.to_string(),
            transport: TransportType::Serial,
            address: path.to_string(),
            rssi: None,
        }
    }
}

/// The contract any physical transport must satisfy.
///
/// One instance owns one physical connection. All operations may suspend at
/// I/O boundaries; the transport itself enforces the connect-time idempotency
/// guards through its own state checks, not an external lock.
#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Whether an external framing layer must be applied to the inbound byte
    /// stream before envelopes can be decoded from it.
    fn requires_framing(&self) -> bool;

    /// Point-in-time connection state.
    fn state(&self) -> ConnectionState;

    /// Stream of state changes, in occurrence order, exact duplicates
    /// suppressed.
    fn state_stream(&self) -> broadcast::Receiver<ConnectionState>;

    /// Stream of inbound frames in arrival order. Duplicates are possible and
    /// expected; mesh retransmissions are deduplicated downstream, never here.
    fn data_stream(&self) -> broadcast::Receiver<Vec<u8>>;

    /// Discover reachable devices for at most `timeout`.
    ///
    /// The returned receiver yields devices lazily as they are found and ends
    /// on timeout, error, or when the receiver is dropped. The underlying
    /// discovery session is released on every exit path. Not safe to run
    /// twice concurrently on the same instance.
    async fn scan(
        &self,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<DeviceInfo>, TransportError>;

    /// Establish a connection to a previously discovered device.
    ///
    /// While already `Connected` this is a silent no-op. While `Connecting`
    /// it forces a full local cleanup and retries (recovers from interrupted
    /// pairing prompts). From `Error` it cleans up first. On failure the
    /// transport has already torn itself down before the error is returned.
    async fn connect(&self, device: &DeviceInfo) -> Result<(), TransportError>;

    /// Tear down the connection. Unconditionally safe in any state; always
    /// performs full resource cleanup even if already logically disconnected,
    /// because driver state can be left inconsistent after cancelled
    /// operations.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send one complete logical frame. Chunking below the transfer-unit
    /// limit happens inside the transport.
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Single best-effort read, used only as a fallback when push-style
    /// notification is unavailable.
    async fn poll_once(&self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Best-effort subscribe to push-style delivery; no-op where the
    /// transport has no such concept.
    async fn enable_notifications(&self) -> Result<(), TransportError>;

    /// Signal strength of the active connection, absent where unsupported.
    async fn read_rssi(&self) -> Option<i16>;

    /// Disconnect and close both streams. Terminal.
    async fn dispose(&self);
}

const STATE_CHANNEL_CAPACITY: usize = 32;
const DATA_CHANNEL_CAPACITY: usize = 256;

/// Holder of the current connection state plus its change broadcast.
///
/// `set` suppresses exact duplicates so the stream never emits the same
/// state twice in a row.
pub(crate) struct StateCell {
    current: Mutex<ConnectionState>,
    tx: Mutex<Option<broadcast::Sender<ConnectionState>>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            current: Mutex::new(ConnectionState::Disconnected),
            tx: Mutex::new(Some(tx)),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.current.lock().unwrap()
    }

    /// Transition to `next`, returning whether a change was emitted.
    pub(crate) fn set(&self, next: ConnectionState) -> bool {
        let mut current = self.current.lock().unwrap();
        if *current == next {
            return false;
        }
        debug!(from = %current, to = %next, "connection state change");
        *current = next;
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(next);
        }
        true
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.subscribe(),
            // After close, hand out a receiver that reports Closed right away.
            None => broadcast::channel(1).1,
        }
    }

    pub(crate) fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// Fan-out for inbound frames. Same close semantics as [`StateCell`].
pub(crate) struct FrameFanout {
    tx: Mutex<Option<broadcast::Sender<Vec<u8>>>>,
}

impl FrameFanout {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    pub(crate) fn publish(&self, frame: Vec<u8>) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            // Send only fails when no receiver is subscribed; frames are not
            // buffered for late subscribers.
            let _ = tx.send(frame);
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub(crate) fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_suppresses_duplicates() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();

        assert!(cell.set(ConnectionState::Connecting));
        assert!(!cell.set(ConnectionState::Connecting));
        assert!(cell.set(ConnectionState::Connected));
        assert!(!cell.set(ConnectionState::Connected));
        assert!(cell.set(ConnectionState::Disconnected));

        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[test]
    fn test_state_cell_initial_state() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        // Setting the initial state again emits nothing.
        assert!(!cell.set(ConnectionState::Disconnected));
    }

    #[test]
    fn test_closed_cell_hands_out_dead_receivers() {
        let cell = StateCell::new();
        cell.close();
        let mut rx = cell.subscribe();
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
        // Further transitions after close are recorded but not broadcast.
        cell.set(ConnectionState::Connecting);
        assert_eq!(cell.get(), ConnectionState::Connecting);
    }

    #[test]
    fn test_frame_fanout_delivers_in_order() {
        let fanout = FrameFanout::new();
        let mut rx = fanout.subscribe();
        fanout.publish(vec![1]);
        fanout.publish(vec![1]); // duplicates are expected, never suppressed
        fanout.publish(vec![2]);
        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        assert_eq!(rx.try_recv().unwrap(), vec![2]);
    }
}
