//! Mock transport for testing and development without radio hardware.
//!
//! [`MockTransport::new`] returns a `(transport, handle)` pair: the
//! transport side goes to the session engine, the handle side stays with
//! the test, which uses it to inject notification payloads, drop the link
//! and observe every write the engine performs.

use crate::traits::{GattProfile, LinkEvent, Transport, WriteMode, chunk_payload};
use blelock_core::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

const INBOUND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 8;

/// One write observed by the handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenPayload {
    pub payload: Vec<u8>,
    pub mode: WriteMode,
    /// How many MTU-sized chunks the payload was split into.
    pub chunks: usize,
}

/// Simulated GATT transport.
#[derive(Debug)]
pub struct MockTransport {
    address: String,
    profile: GattProfile,
    connected: bool,
    notifications_enabled: bool,
    inbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
    events_rx: Option<mpsc::Receiver<LinkEvent>>,
    written_tx: mpsc::UnboundedSender<WrittenPayload>,
    fail_writes: Arc<AtomicBool>,
    rssi: Arc<Mutex<Option<i16>>>,
}

/// Test-side controller for a [`MockTransport`].
#[derive(Debug)]
pub struct MockTransportHandle {
    inbound_tx: mpsc::Sender<Vec<u8>>,
    events_tx: mpsc::Sender<LinkEvent>,
    written_rx: mpsc::UnboundedReceiver<WrittenPayload>,
    fail_writes: Arc<AtomicBool>,
    rssi: Arc<Mutex<Option<i16>>>,
}

impl MockTransport {
    /// Create a mock transport with a default address.
    #[must_use]
    pub fn new() -> (Self, MockTransportHandle) {
        Self::with_address("AA:BB:CC:DD:EE:FF")
    }

    /// Create a mock transport reporting the given peripheral address.
    #[must_use]
    pub fn with_address(address: &str) -> (Self, MockTransportHandle) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let fail_writes = Arc::new(AtomicBool::new(false));
        let rssi = Arc::new(Mutex::new(Some(-55)));

        let transport = MockTransport {
            address: address.to_string(),
            profile: GattProfile {
                service: Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e),
                write_characteristic: Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e),
                notify_characteristic: Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e),
            },
            connected: false,
            notifications_enabled: false,
            inbound_rx: Some(inbound_rx),
            events_rx: Some(events_rx),
            written_tx,
            fail_writes: fail_writes.clone(),
            rssi: rssi.clone(),
        };

        let handle = MockTransportHandle {
            inbound_tx,
            events_tx,
            written_rx,
            fail_writes,
            rssi,
        };

        (transport, handle)
    }
}

impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<GattProfile> {
        debug!(address = %self.address, "mock transport connecting");
        self.connected = true;
        Ok(self.profile.clone())
    }

    async fn enable_notifications(&mut self) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        self.notifications_enabled = true;
        Ok(())
    }

    async fn write(&mut self, payload: &[u8], mode: WriteMode) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Transport("injected write failure".to_string()));
        }
        // Chunking is recorded but not paced; tests should not wait out the
        // real 100 ms inter-chunk delay.
        let chunks = chunk_payload(payload).len();
        self.written_tx
            .send(WrittenPayload {
                payload: payload.to_vec(),
                mode,
                chunks,
            })
            .map_err(|_| Error::Transport("write observer dropped".to_string()))
    }

    async fn read_rssi(&mut self) -> Result<Option<i16>> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        Ok(*self.rssi.lock().await)
    }

    async fn disconnect(&mut self) {
        if self.connected {
            debug!(address = %self.address, "mock transport disconnecting");
        }
        self.connected = false;
        self.notifications_enabled = false;
    }

    fn take_inbound(&mut self) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx
            .take()
            .ok_or_else(|| Error::Transport("inbound stream already taken".to_string()))
    }

    fn take_events(&mut self) -> Result<mpsc::Receiver<LinkEvent>> {
        self.events_rx
            .take()
            .ok_or_else(|| Error::Transport("event stream already taken".to_string()))
    }

    fn address(&self) -> &str {
        &self.address
    }
}

impl MockTransportHandle {
    /// Inject one notification payload.
    pub async fn notify(&self, payload: &[u8]) {
        let _ = self.inbound_tx.send(payload.to_vec()).await;
    }

    /// Inject a frame fragmented into MTU-sized notifications, the way a
    /// real peripheral delivers anything above 20 bytes.
    pub async fn notify_fragmented(&self, frame: &[u8]) {
        for chunk in chunk_payload(frame) {
            let _ = self.inbound_tx.send(chunk.to_vec()).await;
        }
    }

    /// Report a link drop to the session.
    pub async fn drop_link(&self, error: Option<String>) {
        let _ = self.events_tx.send(LinkEvent::Disconnected { error }).await;
    }

    /// Await the next write performed by the session.
    pub async fn next_write(&mut self) -> Option<WrittenPayload> {
        self.written_rx.recv().await
    }

    /// Pop an already-performed write without waiting.
    pub fn try_next_write(&mut self) -> Option<WrittenPayload> {
        self.written_rx.try_recv().ok()
    }

    /// Make subsequent writes fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Change the RSSI the transport reports.
    pub async fn set_rssi(&self, rssi: Option<i16>) {
        *self.rssi.lock().await = rssi;
    }
}
