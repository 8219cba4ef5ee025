//! The transport contract the session engine depends on.
//!
//! Methods return explicit `impl Future + Send` rather than plain
//! `async fn` because the engine awaits them from spawned tasks, which
//! requires `Send` futures over generic transports.

use blelock_core::{Result, constants::BLE_CHUNK_SIZE};
use std::future::Future;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Write semantics for a GATT characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Await the peripheral's write-completion callback.
    WithResponse,
    /// Fire-and-forget write.
    WithoutResponse,
}

/// Out-of-band link-level change reported by the platform stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected { error: Option<String> },
}

/// The characteristics a connected session operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub write_characteristic: Uuid,
    pub notify_characteristic: Uuid,
}

/// Capability set the session engine needs from a GATT link.
///
/// Implementations own the platform specifics: establishing the link,
/// running service discovery (see [`crate::discovery::select_profile`] for
/// the selection rules), writing the CCCD descriptor, and pushing every
/// notification payload and link change into the channels handed out by
/// [`take_inbound`](Transport::take_inbound) /
/// [`take_events`](Transport::take_events).
pub trait Transport: Send + 'static {
    /// Establish the GATT link and run service discovery.
    ///
    /// Returns the selected service and write/notify characteristic pair.
    fn connect(&mut self) -> impl Future<Output = Result<GattProfile>> + Send;

    /// Enable notifications on the notify characteristic.
    ///
    /// Implementations write the CCCD descriptor (0x2902) with the
    /// enable-notification value and resolve once the descriptor write
    /// completes.
    fn enable_notifications(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Write a payload to the write characteristic.
    ///
    /// Payloads above the effective MTU must be split into chunks of at
    /// most [`BLE_CHUNK_SIZE`] bytes with
    /// [`CHUNK_PACING`](blelock_core::constants::CHUNK_PACING) between
    /// chunks (see [`chunk_payload`]). `WithResponse` writes resolve on the
    /// write-completion callback; `WithoutResponse` writes resolve
    /// immediately.
    fn write(&mut self, payload: &[u8], mode: WriteMode)
    -> impl Future<Output = Result<()>> + Send;

    /// Current signal strength, if the platform can read it.
    fn read_rssi(&mut self) -> impl Future<Output = Result<Option<i16>>> + Send;

    /// Tear the link down. Idempotent.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    /// Take the notification stream. Single consumer; yields every
    /// notification payload in arrival order.
    ///
    /// # Errors
    /// Returns `Error::Transport` if the stream was already taken.
    fn take_inbound(&mut self) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Take the link-event stream. Single consumer.
    ///
    /// # Errors
    /// Returns `Error::Transport` if the stream was already taken.
    fn take_events(&mut self) -> Result<mpsc::Receiver<LinkEvent>>;

    /// Peripheral address, for logging and error reporting.
    fn address(&self) -> &str;
}

/// Split a payload into MTU-sized chunks.
///
/// Empty payloads yield a single empty chunk so a zero-length write still
/// reaches the peripheral.
pub fn chunk_payload(payload: &[u8]) -> Vec<&[u8]> {
    if payload.is_empty() {
        return vec![payload];
    }
    payload.chunks(BLE_CHUNK_SIZE).collect()
}
