//! Session engine for BLE padlocks.
//!
//! One [`Session`] drives one lock over one GATT link: it serializes the
//! command pipeline, correlates responses out of the notification stream,
//! polls the lock state in the background and publishes both observables
//! (lock state, connection state) as latest-value channels.
//!
//! ```text
//! caller task            inbound pump                 status poller
//!     │                       │                            │
//!     │ lock()/unlock()       │ notifications              │ every 5-10 s
//!     ▼                       ▼                            ▼
//!  command gate ──> transport write        reassembly ──> query
//!     │                                         │
//!     └──── await pending promise <── frames ───┘
//! ```
//!
//! [`select`] maps scan results and credentials onto a protocol family.

pub mod config;
pub mod select;
pub mod session;

pub use config::SessionConfig;
pub use select::{G_SERIES_NAME_HINTS, is_g_series_name, is_tt_series_name, select_protocol};
pub use session::Session;
