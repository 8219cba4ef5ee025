//! Transport seam between the session engine and platform GATT stacks.
//!
//! The engine never talks to a Bluetooth API directly; it depends on the
//! narrow [`Transport`] trait defined here. A platform adapter (btleplug,
//! CoreBluetooth, Android GATT, ...) implements the trait; the bundled
//! [`mock::MockTransport`] implements it for tests and development.
//!
//! ```text
//! Session engine
//!     │
//!     └─> Transport (trait)
//!            ├─> platform adapter ──(GATT)──> lock hardware
//!            └─> MockTransport    ──(channels)──> test harness
//! ```
//!
//! [`discovery`] holds the platform-independent half of service discovery:
//! given the advertised services and characteristic properties, pick the
//! vendor service and its write/notify characteristic pair.

pub mod discovery;
pub mod mock;
pub mod traits;

pub use discovery::{CharacteristicInfo, ServiceInfo, select_profile};
pub use mock::{MockTransport, MockTransportHandle};
pub use traits::{GattProfile, LinkEvent, Transport, WriteMode, chunk_payload};
