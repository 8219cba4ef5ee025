//! Platform-independent GATT service selection.
//!
//! Lock vendors do not publish a fixed service UUID; discovery has to pick
//! the vendor service out of whatever the peripheral advertises. The rules,
//! distilled from field captures across both lock families:
//!
//! 1. Skip the well-known standard services (generic access/attribute,
//!    device information, battery, current time, immediate alert) and DFU
//!    services — none of them carry the lock protocol.
//! 2. A candidate must expose at least one characteristic with WRITE or
//!    WRITE_WITHOUT_RESPONSE and one with NOTIFY or INDICATE.
//! 3. Nordic UART (`6e400001-…`) gets a strong preference: most of the
//!    deployed hardware is an nRF chip running the stock UART service.
//!
//! Platform adapters feed their discovered services through
//! [`select_profile`] and use the returned [`GattProfile`] for the rest of
//! the session.

use crate::traits::GattProfile;
use tracing::debug;
use uuid::Uuid;

/// Client Characteristic Configuration Descriptor.
pub const CCCD_UUID: Uuid = uuid16(0x2902);
/// CCCD value enabling notifications.
pub const CCCD_ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];

/// Nordic UART service UUID prefix (hyphenated lowercase).
const NORDIC_UART_PREFIX: &str = "6e400001";

/// Standard services that never carry the lock protocol.
const SKIPPED_SERVICES: [Uuid; 6] = [
    uuid16(0x1800), // generic access
    uuid16(0x1801), // generic attribute
    uuid16(0x180A), // device information
    uuid16(0x180F), // battery
    uuid16(0x1805), // current time
    uuid16(0x1802), // immediate alert
];

/// Nordic DFU services (secure and legacy bootloader).
const DFU_SERVICES: [Uuid; 2] = [
    uuid16(0xFE59),
    Uuid::from_u128(0x00001530_1212_efde_1523_785feabcd123),
];

/// Expand a 16-bit assigned number into the Bluetooth base UUID.
const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x00000000_0000_1000_8000_00805f9b34fb)
}

/// Characteristic description produced by platform discovery.
#[derive(Debug, Clone)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicInfo {
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }

    #[must_use]
    pub fn is_notifying(&self) -> bool {
        self.notify || self.indicate
    }
}

/// Service description produced by platform discovery.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    fn is_skipped(&self) -> bool {
        SKIPPED_SERVICES.contains(&self.uuid) || DFU_SERVICES.contains(&self.uuid)
    }

    fn is_nordic_uart(&self) -> bool {
        self.uuid
            .hyphenated()
            .to_string()
            .starts_with(NORDIC_UART_PREFIX)
    }

    fn write_characteristic(&self) -> Option<&CharacteristicInfo> {
        // Prefer acknowledged writes when the service offers both.
        self.characteristics
            .iter()
            .find(|c| c.write)
            .or_else(|| self.characteristics.iter().find(|c| c.is_writable()))
    }

    fn notify_characteristic(&self) -> Option<&CharacteristicInfo> {
        self.characteristics.iter().find(|c| c.is_notifying())
    }
}

/// Pick the lock-protocol service and characteristic pair.
///
/// Returns `None` when no advertised service satisfies the rules; the
/// adapter should surface that as a connection failure.
#[must_use]
pub fn select_profile(services: &[ServiceInfo]) -> Option<GattProfile> {
    let mut best: Option<(i32, GattProfile)> = None;

    for service in services {
        if service.is_skipped() {
            debug!(service = %service.uuid, "skipping standard service");
            continue;
        }
        let (Some(write), Some(notify)) =
            (service.write_characteristic(), service.notify_characteristic())
        else {
            continue;
        };

        let mut score = 1;
        if service.is_nordic_uart() {
            score += 100;
        }

        if best.as_ref().is_none_or(|(s, _)| score > *s) {
            best = Some((
                score,
                GattProfile {
                    service: service.uuid,
                    write_characteristic: write.uuid,
                    notify_characteristic: notify.uuid,
                },
            ));
        }
    }

    let profile = best.map(|(_, p)| p);
    if let Some(p) = &profile {
        debug!(
            service = %p.service,
            write = %p.write_characteristic,
            notify = %p.notify_characteristic,
            "selected GATT profile"
        );
    }
    profile
}
