//! Protocol selection from credentials and scan results.
//!
//! Supplied credentials always pin the protocol. Without credentials the
//! advertised name decides: TT-Series locks advertise their eight-digit
//! lock id as the device name, and G-Series firmware ships under a handful
//! of recognizable name fragments.

use blelock_core::{Credentials, LockId, ProtocolKind};

/// Name fragments (lowercase) that mark G-Series firmware.
pub const G_SERIES_NAME_HINTS: [&str; 5] = ["g4-", "g-lock", "gseries", "imz", "bander"];

/// Returns `true` for names shaped like a TT-Series lock id (exactly eight
/// decimal digits).
#[must_use]
pub fn is_tt_series_name(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit())
}

/// Returns `true` for names carrying a G-Series hint fragment.
#[must_use]
pub fn is_g_series_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    G_SERIES_NAME_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Map credentials and the advertised name to a protocol family.
///
/// Explicit credentials win over any name inference; the name is only a
/// secondary signal for scan-time filtering.
#[must_use]
pub fn select_protocol(
    advertised_name: Option<&str>,
    credentials: Option<&Credentials>,
) -> Option<ProtocolKind> {
    if let Some(credentials) = credentials {
        return Some(credentials.protocol());
    }
    let name = advertised_name?;
    if is_tt_series_name(name) {
        Some(ProtocolKind::TtSeries)
    } else if is_g_series_name(name) {
        Some(ProtocolKind::GSeries)
    } else {
        None
    }
}

/// Extract a lock id from a TT-Series advertised name.
#[must_use]
pub fn lock_id_from_name(name: &str) -> Option<LockId> {
    if is_tt_series_name(name) {
        LockId::new(name).ok()
    } else {
        None
    }
}
