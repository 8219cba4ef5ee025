//! Wall-clock derived serial numbers and nonces for the G-Series envelope.
//!
//! Every encrypted G-Series frame carries a 6-byte BCD serial the device
//! checks for monotonicity, plus a 4-byte random nonce used purely as an
//! anti-replay token. The serial source is an explicit value rather than a
//! hidden global so tests can pin it to a fixed instant; production code
//! shares one process-wide clock through [`SerialClock::global`].

use blelock_core::BcdTimestamp;
use chrono::{Local, NaiveDateTime};
use std::sync::{Arc, Mutex, OnceLock};

/// Monotonic 6-byte BCD serial source.
///
/// Serials are derived from the wall clock, so a clock step backwards (NTP
/// correction, timezone change) can violate monotonicity. The device
/// rejects such frames with a bad-serial result; the clock only logs the
/// violation and keeps going, because refusing to build frames would brick
/// the session over a one-second skew.
#[derive(Debug)]
pub struct SerialClock {
    inner: Mutex<ClockInner>,
}

#[derive(Debug)]
struct ClockInner {
    source: Source,
    last: Option<[u8; 6]>,
}

#[derive(Debug)]
enum Source {
    System,
    Fixed(NaiveDateTime),
}

impl SerialClock {
    /// Clock backed by the local system time.
    #[must_use]
    pub fn system() -> Self {
        SerialClock {
            inner: Mutex::new(ClockInner {
                source: Source::System,
                last: None,
            }),
        }
    }

    /// Deterministic clock that always reads the given instant.
    ///
    /// Intended for tests; repeated reads trip the monotonicity warning by
    /// design.
    #[must_use]
    pub fn fixed(at: NaiveDateTime) -> Self {
        SerialClock {
            inner: Mutex::new(ClockInner {
                source: Source::Fixed(at),
                last: None,
            }),
        }
    }

    /// The process-wide shared clock used by default codec instances.
    #[must_use]
    pub fn global() -> Arc<SerialClock> {
        static GLOBAL: OnceLock<Arc<SerialClock>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(SerialClock::system()))
            .clone()
    }

    /// Produce the next serial.
    ///
    /// BCD encoding preserves ordering within a century, so monotonicity is
    /// checked by byte comparison against the previous value.
    #[must_use]
    pub fn next(&self) -> [u8; 6] {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = match inner.source {
            Source::System => Local::now().naive_local(),
            Source::Fixed(at) => at,
        };
        let serial = BcdTimestamp::from_naive(&now).into_bytes();

        if let Some(last) = inner.last
            && serial <= last
        {
            tracing::warn!(
                last = %hex::encode(last),
                next = %hex::encode(serial),
                "serial clock is not strictly monotonic"
            );
        }
        inner.last = Some(serial);
        serial
    }
}

/// Four random bytes for the encrypted envelope.
///
/// Anti-replay padding only; a process-local PRNG is sufficient and a
/// CSPRNG is not required here.
#[must_use]
pub fn nonce4() -> [u8; 4] {
    rand::random()
}
