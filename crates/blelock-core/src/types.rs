use crate::{
    Result,
    constants::{
        AES_KEY_LENGTH, LOCK_ID_LENGTH, MAX_PASSWORD_LENGTH, MAX_PIN_LENGTH, MIN_PASSWORD_LENGTH,
        MIN_PIN_LENGTH, PIN_WIRE_LENGTH,
    },
    error::Error,
};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use subtle::ConstantTimeEq;

/// Wire protocol family spoken by a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// G-Series ("Bander V11") framed protocol with AES envelope.
    GSeries,
    /// TT-Series ("TOTARGET A7") compact protocol.
    TtSeries,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::GSeries => write!(f, "G-Series"),
            ProtocolKind::TtSeries => write!(f, "TT-Series"),
        }
    }
}

/// Observable bolt state of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Locked,
    Unlocked,
    Unknown,
}

impl LockState {
    /// Returns `true` for a definite (non-Unknown) state.
    #[inline]
    #[must_use]
    pub fn is_known(self) -> bool {
        !matches!(self, LockState::Unknown)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Locked => write!(f, "Locked"),
            LockState::Unlocked => write!(f, "Unlocked"),
            LockState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Observable link state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    /// Returns `true` while the GATT link is usable.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Error(msg) => write!(f, "Error({msg})"),
        }
    }
}

/// Point-in-time snapshot of a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub lock_state: LockState,
    /// Battery percentage, 0-100; `None` when the device has not reported one.
    pub battery_percent: Option<u8>,
    pub is_connected: bool,
    pub rssi: Option<i16>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceStatus {
    /// Snapshot timestamp as milliseconds since the Unix epoch.
    #[must_use]
    pub fn updated_epoch_ms(&self) -> i64 {
        self.updated_at.timestamp_millis()
    }
}

/// 16-byte AES-128 key.
///
/// # Security
/// Comparison is constant-time and `Debug` never prints key material.
#[derive(Clone, Eq)]
pub struct AesKey([u8; AES_KEY_LENGTH]);

impl AesKey {
    /// Create a key from exactly 16 bytes.
    ///
    /// # Errors
    /// Returns `Error::InvalidCredentials` for any other length. Callers that
    /// must accept malformed keys can opt into [`AesKey::new_lenient`].
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != AES_KEY_LENGTH {
            return Err(Error::invalid_credentials(format!(
                "AES key must be {AES_KEY_LENGTH} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; AES_KEY_LENGTH];
        key.copy_from_slice(bytes);
        Ok(AesKey(key))
    }

    /// Coerce arbitrary input to 16 bytes by truncating or zero-padding.
    ///
    /// Off-length input is a deployment mistake the field occasionally ships
    /// anyway; this constructor logs a warning instead of rejecting.
    #[must_use]
    pub fn new_lenient(bytes: &[u8]) -> Self {
        if bytes.len() != AES_KEY_LENGTH {
            tracing::warn!(
                provided = bytes.len(),
                expected = AES_KEY_LENGTH,
                "off-length AES key coerced to 16 bytes"
            );
        }
        let mut key = [0u8; AES_KEY_LENGTH];
        let n = bytes.len().min(AES_KEY_LENGTH);
        key[..n].copy_from_slice(&bytes[..n]);
        AesKey(key)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AesKey(****)")
    }
}

impl PartialEq for AesKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl TryFrom<&[u8]> for AesKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        AesKey::new(bytes)
    }
}

/// G-Series device password (4-16 ASCII characters).
///
/// # Security
/// Implements constant-time comparison to avoid timing side channels when
/// matching stored credentials.
#[derive(Clone, Eq)]
pub struct Password(String);

impl Password {
    /// Create a password with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidCredentials` if the password is outside 4-16
    /// characters or contains non-ASCII bytes.
    pub fn new(password: &str) -> Result<Self> {
        let len = password.len();
        if !(MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&len) {
            return Err(Error::invalid_credentials(format!(
                "password must be {MIN_PASSWORD_LENGTH}-{MAX_PASSWORD_LENGTH} chars, got {len}"
            )));
        }
        if !password.is_ascii() {
            return Err(Error::invalid_credentials("password must be ASCII"));
        }
        Ok(Password(password.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Password(****)")
    }
}

impl PartialEq for Password {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl std::str::FromStr for Password {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Password::new(s)
    }
}

/// TT-Series numeric password (1-6 digits, right-padded to 6 on the wire).
#[derive(Clone, Eq)]
pub struct Pin(String);

impl Pin {
    /// Create a PIN with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidCredentials` if the PIN is outside 1-6
    /// characters or contains a non-digit.
    pub fn new(pin: &str) -> Result<Self> {
        let len = pin.len();
        if !(MIN_PIN_LENGTH..=MAX_PIN_LENGTH).contains(&len) {
            return Err(Error::invalid_credentials(format!(
                "PIN must be {MIN_PIN_LENGTH}-{MAX_PIN_LENGTH} digits, got {len}"
            )));
        }
        if !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::invalid_credentials("PIN must be numeric"));
        }
        Ok(Pin(pin.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wire form: exactly six ASCII bytes, short PINs right-padded with '0'.
    #[must_use]
    pub fn to_wire(&self) -> [u8; PIN_WIRE_LENGTH] {
        let mut wire = [b'0'; PIN_WIRE_LENGTH];
        wire[..self.0.len()].copy_from_slice(self.0.as_bytes());
        wire
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pin(****)")
    }
}

impl PartialEq for Pin {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl std::str::FromStr for Pin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Pin::new(s)
    }
}

/// TT-Series lock identifier: exactly eight decimal digits.
///
/// The all-zero sentinel requests auto-detection from the device's
/// advertised name or its first status reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockId(String);

impl LockId {
    /// The auto-detect sentinel ("00000000").
    #[must_use]
    pub fn auto_detect() -> Self {
        LockId("00000000".to_string())
    }

    /// Create a lock id with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidCredentials` unless the id is exactly eight
    /// ASCII digits.
    pub fn new(id: &str) -> Result<Self> {
        if id.len() != LOCK_ID_LENGTH || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::invalid_credentials(format!(
                "lock id must be exactly {LOCK_ID_LENGTH} decimal digits, got '{id}'"
            )));
        }
        Ok(LockId(id.to_string()))
    }

    /// Returns `true` for the auto-detect sentinel.
    #[must_use]
    pub fn is_auto_detect(&self) -> bool {
        self.0 == "00000000"
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wire form: the high four digits and low four digits as two
    /// big-endian u16 values.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 4] {
        // Validated decimal digits; both halves fit u16.
        let high: u16 = self.0[..4].parse().unwrap_or(0);
        let low: u16 = self.0[4..].parse().unwrap_or(0);
        let h = high.to_be_bytes();
        let l = low.to_be_bytes();
        [h[0], h[1], l[0], l[1]]
    }

    /// Decode the 4-byte wire form back to an eight-digit id.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        let high = u16::from_be_bytes([bytes[0], bytes[1]]);
        let low = u16::from_be_bytes([bytes[2], bytes[3]]);
        LockId(format!("{high:04}{low:04}"))
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LockId::new(s)
    }
}

/// Six-byte BCD timestamp: YY MM DD hh mm ss, one BCD field per byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BcdTimestamp([u8; 6]);

impl BcdTimestamp {
    /// Encode the current local wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_naive(&Local::now().naive_local())
    }

    /// Encode an arbitrary datetime (year taken modulo 100).
    #[must_use]
    pub fn from_naive(dt: &NaiveDateTime) -> Self {
        let bcd = |v: u8| ((v / 10) << 4) | (v % 10);
        BcdTimestamp([
            bcd((dt.year() % 100) as u8),
            bcd(dt.month() as u8),
            bcd(dt.day() as u8),
            bcd(dt.hour() as u8),
            bcd(dt.minute() as u8),
            bcd(dt.second() as u8),
        ])
    }

    /// Interpret six raw bytes as a BCD timestamp without validation.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        BcdTimestamp(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> [u8; 6] {
        self.0
    }

    /// Decode back to a datetime (years mapped to 2000-2099).
    ///
    /// Returns `None` for bytes that are not valid BCD or not a valid date.
    #[must_use]
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        let dec = |b: u8| -> Option<u32> {
            let (hi, lo) = (b >> 4, b & 0x0F);
            if hi > 9 || lo > 9 {
                return None;
            }
            Some(u32::from(hi) * 10 + u32::from(lo))
        };
        let year = 2000 + dec(self.0[0])? as i32;
        NaiveDate::from_ymd_opt(year, dec(self.0[1])?, dec(self.0[2])?)?.and_hms_opt(
            dec(self.0[3])?,
            dec(self.0[4])?,
            dec(self.0[5])?,
        )
    }
}

/// Immutable credential bundle tagged with its protocol variant.
///
/// G-Series locks require a 16-byte AES key and optionally carry a device
/// password; TT-Series locks require a lock id (or the auto-detect
/// sentinel) and a numeric PIN, and optionally encrypt with an AES key.
#[derive(Debug, Clone)]
pub enum Credentials {
    GSeries {
        key: AesKey,
        password: Option<Password>,
        issued_at: DateTime<Utc>,
    },
    TtSeries {
        lock_id: LockId,
        pin: Pin,
        key: Option<AesKey>,
        issued_at: DateTime<Utc>,
    },
}

impl Credentials {
    /// Build G-Series credentials stamped with the current time.
    #[must_use]
    pub fn g_series(key: AesKey, password: Option<Password>) -> Self {
        Credentials::GSeries {
            key,
            password,
            issued_at: Utc::now(),
        }
    }

    /// Build TT-Series credentials stamped with the current time.
    #[must_use]
    pub fn tt_series(lock_id: LockId, pin: Pin, key: Option<AesKey>) -> Self {
        Credentials::TtSeries {
            lock_id,
            pin,
            key,
            issued_at: Utc::now(),
        }
    }

    /// Protocol variant this bundle targets.
    #[must_use]
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            Credentials::GSeries { .. } => ProtocolKind::GSeries,
            Credentials::TtSeries { .. } => ProtocolKind::TtSeries,
        }
    }

    /// Creation timestamp of the bundle.
    #[must_use]
    pub fn issued_at(&self) -> DateTime<Utc> {
        match self {
            Credentials::GSeries { issued_at, .. } | Credentials::TtSeries { issued_at, .. } => {
                *issued_at
            }
        }
    }

    /// Returns `true` if the bundle is older than the given validity window.
    #[must_use]
    pub fn is_expired(&self, window: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.issued_at());
        age.to_std().map(|age| age > window).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rstest::rstest;

    #[test]
    fn test_lock_id_wire_roundtrip() {
        let id = LockId::new("83181001").unwrap();
        assert_eq!(id.to_bytes(), [0x20, 0x7E, 0x03, 0xE9]);
        assert_eq!(LockId::from_bytes([0x20, 0x7E, 0x03, 0xE9]), id);
    }

    #[rstest]
    #[case("0000000")] // too short
    #[case("123456789")] // too long
    #[case("1234567a")] // non-digit
    fn test_lock_id_invalid(#[case] input: &str) {
        assert!(LockId::new(input).is_err());
    }

    #[test]
    fn test_lock_id_auto_detect_sentinel() {
        assert!(LockId::auto_detect().is_auto_detect());
        assert!(!LockId::new("83181001").unwrap().is_auto_detect());
    }

    #[test]
    fn test_pin_wire_padding() {
        let pin = Pin::new("123").unwrap();
        assert_eq!(&pin.to_wire(), b"123000");

        let full = Pin::new("123456").unwrap();
        assert_eq!(&full.to_wire(), b"123456");
    }

    #[rstest]
    #[case("")]
    #[case("1234567")]
    #[case("12a4")]
    fn test_pin_invalid(#[case] input: &str) {
        assert!(Pin::new(input).is_err());
    }

    #[rstest]
    #[case("abc")] // too short
    #[case("a]really[long{password}over-16")] // too long
    fn test_password_invalid(#[case] input: &str) {
        assert!(Password::new(input).is_err());
    }

    #[test]
    fn test_password_constant_time_eq() {
        let a = Password::new("hunter2!").unwrap();
        let b = Password::new("hunter2!").unwrap();
        let c = Password::new("hunter3!").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_aes_key_strict_length() {
        assert!(AesKey::new(b"short").is_err());
        assert!(AesKey::new(b"1234567890123456").is_ok());
    }

    #[test]
    fn test_aes_key_lenient_coercion() {
        let padded = AesKey::new_lenient(b"abc");
        let mut expected = [0u8; 16];
        expected[..3].copy_from_slice(b"abc");
        assert_eq!(padded.as_bytes(), &expected);

        let truncated = AesKey::new_lenient(b"12345678901234567890");
        assert_eq!(truncated.as_bytes(), b"1234567890123456");
    }

    #[test]
    fn test_aes_key_debug_redacted() {
        let key = AesKey::new(b"1234567890123456").unwrap();
        assert_eq!(format!("{key:?}"), "AesKey(****)");
    }

    #[test]
    fn test_bcd_timestamp_encoding() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let ts = BcdTimestamp::from_naive(&dt);
        assert_eq!(ts.as_bytes(), &[0x24, 0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(ts.to_naive(), Some(dt));
    }

    #[test]
    fn test_bcd_timestamp_rejects_non_bcd() {
        let ts = BcdTimestamp::from_bytes([0x24, 0x0A, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(ts.to_naive(), None);
    }

    #[test]
    fn test_credentials_protocol_tagging() {
        let g = Credentials::g_series(AesKey::new(b"1234567890123456").unwrap(), None);
        assert_eq!(g.protocol(), ProtocolKind::GSeries);

        let tt = Credentials::tt_series(
            LockId::auto_detect(),
            Pin::new("123456").unwrap(),
            None,
        );
        assert_eq!(tt.protocol(), ProtocolKind::TtSeries);
        assert!(!tt.is_expired(Duration::from_secs(60)));
        assert!(tt.is_expired(Duration::ZERO));
    }

    #[test]
    fn test_device_status_epoch_ms() {
        let status = DeviceStatus {
            lock_state: LockState::Locked,
            battery_percent: Some(80),
            is_connected: true,
            rssi: Some(-60),
            updated_at: Utc::now(),
        };
        assert!(status.updated_epoch_ms() > 0);
    }
}
