//! TT-Series ("TOTARGET A7") frame codec.
//!
//! # Wire Format
//!
//! ```text
//! ┌──────┬──────┬────────────────┬──────┐
//! │ ENC  │ LEN  │     BODY       │ CRC8 │
//! │ 1 B  │ 1 B  │  LEN or padded │ 1 B  │
//! └──────┴──────┴────────────────┴──────┘
//! ```
//!
//! ENC is 0x01 (plain) or 0x11 (AES-128-ECB over the zero-padded business
//! data). LEN always carries the business-data length, in both modes; the
//! on-wire body of an encrypted frame spans `ceil(LEN/16)*16` bytes. The
//! trailing CRC-8/MAXIM covers ENC, LEN and the on-wire body.
//!
//! Business data starts with a command (downstream) or reply/event code
//! (upstream). Locks push heartbeats and tamper alarms spontaneously; those
//! share the framing but are never answers to a pending command.

use crate::crypto::{aes_ecb_decrypt, aes_ecb_encrypt, crc8_maxim};
use blelock_core::{AesKey, BcdTimestamp, Error, LockId, LockState, Pin, Result};
use tracing::{debug, warn};

/// ENC selector values.
pub const ENC_PLAIN: u8 = 0x01;
pub const ENC_AES: u8 = 0x11;

/// Downstream command opcodes.
pub const CMD_CALIBRATE_TIME: u8 = 0x20;
pub const CMD_CHECK_VERSION: u8 = 0x21;
pub const CMD_SET_WORK_MODE: u8 = 0x29;
pub const CMD_CHECK_STATUS: u8 = 0x12;
pub const CMD_LOCK: u8 = 0x31;
pub const CMD_UNLOCK: u8 = 0x37;

/// Upstream (device-initiated) event codes.
pub const EVT_HEARTBEAT: u8 = 0x01;
pub const EVT_BROKE: u8 = 0x03;
pub const EVT_ROD_CUT: u8 = 0x04;
pub const EVT_OPENED: u8 = 0x05;

/// Reply codes.
pub const REPLY_CHECK_OK: u8 = 0x62;
pub const REPLY_LOCK_SUCCESS: u8 = 0x80;
pub const REPLY_LOCK_AGAIN: u8 = 0x81;
pub const REPLY_UNLOCK_SUCCESS: u8 = 0x90;
pub const REPLY_UNLOCK_AGAIN: u8 = 0x91;
pub const REPLY_UNLOCK_WRONG_PASSWORD: u8 = 0x93;

/// Work-mode values.
pub const WORK_MODE_SLEEP: u8 = 0x30;
pub const WORK_MODE_REALTIME: u8 = 0x31;

/// Frame overhead: ENC + LEN + CRC.
pub const FRAME_OVERHEAD: usize = 3;

/// Alarm detail bitset (low nibble of an ALARM status byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmFlags(u8);

impl AlarmFlags {
    pub const ROD_CUT: u8 = 0x01;
    pub const OPENED: u8 = 0x02;
    pub const SHELL: u8 = 0x04;
    pub const EMERGENCY: u8 = 0x08;

    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        AlarmFlags(bits & 0x0F)
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn rod_cut(self) -> bool {
        self.0 & Self::ROD_CUT != 0
    }

    #[must_use]
    pub fn opened(self) -> bool {
        self.0 & Self::OPENED != 0
    }

    #[must_use]
    pub fn shell(self) -> bool {
        self.0 & Self::SHELL != 0
    }

    #[must_use]
    pub fn emergency(self) -> bool {
        self.0 & Self::EMERGENCY != 0
    }
}

/// High-nibble classification of the status byte in lock/unlock/check
/// replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Open,
    Standby,
    NotReady,
    Sealed,
    LocalSealed,
    Unsealed,
    Alarm(AlarmFlags),
    CancelAlarm,
    Abnormal,
    Unrecognized(u8),
}

impl StatusClass {
    #[must_use]
    pub fn from_byte(status: u8) -> Self {
        match status & 0xF0 {
            0x10 => StatusClass::Open,
            0x20 => StatusClass::Standby,
            0x30 => StatusClass::NotReady,
            0x40 => StatusClass::Sealed,
            0x50 => StatusClass::LocalSealed,
            0x60 => StatusClass::Unsealed,
            0x70 => StatusClass::Alarm(AlarmFlags::from_bits(status)),
            0x90 => StatusClass::CancelAlarm,
            0xA0 => StatusClass::Abnormal,
            _ => StatusClass::Unrecognized(status),
        }
    }

    /// Map the status class onto the observable lock state.
    #[must_use]
    pub fn lock_state(self) -> LockState {
        match self {
            StatusClass::Sealed | StatusClass::LocalSealed => LockState::Locked,
            StatusClass::Unsealed | StatusClass::Open => LockState::Unlocked,
            _ => LockState::Unknown,
        }
    }
}

/// Outcome of a lock/unlock/check command derived from the reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Locked; `again` marks the idempotent re-apply reply (0x81).
    Locked { again: bool },
    /// Unlocked; `again` marks the idempotent re-apply reply (0x91).
    Unlocked { again: bool },
    /// Status check acknowledged.
    CheckOk,
    /// Device rejected the password.
    WrongPassword,
    /// Any other reply code.
    Failed(u8),
}

/// Decoded lock/unlock/check-status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    pub code: u8,
    pub lock_id: LockId,
    pub battery: u8,
    pub status: StatusClass,
    pub op_source: u8,
    pub timestamp: Option<BcdTimestamp>,
}

impl StatusReply {
    /// Interpret the reply code per the A7 command tables.
    #[must_use]
    pub fn outcome(&self) -> CommandOutcome {
        match self.code {
            REPLY_CHECK_OK => CommandOutcome::CheckOk,
            REPLY_LOCK_SUCCESS => CommandOutcome::Locked { again: false },
            REPLY_LOCK_AGAIN => CommandOutcome::Locked { again: true },
            REPLY_UNLOCK_SUCCESS => CommandOutcome::Unlocked { again: false },
            REPLY_UNLOCK_AGAIN => CommandOutcome::Unlocked { again: true },
            REPLY_UNLOCK_WRONG_PASSWORD => CommandOutcome::WrongPassword,
            other => CommandOutcome::Failed(other),
        }
    }
}

/// Device-initiated event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Heartbeat,
    Broke,
    RodCut,
    Opened,
}

impl EventKind {
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            EVT_HEARTBEAT => Some(EventKind::Heartbeat),
            EVT_BROKE => Some(EventKind::Broke),
            EVT_ROD_CUT => Some(EventKind::RodCut),
            EVT_OPENED => Some(EventKind::Opened),
            _ => None,
        }
    }
}

/// Decoded upstream event (heartbeat or tamper alarm).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEvent {
    pub kind: EventKind,
    pub lock_id: Option<LockId>,
}

/// Parsed business data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtMessage {
    /// Lock / unlock / check-status reply.
    Status(StatusReply),
    /// Check-version reply: bytes after the code rendered as ASCII.
    Version(String),
    /// Device-initiated heartbeat or alarm.
    Event(LockEvent),
    /// Anything this codec does not recognize.
    Other { code: u8, business: Vec<u8> },
}

/// Raw frame with its decrypted business data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtFrame {
    pub encrypted: bool,
    pub business: Vec<u8>,
    /// CRC-8 verification result. Mismatches are logged, never fatal: some
    /// firmware revisions emit incorrect trailers.
    pub crc_ok: bool,
}

impl TtFrame {
    /// First business byte: the command/reply/event code.
    #[must_use]
    pub fn code(&self) -> Option<u8> {
        self.business.first().copied()
    }

    /// Returns `true` if this frame is a device-initiated event rather than
    /// the answer to a pending command.
    #[must_use]
    pub fn is_event(&self) -> bool {
        self.code().and_then(EventKind::from_code).is_some()
    }
}

/// Wrap business data in a plain frame.
#[must_use]
pub fn build_plain(business: &[u8]) -> Vec<u8> {
    debug_assert!(business.len() <= u8::MAX as usize);
    let mut frame = Vec::with_capacity(business.len() + FRAME_OVERHEAD);
    frame.push(ENC_PLAIN);
    frame.push(business.len() as u8);
    frame.extend_from_slice(business);
    frame.push(crc8_maxim(&frame));
    frame
}

/// Wrap business data in an AES frame. LEN still carries the business
/// length; the body is padded to the block boundary.
#[must_use]
pub fn build_encrypted(business: &[u8], key: &AesKey) -> Vec<u8> {
    debug_assert!(business.len() <= u8::MAX as usize);
    let body = aes_ecb_encrypt(business, key.as_bytes());
    let mut frame = Vec::with_capacity(body.len() + FRAME_OVERHEAD);
    frame.push(ENC_AES);
    frame.push(business.len() as u8);
    frame.extend_from_slice(&body);
    frame.push(crc8_maxim(&frame));
    frame
}

fn build(business: &[u8], key: Option<&AesKey>) -> Vec<u8> {
    match key {
        Some(key) => build_encrypted(business, key),
        None => build_plain(business),
    }
}

fn command_business(cmd: u8, lock_id: &LockId, pin: &Pin, at: BcdTimestamp) -> Vec<u8> {
    let mut business = Vec::with_capacity(17);
    business.push(cmd);
    business.extend_from_slice(&lock_id.to_bytes());
    business.extend_from_slice(&pin.to_wire());
    business.extend_from_slice(at.as_bytes());
    business
}

/// Lock command frame.
#[must_use]
pub fn build_lock(lock_id: &LockId, pin: &Pin, at: BcdTimestamp, key: Option<&AesKey>) -> Vec<u8> {
    build(&command_business(CMD_LOCK, lock_id, pin, at), key)
}

/// Unlock command frame.
#[must_use]
pub fn build_unlock(
    lock_id: &LockId,
    pin: &Pin,
    at: BcdTimestamp,
    key: Option<&AesKey>,
) -> Vec<u8> {
    build(&command_business(CMD_UNLOCK, lock_id, pin, at), key)
}

/// Status query frame.
#[must_use]
pub fn build_check_status(
    lock_id: &LockId,
    pin: &Pin,
    at: BcdTimestamp,
    key: Option<&AesKey>,
) -> Vec<u8> {
    build(&command_business(CMD_CHECK_STATUS, lock_id, pin, at), key)
}

/// Time calibration frame (`CMD ‖ DateTime`).
#[must_use]
pub fn build_calibrate_time(at: BcdTimestamp, key: Option<&AesKey>) -> Vec<u8> {
    let mut business = Vec::with_capacity(7);
    business.push(CMD_CALIBRATE_TIME);
    business.extend_from_slice(at.as_bytes());
    build(&business, key)
}

/// Firmware version query frame (`CMD ‖ DateTime`).
#[must_use]
pub fn build_check_version(at: BcdTimestamp, key: Option<&AesKey>) -> Vec<u8> {
    let mut business = Vec::with_capacity(7);
    business.push(CMD_CHECK_VERSION);
    business.extend_from_slice(at.as_bytes());
    build(&business, key)
}

/// Work-mode frame: 0x30 sleep, 0x31 realtime.
#[must_use]
pub fn build_set_work_mode(lock_id: &LockId, sleep: bool, key: Option<&AesKey>) -> Vec<u8> {
    let mode = if sleep {
        WORK_MODE_SLEEP
    } else {
        WORK_MODE_REALTIME
    };
    let mut business = Vec::with_capacity(6);
    business.push(CMD_SET_WORK_MODE);
    business.extend_from_slice(&lock_id.to_bytes());
    business.push(mode);
    build(&business, key)
}

/// Heartbeat acknowledgement (`CMD ‖ LockId ‖ DateTime`).
#[must_use]
pub fn build_heartbeat_reply(lock_id: &LockId, at: BcdTimestamp, key: Option<&AesKey>) -> Vec<u8> {
    let mut business = Vec::with_capacity(11);
    business.push(EVT_HEARTBEAT);
    business.extend_from_slice(&lock_id.to_bytes());
    business.extend_from_slice(at.as_bytes());
    build(&business, key)
}

/// Parse a raw frame extracted by the reassembly buffer.
///
/// # Errors
/// Returns `Error::Decoding` for frames shorter than the fixed overhead,
/// an unrecognized ENC byte, a truncated body, or an encrypted body without
/// a key.
pub fn parse_frame(bytes: &[u8], key: Option<&AesKey>) -> Result<TtFrame> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(Error::decoding(format!(
            "frame of {} bytes below minimum {FRAME_OVERHEAD}",
            bytes.len()
        )));
    }

    let enc = bytes[0];
    let len = usize::from(bytes[1]);
    let body_len = match enc {
        ENC_PLAIN => len,
        ENC_AES => len.div_ceil(16) * 16,
        other => {
            return Err(Error::decoding(format!(
                "unrecognized ENC byte {other:#04x}"
            )));
        }
    };
    if bytes.len() < 2 + body_len + 1 {
        return Err(Error::decoding(format!(
            "LEN {len} wants {body_len} body bytes, only {} buffered",
            bytes.len().saturating_sub(FRAME_OVERHEAD)
        )));
    }

    let body = &bytes[2..2 + body_len];
    let crc = bytes[2 + body_len];
    let crc_ok = crc == crc8_maxim(&bytes[..2 + body_len]);
    if !crc_ok {
        warn!(
            frame = %hex::encode(&bytes[..2 + body_len + 1]),
            "CRC-8 mismatch on frame, continuing"
        );
    }

    let business = if enc == ENC_AES {
        let key = key.ok_or_else(|| Error::decoding("encrypted frame but no key supplied"))?;
        let mut plain = aes_ecb_decrypt(body, key.as_bytes())?;
        plain.truncate(len);
        plain
    } else {
        body.to_vec()
    };

    Ok(TtFrame {
        encrypted: enc == ENC_AES,
        business,
        crc_ok,
    })
}

/// Interpret business data as a typed message.
///
/// # Errors
/// Returns `Error::Decoding` for empty business data or a status reply too
/// short to carry its fixed fields.
pub fn interpret(business: &[u8]) -> Result<TtMessage> {
    let code = *business
        .first()
        .ok_or_else(|| Error::decoding("empty business data"))?;

    if let Some(kind) = EventKind::from_code(code) {
        let lock_id = business
            .get(1..5)
            .map(|b| LockId::from_bytes([b[0], b[1], b[2], b[3]]));
        debug!(?kind, lock_id = ?lock_id, "device event");
        return Ok(TtMessage::Event(LockEvent { kind, lock_id }));
    }

    match code {
        REPLY_CHECK_OK | 0x80..=0x9F => {
            // CMD(1) LockId(4) Battery(1) LockStatus(1) Reserved(1) OpSource(1) DateTime(6)
            if business.len() < 9 {
                return Err(Error::decoding(format!(
                    "status reply of {} bytes below fixed fields",
                    business.len()
                )));
            }
            let lock_id = LockId::from_bytes([business[1], business[2], business[3], business[4]]);
            let timestamp = business
                .get(9..15)
                .map(|b| BcdTimestamp::from_bytes([b[0], b[1], b[2], b[3], b[4], b[5]]));
            Ok(TtMessage::Status(StatusReply {
                code,
                lock_id,
                battery: business[5],
                status: StatusClass::from_byte(business[6]),
                op_source: business[8],
                timestamp,
            }))
        }
        CMD_CHECK_VERSION => {
            let text = String::from_utf8_lossy(&business[1..])
                .trim_end_matches('\0')
                .to_string();
            Ok(TtMessage::Version(text))
        }
        _ => Ok(TtMessage::Other {
            code,
            business: business.to_vec(),
        }),
    }
}
