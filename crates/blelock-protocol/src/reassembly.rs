//! Reassembly of protocol frames from fragmented GATT notifications.
//!
//! BLE notifications carry at most the effective MTU payload (20 bytes
//! here), so a single protocol frame routinely arrives split across
//! several notifications, and a burst may pack the tail of one frame and
//! the head of the next into one payload. Each session owns one assembler:
//! an append-only byte queue that yields complete frames as soon as the
//! protocol-specific framing rules are satisfied, leaving any residue
//! buffered for the next frame.
//!
//! Feeding chunks of any partitioning of a byte stream yields exactly the
//! same frame sequence as feeding the stream at once (the property tests
//! pin this down).

use crate::{gseries, ttseries};
use blelock_core::ProtocolKind;
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use tracing::warn;

/// Cap on buffered bytes before the assembler assumes a runaway stream and
/// resets. Generous against any legitimate frame.
const MAX_BUFFER_SIZE: usize = 64 * 1024;

const INITIAL_BUFFER_CAPACITY: usize = 512;

/// G-Series notification assembler.
///
/// Extraction rules, applied after every append:
/// - a buffer opening with the short-ACK prefix (`20 F1`) yields those
///   three bytes;
/// - otherwise the buffer is scanned for the response header (`F3 3F`) and
///   then for the response tail (`F4 4F`); once both are present the
///   inclusive range is emitted and bytes before the header are discarded.
#[derive(Debug, Default)]
pub struct GSeriesAssembler {
    buffer: BytesMut,
    frames: VecDeque<Vec<u8>>,
}

impl GSeriesAssembler {
    #[must_use]
    pub fn new() -> Self {
        GSeriesAssembler {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            frames: VecDeque::new(),
        }
    }

    /// Append one notification payload and extract any completed frames.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        while self.try_extract() {}
    }

    /// Pop the next completed frame, if any.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }

    /// Bytes currently waiting for more data.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered bytes and queued frames.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.frames.clear();
    }

    fn try_extract(&mut self) -> bool {
        if self.buffer.len() > MAX_BUFFER_SIZE {
            warn!(
                buffered = self.buffer.len(),
                "assembler buffer overran limit, resetting"
            );
            self.buffer.clear();
            return false;
        }

        if self.buffer.len() >= gseries::ACK_LENGTH && self.buffer[..2] == gseries::ACK_PREFIX {
            let ack = self.buffer.split_to(gseries::ACK_LENGTH);
            self.frames.push_back(ack.to_vec());
            return true;
        }

        let Some(start) = find_marker(&self.buffer, &gseries::RESPONSE_HEADER) else {
            return false;
        };
        let Some(tail) = find_marker(&self.buffer[start + 2..], &gseries::RESPONSE_TAIL)
            .map(|pos| start + 2 + pos)
        else {
            return false;
        };

        if start > 0 {
            warn!(discarded = start, "bytes before response header discarded");
        }
        self.buffer.advance(start);
        let frame = self.buffer.split_to(tail + 2 - start);
        self.frames.push_back(frame.to_vec());
        true
    }
}

/// TT-Series notification assembler.
///
/// The first two bytes carry ENC and LEN, which determine the full frame
/// length up front: `2 + body + 1` where the body spans LEN bytes (plain)
/// or LEN rounded up to the AES block (encrypted). An unrecognized ENC
/// byte means the stream lost sync, and the whole buffer is discarded.
#[derive(Debug, Default)]
pub struct TtAssembler {
    buffer: BytesMut,
    frames: VecDeque<Vec<u8>>,
}

impl TtAssembler {
    #[must_use]
    pub fn new() -> Self {
        TtAssembler {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            frames: VecDeque::new(),
        }
    }

    /// Append one notification payload and extract any completed frames.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        while self.try_extract() {}
    }

    /// Pop the next completed frame, if any.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }

    /// Bytes currently waiting for more data.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered bytes and queued frames.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.frames.clear();
    }

    fn try_extract(&mut self) -> bool {
        if self.buffer.len() > MAX_BUFFER_SIZE {
            warn!(
                buffered = self.buffer.len(),
                "assembler buffer overran limit, resetting"
            );
            self.buffer.clear();
            return false;
        }
        if self.buffer.len() < 2 {
            return false;
        }

        let enc = self.buffer[0];
        if enc != ttseries::ENC_PLAIN && enc != ttseries::ENC_AES {
            warn!(
                enc,
                discarded = self.buffer.len(),
                "unrecognized ENC byte, resynchronizing"
            );
            self.buffer.clear();
            return false;
        }

        let len = usize::from(self.buffer[1]);
        let body_len = if enc == ttseries::ENC_AES {
            len.div_ceil(16) * 16
        } else {
            len
        };
        let frame_len = 2 + body_len + 1;
        if self.buffer.len() < frame_len {
            return false;
        }

        let frame = self.buffer.split_to(frame_len);
        self.frames.push_back(frame.to_vec());
        true
    }
}

/// Protocol-dispatched assembler owned by a session.
#[derive(Debug)]
pub enum Assembler {
    GSeries(GSeriesAssembler),
    TtSeries(TtAssembler),
}

impl Assembler {
    #[must_use]
    pub fn for_protocol(protocol: ProtocolKind) -> Self {
        match protocol {
            ProtocolKind::GSeries => Assembler::GSeries(GSeriesAssembler::new()),
            ProtocolKind::TtSeries => Assembler::TtSeries(TtAssembler::new()),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        match self {
            Assembler::GSeries(a) => a.feed(bytes),
            Assembler::TtSeries(a) => a.feed(bytes),
        }
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        match self {
            Assembler::GSeries(a) => a.next_frame(),
            Assembler::TtSeries(a) => a.next_frame(),
        }
    }

    pub fn clear(&mut self) {
        match self {
            Assembler::GSeries(a) => a.clear(),
            Assembler::TtSeries(a) => a.clear(),
        }
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal valid-looking G-Series response body between the markers.
    fn g_response(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&gseries::RESPONSE_HEADER);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&gseries::RESPONSE_TAIL);
        frame
    }

    #[test]
    fn test_g_complete_frame_single_feed() {
        let mut assembler = GSeriesAssembler::new();
        let frame = g_response(&[0x01, 0x02, 0x03]);
        assembler.feed(&frame);

        assert_eq!(assembler.next_frame().unwrap(), frame);
        assert!(assembler.next_frame().is_none());
        assert_eq!(assembler.buffered_len(), 0);
    }

    #[test]
    fn test_g_fragmented_frame_with_residue() {
        // Spec scenario: [F3 3F .. part1] [part2 F4] [4F extra]
        let frame = g_response(&[0xAA, 0xBB, 0xCC, 0xDD]);
        let mut assembler = GSeriesAssembler::new();

        assembler.feed(&frame[..4]);
        assert!(assembler.next_frame().is_none());

        assembler.feed(&frame[4..frame.len() - 1]);
        assert!(assembler.next_frame().is_none());

        let mut last = vec![frame[frame.len() - 1]];
        last.push(0x99); // trailing extra byte
        assembler.feed(&last);

        assert_eq!(assembler.next_frame().unwrap(), frame);
        assert_eq!(assembler.buffered_len(), 1);
    }

    #[test]
    fn test_g_short_ack_extraction() {
        let mut assembler = GSeriesAssembler::new();
        assembler.feed(&[0x20]);
        assert!(assembler.next_frame().is_none());
        assembler.feed(&[0xF1, 0x00]);
        assert_eq!(assembler.next_frame().unwrap(), vec![0x20, 0xF1, 0x00]);
    }

    #[test]
    fn test_g_ack_then_frame_in_one_burst() {
        let frame = g_response(&[0x01]);
        let mut data = vec![0x20, 0xF1, 0x02];
        data.extend_from_slice(&frame);

        let mut assembler = GSeriesAssembler::new();
        assembler.feed(&data);

        assert_eq!(assembler.next_frame().unwrap(), vec![0x20, 0xF1, 0x02]);
        assert_eq!(assembler.next_frame().unwrap(), frame);
    }

    #[test]
    fn test_g_garbage_before_header_discarded() {
        let frame = g_response(&[0x42]);
        let mut data = vec![0x00, 0x99, 0x77];
        data.extend_from_slice(&frame);

        let mut assembler = GSeriesAssembler::new();
        assembler.feed(&data);
        assert_eq!(assembler.next_frame().unwrap(), frame);
    }

    #[test]
    fn test_g_waits_without_tail() {
        let mut assembler = GSeriesAssembler::new();
        assembler.feed(&[0xF3, 0x3F, 0x01, 0x02]);
        assert!(assembler.next_frame().is_none());
        assert_eq!(assembler.buffered_len(), 4);
    }

    fn tt_frame(business: &[u8]) -> Vec<u8> {
        ttseries::build_plain(business)
    }

    #[test]
    fn test_tt_complete_frame() {
        let frame = tt_frame(&[0x12, 0x01, 0x02]);
        let mut assembler = TtAssembler::new();
        assembler.feed(&frame);
        assert_eq!(assembler.next_frame().unwrap(), frame);
    }

    #[test]
    fn test_tt_byte_by_byte() {
        let frame = tt_frame(&[0x31, 0xAA, 0xBB, 0xCC]);
        let mut assembler = TtAssembler::new();
        for &byte in &frame {
            assembler.feed(&[byte]);
        }
        assert_eq!(assembler.next_frame().unwrap(), frame);
        assert_eq!(assembler.buffered_len(), 0);
    }

    #[test]
    fn test_tt_two_frames_one_burst() {
        let a = tt_frame(&[0x01, 0x02]);
        let b = tt_frame(&[0x05, 0x06, 0x07]);
        let mut data = a.clone();
        data.extend_from_slice(&b);

        let mut assembler = TtAssembler::new();
        assembler.feed(&data);
        assert_eq!(assembler.next_frame().unwrap(), a);
        assert_eq!(assembler.next_frame().unwrap(), b);
    }

    #[test]
    fn test_tt_encrypted_length_arithmetic() {
        // ENC=0x11, LEN=17 -> body is two AES blocks (32 bytes).
        let mut frame = vec![0x11, 17];
        frame.extend_from_slice(&[0u8; 32]);
        frame.push(0x5A); // CRC byte, value irrelevant to framing

        let mut assembler = TtAssembler::new();
        assembler.feed(&frame[..20]);
        assert!(assembler.next_frame().is_none());
        assembler.feed(&frame[20..]);
        assert_eq!(assembler.next_frame().unwrap(), frame);
    }

    #[test]
    fn test_tt_resync_on_bad_enc() {
        let mut assembler = TtAssembler::new();
        assembler.feed(&[0xFF, 0x10, 0x20]);
        assert!(assembler.next_frame().is_none());
        assert_eq!(assembler.buffered_len(), 0);

        // Still functional after resync.
        let frame = tt_frame(&[0x12]);
        assembler.feed(&frame);
        assert_eq!(assembler.next_frame().unwrap(), frame);
    }

    #[test]
    fn test_assembler_dispatch() {
        let mut g = Assembler::for_protocol(ProtocolKind::GSeries);
        g.feed(&[0x20, 0xF1, 0x00]);
        assert!(g.next_frame().is_some());

        let mut tt = Assembler::for_protocol(ProtocolKind::TtSeries);
        tt.feed(&tt_frame(&[0x12]));
        assert!(tt.next_frame().is_some());
    }
}
