//! Property-based tests for frame shapes and reassembly.
//!
//! The reassembly property is the load-bearing one: for any partitioning
//! of a valid framed byte stream into chunks, iteratively feeding chunks
//! and extracting frames must yield the same sequence as feeding the whole
//! stream at once.

use blelock_core::{AesKey, BcdTimestamp, LockId, Pin};
use blelock_protocol::crypto::crc8_maxim;
use blelock_protocol::gseries;
use blelock_protocol::reassembly::{GSeriesAssembler, TtAssembler};
use blelock_protocol::ttseries;
use chrono::NaiveDate;
use proptest::prelude::*;

fn fixed_at() -> BcdTimestamp {
    let dt = NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_opt(3, 4, 5)
        .unwrap();
    BcdTimestamp::from_naive(&dt)
}

/// Strategy for TT business payloads that do not collide with the framing
/// bytes in any interesting way (framing never inspects the body).
fn tt_business() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..40)
}

/// Strategy for G-Series response payloads free of the tail marker, so the
/// naive tail scan terminates at the real tail.
fn g_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..60).prop_filter("no embedded tail marker", |payload| {
        !payload
            .windows(2)
            .any(|w| w == gseries::RESPONSE_TAIL)
            && payload.last() != Some(&gseries::RESPONSE_TAIL[0])
    })
}

/// Split `data` at the given fractional points.
fn chunkify(data: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
    points.sort_unstable();
    points.dedup();

    let mut chunks = Vec::new();
    let mut prev = 0;
    for point in points {
        if point > prev {
            chunks.push(data[prev..point].to_vec());
        }
        prev = point;
    }
    if prev < data.len() {
        chunks.push(data[prev..].to_vec());
    }
    chunks
}

fn drain_g(assembler: &mut GSeriesAssembler) -> Vec<Vec<u8>> {
    std::iter::from_fn(|| assembler.next_frame()).collect()
}

fn drain_tt(assembler: &mut TtAssembler) -> Vec<Vec<u8>> {
    std::iter::from_fn(|| assembler.next_frame()).collect()
}

proptest! {
    /// Fragmentation must not change the extracted frame sequence (TT).
    #[test]
    fn prop_tt_reassembly_fragmentation_equivalence(
        payloads in prop::collection::vec(tt_business(), 1..5),
        cuts in prop::collection::vec(any::<usize>(), 0..12),
        encrypted in any::<bool>(),
    ) {
        let key = AesKey::new(b"0123456789abcdef").unwrap();
        let stream: Vec<u8> = payloads
            .iter()
            .flat_map(|p| {
                if encrypted {
                    ttseries::build_encrypted(p, &key)
                } else {
                    ttseries::build_plain(p)
                }
            })
            .collect();

        let mut whole = TtAssembler::new();
        whole.feed(&stream);
        let expected = drain_tt(&mut whole);
        prop_assert_eq!(expected.len(), payloads.len());

        let mut chunked = TtAssembler::new();
        for chunk in chunkify(&stream, &cuts) {
            chunked.feed(&chunk);
        }
        prop_assert_eq!(drain_tt(&mut chunked), expected);
    }

    /// Fragmentation must not change the extracted frame sequence (G).
    #[test]
    fn prop_g_reassembly_fragmentation_equivalence(
        payloads in prop::collection::vec(g_payload(), 1..4),
        cuts in prop::collection::vec(any::<usize>(), 0..12),
    ) {
        let stream: Vec<u8> = payloads
            .iter()
            .flat_map(|p| {
                let mut frame = Vec::new();
                frame.extend_from_slice(&gseries::RESPONSE_HEADER);
                frame.extend_from_slice(p);
                frame.extend_from_slice(&gseries::RESPONSE_TAIL);
                frame
            })
            .collect();

        let mut whole = GSeriesAssembler::new();
        whole.feed(&stream);
        let expected = drain_g(&mut whole);

        let mut chunked = GSeriesAssembler::new();
        for chunk in chunkify(&stream, &cuts) {
            chunked.feed(&chunk);
        }
        prop_assert_eq!(drain_g(&mut chunked), expected);
    }

    /// Every TT frame satisfies the shape invariant: ENC tag, LEN equals
    /// business length, trailing CRC-8 over everything before it.
    #[test]
    fn prop_tt_frame_shape(business in tt_business(), encrypted in any::<bool>()) {
        let key = AesKey::new(b"0123456789abcdef").unwrap();
        let frame = if encrypted {
            ttseries::build_encrypted(&business, &key)
        } else {
            ttseries::build_plain(&business)
        };

        prop_assert!(frame[0] == 0x01 || frame[0] == 0x11);
        prop_assert_eq!(frame[1] as usize, business.len());
        prop_assert_eq!(frame[frame.len() - 1], crc8_maxim(&frame[..frame.len() - 1]));

        let parsed = ttseries::parse_frame(&frame, Some(&key)).unwrap();
        prop_assert!(parsed.crc_ok);
        prop_assert_eq!(parsed.business, business);
    }

    /// TT command frames decode back to their inputs for every lock id,
    /// PIN and timestamp.
    #[test]
    fn prop_tt_command_roundtrip(
        id in 0u32..=99_999_999,
        pin_len in 1usize..=6,
        pin_digit in 0u8..=9,
    ) {
        let lock_id = LockId::new(&format!("{id:08}")).unwrap();
        let pin_str: String = std::iter::repeat_n(char::from(b'0' + pin_digit), pin_len).collect();
        let pin = Pin::new(&pin_str).unwrap();

        let wire = ttseries::build_check_status(&lock_id, &pin, fixed_at(), None);
        let frame = ttseries::parse_frame(&wire, None).unwrap();

        prop_assert_eq!(frame.business[0], ttseries::CMD_CHECK_STATUS);
        let decoded = LockId::from_bytes([
            frame.business[1],
            frame.business[2],
            frame.business[3],
            frame.business[4],
        ]);
        prop_assert_eq!(decoded, lock_id);
        prop_assert_eq!(&frame.business[5..11], &pin.to_wire());
    }
}
