//! Crypto and checksum primitives shared by both lock protocols.
//!
//! Both lock families run AES-128 in ECB mode with zero padding (not
//! PKCS#7): plaintext is rounded up to the next 16-byte boundary with zero
//! bytes, and ciphertext length equals the padded plaintext length. The
//! devices never authenticate the ciphertext; integrity travels separately
//! as CRC-16/CCITT (G-Series inner envelope), CRC-8/MAXIM (TT-Series outer
//! frame) and the G-Series "SunCheck" byte sum.

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use blelock_core::{Error, Result, constants::AES_BLOCK_SIZE};

/// AES-128-ECB encrypt with zero padding.
///
/// The plaintext is copied into a buffer rounded up to a 16-byte multiple
/// and encrypted block by block. Callers that need the original length back
/// after decryption must carry it out-of-band (both wire formats do).
#[must_use]
pub fn aes_ecb_encrypt(plaintext: &[u8], key: &[u8; 16]) -> Vec<u8> {
    let cipher = Aes128::new(key.into());
    let padded_len = plaintext.len().div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE;

    let mut out = vec![0u8; padded_len];
    out[..plaintext.len()].copy_from_slice(plaintext);
    for chunk in out.chunks_mut(AES_BLOCK_SIZE) {
        cipher.encrypt_block(aes::Block::from_mut_slice(chunk));
    }
    out
}

/// AES-128-ECB decrypt.
///
/// # Errors
/// Returns `Error::Decoding` if the ciphertext is empty or not a multiple
/// of the AES block size.
pub fn aes_ecb_decrypt(ciphertext: &[u8], key: &[u8; 16]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || !ciphertext.len().is_multiple_of(AES_BLOCK_SIZE) {
        return Err(Error::decoding(format!(
            "ciphertext length {} is not a positive multiple of {AES_BLOCK_SIZE}",
            ciphertext.len()
        )));
    }

    let cipher = Aes128::new(key.into());
    let mut out = ciphertext.to_vec();
    for chunk in out.chunks_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(aes::Block::from_mut_slice(chunk));
    }
    Ok(out)
}

/// CRC-16/CCITT-FALSE: polynomial 0x1021, initial 0xFFFF, no reflection,
/// no output XOR. The G-Series envelope computes this over the content
/// bytes only.
#[must_use]
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// 256-entry lookup table for CRC-8/MAXIM (Dallas/Maxim one-wire variant,
/// reflected polynomial 0x8C).
static CRC8_MAXIM_TABLE: [u8; 256] = build_crc8_maxim_table();

const fn build_crc8_maxim_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ 0x8C
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-8/MAXIM (x^8 + x^5 + x^4 + 1, init 0x00), table driven. The
/// TT-Series trailer covers ENC, LEN and the on-wire body.
#[must_use]
pub fn crc8_maxim(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc = CRC8_MAXIM_TABLE[usize::from(crc ^ byte)];
    }
    crc
}

/// G-Series outer checksum: byte sum modulo 256, two's-complemented, and
/// results above 0xF0 reduced by 0x10 (the V11 firmware rule).
#[must_use]
pub fn sun_check(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    let mut chk = sum.wrapping_neg();
    if chk > 0xF0 {
        chk -= 0x10;
    }
    chk
}

#[cfg(test)]
mod tests {
    use super::*;

    // FIPS-197 appendix vector for AES-128.
    const NIST_KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    #[test]
    fn test_aes_known_vector() {
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let ciphertext = aes_ecb_encrypt(&plaintext, &NIST_KEY);
        assert_eq!(hex::encode(&ciphertext), "3ad77bb40d7a3660a89ecaf32466ef97");
    }

    #[test]
    fn test_aes_zero_padding_roundtrip() {
        let plaintext = b"seven b"; // 7 bytes -> one padded block
        let ciphertext = aes_ecb_encrypt(plaintext, &NIST_KEY);
        assert_eq!(ciphertext.len(), 16);

        let decrypted = aes_ecb_decrypt(&ciphertext, &NIST_KEY).unwrap();
        assert_eq!(&decrypted[..7], plaintext);
        assert!(decrypted[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_aes_block_aligned_input_not_expanded() {
        let plaintext = [0x42u8; 32];
        assert_eq!(aes_ecb_encrypt(&plaintext, &NIST_KEY).len(), 32);
    }

    #[test]
    fn test_aes_decrypt_rejects_partial_block() {
        assert!(aes_ecb_decrypt(&[0u8; 15], &NIST_KEY).is_err());
        assert!(aes_ecb_decrypt(&[], &NIST_KEY).is_err());
    }

    #[test]
    fn test_crc16_check_value() {
        // Standard CRC-16/CCITT-FALSE check input.
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_crc16_empty_is_init() {
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }

    #[test]
    fn test_crc8_maxim_check_value() {
        // Standard CRC-8/MAXIM check input.
        assert_eq!(crc8_maxim(b"123456789"), 0xA1);
    }

    #[test]
    fn test_crc8_maxim_empty_is_zero() {
        assert_eq!(crc8_maxim(&[]), 0x00);
    }

    #[test]
    fn test_sun_check_plain_negation() {
        // sum = 0x10, -0x10 = 0xF0 which is not > 0xF0, no reduction
        assert_eq!(sun_check(&[0x10]), 0xF0);
        // sum = 0x30, negated 0xD0
        assert_eq!(sun_check(&[0x10, 0x20]), 0xD0);
    }

    #[test]
    fn test_sun_check_overflow_rule() {
        // sum = 0x01 -> negated 0xFF > 0xF0 -> 0xEF
        assert_eq!(sun_check(&[0x01]), 0xEF);
        // sum = 0x0F -> negated 0xF1 > 0xF0 -> 0xE1
        assert_eq!(sun_check(&[0x0F]), 0xE1);
    }

    #[test]
    fn test_sun_check_zero_sum() {
        assert_eq!(sun_check(&[]), 0x00);
        assert_eq!(sun_check(&[0x80, 0x80]), 0x00);
    }
}
