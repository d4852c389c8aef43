// Copyright 2025-2026 CEMAXECUTER LLC

use crc::{Algorithm, Crc};

/// CRC-16 over the packed 256-bit tag frame: polynomial 0x1021, zero
/// initial value, no reflection, no final xor. The transmitted frame
/// carries its own CRC in the last 16 bits, so a clean frame checks to 0.
const CRC_TAG: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0x0,
    refin: false,
    refout: false,
    xorout: 0x0,
    check: 0x31c3,
    residue: 0x0,
};

pub const TAG_CRC: Crc<u16> = Crc::<u16>::new(&CRC_TAG);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // The standard check string for these parameters.
        assert_eq!(TAG_CRC.checksum(b"123456789"), 0x31c3);
    }

    #[test]
    fn test_zero_message() {
        assert_eq!(TAG_CRC.checksum(&[0u8; 32]), 0);
    }

    #[test]
    fn test_appended_crc_checks_to_zero() {
        let msg = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03];
        let crc = TAG_CRC.checksum(&msg);
        let mut framed = msg.to_vec();
        framed.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(
            TAG_CRC.checksum(&framed),
            0,
            "a message followed by its own CRC must check to zero"
        );
    }

    #[test]
    fn test_detects_single_bit_error() {
        let mut msg = [0u8; 32];
        msg[0] = 0xa5;
        let good = TAG_CRC.checksum(&msg);
        msg[17] ^= 0x10;
        assert_ne!(TAG_CRC.checksum(&msg), good);
    }
}
