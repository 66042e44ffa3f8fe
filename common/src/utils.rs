//! Common Utilities
//!
//! CRC, bit packing and numerology helpers shared by the PHY pipeline

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Calculate CRC-24A over a byte sequence
pub fn crc24(data: &[u8]) -> u32 {
    const CRC24_POLY: u32 = 0x1864CFB;
    let mut crc: u32 = 0;

    for byte in data {
        crc ^= (*byte as u32) << 16;
        for _ in 0..8 {
            if crc & 0x800000 != 0 {
                crc = (crc << 1) ^ CRC24_POLY;
            } else {
                crc <<= 1;
            }
        }
    }

    crc & 0xFFFFFF
}

/// Calculate CRC-16 over a bit sequence (one bit per byte, MSB first order)
pub fn crc16_bits(bits: &[u8]) -> u16 {
    const CRC16_POLY: u16 = 0x1021;
    let mut crc: u16 = 0;

    for &bit in bits {
        let feedback = ((crc >> 15) as u8 ^ (bit & 1)) & 1;
        crc <<= 1;
        if feedback != 0 {
            crc ^= CRC16_POLY;
        }
    }

    crc
}

/// Pack bits into bytes (MSB first)
pub fn pack_bits(bits: &[u8]) -> Bytes {
    let mut bytes = BytesMut::with_capacity((bits.len() + 7) / 8);

    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit != 0 {
                byte |= 1 << (7 - i);
            }
        }
        bytes.put_u8(byte);
    }

    bytes.freeze()
}

/// Unpack bytes into bits (MSB first), one bit per output byte
pub fn unpack_bits(bytes: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);

    for &byte in bytes {
        for i in 0..8 {
            bits.push((byte >> (7 - i)) & 1);
        }
    }

    bits
}

/// Append the `num_bits` least significant bits of `value`, MSB first
pub fn append_bits(bits: &mut Vec<u8>, value: u32, num_bits: u8) {
    for i in (0..num_bits).rev() {
        bits.push(((value >> i) & 1) as u8);
    }
}

/// Read `num_bits` bits MSB first starting at `*offset`, advancing the offset
pub fn read_bits(bits: &[u8], offset: &mut usize, num_bits: u8) -> u32 {
    let mut value = 0u32;
    for _ in 0..num_bits {
        value = (value << 1) | (bits[*offset] & 1) as u32;
        *offset += 1;
    }
    value
}

/// FFT size used for a carrier of `nof_prb` resource blocks
pub fn fft_size_for_prb(nof_prb: u16) -> Option<usize> {
    let size = match nof_prb {
        0 => return None,
        1..=6 => 128,
        7..=15 => 256,
        16..=25 => 512,
        26..=52 => 1024,
        53..=79 => 1536,
        80..=106 => 2048,
        107..=275 => 4096,
        _ => return None,
    };

    trace!("FFT size {} for {} PRB", size, nof_prb);
    Some(size)
}

/// Number of baseband samples in one tick of 14 normal-CP symbols
pub fn samples_per_tick(fft_size: usize) -> usize {
    15 * fft_size
}

/// Convert linear power to dB, flooring zero at -100 dB
pub fn power_to_db(power: f32) -> f32 {
    if power > 0.0 {
        10.0 * power.log10()
    } else {
        -100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc24() {
        let data = b"Hello";
        let crc = crc24(data);
        assert_eq!(crc & 0xFFFFFF, crc);
        assert_ne!(crc24(b"Hellp"), crc);
        assert_eq!(crc24(&[]), 0);
    }

    #[test]
    fn test_crc16_detects_bit_flip() {
        let mut bits = unpack_bits(&[0xA5, 0x3C, 0x0F]);
        let crc = crc16_bits(&bits);
        bits[5] ^= 1;
        assert_ne!(crc16_bits(&bits), crc);
    }

    #[test]
    fn test_bit_packing() {
        let bits = vec![1, 0, 1, 0, 1, 0, 1, 0];
        let packed = pack_bits(&bits);
        assert_eq!(packed[0], 0xAA);

        let unpacked = unpack_bits(&packed);
        assert_eq!(unpacked[..8], bits[..]);
    }

    #[test]
    fn test_append_and_read_bits() {
        let mut bits = Vec::new();
        append_bits(&mut bits, 0b101, 3);
        append_bits(&mut bits, 0x1234, 16);
        let mut offset = 0;
        assert_eq!(read_bits(&bits, &mut offset, 3), 0b101);
        assert_eq!(read_bits(&bits, &mut offset, 16), 0x1234);
        assert_eq!(offset, 19);
    }

    #[test]
    fn test_fft_size_for_prb() {
        assert_eq!(fft_size_for_prb(6), Some(128));
        assert_eq!(fft_size_for_prb(25), Some(512));
        assert_eq!(fft_size_for_prb(75), Some(1536));
        assert_eq!(fft_size_for_prb(100), Some(2048));
        assert_eq!(fft_size_for_prb(276), None);
        assert_eq!(samples_per_tick(2048), 30720);
    }
}
