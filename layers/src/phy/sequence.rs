//! Pseudo-random Sequence Generation
//!
//! Length-31 Gold sequence used for scrambling and reference signals
//! (3GPP TS 36.211 Section 7.2).

use num_complex::Complex32;
use std::f32::consts::FRAC_1_SQRT_2;

/// Fast-forward applied to the LFSRs before the first output bit
const NC: usize = 1600;

/// Gold sequence generator
#[derive(Debug, Clone)]
pub struct GoldSequence {
    x1: u32,
    x2: u32,
}

impl GoldSequence {
    /// Create a generator for the given initialisation value
    pub fn new(c_init: u32) -> Self {
        let mut seq = Self {
            x1: 1,
            x2: c_init & 0x7FFF_FFFF,
        };
        for _ in 0..NC {
            seq.advance();
        }
        seq
    }

    fn advance(&mut self) {
        // x1(n+31) = x1(n+3) + x1(n)
        let x1_new = ((self.x1 >> 3) ^ self.x1) & 1;
        self.x1 = (self.x1 >> 1) | (x1_new << 30);

        // x2(n+31) = x2(n+3) + x2(n+2) + x2(n+1) + x2(n)
        let x2_new = ((self.x2 >> 3) ^ (self.x2 >> 2) ^ (self.x2 >> 1) ^ self.x2) & 1;
        self.x2 = (self.x2 >> 1) | (x2_new << 30);
    }

    /// Next output bit
    pub fn next_bit(&mut self) -> u8 {
        let c = (self.x1 ^ self.x2) & 1;
        self.advance();
        c as u8
    }

    /// Next `len` output bits
    pub fn bits(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.next_bit()).collect()
    }

    /// Next unit-power QPSK symbol
    pub fn next_qpsk(&mut self) -> Complex32 {
        let c0 = self.next_bit();
        let c1 = self.next_bit();
        Complex32::new(
            FRAC_1_SQRT_2 * (1.0 - 2.0 * c0 as f32),
            FRAC_1_SQRT_2 * (1.0 - 2.0 * c1 as f32),
        )
    }

    /// Next `len` QPSK symbols
    pub fn qpsk(&mut self, len: usize) -> Vec<Complex32> {
        (0..len).map(|_| self.next_qpsk()).collect()
    }
}

/// Scramble hard bits in place
pub fn scramble_bits(bits: &mut [u8], c_init: u32) {
    let mut seq = GoldSequence::new(c_init);
    for bit in bits.iter_mut() {
        *bit ^= seq.next_bit();
    }
}

/// Descramble soft bits in place (positive LLR means bit 0)
pub fn descramble_llrs(llrs: &mut [f32], c_init: u32) {
    let mut seq = GoldSequence::new(c_init);
    for llr in llrs.iter_mut() {
        if seq.next_bit() == 1 {
            *llr = -*llr;
        }
    }
}
