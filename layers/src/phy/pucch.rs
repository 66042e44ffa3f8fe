//! PUCCH HARQ-ACK
//!
//! One bundled ACK/NACK bit per UE and tick on a single band-edge subcarrier.
//! Reference symbols sit on `PUCCH_RS_SYMBOLS`; every other symbol carries the
//! reference multiplied by +1 (ACK) or -1 (NACK). Too little energy on the
//! reference symbols is reported as DTX.

use super::grid::{ResourceGrid, PUCCH_RS_SYMBOLS};
use super::sequence::GoldSequence;
use common::{power_to_db, Rat};
use num_complex::Complex32;

/// PUCCH resource of a DL assignment starting at `first_cce`
pub fn n_pucch(first_cce: usize, n1_pucch_an: u16) -> usize {
    first_cce + n1_pucch_an as usize
}

fn reference(n_pucch: usize, tick_in_frame: u32, pci: u16) -> Vec<Complex32> {
    let c_init = ((n_pucch as u32) << 16) ^ (tick_in_frame << 10) ^ pci as u32;
    GoldSequence::new(c_init).qpsk(Rat::SYMBOLS_PER_TICK)
}

/// Write one HARQ-ACK bit on subcarrier `k` (UE side)
pub fn encode(grid: &mut ResourceGrid, k: usize, n_pucch: usize, tick_in_frame: u32, pci: u16, ack: bool) {
    let reference = reference(n_pucch, tick_in_frame, pci);
    let d = if ack { 1.0 } else { -1.0 };
    for (l, r) in reference.iter().enumerate() {
        let value = if PUCCH_RS_SYMBOLS.contains(&l) { *r } else { r * d };
        grid.set((k, l), value);
    }
}

/// Detection outcome of one PUCCH resource
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PucchResult {
    /// Decoded bit, `None` for DTX
    pub ack: Option<bool>,
    /// Estimated SNR in dB
    pub snr_db: f32,
}

/// Detect the HARQ-ACK bit on subcarrier `k`; `threshold` is a linear SNR
pub fn detect(grid: &ResourceGrid, k: usize, n_pucch: usize, tick_in_frame: u32, pci: u16, threshold: f32) -> PucchResult {
    let reference = reference(n_pucch, tick_in_frame, pci);

    let estimates: Vec<Complex32> = PUCCH_RS_SYMBOLS
        .iter()
        .map(|&l| grid.get((k, l)) / reference[l])
        .collect();
    let h = estimates.iter().sum::<Complex32>() / estimates.len() as f32;
    let noise = (estimates.iter().map(|e| (e - h).norm_sqr()).sum::<f32>() / (estimates.len() - 1) as f32).max(1e-6);
    let snr = h.norm_sqr() / noise;

    if snr < threshold {
        return PucchResult {
            ack: None,
            snr_db: power_to_db(snr),
        };
    }

    let decision: f32 = (0..Rat::SYMBOLS_PER_TICK)
        .filter(|l| !PUCCH_RS_SYMBOLS.contains(l))
        .map(|l| (grid.get((k, l)) / reference[l] * h.conj()).re)
        .sum();

    PucchResult {
        ack: Some(decision > 0.0),
        snr_db: power_to_db(snr),
    }
}
