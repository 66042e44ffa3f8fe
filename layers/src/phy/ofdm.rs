//! OFDM Modulation and Demodulation
//!
//! Converts between one tick of resource elements and one tick of baseband
//! samples (14 symbols, normal cyclic prefix) using `rustfft`. The first symbol
//! of every half subframe carries the long cyclic prefix so that a tick always
//! spans `15 * fft_size` samples.

use super::grid::ResourceGrid;
use crate::LayerError;
use common::Rat;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Cyclic prefix length of every symbol in one tick
pub fn cp_lengths(fft_size: usize, numerology: u8, slot_in_subframe: u32) -> [usize; Rat::SYMBOLS_PER_TICK] {
    let base = 144 * fft_size / 2048;
    let long = base + (16 * fft_size << numerology) / 2048;
    let half_subframe = 7usize << numerology;

    let mut lengths = [base; Rat::SYMBOLS_PER_TICK];
    for (l, len) in lengths.iter_mut().enumerate() {
        if (slot_in_subframe as usize * Rat::SYMBOLS_PER_TICK + l) % half_subframe == 0 {
            *len = long;
        }
    }
    lengths
}

/// Sample offset of the start (cyclic prefix included) of symbol `l`
pub fn symbol_offset(fft_size: usize, numerology: u8, slot_in_subframe: u32, l: usize) -> usize {
    cp_lengths(fft_size, numerology, slot_in_subframe)
        .iter()
        .take(l)
        .map(|cp| cp + fft_size)
        .sum()
}

/// FFT bin of subcarrier `k` in a band of `nof_sc` subcarriers centred on DC (DC unused)
fn subcarrier_bin(k: usize, nof_sc: usize, fft_size: usize) -> usize {
    let half = nof_sc / 2;
    if k < half {
        fft_size - half + k
    } else {
        k - half + 1
    }
}

/// OFDM modulator for one carrier
pub struct OfdmModulator {
    fft_size: usize,
    numerology: u8,
    ifft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl OfdmModulator {
    /// Create a modulator for the given FFT size
    pub fn new(fft_size: usize, numerology: u8) -> Result<Self, LayerError> {
        if fft_size == 0 {
            return Err(LayerError::InvalidConfiguration("FFT size must be positive".to_string()));
        }

        let mut planner = FftPlanner::new();
        let ifft = planner.plan_fft_inverse(fft_size);
        let scratch = vec![Complex32::new(0.0, 0.0); ifft.get_inplace_scratch_len()];

        Ok(Self {
            fft_size,
            numerology,
            ifft,
            buffer: vec![Complex32::new(0.0, 0.0); fft_size],
            scratch,
        })
    }

    /// Samples produced per tick
    pub fn tick_length(&self) -> usize {
        15 * self.fft_size
    }

    /// Modulate a whole tick into `out`
    pub fn modulate(&mut self, grid: &ResourceGrid, slot_in_subframe: u32, out: &mut [Complex32]) -> Result<(), LayerError> {
        if out.len() != self.tick_length() {
            return Err(LayerError::ProcessingError(format!(
                "modulator output holds {} samples, tick needs {}",
                out.len(),
                self.tick_length()
            )));
        }

        let nof_sc = grid.nof_subcarriers();
        let scale = 1.0 / (self.fft_size as f32).sqrt();
        let cps = cp_lengths(self.fft_size, self.numerology, slot_in_subframe);
        let mut offset = 0;

        for (l, &cp) in cps.iter().enumerate() {
            self.buffer.fill(Complex32::new(0.0, 0.0));
            for (k, value) in grid.symbol(l).iter().enumerate() {
                self.buffer[subcarrier_bin(k, nof_sc, self.fft_size)] = *value;
            }
            self.ifft.process_with_scratch(&mut self.buffer, &mut self.scratch);

            let symbol = &mut out[offset..offset + cp + self.fft_size];
            for (dst, src) in symbol[cp..].iter_mut().zip(self.buffer.iter()) {
                *dst = *src * scale;
            }
            symbol.copy_within(self.fft_size..self.fft_size + cp, 0);
            offset += cp + self.fft_size;
        }

        Ok(())
    }
}

/// OFDM demodulator for one carrier
pub struct OfdmDemodulator {
    fft_size: usize,
    numerology: u8,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl OfdmDemodulator {
    /// Create a demodulator for the given FFT size
    pub fn new(fft_size: usize, numerology: u8) -> Result<Self, LayerError> {
        if fft_size == 0 {
            return Err(LayerError::InvalidConfiguration("FFT size must be positive".to_string()));
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch = vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Ok(Self {
            fft_size,
            numerology,
            fft,
            buffer: vec![Complex32::new(0.0, 0.0); fft_size],
            scratch,
        })
    }

    /// Demodulate a whole tick of samples into `grid`
    pub fn demodulate(&mut self, samples: &[Complex32], slot_in_subframe: u32, grid: &mut ResourceGrid) -> Result<(), LayerError> {
        if samples.len() != 15 * self.fft_size {
            return Err(LayerError::ProcessingError(format!(
                "demodulator input holds {} samples, tick needs {}",
                samples.len(),
                15 * self.fft_size
            )));
        }

        let nof_sc = grid.nof_subcarriers();
        let scale = 1.0 / (self.fft_size as f32).sqrt();
        let cps = cp_lengths(self.fft_size, self.numerology, slot_in_subframe);
        let mut offset = 0;

        for (l, &cp) in cps.iter().enumerate() {
            let start = offset + cp;
            self.buffer.copy_from_slice(&samples[start..start + self.fft_size]);
            self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

            let mut symbol = grid.symbol_mut(l);
            for k in 0..nof_sc {
                symbol[k] = self.buffer[subcarrier_bin(k, nof_sc, self.fft_size)] * scale;
            }
            offset += cp + self.fft_size;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cp_lengths_fill_tick() {
        for &fft in &[128usize, 256, 512, 1024, 1536, 2048, 4096] {
            for mu in 0..=1u8 {
                for slot in 0..(1u32 << mu) {
                    let total: usize = cp_lengths(fft, mu, slot).iter().map(|cp| cp + fft).sum();
                    assert_eq!(total, 15 * fft, "fft {} mu {} slot {}", fft, mu, slot);
                }
            }
        }
    }

    #[test]
    fn test_lte_cp_positions() {
        let cps = cp_lengths(2048, 0, 0);
        assert_eq!(cps[0], 160);
        assert_eq!(cps[1], 144);
        assert_eq!(cps[7], 160);
        assert_eq!(symbol_offset(2048, 0, 0, 1), 2208);
    }

    #[test]
    fn test_modulate_demodulate() {
        let mut grid = ResourceGrid::new(6);
        for k in 0..grid.nof_subcarriers() {
            for l in 0..14 {
                let v = if (k + l) % 2 == 0 { 1.0 } else { -1.0 };
                grid.set((k, l), Complex32::new(v, 0.5 * v));
            }
        }

        let mut modulator = OfdmModulator::new(128, 0).unwrap();
        let mut demodulator = OfdmDemodulator::new(128, 0).unwrap();
        let mut samples = vec![Complex32::new(0.0, 0.0); modulator.tick_length()];
        modulator.modulate(&grid, 0, &mut samples).unwrap();

        let mut received = ResourceGrid::new(6);
        demodulator.demodulate(&samples, 0, &mut received).unwrap();
        for k in 0..grid.nof_subcarriers() {
            for l in 0..14 {
                assert!((grid.get((k, l)) - received.get((k, l))).norm() < 1e-4);
            }
        }
    }

    #[test]
    fn test_wrong_buffer_length() {
        let grid = ResourceGrid::new(6);
        let mut modulator = OfdmModulator::new(128, 0).unwrap();
        let mut short = vec![Complex32::new(0.0, 0.0); 100];
        assert!(modulator.modulate(&grid, 0, &mut short).is_err());
    }
}
