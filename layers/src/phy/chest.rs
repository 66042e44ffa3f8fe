//! Reference Signals and Channel Estimation
//!
//! Cell reference signals for the downlink, PUSCH DMRS for the uplink, and the
//! least-squares estimator shared by both. Estimates are averaged per PRB and the
//! spread of the individual pilots around that average gives the noise variance.

use super::grid::{crs_subcarriers, ResourceGrid, PUSCH_DMRS_SYMBOLS, SUBCARRIERS_PER_PRB};
use super::sequence::GoldSequence;
use common::power_to_db;
use num_complex::Complex32;

/// Lowest noise variance reported, keeps noiseless loopback LLRs finite
const NOISE_FLOOR: f32 = 1e-6;

/// Cell reference signal values of symbol `l` (one per pilot, `2 * nof_prb` pilots)
pub fn crs_values(tick_in_frame: u32, l: usize, pci: u16, nof_prb: u16) -> Vec<Complex32> {
    let ns = 2 * tick_in_frame as u64 + (l / 7) as u64;
    let n_id = pci as u64;
    let c_init = (((7 * (ns + 1) + (l % 7) as u64 + 1) * (2 * n_id + 1)) << 10) + 2 * n_id + 1;
    GoldSequence::new((c_init & 0x7FFF_FFFF) as u32).qpsk(2 * nof_prb as usize)
}

/// PUSCH DMRS values of symbol `l` over the whole carrier (one per subcarrier)
pub fn pusch_dmrs_values(tick_in_frame: u32, l: usize, pci: u16, nof_prb: u16) -> Vec<Complex32> {
    let c_init = ((tick_in_frame * 14 + l as u32 + 1) << 16) ^ ((pci as u32) << 1) ^ 0x5A;
    GoldSequence::new(c_init).qpsk(SUBCARRIERS_PER_PRB * nof_prb as usize)
}

/// Per-subcarrier channel estimate with a common noise variance
#[derive(Debug, Clone)]
pub struct ChannelEstimate {
    h: Vec<Complex32>,
    noise_var: f32,
}

impl ChannelEstimate {
    /// Unit channel without noise
    pub fn ideal(nof_subcarriers: usize) -> Self {
        Self {
            h: vec![Complex32::new(1.0, 0.0); nof_subcarriers],
            noise_var: NOISE_FLOOR,
        }
    }

    /// Channel coefficient of subcarrier `k`
    pub fn coefficient(&self, k: usize) -> Complex32 {
        self.h.get(k).copied().unwrap_or_default()
    }

    /// Estimated noise variance
    pub fn noise_var(&self) -> f32 {
        self.noise_var
    }

    /// Zero-forcing equalisation of `y` received on subcarrier `k`.
    ///
    /// Returns the symbol estimate and its noise variance.
    pub fn equalize(&self, k: usize, y: Complex32) -> (Complex32, f32) {
        let h = self.coefficient(k);
        let gain = h.norm_sqr();
        if gain < 1e-12 {
            return (Complex32::new(0.0, 0.0), f32::MAX);
        }
        (y * h.conj() / gain, self.noise_var / gain)
    }

    /// Mean SNR in dB over subcarriers `k0..k1`
    pub fn snr_db(&self, k0: usize, k1: usize) -> f32 {
        let k1 = k1.min(self.h.len());
        if k1 <= k0 {
            return power_to_db(0.0);
        }
        let signal = self.h[k0..k1].iter().map(|h| h.norm_sqr()).sum::<f32>() / (k1 - k0) as f32;
        power_to_db(signal / self.noise_var)
    }
}

/// Accumulate pilots of one PRB into per-PRB averages and squared deviations
fn average_pilots(per_prb: &[Vec<Complex32>], nof_subcarriers: usize) -> ChannelEstimate {
    let mut h = vec![Complex32::new(0.0, 0.0); nof_subcarriers];
    let mut deviation = 0.0f32;
    let mut nof_pilots = 0usize;

    for (prb, pilots) in per_prb.iter().enumerate() {
        if pilots.is_empty() {
            continue;
        }
        let mean = pilots.iter().sum::<Complex32>() / pilots.len() as f32;
        deviation += pilots.iter().map(|p| (p - mean).norm_sqr()).sum::<f32>();
        nof_pilots += pilots.len() - 1;

        let k0 = prb * SUBCARRIERS_PER_PRB;
        for coef in &mut h[k0..(k0 + SUBCARRIERS_PER_PRB).min(nof_subcarriers)] {
            *coef = mean;
        }
    }

    let noise_var = if nof_pilots > 0 {
        (deviation / nof_pilots as f32).max(NOISE_FLOOR)
    } else {
        NOISE_FLOOR
    };

    ChannelEstimate { h, noise_var }
}

/// Downlink estimate from the cell reference signals on `symbols`
pub fn estimate_dl(grid: &ResourceGrid, tick_in_frame: u32, pci: u16, v_shift: usize, symbols: &[usize]) -> ChannelEstimate {
    let nof_prb = grid.nof_prb();
    let mut per_prb = vec![Vec::new(); nof_prb as usize];

    for &l in symbols {
        let reference = crs_values(tick_in_frame, l, pci, nof_prb);
        for (m, k) in crs_subcarriers(nof_prb, v_shift).enumerate() {
            per_prb[k / SUBCARRIERS_PER_PRB].push(grid.get((k, l)) / reference[m]);
        }
    }

    average_pilots(&per_prb, grid.nof_subcarriers())
}

/// Uplink estimate over one PUSCH allocation from its DMRS
pub fn estimate_pusch(grid: &ResourceGrid, tick_in_frame: u32, pci: u16, prb_start: u16, nof_prb: u16) -> ChannelEstimate {
    let mut per_prb = vec![Vec::new(); grid.nof_prb() as usize];
    let k0 = SUBCARRIERS_PER_PRB * prb_start as usize;
    let k1 = k0 + SUBCARRIERS_PER_PRB * nof_prb as usize;

    for &l in PUSCH_DMRS_SYMBOLS.iter() {
        let reference = pusch_dmrs_values(tick_in_frame, l, pci, grid.nof_prb());
        for k in k0..k1.min(grid.nof_subcarriers()) {
            per_prb[k / SUBCARRIERS_PER_PRB].push(grid.get((k, l)) / reference[k]);
        }
    }

    average_pilots(&per_prb, grid.nof_subcarriers())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::grid::CRS_SYMBOLS;

    #[test]
    fn test_dl_estimate_recovers_flat_channel() {
        let nof_prb = 6;
        let channel = Complex32::new(0.5, -0.25);
        let mut grid = ResourceGrid::new(nof_prb);
        for &l in CRS_SYMBOLS.iter() {
            let reference = crs_values(3, l, 7, nof_prb);
            for (m, k) in crs_subcarriers(nof_prb, 1).enumerate() {
                grid.set((k, l), reference[m] * channel);
            }
        }

        let estimate = estimate_dl(&grid, 3, 7, 1, &CRS_SYMBOLS);
        for k in 0..grid.nof_subcarriers() {
            assert!((estimate.coefficient(k) - channel).norm() < 1e-5);
        }
        assert!(estimate.noise_var() <= 1e-5);

        let (x, _) = estimate.equalize(10, Complex32::new(1.0, 0.0) * channel);
        assert!((x - Complex32::new(1.0, 0.0)).norm() < 1e-5);
    }

    #[test]
    fn test_pusch_estimate_only_covers_allocation() {
        let mut grid = ResourceGrid::new(6);
        for &l in PUSCH_DMRS_SYMBOLS.iter() {
            let reference = pusch_dmrs_values(0, l, 1, 6);
            for k in 12..36 {
                grid.set((k, l), reference[k]);
            }
        }

        let estimate = estimate_pusch(&grid, 0, 1, 1, 2);
        assert!((estimate.coefficient(20) - Complex32::new(1.0, 0.0)).norm() < 1e-5);
        assert_eq!(estimate.coefficient(50), Complex32::new(0.0, 0.0));
        assert!(estimate.snr_db(12, 36) > 30.0);
    }

    #[test]
    fn test_empty_grid_has_no_signal() {
        let grid = ResourceGrid::new(6);
        let estimate = estimate_dl(&grid, 0, 0, 0, &[0]);
        let (_, var) = estimate.equalize(0, Complex32::new(1.0, 0.0));
        assert_eq!(var, f32::MAX);
    }
}
