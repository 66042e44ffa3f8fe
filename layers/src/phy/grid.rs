//! Resource Grid and Resource Element Layout
//!
//! One tick of resource elements for one carrier and antenna port, stored as an
//! `ndarray` matrix of `[subcarrier, symbol]`. The layout helpers enumerate which
//! resource elements carry reference signals, control, shared channel and PUCCH.

use common::Rat;
use ndarray::{Array2, ArrayView1, ArrayViewMut1};
use num_complex::Complex32;

/// Subcarriers per resource block
pub const SUBCARRIERS_PER_PRB: usize = 12;
/// Resource elements per control channel element
pub const RE_PER_CCE: usize = 36;
/// Symbols carrying downlink cell reference signals
pub const CRS_SYMBOLS: [usize; 4] = [0, 4, 7, 11];
/// Symbols carrying PUSCH demodulation reference signals
pub const PUSCH_DMRS_SYMBOLS: [usize; 2] = [3, 10];
/// Symbols carrying PUCCH reference signals
pub const PUCCH_RS_SYMBOLS: [usize; 6] = [2, 3, 4, 9, 10, 11];

/// Resource element coordinate (subcarrier, symbol)
pub type Re = (usize, usize);

/// Resource grid for one tick
#[derive(Debug, Clone)]
pub struct ResourceGrid {
    grid: Array2<Complex32>,
    nof_prb: u16,
}

impl ResourceGrid {
    /// Create an empty grid
    pub fn new(nof_prb: u16) -> Self {
        Self {
            grid: Array2::zeros((SUBCARRIERS_PER_PRB * nof_prb as usize, Rat::SYMBOLS_PER_TICK)),
            nof_prb,
        }
    }

    /// Carrier width in PRB
    pub fn nof_prb(&self) -> u16 {
        self.nof_prb
    }

    /// Number of subcarriers
    pub fn nof_subcarriers(&self) -> usize {
        self.grid.nrows()
    }

    /// Number of symbols
    pub fn nof_symbols(&self) -> usize {
        self.grid.ncols()
    }

    /// Read one resource element
    pub fn get(&self, re: Re) -> Complex32 {
        self.grid[re]
    }

    /// Write one resource element
    pub fn set(&mut self, re: Re, value: Complex32) {
        self.grid[re] = value;
    }

    /// All subcarriers of one symbol
    pub fn symbol(&self, l: usize) -> ArrayView1<'_, Complex32> {
        self.grid.column(l)
    }

    /// Mutable subcarriers of one symbol
    pub fn symbol_mut(&mut self, l: usize) -> ArrayViewMut1<'_, Complex32> {
        self.grid.column_mut(l)
    }

    /// Zero the whole grid
    pub fn clear(&mut self) {
        self.grid.fill(Complex32::new(0.0, 0.0));
    }

    /// Mean resource element power
    pub fn average_power(&self) -> f32 {
        let n = self.grid.len();
        if n == 0 {
            return 0.0;
        }
        self.grid.iter().map(|x| x.norm_sqr()).sum::<f32>() / n as f32
    }
}

/// Whether `(k, l)` carries a cell reference signal
pub fn is_crs(re: Re, v_shift: usize) -> bool {
    let (k, l) = re;
    CRS_SYMBOLS.contains(&l) && k % 6 == v_shift
}

/// Cell reference signal positions of one symbol
pub fn crs_subcarriers(nof_prb: u16, v_shift: usize) -> impl Iterator<Item = usize> {
    (v_shift..SUBCARRIERS_PER_PRB * nof_prb as usize).step_by(6)
}

/// Control region resource elements, frequency first within each REG column
pub fn control_res(nof_prb: u16, cfi: u8, v_shift: usize) -> Vec<Re> {
    let nof_sc = SUBCARRIERS_PER_PRB * nof_prb as usize;
    let mut res = Vec::with_capacity(nof_sc * cfi as usize);
    for k in 0..nof_sc {
        for l in 0..cfi as usize {
            if !is_crs((k, l), v_shift) {
                res.push((k, l));
            }
        }
    }
    res
}

/// Number of CCEs available in the control region
pub fn nof_cce(nof_prb: u16, cfi: u8, v_shift: usize) -> usize {
    control_res(nof_prb, cfi, v_shift).len() / RE_PER_CCE
}

/// PDSCH resource elements of an allocation, frequency first then symbol
pub fn pdsch_res(prb_start: u16, nof_prb: u16, cfi: u8, v_shift: usize) -> Vec<Re> {
    let k0 = SUBCARRIERS_PER_PRB * prb_start as usize;
    let k1 = k0 + SUBCARRIERS_PER_PRB * nof_prb as usize;
    let mut res = Vec::with_capacity((k1 - k0) * Rat::SYMBOLS_PER_TICK);
    for l in cfi as usize..Rat::SYMBOLS_PER_TICK {
        for k in k0..k1 {
            if !is_crs((k, l), v_shift) {
                res.push((k, l));
            }
        }
    }
    res
}

/// PDSCH resource elements per PRB for a control region of `cfi` symbols
pub fn pdsch_re_per_prb(cfi: u8) -> usize {
    let crs_in_data = CRS_SYMBOLS.iter().filter(|&&l| l >= cfi as usize).count();
    SUBCARRIERS_PER_PRB * (Rat::SYMBOLS_PER_TICK - cfi as usize) - 2 * crs_in_data
}

/// PUSCH resource elements of an allocation, skipping the DMRS symbols
pub fn pusch_res(prb_start: u16, nof_prb: u16) -> Vec<Re> {
    let k0 = SUBCARRIERS_PER_PRB * prb_start as usize;
    let k1 = k0 + SUBCARRIERS_PER_PRB * nof_prb as usize;
    let mut res = Vec::with_capacity((k1 - k0) * Rat::SYMBOLS_PER_TICK);
    for l in 0..Rat::SYMBOLS_PER_TICK {
        if PUSCH_DMRS_SYMBOLS.contains(&l) {
            continue;
        }
        for k in k0..k1 {
            res.push((k, l));
        }
    }
    res
}

/// PUSCH resource elements per PRB
pub fn pusch_re_per_prb() -> usize {
    SUBCARRIERS_PER_PRB * (Rat::SYMBOLS_PER_TICK - PUSCH_DMRS_SYMBOLS.len())
}

/// Number of PUCCH resources offered by the reserved edge PRBs
pub fn nof_pucch_resources(nof_pucch_prb: u16) -> usize {
    2 * SUBCARRIERS_PER_PRB * nof_pucch_prb as usize
}

/// Subcarrier carrying PUCCH resource `n_pucch`.
///
/// Resources alternate between the lower and upper band edge, one subcarrier
/// per resource across all symbols of the tick.
pub fn pucch_subcarrier(n_pucch: usize, nof_prb: u16, nof_pucch_prb: u16) -> usize {
    let n = n_pucch % nof_pucch_resources(nof_pucch_prb).max(1);
    let prb = n / (2 * SUBCARRIERS_PER_PRB);
    let offset = n % SUBCARRIERS_PER_PRB;
    if (n / SUBCARRIERS_PER_PRB) % 2 == 0 {
        prb * SUBCARRIERS_PER_PRB + offset
    } else {
        (nof_prb as usize - 1 - prb) * SUBCARRIERS_PER_PRB + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_dimensions() {
        let mut grid = ResourceGrid::new(6);
        assert_eq!(grid.nof_subcarriers(), 72);
        assert_eq!(grid.nof_symbols(), 14);
        grid.set((3, 5), Complex32::new(2.0, 0.0));
        assert_eq!(grid.symbol(5)[3], Complex32::new(2.0, 0.0));
        assert!(grid.average_power() > 0.0);
        grid.clear();
        assert_eq!(grid.average_power(), 0.0);
    }

    #[test]
    fn test_pdsch_re_count_matches_layout() {
        for cfi in 1..=3u8 {
            let res = pdsch_res(4, 3, cfi, 1);
            assert_eq!(res.len(), 3 * pdsch_re_per_prb(cfi));
            assert!(res.iter().all(|&re| !is_crs(re, 1) && re.1 >= cfi as usize));
        }
    }

    #[test]
    fn test_control_region_size() {
        // 100 PRB, CFI 2: 1000 + 1200 REs
        assert_eq!(control_res(100, 2, 0).len(), 2200);
        assert_eq!(nof_cce(100, 2, 0), 61);
        assert_eq!(nof_cce(6, 2, 0), 3);
    }

    #[test]
    fn test_pusch_skips_dmrs() {
        let res = pusch_res(2, 2);
        assert_eq!(res.len(), 2 * pusch_re_per_prb());
        assert!(res.iter().all(|(_, l)| !PUSCH_DMRS_SYMBOLS.contains(l)));
    }

    #[test]
    fn test_pucch_resources_at_band_edges() {
        assert_eq!(pucch_subcarrier(0, 25, 2), 0);
        assert_eq!(pucch_subcarrier(11, 25, 2), 11);
        assert_eq!(pucch_subcarrier(12, 25, 2), 24 * 12);
        assert_eq!(pucch_subcarrier(24, 25, 2), 12);
        assert_eq!(pucch_subcarrier(36, 25, 2), 23 * 12);
        // wraps modulo the 48 available resources
        assert_eq!(pucch_subcarrier(48, 25, 2), 0);
    }
}
