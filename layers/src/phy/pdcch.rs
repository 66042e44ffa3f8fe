//! PDCCH (Physical Downlink Control Channel)
//!
//! DCI packing, CCE search spaces, encoding onto the control region and blind
//! decoding on the UE side. Coding is a CRC16 masked with the RNTI followed by
//! repetition over the aggregated CCEs and cell-specific scrambling.

use super::chest::ChannelEstimate;
use super::grid::{control_res, ResourceGrid, Re, RE_PER_CCE};
use super::modulation::{demodulate_soft, hard_decision, modulate};
use super::sequence::GoldSequence;
use crate::LayerError;
use common::{append_bits, crc16_bits, read_bits, ModulationScheme, Rnti};
use tracing::trace;

/// DCI payload length (both formats are padded to the same size)
pub const DCI_PAYLOAD_BITS: usize = 34;
/// CRC length appended to the payload
pub const DCI_CRC_BITS: usize = 16;
/// Coded bits carried by one CCE (QPSK)
pub const BITS_PER_CCE: usize = 2 * RE_PER_CCE;
/// Supported aggregation levels
pub const AGGREGATION_LEVELS: [u8; 4] = [1, 2, 4, 8];
/// CCEs spanned by the common search space
const COMMON_SEARCH_SPACE_CCES: usize = 16;

/// DCI format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DciFormat {
    /// Downlink assignment
    DlAssignment,
    /// Uplink grant
    UlGrant,
}

/// Downlink control information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dci {
    pub format: DciFormat,
    /// HARQ process (3 bits)
    pub harq_pid: u8,
    /// Modulation and coding scheme (5 bits)
    pub mcs: u8,
    /// New data indicator
    pub ndi: bool,
    /// Redundancy version (2 bits)
    pub rv: u8,
    /// First allocated PRB (9 bits)
    pub prb_start: u16,
    /// Allocated PRBs (9 bits)
    pub nof_prb: u16,
    /// Transmit power control command (2 bits)
    pub tpc: u8,
    /// Downlink assignment index (2 bits)
    pub dai: u8,
}

impl Dci {
    /// Pack into `DCI_PAYLOAD_BITS` bits
    pub fn pack(&self) -> Vec<u8> {
        let mut bits = Vec::with_capacity(DCI_PAYLOAD_BITS);
        append_bits(&mut bits, matches!(self.format, DciFormat::DlAssignment) as u32, 1);
        append_bits(&mut bits, self.harq_pid as u32, 3);
        append_bits(&mut bits, self.mcs as u32, 5);
        append_bits(&mut bits, self.ndi as u32, 1);
        append_bits(&mut bits, self.rv as u32, 2);
        append_bits(&mut bits, self.prb_start as u32, 9);
        append_bits(&mut bits, self.nof_prb as u32, 9);
        append_bits(&mut bits, self.tpc as u32, 2);
        append_bits(&mut bits, self.dai as u32, 2);
        bits
    }

    /// Unpack from `DCI_PAYLOAD_BITS` bits
    pub fn unpack(bits: &[u8]) -> Result<Self, LayerError> {
        if bits.len() < DCI_PAYLOAD_BITS {
            return Err(LayerError::InvalidPdu);
        }
        let mut offset = 0;
        let format = if read_bits(bits, &mut offset, 1) == 1 {
            DciFormat::DlAssignment
        } else {
            DciFormat::UlGrant
        };
        Ok(Self {
            format,
            harq_pid: read_bits(bits, &mut offset, 3) as u8,
            mcs: read_bits(bits, &mut offset, 5) as u8,
            ndi: read_bits(bits, &mut offset, 1) == 1,
            rv: read_bits(bits, &mut offset, 2) as u8,
            prb_start: read_bits(bits, &mut offset, 9) as u16,
            nof_prb: read_bits(bits, &mut offset, 9) as u16,
            tpc: read_bits(bits, &mut offset, 2) as u8,
            dai: read_bits(bits, &mut offset, 2) as u8,
        })
    }
}

/// Position of one PDCCH in the control region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdcchLocation {
    /// First CCE
    pub cce: usize,
    /// Aggregation level
    pub level: u8,
}

impl PdcchLocation {
    /// CCE indices covered by this location
    pub fn cces(&self) -> std::ops::Range<usize> {
        self.cce..self.cce + self.level as usize
    }
}

fn nof_candidates(level: u8) -> usize {
    match level {
        1 | 2 => 6,
        _ => 2,
    }
}

/// UE-specific search space: first CCE of every candidate at `level`
pub fn ue_search_space(rnti: Rnti, tick_in_frame: u32, nof_cce: usize, level: u8) -> Vec<usize> {
    let l = level as usize;
    let nof_positions = nof_cce / l;
    if nof_positions == 0 {
        return Vec::new();
    }

    let mut y = rnti.value() as u64;
    for _ in 0..=tick_in_frame {
        y = (39827 * y) % 65537;
    }

    let mut candidates: Vec<usize> = (0..nof_candidates(level).min(nof_positions))
        .map(|m| l * ((y as usize + m) % nof_positions))
        .collect();
    candidates.dedup();
    candidates
}

/// Common search space: first CCE of every candidate at `level` (4 or 8 only)
pub fn common_search_space(nof_cce: usize, level: u8) -> Vec<usize> {
    if level < 4 {
        return Vec::new();
    }
    let span = nof_cce.min(COMMON_SEARCH_SPACE_CCES);
    (0..span / level as usize).map(|m| m * level as usize).collect()
}

/// Candidates searched for `rnti`: UE-specific for C-RNTIs, common otherwise
pub fn search_space(rnti: Rnti, tick_in_frame: u32, nof_cce: usize, level: u8) -> Vec<usize> {
    if rnti.is_crnti() {
        ue_search_space(rnti, tick_in_frame, nof_cce, level)
    } else {
        common_search_space(nof_cce, level)
    }
}

/// Control region of one tick with its cell scrambling sequence
pub struct ControlRegion {
    res: Vec<Re>,
    scrambling: Vec<u8>,
    nof_cce: usize,
    tick_in_frame: u32,
}

impl ControlRegion {
    /// Lay out the control region of `cfi` symbols
    pub fn new(nof_prb: u16, cfi: u8, pci: u16, v_shift: usize, tick_in_frame: u32) -> Self {
        let res = control_res(nof_prb, cfi, v_shift);
        let nof_cce = res.len() / RE_PER_CCE;
        let c_init = (tick_in_frame << 9) + pci as u32;
        let scrambling = GoldSequence::new(c_init).bits(nof_cce * BITS_PER_CCE);
        Self {
            res,
            scrambling,
            nof_cce,
            tick_in_frame,
        }
    }

    /// CCEs available
    pub fn nof_cce(&self) -> usize {
        self.nof_cce
    }

    fn cce_res(&self, location: &PdcchLocation) -> &[Re] {
        &self.res[location.cce * RE_PER_CCE..(location.cce + location.level as usize) * RE_PER_CCE]
    }

    fn check(&self, location: &PdcchLocation) -> Result<(), LayerError> {
        if !AGGREGATION_LEVELS.contains(&location.level) || location.cce + location.level as usize > self.nof_cce {
            return Err(LayerError::ProcessingError(format!(
                "PDCCH location {:?} outside {} CCEs",
                location, self.nof_cce
            )));
        }
        Ok(())
    }

    /// Encode `dci` for `rnti` into the grid at `location`
    pub fn encode(&self, dci: &Dci, rnti: Rnti, location: PdcchLocation, grid: &mut ResourceGrid) -> Result<(), LayerError> {
        self.check(&location)?;

        let mut block = dci.pack();
        let crc = crc16_bits(&block) ^ rnti.value();
        append_bits(&mut block, crc as u32, DCI_CRC_BITS as u8);

        let offset = location.cce * BITS_PER_CCE;
        let nof_bits = location.level as usize * BITS_PER_CCE;
        let coded: Vec<u8> = (0..nof_bits)
            .map(|i| block[i % block.len()] ^ self.scrambling[offset + i])
            .collect();

        let symbols = modulate(&coded, ModulationScheme::Qpsk);
        for (&re, &symbol) in self.cce_res(&location).iter().zip(symbols.iter()) {
            grid.set(re, symbol);
        }

        trace!("PDCCH rnti={} {:?} at cce {} L{}", rnti, dci.format, location.cce, location.level);
        Ok(())
    }

    /// Try to decode a DCI for `rnti` at `location`
    pub fn decode(&self, grid: &ResourceGrid, chest: &ChannelEstimate, rnti: Rnti, location: PdcchLocation) -> Option<Dci> {
        self.check(&location).ok()?;

        let res = self.cce_res(&location);
        let mut symbols = Vec::with_capacity(res.len());
        let mut noise = Vec::with_capacity(res.len());
        for &(k, l) in res {
            let (x, var) = chest.equalize(k, grid.get((k, l)));
            symbols.push(x);
            noise.push(var);
        }

        let llrs = demodulate_soft(&symbols, &noise, ModulationScheme::Qpsk);
        let offset = location.cce * BITS_PER_CCE;
        let block_len = DCI_PAYLOAD_BITS + DCI_CRC_BITS;
        let mut combined = vec![0.0f32; block_len];
        for (i, llr) in llrs.iter().enumerate() {
            let sign = if self.scrambling[offset + i] == 1 { -1.0 } else { 1.0 };
            combined[i % block_len] += sign * llr;
        }

        if combined.iter().all(|&l| l == 0.0) {
            return None;
        }

        let bits = hard_decision(&combined);
        let mut crc_offset = DCI_PAYLOAD_BITS;
        let received_crc = read_bits(&bits, &mut crc_offset, DCI_CRC_BITS as u8) as u16;
        if crc16_bits(&bits[..DCI_PAYLOAD_BITS]) ^ rnti.value() != received_crc {
            return None;
        }

        Dci::unpack(&bits[..DCI_PAYLOAD_BITS]).ok()
    }

    /// Blind search of every candidate for `rnti`, at most one DCI per format
    pub fn blind_search(&self, grid: &ResourceGrid, chest: &ChannelEstimate, rnti: Rnti) -> Vec<(Dci, PdcchLocation)> {
        let mut found: Vec<(Dci, PdcchLocation)> = Vec::new();
        for &level in AGGREGATION_LEVELS.iter() {
            for cce in search_space(rnti, self.tick_in_frame, self.nof_cce, level) {
                let location = PdcchLocation { cce, level };
                if let Some(dci) = self.decode(grid, chest, rnti, location) {
                    if !found.iter().any(|(d, _)| d.format == dci.format) {
                        found.push((dci, location));
                    }
                }
            }
        }
        found
    }
}

/// Tracks which CCEs of a control region are already taken
#[derive(Debug, Clone)]
pub struct CceAllocator {
    used: Vec<bool>,
    tick_in_frame: u32,
}

impl CceAllocator {
    pub fn new(nof_cce: usize, tick_in_frame: u32) -> Self {
        Self {
            used: vec![false; nof_cce],
            tick_in_frame,
        }
    }

    /// Reserve the first free candidate of `rnti` at `level`
    pub fn allocate(&mut self, rnti: Rnti, level: u8) -> Option<PdcchLocation> {
        let candidates = search_space(rnti, self.tick_in_frame, self.used.len(), level);
        let location = candidates
            .into_iter()
            .map(|cce| PdcchLocation { cce, level })
            .find(|loc| loc.cces().all(|c| !self.used[c]))?;
        for c in location.cces() {
            self.used[c] = true;
        }
        Some(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dci() -> Dci {
        Dci {
            format: DciFormat::DlAssignment,
            harq_pid: 5,
            mcs: 17,
            ndi: true,
            rv: 2,
            prb_start: 10,
            nof_prb: 4,
            tpc: 1,
            dai: 3,
        }
    }

    #[test]
    fn test_dci_pack_length() {
        let dci = test_dci();
        let bits = dci.pack();
        assert_eq!(bits.len(), DCI_PAYLOAD_BITS);
        assert_eq!(Dci::unpack(&bits).unwrap(), dci);
    }

    #[test]
    fn test_search_space_fits_region() {
        let rnti = Rnti::new(0x1234);
        for level in AGGREGATION_LEVELS {
            for cce in ue_search_space(rnti, 3, 21, level) {
                assert_eq!(cce % level as usize, 0);
                assert!(cce + level as usize <= 21);
            }
        }
        assert_eq!(common_search_space(61, 4), vec![0, 4, 8, 12]);
        assert_eq!(common_search_space(61, 8), vec![0, 8]);
        assert!(common_search_space(61, 2).is_empty());
        assert!(ue_search_space(rnti, 0, 3, 4).is_empty());
    }

    #[test]
    fn test_encode_blind_decode() {
        let rnti = Rnti::new(0x4601);
        let region = ControlRegion::new(25, 2, 1, 1, 7);
        let mut allocator = CceAllocator::new(region.nof_cce(), 7);
        let location = allocator.allocate(rnti, 2).unwrap();

        let mut grid = ResourceGrid::new(25);
        region.encode(&test_dci(), rnti, location, &mut grid).unwrap();

        let chest = ChannelEstimate::ideal(grid.nof_subcarriers());
        let found = region.blind_search(&grid, &chest, rnti);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, test_dci());
        assert_eq!(found[0].1.cce, location.cce);

        // another UE does not see it
        assert!(region.blind_search(&grid, &chest, Rnti::new(0x4602)).is_empty());
    }

    #[test]
    fn test_allocator_avoids_overlap() {
        let mut allocator = CceAllocator::new(8, 0);
        let a = allocator.allocate(Rnti::SI, 4).unwrap();
        let b = allocator.allocate(Rnti::P, 4).unwrap();
        assert_ne!(a.cce, b.cce);
        assert!(allocator.allocate(Rnti::new(1), 4).is_none());
    }

    #[test]
    fn test_location_outside_region() {
        let region = ControlRegion::new(6, 1, 0, 0, 0);
        let mut grid = ResourceGrid::new(6);
        let location = PdcchLocation { cce: 0, level: 8 };
        assert!(region.encode(&test_dci(), Rnti::new(0x46), location, &mut grid).is_err());
    }
}
