//! Shared Channel Coding (PDSCH / PUSCH)
//!
//! Transport blocks get a CRC24, then a circular-buffer rate matcher selects the
//! coded bits of each redundancy version. Receivers combine LLRs of every
//! transmission of a HARQ process in a softbuffer before the CRC check.

use super::grid::{pdsch_re_per_prb, pusch_re_per_prb};
use super::sequence::{descramble_llrs, scramble_bits};
use bytes::Bytes;
use common::{crc24, pack_bits, unpack_bits, ModulationScheme, Tti};

/// Bits of the transport block CRC
pub const TB_CRC_BITS: usize = 24;

/// Effective code rate of an MCS index
pub fn code_rate(mcs: u8) -> f32 {
    match mcs {
        0..=9 => 0.12 + 0.07 * mcs as f32,
        10..=16 => 0.33 + 0.07 * (mcs - 10) as f32,
        _ => 0.43 + 0.045 * (mcs.min(ModulationScheme::MAX_MCS) - 17) as f32,
    }
}

/// Transport block size in bytes for `nof_re` resource elements
pub fn tbs_bytes(mcs: u8, nof_re: usize) -> usize {
    let Some(modulation) = ModulationScheme::from_mcs(mcs) else {
        return 0;
    };
    let coded_bits = nof_re * modulation.bits_per_symbol();
    let info_bits = (coded_bits as f32 * code_rate(mcs)) as usize;
    info_bits.saturating_sub(TB_CRC_BITS) / 8
}

/// Downlink transport block size in bytes
pub fn dl_tbs(mcs: u8, nof_prb: u16, cfi: u8) -> usize {
    tbs_bytes(mcs, nof_prb as usize * pdsch_re_per_prb(cfi))
}

/// Uplink transport block size in bytes
pub fn ul_tbs(mcs: u8, nof_prb: u16) -> usize {
    tbs_bytes(mcs, nof_prb as usize * pusch_re_per_prb())
}

/// Scrambling initialisation of a shared channel transmission
pub fn scrambling_c_init(rnti: u16, tick_in_frame: u32, pci: u16) -> u32 {
    (((rnti as u32) << 14) + (tick_in_frame << 9) + pci as u32) & 0x7FFF_FFFF
}

/// Start of redundancy version `rv` in a circular buffer of `ncb` bits
fn rv_start(rv: u8, ncb: usize) -> usize {
    (rv as usize % 4) * ncb / 4
}

/// Encode a transport block into `nof_bits` scrambled coded bits
pub fn encode(tb: &[u8], rv: u8, nof_bits: usize, c_init: u32) -> Vec<u8> {
    let mut block = unpack_bits(tb);
    let crc = crc24(tb);
    for i in (0..TB_CRC_BITS).rev() {
        block.push(((crc >> i) & 1) as u8);
    }

    let ncb = block.len();
    let k0 = rv_start(rv, ncb);
    let mut coded: Vec<u8> = (0..nof_bits).map(|i| block[(k0 + i) % ncb]).collect();
    scramble_bits(&mut coded, c_init);
    coded
}

/// Combined LLRs of one HARQ process
#[derive(Debug, Clone, Default)]
pub struct Softbuffer {
    llrs: Vec<f32>,
    nof_combined: u32,
    ndi: Option<bool>,
    tbs: usize,
    last_tti: Option<Tti>,
}

impl Softbuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all accumulated energy
    pub fn reset(&mut self) {
        self.llrs.clear();
        self.nof_combined = 0;
        self.ndi = None;
        self.tbs = 0;
        self.last_tti = None;
    }

    /// Prepare for a transmission at `tti`.
    ///
    /// Combining continues only for the same NDI and size when the previous
    /// transmission was at most `max_gap` ticks ago; anything else restarts the
    /// buffer. Returns whether combining continues.
    pub fn begin(&mut self, ndi: bool, tbs: usize, tti: Tti, max_gap: u32, modulus: u32) -> bool {
        let continues = self.ndi == Some(ndi)
            && self.tbs == tbs
            && self
                .last_tti
                .map(|last| tti.distance_from(last, modulus) <= max_gap)
                .unwrap_or(false);

        if !continues {
            self.reset();
            self.ndi = Some(ndi);
            self.tbs = tbs;
            self.llrs = vec![0.0; 8 * tbs + TB_CRC_BITS];
        }
        self.last_tti = Some(tti);
        continues
    }

    /// Transmissions combined so far
    pub fn nof_combined(&self) -> u32 {
        self.nof_combined
    }
}

/// Outcome of one shared channel decode
#[derive(Debug, Clone, PartialEq)]
pub struct SchDecodeResult {
    pub crc_ok: bool,
    /// Decoded transport block when the CRC passed
    pub data: Option<Bytes>,
    /// Transmissions combined, this one included
    pub nof_combined: u32,
}

/// Descramble, combine into `softbuffer` and check the CRC.
///
/// `softbuffer.begin` must have been called for this transmission.
pub fn decode(llrs: &mut [f32], rv: u8, c_init: u32, softbuffer: &mut Softbuffer) -> SchDecodeResult {
    descramble_llrs(llrs, c_init);

    let ncb = softbuffer.llrs.len();
    if ncb <= TB_CRC_BITS {
        return SchDecodeResult {
            crc_ok: false,
            data: None,
            nof_combined: softbuffer.nof_combined,
        };
    }

    let k0 = rv_start(rv, ncb);
    for (i, llr) in llrs.iter().enumerate() {
        softbuffer.llrs[(k0 + i) % ncb] += llr;
    }
    softbuffer.nof_combined += 1;

    let bits: Vec<u8> = softbuffer.llrs.iter().map(|&l| (l < 0.0) as u8).collect();
    let tb_bits = ncb - TB_CRC_BITS;
    let data = pack_bits(&bits[..tb_bits]);
    let received_crc = bits[tb_bits..]
        .iter()
        .fold(0u32, |acc, &b| (acc << 1) | b as u32);
    let untouched = softbuffer.llrs.iter().any(|&l| l == 0.0);
    let crc_ok = !untouched && crc24(&data) == received_crc;

    SchDecodeResult {
        crc_ok,
        data: crc_ok.then_some(data),
        nof_combined: softbuffer.nof_combined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_llrs(bits: &[u8], amplitude: f32) -> Vec<f32> {
        bits.iter().map(|&b| if b == 0 { amplitude } else { -amplitude }).collect()
    }

    #[test]
    fn test_tbs_grows_with_mcs_and_prb() {
        assert!(dl_tbs(28, 4, 2) > dl_tbs(10, 4, 2));
        assert!(dl_tbs(10, 8, 2) > dl_tbs(10, 4, 2));
        assert!(ul_tbs(5, 10) > 0);
        assert_eq!(tbs_bytes(29, 1000), 0);
    }

    #[test]
    fn test_encode_decode_single_transmission() {
        let tb: Vec<u8> = (0..40u8).collect();
        let nof_bits = 2 * (8 * tb.len() + TB_CRC_BITS);
        let coded = encode(&tb, 0, nof_bits, 1234);

        let mut softbuffer = Softbuffer::new();
        softbuffer.begin(true, tb.len(), Tti(0), 8, 10240);
        let mut llrs = to_llrs(&coded, 1.0);
        let result = decode(&mut llrs, 0, 1234, &mut softbuffer);
        assert!(result.crc_ok);
        assert_eq!(result.data.unwrap().as_ref(), tb.as_slice());
        assert_eq!(result.nof_combined, 1);
    }

    #[test]
    fn test_retransmission_combines() {
        let tb = vec![0xA5u8; 20];
        let ncb = 8 * tb.len() + TB_CRC_BITS;
        // each transmission covers only half of the buffer
        let nof_bits = ncb / 2;

        let mut softbuffer = Softbuffer::new();
        assert!(!softbuffer.begin(false, tb.len(), Tti(10), 8, 10240));
        let mut first = to_llrs(&encode(&tb, 0, nof_bits, 7), 1.0);
        assert!(!decode(&mut first, 0, 7, &mut softbuffer).crc_ok);

        assert!(softbuffer.begin(false, tb.len(), Tti(18), 8, 10240));
        let mut second = to_llrs(&encode(&tb, 2, nof_bits, 7), 1.0);
        let result = decode(&mut second, 2, 7, &mut softbuffer);
        assert!(result.crc_ok);
        assert_eq!(result.nof_combined, 2);
    }

    #[test]
    fn test_softbuffer_resets_on_new_data_or_stale_tti() {
        let mut softbuffer = Softbuffer::new();
        softbuffer.begin(false, 10, Tti(0), 8, 10240);
        assert!(!softbuffer.begin(true, 10, Tti(8), 8, 10240));
        assert!(!softbuffer.begin(true, 10, Tti(24), 8, 10240));
        assert!(!softbuffer.begin(true, 12, Tti(32), 8, 10240));
        // wraps across the tick modulus
        softbuffer.begin(false, 10, Tti(10236), 8, 10240);
        assert!(softbuffer.begin(false, 10, Tti(4), 8, 10240));
    }

    #[test]
    fn test_corrupted_bits_fail_crc() {
        let tb = vec![0x3Cu8; 16];
        let nof_bits = 8 * tb.len() + TB_CRC_BITS;
        let mut llrs = to_llrs(&encode(&tb, 0, nof_bits, 99), 1.0);
        for llr in llrs.iter_mut().take(40) {
            *llr = -*llr;
        }
        let mut softbuffer = Softbuffer::new();
        softbuffer.begin(true, tb.len(), Tti(0), 8, 10240);
        let result = decode(&mut llrs, 0, 99, &mut softbuffer);
        assert!(!result.crc_ok);
        assert!(result.data.is_none());
    }
}
