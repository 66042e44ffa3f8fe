//! PRACH (Physical Random Access Channel)
//!
//! Long preamble (format 0) occasions, Zadoff-Chu generation and detection.
//! The detector takes one subframe of baseband samples, extracts the 839
//! preamble bins with a single DFT and correlates every root in the frequency
//! domain. Each cyclic shift owns a window of the correlation; a peak above
//! `threshold` times the mean correlation power is a detected preamble, and the
//! peak lag inside the window gives the timing advance.

use super::config::PrachConfig;
use crate::LayerError;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use tracing::{debug, trace};

/// Zadoff-Chu length of long preambles
pub const PRACH_SEQUENCE_LENGTH: usize = 839;
/// Preambles per cell
pub const NOF_PREAMBLES: usize = 64;
/// Preamble subcarrier spacing in Hz
const PRACH_SCS_HZ: f64 = 1250.0;
/// Timing advance granularity in seconds (16 Ts)
const TA_UNIT_S: f64 = 16.0 / 30.72e6;

/// Cyclic shift N_cs per zero correlation zone configuration (unrestricted set)
const NCS_UNRESTRICTED: [usize; 16] = [0, 13, 15, 18, 22, 26, 32, 38, 46, 59, 76, 93, 119, 167, 279, 419];

/// Whether subframe `subframe` of frame `sfn` is a PRACH occasion (FDD, format 0)
pub fn is_occasion(config_index: u8, sfn: u32, subframe: u32) -> bool {
    let (even_frames_only, subframes): (bool, &[u32]) = match config_index {
        0 => (true, &[1]),
        1 => (true, &[4]),
        2 => (true, &[7]),
        3 => (false, &[1]),
        4 => (false, &[4]),
        5 => (false, &[7]),
        6 => (false, &[1, 6]),
        7 => (false, &[2, 7]),
        8 => (false, &[3, 8]),
        9 => (false, &[1, 4, 7]),
        10 => (false, &[2, 5, 8]),
        11 => (false, &[3, 6, 9]),
        12 => (false, &[0, 2, 4, 6, 8]),
        13 => (false, &[1, 3, 5, 7, 9]),
        14 => (false, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]),
        15 => (true, &[9]),
        _ => return false,
    };
    (!even_frames_only || sfn % 2 == 0) && subframes.contains(&subframe)
}

/// Zadoff-Chu root sequence in the time domain
fn zc_sequence(u: usize) -> Vec<Complex32> {
    let n_zc = PRACH_SEQUENCE_LENGTH as u64;
    (0..n_zc)
        .map(|n| {
            let m = (u as u64 * n * (n + 1)) % (2 * n_zc);
            let phase = -std::f64::consts::PI * m as f64 / n_zc as f64;
            Complex32::new(phase.cos() as f32, phase.sin() as f32)
        })
        .collect()
}

/// Placement of the preamble in the sampled subframe
#[derive(Debug, Clone, Copy)]
struct PrachLayout {
    dft_size: usize,
    cp_len: usize,
    first_bin: i64,
    occasion_len: usize,
    sample_rate: f64,
}

impl PrachLayout {
    fn new(config: &PrachConfig, nof_prb: u16, fft_size: usize, numerology: u8) -> Self {
        let scale = 1usize << numerology;
        let k = (15_000.0 * scale as f64 / PRACH_SCS_HZ) as i64;
        let subcarrier_offset = 12 * config.freq_offset as i64 - 6 * nof_prb as i64;
        Self {
            dft_size: 12 * fft_size * scale,
            cp_len: 3168 * fft_size * scale / 2048,
            first_bin: k * subcarrier_offset + 7,
            occasion_len: 15 * fft_size * scale,
            sample_rate: fft_size as f64 * 15_000.0 * scale as f64,
        }
    }

    fn bin(&self, n: usize) -> usize {
        (self.first_bin + n as i64).rem_euclid(self.dft_size as i64) as usize
    }
}

/// Root sequences and cyclic shifts covering the 64 preambles
#[derive(Debug, Clone)]
struct PreambleSet {
    roots: Vec<Vec<Complex32>>,
    n_cs: usize,
    nof_shifts: usize,
}

impl PreambleSet {
    fn new(config: &PrachConfig, planner: &mut FftPlanner<f32>) -> Self {
        let n_cs = NCS_UNRESTRICTED[config.zero_corr_zone as usize % 16];
        let nof_shifts = if n_cs == 0 { 1 } else { PRACH_SEQUENCE_LENGTH / n_cs };
        let nof_roots = NOF_PREAMBLES.div_ceil(nof_shifts);

        let fft = planner.plan_fft_forward(PRACH_SEQUENCE_LENGTH);
        let roots = (0..nof_roots)
            .map(|i| {
                let u = (config.root_seq_index as usize + i) % (PRACH_SEQUENCE_LENGTH - 1) + 1;
                let mut spectrum = zc_sequence(u);
                fft.process(&mut spectrum);
                spectrum
            })
            .collect();

        Self { roots, n_cs, nof_shifts }
    }

    fn root_and_shift(&self, preamble: usize) -> (usize, usize) {
        (preamble / self.nof_shifts, (preamble % self.nof_shifts) * self.n_cs)
    }
}

/// One detected preamble
#[derive(Debug, Clone, PartialEq)]
pub struct PrachDetection {
    /// Preamble index (0..64)
    pub preamble: u8,
    /// Timing advance in units of 16 Ts
    pub ta: u32,
    /// Estimated round trip delay in microseconds
    pub delay_us: f32,
    /// Peak to mean correlation ratio
    pub metric: f32,
}

/// PRACH detector for one carrier
pub struct PrachDetector {
    layout: PrachLayout,
    preambles: PreambleSet,
    threshold: f32,
    fft: Arc<dyn Fft<f32>>,
    idft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex32>,
}

impl PrachDetector {
    /// Create a detector for a carrier of `nof_prb` PRB sampled with `fft_size`
    pub fn new(config: &PrachConfig, nof_prb: u16, fft_size: usize, numerology: u8) -> Result<Self, LayerError> {
        if config.freq_offset + 6 > nof_prb {
            return Err(LayerError::InvalidConfiguration(format!(
                "PRACH at PRB {} does not fit in {} PRB",
                config.freq_offset, nof_prb
            )));
        }

        let layout = PrachLayout::new(config, nof_prb, fft_size, numerology);
        let mut planner = FftPlanner::new();
        let preambles = PreambleSet::new(config, &mut planner);
        let fft = planner.plan_fft_forward(layout.dft_size);
        let idft = planner.plan_fft_inverse(PRACH_SEQUENCE_LENGTH);

        debug!(
            "PRACH detector: {} roots, N_cs={}, DFT {} CP {}",
            preambles.roots.len(),
            preambles.n_cs,
            layout.dft_size,
            layout.cp_len
        );

        Ok(Self {
            layout,
            preambles,
            threshold: config.threshold,
            fft,
            idft,
            buffer: vec![Complex32::new(0.0, 0.0); layout.dft_size],
        })
    }

    /// Samples of one occasion (one subframe)
    pub fn occasion_len(&self) -> usize {
        self.layout.occasion_len
    }

    /// Search one occasion for preambles
    pub fn detect(&mut self, samples: &[Complex32]) -> Result<Vec<PrachDetection>, LayerError> {
        let start = self.layout.cp_len;
        let end = start + self.layout.dft_size;
        if samples.len() < end {
            return Err(LayerError::ProcessingError(format!(
                "PRACH occasion holds {} samples, needs {}",
                samples.len(),
                end
            )));
        }

        self.buffer.copy_from_slice(&samples[start..end]);
        self.fft.process(&mut self.buffer);
        let received: Vec<Complex32> = (0..PRACH_SEQUENCE_LENGTH)
            .map(|n| self.buffer[self.layout.bin(n)])
            .collect();

        let n_zc = PRACH_SEQUENCE_LENGTH;
        let window = if self.preambles.n_cs == 0 { n_zc } else { self.preambles.n_cs };
        let mut detections = Vec::new();

        for (i, root) in self.preambles.roots.iter().enumerate() {
            let mut corr: Vec<Complex32> = received.iter().zip(root.iter()).map(|(y, x)| y * x.conj()).collect();
            self.idft.process(&mut corr);
            let power: Vec<f32> = corr.iter().map(|c| c.norm_sqr()).collect();
            let mean = power.iter().sum::<f32>() / n_zc as f32;
            if mean <= 0.0 {
                continue;
            }

            for v in 0..self.preambles.nof_shifts {
                let preamble = i * self.preambles.nof_shifts + v;
                if preamble >= NOF_PREAMBLES {
                    break;
                }
                let origin = (n_zc - v * self.preambles.n_cs) % n_zc;
                let (lag, peak) = (0..window)
                    .map(|lag| (lag, power[(origin + lag) % n_zc]))
                    .fold((0, 0.0f32), |best, cur| if cur.1 > best.1 { cur } else { best });

                let metric = peak / mean;
                trace!("PRACH preamble {} lag {} metric {:.1}", preamble, lag, metric);
                if metric > self.threshold {
                    let delay_s = lag as f64 * self.layout.dft_size as f64 / n_zc as f64 / self.layout.sample_rate;
                    detections.push(PrachDetection {
                        preamble: preamble as u8,
                        ta: (delay_s / TA_UNIT_S).round() as u32,
                        delay_us: (delay_s * 1e6) as f32,
                        metric,
                    });
                }
            }
        }

        Ok(detections)
    }
}

/// Preamble transmitter (UE side), used to exercise the detector
pub struct PrachGenerator {
    layout: PrachLayout,
    preambles: PreambleSet,
    idft: Arc<dyn Fft<f32>>,
}

impl PrachGenerator {
    pub fn new(config: &PrachConfig, nof_prb: u16, fft_size: usize, numerology: u8) -> Self {
        let layout = PrachLayout::new(config, nof_prb, fft_size, numerology);
        let mut planner = FftPlanner::new();
        let preambles = PreambleSet::new(config, &mut planner);
        let idft = planner.plan_fft_inverse(layout.dft_size);
        Self { layout, preambles, idft }
    }

    /// One occasion carrying `preamble`, delayed by `delay` samples (at most one CP)
    pub fn generate(&self, preamble: u8, delay: usize) -> Result<Vec<Complex32>, LayerError> {
        if preamble as usize >= NOF_PREAMBLES || delay > self.layout.cp_len {
            return Err(LayerError::ProcessingError(format!(
                "cannot generate preamble {} with delay {}",
                preamble, delay
            )));
        }

        let (root, shift) = self.preambles.root_and_shift(preamble as usize);
        let n_zc = PRACH_SEQUENCE_LENGTH;
        let mut freq = vec![Complex32::new(0.0, 0.0); self.layout.dft_size];
        for (n, x) in self.preambles.roots[root].iter().enumerate() {
            let phase = 2.0 * std::f64::consts::PI * ((shift * n) % n_zc) as f64 / n_zc as f64;
            freq[self.layout.bin(n)] = x * Complex32::new(phase.cos() as f32, phase.sin() as f32);
        }
        self.idft.process(&mut freq);

        let scale = 1.0 / (self.layout.dft_size as f32).sqrt();
        let cp = self.layout.cp_len;
        let mut out = vec![Complex32::new(0.0, 0.0); self.layout.occasion_len];
        for i in 0..cp + self.layout.dft_size {
            let src = (i + self.layout.dft_size - cp) % self.layout.dft_size;
            out[delay + i] = freq[src] * scale;
        }
        Ok(out)
    }
}
