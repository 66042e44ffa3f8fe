//! Modulation Mapper and Soft Demapper
//!
//! QPSK, 16QAM and 64QAM with the LTE bit-to-symbol mapping. Even bits of a
//! symbol drive the in-phase axis and odd bits the quadrature axis. The demapper
//! produces max-log LLRs where a positive value favours bit 0.

use common::ModulationScheme;
use num_complex::Complex32;

/// Per-axis PAM amplitude for the given axis bits (sign bit first)
fn axis_amplitude(bits: &[u8]) -> f32 {
    let s = |b: u8| 1.0 - 2.0 * b as f32;
    match bits.len() {
        1 => s(bits[0]),
        2 => s(bits[0]) * (2.0 - s(bits[1])),
        3 => s(bits[0]) * (4.0 - s(bits[1]) * (2.0 - s(bits[2]))),
        _ => 0.0,
    }
}

/// Normalisation that gives the constellation unit average power
fn scale(modulation: ModulationScheme) -> f32 {
    match modulation {
        ModulationScheme::Qpsk => std::f32::consts::FRAC_1_SQRT_2,
        ModulationScheme::Qam16 => 1.0 / 10f32.sqrt(),
        ModulationScheme::Qam64 => 1.0 / 42f32.sqrt(),
    }
}

/// Every level of one axis with its bit labels
fn axis_levels(bits_per_axis: usize) -> Vec<(f32, Vec<u8>)> {
    (0..1usize << bits_per_axis)
        .map(|v| {
            let label: Vec<u8> = (0..bits_per_axis)
                .map(|i| ((v >> (bits_per_axis - 1 - i)) & 1) as u8)
                .collect();
            (axis_amplitude(&label), label)
        })
        .collect()
}

/// Map bits to symbols; `bits.len()` must be a multiple of the modulation order
pub fn modulate(bits: &[u8], modulation: ModulationScheme) -> Vec<Complex32> {
    let qm = modulation.bits_per_symbol();
    let half = qm / 2;
    let norm = scale(modulation);
    let mut i_bits = Vec::with_capacity(half);
    let mut q_bits = Vec::with_capacity(half);

    bits.chunks_exact(qm)
        .map(|chunk| {
            i_bits.clear();
            q_bits.clear();
            for (n, &bit) in chunk.iter().enumerate() {
                if n % 2 == 0 {
                    i_bits.push(bit);
                } else {
                    q_bits.push(bit);
                }
            }
            Complex32::new(axis_amplitude(&i_bits) * norm, axis_amplitude(&q_bits) * norm)
        })
        .collect()
}

/// Max-log soft demapping of equalised symbols.
///
/// `noise_var` is the post-equalisation noise variance of each symbol.
pub fn demodulate_soft(symbols: &[Complex32], noise_var: &[f32], modulation: ModulationScheme) -> Vec<f32> {
    let qm = modulation.bits_per_symbol();
    let half = qm / 2;
    let norm = scale(modulation);
    let levels = axis_levels(half);
    let mut llrs = Vec::with_capacity(symbols.len() * qm);

    for (sym, &var) in symbols.iter().zip(noise_var.iter()) {
        let inv_var = 1.0 / var.max(1e-9);
        let i_llr = axis_llrs(sym.re / norm, &levels, half);
        let q_llr = axis_llrs(sym.im / norm, &levels, half);
        for n in 0..half {
            // distances were computed on the unnormalised grid
            llrs.push(i_llr[n] * norm * norm * inv_var);
            llrs.push(q_llr[n] * norm * norm * inv_var);
        }
    }

    llrs
}

fn axis_llrs(y: f32, levels: &[(f32, Vec<u8>)], bits_per_axis: usize) -> Vec<f32> {
    (0..bits_per_axis)
        .map(|bit| {
            let mut d0 = f32::MAX;
            let mut d1 = f32::MAX;
            for (amp, label) in levels {
                let d = (y - amp) * (y - amp);
                if label[bit] == 0 {
                    d0 = d0.min(d);
                } else {
                    d1 = d1.min(d);
                }
            }
            d1 - d0
        })
        .collect()
}

/// Hard decisions from LLRs
pub fn hard_decision(llrs: &[f32]) -> Vec<u8> {
    llrs.iter().map(|&l| if l < 0.0 { 1 } else { 0 }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_bits(qm: usize) -> Vec<u8> {
        (0..1usize << qm)
            .flat_map(|v| (0..qm).map(move |i| ((v >> (qm - 1 - i)) & 1) as u8))
            .collect()
    }

    #[test]
    fn test_constellations_have_unit_power() {
        for modulation in [ModulationScheme::Qpsk, ModulationScheme::Qam16, ModulationScheme::Qam64] {
            let symbols = modulate(&all_bits(modulation.bits_per_symbol()), modulation);
            let power: f32 = symbols.iter().map(|s| s.norm_sqr()).sum::<f32>() / symbols.len() as f32;
            assert!((power - 1.0).abs() < 1e-4, "{:?} power {}", modulation, power);
        }
    }

    #[test]
    fn test_lte_16qam_points() {
        let s = modulate(&[0, 0, 0, 0, 1, 1, 1, 1], ModulationScheme::Qam16);
        let a = 1.0 / 10f32.sqrt();
        assert!((s[0] - Complex32::new(a, a)).norm() < 1e-6);
        assert!((s[1] - Complex32::new(-3.0 * a, -3.0 * a)).norm() < 1e-6);
    }

    #[test]
    fn test_noiseless_demapping_recovers_bits() {
        for modulation in [ModulationScheme::Qpsk, ModulationScheme::Qam16, ModulationScheme::Qam64] {
            let bits = all_bits(modulation.bits_per_symbol());
            let symbols = modulate(&bits, modulation);
            let var = vec![0.01; symbols.len()];
            let llrs = demodulate_soft(&symbols, &var, modulation);
            assert_eq!(hard_decision(&llrs), bits, "{:?}", modulation);
        }
    }
}
