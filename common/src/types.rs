//! Common Types for the LTE/NR PHY pipeline
//!
//! Defines fundamental types shared by the radio interfaces and the protocol layers

use crate::CommonError;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// System information RNTI
    pub const SI: Self = Self(0xFFFF);
    /// Paging RNTI
    pub const P: Self = Self(0xFFFE);
    /// First RNTI value handed out as C-RNTI
    pub const CRNTI_START: u16 = 0x46;
    /// Last RNTI value usable as C-RNTI
    pub const CRNTI_END: u16 = 0xFFF3;

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// RA-RNTI for a PRACH occasion in subframe `t_id` (FDD, f_id = 0)
    pub fn ra_rnti(t_id: u8) -> Self {
        Self(1 + t_id as u16)
    }

    /// Check whether the value falls in the C-RNTI range
    pub fn is_crnti(&self) -> bool {
        (Self::CRNTI_START..=Self::CRNTI_END).contains(&self.0)
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Physical Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pci(pub u16);

impl Pci {
    /// Maximum valid PCI value (0-1007)
    pub const MAX: u16 = 1007;
    /// Maximum valid LTE PCI value (0-503)
    pub const MAX_LTE: u16 = 503;
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
}

impl SubcarrierSpacing {
    /// Spacing in Hz
    pub fn as_hz(&self) -> f64 {
        (*self as u32) as f64 * 1000.0
    }
}

/// Radio access technology driving the tick grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Rat {
    /// LTE: one tick is a 1 ms subframe
    Lte,
    /// NR: one tick is a slot of the given numerology
    Nr { numerology: u8 },
}

impl Rat {
    /// Number of LTE TTIs before the tick counter wraps
    pub const LTE_NOF_TTI: u32 = 10240;
    /// OFDM symbols carried by one tick (normal CP)
    pub const SYMBOLS_PER_TICK: usize = 14;

    /// Subcarrier spacing used by this RAT
    pub fn scs(&self) -> Result<SubcarrierSpacing, CommonError> {
        let numerology = self.numerology();
        (numerology < 8)
            .then(|| SubcarrierSpacing::from_u32(15 << numerology))
            .flatten()
            .ok_or_else(|| CommonError::Unsupported(format!("NR numerology {}", numerology)))
    }

    /// Numerology index (mu), 0 for LTE
    pub fn numerology(&self) -> u8 {
        match self {
            Rat::Lte => 0,
            Rat::Nr { numerology } => *numerology,
        }
    }

    /// Ticks per 1 ms subframe
    pub fn ticks_per_subframe(&self) -> u32 {
        1 << self.numerology()
    }

    /// Ticks per 10 ms radio frame
    pub fn ticks_per_frame(&self) -> u32 {
        10 * self.ticks_per_subframe()
    }

    /// Tick counter modulus (1024 frames)
    pub fn tick_modulus(&self) -> u32 {
        Self::LTE_NOF_TTI * self.ticks_per_subframe()
    }

    /// Check whether a PRB count is a valid carrier width for this RAT
    pub fn is_valid_nof_prb(&self, nof_prb: u16) -> bool {
        match self {
            Rat::Lte => matches!(nof_prb, 6 | 15 | 25 | 50 | 75 | 100),
            Rat::Nr { .. } => (1..=275).contains(&nof_prb),
        }
    }
}

impl fmt::Display for Rat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rat::Lte => write!(f, "LTE"),
            Rat::Nr { numerology } => write!(f, "NR(mu={})", numerology),
        }
    }
}

/// Timing tick index (LTE TTI or NR slot), always reduced modulo the RAT tick modulus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Tti(pub u32);

impl Tti {
    /// Advance by `n` ticks with wrap-around
    pub fn add(self, n: u32, modulus: u32) -> Self {
        Self(((self.0 as u64 + n as u64) % modulus as u64) as u32)
    }

    /// Next tick with wrap-around
    pub fn next(self, modulus: u32) -> Self {
        self.add(1, modulus)
    }

    /// Ticks elapsed from `earlier` to `self` across the wrap
    pub fn distance_from(self, earlier: Tti, modulus: u32) -> u32 {
        (self.0 + modulus - earlier.0 % modulus) % modulus
    }

    /// System frame number
    pub fn sfn(self, ticks_per_frame: u32) -> u32 {
        self.0 / ticks_per_frame
    }

    /// Tick index inside its radio frame
    pub fn tick_in_frame(self, ticks_per_frame: u32) -> u32 {
        self.0 % ticks_per_frame
    }
}

impl fmt::Display for Tti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel bandwidth values in MHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bandwidth {
    /// 1.4 MHz
    Bw1_4,
    /// 3 MHz
    Bw3,
    /// 5 MHz
    Bw5,
    /// 10 MHz
    Bw10,
    /// 15 MHz
    Bw15,
    /// 20 MHz
    Bw20,
    /// 40 MHz
    Bw40,
    /// 50 MHz
    Bw50,
    /// 100 MHz
    Bw100,
}

impl Bandwidth {
    /// Parse a bandwidth in MHz as written in configuration files
    pub fn from_mhz(mhz: f32) -> Result<Self, CommonError> {
        let bw = match (mhz * 10.0).round() as u32 {
            14 => Bandwidth::Bw1_4,
            30 => Bandwidth::Bw3,
            50 => Bandwidth::Bw5,
            100 => Bandwidth::Bw10,
            150 => Bandwidth::Bw15,
            200 => Bandwidth::Bw20,
            400 => Bandwidth::Bw40,
            500 => Bandwidth::Bw50,
            1000 => Bandwidth::Bw100,
            _ => return Err(CommonError::InvalidValue(format!("bandwidth {} MHz", mhz))),
        };
        Ok(bw)
    }

    /// Number of PRBs in this channel for the given RAT
    pub fn nof_prb(&self, rat: Rat) -> Option<u16> {
        match (rat.numerology(), rat) {
            (_, Rat::Lte) => match self {
                Bandwidth::Bw1_4 => Some(6),
                Bandwidth::Bw3 => Some(15),
                Bandwidth::Bw5 => Some(25),
                Bandwidth::Bw10 => Some(50),
                Bandwidth::Bw15 => Some(75),
                Bandwidth::Bw20 => Some(100),
                _ => None,
            },
            (0, _) => match self {
                Bandwidth::Bw5 => Some(25),
                Bandwidth::Bw10 => Some(52),
                Bandwidth::Bw15 => Some(79),
                Bandwidth::Bw20 => Some(106),
                Bandwidth::Bw40 => Some(216),
                Bandwidth::Bw50 => Some(270),
                _ => None,
            },
            (1, _) => match self {
                Bandwidth::Bw5 => Some(11),
                Bandwidth::Bw10 => Some(24),
                Bandwidth::Bw15 => Some(38),
                Bandwidth::Bw20 => Some(51),
                Bandwidth::Bw40 => Some(106),
                Bandwidth::Bw50 => Some(133),
                Bandwidth::Bw100 => Some(273),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Modulation schemes used by the shared channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModulationScheme {
    Qpsk,
    Qam16,
    Qam64,
}

impl ModulationScheme {
    /// Highest MCS index accepted by the shared channels
    pub const MAX_MCS: u8 = 28;

    /// Modulation order for an MCS index (LTE 64QAM table)
    pub fn from_mcs(mcs: u8) -> Option<Self> {
        match mcs {
            0..=9 => Some(Self::Qpsk),
            10..=16 => Some(Self::Qam16),
            17..=28 => Some(Self::Qam64),
            _ => None,
        }
    }

    /// Bits carried by one constellation symbol
    pub fn bits_per_symbol(&self) -> usize {
        match self {
            Self::Qpsk => 2,
            Self::Qam16 => 4,
            Self::Qam64 => 6,
        }
    }
}
