//! Discrete voltage levels of the shared rail.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// One value per [`VoltageLevel`], indexed by [`VoltageLevel::index`].
pub type LevelTable<T> = [T; VoltageLevel::COUNT];

/// Operating-voltage tier of the shared rail, ordered from lowest to highest.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum VoltageLevel {
    LowSvs,
    Svs,
    SvsL1,
    Nominal,
    Turbo,
}

impl VoltageLevel {
    pub const COUNT: usize = 5;

    pub const LOWEST: Self = Self::LowSvs;

    pub const HIGHEST: Self = Self::Turbo;

    pub const ALL: [Self; Self::COUNT] = [
        Self::LowSvs,
        Self::Svs,
        Self::SvsL1,
        Self::Nominal,
        Self::Turbo,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Raw rail corner value reported by the clock backend for this level.
    pub fn corner(self) -> u32 {
        match self {
            Self::LowSvs => 64,
            Self::Svs => 128,
            Self::SvsL1 => 192,
            Self::Nominal => 256,
            Self::Turbo => 384,
        }
    }

    /// Maps a raw backend corner to the highest level it satisfies.
    ///
    /// Corners below the lowest defined level are clamped up to [`Self::LOWEST`].
    pub fn from_corner(corner: u32) -> Self {
        Self::ALL
            .iter()
            .rev()
            .find(|level| level.corner() <= corner)
            .copied()
            .unwrap_or(Self::LOWEST)
    }
}
