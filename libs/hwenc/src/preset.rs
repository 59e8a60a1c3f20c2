// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Encoder presets and tuning.
//!
//! The device only knows the seven quality/speed presets `P1..P7`. Every
//! other name is an alias resolving to one of them plus [`PresetFlags`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
    Slow,
    #[default]
    Medium,
    Fast,
    Default,
    Hp,
    Hq,
    Bd,
    LowLatencyDefault,
    LowLatencyHp,
    LowLatencyHq,
    LosslessDefault,
    LosslessHp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tuning {
    #[default]
    HighQuality,
    LowLatency,
    UltraLowLatency,
    Lossless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multipass {
    #[default]
    Disabled,
    QuarterResolution,
    FullResolution,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PresetFlags: u32 {
        const ONE_PASS = 1 << 0;
        const TWO_PASSES = 1 << 1;
        const LOW_LATENCY = 1 << 2;
        const LOSSLESS = 1 << 3;
        const DEPRECATED = 1 << 4;
    }
}

/// A preset resolved to its device preset and behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPreset {
    pub preset: Preset,
    pub flags: PresetFlags,
    pub tuning: Tuning,
}

impl ResolvedPreset {
    pub fn is_lossless(&self) -> bool {
        self.flags.contains(PresetFlags::LOSSLESS)
    }

    pub fn is_low_latency(&self) -> bool {
        self.flags.contains(PresetFlags::LOW_LATENCY)
    }
}

impl Preset {
    /// Device preset and flags of this name.
    pub fn alias(self) -> (Preset, PresetFlags) {
        use PresetFlags as F;

        match self {
            Preset::P1
            | Preset::P2
            | Preset::P3
            | Preset::P4
            | Preset::P5
            | Preset::P6
            | Preset::P7 => (self, F::empty()),
            Preset::Slow => (Preset::P7, F::TWO_PASSES),
            Preset::Medium => (Preset::P4, F::ONE_PASS),
            Preset::Fast => (Preset::P1, F::ONE_PASS),
            Preset::Default => (Preset::P4, F::DEPRECATED),
            Preset::Hp => (Preset::P1, F::DEPRECATED),
            Preset::Hq => (Preset::P7, F::DEPRECATED),
            Preset::Bd => (Preset::P5, F::DEPRECATED),
            Preset::LowLatencyDefault => (Preset::P4, F::DEPRECATED | F::LOW_LATENCY),
            Preset::LowLatencyHp => (Preset::P1, F::DEPRECATED | F::LOW_LATENCY),
            Preset::LowLatencyHq => (Preset::P7, F::DEPRECATED | F::LOW_LATENCY),
            Preset::LosslessDefault => (Preset::P4, F::DEPRECATED | F::LOSSLESS),
            Preset::LosslessHp => (Preset::P1, F::DEPRECATED | F::LOSSLESS),
        }
    }

    /// Resolves the alias and folds the tuning into the flags.
    ///
    /// Lossless tuning implies the lossless flag; a lossless or low-latency
    /// flag then forces the matching tuning.
    pub fn resolve(self, tuning: Tuning) -> ResolvedPreset {
        let (preset, mut flags) = self.alias();

        if flags.contains(PresetFlags::DEPRECATED) {
            tracing::warn!(
                "Preset {:?} is deprecated, use p1 to p7 with a tuning or fast/medium/slow",
                self
            );
        }

        if tuning == Tuning::Lossless {
            flags |= PresetFlags::LOSSLESS;
        }

        let tuning = if flags.contains(PresetFlags::LOSSLESS) {
            Tuning::Lossless
        } else if flags.contains(PresetFlags::LOW_LATENCY) {
            Tuning::LowLatency
        } else {
            tuning
        };

        ResolvedPreset {
            preset,
            flags,
            tuning,
        }
    }
}
