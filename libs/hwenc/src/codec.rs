// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-codec configuration derived from the encoder configuration.

use serde::{Deserialize, Serialize};

use crate::config::EncoderConfig;
use crate::driver::PresetConfig;
use crate::error::{EncodeError, Result};
use crate::rate_control::RateControlMode;

/// HEVC level 5.1 in the device's level numbering.
pub const HEVC_LEVEL_5_1: u32 = 153;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    #[default]
    H264,
    Hevc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Baseline,
    Main,
    High,
    High444p,
    Main10,
    Rext,
}

impl Profile {
    pub fn is_valid_for(self, codec: Codec) -> bool {
        match codec {
            Codec::H264 => matches!(
                self,
                Profile::Baseline | Profile::Main | Profile::High | Profile::High444p
            ),
            Codec::Hevc => matches!(self, Profile::Main | Profile::Main10 | Profile::Rext),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Main,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntropyCoder {
    #[default]
    Auto,
    Cavlc,
    Cabac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BFrameRefMode {
    #[default]
    Disabled,
    Each,
    Middle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VuiParams {
    pub colour_description_present: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub colour_matrix: u8,
    pub video_full_range: bool,
    pub video_signal_type_present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopStructure {
    pub gop_length: u32,
    /// Distance between anchor pictures; 0 is intra-only, 1 is I/P only.
    pub frame_interval_p: i32,
}

impl GopStructure {
    /// Applies the configured GOP size and B-frame count on top of the
    /// preset defaults.
    pub fn derive(config: &EncoderConfig, preset: &PresetConfig) -> Self {
        match config.gop_size {
            Some(0) => GopStructure {
                gop_length: 1,
                frame_interval_p: 0,
            },
            Some(gop) => GopStructure {
                gop_length: gop,
                frame_interval_p: config.max_b_frames as i32 + 1,
            },
            None => GopStructure {
                gop_length: preset.gop_length,
                frame_interval_p: preset.frame_interval_p,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodecConfig {
    pub codec: Codec,
    /// `None` for lossless H.264, which signals transform bypass instead.
    pub profile: Option<Profile>,
    pub level: u32,
    pub tier: Tier,
    pub chroma_format_idc: u32,
    pub bit_depth_minus8: u32,
    pub lossless_transform_bypass: bool,
    pub adaptive_transform: bool,
    pub vui: VuiParams,
    pub slice_mode: u32,
    pub slice_mode_data: u32,
    pub disable_sps_pps: bool,
    pub repeat_sps_pps: bool,
    pub output_aud: bool,
    pub max_num_ref_frames: Option<u32>,
    pub idr_period: u32,
    pub buffering_period_sei: bool,
    pub picture_timing_sei: bool,
    pub entropy_coder: EntropyCoder,
    pub b_ref_mode: BFrameRefMode,
    pub num_ref_l0: u32,
    pub num_ref_l1: u32,
}

impl CodecConfig {
    pub fn derive(
        config: &EncoderConfig,
        rc_mode: RateControlMode,
        gop: GopStructure,
        lossless: bool,
    ) -> Result<Self> {
        if let Some(profile) = config.profile {
            if !profile.is_valid_for(config.codec) {
                return Err(EncodeError::Configuration(format!(
                    "profile {:?} is not valid for {:?}",
                    profile, config.codec
                )));
            }
        }

        let color = &config.color;
        let colour_description_present =
            color.matrix != 2 || color.primaries != 2 || color.transfer != 2;
        let vui = VuiParams {
            colour_description_present,
            colour_primaries: color.primaries,
            transfer_characteristics: color.transfer,
            colour_matrix: color.matrix,
            video_full_range: color.full_range,
            video_signal_type_present: colour_description_present || color.full_range,
        };

        let pix = config.pixel_format;
        let mut cc = CodecConfig {
            codec: config.codec,
            profile: None,
            level: config.level,
            tier: config.tier,
            chroma_format_idc: 1,
            bit_depth_minus8: 0,
            lossless_transform_bypass: false,
            adaptive_transform: false,
            vui,
            slice_mode: 3,
            slice_mode_data: 1,
            disable_sps_pps: config.global_header,
            repeat_sps_pps: !config.global_header,
            output_aud: config.aud,
            max_num_ref_frames: config.dpb_size,
            idr_period: gop.gop_length,
            buffering_period_sei: rc_mode.is_cbr(),
            picture_timing_sei: true,
            entropy_coder: config.coder,
            b_ref_mode: config.b_ref_mode,
            num_ref_l0: config.refs,
            num_ref_l1: config.refs,
        };

        match config.codec {
            Codec::H264 => {
                if matches!(
                    rc_mode,
                    RateControlMode::CbrLowDelayHq | RateControlMode::CbrHq | RateControlMode::VbrHq
                ) {
                    cc.adaptive_transform = true;
                }

                if lossless {
                    cc.lossless_transform_bypass = true;
                } else {
                    cc.profile = Some(config.profile.unwrap_or(Profile::High));
                }
                if pix.is_yuv444() {
                    cc.profile = Some(Profile::High444p);
                }
                if cc.profile == Some(Profile::High444p) {
                    cc.chroma_format_idc = 3;
                }
            }
            Codec::Hevc => {
                let mut profile = config.profile.unwrap_or(Profile::Main);
                if pix.is_10bit() {
                    profile = Profile::Main10;
                }
                if pix.is_yuv444() {
                    profile = Profile::Rext;
                }
                cc.profile = Some(profile);
                cc.chroma_format_idc = if pix.is_yuv444() { 3 } else { 1 };
                cc.bit_depth_minus8 = if pix.is_10bit() { 2 } else { 0 };
            }
        }

        Ok(cc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    #[test]
    fn test_gop_derivation() {
        let preset = PresetConfig::default();
        let mut config = EncoderConfig::new(1920, 1080);

        let gop = GopStructure::derive(&config, &preset);
        assert_eq!(gop.gop_length, preset.gop_length);
        assert_eq!(gop.frame_interval_p, preset.frame_interval_p);

        config.gop_size = Some(60);
        config.max_b_frames = 2;
        let gop = GopStructure::derive(&config, &preset);
        assert_eq!(gop.gop_length, 60);
        assert_eq!(gop.frame_interval_p, 3);

        config.gop_size = Some(0);
        let gop = GopStructure::derive(&config, &preset);
        assert_eq!(gop.gop_length, 1);
        assert_eq!(gop.frame_interval_p, 0);
    }

    #[test]
    fn test_h264_profile_forced_for_yuv444() {
        let config = EncoderConfig::new(640, 480)
            .with_pixel_format(PixelFormat::Yuv444p)
            .with_profile(Profile::Main);
        let gop = GopStructure {
            gop_length: 30,
            frame_interval_p: 1,
        };
        let cc = CodecConfig::derive(&config, RateControlMode::Vbr, gop, false).unwrap();
        assert_eq!(cc.profile, Some(Profile::High444p));
        assert_eq!(cc.chroma_format_idc, 3);
        assert_eq!(cc.idr_period, 30);
    }

    #[test]
    fn test_h264_lossless_uses_transform_bypass() {
        let config = EncoderConfig::new(640, 480);
        let gop = GopStructure {
            gop_length: 30,
            frame_interval_p: 1,
        };
        let cc = CodecConfig::derive(&config, RateControlMode::ConstQp, gop, true).unwrap();
        assert!(cc.lossless_transform_bypass);
        assert_eq!(cc.profile, None);
        assert!(!cc.buffering_period_sei);
    }

    #[test]
    fn test_hevc_10bit_and_cbr_sei() {
        let config = EncoderConfig::new(3840, 2160)
            .with_codec(Codec::Hevc)
            .with_pixel_format(PixelFormat::P010);
        let gop = GopStructure {
            gop_length: 120,
            frame_interval_p: 1,
        };
        let cc = CodecConfig::derive(&config, RateControlMode::Cbr, gop, false).unwrap();
        assert_eq!(cc.profile, Some(Profile::Main10));
        assert_eq!(cc.bit_depth_minus8, 2);
        assert_eq!(cc.chroma_format_idc, 1);
        assert!(cc.buffering_period_sei);
        assert!(cc.picture_timing_sei);
        assert!(cc.repeat_sps_pps);
    }

    #[test]
    fn test_vui_flags() {
        let mut config = EncoderConfig::new(1280, 720);
        let gop = GopStructure {
            gop_length: 30,
            frame_interval_p: 1,
        };
        let cc = CodecConfig::derive(&config, RateControlMode::Vbr, gop, false).unwrap();
        assert!(!cc.vui.colour_description_present);
        assert!(!cc.vui.video_signal_type_present);

        config.color.full_range = true;
        let cc = CodecConfig::derive(&config, RateControlMode::Vbr, gop, false).unwrap();
        assert!(!cc.vui.colour_description_present);
        assert!(cc.vui.video_signal_type_present);

        config.color.primaries = 1;
        let cc = CodecConfig::derive(&config, RateControlMode::Vbr, gop, false).unwrap();
        assert!(cc.vui.colour_description_present);
    }

    #[test]
    fn test_profile_codec_mismatch() {
        let config = EncoderConfig::new(640, 480)
            .with_codec(Codec::Hevc)
            .with_profile(Profile::Baseline);
        let gop = GopStructure {
            gop_length: 30,
            frame_interval_p: 1,
        };
        assert!(CodecConfig::derive(&config, RateControlMode::Vbr, gop, false).is_err());
    }
}
