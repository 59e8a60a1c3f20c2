// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Encoder session configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::{BFrameRefMode, Codec, EntropyCoder, HEVC_LEVEL_5_1, Profile, Tier};
use crate::device::DeviceSelection;
use crate::driver::ResourceType;
use crate::error::{EncodeError, Result};
use crate::format::PixelFormat;
use crate::preset::{Preset, Tuning};
use crate::rate_control::{QP_MAX, RateControlOptions};

/// Largest B-frame count any supported codec accepts.
pub const MAX_B_FRAMES: u32 = 7;

/// Where input frames live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Host planes copied into driver-owned input buffers.
    #[default]
    Host,
    /// Hardware frames registered and mapped in place.
    External,
}

/// Colour description written to the VUI. The value 2 means unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorDescription {
    pub matrix: u8,
    pub primaries: u8,
    pub transfer: u8,
    pub full_range: bool,
}

impl Default for ColorDescription {
    fn default() -> Self {
        Self {
            matrix: 2,
            primaries: 2,
            transfer: 2,
            full_range: false,
        }
    }
}

/// Encoder session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub codec: Codec,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Sample aspect ratio; 0 in either term means square pixels.
    pub sar_num: u32,
    pub sar_den: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub ticks_per_frame: u32,
    pub pixel_format: PixelFormat,
    pub input: InputMode,
    pub external_resource: Option<ResourceType>,
    pub device: DeviceSelection,
    pub preset: Preset,
    pub tuning: Tuning,
    pub profile: Option<Profile>,
    /// Codec level; 0 lets the device choose.
    pub level: u32,
    pub tier: Tier,
    /// `None` keeps the preset GOP, `Some(0)` is intra-only.
    pub gop_size: Option<u32>,
    pub max_b_frames: u32,
    /// Reference frame count; 0 lets the device choose.
    pub refs: u32,
    pub dpb_size: Option<u32>,
    pub coder: EntropyCoder,
    pub b_ref_mode: BFrameRefMode,
    pub interlaced: bool,
    /// Emit SPS/PPS once as a sequence header instead of in-band.
    pub global_header: bool,
    pub aud: bool,
    pub bluray_compat: bool,
    pub weighted_pred: bool,
    /// On an I-picture hint: `true` forces IDR, `false` forces intra.
    pub forced_idr: Option<bool>,
    pub a53_cc: bool,
    pub s12m_tc: bool,
    /// Surface count; 0 picks the minimum for the GOP structure.
    pub surfaces: u32,
    /// Frames kept in flight before output; clamped below the surface count.
    pub async_depth: u32,
    pub color: ColorDescription,
    pub rate_control: RateControlOptions,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            width: 1280,
            height: 720,
            sar_num: 0,
            sar_den: 0,
            frame_rate_num: 30,
            frame_rate_den: 1,
            ticks_per_frame: 1,
            pixel_format: PixelFormat::default(),
            input: InputMode::default(),
            external_resource: None,
            device: DeviceSelection::default(),
            preset: Preset::default(),
            tuning: Tuning::default(),
            profile: None,
            level: 0,
            tier: Tier::default(),
            gop_size: None,
            max_b_frames: 0,
            refs: 0,
            dpb_size: None,
            coder: EntropyCoder::default(),
            b_ref_mode: BFrameRefMode::default(),
            interlaced: false,
            global_header: false,
            aud: false,
            bluray_compat: false,
            weighted_pred: false,
            forced_idr: None,
            a53_cc: true,
            s12m_tc: true,
            surfaces: 0,
            async_depth: u32::MAX,
            color: ColorDescription::default(),
            rate_control: RateControlOptions::default(),
        }
    }
}

impl EncoderConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_gop_size(mut self, gop_size: u32) -> Self {
        self.gop_size = Some(gop_size);
        self
    }

    pub fn with_b_frames(mut self, max_b_frames: u32) -> Self {
        self.max_b_frames = max_b_frames;
        self
    }

    pub fn with_frame_rate(mut self, num: u32, den: u32) -> Self {
        self.frame_rate_num = num;
        self.frame_rate_den = den;
        self
    }

    pub fn with_sample_aspect_ratio(mut self, num: u32, den: u32) -> Self {
        self.sar_num = num;
        self.sar_den = den;
        self
    }

    /// Set the average bitrate in bits per second.
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.rate_control.bitrate = bitrate;
        self
    }

    pub fn with_rate_control(mut self, rate_control: RateControlOptions) -> Self {
        self.rate_control = rate_control;
        self
    }

    pub fn with_surfaces(mut self, surfaces: u32) -> Self {
        self.surfaces = surfaces;
        self
    }

    pub fn with_async_depth(mut self, depth: u32) -> Self {
        self.async_depth = depth;
        self
    }

    pub fn with_external_input(mut self, resource: ResourceType) -> Self {
        self.input = InputMode::External;
        self.external_resource = Some(resource);
        self
    }

    pub fn with_device(mut self, device: DeviceSelection) -> Self {
        self.device = device;
        self
    }

    pub fn with_global_header(mut self, enabled: bool) -> Self {
        self.global_header = enabled;
        self
    }

    pub fn with_forced_idr(mut self, forced_idr: Option<bool>) -> Self {
        self.forced_idr = forced_idr;
        self
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EncodeError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            EncodeError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;

        tracing::info!("Loaded encoder config from {}", path.display());
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self)
            .map_err(|e| EncodeError::Configuration(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(EncodeError::Configuration(msg));

        if self.width == 0 || self.height == 0 {
            return invalid(format!("invalid geometry {}x{}", self.width, self.height));
        }
        if self.frame_rate_num == 0 || self.frame_rate_den == 0 {
            return invalid(format!(
                "invalid frame rate {}/{}",
                self.frame_rate_num, self.frame_rate_den
            ));
        }
        if self.max_b_frames > MAX_B_FRAMES {
            return invalid(format!(
                "max_b_frames {} exceeds {}",
                self.max_b_frames, MAX_B_FRAMES
            ));
        }
        if self.async_depth == 0 {
            return invalid("async_depth must be at least 1".into());
        }
        if let Some(profile) = self.profile {
            if !profile.is_valid_for(self.codec) {
                return invalid(format!(
                    "profile {:?} is not valid for {:?}",
                    profile, self.codec
                ));
            }
        }
        if self.input == InputMode::External && self.external_resource.is_none() {
            return invalid("external input requires external_resource".into());
        }

        let rc = &self.rate_control;
        let qps = [
            ("qp", rc.qp),
            ("init_qp_p", rc.init_qp_p),
            ("init_qp_b", rc.init_qp_b),
            ("init_qp_i", rc.init_qp_i),
            ("qmin", rc.qmin),
            ("qmax", rc.qmax),
        ];
        for (name, qp) in qps {
            if let Some(qp) = qp {
                if qp > QP_MAX {
                    return invalid(format!("{} {} exceeds {}", name, qp, QP_MAX));
                }
            }
        }
        if let (Some(qmin), Some(qmax)) = (rc.qmin, rc.qmax) {
            if qmin > qmax {
                return invalid(format!("qmin {} is greater than qmax {}", qmin, qmax));
            }
        }
        let factors = [
            rc.i_quant_factor,
            rc.i_quant_offset,
            rc.b_quant_factor,
            rc.b_quant_offset,
            rc.quality,
        ];
        if factors.iter().any(|f| !f.is_finite()) {
            return invalid("quantizer factors and quality must be finite".into());
        }
        if rc.quality < 0.0 {
            return invalid(format!("quality {} is negative", rc.quality));
        }

        Ok(())
    }

    /// Applies Blu-ray compatibility limits when enabled.
    pub fn bluray_adjusted(&self) -> Self {
        let mut config = self.clone();
        if !config.bluray_compat {
            return config;
        }

        config.aud = true;
        config.dpb_size = Some(config.refs.min(6));
        config.max_b_frames = config.max_b_frames.min(3);
        if config.codec == Codec::Hevc {
            config.level = HEVC_LEVEL_5_1;
            config.tier = Tier::High;
        }
        config
    }

    pub fn is_external_input(&self) -> bool {
        self.input == InputMode::External
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_control::RateControlMode;

    #[test]
    fn test_default_validates() {
        assert!(EncoderConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        assert!(EncoderConfig::new(0, 720).validate().is_err());
        assert!(EncoderConfig::new(640, 480).with_b_frames(8).validate().is_err());
        assert!(EncoderConfig::new(640, 480).with_async_depth(0).validate().is_err());

        let mut config = EncoderConfig::new(640, 480);
        config.rate_control.qmin = Some(30);
        config.rate_control.qmax = Some(20);
        assert!(config.validate().is_err());

        let mut config = EncoderConfig::new(640, 480);
        config.rate_control.qp = Some(52);
        assert!(config.validate().is_err());

        let mut config = EncoderConfig::new(640, 480);
        config.rate_control.b_quant_factor = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = EncoderConfig::new(640, 480);
        config.input = InputMode::External;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = EncoderConfig::from_toml_str(
            r#"
            codec = "hevc"
            width = 1920
            height = 1080
            pixel_format = "p010"
            preset = "p5"
            gop_size = 120
            max_b_frames = 2

            [rate_control]
            mode = "cbr"
            bitrate = 6000000
            "#,
        )
        .unwrap();

        assert_eq!(config.codec, Codec::Hevc);
        assert_eq!(config.pixel_format, PixelFormat::P010);
        assert_eq!(config.gop_size, Some(120));
        assert_eq!(config.rate_control.mode, Some(RateControlMode::Cbr));
        assert_eq!(config.rate_control.bitrate, 6_000_000);
        // untouched fields keep their defaults
        assert_eq!(config.frame_rate_num, 30);
        assert!(config.rate_control.b_adapt);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let err = EncoderConfig::from_toml_str("width = 0").unwrap_err();
        assert!(matches!(err, EncodeError::Configuration(_)));

        let err = EncoderConfig::from_toml_str("width = \"wide\"").unwrap_err();
        assert!(matches!(err, EncodeError::ConfigParse(_)));
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let config = EncoderConfig::new(800, 600).with_bitrate(1_000_000);
        let text = config.to_toml_string().unwrap();
        assert_eq!(EncoderConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_bluray_adjustments() {
        let mut config = EncoderConfig::new(1920, 1080)
            .with_codec(Codec::Hevc)
            .with_b_frames(5);
        config.refs = 9;
        config.bluray_compat = true;

        let adjusted = config.bluray_adjusted();
        assert!(adjusted.aud);
        assert_eq!(adjusted.dpb_size, Some(6));
        assert_eq!(adjusted.max_b_frames, 3);
        assert_eq!(adjusted.level, HEVC_LEVEL_5_1);
        assert_eq!(adjusted.tier, Tier::High);
    }
}
