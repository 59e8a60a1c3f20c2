// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Device capability probe.

use crate::codec::{BFrameRefMode, Codec, EntropyCoder};
use crate::config::EncoderConfig;
use crate::driver::{Cap, EncoderDriver, EncoderHandle};
use crate::error::{EncodeError, Result};

/// Snapshot of the limits the device reports for one codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet {
    pub max_width: u32,
    pub max_height: u32,
    pub max_b_frames: u32,
    pub yuv444: bool,
    pub ten_bit: bool,
    pub lossless: bool,
    pub lookahead: bool,
    pub temporal_aq: bool,
    pub weighted_prediction: bool,
    pub cabac: bool,
    /// Raw field-encoding support level; 0 means unsupported.
    pub field_encoding: i32,
    /// Raw B-frame reference mode bitmask.
    pub b_ref_mode: i32,
    pub multiple_ref_frames: bool,
    pub dynamic_bitrate: bool,
}

fn unsupported(reason: String) -> EncodeError {
    tracing::warn!("{}", reason);
    EncodeError::Unsupported(reason)
}

/// Queries every capability of `codec` on an open encoder.
///
/// Fails with [`EncodeError::Unsupported`] when the codec is not in the
/// driver's codec list. Individual failed queries read as 0.
pub fn probe(
    driver: &dyn EncoderDriver,
    encoder: EncoderHandle,
    codec: Codec,
) -> Result<CapabilitySet> {
    let codecs = driver
        .supported_codecs(encoder)
        .map_err(|status| unsupported(format!("codec list unavailable: {}", status)))?;
    if !codecs.contains(&codec) {
        return Err(unsupported(format!("codec {:?} not supported", codec)));
    }

    let query = |cap: Cap| driver.query_cap(encoder, codec, cap).unwrap_or(0);
    let positive = |cap: Cap| query(cap) > 0;

    let caps = CapabilitySet {
        max_width: query(Cap::WidthMax).max(0) as u32,
        max_height: query(Cap::HeightMax).max(0) as u32,
        max_b_frames: query(Cap::NumMaxBFrames).max(0) as u32,
        yuv444: positive(Cap::Yuv444Encode),
        ten_bit: positive(Cap::TenBitEncode),
        lossless: positive(Cap::LosslessEncode),
        lookahead: positive(Cap::Lookahead),
        temporal_aq: positive(Cap::TemporalAq),
        weighted_prediction: positive(Cap::WeightedPrediction),
        cabac: positive(Cap::Cabac),
        field_encoding: query(Cap::FieldEncoding),
        b_ref_mode: query(Cap::BFrameRefMode),
        multiple_ref_frames: positive(Cap::MultipleRefFrames),
        dynamic_bitrate: positive(Cap::DynamicBitrateChange),
    };

    tracing::debug!(?caps, "Probed {:?} capabilities", codec);
    Ok(caps)
}

impl CapabilitySet {
    /// Fails fast on the first requested feature the device lacks.
    pub fn check(&self, config: &EncoderConfig, lossless: bool) -> Result<()> {
        let pix = config.pixel_format;

        if pix.is_yuv444() && !self.yuv444 {
            return Err(unsupported("YUV444 input not supported".into()));
        }
        if lossless && !self.lossless {
            return Err(unsupported("lossless encoding not supported".into()));
        }
        if config.width > self.max_width {
            return Err(unsupported(format!(
                "width {} exceeds {}",
                config.width, self.max_width
            )));
        }
        if config.height > self.max_height {
            return Err(unsupported(format!(
                "height {} exceeds {}",
                config.height, self.max_height
            )));
        }
        if config.max_b_frames > self.max_b_frames {
            return Err(unsupported(format!(
                "max B-frames {} exceed {}",
                config.max_b_frames, self.max_b_frames
            )));
        }
        if config.interlaced && self.field_encoding < 1 {
            return Err(unsupported(format!(
                "interlaced encoding not supported, supported level {}",
                self.field_encoding
            )));
        }
        if pix.is_10bit() && !self.ten_bit {
            return Err(unsupported("10-bit encode not supported".into()));
        }
        if config.rate_control.lookahead > 0 && !self.lookahead {
            return Err(unsupported("RC lookahead not supported".into()));
        }
        if config.rate_control.temporal_aq && !self.temporal_aq {
            return Err(unsupported("temporal AQ not supported".into()));
        }
        if config.weighted_pred && !self.weighted_prediction {
            return Err(unsupported("weighted prediction not supported".into()));
        }
        if config.coder == EntropyCoder::Cabac && !self.cabac {
            return Err(unsupported("CABAC entropy coding not supported".into()));
        }
        match config.b_ref_mode {
            BFrameRefMode::Each if self.b_ref_mode != 1 && self.b_ref_mode != 3 => {
                return Err(unsupported(
                    "each B-frame as reference is not supported".into(),
                ));
            }
            BFrameRefMode::Each | BFrameRefMode::Middle if self.b_ref_mode == 0 => {
                return Err(unsupported("B-frames as references are not supported".into()));
            }
            _ => {}
        }
        if config.refs != 0 && !self.multiple_ref_frames {
            return Err(unsupported(
                "multiple reference frames are not supported".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    fn full_caps() -> CapabilitySet {
        CapabilitySet {
            max_width: 4096,
            max_height: 4096,
            max_b_frames: 4,
            yuv444: true,
            ten_bit: true,
            lossless: true,
            lookahead: true,
            temporal_aq: true,
            weighted_prediction: true,
            cabac: true,
            field_encoding: 1,
            b_ref_mode: 3,
            multiple_ref_frames: true,
            dynamic_bitrate: true,
        }
    }

    #[test]
    fn test_full_caps_accept_everything() {
        let mut config = EncoderConfig::new(1920, 1080)
            .with_pixel_format(PixelFormat::Yuv444p16)
            .with_b_frames(4);
        config.interlaced = true;
        config.refs = 2;
        config.b_ref_mode = BFrameRefMode::Each;
        assert!(full_caps().check(&config, true).is_ok());
    }

    #[test]
    fn test_dimension_limits() {
        let caps = full_caps();
        let wide = EncoderConfig::new(8192, 1080);
        assert!(matches!(
            caps.check(&wide, false),
            Err(EncodeError::Unsupported(_))
        ));
        let tall = EncoderConfig::new(1920, 8192);
        assert!(caps.check(&tall, false).is_err());
    }

    #[test]
    fn test_b_ref_mode_rules() {
        let mut caps = full_caps();
        let mut config = EncoderConfig::new(640, 480);
        config.b_ref_mode = BFrameRefMode::Each;

        // middle-only support rejects "each"
        caps.b_ref_mode = 2;
        assert!(caps.check(&config, false).is_err());

        config.b_ref_mode = BFrameRefMode::Middle;
        assert!(caps.check(&config, false).is_ok());

        caps.b_ref_mode = 0;
        assert!(caps.check(&config, false).is_err());
    }

    #[test]
    fn test_missing_features() {
        let caps = CapabilitySet {
            max_width: 4096,
            max_height: 4096,
            ..Default::default()
        };
        let yuv444 = EncoderConfig::new(640, 480).with_pixel_format(PixelFormat::Yuv444p);
        assert!(caps.check(&yuv444, false).is_err());

        let ten_bit = EncoderConfig::new(640, 480).with_pixel_format(PixelFormat::P010);
        assert!(caps.check(&ten_bit, false).is_err());

        let plain = EncoderConfig::new(640, 480);
        assert!(caps.check(&plain, false).is_ok());
        assert!(caps.check(&plain, true).is_err());

        let b_frames = EncoderConfig::new(640, 480).with_b_frames(1);
        assert!(caps.check(&b_frames, false).is_err());
    }
}
