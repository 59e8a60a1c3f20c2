// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Encode session facade.

use std::sync::Arc;

use bytes::Bytes;

use crate::caps::CapabilitySet;
use crate::codec::{BFrameRefMode, CodecConfig, GopStructure, Profile};
use crate::config::EncoderConfig;
use crate::context::ContextGuard;
use crate::device::{self, OpenedDevice};
use crate::driver::{DeviceContext, EncoderDriver, EncoderHandle, InitializeParams};
use crate::error::{EncodeError, Result};
use crate::frame::{EncodedPacket, Frame};
use crate::pipeline::{DrainOutcome, Pipeline, PipelineSettings, SubmitOutcome};
use crate::pool::{SurfaceBudget, SurfaceLayout, SurfacePool};
use crate::preset::ResolvedPreset;
use crate::ratio;
use crate::rate_control::{self, PolicyContext};
use crate::reconfig::StreamHints;

/// Stream level facts a muxer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProperties {
    pub average_bitrate: u32,
    pub max_bitrate: u32,
    pub buffer_size: u32,
    /// Reorder depth: 0 without B-frames, 2 when B-frames are references.
    pub has_b_frames: u32,
    pub profile: Option<Profile>,
}

/// One open encoder on one device.
///
/// Frames go in through [`submit_frame`](Self::submit_frame) and packets
/// come out of [`receive_packet`](Self::receive_packet); both return a
/// would-block outcome instead of waiting. Dropping the session closes it.
pub struct EncodeSession {
    driver: Arc<dyn EncoderDriver>,
    context: DeviceContext,
    owns_context: bool,
    encoder: EncoderHandle,
    device_index: Option<usize>,
    caps: CapabilitySet,
    budget: SurfaceBudget,
    pipeline: Pipeline,
    sequence_header: Option<Bytes>,
    properties: StreamProperties,
    config: EncoderConfig,
    closed: bool,
}

/// Everything built under the context guard during open.
struct Prepared {
    budget: SurfaceBudget,
    params: InitializeParams,
    pool: SurfacePool,
    sequence_header: Option<Bytes>,
}

fn destroy_encoder(driver: &dyn EncoderDriver, context: DeviceContext, encoder: EncoderHandle) -> Result<()> {
    let guard = ContextGuard::enter(driver, context)?;
    let destroyed = driver
        .destroy_encoder(encoder)
        .map_err(|status| EncodeError::device("DestroyEncoder", status));
    let exited = guard.exit();
    destroyed.and(exited)
}

fn destroy_context(driver: &dyn EncoderDriver, context: DeviceContext) -> Result<()> {
    driver
        .destroy_context(context)
        .map_err(|status| EncodeError::device("CtxDestroy", status))
}

fn prepare(
    driver: &dyn EncoderDriver,
    config: &EncoderConfig,
    resolved: &ResolvedPreset,
    opened: &OpenedDevice,
) -> Result<Prepared> {
    let encoder = opened.encoder;
    let guard = ContextGuard::enter(driver, opened.context)?;

    let preset = driver
        .preset_config(encoder, config.codec, resolved.preset, resolved.tuning)
        .map_err(|status| {
            EncodeError::from_driver(driver, encoder, "GetEncodePresetConfig", status)
        })?;

    let gop = GopStructure::derive(config, &preset);
    let lookahead = rate_control::effective_lookahead(&config.rate_control, &preset);
    let budget = SurfaceBudget::compute(
        config.surfaces,
        config.async_depth,
        gop.frame_interval_p,
        lookahead,
    );

    let rc = rate_control::derive(
        &config.rate_control,
        &PolicyContext {
            preset: &preset,
            flags: resolved.flags,
            frame_interval_p: gop.frame_interval_p,
            nb_surfaces: budget.nb_surfaces,
            async_depth: budget.async_depth,
            caps: Some(&opened.caps),
        },
    )?;
    let codec_config = CodecConfig::derive(config, rc.mode, gop, resolved.is_lossless())?;

    let dar = ratio::display_aspect(config.width, config.height, config.sar_num, config.sar_den);
    let params = InitializeParams {
        codec: config.codec,
        preset: resolved.preset,
        tuning: resolved.tuning,
        width: config.width,
        height: config.height,
        max_width: config.width,
        max_height: config.height,
        dar_width: dar.num as u32,
        dar_height: dar.den as u32,
        frame_rate_num: config.frame_rate_num,
        frame_rate_den: config.frame_rate_den,
        enable_picture_type_decision: true,
        gop_length: gop.gop_length,
        frame_interval_p: gop.frame_interval_p,
        rate_control: rc,
        codec_config,
    };

    driver
        .initialize(encoder, &params)
        .map_err(|status| EncodeError::from_driver(driver, encoder, "InitializeEncoder", status))?;

    let layout = SurfaceLayout {
        width: config.width,
        height: config.height,
        format: config.pixel_format.buffer_format(),
        external: config.is_external_input(),
    };
    let mut pool = SurfacePool::allocate(driver, encoder, budget.nb_surfaces, layout)?;

    let sequence_header = if config.global_header {
        match driver.sequence_params(encoder) {
            Ok(header) => Some(Bytes::from(header)),
            Err(status) => {
                let err = EncodeError::from_driver(driver, encoder, "GetSequenceParams", status);
                if let Err(e) = pool.release(driver, encoder) {
                    tracing::warn!("{}", e);
                }
                return Err(err);
            }
        }
    } else {
        None
    };

    guard.exit()?;

    Ok(Prepared {
        budget,
        params,
        pool,
        sequence_header,
    })
}

impl EncodeSession {
    /// Selects a device, configures the encoder and allocates surfaces.
    /// Anything created before a failure is torn down again.
    pub fn open(driver: Arc<dyn EncoderDriver>, config: EncoderConfig) -> Result<Self> {
        config.validate()?;
        let config = config.bluray_adjusted();

        let version = device::check_api_version(driver.as_ref())?;
        let resolved = config.preset.resolve(config.tuning);
        let opened = device::select_device(driver.as_ref(), &config, resolved.is_lossless())?;

        let prepared = match prepare(driver.as_ref(), &config, &resolved, &opened) {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(err) = destroy_encoder(driver.as_ref(), opened.context, opened.encoder) {
                    tracing::warn!("{}", err);
                }
                if opened.owns_context {
                    if let Err(err) = destroy_context(driver.as_ref(), opened.context) {
                        tracing::warn!("{}", err);
                    }
                }
                return Err(e);
            }
        };

        let params = prepared.params;
        let rc = &params.rate_control;
        let has_b_frames = if params.frame_interval_p > 1 {
            if params.codec_config.b_ref_mode == BFrameRefMode::Disabled {
                1
            } else {
                2
            }
        } else {
            0
        };
        let properties = StreamProperties {
            average_bitrate: rc.average_bitrate,
            max_bitrate: rc.max_bitrate,
            buffer_size: rc.vbv_buffer_size,
            has_b_frames,
            profile: params.codec_config.profile,
        };

        let settings = PipelineSettings {
            pixel_format: config.pixel_format,
            frame_interval_p: params.frame_interval_p,
            ticks_per_frame: config.ticks_per_frame,
            async_depth: prepared.budget.async_depth,
            interlaced: config.interlaced,
            forced_idr: config.forced_idr,
            a53_cc: config.a53_cc,
            s12m_tc: config.s12m_tc,
            dynamic_bitrate: opened.caps.dynamic_bitrate,
        };
        let hints = StreamHints {
            sar_num: config.sar_num,
            sar_den: config.sar_den,
            bitrate: rc.average_bitrate,
            max_bitrate: rc.max_bitrate,
            buffer_size: rc.vbv_buffer_size,
        };

        tracing::info!(
            codec = ?config.codec,
            preset = ?resolved.preset,
            tuning = ?resolved.tuning,
            rc = ?params.rate_control.mode,
            surfaces = prepared.budget.nb_surfaces,
            async_depth = prepared.budget.async_depth,
            "Opened {}x{} encode session (driver API {}.{})",
            config.width,
            config.height,
            version >> 4,
            version & 0xf
        );

        Ok(Self {
            pipeline: Pipeline::new(
                opened.context,
                opened.encoder,
                prepared.pool,
                settings,
                params,
                hints,
            ),
            driver,
            context: opened.context,
            owns_context: opened.owns_context,
            encoder: opened.encoder,
            device_index: opened.index,
            caps: opened.caps,
            budget: prepared.budget,
            sequence_header: prepared.sequence_header,
            properties,
            config,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(EncodeError::InvalidState("session is closed".into()));
        }
        Ok(())
    }

    /// Queues a frame, or signals end of stream with `None`.
    pub fn submit_frame(&mut self, frame: Option<&Frame>) -> Result<SubmitOutcome> {
        self.ensure_open()?;
        self.pipeline.submit(self.driver.as_ref(), frame)
    }

    pub fn receive_packet(&mut self) -> Result<DrainOutcome> {
        self.ensure_open()?;
        self.pipeline.drain(self.driver.as_ref())
    }

    /// Ends the stream, returns every outstanding packet and readies the
    /// session for new frames.
    pub fn flush(&mut self) -> Result<Vec<EncodedPacket>> {
        self.ensure_open()?;
        self.pipeline.flush(self.driver.as_ref())
    }

    /// Flushes and releases every device resource.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let driver = self.driver.as_ref();
        let mut first_error = None;

        match self.pipeline.flush(driver) {
            Ok(packets) if !packets.is_empty() => {
                tracing::debug!("Discarded {} packets at close", packets.len());
            }
            Ok(_) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.pipeline.release(driver) {
            first_error.get_or_insert(e);
        }
        if let Err(e) = destroy_encoder(driver, self.context, self.encoder) {
            first_error.get_or_insert(e);
        }
        if self.owns_context {
            if let Err(e) = destroy_context(driver, self.context) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(err) => {
                tracing::error!("Encode session closed with error: {}", err);
                Err(err)
            }
            None => {
                tracing::info!("Encode session closed");
                Ok(())
            }
        }
    }

    /// Parameter sets, when `global_header` is enabled.
    pub fn sequence_header(&self) -> Option<&Bytes> {
        self.sequence_header.as_ref()
    }

    pub fn properties(&self) -> &StreamProperties {
        &self.properties
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    pub fn budget(&self) -> SurfaceBudget {
        self.budget
    }

    pub fn device_index(&self) -> Option<usize> {
        self.device_index
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Parameters the encoder currently runs with.
    pub fn encoder_params(&self) -> &InitializeParams {
        self.pipeline.params()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Target bitrate for following frames; applied when the device can
    /// change it without reopening.
    pub fn set_bitrate(&mut self, bitrate: u32) {
        self.pipeline.hints_mut().bitrate = bitrate;
    }

    pub fn set_max_bitrate(&mut self, max_bitrate: u32) {
        self.pipeline.hints_mut().max_bitrate = max_bitrate;
    }

    pub fn set_buffer_size(&mut self, buffer_size: u32) {
        self.pipeline.hints_mut().buffer_size = buffer_size;
    }

    pub fn set_sample_aspect_ratio(&mut self, num: u32, den: u32) {
        let hints = self.pipeline.hints_mut();
        hints.sar_num = num;
        hints.sar_den = den;
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Error while dropping encode session: {}", e);
        }
    }
}
