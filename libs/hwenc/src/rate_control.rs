// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Rate-control policy.
//!
//! [`derive`] turns sparse user intent ([`RateControlOptions`]) plus the
//! preset defaults into a fully specified [`RateControlConfig`]. It performs
//! no device calls and is deterministic, so the same inputs always produce
//! the same configuration.

use serde::{Deserialize, Serialize};

use crate::caps::CapabilitySet;
use crate::driver::PresetConfig;
use crate::error::{EncodeError, Result};
use crate::preset::{Multipass, PresetFlags};

pub const QP_MAX: u32 = 51;

const DEFAULT_INITIAL_QP: i32 = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControlMode {
    ConstQp,
    Vbr,
    VbrHq,
    VbrMinQp,
    Cbr,
    CbrHq,
    CbrLowDelayHq,
}

impl RateControlMode {
    pub fn is_cbr(self) -> bool {
        matches!(
            self,
            RateControlMode::Cbr | RateControlMode::CbrHq | RateControlMode::CbrLowDelayHq
        )
    }

    pub fn is_vbr(self) -> bool {
        matches!(
            self,
            RateControlMode::Vbr | RateControlMode::VbrHq | RateControlMode::VbrMinQp
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpTriple {
    pub intra: u32,
    pub inter_p: u32,
    pub inter_b: u32,
}

impl QpTriple {
    pub fn uniform(qp: u32) -> Self {
        Self {
            intra: qp,
            inter_p: qp,
            inter_b: qp,
        }
    }
}

/// User-facing rate-control intent. Unset values leave the decision to the
/// policy and the preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateControlOptions {
    pub mode: Option<RateControlMode>,
    pub cbr: bool,
    pub two_pass: Option<bool>,
    pub multipass: Multipass,
    /// Average bitrate in bits per second; 0 keeps the preset's.
    pub bitrate: u32,
    pub max_bitrate: u32,
    pub buffer_size: u32,
    /// Global constant QP.
    pub qp: Option<u32>,
    pub init_qp_p: Option<u32>,
    pub init_qp_b: Option<u32>,
    pub init_qp_i: Option<u32>,
    pub qmin: Option<u32>,
    pub qmax: Option<u32>,
    pub i_quant_factor: f32,
    pub i_quant_offset: f32,
    pub b_quant_factor: f32,
    pub b_quant_offset: f32,
    /// Target quality for constant-quality VBR; 0 disables.
    pub quality: f32,
    pub aq: bool,
    pub aq_strength: u32,
    pub temporal_aq: bool,
    pub lookahead: u32,
    pub no_scenecut: bool,
    pub b_adapt: bool,
    pub strict_gop: bool,
    pub nonref_p: bool,
    pub zero_latency: bool,
    pub low_delay_key_frame_scale: u32,
}

impl Default for RateControlOptions {
    fn default() -> Self {
        Self {
            mode: None,
            cbr: false,
            two_pass: None,
            multipass: Multipass::Disabled,
            bitrate: 0,
            max_bitrate: 0,
            buffer_size: 0,
            qp: None,
            init_qp_p: None,
            init_qp_b: None,
            init_qp_i: None,
            qmin: None,
            qmax: None,
            i_quant_factor: -0.8,
            i_quant_offset: 0.0,
            b_quant_factor: 1.25,
            b_quant_offset: 1.25,
            quality: 0.0,
            aq: false,
            aq_strength: 8,
            temporal_aq: false,
            lookahead: 0,
            no_scenecut: false,
            b_adapt: true,
            strict_gop: false,
            nonref_p: false,
            zero_latency: false,
            low_delay_key_frame_scale: 0,
        }
    }
}

/// Device rate-control parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RateControlConfig {
    pub mode: RateControlMode,
    pub average_bitrate: u32,
    pub max_bitrate: u32,
    pub vbv_buffer_size: u32,
    pub const_qp: QpTriple,
    pub enable_initial_qp: bool,
    pub initial_qp: QpTriple,
    pub enable_min_qp: bool,
    pub min_qp: QpTriple,
    pub enable_max_qp: bool,
    pub max_qp: QpTriple,
    pub enable_aq: bool,
    pub aq_strength: u32,
    pub enable_temporal_aq: bool,
    pub enable_lookahead: bool,
    pub lookahead_depth: u32,
    pub disable_scenecut: bool,
    pub disable_badapt: bool,
    pub strict_gop_target: bool,
    pub enable_nonref_p: bool,
    pub zero_reorder_delay: bool,
    pub multipass: Multipass,
    pub low_delay_key_frame_scale: u32,
    pub target_quality: u8,
    pub target_quality_lsb: u8,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self::from_preset(&PresetConfig::default())
    }
}

impl RateControlConfig {
    /// Starting point taken from the preset defaults.
    pub fn from_preset(preset: &PresetConfig) -> Self {
        Self {
            mode: preset.rc_mode,
            average_bitrate: preset.average_bitrate,
            max_bitrate: preset.max_bitrate,
            vbv_buffer_size: preset.vbv_buffer_size,
            const_qp: preset.const_qp,
            enable_initial_qp: false,
            initial_qp: QpTriple::default(),
            enable_min_qp: false,
            min_qp: QpTriple::default(),
            enable_max_qp: false,
            max_qp: QpTriple::default(),
            enable_aq: false,
            aq_strength: 0,
            enable_temporal_aq: false,
            enable_lookahead: false,
            lookahead_depth: 0,
            disable_scenecut: false,
            disable_badapt: false,
            strict_gop_target: false,
            enable_nonref_p: false,
            zero_reorder_delay: false,
            multipass: preset.multipass,
            low_delay_key_frame_scale: 0,
            target_quality: 0,
            target_quality_lsb: 0,
        }
    }
}

/// Session facts the policy depends on.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub preset: &'a PresetConfig,
    pub flags: PresetFlags,
    pub frame_interval_p: i32,
    pub nb_surfaces: u32,
    /// Already clamped below `nb_surfaces`.
    pub async_depth: u32,
    pub caps: Option<&'a CapabilitySet>,
}

/// Requested lookahead depth, falling back to the preset's when the request
/// is 0 and the preset enables lookahead.
pub fn effective_lookahead(options: &RateControlOptions, preset: &PresetConfig) -> u32 {
    if options.lookahead == 0 && preset.lookahead_enabled {
        preset.lookahead_depth
    } else {
        options.lookahead
    }
}

fn clip_qp(qp: i64) -> u32 {
    qp.clamp(0, QP_MAX as i64) as u32
}

/// `clip(qp * |factor| + offset + 0.5, 0, 51)`, truncating toward zero.
fn quant_curve(qp: u32, factor: f32, offset: f32) -> u32 {
    let scaled = qp as f64 * (factor as f64).abs() + offset as f64 + 0.5;
    clip_qp(scaled as i64)
}

fn opt_qp(qp: Option<u32>) -> Option<u32> {
    qp.map(|q| q.min(QP_MAX))
}

/// Two-pass intent after applying preset flags.
fn two_pass_requested(options: &RateControlOptions, flags: PresetFlags) -> bool {
    if flags.contains(PresetFlags::ONE_PASS) {
        false
    } else if flags.contains(PresetFlags::TWO_PASSES) {
        true
    } else {
        options
            .two_pass
            .unwrap_or(flags.contains(PresetFlags::LOW_LATENCY))
    }
}

fn infer_mode(options: &RateControlOptions, two_pass: bool) -> Option<RateControlMode> {
    if options.cbr {
        Some(if two_pass {
            RateControlMode::CbrLowDelayHq
        } else {
            RateControlMode::Cbr
        })
    } else if options.qp.is_some() {
        Some(RateControlMode::ConstQp)
    } else if two_pass {
        Some(RateControlMode::VbrHq)
    } else if options.qmin.is_some() && options.qmax.is_some() {
        Some(RateControlMode::VbrMinQp)
    } else {
        None
    }
}

fn set_lossless(rc: &mut RateControlConfig) {
    rc.mode = RateControlMode::ConstQp;
    rc.const_qp = QpTriple::uniform(0);
    rc.enable_min_qp = false;
    rc.enable_max_qp = false;
}

fn set_const_qp(rc: &mut RateControlConfig, o: &RateControlOptions) {
    rc.mode = RateControlMode::ConstQp;

    if let Some(p) = opt_qp(o.init_qp_p) {
        rc.const_qp.inter_p = p;
        match (opt_qp(o.init_qp_i), opt_qp(o.init_qp_b)) {
            (Some(i), Some(b)) => {
                rc.const_qp.intra = i;
                rc.const_qp.inter_b = b;
            }
            _ if o.i_quant_factor != 0.0 && o.b_quant_factor != 0.0 => {
                rc.const_qp.intra = quant_curve(p, o.i_quant_factor, o.i_quant_offset);
                rc.const_qp.inter_b = quant_curve(p, o.b_quant_factor, o.b_quant_offset);
            }
            _ => {
                rc.const_qp.intra = p;
                rc.const_qp.inter_b = p;
            }
        }
    } else if let Some(qp) = opt_qp(o.qp) {
        rc.const_qp = QpTriple::uniform(qp);
        if o.b_quant_factor != 0.0 {
            rc.const_qp.inter_b = quant_curve(qp, o.b_quant_factor, o.b_quant_offset);
        }
        if o.i_quant_factor != 0.0 {
            rc.const_qp.intra = quant_curve(qp, o.i_quant_factor, o.i_quant_offset);
        }
    }

    rc.enable_min_qp = false;
    rc.enable_max_qp = false;
}

fn set_vbr(rc: &mut RateControlConfig, o: &RateControlOptions) {
    let qmin = opt_qp(o.qmin);
    let qmax = opt_qp(o.qmax);

    let qp_inter_p = match (qmin, qmax) {
        (Some(min), Some(max)) => {
            rc.enable_min_qp = true;
            rc.enable_max_qp = true;
            rc.min_qp = QpTriple::uniform(min);
            rc.max_qp = QpTriple::uniform(max);
            // biased towards qmin
            ((max + 3 * min) / 4) as i32
        }
        (Some(min), None) => {
            rc.enable_min_qp = true;
            rc.min_qp = QpTriple::uniform(min);
            min as i32
        }
        _ => DEFAULT_INITIAL_QP,
    };

    rc.enable_initial_qp = true;
    let p = opt_qp(o.init_qp_p).unwrap_or(clip_qp(qp_inter_p as i64));
    let curve = o.i_quant_factor != 0.0 && o.b_quant_factor != 0.0;

    rc.initial_qp.inter_p = p;
    rc.initial_qp.intra = match opt_qp(o.init_qp_i) {
        Some(i) => i,
        None if curve => quant_curve(p, o.i_quant_factor, o.i_quant_offset),
        None => p,
    };
    rc.initial_qp.inter_b = match opt_qp(o.init_qp_b) {
        Some(b) => b,
        None if curve => quant_curve(p, o.b_quant_factor, o.b_quant_offset),
        None => p,
    };
}

fn apply_mode(rc: &mut RateControlConfig, mode: RateControlMode, o: &RateControlOptions) {
    match mode {
        RateControlMode::ConstQp => {
            set_const_qp(rc, o);
            return;
        }
        RateControlMode::VbrMinQp if o.qmin.is_none() => {
            tracing::warn!("The variable bitrate min-QP rate control requires qmin, using VBR");
            rc.mode = RateControlMode::Vbr;
            set_vbr(rc, o);
            return;
        }
        RateControlMode::Vbr | RateControlMode::VbrHq | RateControlMode::VbrMinQp => {
            set_vbr(rc, o);
        }
        RateControlMode::Cbr | RateControlMode::CbrHq | RateControlMode::CbrLowDelayHq => {}
    }
    rc.mode = mode;
}

fn check_caps(
    options: &RateControlOptions,
    lossless: bool,
    lookahead: u32,
    caps: &CapabilitySet,
) -> Result<()> {
    if lossless && !caps.lossless {
        return Err(EncodeError::Unsupported(
            "lossless encoding not supported".into(),
        ));
    }
    if lookahead > 0 && !caps.lookahead {
        return Err(EncodeError::Unsupported("RC lookahead not supported".into()));
    }
    if options.temporal_aq && !caps.temporal_aq {
        return Err(EncodeError::Unsupported("temporal AQ not supported".into()));
    }
    Ok(())
}

/// Derives the device rate-control configuration.
pub fn derive(options: &RateControlOptions, ctx: &PolicyContext<'_>) -> Result<RateControlConfig> {
    let lossless = ctx.flags.contains(PresetFlags::LOSSLESS);
    let lookahead = effective_lookahead(options, ctx.preset);

    if let Some(caps) = ctx.caps {
        check_caps(options, lossless, lookahead, caps)?;
    }

    let mut rc = RateControlConfig::from_preset(ctx.preset);

    if options.bitrate > 0 {
        rc.average_bitrate = options.bitrate;
    } else if rc.average_bitrate > 0 {
        rc.max_bitrate = rc.average_bitrate;
    }
    if options.max_bitrate > 0 {
        rc.max_bitrate = options.max_bitrate;
    }

    let two_pass = two_pass_requested(options, ctx.flags);
    rc.multipass = if ctx.flags.contains(PresetFlags::ONE_PASS) {
        Multipass::Disabled
    } else if ctx.flags.contains(PresetFlags::TWO_PASSES) || options.two_pass == Some(true) {
        Multipass::FullResolution
    } else {
        options.multipass
    };

    rc.low_delay_key_frame_scale = options.low_delay_key_frame_scale;

    if lossless {
        set_lossless(&mut rc);
    } else if let Some(mode) = options.mode.or_else(|| infer_mode(options, two_pass)) {
        apply_mode(&mut rc, mode, options);
    } else {
        rc.mode = RateControlMode::Vbr;
        set_vbr(&mut rc, options);
    }

    if options.buffer_size > 0 {
        rc.vbv_buffer_size = options.buffer_size;
    } else if rc.average_bitrate > 0 {
        rc.vbv_buffer_size = rc.average_bitrate.saturating_mul(2);
    }

    if options.aq {
        rc.enable_aq = true;
        rc.aq_strength = options.aq_strength;
        tracing::debug!("AQ enabled");
    }
    if options.temporal_aq {
        rc.enable_temporal_aq = true;
        tracing::debug!("Temporal AQ enabled");
    }

    if lookahead > 0 {
        let bound = ctx.nb_surfaces.min(ctx.async_depth) as i64
            - ctx.frame_interval_p as i64
            - 4;
        if bound < 0 {
            tracing::warn!("Lookahead not enabled, increase the async depth");
        } else {
            rc.enable_lookahead = true;
            rc.lookahead_depth = (lookahead as i64).min(bound) as u32;
            rc.disable_scenecut = options.no_scenecut;
            rc.disable_badapt = !options.b_adapt;
            tracing::debug!(
                depth = rc.lookahead_depth,
                scenecut = !rc.disable_scenecut,
                b_adapt = !rc.disable_badapt,
                "Lookahead enabled"
            );
        }
    }

    rc.strict_gop_target = options.strict_gop;
    rc.enable_nonref_p = options.nonref_p;
    rc.zero_reorder_delay = options.zero_latency;

    if options.quality > 0.0 {
        // 8.8 fixed point
        let q = (options.quality * 256.0) as i32;
        rc.target_quality = (q >> 8) as u8;
        rc.target_quality_lsb = (q & 0xff) as u8;
        rc.average_bitrate = 0;
        rc.max_bitrate = options.max_bitrate;
        tracing::debug!(quality = q, "Constant quality mode enabled");
    }

    Ok(rc)
}
