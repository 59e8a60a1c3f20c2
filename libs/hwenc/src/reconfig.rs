// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Mid-stream reconfiguration.
//!
//! Before each submission the caller's current stream hints are compared
//! with the parameters the encoder runs with. Aspect ratio changes are
//! lightweight; bitrate changes need dynamic bitrate support, are refused
//! under constant QP, and reset the encoder with a forced IDR.

use crate::driver::{EncoderDriver, EncoderHandle, InitializeParams, ReconfigureParams};
use crate::error::EncodeError;
use crate::ratio;
use crate::rate_control::RateControlMode;

/// Caller-adjustable stream parameters. Zero leaves a value alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamHints {
    pub sar_num: u32,
    pub sar_den: u32,
    pub bitrate: u32,
    pub max_bitrate: u32,
    pub buffer_size: u32,
}

/// Pending reconfiguration and what it changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconfigurePlan {
    pub request: ReconfigureParams,
    pub dar_changed: bool,
    pub bitrate_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigureOutcome {
    Unchanged,
    Applied { dar: bool, bitrate: bool },
    /// The driver refused; the previous parameters stay in effect.
    Rejected,
}

/// Works out which parameters differ from `current`, if any.
pub fn plan(
    current: &InitializeParams,
    hints: &StreamHints,
    dynamic_bitrate: bool,
) -> Option<ReconfigurePlan> {
    let mut params = current.clone();
    let mut dar_changed = false;
    let mut bitrate_changed = false;

    let dar = ratio::display_aspect(current.width, current.height, hints.sar_num, hints.sar_den);
    if dar.num as u32 != current.dar_width || dar.den as u32 != current.dar_height {
        tracing::debug!(
            "aspect ratio change (DAR): {}:{} -> {}:{}",
            current.dar_width,
            current.dar_height,
            dar.num,
            dar.den
        );
        params.dar_width = dar.num as u32;
        params.dar_height = dar.den as u32;
        dar_changed = true;
    }

    let rc = &mut params.rate_control;
    if rc.mode != RateControlMode::ConstQp && dynamic_bitrate {
        if hints.bitrate > 0 && rc.average_bitrate != hints.bitrate {
            tracing::debug!(
                "avg bitrate change: {} -> {}",
                rc.average_bitrate,
                hints.bitrate
            );
            rc.average_bitrate = hints.bitrate;
            bitrate_changed = true;
        }
        if hints.max_bitrate > 0 && rc.max_bitrate != hints.max_bitrate {
            tracing::debug!(
                "max bitrate change: {} -> {}",
                rc.max_bitrate,
                hints.max_bitrate
            );
            rc.max_bitrate = hints.max_bitrate;
            bitrate_changed = true;
        }
        if hints.buffer_size > 0 && rc.vbv_buffer_size != hints.buffer_size {
            tracing::debug!(
                "vbv buffer size change: {} -> {}",
                rc.vbv_buffer_size,
                hints.buffer_size
            );
            rc.vbv_buffer_size = hints.buffer_size;
            bitrate_changed = true;
        }
    }

    if !dar_changed && !bitrate_changed {
        return None;
    }

    Some(ReconfigurePlan {
        request: ReconfigureParams {
            params,
            reset_encoder: bitrate_changed,
            force_idr: bitrate_changed,
        },
        dar_changed,
        bitrate_changed,
    })
}

/// Applies a reconfiguration if the hints call for one. `current` is only
/// updated once the driver accepts; a refusal is logged and ignored.
///
/// Must run with the device context current.
pub fn maybe_reconfigure(
    driver: &dyn EncoderDriver,
    encoder: EncoderHandle,
    current: &mut InitializeParams,
    hints: &StreamHints,
    dynamic_bitrate: bool,
) -> ReconfigureOutcome {
    let Some(plan) = plan(current, hints, dynamic_bitrate) else {
        return ReconfigureOutcome::Unchanged;
    };

    match driver.reconfigure(encoder, &plan.request) {
        Ok(()) => {
            if plan.dar_changed {
                current.dar_width = plan.request.params.dar_width;
                current.dar_height = plan.request.params.dar_height;
            }
            if plan.bitrate_changed {
                let rc = &plan.request.params.rate_control;
                current.rate_control.average_bitrate = rc.average_bitrate;
                current.rate_control.max_bitrate = rc.max_bitrate;
                current.rate_control.vbv_buffer_size = rc.vbv_buffer_size;
            }
            ReconfigureOutcome::Applied {
                dar: plan.dar_changed,
                bitrate: plan.bitrate_changed,
            }
        }
        Err(status) => {
            let err = EncodeError::device_with_details(
                "ReconfigureEncoder",
                status,
                driver.last_error(encoder),
            );
            tracing::warn!("failed to reconfigure encoder: {}", err);
            ReconfigureOutcome::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, DriverStatus, LoopbackDriver};
    use crate::rate_control::QpTriple;

    fn initialized(driver: &LoopbackDriver, mode: RateControlMode) -> (EncoderHandle, InitializeParams) {
        let ctx = driver.create_context(0).unwrap();
        let enc = driver.open_session(ctx).unwrap();
        let mut params = InitializeParams {
            width: 1920,
            height: 1080,
            max_width: 1920,
            max_height: 1080,
            dar_width: 16,
            dar_height: 9,
            frame_rate_num: 30,
            frame_rate_den: 1,
            ..InitializeParams::default()
        };
        params.rate_control.mode = mode;
        params.rate_control.average_bitrate = 4_000_000;
        params.rate_control.const_qp = QpTriple::uniform(23);
        driver.initialize(enc, &params).unwrap();
        (enc, params)
    }

    #[test]
    fn test_no_change_makes_no_call() {
        let driver = LoopbackDriver::default();
        let (enc, mut params) = initialized(&driver, RateControlMode::Vbr);
        let outcome =
            maybe_reconfigure(&driver, enc, &mut params, &StreamHints::default(), true);
        assert_eq!(outcome, ReconfigureOutcome::Unchanged);
        assert_eq!(driver.call_count(DriverCall::Reconfigure), 0);
    }

    #[test]
    fn test_dar_change_is_lightweight() {
        let driver = LoopbackDriver::default();
        let (enc, mut params) = initialized(&driver, RateControlMode::Vbr);
        let hints = StreamHints {
            sar_num: 4,
            sar_den: 3,
            ..Default::default()
        };
        let outcome = maybe_reconfigure(&driver, enc, &mut params, &hints, true);
        assert_eq!(
            outcome,
            ReconfigureOutcome::Applied {
                dar: true,
                bitrate: false
            }
        );
        assert_eq!((params.dar_width, params.dar_height), (64, 27));
        let sent = &driver.reconfigurations()[0];
        assert!(!sent.reset_encoder);
        assert!(!sent.force_idr);
    }

    #[test]
    fn test_bitrate_change_forces_idr() {
        let driver = LoopbackDriver::default();
        let (enc, mut params) = initialized(&driver, RateControlMode::Cbr);
        let hints = StreamHints {
            bitrate: 2_000_000,
            buffer_size: 4_000_000,
            ..Default::default()
        };
        let outcome = maybe_reconfigure(&driver, enc, &mut params, &hints, true);
        assert_eq!(
            outcome,
            ReconfigureOutcome::Applied {
                dar: false,
                bitrate: true
            }
        );
        assert_eq!(params.rate_control.average_bitrate, 2_000_000);
        assert_eq!(params.rate_control.vbv_buffer_size, 4_000_000);
        let sent = &driver.reconfigurations()[0];
        assert!(sent.reset_encoder && sent.force_idr);
    }

    #[test]
    fn test_bitrate_ignored_under_const_qp() {
        let driver = LoopbackDriver::default();
        let (enc, mut params) = initialized(&driver, RateControlMode::ConstQp);
        let hints = StreamHints {
            bitrate: 2_000_000,
            ..Default::default()
        };
        let outcome = maybe_reconfigure(&driver, enc, &mut params, &hints, true);
        assert_eq!(outcome, ReconfigureOutcome::Unchanged);
        assert_eq!(params.rate_control.average_bitrate, 4_000_000);
        assert_eq!(driver.call_count(DriverCall::Reconfigure), 0);
    }

    #[test]
    fn test_bitrate_ignored_without_dynamic_support() {
        let driver = LoopbackDriver::default();
        let (enc, mut params) = initialized(&driver, RateControlMode::Vbr);
        let hints = StreamHints {
            max_bitrate: 9_000_000,
            ..Default::default()
        };
        assert_eq!(
            maybe_reconfigure(&driver, enc, &mut params, &hints, false),
            ReconfigureOutcome::Unchanged
        );
    }

    #[test]
    fn test_rejection_keeps_previous_parameters() {
        let driver = LoopbackDriver::default();
        let (enc, mut params) = initialized(&driver, RateControlMode::Vbr);
        driver.fail_next(DriverCall::Reconfigure, DriverStatus::InvalidParam);
        let hints = StreamHints {
            bitrate: 1_000_000,
            sar_num: 2,
            sar_den: 1,
            ..Default::default()
        };
        let before = params.clone();
        let outcome = maybe_reconfigure(&driver, enc, &mut params, &hints, true);
        assert_eq!(outcome, ReconfigureOutcome::Rejected);
        assert_eq!(params, before);
    }
}
