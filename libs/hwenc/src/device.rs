// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Device enumeration and selection.
//!
//! Enumerated devices must expose compute capability 3.0 or newer. Every
//! candidate is opened and probed; a candidate that fails any step is torn
//! down before the next one is tried.

use serde::{Deserialize, Serialize};

use crate::caps::{self, CapabilitySet};
use crate::config::EncoderConfig;
use crate::context::ContextGuard;
use crate::driver::{DeviceContext, DeviceInfo, DriverStatus, EncoderDriver, EncoderHandle};
use crate::error::{EncodeError, Result};

/// Minimum packed compute capability, `(major << 4) | minor`.
pub const MIN_COMPUTE_CAPABILITY: u32 = 0x30;

/// Minimum packed driver API version, `(major << 4) | minor`.
pub const MIN_API_VERSION: u32 = (11 << 4) | 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelection {
    /// First capable device.
    #[default]
    Any,
    /// Device at this enumeration index.
    Index(usize),
    /// Context created by the caller; never destroyed by the session.
    External(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub index: usize,
    pub info: DeviceInfo,
    pub capable: bool,
}

/// Open encoder on a selected device.
#[derive(Debug, Clone, Copy)]
pub struct OpenedDevice {
    pub context: DeviceContext,
    /// Whether the session created the context and must destroy it.
    pub owns_context: bool,
    pub encoder: EncoderHandle,
    pub caps: CapabilitySet,
    pub index: Option<usize>,
}

fn packed_compute(info: &DeviceInfo) -> u32 {
    (info.compute_major << 4) | info.compute_minor
}

pub fn check_api_version(driver: &dyn EncoderDriver) -> Result<u32> {
    let version = driver
        .api_version()
        .map_err(|status| EncodeError::device("GetMaxSupportedVersion", status))?;
    if version < MIN_API_VERSION {
        return Err(EncodeError::Unsupported(format!(
            "driver API {}.{} is older than the required {}.{}",
            version >> 4,
            version & 0xf,
            MIN_API_VERSION >> 4,
            MIN_API_VERSION & 0xf
        )));
    }
    Ok(version)
}

/// Lists every device with whether it meets the compute requirement.
pub fn list_devices(driver: &dyn EncoderDriver) -> Result<Vec<DeviceReport>> {
    let count = driver
        .device_count()
        .map_err(|status| EncodeError::device("DeviceGetCount", status))?;

    let mut reports = Vec::with_capacity(count);
    for index in 0..count {
        let info = driver
            .device_info(index)
            .map_err(|status| EncodeError::device("DeviceGet", status))?;
        let capable = packed_compute(&info) >= MIN_COMPUTE_CAPABILITY;
        tracing::info!(
            "[ GPU #{} - < {} > has Compute SM {}.{} ] {}",
            index,
            info.name,
            info.compute_major,
            info.compute_minor,
            if capable { "supported" } else { "not supported" }
        );
        reports.push(DeviceReport {
            index,
            info,
            capable,
        });
    }
    Ok(reports)
}

fn destroy_encoder(driver: &dyn EncoderDriver, context: DeviceContext, encoder: EncoderHandle) {
    match ContextGuard::enter(driver, context) {
        Ok(guard) => {
            if let Err(status) = driver.destroy_encoder(encoder) {
                tracing::warn!(%status, "DestroyEncoder failed");
            }
            if let Err(e) = guard.exit() {
                tracing::warn!("{}", e);
            }
        }
        Err(e) => tracing::warn!("{}", e),
    }
}

/// Opens a session on `context`, probes and checks capabilities. The
/// encoder is destroyed again on failure; the context is left alone.
fn open_and_probe(
    driver: &dyn EncoderDriver,
    context: DeviceContext,
    config: &EncoderConfig,
    lossless: bool,
) -> Result<(EncoderHandle, CapabilitySet)> {
    let encoder = driver
        .open_session(context)
        .map_err(|status| EncodeError::device("OpenEncodeSessionEx", status))?;

    let probed = caps::probe(driver, encoder, config.codec)
        .and_then(|caps| caps.check(config, lossless).map(|()| caps));

    match probed {
        Ok(caps) => Ok((encoder, caps)),
        Err(e) => {
            destroy_encoder(driver, context, encoder);
            Err(e)
        }
    }
}

fn try_device(
    driver: &dyn EncoderDriver,
    index: usize,
    config: &EncoderConfig,
    lossless: bool,
) -> Result<OpenedDevice> {
    let context = driver
        .create_context(index)
        .map_err(|status| EncodeError::device("CtxCreate", status))?;

    match open_and_probe(driver, context, config, lossless) {
        Ok((encoder, caps)) => Ok(OpenedDevice {
            context,
            owns_context: true,
            encoder,
            caps,
            index: Some(index),
        }),
        Err(e) => {
            if let Err(status) = driver.destroy_context(context) {
                tracing::warn!(%status, "CtxDestroy failed");
            }
            Err(e)
        }
    }
}

/// Selects a device, opens an encoder session on it and probes it.
pub fn select_device(
    driver: &dyn EncoderDriver,
    config: &EncoderConfig,
    lossless: bool,
) -> Result<OpenedDevice> {
    if let DeviceSelection::External(raw) = config.device {
        let context = DeviceContext(raw);
        let (encoder, caps) = open_and_probe(driver, context, config, lossless)?;
        return Ok(OpenedDevice {
            context,
            owns_context: false,
            encoder,
            caps,
            index: None,
        });
    }

    let devices = list_devices(driver)?;
    if devices.is_empty() {
        return Err(EncodeError::device_with_details(
            "DeviceGetCount",
            DriverStatus::NoEncodeDevice,
            Some("no devices found".into()),
        ));
    }

    if let DeviceSelection::Index(requested) = config.device {
        if requested >= devices.len() {
            return Err(EncodeError::Configuration(format!(
                "requested GPU {}, but only {} GPUs are available",
                requested,
                devices.len()
            )));
        }
    }

    let mut last_error = None;
    for report in devices.iter().filter(|r| r.capable) {
        if let DeviceSelection::Index(requested) = config.device {
            if requested != report.index {
                continue;
            }
        }

        match try_device(driver, report.index, config, lossless) {
            Ok(opened) => {
                tracing::info!("Using GPU #{} < {} >", report.index, report.info.name);
                return Ok(opened);
            }
            Err(e) => {
                tracing::debug!("GPU #{} rejected: {}", report.index, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        EncodeError::device_with_details(
            "SelectDevice",
            DriverStatus::NoEncodeDevice,
            Some("no capable devices found".into()),
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Cap, DriverCall, LoopbackConfig, LoopbackDriver};

    fn device(name: &str, major: u32, minor: u32) -> DeviceInfo {
        DeviceInfo {
            name: name.into(),
            compute_major: major,
            compute_minor: minor,
        }
    }

    #[test]
    fn test_list_devices_flags_old_hardware() {
        let driver = LoopbackDriver::new(LoopbackConfig {
            devices: vec![device("old", 2, 1), device("new", 7, 5)],
            ..Default::default()
        });
        let reports = list_devices(&driver).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(!reports[0].capable);
        assert!(reports[1].capable);
    }

    #[test]
    fn test_any_skips_incapable_devices() {
        let driver = LoopbackDriver::new(LoopbackConfig {
            devices: vec![device("old", 2, 1), device("new", 7, 5)],
            ..Default::default()
        });
        let opened = select_device(&driver, &EncoderConfig::new(640, 480), false).unwrap();
        assert_eq!(opened.index, Some(1));
        assert!(opened.owns_context);
        assert_eq!(driver.call_count(DriverCall::CreateContext), 1);
    }

    #[test]
    fn test_index_out_of_range() {
        let driver = LoopbackDriver::default();
        let config = EncoderConfig::new(640, 480).with_device(DeviceSelection::Index(5));
        assert!(matches!(
            select_device(&driver, &config, false),
            Err(EncodeError::Configuration(_))
        ));
    }

    #[test]
    fn test_no_capable_devices() {
        let driver = LoopbackDriver::new(LoopbackConfig {
            devices: vec![device("old", 2, 0)],
            ..Default::default()
        });
        let err = select_device(&driver, &EncoderConfig::new(640, 480), false).unwrap_err();
        assert!(matches!(
            err,
            EncodeError::Device {
                status: DriverStatus::NoEncodeDevice,
                ..
            }
        ));
    }

    #[test]
    fn test_failed_probe_releases_everything() {
        let mut config = LoopbackConfig::default();
        config.caps.insert(Cap::Yuv444Encode, 0);
        let driver = LoopbackDriver::new(config);

        let encoder_config = EncoderConfig::new(640, 480)
            .with_pixel_format(crate::format::PixelFormat::Yuv444p);
        let err = select_device(&driver, &encoder_config, false).unwrap_err();
        assert!(matches!(err, EncodeError::Unsupported(_)));

        assert_eq!(driver.call_count(DriverCall::DestroyEncoder), 1);
        assert_eq!(driver.call_count(DriverCall::DestroyContext), 1);
        assert_eq!(driver.live_contexts(), 0);
        assert_eq!(driver.context_depth(), 0);
    }

    #[test]
    fn test_external_context_is_not_owned() {
        let driver = LoopbackDriver::default();
        let ctx = driver.create_context(0).unwrap();
        let config = EncoderConfig::new(640, 480).with_device(DeviceSelection::External(ctx.0));
        let opened = select_device(&driver, &config, false).unwrap();
        assert!(!opened.owns_context);
        assert_eq!(opened.context, ctx);
        assert_eq!(opened.index, None);
    }

    #[test]
    fn test_api_version_check() {
        let driver = LoopbackDriver::new(LoopbackConfig {
            api_version: (9 << 4) | 1,
            ..Default::default()
        });
        assert!(matches!(
            check_api_version(&driver),
            Err(EncodeError::Unsupported(_))
        ));
        assert!(check_api_version(&LoopbackDriver::default()).is_ok());
    }
}
