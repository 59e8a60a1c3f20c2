// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

use crate::driver::{DriverStatus, EncoderDriver, EncoderHandle, ErrorCode};

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{context} failed -> {status}{}", details_suffix(.details))]
    Device {
        context: String,
        status: DriverStatus,
        details: Option<String>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

fn details_suffix(details: &Option<String>) -> String {
    match details {
        Some(d) if !d.is_empty() => format!(": {}", d),
        _ => String::new(),
    }
}

impl EncodeError {
    pub fn device(context: impl Into<String>, status: DriverStatus) -> Self {
        EncodeError::Device {
            context: context.into(),
            status,
            details: None,
        }
    }

    pub fn device_with_details(
        context: impl Into<String>,
        status: DriverStatus,
        details: Option<String>,
    ) -> Self {
        EncodeError::Device {
            context: context.into(),
            status,
            details,
        }
    }

    /// Device error carrying the driver's last-error string, logged as it
    /// is mapped.
    pub fn from_driver(
        driver: &dyn EncoderDriver,
        encoder: EncoderHandle,
        context: impl Into<String>,
        status: DriverStatus,
    ) -> Self {
        let err = Self::device_with_details(context, status, driver.last_error(encoder));
        tracing::error!("{}", err);
        err
    }

    /// Stable code for callers that bridge into errno-style APIs.
    pub fn code(&self) -> ErrorCode {
        match self {
            EncodeError::Configuration(_) | EncodeError::ConfigParse(_) => {
                ErrorCode::InvalidArgument
            }
            EncodeError::Unsupported(_) => ErrorCode::NotImplemented,
            EncodeError::ResourceExhausted(_) => ErrorCode::OutOfMemory,
            EncodeError::Device { status, .. } => status.code(),
            EncodeError::Internal(_) => ErrorCode::Unknown,
            EncodeError::InvalidState(_) => ErrorCode::InvalidArgument,
            EncodeError::Io(_) => ErrorCode::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, EncodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let err = EncodeError::device_with_details(
            "EncodePicture",
            DriverStatus::EncoderBusy,
            Some("queue full".into()),
        );
        assert_eq!(
            err.to_string(),
            "EncodePicture failed -> encoder busy: queue full"
        );
        assert_eq!(err.code(), ErrorCode::TryAgain);

        let bare = EncodeError::device("LockBitstream", DriverStatus::LockBusy);
        assert_eq!(bare.to_string(), "LockBitstream failed -> lock busy");
    }

    #[test]
    fn test_codes() {
        assert_eq!(
            EncodeError::Unsupported("yuv444".into()).code(),
            ErrorCode::NotImplemented
        );
        assert_eq!(
            EncodeError::ResourceExhausted("cache".into()).code(),
            ErrorCode::OutOfMemory
        );
    }
}
