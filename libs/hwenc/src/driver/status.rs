// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Driver status codes and their stable error-code mapping.

use std::fmt;

/// Status returned by every fallible driver call.
///
/// `Success` never travels inside an `Err`; driver methods return
/// `Result<T, DriverStatus>` and use the remaining variants for failures.
/// `NeedMoreInput` is special: the pipeline treats it as a successful
/// submission while the device accumulates its reorder window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverStatus {
    Success,
    NoEncodeDevice,
    UnsupportedDevice,
    InvalidEncoderDevice,
    InvalidDevice,
    DeviceNotExist,
    InvalidPtr,
    InvalidEvent,
    InvalidParam,
    InvalidCall,
    OutOfMemory,
    EncoderNotInitialized,
    UnsupportedParam,
    LockBusy,
    NotEnoughBuffer,
    InvalidVersion,
    MapFailed,
    NeedMoreInput,
    EncoderBusy,
    EventNotRegistered,
    Generic,
    IncompatibleClientKey,
    Unimplemented,
    ResourceRegisterFailed,
    ResourceNotRegistered,
    ResourceNotMapped,
}

/// Stable, driver-independent classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    NotFound,
    NotImplemented,
    InvalidArgument,
    Io,
    BadAddress,
    OutOfMemory,
    TryAgain,
    BufferTooSmall,
    BadHandle,
    Unknown,
}

impl DriverStatus {
    /// Stable error code for this status.
    pub fn code(self) -> ErrorCode {
        self.entry().0
    }

    /// Short human-readable description.
    pub fn description(self) -> &'static str {
        self.entry().1
    }

    pub fn is_success(self) -> bool {
        self == DriverStatus::Success
    }

    fn entry(self) -> (ErrorCode, &'static str) {
        use DriverStatus::*;
        use ErrorCode as C;

        match self {
            Success => (C::Success, "success"),
            NoEncodeDevice => (C::NotFound, "no encode device"),
            UnsupportedDevice => (C::NotImplemented, "unsupported device"),
            InvalidEncoderDevice => (C::InvalidArgument, "invalid encoder device"),
            InvalidDevice => (C::InvalidArgument, "invalid device"),
            DeviceNotExist => (C::Io, "device does not exist"),
            InvalidPtr => (C::BadAddress, "invalid ptr"),
            InvalidEvent => (C::InvalidArgument, "invalid event"),
            InvalidParam => (C::InvalidArgument, "invalid param"),
            InvalidCall => (C::InvalidArgument, "invalid call"),
            OutOfMemory => (C::OutOfMemory, "out of memory"),
            EncoderNotInitialized => (C::InvalidArgument, "encoder not initialized"),
            UnsupportedParam => (C::NotImplemented, "unsupported param"),
            LockBusy => (C::TryAgain, "lock busy"),
            NotEnoughBuffer => (C::BufferTooSmall, "not enough buffer"),
            InvalidVersion => (C::InvalidArgument, "invalid version"),
            MapFailed => (C::Io, "map failed"),
            NeedMoreInput => (C::TryAgain, "need more input"),
            EncoderBusy => (C::TryAgain, "encoder busy"),
            EventNotRegistered => (C::BadHandle, "event not registered"),
            Generic => (C::Unknown, "generic error"),
            IncompatibleClientKey => (C::InvalidArgument, "incompatible client key"),
            Unimplemented => (C::NotImplemented, "unimplemented"),
            ResourceRegisterFailed => (C::Io, "resource register failed"),
            ResourceNotRegistered => (C::BadHandle, "resource not registered"),
            ResourceNotMapped => (C::BadHandle, "resource not mapped"),
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Result of a driver call.
pub type DriverResult<T> = std::result::Result<T, DriverStatus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(DriverStatus::Success.code(), ErrorCode::Success);
        assert_eq!(DriverStatus::NoEncodeDevice.code(), ErrorCode::NotFound);
        assert_eq!(DriverStatus::OutOfMemory.code(), ErrorCode::OutOfMemory);
        assert_eq!(DriverStatus::LockBusy.code(), ErrorCode::TryAgain);
        assert_eq!(DriverStatus::NotEnoughBuffer.code(), ErrorCode::BufferTooSmall);
        assert_eq!(DriverStatus::ResourceNotMapped.code(), ErrorCode::BadHandle);
        assert_eq!(DriverStatus::Generic.code(), ErrorCode::Unknown);
    }

    #[test]
    fn test_display_uses_description() {
        assert_eq!(DriverStatus::MapFailed.to_string(), "map failed");
        assert_eq!(
            DriverStatus::ResourceRegisterFailed.to_string(),
            "resource register failed"
        );
    }
}
