// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Host-side session orchestrator for handle-based hardware video encoders.
//!
//! An [`EncodeSession`] drives an [`EncoderDriver`]: it picks a device,
//! checks capabilities, derives rate control and codec parameters, keeps a
//! pool of input/output surfaces and runs the non-blocking submit/drain
//! loop. [`LoopbackDriver`] stands in for real hardware.
//!
//! ```ignore
//! use std::sync::Arc;
//! use hwenc::{DrainOutcome, EncodeSession, EncoderConfig, LoopbackDriver};
//!
//! let driver = Arc::new(LoopbackDriver::default());
//! let mut session = EncodeSession::open(driver, EncoderConfig::new(1280, 720))?;
//! session.submit_frame(Some(&frame))?;
//! if let DrainOutcome::Packet(packet) = session.receive_packet()? {
//!     // ...
//! }
//! session.close()?;
//! ```

pub mod caps;
pub mod codec;
pub mod config;
pub mod context;
pub mod device;
pub mod driver;
pub mod error;
pub mod format;
pub mod frame;
pub mod pipeline;
pub mod pool;
pub mod preset;
pub mod queue;
pub mod rate_control;
pub mod ratio;
pub mod reconfig;
pub mod registry;
pub mod sei;
pub mod session;

pub use caps::CapabilitySet;
pub use codec::{BFrameRefMode, Codec, EntropyCoder, Profile, Tier};
pub use config::{ColorDescription, EncoderConfig, InputMode};
pub use device::{DeviceReport, DeviceSelection, list_devices};
pub use driver::{
    DriverStatus, EncoderDriver, ErrorCode, LoopbackConfig, LoopbackDriver, ResourceType,
};
pub use error::{EncodeError, Result};
pub use format::PixelFormat;
pub use frame::{
    EncodedPacket, EncoderStats, ExternalFrame, Frame, FramePayload, PictureType, Plane, Timecode,
};
pub use pipeline::{DrainOutcome, SubmitOutcome};
pub use pool::SurfaceBudget;
pub use preset::{Multipass, Preset, Tuning};
pub use rate_control::{QpTriple, RateControlMode, RateControlOptions};
pub use session::{EncodeSession, StreamProperties};
