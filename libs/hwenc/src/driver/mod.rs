// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Function table of a handle-based hardware encoder driver.
//!
//! Everything the session needs from the vendor runtime goes through
//! [`EncoderDriver`]. The trait is object safe so the session can hold an
//! `Arc<dyn EncoderDriver>`; [`LoopbackDriver`] is a software implementation
//! used for testing the orchestration logic without hardware.

mod loopback;
mod status;

pub use loopback::{DriverCall, LoopbackConfig, LoopbackDriver, LoopbackPayload, PAYLOAD_MAGIC};
pub use status::{DriverResult, DriverStatus, ErrorCode};

use crate::codec::{Codec, CodecConfig};
use crate::format::BufferFormat;
use crate::preset::{Multipass, Preset, Tuning};
use crate::rate_control::{QpTriple, RateControlConfig, RateControlMode};
use crate::sei::SeiPayload;

macro_rules! driver_handle {
    ($($(#[$meta:meta])* $name:ident;)+) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub u64);
        )+
    };
}

driver_handle! {
    /// Device context created or adopted for the session.
    DeviceContext;
    /// Open encoder session.
    EncoderHandle;
    /// Driver-owned host-writable input buffer.
    InputBufferHandle;
    /// Driver-owned output bitstream buffer.
    BitstreamHandle;
    /// Registration of an external hardware frame.
    RegistrationHandle;
    /// Active mapping of a registered resource.
    MappedHandle;
}

/// Capability queried through [`EncoderDriver::query_cap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cap {
    WidthMax,
    HeightMax,
    NumMaxBFrames,
    Yuv444Encode,
    LosslessEncode,
    FieldEncoding,
    TenBitEncode,
    Lookahead,
    TemporalAq,
    WeightedPrediction,
    Cabac,
    BFrameRefMode,
    MultipleRefFrames,
    DynamicBitrateChange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub compute_major: u32,
    pub compute_minor: u32,
}

/// Defaults the driver reports for a preset and tuning combination.
#[derive(Debug, Clone, PartialEq)]
pub struct PresetConfig {
    pub gop_length: u32,
    pub frame_interval_p: i32,
    pub rc_mode: RateControlMode,
    pub average_bitrate: u32,
    pub max_bitrate: u32,
    pub vbv_buffer_size: u32,
    pub const_qp: QpTriple,
    pub lookahead_enabled: bool,
    pub lookahead_depth: u32,
    pub multipass: Multipass,
}

impl Default for PresetConfig {
    fn default() -> Self {
        Self {
            gop_length: 250,
            frame_interval_p: 1,
            rc_mode: RateControlMode::Vbr,
            average_bitrate: 0,
            max_bitrate: 0,
            vbv_buffer_size: 0,
            const_qp: QpTriple {
                intra: 25,
                inter_p: 28,
                inter_b: 31,
            },
            lookahead_enabled: false,
            lookahead_depth: 0,
            multipass: Multipass::Disabled,
        }
    }
}

/// Full encoder configuration handed to initialize and reconfigure.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InitializeParams {
    pub codec: Codec,
    pub preset: Preset,
    pub tuning: Tuning,
    pub width: u32,
    pub height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub dar_width: u32,
    pub dar_height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub enable_picture_type_decision: bool,
    pub gop_length: u32,
    pub frame_interval_p: i32,
    pub rate_control: RateControlConfig,
    pub codec_config: CodecConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconfigureParams {
    pub params: InitializeParams,
    pub reset_encoder: bool,
    pub force_idr: bool,
}

/// Kind of external hardware memory a frame lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    DevicePointer,
    TextureArray,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResource {
    pub resource_type: ResourceType,
    pub native: u64,
    pub sub_index: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: BufferFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedInput {
    pub handle: MappedHandle,
    pub format: BufferFormat,
}

/// Input of a picture submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureInput {
    Buffer(InputBufferHandle),
    Mapped(MappedHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureStructure {
    #[default]
    Frame,
    FieldTopBottom,
    FieldBottomTop,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PicFlags: u32 {
        const FORCE_INTRA = 1 << 0;
        const FORCE_IDR = 1 << 1;
        const OUTPUT_SPSPPS = 1 << 2;
        const EOS = 1 << 3;
    }
}

/// Per-picture parameters. End of stream carries no input and no output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PicParams {
    pub input: Option<PictureInput>,
    pub output: Option<BitstreamHandle>,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: Option<BufferFormat>,
    pub structure: PictureStructure,
    pub timestamp: i64,
    pub flags: PicFlags,
    pub sei: Vec<SeiPayload>,
}

impl PicParams {
    pub fn end_of_stream() -> Self {
        Self {
            flags: PicFlags::EOS,
            ..Default::default()
        }
    }
}

/// Locked view of an input buffer.
///
/// The memory stays valid until the matching unlock call.
#[derive(Debug)]
pub struct LockedInput {
    pub ptr: *mut u8,
    pub len: usize,
    pub pitch: usize,
}

impl LockedInput {
    /// # Safety
    ///
    /// The buffer must still be locked and no other view may alias it.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.ptr.is_null() || self.len == 0 {
            return &mut [];
        }
        // SAFETY: caller guarantees the lock is held and the region is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// Picture type as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePictureType {
    P,
    B,
    I,
    Idr,
    Bi,
    Skipped,
    IntraRefresh,
    Unknown(u32),
}

/// Locked view of a completed bitstream buffer.
#[derive(Debug)]
pub struct LockedBitstream {
    pub ptr: *const u8,
    pub len: usize,
    pub picture_type: DevicePictureType,
    pub output_timestamp: i64,
    pub frame_avg_qp: u32,
}

impl LockedBitstream {
    /// # Safety
    ///
    /// The bitstream buffer must still be locked.
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        // SAFETY: caller guarantees the lock is held.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Vendor encoder function table.
pub trait EncoderDriver: Send + Sync {
    /// Packed API version, `(major << 4) | minor`.
    fn api_version(&self) -> DriverResult<u32>;

    fn device_count(&self) -> DriverResult<usize>;
    fn device_info(&self, index: usize) -> DriverResult<DeviceInfo>;
    fn create_context(&self, index: usize) -> DriverResult<DeviceContext>;
    fn destroy_context(&self, context: DeviceContext) -> DriverResult<()>;
    fn push_context(&self, context: DeviceContext) -> DriverResult<()>;
    fn pop_context(&self) -> DriverResult<()>;

    fn open_session(&self, context: DeviceContext) -> DriverResult<EncoderHandle>;
    fn supported_codecs(&self, encoder: EncoderHandle) -> DriverResult<Vec<Codec>>;
    fn query_cap(&self, encoder: EncoderHandle, codec: Codec, cap: Cap) -> DriverResult<i32>;
    fn preset_config(
        &self,
        encoder: EncoderHandle,
        codec: Codec,
        preset: Preset,
        tuning: Tuning,
    ) -> DriverResult<PresetConfig>;
    fn initialize(&self, encoder: EncoderHandle, params: &InitializeParams) -> DriverResult<()>;

    fn create_input_buffer(
        &self,
        encoder: EncoderHandle,
        width: u32,
        height: u32,
        format: BufferFormat,
    ) -> DriverResult<InputBufferHandle>;
    fn destroy_input_buffer(
        &self,
        encoder: EncoderHandle,
        buffer: InputBufferHandle,
    ) -> DriverResult<()>;
    fn create_bitstream_buffer(&self, encoder: EncoderHandle) -> DriverResult<BitstreamHandle>;
    fn destroy_bitstream_buffer(
        &self,
        encoder: EncoderHandle,
        buffer: BitstreamHandle,
    ) -> DriverResult<()>;

    fn lock_input_buffer(
        &self,
        encoder: EncoderHandle,
        buffer: InputBufferHandle,
    ) -> DriverResult<LockedInput>;
    fn unlock_input_buffer(
        &self,
        encoder: EncoderHandle,
        buffer: InputBufferHandle,
    ) -> DriverResult<()>;
    fn lock_bitstream(
        &self,
        encoder: EncoderHandle,
        buffer: BitstreamHandle,
    ) -> DriverResult<LockedBitstream>;
    fn unlock_bitstream(&self, encoder: EncoderHandle, buffer: BitstreamHandle)
    -> DriverResult<()>;

    fn register_resource(
        &self,
        encoder: EncoderHandle,
        resource: &RegisterResource,
    ) -> DriverResult<RegistrationHandle>;
    fn unregister_resource(
        &self,
        encoder: EncoderHandle,
        registration: RegistrationHandle,
    ) -> DriverResult<()>;
    fn map_input_resource(
        &self,
        encoder: EncoderHandle,
        registration: RegistrationHandle,
    ) -> DriverResult<MappedInput>;
    fn unmap_input_resource(&self, encoder: EncoderHandle, mapped: MappedHandle)
    -> DriverResult<()>;

    fn encode_picture(&self, encoder: EncoderHandle, params: &PicParams) -> DriverResult<()>;
    fn sequence_params(&self, encoder: EncoderHandle) -> DriverResult<Vec<u8>>;
    fn reconfigure(&self, encoder: EncoderHandle, params: &ReconfigureParams)
    -> DriverResult<()>;

    /// Driver's description of the last failure on this encoder, if any.
    fn last_error(&self, encoder: EncoderHandle) -> Option<String>;

    fn destroy_encoder(&self, encoder: EncoderHandle) -> DriverResult<()>;
}
