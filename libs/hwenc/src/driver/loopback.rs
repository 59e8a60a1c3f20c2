// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Software encoder driver.
//!
//! Implements the full [`EncoderDriver`] table in host memory. Pictures
//! "encode" into a small deterministic payload (a magic tag, the picture
//! index and the first bytes of the input) so sessions can be exercised end
//! to end without hardware. Every call is counted and any call can be made
//! to fail on demand.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use super::{
    BitstreamHandle, Cap, DeviceContext, DeviceInfo, DevicePictureType, DriverResult,
    DriverStatus, EncoderDriver, EncoderHandle, InitializeParams, InputBufferHandle,
    LockedBitstream, LockedInput, MappedHandle, MappedInput, PicFlags, PicParams, PictureInput,
    PresetConfig, RegisterResource, RegistrationHandle, ReconfigureParams,
};
use crate::codec::Codec;
use crate::format::BufferFormat;
use crate::preset::{Preset, Tuning};
use crate::rate_control::{QpTriple, RateControlMode};

/// Magic prefix of every loopback payload.
pub const PAYLOAD_MAGIC: &[u8; 4] = b"LOOP";

/// Input bytes echoed into each payload.
const ECHO_BYTES: usize = 16;

/// Identifies a driver entry point for counters and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverCall {
    ApiVersion,
    DeviceCount,
    DeviceInfo,
    CreateContext,
    DestroyContext,
    PushContext,
    PopContext,
    OpenSession,
    SupportedCodecs,
    QueryCap,
    PresetConfig,
    Initialize,
    CreateInputBuffer,
    DestroyInputBuffer,
    CreateBitstreamBuffer,
    DestroyBitstreamBuffer,
    LockInputBuffer,
    UnlockInputBuffer,
    LockBitstream,
    UnlockBitstream,
    RegisterResource,
    UnregisterResource,
    MapInputResource,
    UnmapInputResource,
    EncodePicture,
    SequenceParams,
    Reconfigure,
    DestroyEncoder,
}

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Packed `(major << 4) | minor`.
    pub api_version: u32,
    pub devices: Vec<DeviceInfo>,
    pub codecs: Vec<Codec>,
    /// Capability values; missing entries fail the query.
    pub caps: HashMap<Cap, i32>,
    pub preset: PresetConfig,
    /// Pictures held back (answering need-more-input) before a submission
    /// completes everything pending.
    pub completion_latency: usize,
    pub pitch_alignment: usize,
    pub sequence_header: Vec<u8>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        let caps = [
            (Cap::WidthMax, 4096),
            (Cap::HeightMax, 4096),
            (Cap::NumMaxBFrames, 4),
            (Cap::Yuv444Encode, 1),
            (Cap::LosslessEncode, 1),
            (Cap::FieldEncoding, 1),
            (Cap::TenBitEncode, 1),
            (Cap::Lookahead, 1),
            (Cap::TemporalAq, 1),
            (Cap::WeightedPrediction, 1),
            (Cap::Cabac, 1),
            (Cap::BFrameRefMode, 3),
            (Cap::MultipleRefFrames, 1),
            (Cap::DynamicBitrateChange, 1),
        ]
        .into_iter()
        .collect();

        Self {
            api_version: (12 << 4) | 2,
            devices: vec![DeviceInfo {
                name: "Loopback GPU".into(),
                compute_major: 8,
                compute_minor: 6,
            }],
            codecs: vec![Codec::H264, Codec::Hevc],
            caps,
            preset: PresetConfig::default(),
            completion_latency: 0,
            pitch_alignment: 64,
            sequence_header: vec![0, 0, 0, 1, 0x67, 0x64, 0x00, 0x28, 0, 0, 0, 1, 0x68, 0xee],
        }
    }
}

struct InputBuffer {
    encoder: u64,
    data: Box<[u8]>,
    pitch: usize,
    locked: bool,
}

struct Bitstream {
    encoder: u64,
    data: Box<[u8]>,
    len: usize,
    picture_type: DevicePictureType,
    timestamp: i64,
    qp: u32,
    state: BitstreamState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitstreamState {
    Idle,
    Pending,
    Complete,
    Locked,
}

struct Registration {
    encoder: u64,
    native: u64,
    format: BufferFormat,
    mapping: Option<u64>,
}

struct PendingPicture {
    output: u64,
    timestamp: i64,
    flags: PicFlags,
    echo: Vec<u8>,
}

#[derive(Default)]
struct EncoderState {
    initialized: Option<InitializeParams>,
    frame_index: u64,
    pending: VecDeque<PendingPicture>,
}

struct Failure {
    call: DriverCall,
    remaining: usize,
    status: DriverStatus,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    calls: HashMap<DriverCall, usize>,
    failures: Vec<Failure>,
    contexts: HashSet<u64>,
    context_stack: Vec<u64>,
    encoders: HashMap<u64, EncoderState>,
    inputs: HashMap<u64, InputBuffer>,
    bitstreams: HashMap<u64, Bitstream>,
    registrations: HashMap<u64, Registration>,
    mappings: HashMap<u64, u64>,
    pictures: Vec<PicParams>,
    reconfigures: Vec<ReconfigureParams>,
    picture_type_override: Option<DevicePictureType>,
    last_error: Option<String>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Counts the call and fires a pending injected failure.
    fn enter(&mut self, call: DriverCall) -> DriverResult<()> {
        *self.calls.entry(call).or_default() += 1;

        let mut fired = None;
        for (i, failure) in self.failures.iter_mut().enumerate() {
            if failure.call == call {
                failure.remaining -= 1;
                if failure.remaining == 0 {
                    fired = Some(i);
                    break;
                }
            }
        }
        match fired {
            Some(i) => {
                let failure = self.failures.remove(i);
                self.last_error = Some(format!("injected {:?} failure", call));
                Err(failure.status)
            }
            None => Ok(()),
        }
    }

    fn encoder(&mut self, encoder: EncoderHandle) -> DriverResult<&mut EncoderState> {
        self.encoders
            .get_mut(&encoder.0)
            .ok_or(DriverStatus::InvalidEncoderDevice)
    }

    fn fail(&mut self, status: DriverStatus, what: &str) -> DriverStatus {
        self.last_error = Some(what.to_string());
        status
    }
}

/// Host-memory implementation of [`EncoderDriver`].
pub struct LoopbackDriver {
    config: LoopbackConfig,
    state: Mutex<State>,
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

fn bytes_per_sample(format: BufferFormat) -> usize {
    match format {
        BufferFormat::Yv12 | BufferFormat::Nv12 | BufferFormat::Yuv444 => 1,
        BufferFormat::Yuv420_10Bit | BufferFormat::Yuv444_10Bit => 2,
        BufferFormat::Argb | BufferFormat::Abgr => 4,
    }
}

fn buffer_rows(format: BufferFormat, height: usize) -> usize {
    match format {
        BufferFormat::Yv12 | BufferFormat::Nv12 | BufferFormat::Yuv420_10Bit => {
            height + height.div_ceil(2)
        }
        BufferFormat::Yuv444 | BufferFormat::Yuv444_10Bit => height * 3,
        BufferFormat::Argb | BufferFormat::Abgr => height,
    }
}

impl LoopbackDriver {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Fails the next call of `call` with `status`.
    pub fn fail_next(&self, call: DriverCall, status: DriverStatus) {
        self.fail_nth(call, 1, status);
    }

    /// Fails the `nth` upcoming call of `call` (1 is the next one).
    pub fn fail_nth(&self, call: DriverCall, nth: usize, status: DriverStatus) {
        self.state.lock().failures.push(Failure {
            call,
            remaining: nth.max(1),
            status,
        });
    }

    /// Reports `picture_type` for every completed picture, or restores the
    /// GOP-derived types with `None`.
    pub fn override_picture_type(&self, picture_type: Option<DevicePictureType>) {
        self.state.lock().picture_type_override = picture_type;
    }

    pub fn call_count(&self, call: DriverCall) -> usize {
        self.state.lock().calls.get(&call).copied().unwrap_or(0)
    }

    pub fn context_depth(&self) -> usize {
        self.state.lock().context_stack.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn live_encoders(&self) -> usize {
        self.state.lock().encoders.len()
    }

    pub fn live_input_buffers(&self) -> usize {
        self.state.lock().inputs.len()
    }

    pub fn live_bitstreams(&self) -> usize {
        self.state.lock().bitstreams.len()
    }

    pub fn live_registrations(&self) -> usize {
        self.state.lock().registrations.len()
    }

    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Every picture submitted so far, end of stream included.
    pub fn submitted_pictures(&self) -> Vec<PicParams> {
        self.state.lock().pictures.clone()
    }

    pub fn reconfigurations(&self) -> Vec<ReconfigureParams> {
        self.state.lock().reconfigures.clone()
    }

    /// Parameters the encoder currently runs with.
    pub fn active_params(&self, encoder: EncoderHandle) -> Option<InitializeParams> {
        self.state
            .lock()
            .encoders
            .get(&encoder.0)
            .and_then(|e| e.initialized.clone())
    }

    fn picture_type(params: &InitializeParams, index: u64, flags: PicFlags) -> DevicePictureType {
        let gop = params.gop_length.max(1) as u64;
        let fip = params.frame_interval_p.max(1) as u64;

        if index == 0 || flags.contains(PicFlags::FORCE_IDR) || index % gop == 0 {
            DevicePictureType::Idr
        } else if flags.contains(PicFlags::FORCE_INTRA) || params.frame_interval_p == 0 {
            DevicePictureType::I
        } else if fip <= 1 || (index % gop) % fip == 0 {
            DevicePictureType::P
        } else {
            DevicePictureType::B
        }
    }

    fn picture_qp(params: &InitializeParams, picture_type: DevicePictureType) -> u32 {
        let rc = &params.rate_control;
        let triple = if rc.mode == RateControlMode::ConstQp {
            rc.const_qp
        } else if rc.enable_initial_qp {
            rc.initial_qp
        } else {
            QpTriple::uniform(26)
        };
        match picture_type {
            DevicePictureType::Idr | DevicePictureType::I => triple.intra,
            DevicePictureType::B | DevicePictureType::Bi => triple.inter_b,
            _ => triple.inter_p,
        }
    }

    /// Writes every pending picture of `encoder` into its bitstream buffer.
    fn complete_pending(state: &mut State, encoder: u64) {
        let Some(enc) = state.encoders.get_mut(&encoder) else {
            return;
        };
        let Some(params) = enc.initialized.clone() else {
            return;
        };

        let pending: Vec<PendingPicture> = enc.pending.drain(..).collect();
        for picture in pending {
            let index = enc.frame_index;
            enc.frame_index += 1;

            let picture_type = state
                .picture_type_override
                .unwrap_or_else(|| Self::picture_type(&params, index, picture.flags));
            let qp = Self::picture_qp(&params, picture_type);

            let Some(bs) = state.bitstreams.get_mut(&picture.output) else {
                continue;
            };
            let mut payload = Vec::with_capacity(12 + picture.echo.len());
            payload.extend_from_slice(PAYLOAD_MAGIC);
            payload.extend_from_slice(&index.to_le_bytes());
            payload.extend_from_slice(&picture.echo);

            let len = payload.len().min(bs.data.len());
            bs.data[..len].copy_from_slice(&payload[..len]);
            bs.len = len;
            bs.picture_type = picture_type;
            bs.timestamp = picture.timestamp;
            bs.qp = qp;
            bs.state = BitstreamState::Complete;
        }
    }
}

/// Decoded view of a loopback payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackPayload {
    pub index: u64,
    pub echo: Vec<u8>,
}

impl LoopbackPayload {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 12 || &data[..4] != PAYLOAD_MAGIC {
            return None;
        }
        let mut index = [0u8; 8];
        index.copy_from_slice(&data[4..12]);
        Some(Self {
            index: u64::from_le_bytes(index),
            echo: data[12..].to_vec(),
        })
    }
}

impl EncoderDriver for LoopbackDriver {
    fn api_version(&self) -> DriverResult<u32> {
        self.state.lock().enter(DriverCall::ApiVersion)?;
        Ok(self.config.api_version)
    }

    fn device_count(&self) -> DriverResult<usize> {
        self.state.lock().enter(DriverCall::DeviceCount)?;
        Ok(self.config.devices.len())
    }

    fn device_info(&self, index: usize) -> DriverResult<DeviceInfo> {
        self.state.lock().enter(DriverCall::DeviceInfo)?;
        self.config
            .devices
            .get(index)
            .cloned()
            .ok_or(DriverStatus::DeviceNotExist)
    }

    fn create_context(&self, index: usize) -> DriverResult<DeviceContext> {
        let mut state = self.state.lock();
        state.enter(DriverCall::CreateContext)?;
        if index >= self.config.devices.len() {
            return Err(DriverStatus::DeviceNotExist);
        }
        let handle = state.handle();
        state.contexts.insert(handle);
        Ok(DeviceContext(handle))
    }

    fn destroy_context(&self, context: DeviceContext) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::DestroyContext)?;
        if !state.contexts.remove(&context.0) {
            return Err(DriverStatus::InvalidDevice);
        }
        Ok(())
    }

    fn push_context(&self, context: DeviceContext) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::PushContext)?;
        if !state.contexts.contains(&context.0) {
            return Err(DriverStatus::InvalidDevice);
        }
        state.context_stack.push(context.0);
        Ok(())
    }

    fn pop_context(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::PopContext)?;
        state
            .context_stack
            .pop()
            .map(|_| ())
            .ok_or(DriverStatus::InvalidCall)
    }

    fn open_session(&self, context: DeviceContext) -> DriverResult<EncoderHandle> {
        let mut state = self.state.lock();
        state.enter(DriverCall::OpenSession)?;
        if !state.contexts.contains(&context.0) {
            return Err(DriverStatus::InvalidDevice);
        }
        let handle = state.handle();
        state.encoders.insert(handle, EncoderState::default());
        Ok(EncoderHandle(handle))
    }

    fn supported_codecs(&self, encoder: EncoderHandle) -> DriverResult<Vec<Codec>> {
        let mut state = self.state.lock();
        state.enter(DriverCall::SupportedCodecs)?;
        state.encoder(encoder)?;
        Ok(self.config.codecs.clone())
    }

    fn query_cap(&self, encoder: EncoderHandle, _codec: Codec, cap: Cap) -> DriverResult<i32> {
        let mut state = self.state.lock();
        state.enter(DriverCall::QueryCap)?;
        state.encoder(encoder)?;
        self.config
            .caps
            .get(&cap)
            .copied()
            .ok_or(DriverStatus::UnsupportedParam)
    }

    fn preset_config(
        &self,
        encoder: EncoderHandle,
        codec: Codec,
        _preset: Preset,
        _tuning: Tuning,
    ) -> DriverResult<PresetConfig> {
        let mut state = self.state.lock();
        state.enter(DriverCall::PresetConfig)?;
        state.encoder(encoder)?;
        if !self.config.codecs.contains(&codec) {
            return Err(DriverStatus::UnsupportedParam);
        }
        Ok(self.config.preset.clone())
    }

    fn initialize(&self, encoder: EncoderHandle, params: &InitializeParams) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::Initialize)?;
        if params.width == 0 || params.height == 0 {
            return Err(state.fail(DriverStatus::InvalidParam, "zero encode size"));
        }
        let enc = state.encoder(encoder)?;
        enc.initialized = Some(params.clone());
        Ok(())
    }

    fn create_input_buffer(
        &self,
        encoder: EncoderHandle,
        width: u32,
        height: u32,
        format: BufferFormat,
    ) -> DriverResult<InputBufferHandle> {
        let mut state = self.state.lock();
        state.enter(DriverCall::CreateInputBuffer)?;
        state.encoder(encoder)?;

        let align = self.config.pitch_alignment.max(1);
        let pitch = (width as usize * bytes_per_sample(format)).div_ceil(align) * align;
        let len = pitch * buffer_rows(format, height as usize);

        let handle = state.handle();
        state.inputs.insert(
            handle,
            InputBuffer {
                encoder: encoder.0,
                data: vec![0u8; len].into_boxed_slice(),
                pitch,
                locked: false,
            },
        );
        Ok(InputBufferHandle(handle))
    }

    fn destroy_input_buffer(
        &self,
        encoder: EncoderHandle,
        buffer: InputBufferHandle,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::DestroyInputBuffer)?;
        match state.inputs.get(&buffer.0) {
            Some(input) if input.encoder == encoder.0 => {
                state.inputs.remove(&buffer.0);
                Ok(())
            }
            _ => Err(DriverStatus::InvalidPtr),
        }
    }

    fn create_bitstream_buffer(&self, encoder: EncoderHandle) -> DriverResult<BitstreamHandle> {
        let mut state = self.state.lock();
        state.enter(DriverCall::CreateBitstreamBuffer)?;
        state.encoder(encoder)?;
        let handle = state.handle();
        state.bitstreams.insert(
            handle,
            Bitstream {
                encoder: encoder.0,
                data: vec![0u8; 12 + ECHO_BYTES].into_boxed_slice(),
                len: 0,
                picture_type: DevicePictureType::P,
                timestamp: 0,
                qp: 0,
                state: BitstreamState::Idle,
            },
        );
        Ok(BitstreamHandle(handle))
    }

    fn destroy_bitstream_buffer(
        &self,
        encoder: EncoderHandle,
        buffer: BitstreamHandle,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::DestroyBitstreamBuffer)?;
        match state.bitstreams.get(&buffer.0) {
            Some(bs) if bs.encoder == encoder.0 => {
                state.bitstreams.remove(&buffer.0);
                Ok(())
            }
            _ => Err(DriverStatus::InvalidPtr),
        }
    }

    fn lock_input_buffer(
        &self,
        encoder: EncoderHandle,
        buffer: InputBufferHandle,
    ) -> DriverResult<LockedInput> {
        let mut state = self.state.lock();
        state.enter(DriverCall::LockInputBuffer)?;
        let input = state
            .inputs
            .get_mut(&buffer.0)
            .filter(|i| i.encoder == encoder.0)
            .ok_or(DriverStatus::InvalidPtr)?;
        if input.locked {
            return Err(DriverStatus::LockBusy);
        }
        input.locked = true;
        Ok(LockedInput {
            ptr: input.data.as_mut_ptr(),
            len: input.data.len(),
            pitch: input.pitch,
        })
    }

    fn unlock_input_buffer(
        &self,
        encoder: EncoderHandle,
        buffer: InputBufferHandle,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::UnlockInputBuffer)?;
        let input = state
            .inputs
            .get_mut(&buffer.0)
            .filter(|i| i.encoder == encoder.0)
            .ok_or(DriverStatus::InvalidPtr)?;
        if !input.locked {
            return Err(DriverStatus::InvalidCall);
        }
        input.locked = false;
        Ok(())
    }

    fn lock_bitstream(
        &self,
        encoder: EncoderHandle,
        buffer: BitstreamHandle,
    ) -> DriverResult<LockedBitstream> {
        let mut state = self.state.lock();
        state.enter(DriverCall::LockBitstream)?;
        let bs = state
            .bitstreams
            .get_mut(&buffer.0)
            .filter(|b| b.encoder == encoder.0)
            .ok_or(DriverStatus::InvalidPtr)?;
        match bs.state {
            BitstreamState::Complete => {}
            BitstreamState::Locked => return Err(DriverStatus::LockBusy),
            BitstreamState::Idle | BitstreamState::Pending => {
                return Err(DriverStatus::InvalidCall);
            }
        }
        bs.state = BitstreamState::Locked;
        Ok(LockedBitstream {
            ptr: bs.data.as_ptr(),
            len: bs.len,
            picture_type: bs.picture_type,
            output_timestamp: bs.timestamp,
            frame_avg_qp: bs.qp,
        })
    }

    fn unlock_bitstream(
        &self,
        encoder: EncoderHandle,
        buffer: BitstreamHandle,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::UnlockBitstream)?;
        let bs = state
            .bitstreams
            .get_mut(&buffer.0)
            .filter(|b| b.encoder == encoder.0)
            .ok_or(DriverStatus::InvalidPtr)?;
        if bs.state != BitstreamState::Locked {
            return Err(DriverStatus::InvalidCall);
        }
        bs.state = BitstreamState::Idle;
        Ok(())
    }

    fn register_resource(
        &self,
        encoder: EncoderHandle,
        resource: &RegisterResource,
    ) -> DriverResult<RegistrationHandle> {
        let mut state = self.state.lock();
        state.enter(DriverCall::RegisterResource)?;
        state.encoder(encoder)?;
        if resource.native == 0 {
            return Err(state.fail(DriverStatus::ResourceRegisterFailed, "null resource"));
        }
        let handle = state.handle();
        state.registrations.insert(
            handle,
            Registration {
                encoder: encoder.0,
                native: resource.native,
                format: resource.format,
                mapping: None,
            },
        );
        Ok(RegistrationHandle(handle))
    }

    fn unregister_resource(
        &self,
        encoder: EncoderHandle,
        registration: RegistrationHandle,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::UnregisterResource)?;
        match state.registrations.get(&registration.0) {
            Some(reg) if reg.encoder == encoder.0 => {
                if reg.mapping.is_some() {
                    return Err(state.fail(DriverStatus::InvalidCall, "resource still mapped"));
                }
                state.registrations.remove(&registration.0);
                Ok(())
            }
            _ => Err(DriverStatus::ResourceNotRegistered),
        }
    }

    fn map_input_resource(
        &self,
        encoder: EncoderHandle,
        registration: RegistrationHandle,
    ) -> DriverResult<MappedInput> {
        let mut state = self.state.lock();
        state.enter(DriverCall::MapInputResource)?;
        let handle = state.handle();
        let reg = state
            .registrations
            .get_mut(&registration.0)
            .filter(|r| r.encoder == encoder.0)
            .ok_or(DriverStatus::ResourceNotRegistered)?;
        if reg.mapping.is_some() {
            return Err(DriverStatus::MapFailed);
        }
        reg.mapping = Some(handle);
        let format = reg.format;
        state.mappings.insert(handle, registration.0);
        Ok(MappedInput {
            handle: MappedHandle(handle),
            format,
        })
    }

    fn unmap_input_resource(
        &self,
        encoder: EncoderHandle,
        mapped: MappedHandle,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::UnmapInputResource)?;
        let reg_handle = state
            .mappings
            .get(&mapped.0)
            .copied()
            .ok_or(DriverStatus::ResourceNotMapped)?;
        let reg = state
            .registrations
            .get_mut(&reg_handle)
            .filter(|r| r.encoder == encoder.0)
            .ok_or(DriverStatus::ResourceNotRegistered)?;
        reg.mapping = None;
        state.mappings.remove(&mapped.0);
        Ok(())
    }

    fn encode_picture(&self, encoder: EncoderHandle, params: &PicParams) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::EncodePicture)?;
        state.pictures.push(params.clone());

        let initialized = state.encoder(encoder)?.initialized.is_some();
        if !initialized {
            return Err(DriverStatus::EncoderNotInitialized);
        }

        if params.flags.contains(PicFlags::EOS) {
            Self::complete_pending(&mut state, encoder.0);
            return Ok(());
        }

        let echo = match params.input {
            Some(PictureInput::Buffer(buffer)) => {
                let lookup = state
                    .inputs
                    .get(&buffer.0)
                    .map(|i| (i.locked, i.data[..ECHO_BYTES.min(i.data.len())].to_vec()));
                match lookup {
                    Some((false, echo)) => echo,
                    Some((true, _)) => {
                        return Err(state.fail(DriverStatus::LockBusy, "input still locked"));
                    }
                    None => return Err(state.fail(DriverStatus::InvalidParam, "unknown input")),
                }
            }
            Some(PictureInput::Mapped(mapped)) => {
                let native = state
                    .mappings
                    .get(&mapped.0)
                    .and_then(|reg| state.registrations.get(reg))
                    .map(|reg| reg.native);
                match native {
                    Some(native) => native.to_le_bytes().to_vec(),
                    None => {
                        return Err(state.fail(DriverStatus::ResourceNotMapped, "input not mapped"));
                    }
                }
            }
            None => return Err(state.fail(DriverStatus::InvalidParam, "missing input")),
        };

        let output = params
            .output
            .ok_or(DriverStatus::InvalidParam)?
            .0;
        match state.bitstreams.get(&output).map(|b| b.state) {
            Some(BitstreamState::Idle) => {}
            Some(_) => return Err(state.fail(DriverStatus::EncoderBusy, "output in use")),
            None => return Err(state.fail(DriverStatus::InvalidParam, "unknown output")),
        }
        if let Some(bs) = state.bitstreams.get_mut(&output) {
            bs.state = BitstreamState::Pending;
        }

        let latency = self.config.completion_latency;
        let enc = state.encoder(encoder)?;
        enc.pending.push_back(PendingPicture {
            output,
            timestamp: params.timestamp,
            flags: params.flags,
            echo,
        });

        if enc.pending.len() > latency {
            Self::complete_pending(&mut state, encoder.0);
            Ok(())
        } else {
            Err(DriverStatus::NeedMoreInput)
        }
    }

    fn sequence_params(&self, encoder: EncoderHandle) -> DriverResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.enter(DriverCall::SequenceParams)?;
        if state.encoder(encoder)?.initialized.is_none() {
            return Err(DriverStatus::EncoderNotInitialized);
        }
        Ok(self.config.sequence_header.clone())
    }

    fn reconfigure(&self, encoder: EncoderHandle, params: &ReconfigureParams) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::Reconfigure)?;
        let enc = state.encoder(encoder)?;
        if enc.initialized.is_none() {
            return Err(DriverStatus::EncoderNotInitialized);
        }
        enc.initialized = Some(params.params.clone());
        state.reconfigures.push(params.clone());
        Ok(())
    }

    fn last_error(&self, _encoder: EncoderHandle) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    fn destroy_encoder(&self, encoder: EncoderHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(DriverCall::DestroyEncoder)?;
        state
            .encoders
            .remove(&encoder.0)
            .map(|_| ())
            .ok_or(DriverStatus::InvalidEncoderDevice)
    }
}
