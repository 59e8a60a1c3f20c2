// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Input frames and output packets.

use bytes::Bytes;

use crate::driver::ResourceType;
use crate::format::PixelFormat;

/// One plane of a host frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Bytes,
    pub stride: usize,
}

impl Plane {
    pub fn new(data: impl Into<Bytes>, stride: usize) -> Self {
        Self {
            data: data.into(),
            stride,
        }
    }
}

/// Frame living in hardware memory owned by another component.
///
/// `native` and `sub_index` identify the memory; frames sharing both are the
/// same resource and reuse one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalFrame {
    pub resource_type: ResourceType,
    pub native: u64,
    pub sub_index: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub sw_format: PixelFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Host(Vec<Plane>),
    External(ExternalFrame),
}

/// Picture type hint supplied by the caller, or reported for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureType {
    #[default]
    None,
    I,
    P,
    B,
    Bi,
}

/// SMPTE 12M timecode attached to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timecode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
    pub drop_frame: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: FramePayload,
    pub pts: i64,
    pub picture_type: PictureType,
    pub top_field_first: bool,
    /// Raw CEA-708 triplets (3 bytes each).
    pub closed_captions: Option<Bytes>,
    pub timecodes: Vec<Timecode>,
}

impl Frame {
    pub fn host(planes: Vec<Plane>, pts: i64) -> Self {
        Self {
            payload: FramePayload::Host(planes),
            pts,
            picture_type: PictureType::None,
            top_field_first: false,
            closed_captions: None,
            timecodes: Vec::new(),
        }
    }

    pub fn external(frame: ExternalFrame, pts: i64) -> Self {
        Self {
            payload: FramePayload::External(frame),
            ..Self::host(Vec::new(), pts)
        }
    }

    pub fn with_picture_type(mut self, picture_type: PictureType) -> Self {
        self.picture_type = picture_type;
        self
    }

    pub fn with_top_field_first(mut self, tff: bool) -> Self {
        self.top_field_first = tff;
        self
    }

    pub fn with_closed_captions(mut self, cc: impl Into<Bytes>) -> Self {
        self.closed_captions = Some(cc.into());
        self
    }

    pub fn with_timecodes(mut self, timecodes: Vec<Timecode>) -> Self {
        self.timecodes = timecodes;
        self
    }
}

/// Per-packet statistics reported by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderStats {
    pub average_qp: u32,
    /// Average QP scaled to lambda units.
    pub quality: i64,
    pub picture_type: PictureType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub keyframe: bool,
    pub stats: EncoderStats,
}
