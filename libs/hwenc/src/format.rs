// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Host pixel formats, their device buffer formats and the plane copy used
//! when uploading host frames into locked input buffers.

use serde::{Deserialize, Serialize};

use crate::error::{EncodeError, Result};
use crate::frame::Plane;

/// Software pixel format of host frames (or of the frames behind an
/// external resource).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    #[default]
    Yuv420p,
    Nv12,
    P010,
    Yuv444p,
    P016,
    Yuv444p16,
    Rgb0,
    Bgr0,
}

/// Buffer format understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferFormat {
    Yv12,
    Nv12,
    Yuv420_10Bit,
    Yuv444,
    Yuv444_10Bit,
    Argb,
    Abgr,
}

/// Bytes per row and number of rows of one plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaneGeometry {
    row_bytes: usize,
    rows: usize,
    /// Destination pitch divisor relative to the luma pitch.
    pitch_shift: u32,
}

impl PixelFormat {
    pub fn buffer_format(self) -> BufferFormat {
        match self {
            PixelFormat::Yuv420p => BufferFormat::Yv12,
            PixelFormat::Nv12 => BufferFormat::Nv12,
            PixelFormat::P010 | PixelFormat::P016 => BufferFormat::Yuv420_10Bit,
            PixelFormat::Yuv444p => BufferFormat::Yuv444,
            PixelFormat::Yuv444p16 => BufferFormat::Yuv444_10Bit,
            PixelFormat::Rgb0 => BufferFormat::Argb,
            PixelFormat::Bgr0 => BufferFormat::Abgr,
        }
    }

    pub fn is_yuv444(self) -> bool {
        matches!(self, PixelFormat::Yuv444p | PixelFormat::Yuv444p16)
    }

    pub fn is_10bit(self) -> bool {
        matches!(
            self,
            PixelFormat::P010 | PixelFormat::P016 | PixelFormat::Yuv444p16
        )
    }

    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Yuv420p | PixelFormat::Yuv444p | PixelFormat::Yuv444p16 => 3,
            PixelFormat::Nv12 | PixelFormat::P010 | PixelFormat::P016 => 2,
            PixelFormat::Rgb0 | PixelFormat::Bgr0 => 1,
        }
    }

    fn geometry(self, width: usize, height: usize) -> Vec<PlaneGeometry> {
        let cw = width.div_ceil(2);
        let ch = height.div_ceil(2);
        let full = |row_bytes| PlaneGeometry {
            row_bytes,
            rows: height,
            pitch_shift: 0,
        };

        match self {
            PixelFormat::Yuv420p => vec![
                full(width),
                PlaneGeometry {
                    row_bytes: cw,
                    rows: ch,
                    pitch_shift: 1,
                },
                PlaneGeometry {
                    row_bytes: cw,
                    rows: ch,
                    pitch_shift: 1,
                },
            ],
            PixelFormat::Nv12 => vec![
                full(width),
                PlaneGeometry {
                    row_bytes: cw * 2,
                    rows: ch,
                    pitch_shift: 0,
                },
            ],
            PixelFormat::P010 | PixelFormat::P016 => vec![
                full(width * 2),
                PlaneGeometry {
                    row_bytes: cw * 4,
                    rows: ch,
                    pitch_shift: 0,
                },
            ],
            PixelFormat::Yuv444p => vec![full(width); 3],
            PixelFormat::Yuv444p16 => vec![full(width * 2); 3],
            PixelFormat::Rgb0 | PixelFormat::Bgr0 => vec![full(width * 4)],
        }
    }
}

/// Bytes a locked input buffer needs for a frame at the given pitch.
pub fn required_buffer_len(format: PixelFormat, height: u32, pitch: usize) -> usize {
    format
        .geometry(0, height as usize)
        .iter()
        .map(|g| (pitch >> g.pitch_shift) * g.rows)
        .sum()
}

/// Copies host planes into a locked input buffer laid out plane after
/// plane at `pitch`. For planar 4:2:0 the chroma pitch is halved and the
/// chroma planes are stored V before U.
pub fn copy_planes(
    format: PixelFormat,
    width: u32,
    height: u32,
    src: &[Plane],
    dst: &mut [u8],
    pitch: usize,
) -> Result<()> {
    let geometry = format.geometry(width as usize, height as usize);
    if src.len() < geometry.len() {
        return Err(EncodeError::Configuration(format!(
            "{:?} frame needs {} planes, got {}",
            format,
            geometry.len(),
            src.len()
        )));
    }

    // Destination offset of each plane in buffer order.
    let mut offsets = Vec::with_capacity(geometry.len());
    let mut offset = 0usize;
    for g in &geometry {
        offsets.push(offset);
        offset += (pitch >> g.pitch_shift) * g.rows;
    }
    if offset > dst.len() {
        return Err(EncodeError::Internal(format!(
            "locked input buffer holds {} bytes, frame needs {}",
            dst.len(),
            offset
        )));
    }
    if format == PixelFormat::Yuv420p {
        offsets.swap(1, 2);
    }

    for (index, g) in geometry.iter().enumerate() {
        let plane = &src[index];
        let dst_pitch = pitch >> g.pitch_shift;
        if g.row_bytes > dst_pitch {
            return Err(EncodeError::Internal(format!(
                "plane {} row of {} bytes exceeds pitch {}",
                index, g.row_bytes, dst_pitch
            )));
        }
        if g.rows > 0 && plane.stride < g.row_bytes {
            return Err(EncodeError::Configuration(format!(
                "plane {} stride {} is smaller than row size {}",
                index, plane.stride, g.row_bytes
            )));
        }
        let needed = g.rows.saturating_sub(1) * plane.stride + g.row_bytes;
        if g.rows > 0 && plane.data.len() < needed {
            return Err(EncodeError::Configuration(format!(
                "plane {} holds {} bytes, needs {}",
                index,
                plane.data.len(),
                needed
            )));
        }

        for row in 0..g.rows {
            let s = row * plane.stride;
            let d = offsets[index] + row * dst_pitch;
            dst[d..d + g.row_bytes].copy_from_slice(&plane.data[s..s + g.row_bytes]);
        }
    }

    Ok(())
}
