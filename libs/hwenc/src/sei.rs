// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Supplemental enhancement information payloads attached to pictures.

use crate::error::{EncodeError, Result};
use crate::frame::Timecode;

/// Registered user data (ITU-T T.35), carries A/53 captions.
pub const SEI_TYPE_USER_DATA_REGISTERED: u32 = 4;
pub const SEI_TYPE_TIME_CODE: u32 = 136;

/// Clock timestamps a time code SEI can carry.
pub const MAX_CLOCK_TIMESTAMPS: usize = 3;

const MAX_CC_COUNT: usize = 0x1f;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SeiPayload {
    pub payload_type: u32,
    pub data: Vec<u8>,
}

/// MSB-first bit packer.
struct BitWriter {
    data: Vec<u8>,
    bit_pos: u8,
}

impl BitWriter {
    fn with_capacity(bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(bytes),
            bit_pos: 0,
        }
    }

    fn write_bit(&mut self, bit: bool) {
        if self.bit_pos == 0 {
            self.data.push(0);
        }
        if bit {
            if let Some(last) = self.data.last_mut() {
                *last |= 1 << (7 - self.bit_pos);
            }
        }
        self.bit_pos = (self.bit_pos + 1) % 8;
    }

    fn write_bits(&mut self, value: u32, n: u8) {
        for i in (0..n).rev() {
            self.write_bit((value >> i) & 1 != 0);
        }
    }

    /// Pads the last byte with zero bits.
    fn finish(self) -> Vec<u8> {
        self.data
    }
}

/// Wraps CEA-708 caption triplets in an ATSC A/53 user data payload.
pub fn a53_captions(cc_data: &[u8]) -> Result<SeiPayload> {
    if cc_data.is_empty() || cc_data.len() % 3 != 0 {
        return Err(EncodeError::Configuration(format!(
            "closed caption data of {} bytes is not a whole number of triplets",
            cc_data.len()
        )));
    }
    let cc_count = cc_data.len() / 3;
    if cc_count > MAX_CC_COUNT {
        return Err(EncodeError::Configuration(format!(
            "{} caption triplets exceed the limit of {}",
            cc_count, MAX_CC_COUNT
        )));
    }

    let mut data = Vec::with_capacity(cc_data.len() + 11);
    // T.35 country code (USA), ATSC provider code
    data.extend_from_slice(&[0xb5, 0x00, 0x31]);
    data.extend_from_slice(b"GA94");
    // cc_data user data type
    data.push(3);
    // process_cc_data_flag set
    data.push((cc_count as u8 & 0x1f) | 0x40);
    // em_data
    data.push(0);
    data.extend_from_slice(cc_data);
    data.push(0xff);

    Ok(SeiPayload {
        payload_type: SEI_TYPE_USER_DATA_REGISTERED,
        data,
    })
}

/// Packs up to three SMPTE 12M timecodes into a time code payload.
pub fn smpte_timecode(timecodes: &[Timecode]) -> Result<SeiPayload> {
    if timecodes.is_empty() {
        return Err(EncodeError::Configuration("no timecodes to pack".into()));
    }
    if timecodes.len() > MAX_CLOCK_TIMESTAMPS {
        tracing::warn!(
            "Frame carries {} timecodes, only the first {} are sent",
            timecodes.len(),
            MAX_CLOCK_TIMESTAMPS
        );
    }
    let timecodes = &timecodes[..timecodes.len().min(MAX_CLOCK_TIMESTAMPS)];

    let mut bits = BitWriter::with_capacity(1 + timecodes.len() * 6);
    bits.write_bits(timecodes.len() as u32, 2);
    for tc in timecodes {
        bits.write_bit(true); // clock_timestamp_flag
        bits.write_bit(true); // units_field_based_flag
        bits.write_bits(0, 5); // counting_type
        bits.write_bit(true); // full_timestamp_flag
        bits.write_bit(false); // discontinuity_flag
        bits.write_bit(tc.drop_frame);
        bits.write_bits(tc.frames as u32, 9);
        bits.write_bits(tc.seconds as u32, 6);
        bits.write_bits(tc.minutes as u32, 6);
        bits.write_bits(tc.hours as u32, 5);
        bits.write_bits(0, 5); // time_offset_length
    }

    Ok(SeiPayload {
        payload_type: SEI_TYPE_TIME_CODE,
        data: bits.finish(),
    })
}
