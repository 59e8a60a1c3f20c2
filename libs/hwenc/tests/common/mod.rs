// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use hwenc::driver::ResourceType;
use hwenc::{DrainOutcome, EncodedPacket, EncoderConfig, ExternalFrame, Frame, PixelFormat, Plane};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 32;

/// Installs a fmt subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hwenc=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Small NV12 host-input configuration.
pub fn nv12_config() -> EncoderConfig {
    EncoderConfig::new(WIDTH, HEIGHT).with_pixel_format(PixelFormat::Nv12)
}

pub fn nv12_frame(pts: i64, fill: u8) -> Frame {
    let luma = (WIDTH * HEIGHT) as usize;
    Frame::host(
        vec![
            Plane::new(vec![fill; luma], WIDTH as usize),
            Plane::new(vec![fill; luma / 2], WIDTH as usize),
        ],
        pts,
    )
}

pub fn device_frame(pts: i64, native: u64) -> Frame {
    Frame::external(
        ExternalFrame {
            resource_type: ResourceType::DevicePointer,
            native,
            sub_index: 0,
            width: WIDTH,
            height: HEIGHT,
            pitch: WIDTH,
            sw_format: PixelFormat::Nv12,
        },
        pts,
    )
}

pub fn expect_packet(outcome: DrainOutcome) -> EncodedPacket {
    match outcome {
        DrainOutcome::Packet(packet) => packet,
        other => panic!("expected a packet, got {:?}", other),
    }
}
