// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Configuration files driving a session.

mod common;

use std::sync::Arc;

use hwenc::{
    Codec, EncodeError, EncodeSession, EncoderConfig, LoopbackDriver, PixelFormat, Preset,
    Profile, RateControlMode, Tuning,
};

const CONFIG: &str = r#"
codec = "hevc"
width = 64
height = 32
pixel_format = "p010"
preset = "slow"
gop_size = 48
max_b_frames = 3
global_header = true

[rate_control]
mode = "cbr"
bitrate = 3000000
"#;

#[test]
fn test_load_config_file_and_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("encoder.toml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = EncoderConfig::load(&path).unwrap();
    assert_eq!(config.codec, Codec::Hevc);
    assert_eq!(config.pixel_format, PixelFormat::P010);
    assert_eq!(config.preset, Preset::Slow);
    assert_eq!(config.tuning, Tuning::HighQuality);
    assert_eq!(config.frame_rate_num, 30);

    let driver = Arc::new(LoopbackDriver::default());
    let session = EncodeSession::open(driver.clone(), config).unwrap();

    let params = session.encoder_params();
    assert_eq!(params.preset, Preset::P7);
    assert_eq!(params.gop_length, 48);
    assert_eq!(params.frame_interval_p, 4);
    assert_eq!(params.rate_control.mode, RateControlMode::Cbr);
    assert_eq!(params.codec_config.profile, Some(Profile::Main10));
    assert_eq!(params.codec_config.bit_depth_minus8, 2);

    let props = session.properties();
    assert_eq!(props.average_bitrate, 3_000_000);
    assert_eq!(props.buffer_size, 6_000_000);
    assert!(session.sequence_header().is_some());
    session.close().unwrap();
}

#[test]
fn test_saved_config_round_trips_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("saved.toml");

    let config = common::nv12_config()
        .with_gop_size(60)
        .with_b_frames(2)
        .with_bitrate(1_500_000);
    std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

    assert_eq!(EncoderConfig::load(&path).unwrap(), config);
}

#[test]
fn test_missing_file_names_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    match EncoderConfig::load(&path) {
        Err(EncodeError::Configuration(msg)) => assert!(msg.contains("absent.toml")),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_invalid_values_rejected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "max_b_frames = 9\n").unwrap();

    assert!(matches!(
        EncoderConfig::load(&path),
        Err(EncodeError::Configuration(_))
    ));
}
