// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Submit/drain state machine.
//!
//! Surfaces cycle `Free -> Submitted -> Ready -> Free`. A submission that the
//! device accepts (or answers with need-more-input) parks its surface as
//! submitted and queues the frame's timestamp; once the device reports
//! success everything submitted becomes ready. Draining holds output back
//! until `async_depth` pictures are in flight, so the reorder delay of
//! B-frames and lookahead is covered by the timestamp queue.

use bytes::Bytes;

use crate::context::ContextGuard;
use crate::driver::{
    DeviceContext, DevicePictureType, DriverStatus, EncoderDriver, EncoderHandle,
    InitializeParams, PicFlags, PicParams, PictureInput, PictureStructure, RegisterResource,
};
use crate::error::{EncodeError, Result};
use crate::format::PixelFormat;
use crate::frame::{EncodedPacket, EncoderStats, Frame, FramePayload, PictureType};
use crate::pool::SurfacePool;
use crate::reconfig::{self, StreamHints};
use crate::registry::RegistrationCache;
use crate::sei;

/// Lambda units per QP step.
const QP2LAMBDA: i64 = 118;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// No free surface; drain packets and retry.
    WouldBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Packet(EncodedPacket),
    WouldBlock,
    EndOfStream,
}

/// Per-session settings the pipeline consults on every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub pixel_format: PixelFormat,
    pub frame_interval_p: i32,
    pub ticks_per_frame: u32,
    pub async_depth: u32,
    pub interlaced: bool,
    pub forced_idr: Option<bool>,
    pub a53_cc: bool,
    pub s12m_tc: bool,
    pub dynamic_bitrate: bool,
}

pub struct Pipeline {
    context: DeviceContext,
    encoder: EncoderHandle,
    pool: SurfacePool,
    cache: RegistrationCache,
    settings: PipelineSettings,
    /// Parameters the encoder currently runs with.
    params: InitializeParams,
    hints: StreamHints,
    draining: bool,
}

fn picture_flags(frame: &Frame, forced_idr: Option<bool>) -> PicFlags {
    if frame.picture_type != PictureType::I {
        return PicFlags::empty();
    }
    match forced_idr {
        Some(true) => PicFlags::FORCE_IDR,
        Some(false) => PicFlags::FORCE_INTRA,
        None => PicFlags::empty(),
    }
}

fn picture_structure(frame: &Frame, interlaced: bool) -> PictureStructure {
    if !interlaced {
        PictureStructure::Frame
    } else if frame.top_field_first {
        PictureStructure::FieldTopBottom
    } else {
        PictureStructure::FieldBottomTop
    }
}

impl Pipeline {
    pub fn new(
        context: DeviceContext,
        encoder: EncoderHandle,
        pool: SurfacePool,
        settings: PipelineSettings,
        params: InitializeParams,
        hints: StreamHints,
    ) -> Self {
        Self {
            context,
            encoder,
            pool,
            cache: RegistrationCache::default(),
            settings,
            params,
            hints,
            draining: false,
        }
    }

    pub fn pool(&self) -> &SurfacePool {
        &self.pool
    }

    pub fn cache(&self) -> &RegistrationCache {
        &self.cache
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn params(&self) -> &InitializeParams {
        &self.params
    }

    pub fn hints_mut(&mut self) -> &mut StreamHints {
        &mut self.hints
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Submits a frame, or end of stream when `frame` is `None`.
    pub fn submit(&mut self, driver: &dyn EncoderDriver, frame: Option<&Frame>) -> Result<SubmitOutcome> {
        let Some(frame) = frame else {
            return self.submit_eos(driver);
        };
        if self.draining {
            return Err(EncodeError::InvalidState(
                "frame submitted after end of stream".into(),
            ));
        }

        let Some(index) = self.pool.acquire_input() else {
            return Ok(SubmitOutcome::WouldBlock);
        };

        let guard = match ContextGuard::enter(driver, self.context) {
            Ok(guard) => guard,
            Err(e) => {
                self.pool.release_input(index)?;
                return Err(e);
            }
        };

        let submitted = self.encode_frame(driver, index, frame);
        if submitted.is_err() {
            self.return_surface(driver, index);
        }
        guard.exit()?;
        submitted?;

        Ok(SubmitOutcome::Queued)
    }

    /// Runs with the context current. On error the caller returns the
    /// surface.
    fn encode_frame(&mut self, driver: &dyn EncoderDriver, index: usize, frame: &Frame) -> Result<()> {
        reconfig::maybe_reconfigure(
            driver,
            self.encoder,
            &mut self.params,
            &self.hints,
            self.settings.dynamic_bitrate,
        );

        let input = self.upload(driver, index, frame)?;
        let layout = *self.pool.layout();
        let pitch = self.pool.surface(index).map(|s| s.pitch).unwrap_or_default();
        let (output, format) = match self.pool.surface(index) {
            Some(surface) => (
                surface.bitstream,
                surface.mapping.map(|m| m.mapped.format).unwrap_or(layout.format),
            ),
            None => return Err(EncodeError::Internal(format!("no surface {}", index))),
        };

        let mut params = PicParams {
            input: Some(input),
            output: Some(output),
            width: layout.width,
            height: layout.height,
            pitch: pitch as u32,
            format: Some(format),
            structure: picture_structure(frame, self.settings.interlaced),
            timestamp: frame.pts,
            flags: picture_flags(frame, self.settings.forced_idr),
            sei: Vec::new(),
        };
        self.attach_sei(frame, &mut params);

        let status = driver.encode_picture(self.encoder, &params);
        match status {
            Ok(()) | Err(DriverStatus::NeedMoreInput) => {}
            Err(status) => {
                return Err(EncodeError::from_driver(driver, self.encoder, "EncodePicture", status));
            }
        }

        self.pool.mark_submitted(index)?;
        self.pool.push_timestamp(frame.pts)?;
        if status.is_ok() {
            self.pool.promote_submitted()?;
        }

        tracing::trace!(
            pts = frame.pts,
            submitted = self.pool.submitted_count(),
            ready = self.pool.ready_count(),
            "Submitted surface {}",
            index
        );
        Ok(())
    }

    fn upload(&mut self, driver: &dyn EncoderDriver, index: usize, frame: &Frame) -> Result<PictureInput> {
        let layout = *self.pool.layout();
        match (&frame.payload, layout.external) {
            (FramePayload::Host(planes), false) => {
                self.pool
                    .upload_host(driver, self.encoder, index, self.settings.pixel_format, planes)?;
                let input = self
                    .pool
                    .surface(index)
                    .and_then(|s| s.input)
                    .ok_or_else(|| EncodeError::Internal(format!("surface {} has no input", index)))?;
                Ok(PictureInput::Buffer(input))
            }
            (FramePayload::External(ef), true) => {
                if ef.sw_format != self.settings.pixel_format {
                    return Err(EncodeError::Configuration(format!(
                        "external frame format {:?} does not match session format {:?}",
                        ef.sw_format, self.settings.pixel_format
                    )));
                }
                let resource = RegisterResource {
                    resource_type: ef.resource_type,
                    native: ef.native,
                    sub_index: ef.sub_index,
                    width: ef.width,
                    height: ef.height,
                    pitch: ef.pitch,
                    format: ef.sw_format.buffer_format(),
                };
                let mapping = self.cache.acquire(driver, self.encoder, &resource)?;
                if let Some(surface) = self.pool.surface_mut(index) {
                    surface.mapping = Some(mapping);
                    surface.pitch = ef.pitch as usize;
                }
                Ok(PictureInput::Mapped(mapping.mapped.handle))
            }
            (FramePayload::Host(_), true) => Err(EncodeError::Configuration(
                "host frame submitted to a session configured for external input".into(),
            )),
            (FramePayload::External(_), false) => Err(EncodeError::Configuration(
                "external frame submitted to a session configured for host input".into(),
            )),
        }
    }

    fn attach_sei(&self, frame: &Frame, params: &mut PicParams) {
        if self.settings.a53_cc {
            if let Some(cc) = &frame.closed_captions {
                match sei::a53_captions(cc) {
                    Ok(payload) => params.sei.push(payload),
                    Err(e) => tracing::error!("Skipping closed captions: {}", e),
                }
            }
        }
        if self.settings.s12m_tc && !frame.timecodes.is_empty() {
            match sei::smpte_timecode(&frame.timecodes) {
                Ok(payload) => params.sei.push(payload),
                Err(e) => tracing::error!("Skipping timecode: {}", e),
            }
        }
    }

    /// Gives a surface and its registration reference back after a failed
    /// submission.
    fn return_surface(&mut self, driver: &dyn EncoderDriver, index: usize) {
        let mapping = self.pool.surface_mut(index).and_then(|s| s.mapping.take());
        if let Some(mapping) = mapping {
            if let Err(e) = self.cache.release(driver, self.encoder, mapping.slot) {
                tracing::warn!("{}", e);
            }
        }
        if let Err(e) = self.pool.release_input(index) {
            tracing::warn!("{}", e);
        }
    }

    fn submit_eos(&mut self, driver: &dyn EncoderDriver) -> Result<SubmitOutcome> {
        if self.draining {
            return Ok(SubmitOutcome::Queued);
        }
        self.draining = true;

        let guard = ContextGuard::enter(driver, self.context)?;
        let status = driver.encode_picture(self.encoder, &PicParams::end_of_stream());
        guard.exit()?;

        match status {
            Ok(()) => self.pool.promote_submitted()?,
            Err(DriverStatus::NeedMoreInput) => {}
            Err(status) => {
                return Err(EncodeError::from_driver(driver, self.encoder, "EncodePicture", status));
            }
        }
        tracing::debug!(ready = self.pool.ready_count(), "End of stream submitted");
        Ok(SubmitOutcome::Queued)
    }

    fn output_ready(&self) -> bool {
        let ready = self.pool.ready_count();
        if self.draining {
            return ready > 0;
        }
        let in_flight = ready + self.pool.submitted_count();
        ready > 0 && in_flight >= self.settings.async_depth as usize
    }

    /// Returns the oldest finished packet once the async depth allows it.
    pub fn drain(&mut self, driver: &dyn EncoderDriver) -> Result<DrainOutcome> {
        if !self.output_ready() {
            return Ok(if self.draining {
                DrainOutcome::EndOfStream
            } else {
                DrainOutcome::WouldBlock
            });
        }
        // Nothing is consumed until the context is current.
        let guard = ContextGuard::enter(driver, self.context)?;
        let Some(index) = self.pool.pop_ready() else {
            guard.exit()?;
            return Ok(DrainOutcome::WouldBlock);
        };

        // Exactly one timestamp is consumed per surface, on every path.
        let timestamp = self.pool.pop_timestamp();

        let packet = self.read_output(driver, index, timestamp);
        let unmapped = self.release_mapping(driver, index);
        let freed = self.pool.release_input(index);
        guard.exit()?;

        let packet = packet?;
        unmapped?;
        freed?;
        Ok(DrainOutcome::Packet(packet))
    }

    fn release_mapping(&mut self, driver: &dyn EncoderDriver, index: usize) -> Result<()> {
        let slot = self
            .pool
            .surface(index)
            .and_then(|s| s.mapping.as_ref())
            .map(|m| m.slot);
        if let Some(slot) = slot {
            self.cache.release(driver, self.encoder, slot)?;
            if let Some(surface) = self.pool.surface_mut(index) {
                surface.mapping = None;
            }
        }
        Ok(())
    }

    fn read_output(
        &mut self,
        driver: &dyn EncoderDriver,
        index: usize,
        timestamp: Option<i64>,
    ) -> Result<EncodedPacket> {
        let bitstream = self
            .pool
            .surface(index)
            .map(|s| s.bitstream)
            .ok_or_else(|| EncodeError::Internal(format!("no surface {}", index)))?;

        let locked = driver
            .lock_bitstream(self.encoder, bitstream)
            .map_err(|status| EncodeError::from_driver(driver, self.encoder, "LockBitstream", status))?;
        // SAFETY: the bitstream stays locked until the unlock below.
        let data = Bytes::copy_from_slice(unsafe { locked.as_slice() });
        driver
            .unlock_bitstream(self.encoder, bitstream)
            .map_err(|status| EncodeError::from_driver(driver, self.encoder, "UnlockBitstream", status))?;

        let (picture_type, keyframe) = match locked.picture_type {
            DevicePictureType::Idr => (PictureType::I, true),
            DevicePictureType::I => (PictureType::I, false),
            DevicePictureType::P => (PictureType::P, false),
            DevicePictureType::B => (PictureType::B, false),
            DevicePictureType::Bi => (PictureType::Bi, false),
            other => {
                return Err(EncodeError::Internal(format!(
                    "unknown picture type {:?}",
                    other
                )));
            }
        };

        let timestamp = timestamp
            .ok_or_else(|| EncodeError::Internal("timestamp queue is empty".into()))?;
        let delay = self.settings.frame_interval_p.saturating_sub(1).max(0) as i64;
        let dts = timestamp - delay * self.settings.ticks_per_frame.max(1) as i64;

        let packet = EncodedPacket {
            data,
            pts: locked.output_timestamp,
            dts,
            keyframe,
            stats: EncoderStats {
                average_qp: locked.frame_avg_qp,
                quality: (locked.frame_avg_qp as i64 - 1) * QP2LAMBDA,
                picture_type,
            },
        };
        tracing::trace!(
            pts = packet.pts,
            dts = packet.dts,
            size = packet.data.len(),
            "Drained surface {}",
            index
        );
        Ok(packet)
    }

    /// Ends the stream and returns every remaining packet. Afterwards the
    /// pipeline accepts frames again.
    pub fn flush(&mut self, driver: &dyn EncoderDriver) -> Result<Vec<EncodedPacket>> {
        let result = self.flush_inner(driver);
        self.draining = false;
        // Surfaces still in flight keep their timestamps.
        if self.pool.submitted_count() == 0 && self.pool.ready_count() == 0 {
            self.pool.clear_timestamps();
        }
        result
    }

    fn flush_inner(&mut self, driver: &dyn EncoderDriver) -> Result<Vec<EncodedPacket>> {
        self.submit_eos(driver)?;
        let mut packets = Vec::with_capacity(self.pool.ready_count());
        loop {
            match self.drain(driver)? {
                DrainOutcome::Packet(packet) => packets.push(packet),
                DrainOutcome::WouldBlock | DrainOutcome::EndOfStream => break,
            }
        }
        Ok(packets)
    }

    /// Unmaps and unregisters every external frame and destroys every
    /// surface. All steps run; the first failure is returned.
    pub fn release(&mut self, driver: &dyn EncoderDriver) -> Result<()> {
        let guard = ContextGuard::enter(driver, self.context)?;
        let cleared = self.cache.clear(driver, self.encoder);
        let released = self.pool.release(driver, self.encoder);
        let exited = guard.exit();
        cleared.and(released).and(exited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{
        DriverCall, DriverStatus, LoopbackConfig, LoopbackDriver, LoopbackPayload, ResourceType,
    };
    use crate::format::BufferFormat;
    use crate::frame::{ExternalFrame, Plane, Timecode};
    use crate::pool::SurfaceLayout;
    use crate::sei::{SEI_TYPE_TIME_CODE, SEI_TYPE_USER_DATA_REGISTERED};

    const W: u32 = 64;
    const H: u32 = 32;

    fn settings(async_depth: u32, frame_interval_p: i32) -> PipelineSettings {
        PipelineSettings {
            pixel_format: PixelFormat::Nv12,
            frame_interval_p,
            ticks_per_frame: 1,
            async_depth,
            interlaced: false,
            forced_idr: None,
            a53_cc: true,
            s12m_tc: true,
            dynamic_bitrate: true,
        }
    }

    fn pipeline(
        driver: &LoopbackDriver,
        surfaces: u32,
        settings: PipelineSettings,
        external: bool,
    ) -> Pipeline {
        let ctx = driver.create_context(0).unwrap();
        let enc = driver.open_session(ctx).unwrap();
        let params = InitializeParams {
            width: W,
            height: H,
            dar_width: 2,
            dar_height: 1,
            gop_length: 250,
            frame_interval_p: settings.frame_interval_p,
            ..InitializeParams::default()
        };
        driver.initialize(enc, &params).unwrap();
        let layout = SurfaceLayout {
            width: W,
            height: H,
            format: BufferFormat::Nv12,
            external,
        };
        let pool = SurfacePool::allocate(driver, enc, surfaces, layout).unwrap();
        Pipeline::new(ctx, enc, pool, settings, params, StreamHints::default())
    }

    fn host_frame(pts: i64, fill: u8) -> Frame {
        Frame::host(
            vec![
                Plane::new(vec![fill; (W * H) as usize], W as usize),
                Plane::new(vec![fill; (W * H / 2) as usize], W as usize),
            ],
            pts,
        )
    }

    fn external_frame(pts: i64, native: u64) -> Frame {
        Frame::external(
            ExternalFrame {
                resource_type: ResourceType::DevicePointer,
                native,
                sub_index: 0,
                width: W,
                height: H,
                pitch: W,
                sw_format: PixelFormat::Nv12,
            },
            pts,
        )
    }

    fn expect_packet(outcome: DrainOutcome) -> EncodedPacket {
        match outcome {
            DrainOutcome::Packet(packet) => packet,
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_async_depth_throttles_output() {
        let driver = LoopbackDriver::default();
        let mut p = pipeline(&driver, 8, settings(3, 1), false);

        for pts in 0..2 {
            assert_eq!(p.submit(&driver, Some(&host_frame(pts, 1))).unwrap(), SubmitOutcome::Queued);
            assert_eq!(p.drain(&driver).unwrap(), DrainOutcome::WouldBlock);
        }
        p.submit(&driver, Some(&host_frame(2, 1))).unwrap();
        let packet = expect_packet(p.drain(&driver).unwrap());
        assert_eq!(packet.pts, 0);
        assert!(packet.keyframe);
        assert_eq!(p.drain(&driver).unwrap(), DrainOutcome::WouldBlock);
    }

    #[test]
    fn test_fifo_order_and_dts() {
        let driver = LoopbackDriver::default();
        let mut p = pipeline(&driver, 12, settings(0, 3), false);

        for pts in 0..5 {
            p.submit(&driver, Some(&host_frame(pts * 10, pts as u8))).unwrap();
        }
        for pts in 0..5 {
            let packet = expect_packet(p.drain(&driver).unwrap());
            assert_eq!(packet.pts, pts * 10);
            assert_eq!(packet.dts, pts * 10 - 2);
            let payload = LoopbackPayload::parse(&packet.data).unwrap();
            assert_eq!(payload.index, pts as u64);
            assert_eq!(payload.echo[0], pts as u8);
        }
        assert_eq!(p.pool().free_count(), 12);
    }

    #[test]
    fn test_draining_returns_ready_then_end_of_stream() {
        let driver = LoopbackDriver::default();
        let mut p = pipeline(&driver, 8, settings(7, 1), false);

        for pts in 0..3 {
            p.submit(&driver, Some(&host_frame(pts, 0))).unwrap();
        }
        assert_eq!(p.pool().ready_count(), 3);
        assert_eq!(p.pool().submitted_count(), 0);
        assert_eq!(p.drain(&driver).unwrap(), DrainOutcome::WouldBlock);

        p.submit(&driver, None).unwrap();
        for _ in 0..3 {
            expect_packet(p.drain(&driver).unwrap());
        }
        assert_eq!(p.drain(&driver).unwrap(), DrainOutcome::EndOfStream);
        assert!(matches!(
            p.submit(&driver, Some(&host_frame(9, 0))),
            Err(EncodeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_would_block_without_free_surface() {
        let driver = LoopbackDriver::default();
        let mut p = pipeline(&driver, 4, settings(3, 1), false);
        for pts in 0..4 {
            assert_eq!(p.submit(&driver, Some(&host_frame(pts, 0))).unwrap(), SubmitOutcome::Queued);
        }
        assert_eq!(
            p.submit(&driver, Some(&host_frame(4, 0))).unwrap(),
            SubmitOutcome::WouldBlock
        );
        expect_packet(p.drain(&driver).unwrap());
        assert_eq!(
            p.submit(&driver, Some(&host_frame(4, 0))).unwrap(),
            SubmitOutcome::Queued
        );
    }

    #[test]
    fn test_need_more_input_holds_surfaces_submitted() {
        let driver = LoopbackDriver::new(LoopbackConfig {
            completion_latency: 2,
            ..Default::default()
        });
        let mut p = pipeline(&driver, 8, settings(1, 1), false);

        p.submit(&driver, Some(&host_frame(0, 0))).unwrap();
        p.submit(&driver, Some(&host_frame(1, 0))).unwrap();
        assert_eq!(p.pool().submitted_count(), 2);
        assert_eq!(p.pool().ready_count(), 0);
        assert_eq!(p.drain(&driver).unwrap(), DrainOutcome::WouldBlock);

        p.submit(&driver, Some(&host_frame(2, 0))).unwrap();
        assert_eq!(p.pool().submitted_count(), 0);
        assert_eq!(p.pool().ready_count(), 3);
        assert!(p.pool().ready_count() + p.pool().submitted_count() <= p.pool().len());
    }

    #[test]
    fn test_encode_failure_returns_surface() {
        let driver = LoopbackDriver::default();
        let mut p = pipeline(&driver, 4, settings(3, 1), false);
        driver.fail_next(DriverCall::EncodePicture, DriverStatus::EncoderBusy);

        let err = p.submit(&driver, Some(&host_frame(0, 0))).unwrap_err();
        assert!(matches!(
            err,
            EncodeError::Device {
                status: DriverStatus::EncoderBusy,
                ..
            }
        ));
        assert_eq!(p.pool().free_count(), 4);
        assert_eq!(p.pool().pending_timestamps(), 0);
        assert_eq!(driver.context_depth(), 0);

        // session stays usable
        assert_eq!(p.submit(&driver, Some(&host_frame(1, 0))).unwrap(), SubmitOutcome::Queued);
    }

    #[test]
    fn test_unknown_picture_type_still_consumes_timestamp() {
        let driver = LoopbackDriver::default();
        let mut p = pipeline(&driver, 4, settings(1, 1), false);
        driver.override_picture_type(Some(DevicePictureType::Skipped));

        p.submit(&driver, Some(&host_frame(0, 0))).unwrap();
        assert!(matches!(p.drain(&driver), Err(EncodeError::Internal(_))));
        assert_eq!(p.pool().pending_timestamps(), 0);
        assert_eq!(p.pool().free_count(), 4);
    }

    #[test]
    fn test_picture_flags_and_structure() {
        let driver = LoopbackDriver::default();
        let mut s = settings(1, 1);
        s.forced_idr = Some(false);
        s.interlaced = true;
        let mut p = pipeline(&driver, 4, s, false);

        let frame = host_frame(0, 0)
            .with_picture_type(PictureType::I)
            .with_top_field_first(true);
        p.submit(&driver, Some(&frame)).unwrap();
        p.submit(&driver, Some(&host_frame(1, 0))).unwrap();

        let pictures = driver.submitted_pictures();
        assert_eq!(pictures[0].flags, PicFlags::FORCE_INTRA);
        assert_eq!(pictures[0].structure, PictureStructure::FieldTopBottom);
        assert_eq!(pictures[1].flags, PicFlags::empty());
        assert_eq!(pictures[1].structure, PictureStructure::FieldBottomTop);
        assert_eq!(pictures[0].pitch, 64);
    }

    #[test]
    fn test_forced_idr_on_i_hint() {
        let driver = LoopbackDriver::default();
        let mut s = settings(1, 1);
        s.forced_idr = Some(true);
        let mut p = pipeline(&driver, 4, s, false);

        p.submit(&driver, Some(&host_frame(0, 0))).unwrap();
        expect_packet(p.drain(&driver).unwrap());
        p.submit(&driver, Some(&host_frame(1, 0).with_picture_type(PictureType::I)))
            .unwrap();
        let packet = expect_packet(p.drain(&driver).unwrap());
        assert!(packet.keyframe);
        assert_eq!(driver.submitted_pictures()[1].flags, PicFlags::FORCE_IDR);
    }

    #[test]
    fn test_sei_payloads_attached() {
        let driver = LoopbackDriver::default();
        let mut p = pipeline(&driver, 4, settings(1, 1), false);
        let tc = Timecode {
            hours: 0,
            minutes: 0,
            seconds: 1,
            frames: 2,
            drop_frame: false,
        };
        let frame = host_frame(0, 0)
            .with_closed_captions(vec![0xfc, 0x80, 0x80])
            .with_timecodes(vec![tc]);
        p.submit(&driver, Some(&frame)).unwrap();

        let sei = &driver.submitted_pictures()[0].sei;
        assert_eq!(sei.len(), 2);
        assert_eq!(sei[0].payload_type, SEI_TYPE_USER_DATA_REGISTERED);
        assert_eq!(sei[1].payload_type, SEI_TYPE_TIME_CODE);

        // malformed captions are skipped, the frame still goes out
        let bad = host_frame(1, 0).with_closed_captions(vec![0xfc]);
        p.submit(&driver, Some(&bad)).unwrap();
        assert!(driver.submitted_pictures()[1].sei.is_empty());
    }

    #[test]
    fn test_external_frames_share_registration() {
        let driver = LoopbackDriver::default();
        let mut p = pipeline(&driver, 4, settings(1, 1), true);

        p.submit(&driver, Some(&external_frame(0, 0xdead))).unwrap();
        p.submit(&driver, Some(&external_frame(1, 0xdead))).unwrap();
        assert_eq!(driver.call_count(DriverCall::RegisterResource), 1);
        assert_eq!(driver.live_mappings(), 1);

        let first = expect_packet(p.drain(&driver).unwrap());
        let payload = LoopbackPayload::parse(&first.data).unwrap();
        assert_eq!(payload.echo, 0xdeadu64.to_le_bytes().to_vec());
        assert_eq!(driver.live_mappings(), 1);

        expect_packet(p.drain(&driver).unwrap());
        assert_eq!(driver.live_mappings(), 0);
        assert_eq!(driver.live_registrations(), 1);

        p.release(&driver).unwrap();
        assert_eq!(driver.live_registrations(), 0);
        assert_eq!(driver.live_bitstreams(), 0);
    }

    #[test]
    fn test_input_kind_mismatch() {
        let driver = LoopbackDriver::default();
        let mut p = pipeline(&driver, 4, settings(1, 1), false);
        let err = p.submit(&driver, Some(&external_frame(0, 1))).unwrap_err();
        assert!(matches!(err, EncodeError::Configuration(_)));
        assert_eq!(p.pool().free_count(), 4);
    }

    #[test]
    fn test_flush_returns_packets_and_resets() {
        let driver = LoopbackDriver::default();
        let mut p = pipeline(&driver, 8, settings(7, 1), false);
        for pts in 0..3 {
            p.submit(&driver, Some(&host_frame(pts, 0))).unwrap();
        }
        let packets = p.flush(&driver).unwrap();
        assert_eq!(packets.iter().map(|p| p.pts).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(!p.is_draining());
        assert_eq!(p.pool().free_count(), 8);
        assert_eq!(p.submit(&driver, Some(&host_frame(3, 0))).unwrap(), SubmitOutcome::Queued);
    }

    #[test]
    fn test_flush_keeps_timestamps_of_held_surfaces() {
        let driver = LoopbackDriver::new(LoopbackConfig {
            completion_latency: 2,
            ..Default::default()
        });
        let mut p = pipeline(&driver, 8, settings(1, 1), false);
        p.submit(&driver, Some(&host_frame(0, 0))).unwrap();
        p.submit(&driver, Some(&host_frame(1, 0))).unwrap();

        driver.fail_next(DriverCall::EncodePicture, DriverStatus::NeedMoreInput);
        assert!(p.flush(&driver).unwrap().is_empty());
        assert_eq!(p.pool().submitted_count(), 2);
        assert_eq!(p.pool().pending_timestamps(), 2);

        p.submit(&driver, Some(&host_frame(2, 0))).unwrap();
        for pts in 0..3 {
            let packet = expect_packet(p.drain(&driver).unwrap());
            assert_eq!(packet.pts, pts);
            assert_eq!(packet.dts, pts);
        }
        assert_eq!(p.pool().pending_timestamps(), 0);
    }

    #[test]
    fn test_reconfigure_runs_before_submission() {
        let driver = LoopbackDriver::default();
        let mut p = pipeline(&driver, 4, settings(1, 1), false);
        p.hints_mut().sar_num = 1;
        p.hints_mut().sar_den = 1;
        p.submit(&driver, Some(&host_frame(0, 0))).unwrap();
        // 64x32 is already 2:1
        assert_eq!(driver.call_count(DriverCall::Reconfigure), 0);

        p.hints_mut().sar_num = 2;
        p.submit(&driver, Some(&host_frame(1, 0))).unwrap();
        assert_eq!(driver.call_count(DriverCall::Reconfigure), 1);
        assert_eq!((p.params().dar_width, p.params().dar_height), (4, 1));
    }
}
