// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Surface pool.
//!
//! A surface pairs an input (an owned device buffer, or a mapping borrowed
//! from the [`RegistrationCache`](crate::registry::RegistrationCache)) with
//! an owned output bitstream buffer. Every surface sits in exactly one of
//! the free, submitted or ready queues.

use crate::driver::{BitstreamHandle, EncoderDriver, EncoderHandle, InputBufferHandle};
use crate::error::{EncodeError, Result};
use crate::format::{self, BufferFormat, PixelFormat};
use crate::frame::Plane;
use crate::queue::BoundedQueue;
use crate::registry::CachedMapping;

/// Hard ceiling on surfaces per session.
pub const MAX_SURFACES: u32 = 64;

/// Surface count and async depth after sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceBudget {
    pub nb_surfaces: u32,
    /// Always below `nb_surfaces`.
    pub async_depth: u32,
}

impl SurfaceBudget {
    /// Sizes the pool for the reorder depth implied by `frame_interval_p`
    /// and the requested `lookahead`. A requested count below the minimum
    /// is widened.
    pub fn compute(requested: u32, async_depth: u32, frame_interval_p: i32, lookahead: u32) -> Self {
        let fip = frame_interval_p.max(0) as u32;
        let mut minimum = (fip * 4).max(4);
        if lookahead > 0 {
            minimum = minimum.max(lookahead + fip + 1 + 4);
        }

        let nb_surfaces = if requested == 0 {
            minimum
        } else {
            if requested < minimum {
                tracing::warn!(
                    "Defined surface count {} is too small for the GOP structure, using {}",
                    requested,
                    minimum
                );
            }
            requested.max(minimum)
        }
        .clamp(1, MAX_SURFACES);

        Self {
            nb_surfaces,
            async_depth: async_depth.min(nb_surfaces - 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Free,
    Submitted,
    Ready,
}

#[derive(Debug)]
pub struct Surface {
    /// Owned input buffer for host frames.
    pub input: Option<InputBufferHandle>,
    /// Borrowed registration for external frames, set while in flight.
    pub mapping: Option<CachedMapping>,
    pub bitstream: BitstreamHandle,
    /// Row pitch of the input as last uploaded or mapped.
    pub pitch: usize,
    pub state: SurfaceState,
}

/// What every surface's buffers look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceLayout {
    pub width: u32,
    pub height: u32,
    pub format: BufferFormat,
    /// External frames bring their own input memory.
    pub external: bool,
}

#[derive(Debug)]
pub struct SurfacePool {
    surfaces: Vec<Surface>,
    free: BoundedQueue<usize>,
    submitted: BoundedQueue<usize>,
    ready: BoundedQueue<usize>,
    timestamps: BoundedQueue<i64>,
    layout: SurfaceLayout,
}

fn destroy_surface(driver: &dyn EncoderDriver, encoder: EncoderHandle, surface: &Surface) -> Result<()> {
    let mut first_error = None;
    if let Some(input) = surface.input {
        if let Err(status) = driver.destroy_input_buffer(encoder, input) {
            first_error.get_or_insert(EncodeError::from_driver(
                driver,
                encoder,
                "DestroyInputBuffer",
                status,
            ));
        }
    }
    if let Err(status) = driver.destroy_bitstream_buffer(encoder, surface.bitstream) {
        first_error.get_or_insert(EncodeError::from_driver(
            driver,
            encoder,
            "DestroyBitstreamBuffer",
            status,
        ));
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn create_surface(
    driver: &dyn EncoderDriver,
    encoder: EncoderHandle,
    layout: &SurfaceLayout,
) -> Result<Surface> {
    let input = if layout.external {
        None
    } else {
        let buffer = driver
            .create_input_buffer(encoder, layout.width, layout.height, layout.format)
            .map_err(|status| EncodeError::from_driver(driver, encoder, "CreateInputBuffer", status))?;
        Some(buffer)
    };

    let bitstream = match driver.create_bitstream_buffer(encoder) {
        Ok(bitstream) => bitstream,
        Err(status) => {
            let err = EncodeError::from_driver(driver, encoder, "CreateBitstreamBuffer", status);
            if let Some(buffer) = input {
                if let Err(status) = driver.destroy_input_buffer(encoder, buffer) {
                    tracing::warn!(%status, "DestroyInputBuffer failed during rollback");
                }
            }
            return Err(err);
        }
    };

    Ok(Surface {
        input,
        mapping: None,
        bitstream,
        pitch: 0,
        state: SurfaceState::Free,
    })
}

impl SurfacePool {
    /// Creates `count` surfaces. A failure rolls back every buffer created
    /// so far before the error is returned.
    ///
    /// Must run with the device context current.
    pub fn allocate(
        driver: &dyn EncoderDriver,
        encoder: EncoderHandle,
        count: u32,
        layout: SurfaceLayout,
    ) -> Result<Self> {
        let count = count as usize;
        let mut surfaces = Vec::with_capacity(count);

        for index in 0..count {
            match create_surface(driver, encoder, &layout) {
                Ok(surface) => surfaces.push(surface),
                Err(err) => {
                    tracing::error!("Surface {} allocation failed, rolling back", index);
                    for surface in surfaces.iter().rev() {
                        if let Err(e) = destroy_surface(driver, encoder, surface) {
                            tracing::warn!("{}", e);
                        }
                    }
                    return Err(err);
                }
            }
        }

        let mut free = BoundedQueue::with_capacity(count);
        for index in 0..count {
            free.push(index)?;
        }

        tracing::debug!(
            count,
            external = layout.external,
            "Allocated {}x{} {:?} surfaces",
            layout.width,
            layout.height,
            layout.format
        );

        Ok(Self {
            surfaces,
            free,
            submitted: BoundedQueue::with_capacity(count),
            ready: BoundedQueue::with_capacity(count),
            timestamps: BoundedQueue::with_capacity(count),
            layout,
        })
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn layout(&self) -> &SurfaceLayout {
        &self.layout
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn pending_timestamps(&self) -> usize {
        self.timestamps.len()
    }

    pub fn surface(&self, index: usize) -> Option<&Surface> {
        self.surfaces.get(index)
    }

    pub fn surface_mut(&mut self, index: usize) -> Option<&mut Surface> {
        self.surfaces.get_mut(index)
    }

    /// Takes a free surface, if any.
    pub fn acquire_input(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Returns a surface to the free queue.
    pub fn release_input(&mut self, index: usize) -> Result<()> {
        let surface = self
            .surfaces
            .get_mut(index)
            .ok_or_else(|| EncodeError::Internal(format!("no surface {}", index)))?;
        if let Some(mapping) = surface.mapping.take() {
            tracing::warn!(
                slot = mapping.slot,
                "Surface {} freed with its input still mapped",
                index
            );
        }
        surface.state = SurfaceState::Free;
        self.free.push(index)
    }

    pub fn mark_submitted(&mut self, index: usize) -> Result<()> {
        let surface = self
            .surfaces
            .get_mut(index)
            .ok_or_else(|| EncodeError::Internal(format!("no surface {}", index)))?;
        surface.state = SurfaceState::Submitted;
        self.submitted.push(index)
    }

    /// Moves every submitted surface to the ready queue, oldest first.
    pub fn promote_submitted(&mut self) -> Result<()> {
        while let Some(index) = self.submitted.pop() {
            self.surfaces[index].state = SurfaceState::Ready;
            self.ready.push(index)?;
        }
        Ok(())
    }

    pub fn pop_ready(&mut self) -> Option<usize> {
        self.ready.pop()
    }

    pub fn push_timestamp(&mut self, pts: i64) -> Result<()> {
        self.timestamps.push(pts)
    }

    pub fn pop_timestamp(&mut self) -> Option<i64> {
        self.timestamps.pop()
    }

    pub fn clear_timestamps(&mut self) {
        self.timestamps.clear();
    }

    /// Copies a host frame into a surface's input buffer. The buffer is
    /// unlocked again even when the copy fails.
    pub fn upload_host(
        &mut self,
        driver: &dyn EncoderDriver,
        encoder: EncoderHandle,
        index: usize,
        pixel_format: PixelFormat,
        planes: &[Plane],
    ) -> Result<()> {
        let input = self
            .surfaces
            .get(index)
            .and_then(|s| s.input)
            .ok_or_else(|| EncodeError::Internal(format!("surface {} has no input buffer", index)))?;

        let mut locked = driver
            .lock_input_buffer(encoder, input)
            .map_err(|status| EncodeError::from_driver(driver, encoder, "LockInputBuffer", status))?;

        let pitch = locked.pitch;
        // SAFETY: the buffer stays locked, and nothing else views it, until
        // the unlock below.
        let dst = unsafe { locked.as_mut_slice() };
        let copied = format::copy_planes(
            pixel_format,
            self.layout.width,
            self.layout.height,
            planes,
            dst,
            pitch,
        );

        let unlocked = driver
            .unlock_input_buffer(encoder, input)
            .map_err(|status| EncodeError::from_driver(driver, encoder, "UnlockInputBuffer", status));

        copied?;
        unlocked?;

        if let Some(surface) = self.surfaces.get_mut(index) {
            surface.pitch = pitch;
        }
        Ok(())
    }

    /// Destroys every surface's buffers. All surfaces are attempted; the
    /// first failure is returned.
    pub fn release(&mut self, driver: &dyn EncoderDriver, encoder: EncoderHandle) -> Result<()> {
        let mut first_error = None;
        for surface in self.surfaces.drain(..) {
            if let Err(err) = destroy_surface(driver, encoder, &surface) {
                first_error.get_or_insert(err);
            }
        }
        self.free.clear();
        self.submitted.clear();
        self.ready.clear();
        self.timestamps.clear();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
