// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use crate::driver::{DeviceContext, EncoderDriver};
use crate::error::{EncodeError, Result};

/// Keeps a device context current for the guard's lifetime.
///
/// Pushes on [`ContextGuard::enter`] and pops on drop. Use
/// [`ContextGuard::exit`] to observe a failing pop.
pub struct ContextGuard<'a> {
    driver: &'a dyn EncoderDriver,
    active: bool,
}

impl<'a> ContextGuard<'a> {
    pub fn enter(driver: &'a dyn EncoderDriver, context: DeviceContext) -> Result<Self> {
        driver
            .push_context(context)
            .map_err(|status| EncodeError::device("PushContext", status))?;
        Ok(Self {
            driver,
            active: true,
        })
    }

    pub fn exit(mut self) -> Result<()> {
        self.active = false;
        self.driver
            .pop_context()
            .map_err(|status| EncodeError::device("PopContext", status))
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(status) = self.driver.pop_context() {
                tracing::warn!(%status, "PopContext failed while unwinding");
            }
        }
    }
}
