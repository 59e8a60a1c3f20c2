// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Cache of registered external frames.
//!
//! Registering hardware memory with the encoder is expensive, so each
//! distinct `(native, sub_index)` identity is registered once and kept until
//! its slot is needed. Entries are reference counted per in-flight surface;
//! an entry is unmapped when its count reaches zero and only unregistered on
//! eviction or [`RegistrationCache::clear`].

use std::collections::HashMap;

use crate::driver::{EncoderDriver, EncoderHandle, MappedInput, RegisterResource, RegistrationHandle};
use crate::error::{EncodeError, Result};

pub const REGISTRATION_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub native: u64,
    pub sub_index: u32,
}

#[derive(Debug)]
struct Entry {
    key: ResourceKey,
    registration: RegistrationHandle,
    mapped: Option<MappedInput>,
    refs: u32,
    /// Generation at which `refs` last dropped to zero.
    idle_since: u64,
}

/// Mapping handed to a surface; give it back with
/// [`RegistrationCache::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedMapping {
    pub slot: usize,
    pub mapped: MappedInput,
}

#[derive(Debug)]
pub struct RegistrationCache {
    slots: Vec<Option<Entry>>,
    index: HashMap<ResourceKey, usize>,
    generation: u64,
    register_calls: u64,
}

impl Default for RegistrationCache {
    fn default() -> Self {
        Self::with_capacity(REGISTRATION_CAPACITY)
    }
}

impl RegistrationCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            index: HashMap::with_capacity(capacity),
            generation: 0,
            register_calls: 0,
        }
    }

    /// Number of registered resources.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Total registrations performed over the cache's lifetime.
    pub fn register_calls(&self) -> u64 {
        self.register_calls
    }

    pub fn refs(&self, key: ResourceKey) -> Option<u32> {
        let slot = *self.index.get(&key)?;
        self.slots[slot].as_ref().map(|e| e.refs)
    }

    pub fn is_mapped(&self, key: ResourceKey) -> bool {
        self.index
            .get(&key)
            .and_then(|&slot| self.slots[slot].as_ref())
            .is_some_and(|e| e.mapped.is_some())
    }

    /// Returns a mapped input for `resource`, registering it on first use.
    ///
    /// Must run with the device context current.
    pub fn acquire(
        &mut self,
        driver: &dyn EncoderDriver,
        encoder: EncoderHandle,
        resource: &RegisterResource,
    ) -> Result<CachedMapping> {
        let key = ResourceKey {
            native: resource.native,
            sub_index: resource.sub_index,
        };

        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => self.register(driver, encoder, key, resource)?,
        };

        let entry = self.slots[slot]
            .as_mut()
            .ok_or_else(|| EncodeError::Internal(format!("registration slot {} empty", slot)))?;

        let mapped = match entry.mapped {
            Some(mapped) => mapped,
            None => {
                let mapped = driver
                    .map_input_resource(encoder, entry.registration)
                    .map_err(|status| {
                        EncodeError::from_driver(driver, encoder, "MapInputResource", status)
                    })?;
                entry.mapped = Some(mapped);
                mapped
            }
        };
        entry.refs += 1;

        tracing::trace!(
            native = key.native,
            sub_index = key.sub_index,
            refs = entry.refs,
            "Acquired registration slot {}",
            slot
        );
        Ok(CachedMapping { slot, mapped })
    }

    fn register(
        &mut self,
        driver: &dyn EncoderDriver,
        encoder: EncoderHandle,
        key: ResourceKey,
        resource: &RegisterResource,
    ) -> Result<usize> {
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => self.evict(driver, encoder)?,
        };

        let registration = driver
            .register_resource(encoder, resource)
            .map_err(|status| EncodeError::from_driver(driver, encoder, "RegisterResource", status))?;
        self.register_calls += 1;

        self.slots[slot] = Some(Entry {
            key,
            registration,
            mapped: None,
            refs: 0,
            idle_since: self.generation,
        });
        self.index.insert(key, slot);
        Ok(slot)
    }

    /// Frees the slot that has been idle longest.
    fn evict(&mut self, driver: &dyn EncoderDriver, encoder: EncoderHandle) -> Result<usize> {
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().map(|e| (slot, e)))
            .filter(|(_, e)| e.refs == 0)
            .min_by_key(|(_, e)| e.idle_since)
            .map(|(slot, _)| slot);

        let Some(slot) = victim else {
            return Err(EncodeError::ResourceExhausted(format!(
                "all {} registration slots are in use",
                self.slots.len()
            )));
        };

        let entry = self.slots[slot]
            .as_mut()
            .ok_or_else(|| EncodeError::Internal(format!("registration slot {} empty", slot)))?;
        tracing::debug!(
            native = entry.key.native,
            sub_index = entry.key.sub_index,
            "Evicting registration slot {}",
            slot
        );
        // The entry stays cached until both teardown steps succeed.
        if let Some(mapped) = entry.mapped {
            driver
                .unmap_input_resource(encoder, mapped.handle)
                .map_err(|status| {
                    EncodeError::from_driver(driver, encoder, "UnmapInputResource", status)
                })?;
            entry.mapped = None;
        }
        driver
            .unregister_resource(encoder, entry.registration)
            .map_err(|status| {
                EncodeError::from_driver(driver, encoder, "UnregisterResource", status)
            })?;

        if let Some(entry) = self.slots[slot].take() {
            self.index.remove(&entry.key);
        }
        Ok(slot)
    }

    /// Drops one reference; the resource is unmapped when none remain.
    pub fn release(
        &mut self,
        driver: &dyn EncoderDriver,
        encoder: EncoderHandle,
        slot: usize,
    ) -> Result<()> {
        let entry = self
            .slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or_else(|| EncodeError::Internal(format!("release of empty slot {}", slot)))?;

        if entry.refs == 0 {
            return Err(EncodeError::Internal(format!(
                "registration slot {} released more often than acquired",
                slot
            )));
        }
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(());
        }

        self.generation += 1;
        entry.idle_since = self.generation;
        if let Some(mapped) = entry.mapped {
            driver
                .unmap_input_resource(encoder, mapped.handle)
                .map_err(|status| {
                    EncodeError::from_driver(driver, encoder, "UnmapInputResource", status)
                })?;
            entry.mapped = None;
        }
        Ok(())
    }

    /// Unmaps and unregisters everything. Every entry is attempted; the first
    /// failure is returned.
    pub fn clear(&mut self, driver: &dyn EncoderDriver, encoder: EncoderHandle) -> Result<()> {
        let mut first_error = None;

        for slot in self.slots.iter_mut() {
            let Some(entry) = slot.take() else {
                continue;
            };
            if let Some(mapped) = entry.mapped {
                if let Err(status) = driver.unmap_input_resource(encoder, mapped.handle) {
                    let err =
                        EncodeError::from_driver(driver, encoder, "UnmapInputResource", status);
                    first_error.get_or_insert(err);
                }
            }
            if let Err(status) = driver.unregister_resource(encoder, entry.registration) {
                let err = EncodeError::from_driver(driver, encoder, "UnregisterResource", status);
                first_error.get_or_insert(err);
            }
        }
        self.index.clear();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
