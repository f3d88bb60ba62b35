// Copyright (c) 2023 Contributors to the Eclipse Foundation
//
// See the NOTICE file(s) distributed with this work for additional
// information regarding copyright ownership.
//
// This program and the accompanying materials are made available under the
// terms of the Apache Software License 2.0 which is available at
// https://www.apache.org/licenses/LICENSE-2.0, or the MIT license
// which is available at https://opensource.org/licenses/MIT.
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A process-global registry mapping a small [`SegmentId`] to the `(base, length)` of a mapped
//! shared-memory segment, plus [`RelativePointer`], a `(segment_id, offset)` pair that decodes to
//! the same object in every process that has registered the segment it points into — regardless
//! of the virtual address at which that process happened to map it.
//!
//! Every construct relying on [`RelativePointer`] must live in `#[repr(C)]` memory and must be
//! decoded only in a process that registered the same segment; offsets are not portable across
//! unrelated segments.
//!
//! # Example
//!
//! ```
//! use shmfabric_bb_elementary::relative_pointer::*;
//!
//! let mut backing = vec![0u8; 4096];
//! let base = backing.as_mut_ptr();
//! let id = registry::register(base as usize, backing.len() as u64).unwrap();
//!
//! let ptr: RelativePointer<u8> = RelativePointer::encode(base).unwrap();
//! assert_eq!(ptr.segment_id(), id);
//! assert_eq!(unsafe { ptr.decode() }.unwrap().as_ptr(), base);
//!
//! registry::unregister(id);
//! ```

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

use shmfabric_log::fail;

/// Maximum number of segments that can be registered at once within a process.
pub const MAX_SEGMENTS: usize = 100;

/// A small non-negative integer identifying a registered segment. Assigned at registration time;
/// unique per process for as long as the segment stays registered.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SegmentId(u16);

impl SegmentId {
    /// Constructs a [`SegmentId`] from a raw slot index. Only meant for registry internals and
    /// tests that need a concrete id without going through [`registry::register`].
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// The raw slot index.
    pub const fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failures from [`registry::register`] / [`registry::register_with_id`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RegisterError {
    /// All [`MAX_SEGMENTS`] slots are occupied.
    NoFreeSegmentId,
}

/// Failures from [`RelativePointer::encode`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum EncodeError {
    /// The raw pointer does not fall within any currently registered segment.
    NoMatchingSegment,
}

/// Failures from [`RelativePointer::decode`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum DecodeError {
    /// `segment_id` is not currently registered.
    SegmentNotRegistered,
    /// `offset` lies outside the registered segment's length.
    OffsetOutOfBounds,
}

/// The process-global segment table and its operations.
pub mod registry {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    #[derive(Clone, Copy)]
    struct Slot {
        base: usize,
        length: u64,
    }

    struct Registry {
        slots: [Option<Slot>; MAX_SEGMENTS],
    }

    impl Registry {
        fn new() -> Self {
            Self {
                slots: [None; MAX_SEGMENTS],
            }
        }
    }

    fn global() -> &'static Mutex<Registry> {
        static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
        REGISTRY.get_or_init(|| Mutex::new(Registry::new()))
    }

    /// Registers `(base, length)` in the first free slot, returning its [`SegmentId`].
    pub fn register(base: usize, length: u64) -> Result<SegmentId, RegisterError> {
        let msg = "Unable to register segment";
        let mut registry = global().lock().unwrap();
        let Some(index) = registry.slots.iter().position(Option::is_none) else {
            fail!(from "relative_pointer::registry", with RegisterError::NoFreeSegmentId,
                "{} since all {} segment ids are already in use.", msg, MAX_SEGMENTS);
        };
        registry.slots[index] = Some(Slot { base, length });
        Ok(SegmentId::new(index as u16))
    }

    /// Registers `(base, length)` under a caller-chosen id. Returns `false` (without mutating
    /// the registry) if the id is out of range or already occupied.
    pub fn register_with_id(id: SegmentId, base: usize, length: u64) -> bool {
        let index = id.value() as usize;
        if index >= MAX_SEGMENTS {
            return false;
        }
        let mut registry = global().lock().unwrap();
        if registry.slots[index].is_some() {
            return false;
        }
        registry.slots[index] = Some(Slot { base, length });
        true
    }

    /// Removes a segment's registration. Idempotent: unregistering an id that is not registered
    /// is a no-op.
    pub fn unregister(id: SegmentId) {
        let index = id.value() as usize;
        if index >= MAX_SEGMENTS {
            return;
        }
        global().lock().unwrap().slots[index] = None;
    }

    /// Finds the registered segment containing `addr`, returning `(id, offset)`.
    pub(super) fn raw_to_relative(addr: usize) -> Option<(SegmentId, u64)> {
        let registry = global().lock().unwrap();
        registry
            .slots
            .iter()
            .enumerate()
            .find_map(|(index, slot)| {
                let slot = (*slot)?;
                let end = slot.base + slot.length as usize;
                if addr >= slot.base && addr < end {
                    Some((SegmentId::new(index as u16), (addr - slot.base) as u64))
                } else {
                    None
                }
            })
    }

    /// Resolves `(id, offset)` back to a raw address, bounds-checked against the registered
    /// segment length.
    pub(super) fn relative_to_raw(id: SegmentId, offset: u64) -> Option<usize> {
        let index = id.value() as usize;
        if index >= MAX_SEGMENTS {
            return None;
        }
        let registry = global().lock().unwrap();
        let slot = registry.slots[index]?;
        if offset >= slot.length {
            return None;
        }
        Some(slot.base + offset as usize)
    }
}

/// A `(segment_id, offset)` pair that encodes an address portably across processes that mapped
/// the same segment at different virtual addresses.
#[repr(C)]
pub struct RelativePointer<T> {
    segment_id: SegmentId,
    offset: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for RelativePointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelativePointer")
            .field("segment_id", &self.segment_id)
            .field("offset", &self.offset)
            .finish()
    }
}

impl<T> Clone for RelativePointer<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for RelativePointer<T> {}

impl<T> RelativePointer<T> {
    /// Constructs a pointer from an already-known `(segment_id, offset)` pair, without consulting
    /// the registry. Used when decoding a value that was itself transmitted through shared
    /// memory as raw `(id, offset)` fields.
    pub const fn from_parts(segment_id: SegmentId, offset: u64) -> Self {
        Self {
            segment_id,
            offset,
            _marker: PhantomData,
        }
    }

    /// The segment this pointer was encoded against.
    pub const fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// The byte offset from the segment's base.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Encodes a raw pointer as a `(segment_id, offset)` pair by finding the registered segment
    /// that contains it.
    pub fn encode(ptr: *const T) -> Result<Self, EncodeError> {
        let msg = "Unable to encode pointer as relative pointer";
        let Some((segment_id, offset)) = registry::raw_to_relative(ptr as usize) else {
            fail!(from "RelativePointer::encode", with EncodeError::NoMatchingSegment,
                "{} since {:p} lies outside every registered segment.", msg, ptr);
        };
        Ok(Self::from_parts(segment_id, offset))
    }

    /// Decodes back to a raw pointer valid in the calling process's address space.
    ///
    /// # Safety
    ///
    /// The caller must ensure `T` is the type that was originally stored at this location and
    /// that the memory has not since been reclaimed.
    pub unsafe fn decode(&self) -> Result<NonNull<T>, DecodeError> {
        let msg = "Unable to decode relative pointer";
        let Some(raw) = registry::relative_to_raw(self.segment_id, self.offset) else {
            if registry::relative_to_raw(self.segment_id, 0).is_none()
                && registry::raw_to_relative(0).is_none()
            {
                fail!(from "RelativePointer::decode", with DecodeError::SegmentNotRegistered,
                    "{} since segment {} is not registered.", msg, self.segment_id);
            }
            fail!(from "RelativePointer::decode", with DecodeError::OffsetOutOfBounds,
                "{} since offset {} is out of bounds for segment {}.", msg, self.offset, self.segment_id);
        };
        Ok(NonNull::new_unchecked(raw as *mut T))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_registration() {
        let mut backing = vec![0u8; 256];
        let base = backing.as_mut_ptr();
        let id = registry::register(base as usize, backing.len() as u64).unwrap();

        let target = unsafe { base.add(64) };
        let ptr: RelativePointer<u8> = RelativePointer::encode(target).unwrap();
        assert_eq!(ptr.segment_id(), id);
        assert_eq!(ptr.offset(), 64);
        assert_eq!(unsafe { ptr.decode() }.unwrap().as_ptr(), target);

        registry::unregister(id);
        assert!(unsafe { ptr.decode() }.is_err());
    }

    #[test]
    fn encode_fails_outside_any_segment() {
        let unrelated = 0xdead_beefusize as *const u8;
        assert_eq!(
            RelativePointer::<u8>::encode(unrelated),
            Err(EncodeError::NoMatchingSegment)
        );
    }

    #[test]
    fn decode_fails_when_offset_exceeds_length() {
        let mut backing = vec![0u8; 16];
        let base = backing.as_mut_ptr();
        let id = registry::register(base as usize, backing.len() as u64).unwrap();

        let out_of_bounds = RelativePointer::<u8>::from_parts(id, 1024);
        assert_eq!(
            unsafe { out_of_bounds.decode() },
            Err(DecodeError::OffsetOutOfBounds)
        );

        registry::unregister(id);
    }
}
