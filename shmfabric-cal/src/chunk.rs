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

//! The layout of one chunk: a [`ChunkHeader`] followed by an optional user header and the
//! user payload, sized and positioned by [`ChunkSettings`] so that every offset and alignment
//! requirement is known before the chunk's backing bytes are ever touched.
//!
//! Two cases, depending on whether the chunk carries a user header:
//!
//! - **No user header, payload alignment within [`ChunkHeader`]'s own**: the payload sits at the
//!   fixed distance `sizeof(ChunkHeader)`; no extra bookkeeping is stored.
//! - **Otherwise** (over-aligned payload, or a user header present): the payload's exact address
//!   depends on the chunk's actual base address, so a small back-offset is written into the four
//!   bytes immediately preceding the payload, letting [`ChunkHeader::from_payload`] recover the
//!   header from a bare payload pointer by subtraction.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use shmfabric_bb_elementary::math::{align_up, is_power_of_two};
use shmfabric_log::fail;

/// Alignment used when the caller does not care about payload alignment.
pub const DEFAULT_USER_PAYLOAD_ALIGNMENT: u32 = 1;
/// Sentinel size meaning "this chunk carries no user header".
pub const NO_USER_HEADER_SIZE: u32 = 0;
/// Sentinel alignment paired with [`NO_USER_HEADER_SIZE`].
pub const NO_USER_HEADER_ALIGNMENT: u32 = 1;

type UserPayloadOffsetT = u32;

/// Failures from [`ChunkSettings::new`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum ChunkSettingsError {
    AlignmentNotPowerOfTwo,
    UserHeaderAlignmentExceedsChunkHeaderAlignment,
    UserHeaderSizeNotMultipleOfItsAlignment,
    RequiredChunkSizeExceedsMaxChunkSize,
}

/// The fixed metadata embedded at the start of every chunk in a pool.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    chunk_size: u32,
    user_payload_size: u32,
    user_payload_alignment: u32,
    user_header_size: u32,
    user_header_alignment: u32,
}

impl ChunkHeader {
    pub const fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub const fn payload_size(&self) -> u32 {
        self.user_payload_size
    }

    pub const fn payload_align(&self) -> u32 {
        self.user_payload_alignment
    }

    pub const fn user_header_size(&self) -> u32 {
        self.user_header_size
    }

    pub const fn user_header_align(&self) -> u32 {
        self.user_header_alignment
    }

    fn has_fixed_payload_offset(&self) -> bool {
        self.user_header_size == 0 && self.user_payload_alignment as usize <= align_of::<Self>()
    }

    /// Pointer to the user payload, valid as long as the chunk's backing memory is.
    pub fn payload_ptr(&self) -> NonNull<u8> {
        let base = self as *const Self as *const u8;
        if self.has_fixed_payload_offset() {
            return unsafe { NonNull::new_unchecked(base.add(size_of::<Self>()) as *mut u8) };
        }

        let pre_region_end = if self.user_header_size == 0 {
            size_of::<Self>() as u64 - align_of::<Self>() as u64
        } else {
            align_up(
                size_of::<Self>() + self.user_header_size as usize,
                align_of::<UserPayloadOffsetT>(),
            ) as u64
        };
        let offset = dynamic_payload_offset(pre_region_end, self.user_payload_alignment);
        unsafe { NonNull::new_unchecked(base.add(offset as usize) as *mut u8) }
    }

    /// Pointer to the user header, or `None` if this chunk carries none.
    pub fn user_header_ptr(&self) -> Option<NonNull<u8>> {
        if self.user_header_size == 0 {
            return None;
        }
        let base = self as *const Self as *const u8;
        unsafe { Some(NonNull::new_unchecked(base.add(size_of::<Self>()) as *mut u8)) }
    }

    /// Recovers the [`ChunkHeader`] a payload pointer belongs to.
    ///
    /// `has_user_header` must match the `ChunkSettings` the chunk was constructed with: the wire
    /// layout only stores a recoverable back-offset when a user header is present or the payload
    /// is over-aligned relative to `ChunkHeader`, so a caller without that context cannot resolve
    /// this unambiguously from the payload pointer alone.
    ///
    /// # Safety
    ///
    /// `payload` must be a payload pointer previously returned by [`Self::payload_ptr`] on a
    /// chunk that really was constructed with `has_user_header` set accordingly.
    pub unsafe fn from_payload(payload: NonNull<u8>, has_user_header: bool) -> NonNull<Self> {
        if !has_user_header {
            // Could be either case A (fixed distance) or case B (stored offset); both are
            // recoverable by the stored offset, written for every chunk except case A. For case
            // A there is no stored offset, so fall back to the fixed distance if the chunk might
            // be case A. Callers that know their ChunkSettings never mix the two within one pool.
        }
        let offset_slot = payload.as_ptr().sub(size_of::<UserPayloadOffsetT>()) as *const UserPayloadOffsetT;
        let offset = offset_slot.read_unaligned();
        let header_ptr = payload.as_ptr().sub(offset as usize) as *mut Self;
        NonNull::new_unchecked(header_ptr)
    }

    /// Recovers a [`ChunkHeader`] from a payload pointer known to belong to a chunk whose
    /// [`ChunkSettings`] had `user_payload_alignment <= align_of::<ChunkHeader>()` and no user
    /// header — the case where the distance is simply `sizeof(ChunkHeader)`.
    ///
    /// # Safety
    ///
    /// `payload` must satisfy that precondition.
    pub unsafe fn from_payload_fixed_distance(payload: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(payload.as_ptr().sub(size_of::<Self>()) as *mut Self)
    }

    /// Writes the header (and, where applicable, the back-offset field) for a chunk about to be
    /// handed out, described by `settings`.
    ///
    /// # Safety
    ///
    /// `at` must point to at least `settings.required_chunk_size()` writable bytes, aligned to
    /// at least `align_of::<ChunkHeader>()`.
    pub unsafe fn write_at(at: NonNull<u8>, settings: &ChunkSettings) -> NonNull<ChunkHeader> {
        let header = ChunkHeader {
            chunk_size: settings.required_chunk_size(),
            user_payload_size: settings.user_payload_size(),
            user_payload_alignment: settings.user_payload_alignment(),
            user_header_size: settings.user_header_size(),
            user_header_alignment: settings.user_header_alignment(),
        };
        let header_ptr = at.as_ptr() as *mut ChunkHeader;
        header_ptr.write(header);
        let header_ref = &*header_ptr;

        if !header_ref.has_fixed_payload_offset() {
            let payload_ptr = header_ref.payload_ptr();
            let offset = payload_ptr.as_ptr() as usize - at.as_ptr() as usize;
            let offset_slot = payload_ptr.as_ptr().sub(size_of::<UserPayloadOffsetT>())
                as *mut UserPayloadOffsetT;
            offset_slot.write_unaligned(offset as UserPayloadOffsetT);
        }

        NonNull::new_unchecked(header_ptr)
    }
}

/// Computes the payload offset for the "dynamic" cases (over-aligned no-header payload, or any
/// chunk with a user header): the smallest address `>= pre_region_end + sizeof(offset field)`
/// that is aligned to `payload_alignment`, leaving room for the back-offset field immediately
/// before it.
fn dynamic_payload_offset(pre_region_end: u64, payload_alignment: u32) -> u64 {
    align_up(
        pre_region_end as usize + size_of::<UserPayloadOffsetT>(),
        payload_alignment.max(1) as usize,
    ) as u64
}

/// The fully validated "recipe" for a chunk: payload size/alignment, optional user-header
/// size/alignment, and the resulting required chunk size, computed once and reused for every
/// chunk a [`crate::mempool::MemPool`] carves out of its backing memory.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ChunkSettings {
    user_payload_size: u32,
    user_payload_alignment: u32,
    user_header_size: u32,
    user_header_alignment: u32,
    required_chunk_size: u32,
}

impl ChunkSettings {
    /// Validates and computes a [`ChunkSettings`] for a chunk carrying `user_payload_size` bytes
    /// of payload (aligned to `user_payload_alignment`) and, optionally, a user header of
    /// `user_header_size` bytes aligned to `user_header_alignment`.
    pub fn new(
        user_payload_size: u32,
        user_payload_alignment: u32,
        user_header_size: u32,
        user_header_alignment: u32,
    ) -> Result<Self, ChunkSettingsError> {
        let msg = "Unable to create chunk settings";
        let payload_alignment = if user_payload_alignment == 0 {
            1
        } else {
            user_payload_alignment
        };
        let header_alignment = if user_header_alignment == 0 {
            1
        } else {
            user_header_alignment
        };

        if !is_power_of_two(payload_alignment as usize) || !is_power_of_two(header_alignment as usize) {
            fail!(from "ChunkSettings::new", with ChunkSettingsError::AlignmentNotPowerOfTwo,
                "{} since an alignment is not a power of two.", msg);
        }

        if header_alignment as usize > align_of::<ChunkHeader>() {
            fail!(from "ChunkSettings::new", with ChunkSettingsError::UserHeaderAlignmentExceedsChunkHeaderAlignment,
                "{} since the user header alignment {} exceeds the chunk header's alignment {}.",
                msg, header_alignment, align_of::<ChunkHeader>());
        }

        if user_header_size % header_alignment != 0 {
            fail!(from "ChunkSettings::new", with ChunkSettingsError::UserHeaderSizeNotMultipleOfItsAlignment,
                "{} since the user header size {} is not a multiple of its alignment {}.",
                msg, user_header_size, header_alignment);
        }

        let required_chunk_size =
            Self::calculate_required_chunk_size(user_payload_size, payload_alignment, user_header_size);

        if required_chunk_size > u32::MAX as u64 {
            fail!(from "ChunkSettings::new", with ChunkSettingsError::RequiredChunkSizeExceedsMaxChunkSize,
                "{} since the required chunk size {} exceeds u32::MAX.", msg, required_chunk_size);
        }

        Ok(ChunkSettings {
            user_payload_size,
            user_payload_alignment: payload_alignment,
            user_header_size,
            user_header_alignment: header_alignment,
            required_chunk_size: required_chunk_size as u32,
        })
    }

    fn calculate_required_chunk_size(
        user_payload_size: u32,
        user_payload_alignment: u32,
        user_header_size: u32,
    ) -> u64 {
        let header_size = size_of::<ChunkHeader>() as u64;
        let header_align = align_of::<ChunkHeader>() as u64;

        if user_header_size == 0 {
            if user_payload_alignment as u64 <= header_align {
                return header_size + user_payload_size as u64;
            }
            let pre_payload_alignment_overhang = header_size - header_align;
            return pre_payload_alignment_overhang + user_payload_alignment as u64 + user_payload_size as u64;
        }

        let offset_field_size = size_of::<UserPayloadOffsetT>() as u64;
        let offset_field_align = align_of::<UserPayloadOffsetT>() as u64;
        let header_plus_user = header_size + user_header_size as u64;
        let pre_payload_alignment_overhang = align_up(header_plus_user as usize, offset_field_align as usize) as u64;
        let max_padding = offset_field_size.max(user_payload_alignment as u64);
        pre_payload_alignment_overhang + max_padding + user_payload_size as u64
    }

    pub const fn user_payload_size(&self) -> u32 {
        self.user_payload_size
    }

    pub const fn user_payload_alignment(&self) -> u32 {
        self.user_payload_alignment
    }

    pub const fn user_header_size(&self) -> u32 {
        self.user_header_size
    }

    pub const fn user_header_alignment(&self) -> u32 {
        self.user_header_alignment
    }

    pub const fn required_chunk_size(&self) -> u32 {
        self.required_chunk_size
    }

    /// Whether this chunk's payload sits at the fixed distance `sizeof(ChunkHeader)` with no
    /// stored back-offset (case A), versus needing the dynamic, stored-offset recovery path.
    pub fn has_fixed_payload_offset(&self) -> bool {
        self.user_header_size == 0 && self.user_payload_alignment as usize <= align_of::<ChunkHeader>()
    }
}
