// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Range manager for host-allocated (MMAP) buffers.
//!
//! Devices register each host-allocated plane under an offset in the
//! device's mappable range space, and the driver refers to planes by that
//! offset in MMAP commands. The manager owns the offset space, tracks which
//! ranges are currently mapped into the guest, and performs the actual
//! mapping through a [`HostMemoryMapper`].

use std::os::fd::BorrowedFd;

use thiserror::Error;

use crate::HostMemoryMapper;

const PAGE_SIZE: u64 = 0x1000;
const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Active guest mapping of a range.
#[derive(Debug, PartialEq, Eq)]
struct MappedRegion {
    /// Guest address at which the range is mapped.
    guest_addr: u64,
    /// Whether the mapping is writable by the driver.
    rw: bool,
}

/// One registered range of the mappable space.
#[derive(Debug, PartialEq, Eq)]
struct MmapSlot {
    /// Start offset of the range.
    offset: u64,
    /// Size of the range in bytes.
    size: u64,
    /// Whether the range is still registered. An unregistered range with a
    /// live mapping is kept until the driver unmaps it, but cannot be mapped
    /// again and takes no space in the offset space.
    registered: bool,
    mapping: Option<MappedRegion>,
}

impl MmapSlot {
    fn new(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            registered: true,
            mapping: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterBufferError {
    #[error("requested offset is already occupied")]
    OffsetOccupied,
    #[error("ranges of size 0 cannot be registered")]
    EmptyRange,
    #[error("range offset must be a multiple of the memory page size")]
    UnalignedOffset,
}

impl RegisterBufferError {
    pub fn into_errno(self) -> i32 {
        libc::EINVAL
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CreateMappingError {
    #[error("no range registered at the requested offset")]
    InvalidOffset,
    #[error("cannot map a range whose buffer has been freed")]
    UnregisteredRange,
    #[error("range is already mapped into the guest")]
    AlreadyMapped,
    #[error("error while mapping the range: {0}")]
    MappingFailure(i32),
}

impl CreateMappingError {
    pub fn into_errno(self) -> i32 {
        match self {
            CreateMappingError::InvalidOffset => libc::EINVAL,
            CreateMappingError::UnregisteredRange => libc::EINVAL,
            CreateMappingError::AlreadyMapped => libc::EBUSY,
            CreateMappingError::MappingFailure(errno) => errno,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RemoveMappingError {
    #[error("no mapping at the requested guest address")]
    InvalidAddress,
}

impl RemoveMappingError {
    pub fn into_errno(self) -> i32 {
        libc::EINVAL
    }
}

/// Offset space and mapping state of a device's MMAP buffers.
///
/// Registered ranges are kept sorted by offset so lookups are
/// binary-searchable. A range can have at most one live guest mapping at a
/// time; mapping an already-mapped range is refused until the driver unmaps
/// it.
pub struct MmapRangeManager<M: HostMemoryMapper> {
    slots: Vec<MmapSlot>,
    mapper: M,
}

impl<M: HostMemoryMapper> From<M> for MmapRangeManager<M> {
    fn from(mapper: M) -> Self {
        Self {
            slots: Vec::new(),
            mapper,
        }
    }
}

impl<M: HostMemoryMapper> MmapRangeManager<M> {
    /// Registers a new range of `size` bytes. If `offset` is `None` a free
    /// offset is allocated, otherwise the requested offset is used or the
    /// call fails with [`RegisterBufferError::OffsetOccupied`].
    ///
    /// Returns the offset of the registered range.
    pub fn register_buffer(
        &mut self,
        offset: Option<u64>,
        size: u64,
    ) -> Result<u64, RegisterBufferError> {
        let offset = offset.unwrap_or_else(|| {
            self.slots
                .last()
                // Start past the last registered range, page-aligned.
                .map(|slot| (slot.offset + slot.size).next_multiple_of(PAGE_SIZE))
                .unwrap_or(0)
        });

        self.register_buffer_at(offset, size).map(|()| offset)
    }

    fn register_buffer_at(&mut self, offset: u64, size: u64) -> Result<(), RegisterBufferError> {
        if size == 0 {
            return Err(RegisterBufferError::EmptyRange);
        }
        if offset & PAGE_MASK != offset {
            return Err(RegisterBufferError::UnalignedOffset);
        }

        match self.slots.binary_search_by_key(&offset, |slot| slot.offset) {
            Ok(_) => Err(RegisterBufferError::OffsetOccupied),
            Err(index) => {
                self.slots.insert(index, MmapSlot::new(offset, size));
                Ok(())
            }
        }
    }

    /// Unregisters the range at `offset`. Returns `true` if a range was
    /// registered there.
    ///
    /// A live mapping of the range survives until the driver unmaps it; only
    /// then is the slot actually dropped.
    pub fn unregister_buffer(&mut self, offset: u64) -> bool {
        match self.slots.binary_search_by_key(&offset, |slot| slot.offset) {
            Err(_) => false,
            Ok(index) => {
                let slot = &mut self.slots[index];

                slot.registered = false;
                if slot.mapping.is_none() {
                    self.slots.remove(index);
                }

                true
            }
        }
    }

    /// Maps the range registered at `offset` into the guest and returns the
    /// guest address and the size of the mapping.
    ///
    /// `fd` is the file backing the range; `rw` selects a writable mapping.
    /// A range can only be mapped once: mapping it again before the driver
    /// unmapped it fails with [`CreateMappingError::AlreadyMapped`].
    pub fn create_mapping(
        &mut self,
        offset: u64,
        fd: BorrowedFd,
        rw: bool,
    ) -> Result<(u64, u64), CreateMappingError> {
        let slot = self
            .slots
            .binary_search_by_key(&offset, |slot| slot.offset)
            .map(|index| &mut self.slots[index])
            .map_err(|_| CreateMappingError::InvalidOffset)?;

        if !slot.registered {
            return Err(CreateMappingError::UnregisteredRange);
        }
        if slot.mapping.is_some() {
            return Err(CreateMappingError::AlreadyMapped);
        }

        let guest_addr = self
            .mapper
            .add_mapping(fd, slot.size, slot.offset, rw)
            .map_err(CreateMappingError::MappingFailure)?;

        slot.mapping = Some(MappedRegion { guest_addr, rw });

        Ok((guest_addr, slot.size))
    }

    /// Removes the mapping at `guest_addr` from the guest address space.
    pub fn remove_mapping(&mut self, guest_addr: u64) -> Result<(), RemoveMappingError> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match &slot.mapping {
                Some(mapping) if mapping.guest_addr == guest_addr => {
                    if let Err(e) = self.mapper.remove_mapping(guest_addr) {
                        log::error!("error while unmapping MMAP range: {}", e);
                    }
                    slot.mapping = None;
                    // A dangling slot only existed for the sake of this
                    // mapping.
                    if !slot.registered {
                        self.slots.remove(index);
                    }
                    return Ok(());
                }
                _ => (),
            }
        }

        Err(RemoveMappingError::InvalidAddress)
    }

    /// Returns `true` if the range at `offset` is currently mapped.
    pub fn is_mapped(&self, offset: u64) -> bool {
        match self.slots.binary_search_by_key(&offset, |slot| slot.offset) {
            Err(_) => false,
            Ok(index) => self.slots[index].mapping.is_some(),
        }
    }

    /// Consumes the manager and returns the mapper it was built from.
    pub fn into_mapper(self) -> M {
        self.mapper
    }
}
