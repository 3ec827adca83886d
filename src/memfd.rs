// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side buffer storage backed by `memfd`.
//!
//! MMAP buffers need storage that can be handed to a [`crate::HostMemoryMapper`]
//! as a file descriptor; an anonymous, sealed memfd fits without pulling in a
//! full allocator dependency.

use core::slice;
use std::fs::File;
use std::io;
use std::num::NonZeroU64;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use nix::sys::mman;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NewHostBufferError {
    #[error("host buffer size cannot be zero")]
    ZeroSize,
    #[error("call to memfd_create failed: {0}")]
    FailedToCreate(#[from] Errno),
    #[error("failed to set size of memfd: {0}")]
    FailedToSetSize(io::Error),
    #[error("failed to seal memfd: {0}")]
    FailedToSeal(io::Error),
}

#[derive(Debug, Error)]
pub enum HostBufferMapError {
    #[error("buffer size {0} larger than usize")]
    BufferTooLarge(u64),
    #[error("mmap call returned error: {0}")]
    Mmap(#[from] Errno),
}

/// A fixed-size chunk of host memory allocated through `memfd`.
///
/// The backing file is sealed against resizing, so the size registered with
/// the mapping manager stays true for the buffer's whole lifetime.
pub struct HostBuffer {
    file: File,
    size: NonZeroU64,
}

impl HostBuffer {
    pub fn new(size: u64) -> Result<Self, NewHostBufferError> {
        let size = NonZeroU64::new(size).ok_or(NewHostBufferError::ZeroSize)?;

        let fd = memfd_create(c"", MemFdCreateFlag::MFD_ALLOW_SEALING)?;
        let file: File = fd.into();

        file.set_len(size.into())
            .map_err(NewHostBufferError::FailedToSetSize)?;

        // SAFETY: `file` is a valid file.
        if unsafe {
            libc::fcntl(
                file.as_raw_fd(),
                libc::F_ADD_SEALS,
                libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL,
            )
        } < 0
        {
            return Err(NewHostBufferError::FailedToSeal(io::Error::last_os_error()));
        }

        Ok(Self { file, size })
    }

    pub fn size(&self) -> u64 {
        self.size.into()
    }

    pub fn as_file(&self) -> &File {
        &self.file
    }

    /// Maps the whole buffer into the host address space for CPU access.
    pub fn map(&self) -> Result<HostBufferMapping, HostBufferMapError> {
        let size = NonZeroUsize::try_from(self.size)
            .map_err(|_| HostBufferMapError::BufferTooLarge(self.size.into()))?;

        // SAFETY: `self.file` is a valid file.
        let data = unsafe {
            mman::mmap(
                None,
                size,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                &self.file,
                0,
            )?
        };

        Ok(HostBufferMapping {
            // SAFETY: `data` is non-null and obtained through a `mmap` of
            // size `size`.
            data: unsafe { slice::from_raw_parts_mut(data.as_ptr().cast(), size.into()) },
        })
    }
}

impl AsFd for HostBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for HostBuffer {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl From<HostBuffer> for File {
    fn from(buffer: HostBuffer) -> Self {
        buffer.file
    }
}

/// A CPU mapping of a [`HostBuffer`].
pub struct HostBufferMapping {
    // The mapping stays valid until we munmap it in `drop`, hence the static
    // lifetime.
    data: &'static mut [u8],
}

impl HostBufferMapping {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Drop for HostBufferMapping {
    fn drop(&mut self) {
        // SAFETY: pointer and length come from a successful `mmap` and the
        // region has not been unmapped yet.
        unsafe {
            mman::munmap(
                NonNull::new_unchecked(self.data.as_mut_ptr().cast()),
                self.data.len(),
            )
        }
        .unwrap_or_else(|e| {
            log::error!("error while unmapping host buffer: {}", e);
        });
    }
}

impl AsRef<[u8]> for HostBufferMapping {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

impl AsMut<[u8]> for HostBufferMapping {
    fn as_mut(&mut self) -> &mut [u8] {
        self.data
    }
}
