// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Traits for reading commands from and writing responses to the sections of
//! a descriptor chain.
//!
//! The wire format is little-endian, with no guarantee that the host is too.
//! Every type transiting on a virtqueue implements [`WireType`], and the
//! sealed [`ReadFromDescriptorChain`] / [`WriteToDescriptorChain`] extension
//! traits are the only way in or out of a descriptor chain, so transiting
//! data is always wrapped into [`LeWrapper`] and thus in wire representation.
//!
//! Any implementor of [`std::io::Read`] can serve as the device-readable
//! section of a chain, and any [`std::io::Write`] as the device-writable one.

use std::io::Result as IoResult;
use std::mem::MaybeUninit;

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

#[cfg(target_endian = "little")]
mod le;
#[cfg(target_endian = "little")]
pub use le::*;

#[cfg(target_endian = "big")]
mod be;
#[cfg(target_endian = "big")]
pub use be::*;

use crate::protocol::RespHeader;

/// Seals for [`ReadFromDescriptorChain`] and [`WriteToDescriptorChain`] so no
/// implementations can be added outside of this crate.
mod private {
    pub trait RSealed {}
    impl<R> RSealed for R where R: std::io::Read {}

    pub trait WSealed {}
    impl<W> WSealed for W where W: std::io::Write {}
}

/// Extension trait for reading protocol objects from the device-readable
/// section of a descriptor chain, converting them from little-endian to the
/// native endianness of the host.
pub trait ReadFromDescriptorChain: private::RSealed {
    fn read_obj<T: WireType>(&mut self) -> IoResult<T>;
}

impl<R> ReadFromDescriptorChain for R
where
    R: std::io::Read,
{
    fn read_obj<T: WireType>(&mut self) -> IoResult<T> {
        // `zeroed` instead of `uninit` because `read_exact` cannot be handed
        // uninitialized memory.
        let mut obj: MaybeUninit<LeWrapper<T>> = MaybeUninit::zeroed();
        // SAFETY: the slice covers exactly `obj` and does not outlive it.
        let slice = unsafe {
            std::slice::from_raw_parts_mut(obj.as_mut_ptr() as *mut u8, std::mem::size_of::<T>())
        };

        self.read_exact(slice)?;

        // SAFETY: `obj` has been fully initialized from the chain bytes.
        Ok(unsafe { obj.assume_init() }.into_native())
    }
}

/// Extension trait for writing protocol objects and responses into the
/// device-writable section of a descriptor chain, after converting them to
/// little-endian representation.
pub trait WriteToDescriptorChain: private::WSealed {
    /// Write an arbitrary wire object to the driver.
    fn write_obj<T: WireType>(&mut self, obj: T) -> IoResult<()>;

    /// Write a command response to the driver.
    fn write_response<T: WireType>(&mut self, response: T) -> IoResult<()> {
        self.write_obj(response)
    }

    /// Send `code` as the error code of an error response.
    fn write_err_response(&mut self, code: libc::c_int) -> IoResult<()> {
        self.write_response(RespHeader::err(code))
    }
}

impl<W> WriteToDescriptorChain for W
where
    W: std::io::Write,
{
    fn write_obj<T: WireType>(&mut self, obj: T) -> IoResult<()> {
        self.write_all(obj.to_le().as_bytes())
    }
}

/// Wrapper guaranteeing that the contained object is in little-endian
/// representation.
///
/// Wrapped objects are inaccessible other than through
/// [`Self::into_native`], which converts them back to host ordering.
#[repr(transparent)]
pub struct LeWrapper<T: WireType>(T);

impl<T: WireType> LeWrapper<T> {
    /// Convert the wrapped object back to native ordering and return it.
    pub fn into_native(self) -> T {
        T::from_le(self)
    }
}

unsafe impl<T: WireType> FromZeroes for LeWrapper<T> {
    fn only_derive_is_allowed_to_implement_this_trait() {}
}

unsafe impl<T: WireType> FromBytes for LeWrapper<T> {
    fn only_derive_is_allowed_to_implement_this_trait() {}
}

unsafe impl<T: WireType> AsBytes for LeWrapper<T> {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}
