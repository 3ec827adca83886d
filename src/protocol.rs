// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire definitions of the virtio-vstream protocol: command and response
//! structures carried on the command queue, and event structures carried on
//! the event queue.
//!
//! All structures are `#[repr(C)]` and little-endian on the wire. Structures
//! read from the driver derive [`FromBytes`], structures written to the driver
//! derive [`AsBytes`].

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::types::DeviceEvent;
use crate::types::WireBuffer;
use crate::types::WirePlane;
use crate::types::MAX_PLANES;

const DEVICE_NAME_LEN: usize = 32;

/// Read-only device configuration, exposed to the driver out-of-band (i.e.
/// through the transport's configuration space, not the command queue).
#[derive(Debug, AsBytes)]
#[repr(C)]
pub struct DeviceConfig {
    /// Capability flags of the device.
    pub caps: u32,
    /// Class of the device (e.g. video capture vs. output).
    pub device_class: u32,
    /// Short human-readable device name, NUL-padded.
    pub name: [u8; DEVICE_NAME_LEN],
}

impl DeviceConfig {
    pub fn new(caps: u32, device_class: u32, name: &str) -> Self {
        let mut padded = [0u8; DEVICE_NAME_LEN];
        // Truncate, keeping at least one terminating NUL.
        let len = name.len().min(DEVICE_NAME_LEN - 1);
        padded[..len].copy_from_slice(&name.as_bytes()[..len]);

        Self {
            caps,
            device_class,
            name: padded,
        }
    }
}

impl AsRef<[u8]> for DeviceConfig {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Device classes advertised in [`DeviceConfig::device_class`].
pub const VSTREAM_CLASS_CAPTURE: u32 = 1;
pub const VSTREAM_CLASS_OUTPUT: u32 = 2;

pub const VSTREAM_CMD_OPEN: u32 = 1;
pub const VSTREAM_CMD_CLOSE: u32 = 2;
pub const VSTREAM_CMD_IOCTL: u32 = 3;
pub const VSTREAM_CMD_MMAP: u32 = 4;
pub const VSTREAM_CMD_MUNMAP: u32 = 5;

/// Request a writable mapping for a MMAP command.
pub const VSTREAM_MMAP_FLAG_RW: u32 = 1 << 0;

/// One entry of a guest scatter-gather list.
///
/// `start` is a guest physical address. The device never dereferences it
/// directly; it is either handed to a
/// [`GuestMemoryMapper`](crate::GuestMemoryMapper) or echoed back verbatim.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct SgEntry {
    pub start: u64,
    pub len: u32,
    _padding: u32,
}

impl SgEntry {
    pub fn new(start: u64, len: u32) -> Self {
        Self {
            start,
            len,
            _padding: 0,
        }
    }
}

/// Header starting every command descriptor chain.
#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes)]
pub struct CmdHeader {
    pub cmd: u32,
    _padding: u32,
}

impl CmdHeader {
    pub fn new(cmd: u32) -> Self {
        Self { cmd, _padding: 0 }
    }
}

/// Header starting every response.
#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes, AsBytes)]
pub struct RespHeader {
    pub errno: i32,
    _padding: u32,
}

impl RespHeader {
    pub fn ok() -> Self {
        Self {
            errno: 0,
            _padding: 0,
        }
    }

    pub fn err(errno: i32) -> Self {
        Self { errno, _padding: 0 }
    }
}

#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes)]
pub struct OpenCmd {}

#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes, AsBytes)]
pub struct OpenResp {
    pub hdr: RespHeader,
    pub session_id: u32,
    _padding: u32,
}

impl OpenResp {
    pub fn ok(session_id: u32) -> Self {
        Self {
            hdr: RespHeader::ok(),
            session_id,
            _padding: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes)]
pub struct CloseCmd {
    pub session_id: u32,
    _padding: u32,
}

impl CloseCmd {
    pub fn new(session_id: u32) -> Self {
        Self {
            session_id,
            _padding: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes)]
pub struct IoctlCmd {
    pub session_id: u32,
    /// Full 32-bit ioctl code, carrying direction, payload size, type and
    /// sequence number. See [`crate::ioctl`].
    pub code: u32,
}

#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes)]
pub struct MmapCmd {
    pub session_id: u32,
    pub flags: u32,
    /// Offset of the buffer plane in the device's MMAP range.
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes, AsBytes)]
pub struct MmapResp {
    pub hdr: RespHeader,
    pub driver_addr: u64,
    pub len: u64,
}

impl MmapResp {
    pub fn ok(driver_addr: u64, len: u64) -> Self {
        Self {
            hdr: RespHeader::ok(),
            driver_addr,
            len,
        }
    }
}

#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes)]
pub struct MunmapCmd {
    pub session_id: u32,
    _padding: u32,
    pub driver_addr: u64,
}

impl MunmapCmd {
    pub fn new(session_id: u32, driver_addr: u64) -> Self {
        Self {
            session_id,
            _padding: 0,
            driver_addr,
        }
    }
}

#[repr(C)]
#[derive(Debug, FromZeroes, FromBytes, AsBytes)]
pub struct MunmapResp {
    pub hdr: RespHeader,
}

impl MunmapResp {
    pub fn ok() -> Self {
        Self {
            hdr: RespHeader::ok(),
        }
    }
}

pub const VSTREAM_EVENT_ERROR: u32 = 0;
pub const VSTREAM_EVENT_DQBUF: u32 = 1;
pub const VSTREAM_EVENT_SESSION: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes)]
pub struct EventHeader {
    pub event: u32,
    pub session_id: u32,
}

impl EventHeader {
    fn new(event: u32, session_id: u32) -> Self {
        Self { event, session_id }
    }
}

/// Session-fatal device error. After receiving one the driver should consider
/// the session dead and close it.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct ErrorEvent {
    pub hdr: EventHeader,
    pub errno: i32,
    _padding: u32,
}

impl ErrorEvent {
    pub fn new(session_id: u32, errno: i32) -> Self {
        Self {
            hdr: EventHeader::new(VSTREAM_EVENT_ERROR, session_id),
            errno,
            _padding: 0,
        }
    }
}

/// Notification that a previously queued buffer has completed.
///
/// Carries the buffer's final state snapshot. The full plane array is always
/// present on the wire; entries past `buffer.num_planes` are zero.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct DequeueBufferEvent {
    pub hdr: EventHeader,
    pub buffer: WireBuffer,
    pub planes: [WirePlane; MAX_PLANES],
}

impl DequeueBufferEvent {
    /// Formats a completed buffer for emission.
    ///
    /// The plane array token of `buffer` is nulled: its value is meaningless
    /// to the driver once the buffer is back in its hands and must not carry
    /// anything host-side. Per-plane `backing` tokens are guest property and
    /// are carried through unchanged.
    pub fn new(session_id: u32, mut buffer: WireBuffer, planes: &[WirePlane]) -> Self {
        buffer.planes_ptr = 0;
        let mut wire_planes = [WirePlane::default(); MAX_PLANES];
        for (dst, src) in wire_planes.iter_mut().zip(planes.iter()) {
            *dst = *src;
        }

        Self {
            hdr: EventHeader::new(VSTREAM_EVENT_DQBUF, session_id),
            buffer,
            planes: wire_planes,
        }
    }
}

/// A subscribed device event fired.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct SessionEvent {
    pub hdr: EventHeader,
    pub event: DeviceEvent,
}

impl SessionEvent {
    pub fn new(session_id: u32, event: DeviceEvent) -> Self {
        Self {
            hdr: EventHeader::new(VSTREAM_EVENT_SESSION, session_id),
            event,
        }
    }
}

/// An event to be sent to the driver over the event queue.
#[allow(clippy::large_enum_variant)]
pub enum VstreamEvent {
    Error(ErrorEvent),
    DequeueBuffer(DequeueBufferEvent),
    Session(SessionEvent),
}
