// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire representations of the media API structures carried by ioctl
//! payloads: formats, buffers and their planes, extended controls and event
//! subscriptions.
//!
//! These mirror the non-virtualized API the protocol tunnels, with one
//! simplification: buffers are uniformly multi-planar. A buffer's plane array
//! is always serialized right after [`WireBuffer`], so there is no separate
//! single-planar layout to negotiate.

use enumn::N;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Maximum number of planes a buffer can carry.
pub const MAX_PLANES: usize = 8;

/// Builds a pixel format code from its FourCC representation.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Direction of a buffer queue, from the device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDirection {
    /// The device produces data into the buffers (e.g. camera capture).
    Capture,
    /// The driver produces data for the device to consume.
    Output,
}

/// Type of a buffer queue.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum QueueType {
    VideoCapture = 1,
    VideoOutput = 2,
}

impl QueueType {
    pub fn direction(self) -> QueueDirection {
        match self {
            QueueType::VideoCapture => QueueDirection::Capture,
            QueueType::VideoOutput => QueueDirection::Output,
        }
    }
}

/// How the backing storage of a buffer is provisioned and described.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryType {
    /// Host-allocated storage, accessed by the driver through MMAP/MUNMAP
    /// commands.
    Mmap = 1,
    /// Guest-allocated storage, described by per-plane scatter-gather lists
    /// inlined in the command payload.
    GuestSg = 2,
    /// Storage identified by a handle to an object provisioned through a
    /// separate sharing mechanism. The handle is opaque to the device.
    SharedObject = 3,
}

/// Buffer capability flags reported by REQBUFS.
pub const BUFFER_CAP_MMAP: u32 = 1 << 0;
pub const BUFFER_CAP_GUEST_SG: u32 = 1 << 1;
pub const BUFFER_CAP_SHARED_OBJECT: u32 = 1 << 2;

/// The buffer is queued to the device and its backing storage must not be
/// touched by the driver.
pub const BUFFER_FLAG_QUEUED: u32 = 1 << 0;
/// The buffer has been processed and carries valid data.
pub const BUFFER_FLAG_DONE: u32 = 1 << 1;
/// Processing of the buffer failed.
pub const BUFFER_FLAG_ERROR: u32 = 1 << 2;

/// Per-plane format information.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct PlaneFormat {
    /// Size of a whole plane in bytes.
    pub sizeimage: u32,
    /// Distance in bytes between two consecutive lines.
    pub stride: u32,
}

/// Format of a buffer queue. Payload of the G_FMT, S_FMT and TRY_FMT ioctls.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct VideoFormat {
    /// One of [`QueueType`].
    pub queue: u32,
    /// FourCC pixel format code.
    pub pixelformat: u32,
    pub width: u32,
    pub height: u32,
    pub colorspace: u32,
    pub num_planes: u32,
    /// Plane formats; entries past `num_planes` are zero.
    pub plane_fmt: [PlaneFormat; MAX_PLANES],
}

/// One enumerated format. Payload of the ENUM_FMT ioctl.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct FormatDesc {
    /// One of [`QueueType`].
    pub queue: u32,
    /// Index of the enumerated entry, driver-chosen.
    pub index: u32,
    pub flags: u32,
    pub pixelformat: u32,
    /// Human-readable description, NUL-padded.
    pub description: [u8; 32],
}

/// Payload of the REQBUFS ioctl.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct RequestBuffers {
    /// One of [`QueueType`].
    pub queue: u32,
    /// One of [`MemoryType`].
    pub memory: u32,
    pub count: u32,
    /// `BUFFER_CAP_*` flags, set by the device on return.
    pub capabilities: u32,
}

/// Fixed part of a buffer as it transits on the wire. Payload of the
/// QUERYBUF and QBUF ioctls and part of the dequeue event.
///
/// `num_planes` [`WirePlane`] entries follow this struct in the payload. For
/// [`MemoryType::GuestSg`] buffers in a QBUF command, each plane with a
/// non-zero length is additionally followed (after the whole plane array, in
/// plane order) by a scatter-gather list describing its backing memory.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct WireBuffer {
    /// One of [`QueueType`].
    pub queue: u32,
    pub index: u32,
    /// One of [`MemoryType`].
    pub memory: u32,
    /// `BUFFER_FLAG_*` flags.
    pub flags: u32,
    pub sequence: u32,
    pub num_planes: u32,
    pub timestamp_sec: u64,
    pub timestamp_usec: u64,
    /// Opaque driver-side token for the plane array. Echoed unchanged in
    /// responses; nulled in dequeue events.
    pub planes_ptr: u64,
}

/// Per-plane state of a wire buffer.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct WirePlane {
    pub bytesused: u32,
    pub length: u32,
    pub data_offset: u32,
    _padding: u32,
    /// Opaque backing descriptor: MMAP range offset for [`MemoryType::Mmap`],
    /// driver-side address token for [`MemoryType::GuestSg`], object handle
    /// for [`MemoryType::SharedObject`]. Never dereferenced by the device.
    pub backing: u64,
}

/// Selector for the control set targeted by an extended-controls ioctl.
pub const CTRL_WHICH_CURRENT: u32 = 0;
pub const CTRL_WHICH_DEFAULT: u32 = 1;

/// Fixed part of an extended-controls payload (G_EXT_CTRLS, S_EXT_CTRLS,
/// TRY_EXT_CTRLS).
///
/// `count` [`Control`] entries follow this struct; each control with a
/// non-zero `size` is then followed (after the whole array, in array order)
/// by the scatter-gather list of its payload.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct ControlArray {
    /// One of the `CTRL_WHICH_*` selectors.
    pub which: u32,
    pub count: u32,
    /// Index of the failing control, set by the device when an
    /// extended-controls operation fails.
    pub error_idx: u32,
    _padding: u32,
    /// Opaque driver-side token for the control array, echoed unchanged.
    pub controls_ptr: u64,
}

/// One extended control.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct Control {
    pub id: u32,
    /// Size of the control's out-of-band payload; zero for scalar controls.
    pub size: u32,
    pub value: i64,
    /// Opaque driver-side token for the payload, echoed unchanged.
    pub payload_ptr: u64,
}

/// Device event types that can be subscribed to.
pub const EVENT_EOS: u32 = 1;
pub const EVENT_SOURCE_CHANGE: u32 = 2;
pub const EVENT_CTRL_CHANGE: u32 = 3;

/// Payload of the SUBSCRIBE_EVENT and UNSUBSCRIBE_EVENT ioctls.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct EventSubscription {
    /// One of the `EVENT_*` types.
    pub event_type: u32,
    /// Event-specific source id (e.g. control id for `EVENT_CTRL_CHANGE`).
    pub id: u32,
    pub flags: u32,
    _padding: u32,
}

impl EventSubscription {
    pub fn new(event_type: u32, id: u32) -> Self {
        Self {
            event_type,
            id,
            flags: 0,
            _padding: 0,
        }
    }
}

/// A fired device event, carried in a session event.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct DeviceEvent {
    /// One of the `EVENT_*` types.
    pub event_type: u32,
    /// Event-specific source id.
    pub id: u32,
    pub sequence: u32,
    _padding: u32,
    /// Event-specific payload, as defined by the non-virtualized API.
    pub data: [u8; 48],
}

impl DeviceEvent {
    pub fn new(event_type: u32, id: u32, sequence: u32) -> Self {
        Self {
            event_type,
            id,
            sequence,
            _padding: 0,
            data: [0; 48],
        }
    }
}
