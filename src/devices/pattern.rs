// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Capture device generating a color pattern into the buffers queued by the
//! guest.
//!
//! This module illustrates how to write a device for virtio-vstream, and is
//! also useful to test VMMs and guests without dedicated hardware support.
//! The device exposes a single-planar `RGB3` and a two-planar `NV12` format
//! at a negotiable resolution and supports both host-allocated (MMAP) and
//! guest-provided (scatter-gather) buffers.

use std::collections::HashSet;
use std::io::Result as IoResult;
use std::os::fd::AsFd;
use std::sync::Mutex;

use crate::buffers::BufferQueue;
use crate::buffers::BufferSlot;
use crate::buffers::PlaneBacking;
use crate::buffers::PlaneSlot;
use crate::events::EventQueue;
use crate::ioctl::dispatch_ioctl;
use crate::ioctl::IoctlHandler;
use crate::ioctl::IoctlResult;
use crate::memfd::HostBuffer;
use crate::mmap::MmapRangeManager;
use crate::protocol::DequeueBufferEvent;
use crate::protocol::DeviceConfig;
use crate::protocol::SessionEvent;
use crate::protocol::SgEntry;
use crate::protocol::VSTREAM_CLASS_CAPTURE;
use crate::protocol::VSTREAM_MMAP_FLAG_RW;
use crate::types::fourcc;
use crate::types::Control;
use crate::types::ControlArray;
use crate::types::DeviceEvent;
use crate::types::EventSubscription;
use crate::types::FormatDesc;
use crate::types::MemoryType;
use crate::types::PlaneFormat;
use crate::types::QueueDirection;
use crate::types::QueueType;
use crate::types::RequestBuffers;
use crate::types::VideoFormat;
use crate::types::WireBuffer;
use crate::types::WirePlane;
use crate::types::BUFFER_CAP_GUEST_SG;
use crate::types::BUFFER_CAP_MMAP;
use crate::types::CTRL_WHICH_DEFAULT;
use crate::types::EVENT_CTRL_CHANGE;
use crate::types::MAX_PLANES;
use crate::GuestMemoryMapper;
use crate::GuestMemoryRange;
use crate::HostMemoryMapper;
use crate::VstreamDevice;

const PIXELFORMAT_RGB3: u32 = fourcc(b"RGB3");
const PIXELFORMAT_NV12: u32 = fourcc(b"NV12");
const BYTES_PER_PIXEL: u32 = 3;
const MIN_WIDTH: u32 = 16;
const MAX_WIDTH: u32 = 1920;
const MIN_HEIGHT: u32 = 16;
const MAX_HEIGHT: u32 = 1080;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
// sRGB, as the non-virtualized API numbers colorspaces.
const COLORSPACE_SRGB: u32 = 8;

const MAX_BUFFERS: u32 = 32;
const BUFFER_CAPS: u32 = BUFFER_CAP_MMAP | BUFFER_CAP_GUEST_SG;

/// Control selecting the base value of the generated pattern.
pub const CTRL_FILL_VALUE: u32 = 0x00f0_0001;
const DEFAULT_FILL_VALUE: u8 = 0xff;

/// Configuration space contents advertising this device.
pub fn config() -> DeviceConfig {
    DeviceConfig::new(0, VSTREAM_CLASS_CAPTURE, "pattern generator")
}

/// Constrains `format` to what the device can actually produce. Any
/// pixelformat other than `NV12` falls back to `RGB3`.
fn adjust_format(format: VideoFormat) -> VideoFormat {
    let mut width = format.width.clamp(MIN_WIDTH, MAX_WIDTH);
    let mut height = format.height.clamp(MIN_HEIGHT, MAX_HEIGHT);

    let mut plane_fmt = [PlaneFormat::default(); MAX_PLANES];
    let (pixelformat, num_planes) = if format.pixelformat == PIXELFORMAT_NV12 {
        // Chroma is subsampled 2x2, so dimensions must be even.
        width &= !1;
        height &= !1;
        plane_fmt[0] = PlaneFormat {
            sizeimage: width * height,
            stride: width,
        };
        plane_fmt[1] = PlaneFormat {
            sizeimage: width * height / 2,
            stride: width,
        };
        (PIXELFORMAT_NV12, 2)
    } else {
        let stride = width * BYTES_PER_PIXEL;
        plane_fmt[0] = PlaneFormat {
            sizeimage: stride * height,
            stride,
        };
        (PIXELFORMAT_RGB3, 1)
    };

    VideoFormat {
        queue: QueueType::VideoCapture as u32,
        pixelformat,
        width,
        height,
        colorspace: COLORSPACE_SRGB,
        num_planes,
        plane_fmt,
    }
}

fn format_desc(index: u32) -> Option<FormatDesc> {
    let (pixelformat, name) = match index {
        0 => (PIXELFORMAT_RGB3, &b"24-bit RGB 8-8-8"[..]),
        1 => (PIXELFORMAT_NV12, &b"Y/CbCr 4:2:0"[..]),
        _ => return None,
    };

    let mut description = [0u8; 32];
    description[..name.len()].copy_from_slice(name);

    Some(FormatDesc {
        queue: QueueType::VideoCapture as u32,
        index,
        flags: 0,
        pixelformat,
        description,
    })
}

fn frame_color(fill: u8, sequence: u32) -> [u8; 3] {
    [
        fill.wrapping_add(sequence as u8),
        0x55u8.wrapping_mul(sequence as u8 % 3),
        0x10u8.wrapping_mul(sequence as u8 % 16),
    ]
}

/// Fills one plane of a frame with the pattern.
fn fill_plane(data: &mut [u8], pixelformat: u32, plane: usize, fill: u8, sequence: u32) {
    if pixelformat == PIXELFORMAT_NV12 {
        // Uniform luma derived from the fill value, neutral chroma.
        let value = if plane == 0 {
            fill.wrapping_add(sequence as u8)
        } else {
            0x80
        };
        data.fill(value);
    } else {
        let color = frame_color(fill, sequence);
        for pixel in data.chunks_exact_mut(BYTES_PER_PIXEL as usize) {
            pixel.copy_from_slice(&color);
        }
    }
}

/// Session state of [`PatternCaptureDevice`].
pub struct PatternSession {
    id: u32,
    /// Negotiated capture format.
    format: VideoFormat,
    /// Buffer state of the capture queue.
    buffers: BufferQueue,
    /// Host storage of MMAP buffers, indexed by buffer then plane. Empty for
    /// guest-provided memory.
    backing: Vec<Vec<HostBuffer>>,
    /// Base value of the generated pattern, driven by [`CTRL_FILL_VALUE`].
    fill_value: u8,
    /// Number of frames generated so far.
    frame_counter: u64,
    /// Sequence counter of emitted session events.
    event_sequence: u32,
    /// Subscribed `(event_type, id)` pairs.
    subscriptions: HashSet<(u32, u32)>,
}

struct DeviceState<HM: HostMemoryMapper> {
    mmap: MmapRangeManager<HM>,
    /// Id of the session holding allocated buffers, if any. Only one session
    /// can drive the generator at a time, as with actual capture hardware.
    active_session: Option<u32>,
}

/// A video capture device generating frames of uniform color.
pub struct PatternCaptureDevice<Q, M, HM>
where
    Q: EventQueue,
    M: GuestMemoryMapper,
    HM: HostMemoryMapper,
{
    evt_queue: Q,
    guest_mem: M,
    state: Mutex<DeviceState<HM>>,
}

impl<Q, M, HM> PatternCaptureDevice<Q, M, HM>
where
    Q: EventQueue,
    M: GuestMemoryMapper,
    HM: HostMemoryMapper,
{
    pub fn new(evt_queue: Q, guest_mem: M, mapper: HM) -> Self {
        Self {
            evt_queue,
            guest_mem,
            state: Mutex::new(DeviceState {
                mmap: MmapRangeManager::from(mapper),
                active_session: None,
            }),
        }
    }

    /// Generates the pattern into all queued buffers and emits a dequeue
    /// event for each of them.
    fn process_queued_buffers(&self, session: &mut PatternSession) -> IoctlResult<()> {
        while let Some(index) = session.buffers.pop_queued() {
            let sequence = session.frame_counter as u32;
            let pixelformat = session.format.pixelformat;
            let planes: Vec<(u32, PlaneBacking)> = session
                .buffers
                .slot(index)
                .ok_or(libc::EIO)?
                .planes()
                .iter()
                .map(|plane| (plane.length, plane.backing.clone()))
                .collect();

            let mut bytesused = Vec::with_capacity(planes.len());
            for (plane_index, (length, backing)) in planes.into_iter().enumerate() {
                match backing {
                    PlaneBacking::Mmap { .. } => {
                        let host = session
                            .backing
                            .get(index as usize)
                            .and_then(|planes| planes.get(plane_index))
                            .ok_or(libc::EIO)?;
                        let mut mapping = host.map().map_err(|e| {
                            log::error!("failed to map MMAP buffer for filling: {}", e);
                            libc::EIO
                        })?;
                        fill_plane(
                            &mut mapping.as_mut()[..length as usize],
                            pixelformat,
                            plane_index,
                            session.fill_value,
                            sequence,
                        );
                    }
                    PlaneBacking::GuestSg { regions, .. } => {
                        let mut mapping = self.guest_mem.new_mapping(regions).map_err(|e| {
                            log::error!("failed to map guest buffer for filling: {:#}", e);
                            libc::EIO
                        })?;
                        // SAFETY: the mapping covers the `length` bytes
                        // described by the validated SG list of the plane.
                        let data = unsafe {
                            std::slice::from_raw_parts_mut(mapping.as_mut_ptr(), length as usize)
                        };
                        fill_plane(data, pixelformat, plane_index, session.fill_value, sequence);
                    }
                    PlaneBacking::SharedObject { .. } => return Err(libc::EIO),
                }
                bytesused.push(length);
            }

            let (buffer, planes) = session.buffers.finish(index, sequence, &bytesused)?;
            session.frame_counter += 1;

            self.evt_queue
                .send_dequeue_buffer(DequeueBufferEvent::new(session.id, buffer, &planes));
        }

        Ok(())
    }

    /// Validates a control array against the controls this device exposes.
    fn check_controls(ctrls: &mut ControlArray, ctrl_array: &[Control]) -> IoctlResult<()> {
        for (index, ctrl) in ctrl_array.iter().enumerate() {
            if ctrl.id != CTRL_FILL_VALUE || ctrl.size != 0 {
                ctrls.error_idx = index as u32;
                return Err(libc::EINVAL);
            }
            if !(0..=255).contains(&ctrl.value) {
                ctrls.error_idx = index as u32;
                return Err(libc::ERANGE);
            }
        }

        Ok(())
    }
}

impl<Q, M, HM> IoctlHandler for PatternCaptureDevice<Q, M, HM>
where
    Q: EventQueue,
    M: GuestMemoryMapper,
    HM: HostMemoryMapper,
{
    type Session = PatternSession;

    fn enum_fmt(
        &self,
        _session: &Self::Session,
        queue: QueueType,
        index: u32,
    ) -> IoctlResult<FormatDesc> {
        if queue.direction() != QueueDirection::Capture {
            return Err(libc::EINVAL);
        }

        format_desc(index).ok_or(libc::EINVAL)
    }

    fn g_fmt(&self, session: &Self::Session, queue: QueueType) -> IoctlResult<VideoFormat> {
        if queue.direction() != QueueDirection::Capture {
            return Err(libc::EINVAL);
        }

        Ok(session.format)
    }

    fn s_fmt(
        &self,
        session: &mut Self::Session,
        queue: QueueType,
        format: VideoFormat,
    ) -> IoctlResult<VideoFormat> {
        if queue.direction() != QueueDirection::Capture {
            return Err(libc::EINVAL);
        }
        // The format is locked while buffers are allocated.
        if session.buffers.num_slots() > 0 {
            return Err(libc::EBUSY);
        }

        session.format = adjust_format(format);

        Ok(session.format)
    }

    fn try_fmt(
        &self,
        _session: &Self::Session,
        queue: QueueType,
        format: VideoFormat,
    ) -> IoctlResult<VideoFormat> {
        if queue.direction() != QueueDirection::Capture {
            return Err(libc::EINVAL);
        }

        Ok(adjust_format(format))
    }

    fn reqbufs(
        &self,
        session: &mut Self::Session,
        queue: QueueType,
        memory: MemoryType,
        count: u32,
    ) -> IoctlResult<RequestBuffers> {
        if queue.direction() != QueueDirection::Capture {
            return Err(libc::EINVAL);
        }
        if !matches!(memory, MemoryType::Mmap | MemoryType::GuestSg) {
            return Err(libc::EINVAL);
        }
        if session.buffers.is_streaming() {
            return Err(libc::EBUSY);
        }

        let mut state = self.state.lock().unwrap();

        // Only one session can hold buffers at a time.
        match state.active_session {
            Some(id) if id != session.id => return Err(libc::EBUSY),
            _ => (),
        }

        // Any previous MMAP allocation gives its range offsets back.
        for slot_index in 0..session.buffers.num_slots() {
            if let Some(slot) = session.buffers.slot(slot_index as u32) {
                for plane in slot.planes() {
                    if let PlaneBacking::Mmap { mem_offset } = plane.backing {
                        state.mmap.unregister_buffer(mem_offset);
                    }
                }
            }
        }
        session.buffers.reset();
        session.backing.clear();

        // A count of zero frees the buffers and releases the device.
        if count == 0 {
            state.active_session = None;
            return Ok(RequestBuffers {
                queue: queue as u32,
                memory: memory as u32,
                count: 0,
                capabilities: BUFFER_CAPS,
            });
        }

        let count = std::cmp::min(count, MAX_BUFFERS);
        let num_planes = session.format.num_planes as usize;

        let slots = match memory {
            MemoryType::Mmap => {
                let mut slots = Vec::with_capacity(count as usize);
                for index in 0..count {
                    let mut planes = Vec::with_capacity(num_planes);
                    let mut plane_backing = Vec::with_capacity(num_planes);
                    for plane_fmt in &session.format.plane_fmt[..num_planes] {
                        let host =
                            HostBuffer::new(u64::from(plane_fmt.sizeimage)).map_err(|e| {
                                log::error!("failed to allocate MMAP buffer storage: {:#}", e);
                                libc::ENOMEM
                            })?;
                        let offset = state
                            .mmap
                            .register_buffer(None, u64::from(plane_fmt.sizeimage))
                            .map_err(|e| e.into_errno())?;

                        plane_backing.push(host);
                        planes.push(PlaneSlot::new(
                            plane_fmt.sizeimage,
                            PlaneBacking::Mmap { mem_offset: offset },
                        ));
                    }

                    session.backing.push(plane_backing);
                    slots.push(BufferSlot::new(index, planes));
                }
                slots
            }
            // Guest memory is described at QBUF time; slots start empty.
            MemoryType::GuestSg => (0..count)
                .map(|index| {
                    let planes = (0..num_planes)
                        .map(|_| {
                            PlaneSlot::new(
                                0,
                                PlaneBacking::GuestSg {
                                    token: 0,
                                    regions: Vec::new(),
                                },
                            )
                        })
                        .collect();
                    BufferSlot::new(index, planes)
                })
                .collect(),
            MemoryType::SharedObject => unreachable!(),
        };

        session.buffers.set_slots(memory, slots);
        state.active_session = Some(session.id);

        Ok(RequestBuffers {
            queue: queue as u32,
            memory: memory as u32,
            count,
            capabilities: BUFFER_CAPS,
        })
    }

    fn querybuf(
        &self,
        session: &Self::Session,
        queue: QueueType,
        index: u32,
    ) -> IoctlResult<(WireBuffer, Vec<WirePlane>)> {
        if queue.direction() != QueueDirection::Capture {
            return Err(libc::EINVAL);
        }

        session.buffers.query(index)
    }

    fn qbuf(
        &self,
        session: &mut Self::Session,
        buffer: WireBuffer,
        planes: Vec<WirePlane>,
        sg_lists: Vec<Vec<SgEntry>>,
    ) -> IoctlResult<(WireBuffer, Vec<WirePlane>)> {
        if QueueType::n(buffer.queue).map(QueueType::direction) != Some(QueueDirection::Capture) {
            return Err(libc::EINVAL);
        }

        let response = session.buffers.queue_buffer(buffer, planes, sg_lists)?;

        if session.buffers.is_streaming() {
            self.process_queued_buffers(session)?;
        }

        Ok(response)
    }

    fn streamon(&self, session: &mut Self::Session, queue: QueueType) -> IoctlResult<()> {
        if queue.direction() != QueueDirection::Capture || session.buffers.num_slots() == 0 {
            return Err(libc::EINVAL);
        }

        session.buffers.streamon();
        self.process_queued_buffers(session)
    }

    fn streamoff(&self, session: &mut Self::Session, queue: QueueType) -> IoctlResult<()> {
        if queue.direction() != QueueDirection::Capture {
            return Err(libc::EINVAL);
        }

        session.buffers.streamoff();

        Ok(())
    }

    fn g_input(&self, _session: &Self::Session) -> IoctlResult<i32> {
        Ok(0)
    }

    fn g_ext_ctrls(
        &self,
        session: &Self::Session,
        which: u32,
        ctrls: &mut ControlArray,
        ctrl_array: &mut Vec<Control>,
        _sg_lists: Vec<Vec<SgEntry>>,
    ) -> IoctlResult<()> {
        for (index, ctrl) in ctrl_array.iter_mut().enumerate() {
            if ctrl.id != CTRL_FILL_VALUE || ctrl.size != 0 {
                ctrls.error_idx = index as u32;
                return Err(libc::EINVAL);
            }
            ctrl.value = if which == CTRL_WHICH_DEFAULT {
                i64::from(DEFAULT_FILL_VALUE)
            } else {
                i64::from(session.fill_value)
            };
        }

        Ok(())
    }

    fn s_ext_ctrls(
        &self,
        session: &mut Self::Session,
        which: u32,
        ctrls: &mut ControlArray,
        ctrl_array: &mut Vec<Control>,
        _sg_lists: Vec<Vec<SgEntry>>,
    ) -> IoctlResult<()> {
        if which == CTRL_WHICH_DEFAULT {
            ctrls.error_idx = 0;
            return Err(libc::EINVAL);
        }
        Self::check_controls(ctrls, ctrl_array)?;

        for ctrl in ctrl_array.iter() {
            session.fill_value = ctrl.value as u8;
        }

        if session
            .subscriptions
            .contains(&(EVENT_CTRL_CHANGE, CTRL_FILL_VALUE))
        {
            let sequence = session.event_sequence;
            session.event_sequence += 1;

            let mut event = DeviceEvent::new(EVENT_CTRL_CHANGE, CTRL_FILL_VALUE, sequence);
            event.data[0] = session.fill_value;
            self.evt_queue
                .send_session_event(SessionEvent::new(session.id, event));
        }

        Ok(())
    }

    fn try_ext_ctrls(
        &self,
        _session: &Self::Session,
        which: u32,
        ctrls: &mut ControlArray,
        ctrl_array: &mut Vec<Control>,
        _sg_lists: Vec<Vec<SgEntry>>,
    ) -> IoctlResult<()> {
        if which == CTRL_WHICH_DEFAULT {
            ctrls.error_idx = 0;
            return Err(libc::EINVAL);
        }

        Self::check_controls(ctrls, ctrl_array)
    }

    fn subscribe_event(
        &self,
        session: &mut Self::Session,
        subscription: EventSubscription,
    ) -> IoctlResult<()> {
        if subscription.event_type != EVENT_CTRL_CHANGE || subscription.id != CTRL_FILL_VALUE {
            return Err(libc::EINVAL);
        }

        session
            .subscriptions
            .insert((subscription.event_type, subscription.id));

        Ok(())
    }

    fn unsubscribe_event(
        &self,
        session: &mut Self::Session,
        subscription: EventSubscription,
    ) -> IoctlResult<()> {
        if session
            .subscriptions
            .remove(&(subscription.event_type, subscription.id))
        {
            Ok(())
        } else {
            Err(libc::EINVAL)
        }
    }
}

impl<Q, M, HM, Reader, Writer> VstreamDevice<Reader, Writer> for PatternCaptureDevice<Q, M, HM>
where
    Q: EventQueue,
    M: GuestMemoryMapper,
    HM: HostMemoryMapper,
    Reader: std::io::Read,
    Writer: std::io::Write,
{
    type Session = PatternSession;

    fn new_session(&self, session_id: u32) -> Result<Self::Session, i32> {
        Ok(PatternSession {
            id: session_id,
            format: adjust_format(VideoFormat {
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
                ..Default::default()
            }),
            buffers: BufferQueue::new(QueueType::VideoCapture),
            backing: Vec::new(),
            fill_value: DEFAULT_FILL_VALUE,
            frame_counter: 0,
            event_sequence: 0,
            subscriptions: HashSet::new(),
        })
    }

    fn close_session(&self, session: &mut Self::Session) {
        let mut state = self.state.lock().unwrap();

        if state.active_session == Some(session.id) {
            state.active_session = None;
        }

        for slot_index in 0..session.buffers.num_slots() {
            if let Some(slot) = session.buffers.slot(slot_index as u32) {
                for plane in slot.planes() {
                    if let PlaneBacking::Mmap { mem_offset } = plane.backing {
                        state.mmap.unregister_buffer(mem_offset);
                    }
                }
            }
        }
    }

    fn do_ioctl(
        &self,
        session: &mut Self::Session,
        code: u32,
        reader: &mut Reader,
        writer: &mut Writer,
    ) -> IoResult<()> {
        dispatch_ioctl(self, session, code, reader, writer)
    }

    fn do_mmap(
        &self,
        session: &mut Self::Session,
        flags: u32,
        offset: u64,
    ) -> Result<(u64, u64), i32> {
        let mut host = None;
        'search: for buffer_index in 0..session.buffers.num_slots() {
            if let Some(slot) = session.buffers.slot(buffer_index as u32) {
                for (plane_index, plane) in slot.planes().iter().enumerate() {
                    if matches!(plane.backing, PlaneBacking::Mmap { mem_offset } if mem_offset == offset)
                    {
                        host = session
                            .backing
                            .get(buffer_index)
                            .and_then(|planes| planes.get(plane_index));
                        break 'search;
                    }
                }
            }
        }
        let host = host.ok_or(libc::EINVAL)?;

        let rw = (flags & VSTREAM_MMAP_FLAG_RW) != 0;

        self.state
            .lock()
            .unwrap()
            .mmap
            .create_mapping(offset, host.as_fd(), rw)
            .map_err(|e| e.into_errno())
    }

    fn do_munmap(&self, _session: &mut Self::Session, guest_addr: u64) -> Result<(), i32> {
        self.state
            .lock()
            .unwrap()
            .mmap
            .remove_mapping(guest_addr)
            .map_err(|e| e.into_errno())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::mpsc;
    use std::sync::mpsc::Receiver;
    use std::sync::mpsc::Sender;
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;
    use crate::io::ReadFromDescriptorChain;
    use crate::io::WireType;
    use crate::io::WriteToDescriptorChain;
    use crate::protocol::CloseCmd;
    use crate::protocol::CmdHeader;
    use crate::protocol::IoctlCmd;
    use crate::protocol::MmapCmd;
    use crate::protocol::MmapResp;
    use crate::protocol::MunmapCmd;
    use crate::protocol::OpenResp;
    use crate::protocol::RespHeader;
    use crate::protocol::VstreamEvent;
    use crate::protocol::VSTREAM_CMD_CLOSE;
    use crate::protocol::VSTREAM_CMD_IOCTL;
    use crate::protocol::VSTREAM_CMD_MMAP;
    use crate::protocol::VSTREAM_CMD_MUNMAP;
    use crate::protocol::VSTREAM_CMD_OPEN;
    use crate::ioctl::VstreamIoctl;
    use crate::types::BUFFER_FLAG_DONE;
    use crate::types::BUFFER_FLAG_QUEUED;
    use crate::types::CTRL_WHICH_CURRENT;
    use crate::CommandDispatcher;

    /// Guest memory emulated as a plain byte array behind a lock.
    struct TestGuestMemory {
        mem: Arc<Mutex<Vec<u8>>>,
    }

    /// Linear view over sparse test guest memory, written back on drop.
    struct TestGuestMapping {
        mem: Arc<Mutex<Vec<u8>>>,
        sgs: Vec<SgEntry>,
        data: Vec<u8>,
    }

    impl GuestMemoryRange for TestGuestMapping {
        fn as_ptr(&self) -> *const u8 {
            self.data.as_ptr()
        }

        fn as_mut_ptr(&mut self) -> *mut u8 {
            self.data.as_mut_ptr()
        }
    }

    impl Drop for TestGuestMapping {
        fn drop(&mut self) {
            let mut mem = self.mem.lock().unwrap();
            let mut cursor = 0;
            for sg in &self.sgs {
                let start = sg.start as usize;
                let len = sg.len as usize;
                mem[start..start + len].copy_from_slice(&self.data[cursor..cursor + len]);
                cursor += len;
            }
        }
    }

    impl GuestMemoryMapper for TestGuestMemory {
        type Mapping = TestGuestMapping;

        fn new_mapping(&self, sgs: Vec<SgEntry>) -> anyhow::Result<TestGuestMapping> {
            let mem = self.mem.lock().unwrap();
            let mut data = Vec::new();
            for sg in &sgs {
                data.extend_from_slice(&mem[sg.start as usize..][..sg.len as usize]);
            }

            Ok(TestGuestMapping {
                mem: Arc::clone(&self.mem),
                sgs,
                data,
            })
        }
    }

    struct TestHostMapper;

    impl HostMemoryMapper for TestHostMapper {
        fn add_mapping(
            &mut self,
            _buffer: std::os::fd::BorrowedFd,
            _length: u64,
            offset: u64,
            _rw: bool,
        ) -> Result<u64, i32> {
            Ok(offset | 0x8000_0000)
        }

        fn remove_mapping(&mut self, _guest_addr: u64) -> Result<(), i32> {
            Ok(())
        }
    }

    type TestDevice = PatternCaptureDevice<Sender<VstreamEvent>, TestGuestMemory, TestHostMapper>;
    type TestDispatcher = CommandDispatcher<Cursor<Vec<u8>>, Vec<u8>, TestDevice>;

    const GUEST_MEM_SIZE: usize = 0x10000;

    struct TestHarness {
        dispatcher: TestDispatcher,
        events: Receiver<VstreamEvent>,
        guest_mem: Arc<Mutex<Vec<u8>>>,
    }

    fn harness() -> TestHarness {
        let (tx, rx) = mpsc::channel();
        let guest_mem = Arc::new(Mutex::new(vec![0u8; GUEST_MEM_SIZE]));
        let device = PatternCaptureDevice::new(
            tx,
            TestGuestMemory {
                mem: Arc::clone(&guest_mem),
            },
            TestHostMapper,
        );

        TestHarness {
            dispatcher: CommandDispatcher::new(device),
            events: rx,
            guest_mem,
        }
    }

    impl TestHarness {
        fn run(&self, cmd: Vec<u8>) -> Vec<u8> {
            let mut response = Vec::new();
            self.dispatcher
                .handle_command(&mut Cursor::new(cmd), &mut response);
            response
        }

        fn open(&self) -> u32 {
            let mut cmd = Vec::new();
            cmd.write_obj(CmdHeader::new(VSTREAM_CMD_OPEN)).unwrap();

            let response = self.run(cmd);
            let resp = response.as_slice().read_obj::<OpenResp>().unwrap();
            assert_eq!(resp.hdr.errno, 0);
            resp.session_id
        }

        fn close(&self, session_id: u32) -> i32 {
            let mut cmd = Vec::new();
            cmd.write_obj(CmdHeader::new(VSTREAM_CMD_CLOSE)).unwrap();
            cmd.write_obj(CloseCmd::new(session_id)).unwrap();

            self.run(cmd).as_slice().read_obj::<RespHeader>().unwrap().errno
        }

        /// Runs an ioctl and returns its raw response (header included).
        fn ioctl(&self, session_id: u32, ioctl: VstreamIoctl, payload: &[u8]) -> Vec<u8> {
            let mut cmd = Vec::new();
            cmd.write_obj(CmdHeader::new(VSTREAM_CMD_IOCTL)).unwrap();
            cmd.write_obj(IoctlCmd {
                session_id,
                code: ioctl.code(),
            })
            .unwrap();
            cmd.extend_from_slice(payload);

            self.run(cmd)
        }

        fn mmap(&self, session_id: u32, flags: u32, offset: u64) -> Result<(u64, u64), i32> {
            let mut cmd = Vec::new();
            cmd.write_obj(CmdHeader::new(VSTREAM_CMD_MMAP)).unwrap();
            cmd.write_obj(MmapCmd {
                session_id,
                flags,
                offset,
            })
            .unwrap();

            let response = self.run(cmd);
            let mut slice = response.as_slice();
            let hdr = slice.read_obj::<RespHeader>().unwrap();
            if hdr.errno != 0 {
                return Err(hdr.errno);
            }

            let mut slice = response.as_slice();
            let resp = slice.read_obj::<MmapResp>().unwrap();
            Ok((resp.driver_addr, resp.len))
        }

        fn munmap(&self, session_id: u32, driver_addr: u64) -> i32 {
            let mut cmd = Vec::new();
            cmd.write_obj(CmdHeader::new(VSTREAM_CMD_MUNMAP)).unwrap();
            cmd.write_obj(MunmapCmd::new(session_id, driver_addr)).unwrap();

            self.run(cmd).as_slice().read_obj::<RespHeader>().unwrap().errno
        }
    }

    fn encode<T: WireType>(obj: T) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.write_obj(obj).unwrap();
        bytes
    }

    /// Splits a response into its header and payload.
    fn parse_response(response: &[u8]) -> (i32, &[u8]) {
        let mut slice = response;
        let hdr = slice.read_obj::<RespHeader>().unwrap();
        (hdr.errno, slice)
    }

    fn qbuf_payload(memory: MemoryType, index: u32, length: u32, backing: u64) -> Vec<u8> {
        let buffer = WireBuffer {
            queue: QueueType::VideoCapture as u32,
            index,
            memory: memory as u32,
            num_planes: 1,
            planes_ptr: 0xaaaa_0000 + u64::from(index),
            ..Default::default()
        };
        let mut plane = WirePlane::default();
        plane.length = length;
        plane.backing = backing;

        let mut bytes = encode(buffer);
        bytes.append(&mut encode(plane));
        bytes
    }

    #[test]
    fn mmap_capture_flow() {
        let h = harness();
        let session = h.open();

        // Negotiate the default format explicitly.
        let format = VideoFormat {
            queue: QueueType::VideoCapture as u32,
            width: 640,
            height: 480,
            ..Default::default()
        };
        let response = h.ioctl(session, VstreamIoctl::SFmt, &encode(format));
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        let format = payload.read_obj::<VideoFormat>().unwrap();
        let sizeimage = 640 * 3 * 480;
        assert_eq!(format.plane_fmt[0].sizeimage, sizeimage);
        assert_eq!(format.plane_fmt[0].stride, 640 * 3);

        // Allocate two MMAP buffers.
        let reqbufs = RequestBuffers {
            queue: QueueType::VideoCapture as u32,
            memory: MemoryType::Mmap as u32,
            count: 2,
            capabilities: 0,
        };
        let response = h.ioctl(session, VstreamIoctl::ReqBufs, &encode(reqbufs));
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        let reqbufs = payload.read_obj::<RequestBuffers>().unwrap();
        assert_eq!(reqbufs.count, 2);
        assert_eq!(reqbufs.capabilities, BUFFER_CAP_MMAP | BUFFER_CAP_GUEST_SG);

        // The second buffer's range offset starts past the first one.
        let querybuf = WireBuffer {
            queue: QueueType::VideoCapture as u32,
            index: 1,
            memory: MemoryType::Mmap as u32,
            ..Default::default()
        };
        let response = h.ioctl(session, VstreamIoctl::QueryBuf, &encode(querybuf));
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        let buffer = payload.read_obj::<WireBuffer>().unwrap();
        let plane = payload.read_obj::<WirePlane>().unwrap();
        assert_eq!(buffer.index, 1);
        assert_eq!(plane.length, sizeimage);
        assert_eq!(plane.backing, u64::from(sizeimage).next_multiple_of(0x1000));

        // Queue a buffer before streaming: acknowledged but not processed.
        let response = h.ioctl(
            session,
            VstreamIoctl::QBuf,
            &qbuf_payload(MemoryType::Mmap, 0, sizeimage, 0),
        );
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        let buffer = payload.read_obj::<WireBuffer>().unwrap();
        assert_eq!(buffer.flags, BUFFER_FLAG_QUEUED);
        assert_eq!(buffer.planes_ptr, 0xaaaa_0000);
        assert!(h.events.try_recv().is_err());

        // Streaming on processes the queued buffer and emits its dequeue
        // event.
        let response = h.ioctl(
            session,
            VstreamIoctl::StreamOn,
            &encode(QueueType::VideoCapture as u32),
        );
        assert_eq!(parse_response(&response).0, 0);

        match h.events.try_recv().unwrap() {
            VstreamEvent::DequeueBuffer(event) => {
                assert_eq!(event.hdr.session_id, session);
                assert_eq!(event.buffer.index, 0);
                assert_eq!(event.buffer.sequence, 0);
                assert_eq!(event.buffer.flags, BUFFER_FLAG_DONE);
                assert_eq!(event.buffer.planes_ptr, 0);
                assert_eq!(event.planes[0].bytesused, sizeimage);
            }
            _ => panic!("expected a dequeue event"),
        }

        // While streaming, queuing processes immediately.
        let response = h.ioctl(
            session,
            VstreamIoctl::QBuf,
            &qbuf_payload(MemoryType::Mmap, 1, sizeimage, 0),
        );
        assert_eq!(parse_response(&response).0, 0);
        match h.events.try_recv().unwrap() {
            VstreamEvent::DequeueBuffer(event) => {
                assert_eq!(event.buffer.index, 1);
                assert_eq!(event.buffer.sequence, 1);
            }
            _ => panic!("expected a dequeue event"),
        }

        // Map the first buffer into the guest; a second mapping is refused
        // until the driver unmaps.
        let (guest_addr, len) = h.mmap(session, VSTREAM_MMAP_FLAG_RW, 0).unwrap();
        assert_eq!(guest_addr, 0x8000_0000);
        assert_eq!(len, u64::from(sizeimage));
        assert_eq!(h.mmap(session, VSTREAM_MMAP_FLAG_RW, 0), Err(libc::EBUSY));
        assert_eq!(h.munmap(session, guest_addr), 0);

        assert_eq!(h.close(session), 0);
    }

    #[test]
    fn guest_sg_capture_flow() {
        let h = harness();
        let session = h.open();

        // Smallest format the device accepts: 16x16, 768 bytes.
        let format = VideoFormat {
            queue: QueueType::VideoCapture as u32,
            width: 1,
            height: 1,
            ..Default::default()
        };
        let response = h.ioctl(session, VstreamIoctl::SFmt, &encode(format));
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        let format = payload.read_obj::<VideoFormat>().unwrap();
        assert_eq!(format.width, 16);
        assert_eq!(format.plane_fmt[0].sizeimage, 768);

        // G_FMT returns what S_FMT selected.
        let query = VideoFormat {
            queue: QueueType::VideoCapture as u32,
            ..Default::default()
        };
        let response = h.ioctl(session, VstreamIoctl::GFmt, &encode(query));
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        assert_eq!(payload.read_obj::<VideoFormat>().unwrap(), format);

        let reqbufs = RequestBuffers {
            queue: QueueType::VideoCapture as u32,
            memory: MemoryType::GuestSg as u32,
            count: 1,
            capabilities: 0,
        };
        let response = h.ioctl(session, VstreamIoctl::ReqBufs, &encode(reqbufs));
        assert_eq!(parse_response(&response).0, 0);

        // Guest backing split over two discontiguous regions.
        let mut payload = qbuf_payload(MemoryType::GuestSg, 0, 768, 0xfeed_0000);
        payload.append(&mut encode(SgEntry::new(0x100, 512)));
        payload.append(&mut encode(SgEntry::new(0x1000, 256)));
        let response = h.ioctl(session, VstreamIoctl::QBuf, &payload);
        assert_eq!(parse_response(&response).0, 0);

        let response = h.ioctl(
            session,
            VstreamIoctl::StreamOn,
            &encode(QueueType::VideoCapture as u32),
        );
        assert_eq!(parse_response(&response).0, 0);

        match h.events.try_recv().unwrap() {
            VstreamEvent::DequeueBuffer(event) => {
                assert_eq!(event.buffer.planes_ptr, 0);
                // The guest's backing token is carried through.
                assert_eq!(event.planes[0].backing, 0xfeed_0000);
                assert_eq!(event.planes[0].bytesused, 768);
            }
            _ => panic!("expected a dequeue event"),
        }

        // The pattern landed in both guest regions. Sequence 0 with the
        // default fill value paints (0xff, 0, 0) pixels.
        let mem = h.guest_mem.lock().unwrap();
        assert_eq!(&mem[0x100..0x103], &[0xff, 0x00, 0x00]);
        // 512 is not a multiple of the pixel size, so the second region
        // starts in the middle of a pixel.
        assert_eq!(&mem[0x1000..0x1003], &[0x00, 0xff, 0x00]);
        // One byte past the first described region is untouched.
        assert_eq!(mem[0x100 + 512], 0x00);
        drop(mem);

        // Once the session is closed, its id is no longer addressable.
        assert_eq!(h.close(session), 0);
        let response = h.ioctl(session, VstreamIoctl::GFmt, &encode(format));
        assert_eq!(parse_response(&response).0, libc::EINVAL);
    }

    #[test]
    fn multi_planar_guest_sg_flow() {
        let h = harness();
        let session = h.open();

        // The second enumerated format is the two-planar one.
        let desc = FormatDesc {
            queue: QueueType::VideoCapture as u32,
            index: 1,
            ..Default::default()
        };
        let response = h.ioctl(session, VstreamIoctl::EnumFmt, &encode(desc));
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        let desc = payload.read_obj::<FormatDesc>().unwrap();
        assert_eq!(desc.pixelformat, PIXELFORMAT_NV12);
        let past_end = FormatDesc {
            queue: QueueType::VideoCapture as u32,
            index: 2,
            ..Default::default()
        };
        let response = h.ioctl(session, VstreamIoctl::EnumFmt, &encode(past_end));
        assert_eq!(parse_response(&response).0, libc::EINVAL);

        // 16x16 NV12: a 256-byte luma plane and a 128-byte chroma plane.
        let format = VideoFormat {
            queue: QueueType::VideoCapture as u32,
            pixelformat: PIXELFORMAT_NV12,
            width: 16,
            height: 16,
            ..Default::default()
        };
        let response = h.ioctl(session, VstreamIoctl::SFmt, &encode(format));
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        let format = payload.read_obj::<VideoFormat>().unwrap();
        assert_eq!(format.num_planes, 2);
        assert_eq!(format.plane_fmt[0].sizeimage, 256);
        assert_eq!(format.plane_fmt[1].sizeimage, 128);

        let reqbufs = RequestBuffers {
            queue: QueueType::VideoCapture as u32,
            memory: MemoryType::GuestSg as u32,
            count: 1,
            capabilities: 0,
        };
        let response = h.ioctl(session, VstreamIoctl::ReqBufs, &encode(reqbufs));
        assert_eq!(parse_response(&response).0, 0);

        // Queue one buffer with separately backed planes. The SG lists come
        // after the whole plane array, in plane order.
        let buffer = WireBuffer {
            queue: QueueType::VideoCapture as u32,
            index: 0,
            memory: MemoryType::GuestSg as u32,
            num_planes: 2,
            planes_ptr: 0xaaaa_0000,
            ..Default::default()
        };
        let mut luma = WirePlane::default();
        luma.length = 256;
        luma.backing = 0xfeed_0000;
        let mut chroma = WirePlane::default();
        chroma.length = 128;
        chroma.backing = 0xfeed_1000;
        let mut payload = encode(buffer);
        payload.append(&mut encode(luma));
        payload.append(&mut encode(chroma));
        payload.append(&mut encode(SgEntry::new(0x100, 256)));
        payload.append(&mut encode(SgEntry::new(0x1000, 128)));
        let response = h.ioctl(session, VstreamIoctl::QBuf, &payload);
        assert_eq!(parse_response(&response).0, 0);

        let response = h.ioctl(
            session,
            VstreamIoctl::StreamOn,
            &encode(QueueType::VideoCapture as u32),
        );
        assert_eq!(parse_response(&response).0, 0);

        match h.events.try_recv().unwrap() {
            VstreamEvent::DequeueBuffer(event) => {
                assert_eq!(event.buffer.num_planes, 2);
                assert_eq!(event.buffer.planes_ptr, 0);
                assert_eq!(event.planes[0].backing, 0xfeed_0000);
                assert_eq!(event.planes[0].bytesused, 256);
                assert_eq!(event.planes[1].backing, 0xfeed_1000);
                assert_eq!(event.planes[1].bytesused, 128);
            }
            _ => panic!("expected a dequeue event"),
        }

        // Sequence 0 luma is the default fill value, chroma is neutral.
        let mem = h.guest_mem.lock().unwrap();
        assert_eq!(mem[0x100], 0xff);
        assert_eq!(mem[0x100 + 255], 0xff);
        assert_eq!(mem[0x1000], 0x80);
        assert_eq!(mem[0x1000 + 127], 0x80);
    }

    fn ctrl_payload(which: u32, controls: &[Control]) -> Vec<u8> {
        let mut ctrls = ControlArray::default();
        ctrls.which = which;
        ctrls.count = controls.len() as u32;
        ctrls.controls_ptr = 0xcccc_0000;

        let mut bytes = encode(ctrls);
        for ctrl in controls {
            bytes.append(&mut encode(*ctrl));
        }
        bytes
    }

    #[test]
    fn fill_value_control() {
        let h = harness();
        let session = h.open();

        let subscription = EventSubscription::new(EVENT_CTRL_CHANGE, CTRL_FILL_VALUE);
        let response = h.ioctl(session, VstreamIoctl::SubscribeEvent, &encode(subscription));
        assert_eq!(parse_response(&response).0, 0);

        // Setting the control fires a session event carrying the new value.
        let set = Control {
            id: CTRL_FILL_VALUE,
            size: 0,
            value: 0x40,
            payload_ptr: 0,
        };
        let response = h.ioctl(
            session,
            VstreamIoctl::SExtCtrls,
            &ctrl_payload(CTRL_WHICH_CURRENT, &[set]),
        );
        assert_eq!(parse_response(&response).0, 0);

        match h.events.try_recv().unwrap() {
            VstreamEvent::Session(event) => {
                assert_eq!(event.hdr.session_id, session);
                assert_eq!(event.event.event_type, EVENT_CTRL_CHANGE);
                assert_eq!(event.event.id, CTRL_FILL_VALUE);
                assert_eq!(event.event.data[0], 0x40);
            }
            _ => panic!("expected a session event"),
        }

        // Reading back returns the new current value, and the default set
        // still has the original one.
        let get = Control {
            id: CTRL_FILL_VALUE,
            ..Default::default()
        };
        let response = h.ioctl(
            session,
            VstreamIoctl::GExtCtrls,
            &ctrl_payload(CTRL_WHICH_CURRENT, &[get]),
        );
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        let _ = payload.read_obj::<ControlArray>().unwrap();
        assert_eq!(payload.read_obj::<Control>().unwrap().value, 0x40);

        let response = h.ioctl(
            session,
            VstreamIoctl::GExtCtrls,
            &ctrl_payload(CTRL_WHICH_DEFAULT, &[get]),
        );
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        let _ = payload.read_obj::<ControlArray>().unwrap();
        assert_eq!(payload.read_obj::<Control>().unwrap().value, 0xff);

        // A failing set still writes the payload back, with error_idx
        // pointing at the offending control.
        let bogus = Control {
            id: 0xdead,
            ..Default::default()
        };
        let response = h.ioctl(
            session,
            VstreamIoctl::SExtCtrls,
            &ctrl_payload(CTRL_WHICH_CURRENT, &[set, bogus]),
        );
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, libc::EINVAL);
        let ctrls = payload.read_obj::<ControlArray>().unwrap();
        assert_eq!(ctrls.error_idx, 1);
        assert_eq!(ctrls.controls_ptr, 0xcccc_0000);

        // Nothing was committed.
        let response = h.ioctl(
            session,
            VstreamIoctl::GExtCtrls,
            &ctrl_payload(CTRL_WHICH_CURRENT, &[get]),
        );
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        let _ = payload.read_obj::<ControlArray>().unwrap();
        assert_eq!(payload.read_obj::<Control>().unwrap().value, 0x40);

        // Unsubscribing twice fails the second time.
        let response = h.ioctl(
            session,
            VstreamIoctl::UnsubscribeEvent,
            &encode(subscription),
        );
        assert_eq!(parse_response(&response).0, 0);
        let response = h.ioctl(
            session,
            VstreamIoctl::UnsubscribeEvent,
            &encode(subscription),
        );
        assert_eq!(parse_response(&response).0, libc::EINVAL);
    }

    #[test]
    fn buffer_allocation_is_exclusive() {
        let h = harness();
        let first = h.open();
        let second = h.open();

        let reqbufs = RequestBuffers {
            queue: QueueType::VideoCapture as u32,
            memory: MemoryType::Mmap as u32,
            count: 1,
            capabilities: 0,
        };

        let response = h.ioctl(first, VstreamIoctl::ReqBufs, &encode(reqbufs));
        assert_eq!(parse_response(&response).0, 0);

        // The second session cannot allocate while the first one holds
        // buffers.
        let response = h.ioctl(second, VstreamIoctl::ReqBufs, &encode(reqbufs));
        assert_eq!(parse_response(&response).0, libc::EBUSY);

        // Releasing with a count of zero frees the device for the second
        // session.
        let release = RequestBuffers {
            count: 0,
            ..reqbufs
        };
        let response = h.ioctl(first, VstreamIoctl::ReqBufs, &encode(release));
        assert_eq!(parse_response(&response).0, 0);

        let response = h.ioctl(second, VstreamIoctl::ReqBufs, &encode(reqbufs));
        assert_eq!(parse_response(&response).0, 0);
    }

    #[test]
    fn streamon_requires_buffers() {
        let h = harness();
        let session = h.open();

        let response = h.ioctl(
            session,
            VstreamIoctl::StreamOn,
            &encode(QueueType::VideoCapture as u32),
        );
        assert_eq!(parse_response(&response).0, libc::EINVAL);
    }

    #[test]
    fn input_query() {
        let h = harness();
        let session = h.open();

        let response = h.ioctl(session, VstreamIoctl::GInput, &[]);
        let (errno, mut payload) = parse_response(&response);
        assert_eq!(errno, 0);
        assert_eq!(payload.read_obj::<i32>().unwrap(), 0);
    }
}
