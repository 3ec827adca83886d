// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ioctl code decoding and the direction-polymorphic payload codec.
//!
//! Ioctl codes follow the encoding convention of the non-virtualized API: a
//! 32-bit value packing a sequence number, a type byte, the size of the fixed
//! payload and two direction bits. The direction of any code - including codes
//! the device has never heard of - is decoded deterministically from the code
//! alone, with no per-code table.
//!
//! The direction dictates where the fixed payload sits in the descriptor
//! chain:
//!
//! * [`IoctlDirection::Read`]: once, in the device-writable section, right
//!   after the response header.
//! * [`IoctlDirection::Write`]: once, in the device-readable section, right
//!   after the command structure.
//! * [`IoctlDirection::ReadWrite`]: in both places. The driver may alias the
//!   two occurrences; the device always writes the writable occurrence back.
//!
//! Payload structures carrying a `{count/size, pointer}` pair serialize the
//! referenced data in-line after the fixed structure, in field declaration
//! order; nested sized elements follow the whole array in index order. The
//! pointer values are opaque tokens that are echoed back unchanged.

use std::io::Result as IoResult;
use std::mem::size_of;

use enumn::N;
use log::debug;
use log::error;

use crate::io::ReadFromDescriptorChain;
use crate::io::WireType;
use crate::io::WriteToDescriptorChain;
use crate::protocol::RespHeader;
use crate::protocol::SgEntry;
use crate::types::Control;
use crate::types::ControlArray;
use crate::types::EventSubscription;
use crate::types::FormatDesc;
use crate::types::MemoryType;
use crate::types::QueueType;
use crate::types::RequestBuffers;
use crate::types::VideoFormat;
use crate::types::WireBuffer;
use crate::types::WirePlane;
use crate::types::MAX_PLANES;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_DIR_NONE: u32 = 0;
const IOC_DIR_WRITE: u32 = 1;
const IOC_DIR_READ: u32 = 2;

/// Direction of an ioctl, from the driver's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlDirection {
    /// No payload.
    None,
    /// The driver writes the payload, the device only reads it.
    Write,
    /// The driver only reads the payload, the device writes it.
    Read,
    /// The payload travels both ways.
    ReadWrite,
}

/// Decodes the direction bits of `code`.
pub fn direction(code: u32) -> IoctlDirection {
    match code >> IOC_DIRSHIFT {
        IOC_DIR_WRITE => IoctlDirection::Write,
        IOC_DIR_READ => IoctlDirection::Read,
        IOC_DIR_NONE => IoctlDirection::None,
        // Both bits set.
        _ => IoctlDirection::ReadWrite,
    }
}

/// Decodes the size of the fixed payload of `code`.
pub fn payload_size(code: u32) -> usize {
    ((code >> IOC_SIZESHIFT) & ((1 << IOC_SIZEBITS) - 1)) as usize
}

/// Decodes the type byte of `code`.
pub fn type_byte(code: u32) -> u8 {
    (code >> IOC_TYPESHIFT) as u8
}

/// Decodes the sequence number of `code`.
pub fn number(code: u32) -> u8 {
    (code >> IOC_NRSHIFT) as u8
}

/// Type byte of all virtio-vstream ioctls.
pub const VSTREAM_IOC_TYPE: u8 = b'z';

const fn ioc(dir: u32, nr: u8, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
        | ((VSTREAM_IOC_TYPE as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
}

/// Ioctls implemented by the protocol.
///
/// Discriminants are the sequence numbers of the codes. Numbers absent from
/// this enum - including the retired operations of the non-virtualized API
/// (capability query, single dequeue, single event dequeue, single-control
/// get/set, legacy compression parameters, status logging) - uniformly fail
/// with `ENOTTY`, indistinguishable from codes that never existed.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum VstreamIoctl {
    EnumFmt = 2,
    GFmt = 4,
    SFmt = 5,
    ReqBufs = 8,
    QueryBuf = 9,
    QBuf = 15,
    StreamOn = 18,
    StreamOff = 19,
    GInput = 38,
    TryFmt = 64,
    GExtCtrls = 71,
    SExtCtrls = 72,
    TryExtCtrls = 73,
    SubscribeEvent = 90,
    UnsubscribeEvent = 91,
}

impl VstreamIoctl {
    /// Returns the full 32-bit code of this ioctl.
    pub const fn code(self) -> u32 {
        use VstreamIoctl::*;

        const RW: u32 = IOC_DIR_READ | IOC_DIR_WRITE;

        match self {
            EnumFmt => ioc(RW, EnumFmt as u8, size_of::<FormatDesc>()),
            GFmt => ioc(RW, GFmt as u8, size_of::<VideoFormat>()),
            SFmt => ioc(RW, SFmt as u8, size_of::<VideoFormat>()),
            ReqBufs => ioc(RW, ReqBufs as u8, size_of::<RequestBuffers>()),
            QueryBuf => ioc(RW, QueryBuf as u8, size_of::<WireBuffer>()),
            QBuf => ioc(RW, QBuf as u8, size_of::<WireBuffer>()),
            StreamOn => ioc(IOC_DIR_WRITE, StreamOn as u8, size_of::<u32>()),
            StreamOff => ioc(IOC_DIR_WRITE, StreamOff as u8, size_of::<u32>()),
            GInput => ioc(IOC_DIR_READ, GInput as u8, size_of::<i32>()),
            TryFmt => ioc(RW, TryFmt as u8, size_of::<VideoFormat>()),
            GExtCtrls => ioc(RW, GExtCtrls as u8, size_of::<ControlArray>()),
            SExtCtrls => ioc(RW, SExtCtrls as u8, size_of::<ControlArray>()),
            TryExtCtrls => ioc(RW, TryExtCtrls as u8, size_of::<ControlArray>()),
            SubscribeEvent => {
                ioc(IOC_DIR_WRITE, SubscribeEvent as u8, size_of::<EventSubscription>())
            }
            UnsubscribeEvent => ioc(
                IOC_DIR_WRITE,
                UnsubscribeEvent as u8,
                size_of::<EventSubscription>(),
            ),
        }
    }

    /// Decodes `code` into a supported ioctl.
    ///
    /// A known sequence number whose direction or size bits do not match the
    /// canonical code is treated like an unknown code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::n(number(code)).filter(|ioctl| ioctl.code() == code)
    }
}

/// Reads a scatter-gather list describing `size` bytes of guest memory.
///
/// Entries are read one at a time: the declared size never drives an
/// allocation, and a list that is truncated, padded with empty entries, or
/// inconsistent with `size` fails before any device operation runs.
fn read_sg_list<R: ReadFromDescriptorChain>(reader: &mut R, size: usize) -> IoResult<Vec<SgEntry>> {
    let mut bytes_described = 0;
    let mut entries = Vec::new();

    while bytes_described < size {
        let entry = reader.read_obj::<SgEntry>()?;
        if entry.len == 0 {
            return Err(std::io::ErrorKind::InvalidData.into());
        }
        bytes_described += entry.len as usize;
        entries.push(entry);
    }

    if bytes_described != size {
        return Err(std::io::ErrorKind::InvalidData.into());
    }

    Ok(entries)
}

/// Local trait for reading simple or compound payloads from the
/// device-readable section of a descriptor chain.
trait FromDescriptorChain {
    fn read_from_chain<R: ReadFromDescriptorChain>(reader: &mut R) -> IoResult<Self>
    where
        Self: Sized;
}

/// Simple payloads are read as-is after endianness fixup.
impl<T> FromDescriptorChain for T
where
    T: WireType,
{
    fn read_from_chain<R: ReadFromDescriptorChain>(reader: &mut R) -> IoResult<Self> {
        reader.read_obj()
    }
}

/// Reads a wire buffer, its plane array, and - for guest scatter-gather
/// buffers - the per-plane SG lists that follow the planes.
impl FromDescriptorChain for (WireBuffer, Vec<WirePlane>, Vec<Vec<SgEntry>>) {
    fn read_from_chain<R: ReadFromDescriptorChain>(reader: &mut R) -> IoResult<Self> {
        let buffer = reader.read_obj::<WireBuffer>()?;

        if buffer.num_planes as usize > MAX_PLANES {
            return Err(std::io::ErrorKind::InvalidData.into());
        }

        let planes = (0..buffer.num_planes)
            .map(|_| reader.read_obj::<WirePlane>())
            .collect::<IoResult<Vec<_>>>()?;

        let sg_lists = if MemoryType::n(buffer.memory) == Some(MemoryType::GuestSg) {
            planes
                .iter()
                .filter(|plane| plane.length > 0)
                .map(|plane| read_sg_list(reader, plane.length as usize))
                .collect::<IoResult<Vec<_>>>()?
        } else {
            Vec::new()
        };

        Ok((buffer, planes, sg_lists))
    }
}

/// Reads a control array header, its controls, and the SG lists of the
/// payload-carrying controls.
impl FromDescriptorChain for (ControlArray, Vec<Control>, Vec<Vec<SgEntry>>) {
    fn read_from_chain<R: ReadFromDescriptorChain>(reader: &mut R) -> IoResult<Self> {
        let ctrls = reader.read_obj::<ControlArray>()?;

        let ctrl_array = (0..ctrls.count)
            .map(|_| reader.read_obj::<Control>())
            .collect::<IoResult<Vec<_>>>()?;

        let payloads = ctrl_array
            .iter()
            .filter(|ctrl| ctrl.size > 0)
            .map(|ctrl| read_sg_list(reader, ctrl.size as usize))
            .collect::<IoResult<Vec<_>>>()?;

        Ok((ctrls, ctrl_array, payloads))
    }
}

/// Local trait for writing simple or compound payloads to the device-writable
/// section of a descriptor chain.
trait ToDescriptorChain {
    fn write_to_chain<W: WriteToDescriptorChain>(self, writer: &mut W) -> IoResult<()>;
}

/// Simple payloads are written as-is after endianness fixup.
impl<T> ToDescriptorChain for T
where
    T: WireType,
{
    fn write_to_chain<W: WriteToDescriptorChain>(self, writer: &mut W) -> IoResult<()> {
        writer.write_obj(self)
    }
}

/// Writes a buffer and its plane array back to the driver.
///
/// All tokens (`planes_ptr`, per-plane `backing`) are whatever the handler
/// left in them - for command responses this means the driver's own values,
/// echoed unchanged.
impl ToDescriptorChain for (WireBuffer, Vec<WirePlane>) {
    fn write_to_chain<W: WriteToDescriptorChain>(self, writer: &mut W) -> IoResult<()> {
        let (buffer, planes) = self;

        writer.write_obj(buffer)?;
        for plane in planes {
            writer.write_obj(plane)?;
        }

        Ok(())
    }
}

/// Writes a control array header and its controls back to the driver,
/// echoing the driver's pointer tokens unchanged.
impl ToDescriptorChain for (ControlArray, Vec<Control>) {
    fn write_to_chain<W: WriteToDescriptorChain>(self, writer: &mut W) -> IoResult<()> {
        let (ctrls, ctrl_array) = self;

        writer.write_obj(ctrls)?;
        for ctrl in ctrl_array {
            writer.write_obj(ctrl)?;
        }

        Ok(())
    }
}

/// Returns `ENOTTY` to signal that an ioctl is not handled by this device.
macro_rules! unhandled_ioctl {
    () => {
        Err(libc::ENOTTY)
    };
}

pub type IoctlResult<T> = Result<T, i32>;

/// Trait for implementing the ioctls supported by a device.
///
/// Every method has a default implementation failing with `ENOTTY`, so a
/// device only overrides the operations it supports. Parsing, validation and
/// response serialization are done by [`dispatch_ioctl`]; handler methods
/// receive decoded payloads and return plain results.
///
/// Methods take `&self`: devices are expected to keep shared state behind
/// their own synchronization so that sessions can be driven concurrently.
#[allow(unused_variables)]
pub trait IoctlHandler {
    type Session;

    fn enum_fmt(
        &self,
        session: &Self::Session,
        queue: QueueType,
        index: u32,
    ) -> IoctlResult<FormatDesc> {
        unhandled_ioctl!()
    }

    fn g_fmt(&self, session: &Self::Session, queue: QueueType) -> IoctlResult<VideoFormat> {
        unhandled_ioctl!()
    }

    /// Hook for the S_FMT ioctl. `queue` is guaranteed to match
    /// `format.queue`.
    fn s_fmt(
        &self,
        session: &mut Self::Session,
        queue: QueueType,
        format: VideoFormat,
    ) -> IoctlResult<VideoFormat> {
        unhandled_ioctl!()
    }

    /// Hook for the TRY_FMT ioctl. `queue` is guaranteed to match
    /// `format.queue`.
    fn try_fmt(
        &self,
        session: &Self::Session,
        queue: QueueType,
        format: VideoFormat,
    ) -> IoctlResult<VideoFormat> {
        unhandled_ioctl!()
    }

    fn reqbufs(
        &self,
        session: &mut Self::Session,
        queue: QueueType,
        memory: MemoryType,
        count: u32,
    ) -> IoctlResult<RequestBuffers> {
        unhandled_ioctl!()
    }

    fn querybuf(
        &self,
        session: &Self::Session,
        queue: QueueType,
        index: u32,
    ) -> IoctlResult<(WireBuffer, Vec<WirePlane>)> {
        unhandled_ioctl!()
    }

    /// Hook for the QBUF ioctl.
    ///
    /// `sg_lists` holds one scatter-gather list per non-empty plane when the
    /// buffer memory type is [`MemoryType::GuestSg`], and is empty otherwise.
    /// Any data needed after this call returns must be copied out of it: the
    /// descriptor chain it came from is released once the response is
    /// written.
    fn qbuf(
        &self,
        session: &mut Self::Session,
        buffer: WireBuffer,
        planes: Vec<WirePlane>,
        sg_lists: Vec<Vec<SgEntry>>,
    ) -> IoctlResult<(WireBuffer, Vec<WirePlane>)> {
        unhandled_ioctl!()
    }

    fn streamon(&self, session: &mut Self::Session, queue: QueueType) -> IoctlResult<()> {
        unhandled_ioctl!()
    }

    fn streamoff(&self, session: &mut Self::Session, queue: QueueType) -> IoctlResult<()> {
        unhandled_ioctl!()
    }

    fn g_input(&self, session: &Self::Session) -> IoctlResult<i32> {
        unhandled_ioctl!()
    }

    /// Extended-controls ioctls modify `ctrls` and `ctrl_array` in place
    /// instead of returning them. On failure the modified payload is still
    /// written back to the driver, as it carries `error_idx` and
    /// renegotiated `size` fields.
    fn g_ext_ctrls(
        &self,
        session: &Self::Session,
        which: u32,
        ctrls: &mut ControlArray,
        ctrl_array: &mut Vec<Control>,
        sg_lists: Vec<Vec<SgEntry>>,
    ) -> IoctlResult<()> {
        unhandled_ioctl!()
    }

    /// See [`IoctlHandler::g_ext_ctrls`].
    fn s_ext_ctrls(
        &self,
        session: &mut Self::Session,
        which: u32,
        ctrls: &mut ControlArray,
        ctrl_array: &mut Vec<Control>,
        sg_lists: Vec<Vec<SgEntry>>,
    ) -> IoctlResult<()> {
        unhandled_ioctl!()
    }

    /// See [`IoctlHandler::g_ext_ctrls`].
    fn try_ext_ctrls(
        &self,
        session: &Self::Session,
        which: u32,
        ctrls: &mut ControlArray,
        ctrl_array: &mut Vec<Control>,
        sg_lists: Vec<Vec<SgEntry>>,
    ) -> IoctlResult<()> {
        unhandled_ioctl!()
    }

    fn subscribe_event(
        &self,
        session: &mut Self::Session,
        subscription: EventSubscription,
    ) -> IoctlResult<()> {
        unhandled_ioctl!()
    }

    fn unsubscribe_event(
        &self,
        session: &mut Self::Session,
        subscription: EventSubscription,
    ) -> IoctlResult<()> {
        unhandled_ioctl!()
    }
}

/// Writes an `ENOTTY` response for a code that is unknown, retired, or whose
/// direction/size bits are inconsistent with its number.
fn unknown_ioctl<W: WriteToDescriptorChain>(code: u32, writer: &mut W) -> IoResult<()> {
    debug!(
        "unsupported ioctl code {:#010x} (type {:#04x} nr {})",
        code,
        type_byte(code),
        number(code)
    );
    writer.write_err_response(libc::ENOTTY)
}

/// Implements a read-write ioctl for which errors may also carry a payload.
///
/// * `I` is the payload read from the device-readable section,
/// * `O` is the payload written after the response header for both success
///   and failure,
/// * `process` turns the input into a result; on failure it returns the error
///   code and the optional payload to write along with it.
fn rw_ioctl_with_err_payload<Reader, Writer, I, O, X>(
    ioctl: VstreamIoctl,
    reader: &mut Reader,
    writer: &mut Writer,
    process: X,
) -> IoResult<()>
where
    Reader: ReadFromDescriptorChain,
    Writer: WriteToDescriptorChain,
    I: FromDescriptorChain,
    O: ToDescriptorChain,
    X: FnOnce(I) -> Result<O, (i32, Option<O>)>,
{
    let input = match I::read_from_chain(reader) {
        Ok(input) => input,
        Err(e) => {
            error!("error while reading payload of {:?} ioctl: {:#}", ioctl, e);
            return writer.write_err_response(libc::EINVAL);
        }
    };

    let (resp_header, output) = match process(input) {
        Ok(output) => (RespHeader::ok(), Some(output)),
        Err((errno, output)) => (RespHeader::err(errno), output),
    };

    writer.write_response(resp_header)?;
    if let Some(output) = output {
        output.write_to_chain(writer)?;
    }

    Ok(())
}

/// Implements a read-write ioctl. On failure only the error header is
/// written; the writable payload region is left untouched.
fn rw_ioctl<Reader, Writer, I, O, X>(
    ioctl: VstreamIoctl,
    reader: &mut Reader,
    writer: &mut Writer,
    process: X,
) -> IoResult<()>
where
    Reader: ReadFromDescriptorChain,
    Writer: WriteToDescriptorChain,
    I: FromDescriptorChain,
    O: ToDescriptorChain,
    X: FnOnce(I) -> Result<O, i32>,
{
    rw_ioctl_with_err_payload(ioctl, reader, writer, |input| {
        process(input).map_err(|errno| (errno, None))
    })
}

/// Implements a write-only ioctl: payload in the device-readable section,
/// response header only.
fn w_ioctl<Reader, Writer, I, X>(
    ioctl: VstreamIoctl,
    reader: &mut Reader,
    writer: &mut Writer,
    process: X,
) -> IoResult<()>
where
    Reader: ReadFromDescriptorChain,
    Writer: WriteToDescriptorChain,
    I: FromDescriptorChain,
    X: FnOnce(I) -> Result<(), i32>,
{
    rw_ioctl(ioctl, reader, writer, process)
}

/// Implements a read-only ioctl: nothing to read, payload after the response
/// header.
fn r_ioctl<Writer, O, X>(ioctl: VstreamIoctl, writer: &mut Writer, process: X) -> IoResult<()>
where
    Writer: WriteToDescriptorChain,
    O: ToDescriptorChain,
    X: FnOnce() -> Result<O, i32>,
{
    rw_ioctl(ioctl, &mut std::io::empty(), writer, |()| process())
}

/// Ioctl dispatcher for implementors of [`IoctlHandler`].
///
/// Reads and validates the ioctl payload according to the direction and size
/// encoded in `code`, invokes the matching handler method, and writes the
/// response. Only returns an error if the response could not be written; all
/// other failures are reported to the driver and are normal operation from
/// the host's point of view.
pub fn dispatch_ioctl<S, H, Reader, Writer>(
    handler: &H,
    session: &mut S,
    code: u32,
    reader: &mut Reader,
    writer: &mut Writer,
) -> IoResult<()>
where
    H: IoctlHandler<Session = S>,
    Reader: ReadFromDescriptorChain,
    Writer: WriteToDescriptorChain,
{
    use VstreamIoctl::*;

    let ioctl = match VstreamIoctl::from_code(code) {
        Some(ioctl) => ioctl,
        None => return unknown_ioctl(code, writer),
    };

    match ioctl {
        EnumFmt => rw_ioctl(ioctl, reader, writer, |desc: FormatDesc| {
            let queue = QueueType::n(desc.queue).ok_or(libc::EINVAL)?;
            handler.enum_fmt(session, queue, desc.index)
        }),
        GFmt => rw_ioctl(ioctl, reader, writer, |format: VideoFormat| {
            let queue = QueueType::n(format.queue).ok_or(libc::EINVAL)?;
            handler.g_fmt(session, queue)
        }),
        SFmt => rw_ioctl(ioctl, reader, writer, |format: VideoFormat| {
            let queue = QueueType::n(format.queue).ok_or(libc::EINVAL)?;
            handler.s_fmt(session, queue, format)
        }),
        TryFmt => rw_ioctl(ioctl, reader, writer, |format: VideoFormat| {
            let queue = QueueType::n(format.queue).ok_or(libc::EINVAL)?;
            handler.try_fmt(session, queue, format)
        }),
        ReqBufs => rw_ioctl(ioctl, reader, writer, |reqbufs: RequestBuffers| {
            let queue = QueueType::n(reqbufs.queue).ok_or(libc::EINVAL)?;
            let memory = MemoryType::n(reqbufs.memory).ok_or(libc::EINVAL)?;

            handler.reqbufs(session, queue, memory, reqbufs.count)
        }),
        QueryBuf => rw_ioctl(
            ioctl,
            reader,
            writer,
            |(buffer, _, _): (WireBuffer, Vec<WirePlane>, Vec<Vec<SgEntry>>)| {
                let queue = QueueType::n(buffer.queue).ok_or(libc::EINVAL)?;
                handler.querybuf(session, queue, buffer.index)
            },
        ),
        QBuf => rw_ioctl(
            ioctl,
            reader,
            writer,
            |(buffer, planes, sg_lists): (WireBuffer, Vec<WirePlane>, Vec<Vec<SgEntry>>)| {
                QueueType::n(buffer.queue).ok_or(libc::EINVAL)?;
                MemoryType::n(buffer.memory).ok_or(libc::EINVAL)?;

                handler.qbuf(session, buffer, planes, sg_lists)
            },
        ),
        StreamOn => w_ioctl(ioctl, reader, writer, |input: u32| {
            let queue = QueueType::n(input).ok_or(libc::EINVAL)?;
            handler.streamon(session, queue)
        }),
        StreamOff => w_ioctl(ioctl, reader, writer, |input: u32| {
            let queue = QueueType::n(input).ok_or(libc::EINVAL)?;
            handler.streamoff(session, queue)
        }),
        GInput => r_ioctl(ioctl, writer, || handler.g_input(session)),
        GExtCtrls => rw_ioctl_with_err_payload(
            ioctl,
            reader,
            writer,
            |(mut ctrls, mut ctrl_array, sg_lists): (ControlArray, Vec<Control>, _)| {
                let which = ctrls.which;
                match handler.g_ext_ctrls(session, which, &mut ctrls, &mut ctrl_array, sg_lists) {
                    Ok(()) => Ok((ctrls, ctrl_array)),
                    // The updated payload carries error_idx and renegotiated
                    // sizes and must reach the driver even on failure.
                    Err(e) => Err((e, Some((ctrls, ctrl_array)))),
                }
            },
        ),
        SExtCtrls => rw_ioctl_with_err_payload(
            ioctl,
            reader,
            writer,
            |(mut ctrls, mut ctrl_array, sg_lists): (ControlArray, Vec<Control>, _)| {
                let which = ctrls.which;
                match handler.s_ext_ctrls(session, which, &mut ctrls, &mut ctrl_array, sg_lists) {
                    Ok(()) => Ok((ctrls, ctrl_array)),
                    Err(e) => Err((e, Some((ctrls, ctrl_array)))),
                }
            },
        ),
        TryExtCtrls => rw_ioctl_with_err_payload(
            ioctl,
            reader,
            writer,
            |(mut ctrls, mut ctrl_array, sg_lists): (ControlArray, Vec<Control>, _)| {
                let which = ctrls.which;
                match handler.try_ext_ctrls(session, which, &mut ctrls, &mut ctrl_array, sg_lists) {
                    Ok(()) => Ok((ctrls, ctrl_array)),
                    Err(e) => Err((e, Some((ctrls, ctrl_array)))),
                }
            },
        ),
        SubscribeEvent => w_ioctl(ioctl, reader, writer, |subscription: EventSubscription| {
            handler.subscribe_event(session, subscription)
        }),
        UnsubscribeEvent => w_ioctl(ioctl, reader, writer, |subscription: EventSubscription| {
            handler.unsubscribe_event(session, subscription)
        }),
    }
}
