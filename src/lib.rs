// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side helpers to write virtio-vstream devices, and device
//! implementations.
//!
//! Both helpers and devices are VMM-independent and rely on a handful of
//! traits being implemented to operate on a given VMM. Implementing a
//! specific device and supporting virtio-vstream on a given VMM are thus two
//! orthogonal tasks: adding support for a VMM makes all the devices relying
//! on this crate available on it, and a new device written with this crate
//! runs on all supported VMMs.
//!
//! # Traits to implement by the VMM
//!
//! * Descriptor chains must implement [`std::io::Read`] and
//!   [`std::io::Write`] on their device-readable and device-writable parts,
//!   respectively. This is how devices read commands and write responses.
//! * The event queue must implement [`events::EventQueue`] so devices can
//!   send events to the guest.
//! * Guest memory must be made linearly accessible through an implementation
//!   of [`GuestMemoryMapper`].
//! * Optionally, [`HostMemoryMapper`] can be implemented if the host supports
//!   mapping MMAP buffers into the guest address space.
//!
//! # Anatomy of a device
//!
//! Devices implement [`VstreamDevice`] to provide ways to create and close
//! sessions and to expose their MMAP buffers to the guest. They typically
//! also implement [`ioctl::IoctlHandler`] and forward their
//! [`VstreamDevice::do_ioctl`] to [`ioctl::dispatch_ioctl`], so that all
//! payload parsing and validation is taken care of by this crate.
//!
//! The VMM wraps the device in a [`CommandDispatcher`] and asks it to process
//! a command whenever one arrives on the command queue. Device methods take
//! `&self` and sessions are handed out behind individual locks, so commands
//! for different sessions can be dispatched from several workers at once.

pub mod buffers;
pub mod devices;
pub mod events;
pub mod io;
pub mod ioctl;
pub mod memfd;
pub mod mmap;
pub mod protocol;
pub mod session;
pub mod types;

use std::io::Result as IoResult;
use std::os::fd::BorrowedFd;

use anyhow::Context;
use log::debug;
use log::error;

pub use io::ReadFromDescriptorChain;
pub use io::WriteToDescriptorChain;

use protocol::*;
use session::SessionTable;

/// A range of guest memory that has been mapped linearly into the host's
/// address space.
pub trait GuestMemoryRange {
    fn as_ptr(&self) -> *const u8;
    fn as_mut_ptr(&mut self) -> *mut u8;
}

/// Trait enabling linear access to sparse guest memory.
///
/// Guest buffers are described by scatter-gather lists of guest-physical
/// ranges; devices however need to see their content as contiguous. An
/// implementation of this trait bridges the two.
///
/// Note to devices: [`GuestMemoryMapper::Mapping`] instances must be held for
/// as long as the device might access the memory, as some implementations
/// write back into the guest at destruction time.
pub trait GuestMemoryMapper {
    /// Host-side linear view of sparse guest memory.
    type Mapping: GuestMemoryRange;

    /// Maps the guest-physical ranges of `sgs` into a linear host view.
    fn new_mapping(&self, sgs: Vec<SgEntry>) -> anyhow::Result<Self::Mapping>;
}

/// Trait for mapping host buffers into the guest address space.
///
/// Needed to support MMAP buffers. If the functionality is not required, `()`
/// can be passed in place of an implementor; it fails each mapping attempt
/// with `ENOTTY`.
pub trait HostMemoryMapper {
    /// Maps `length` bytes of host memory backed by `buffer` into the
    /// guest's shared memory region, at a host-chosen address.
    ///
    /// `offset` is the device range offset the mapping is created for.
    /// Returns the guest address of the mapping, or a `libc` error code.
    fn add_mapping(
        &mut self,
        buffer: BorrowedFd,
        length: u64,
        offset: u64,
        rw: bool,
    ) -> Result<u64, i32>;

    /// Removes the guest mapping previously created at `guest_addr`.
    fn remove_mapping(&mut self, guest_addr: u64) -> Result<(), i32>;
}

impl HostMemoryMapper for () {
    fn add_mapping(&mut self, _: BorrowedFd, _: u64, _: u64, _: bool) -> Result<u64, i32> {
        Err(libc::ENOTTY)
    }

    fn remove_mapping(&mut self, _: u64) -> Result<(), i32> {
        Err(libc::ENOTTY)
    }
}

/// Trait for implementing virtio-vstream devices.
///
/// The preferred way to use implementations is to wrap them in a
/// [`CommandDispatcher`], which takes care of reading and dispatching
/// commands, session lifetime included.
///
/// All methods take `&self`: devices keep whatever state is shared between
/// sessions behind their own synchronization, so that the dispatcher can be
/// driven from several worker threads.
pub trait VstreamDevice<Reader: ReadFromDescriptorChain, Writer: WriteToDescriptorChain> {
    type Session: Send;

    /// Creates a new session with id `session_id`.
    ///
    /// The error value is the code to send back to the guest.
    fn new_session(&self, session_id: u32) -> Result<Self::Session, i32>;

    /// Releases all resources of `session`. Infallible: a session that has
    /// been removed from the table is gone no matter what.
    fn close_session(&self, session: &mut Self::Session);

    /// Performs an IOCTL command and writes the response into `writer`.
    ///
    /// `code` is the raw ioctl code from the command; its direction and
    /// payload size decode from the code itself. The recommended
    /// implementation is to forward to [`ioctl::dispatch_ioctl`] on an
    /// [`ioctl::IoctlHandler`].
    ///
    /// Only returns an error if the response could not be written; all other
    /// errors are reported to the guest and are normal operation for the
    /// host.
    fn do_ioctl(
        &self,
        session: &mut Self::Session,
        code: u32,
        reader: &mut Reader,
        writer: &mut Writer,
    ) -> IoResult<()>;

    /// Performs the MMAP command: maps the buffer registered at `offset`
    /// into the guest and returns its guest address and size.
    fn do_mmap(
        &self,
        session: &mut Self::Session,
        flags: u32,
        offset: u64,
    ) -> Result<(u64, u64), i32>;

    /// Performs the MUNMAP command: removes the mapping previously created
    /// at `guest_addr` for this session.
    fn do_munmap(&self, session: &mut Self::Session, guest_addr: u64) -> Result<(), i32>;
}

/// Default number of concurrent sessions a device accepts.
pub const DEFAULT_MAX_SESSIONS: usize = 32;

/// Wrapper around a [`VstreamDevice`] managing its sessions and dispatching
/// the commands of the protocol to it.
pub struct CommandDispatcher<Reader, Writer, Device>
where
    Reader: ReadFromDescriptorChain,
    Writer: WriteToDescriptorChain,
    Device: VstreamDevice<Reader, Writer>,
{
    device: Device,
    sessions: SessionTable<Device::Session>,
}

impl<Reader, Writer, Device> CommandDispatcher<Reader, Writer, Device>
where
    Reader: ReadFromDescriptorChain,
    Writer: WriteToDescriptorChain,
    Device: VstreamDevice<Reader, Writer>,
{
    pub fn new(device: Device) -> Self {
        Self::with_max_sessions(device, DEFAULT_MAX_SESSIONS)
    }

    pub fn with_max_sessions(device: Device, max_sessions: usize) -> Self {
        Self {
            device,
            sessions: SessionTable::new(max_sessions),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Handles a single command from the command queue.
    ///
    /// `reader` and `writer` are the device-readable and device-writable
    /// sections of the descriptor chain carrying the command. After this
    /// method returns the caller is responsible for returning the used chain
    /// to the guest.
    ///
    /// Never returns an error, as doing so would halt the worker: errors are
    /// reported to the guest through the response, and failures to write the
    /// response itself are logged on the host side.
    pub fn handle_command(&self, reader: &mut Reader, writer: &mut Writer) {
        let hdr = match reader.read_obj::<CmdHeader>() {
            Ok(hdr) => hdr,
            Err(e) => {
                error!("error while reading command header: {:#}", e);
                let _ = writer.write_err_response(libc::EINVAL);
                return;
            }
        };

        let res = match hdr.cmd {
            VSTREAM_CMD_OPEN => {
                match self
                    .sessions
                    .add_with(|session_id| self.device.new_session(session_id))
                {
                    Ok(session_id) => writer.write_response(OpenResp::ok(session_id)),
                    Err(e) => writer.write_err_response(e),
                }
                .context("while writing response for OPEN command")
            }
            VSTREAM_CMD_CLOSE => reader
                .read_obj()
                .context("while reading CLOSE command")
                .and_then(|CloseCmd { session_id, .. }| {
                    match self.sessions.remove(session_id) {
                        Some(session) => {
                            self.device.close_session(&mut session.lock().unwrap());
                            writer.write_response(RespHeader::ok())
                        }
                        None => {
                            debug!("CLOSE command for unknown session {}", session_id);
                            writer.write_err_response(libc::EINVAL)
                        }
                    }
                    .context("while writing response for CLOSE command")
                }),
            VSTREAM_CMD_IOCTL => reader
                .read_obj()
                .context("while reading IOCTL command")
                .and_then(|IoctlCmd { session_id, code }| {
                    // The session is handed out behind its own lock and the
                    // table lock is released right away, so other sessions
                    // stay responsive for the duration of the ioctl.
                    match self.sessions.get(session_id) {
                        Some(session) => {
                            self.device
                                .do_ioctl(&mut session.lock().unwrap(), code, reader, writer)
                        }
                        None => writer.write_err_response(libc::EINVAL),
                    }
                    .context("while writing response for IOCTL command")
                }),
            VSTREAM_CMD_MMAP => reader
                .read_obj()
                .context("while reading MMAP command")
                .and_then(
                    |MmapCmd {
                         session_id,
                         flags,
                         offset,
                     }| {
                        match self.sessions.get(session_id).ok_or(libc::EINVAL).and_then(
                            |session| {
                                self.device
                                    .do_mmap(&mut session.lock().unwrap(), flags, offset)
                            },
                        ) {
                            Ok((guest_addr, size)) => {
                                writer.write_response(MmapResp::ok(guest_addr, size))
                            }
                            Err(e) => writer.write_err_response(e),
                        }
                        .context("while writing response for MMAP command")
                    },
                ),
            VSTREAM_CMD_MUNMAP => reader
                .read_obj()
                .context("while reading MUNMAP command")
                .and_then(
                    |MunmapCmd {
                         session_id,
                         driver_addr,
                         ..
                     }| {
                        match self.sessions.get(session_id).ok_or(libc::EINVAL).and_then(
                            |session| {
                                self.device
                                    .do_munmap(&mut session.lock().unwrap(), driver_addr)
                            },
                        ) {
                            Ok(()) => writer.write_response(MunmapResp::ok()),
                            Err(e) => writer.write_err_response(e),
                        }
                        .context("while writing response for MUNMAP command")
                    },
                ),
            cmd => {
                debug!("unknown command code {}", cmd);
                writer
                    .write_err_response(libc::EINVAL)
                    .context("while writing error response for unknown command")
            }
        };

        if let Err(e) = res {
            error!("error while processing command: {:#}", e);
            let _ = writer.write_err_response(libc::EINVAL);
        }
    }

    /// Closes all sessions and puts the dispatcher in its terminal state:
    /// any subsequent OPEN fails with `ENODEV`.
    pub fn shutdown(&self) {
        for (session_id, session) in self.sessions.shutdown() {
            debug!("closing session {} on shutdown", session_id);
            self.device.close_session(&mut session.lock().unwrap());
        }
    }

    /// Consumes the dispatcher and returns the device it was created from.
    pub fn into_device(self) -> Device {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    type TestDispatcher = CommandDispatcher<Cursor<Vec<u8>>, Vec<u8>, NullDevice>;

    /// Device accepting sessions but supporting no operation, to exercise
    /// the dispatcher itself.
    struct NullDevice;

    impl<Reader, Writer> VstreamDevice<Reader, Writer> for NullDevice
    where
        Reader: ReadFromDescriptorChain,
        Writer: WriteToDescriptorChain,
    {
        type Session = u32;

        fn new_session(&self, session_id: u32) -> Result<u32, i32> {
            Ok(session_id)
        }

        fn close_session(&self, _session: &mut u32) {}

        fn do_ioctl(
            &self,
            _session: &mut u32,
            _code: u32,
            _reader: &mut Reader,
            writer: &mut Writer,
        ) -> IoResult<()> {
            writer.write_err_response(libc::ENOTTY)
        }

        fn do_mmap(&self, _session: &mut u32, _flags: u32, _offset: u64) -> Result<(u64, u64), i32> {
            Err(libc::ENOTTY)
        }

        fn do_munmap(&self, _session: &mut u32, _guest_addr: u64) -> Result<(), i32> {
            Err(libc::ENOTTY)
        }
    }

    fn read_header(response: &[u8]) -> RespHeader {
        let mut slice = response;
        slice.read_obj::<RespHeader>().unwrap()
    }

    fn open_session(dispatcher: &TestDispatcher) -> u32 {
        let mut cmd = Vec::new();
        cmd.write_obj(CmdHeader::new(VSTREAM_CMD_OPEN)).unwrap();

        let mut response = Vec::new();
        dispatcher.handle_command(&mut Cursor::new(cmd), &mut response);

        let mut slice = response.as_slice();
        let resp = slice.read_obj::<OpenResp>().unwrap();
        assert_eq!(resp.hdr.errno, 0);
        resp.session_id
    }

    fn close_session(dispatcher: &TestDispatcher, session_id: u32) -> RespHeader {
        let mut cmd = Vec::new();
        cmd.write_obj(CmdHeader::new(VSTREAM_CMD_CLOSE)).unwrap();
        cmd.write_obj(CloseCmd::new(session_id)).unwrap();

        let mut response = Vec::new();
        dispatcher.handle_command(&mut Cursor::new(cmd), &mut response);
        read_header(&response)
    }

    #[test]
    fn session_lifecycle() {
        let dispatcher = CommandDispatcher::new(NullDevice);

        let first = open_session(&dispatcher);
        let second = open_session(&dispatcher);
        assert_eq!(first, 0);
        assert_eq!(second, 1);

        assert_eq!(close_session(&dispatcher, first).errno, 0);
        // Closing is not idempotent: a second CLOSE of the same session is
        // an error, and it still gets a response.
        assert_eq!(close_session(&dispatcher, first).errno, libc::EINVAL);

        // The freed id is reused by the next OPEN.
        assert_eq!(open_session(&dispatcher), 0);
    }

    #[test]
    fn ioctl_on_unknown_session() {
        let dispatcher = CommandDispatcher::new(NullDevice);

        let mut cmd = Vec::new();
        cmd.write_obj(CmdHeader::new(VSTREAM_CMD_IOCTL)).unwrap();
        cmd.write_obj(IoctlCmd {
            session_id: 42,
            code: crate::ioctl::VstreamIoctl::GFmt.code(),
        })
        .unwrap();

        let mut response = Vec::new();
        dispatcher.handle_command(&mut Cursor::new(cmd), &mut response);
        assert_eq!(read_header(&response).errno, libc::EINVAL);
    }

    #[test]
    fn unknown_command_code() {
        let dispatcher = CommandDispatcher::new(NullDevice);

        let mut cmd = Vec::new();
        cmd.write_obj(CmdHeader::new(0xdead)).unwrap();

        let mut response = Vec::new();
        dispatcher.handle_command(&mut Cursor::new(cmd), &mut response);
        assert_eq!(read_header(&response).errno, libc::EINVAL);
    }

    #[test]
    fn truncated_command_is_invalid() {
        let dispatcher = CommandDispatcher::new(NullDevice);

        // IOCTL header with no IoctlCmd behind it.
        let mut cmd = Vec::new();
        cmd.write_obj(CmdHeader::new(VSTREAM_CMD_IOCTL)).unwrap();

        let mut response = Vec::new();
        dispatcher.handle_command(&mut Cursor::new(cmd), &mut response);
        assert_eq!(read_header(&response).errno, libc::EINVAL);
    }

    #[test]
    fn shutdown_is_terminal() {
        let dispatcher = CommandDispatcher::new(NullDevice);

        open_session(&dispatcher);
        dispatcher.shutdown();

        let mut cmd = Vec::new();
        cmd.write_obj(CmdHeader::new(VSTREAM_CMD_OPEN)).unwrap();

        let mut response = Vec::new();
        dispatcher.handle_command(&mut Cursor::new(cmd), &mut response);
        assert_eq!(read_header(&response).errno, libc::ENODEV);
    }
}
