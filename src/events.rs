// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Delivery of device-initiated events to the driver.
//!
//! Events travel on a dedicated queue of driver-provided descriptor chains,
//! independently from command responses. Devices emit them through an
//! [`EventQueue`], leaving the actual chain management to the host
//! integration layer.

use std::io::Result as IoResult;

use crate::io::WriteToDescriptorChain;
use crate::protocol::DequeueBufferEvent;
use crate::protocol::ErrorEvent;
use crate::protocol::SessionEvent;
use crate::protocol::VstreamEvent;

impl VstreamEvent {
    /// Serializes the event into the device-writable section of an event
    /// queue descriptor chain.
    pub fn write_to<W: WriteToDescriptorChain>(self, writer: &mut W) -> IoResult<()> {
        match self {
            VstreamEvent::Error(event) => writer.write_obj(event),
            VstreamEvent::DequeueBuffer(event) => writer.write_obj(event),
            VstreamEvent::Session(event) => writer.write_obj(event),
        }
    }
}

/// Writer of events into the event queue of a device.
pub trait EventQueue {
    fn send_event(&self, event: VstreamEvent);

    /// Reports a fatal session error to the driver. The session is dead from
    /// the driver's point of view once this event is received.
    fn send_error(&self, session_id: u32, errno: i32) {
        self.send_event(VstreamEvent::Error(ErrorEvent::new(session_id, errno)));
    }

    /// Signals that the device is done processing a buffer.
    fn send_dequeue_buffer(&self, event: DequeueBufferEvent) {
        self.send_event(VstreamEvent::DequeueBuffer(event));
    }

    /// Delivers a subscribed device event to a session.
    fn send_session_event(&self, event: SessionEvent) {
        self.send_event(VstreamEvent::Session(event));
    }
}

/// Channel-backed event queue, for hosts draining events from a worker
/// thread and for tests.
impl EventQueue for std::sync::mpsc::Sender<VstreamEvent> {
    fn send_event(&self, event: VstreamEvent) {
        if let Err(e) = self.send(event) {
            log::error!("failed to queue event for delivery: {}", e);
        }
    }
}
