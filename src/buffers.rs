// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-session buffer bookkeeping shared by device implementations.
//!
//! A [`BufferQueue`] tracks the slots allocated by REQBUFS for one queue of a
//! session: their backing description, their queued/idle state, and the FIFO
//! of buffers awaiting processing. Driver-side tokens (the plane array
//! pointer and per-plane backing descriptors) are captured at QBUF time so
//! they can be echoed in responses and dequeue events after the originating
//! descriptor chain is long gone.

use std::collections::VecDeque;

use crate::protocol::SgEntry;
use crate::types::MemoryType;
use crate::types::QueueType;
use crate::types::WireBuffer;
use crate::types::WirePlane;
use crate::types::BUFFER_FLAG_DONE;
use crate::types::BUFFER_FLAG_QUEUED;

/// Backing storage of one plane of a buffer slot.
#[derive(Debug, Clone)]
pub enum PlaneBacking {
    /// Host-allocated storage, exposed to the driver at `mem_offset` in the
    /// device's mappable range space.
    Mmap { mem_offset: u64 },
    /// Guest-allocated storage. `token` is the driver-side descriptor echoed
    /// on the wire; `regions` is the validated scatter-gather list to access
    /// the memory through.
    GuestSg { token: u64, regions: Vec<SgEntry> },
    /// Opaque handle to an externally shared object.
    SharedObject { handle: u64 },
}

impl PlaneBacking {
    /// Wire representation of the backing descriptor.
    fn token(&self) -> u64 {
        match self {
            PlaneBacking::Mmap { mem_offset } => *mem_offset,
            PlaneBacking::GuestSg { token, .. } => *token,
            PlaneBacking::SharedObject { handle } => *handle,
        }
    }
}

/// State of one plane of a buffer slot.
#[derive(Debug, Clone)]
pub struct PlaneSlot {
    pub length: u32,
    pub bytesused: u32,
    pub data_offset: u32,
    pub backing: PlaneBacking,
}

impl PlaneSlot {
    pub fn new(length: u32, backing: PlaneBacking) -> Self {
        Self {
            length,
            bytesused: 0,
            data_offset: 0,
            backing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Queued,
}

/// One buffer slot allocated by REQBUFS.
#[derive(Debug, Clone)]
pub struct BufferSlot {
    index: u32,
    state: SlotState,
    sequence: u32,
    /// Driver-side token for the plane array, captured at QBUF time.
    planes_token: u64,
    planes: Vec<PlaneSlot>,
}

impl BufferSlot {
    pub fn new(index: u32, planes: Vec<PlaneSlot>) -> Self {
        Self {
            index,
            state: SlotState::Idle,
            sequence: 0,
            planes_token: 0,
            planes,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn planes(&self) -> &[PlaneSlot] {
        &self.planes
    }

    pub fn is_queued(&self) -> bool {
        self.state == SlotState::Queued
    }

    /// Wire snapshot of this slot, with driver tokens echoed.
    fn to_wire(&self, queue: QueueType, memory: MemoryType) -> (WireBuffer, Vec<WirePlane>) {
        let flags = match self.state {
            SlotState::Idle => 0,
            SlotState::Queued => BUFFER_FLAG_QUEUED,
        };

        let buffer = WireBuffer {
            queue: queue as u32,
            index: self.index,
            memory: memory as u32,
            flags,
            sequence: self.sequence,
            num_planes: self.planes.len() as u32,
            planes_ptr: self.planes_token,
            ..Default::default()
        };

        let planes = self
            .planes
            .iter()
            .map(|plane| {
                let mut wire = WirePlane::default();
                wire.bytesused = plane.bytesused;
                wire.length = plane.length;
                wire.data_offset = plane.data_offset;
                wire.backing = plane.backing.token();
                wire
            })
            .collect();

        (buffer, planes)
    }
}

/// Buffer state of one queue of a session.
#[derive(Debug)]
pub struct BufferQueue {
    queue: QueueType,
    memory: Option<MemoryType>,
    slots: Vec<BufferSlot>,
    /// Indices of queued slots, in QBUF order.
    pending: VecDeque<u32>,
    streaming: bool,
}

impl BufferQueue {
    pub fn new(queue: QueueType) -> Self {
        Self {
            queue,
            memory: None,
            slots: Vec::new(),
            pending: VecDeque::new(),
            streaming: false,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue
    }

    pub fn memory(&self) -> Option<MemoryType> {
        self.memory
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn slot(&self, index: u32) -> Option<&BufferSlot> {
        self.slots.get(index as usize)
    }

    /// Drops all slots and stops streaming. Equivalent to a REQBUFS with a
    /// count of zero.
    pub fn reset(&mut self) {
        self.memory = None;
        self.slots.clear();
        self.pending.clear();
        self.streaming = false;
    }

    /// Installs the slots allocated by a REQBUFS operation, replacing any
    /// previous allocation.
    pub fn set_slots(&mut self, memory: MemoryType, slots: Vec<BufferSlot>) {
        self.reset();
        self.memory = Some(memory);
        self.slots = slots;
    }

    pub fn streamon(&mut self) {
        self.streaming = true;
    }

    /// Stops streaming and returns all queued buffers to the idle state. Any
    /// buffer not yet dequeued is lost without an event.
    pub fn streamoff(&mut self) {
        self.streaming = false;
        self.pending.clear();
        for slot in &mut self.slots {
            slot.state = SlotState::Idle;
        }
    }

    /// Wire snapshot of slot `index`, for QUERYBUF.
    pub fn query(&self, index: u32) -> Result<(WireBuffer, Vec<WirePlane>), i32> {
        let memory = self.memory.ok_or(libc::EINVAL)?;
        let slot = self.slot(index).ok_or(libc::EINVAL)?;

        Ok(slot.to_wire(self.queue, memory))
    }

    /// Queues a buffer described by a QBUF payload.
    ///
    /// Captures the driver tokens (and, for guest scatter-gather memory, the
    /// per-plane region lists) so they survive the release of the descriptor
    /// chain, and returns the snapshot to send back in the response.
    pub fn queue_buffer(
        &mut self,
        buffer: WireBuffer,
        planes: Vec<WirePlane>,
        mut sg_lists: Vec<Vec<SgEntry>>,
    ) -> Result<(WireBuffer, Vec<WirePlane>), i32> {
        let memory = self.memory.ok_or(libc::EINVAL)?;
        if buffer.memory != memory as u32 {
            return Err(libc::EINVAL);
        }

        let queue = self.queue;
        let slot = self
            .slots
            .get_mut(buffer.index as usize)
            .ok_or(libc::EINVAL)?;

        if planes.len() != slot.planes.len() {
            return Err(libc::EINVAL);
        }
        if slot.state == SlotState::Queued {
            return Err(libc::EBUSY);
        }

        slot.planes_token = buffer.planes_ptr;

        let mut sg_lists = sg_lists.drain(..);
        for (plane_slot, plane) in slot.planes.iter_mut().zip(planes.iter()) {
            plane_slot.bytesused = plane.bytesused;
            plane_slot.data_offset = plane.data_offset;

            if memory == MemoryType::GuestSg {
                plane_slot.length = plane.length;
                plane_slot.backing = PlaneBacking::GuestSg {
                    token: plane.backing,
                    regions: if plane.length > 0 {
                        sg_lists.next().ok_or(libc::EINVAL)?
                    } else {
                        Vec::new()
                    },
                };
            } else if memory == MemoryType::SharedObject {
                plane_slot.backing = PlaneBacking::SharedObject {
                    handle: plane.backing,
                };
            }
        }

        slot.state = SlotState::Queued;
        self.pending.push_back(slot.index);

        Ok(slot.to_wire(queue, memory))
    }

    /// Next queued buffer awaiting processing, if the queue is streaming.
    pub fn pop_queued(&mut self) -> Option<u32> {
        if !self.streaming {
            return None;
        }
        self.pending.pop_front()
    }

    /// Marks a processed buffer as done and returns the snapshot to carry in
    /// the dequeue event.
    pub fn finish(
        &mut self,
        index: u32,
        sequence: u32,
        bytesused: &[u32],
    ) -> Result<(WireBuffer, Vec<WirePlane>), i32> {
        let memory = self.memory.ok_or(libc::EINVAL)?;
        let queue = self.queue;
        let slot = self.slots.get_mut(index as usize).ok_or(libc::EINVAL)?;

        if slot.state != SlotState::Queued {
            return Err(libc::EINVAL);
        }

        slot.state = SlotState::Idle;
        slot.sequence = sequence;
        for (plane, used) in slot.planes.iter_mut().zip(bytesused.iter()) {
            plane.bytesused = *used;
        }

        let (mut buffer, planes) = slot.to_wire(queue, memory);
        buffer.flags = BUFFER_FLAG_DONE;

        Ok((buffer, planes))
    }
}
