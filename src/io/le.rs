// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! On a little-endian host the wire representation is the native one, so the
//! conversions here are no-ops.

use crate::io::LeWrapper;
use crate::protocol::CloseCmd;
use crate::protocol::CmdHeader;
use crate::protocol::DequeueBufferEvent;
use crate::protocol::ErrorEvent;
use crate::protocol::IoctlCmd;
use crate::protocol::MmapCmd;
use crate::protocol::MmapResp;
use crate::protocol::MunmapCmd;
use crate::protocol::MunmapResp;
use crate::protocol::OpenCmd;
use crate::protocol::OpenResp;
use crate::protocol::RespHeader;
use crate::protocol::SessionEvent;
use crate::protocol::SgEntry;
use crate::types::Control;
use crate::types::ControlArray;
use crate::types::DeviceEvent;
use crate::types::EventSubscription;
use crate::types::FormatDesc;
use crate::types::RequestBuffers;
use crate::types::VideoFormat;
use crate::types::WireBuffer;
use crate::types::WirePlane;

/// Trait for types that can transit on a virtio-vstream queue.
pub trait WireType: Sized {
    fn to_le(self) -> LeWrapper<Self> {
        LeWrapper(self)
    }
    fn from_le(le: LeWrapper<Self>) -> Self {
        le.0
    }
}

impl WireType for () {}
impl WireType for u32 {}
impl WireType for i32 {}

impl WireType for CmdHeader {}
impl WireType for RespHeader {}
impl WireType for OpenCmd {}
impl WireType for OpenResp {}
impl WireType for CloseCmd {}
impl WireType for IoctlCmd {}
impl WireType for SgEntry {}
impl WireType for MmapCmd {}
impl WireType for MmapResp {}
impl WireType for MunmapCmd {}
impl WireType for MunmapResp {}
impl WireType for ErrorEvent {}
impl WireType for DequeueBufferEvent {}
impl WireType for SessionEvent {}

impl WireType for VideoFormat {}
impl WireType for FormatDesc {}
impl WireType for RequestBuffers {}
impl WireType for WireBuffer {}
impl WireType for WirePlane {}
impl WireType for ControlArray {}
impl WireType for Control {}
impl WireType for EventSubscription {}
impl WireType for DeviceEvent {}
