// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

std::compile_error!("Big-endian hosts are not supported yet");

pub trait WireType: Sized {
    fn to_le(self) -> LeWrapper<Self>;

    fn from_le(le: LeWrapper<Self>) -> Self {
        // Assume endianness conversion is symmetrical, which it should be.
        self.0.to_le().0
    }
}
