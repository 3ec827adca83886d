// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device implementations that can run on any VMM providing the traits of
//! the crate root.

#[cfg(feature = "pattern-device")]
pub mod pattern;

#[cfg(feature = "pattern-device")]
pub use pattern::PatternCaptureDevice;
