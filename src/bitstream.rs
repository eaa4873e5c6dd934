// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Accumulation of compressed data handed to the decode unit.

use bytes::Buf;
use bytes::BytesMut;

/// Initial capacity of the accumulation buffer.
const INITIAL_CAPACITY: usize = 16 * 1024;

/// Compressed data not yet consumed by the hardware.
///
/// New payloads are appended at the end, while the hardware consumes from the front by
/// advancing the data offset. Once a frame has been decoded the consumed prefix is dropped, so
/// the buffer only ever holds data the hardware still has to look at.
///
/// The invariant `offset() <= buf.len() <= buf.capacity()` holds at all times.
#[derive(Debug)]
pub struct Bitstream {
    buf: BytesMut,
    /// Number of bytes at the front of `buf` already consumed by the hardware.
    offset: usize,
    /// The data contains whole frames only, as is the case for low-latency sources.
    complete_frame: bool,
}

impl Default for Bitstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Bitstream {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            offset: 0,
            complete_frame: false,
        }
    }

    /// Creates a bitstream holding `data`, with nothing consumed yet.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut bs = Self::new();
        bs.append(data);
        bs
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The data the hardware has not consumed yet.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes consumed since the last call to [`Bitstream::drop_consumed`].
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total number of bytes held, consumed or not.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Marks `count` bytes as consumed. Consuming more than what is available consumes
    /// everything.
    pub fn consume(&mut self, count: usize) {
        self.offset = std::cmp::min(self.offset + count, self.buf.len());
    }

    /// Forgets the consumed prefix of the buffer.
    pub fn drop_consumed(&mut self) {
        self.buf.advance(self.offset);
        self.offset = 0;
    }

    /// Discards everything, consumed or not.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.offset = 0;
    }

    pub fn complete_frame(&self) -> bool {
        self.complete_frame
    }

    pub fn set_complete_frame(&mut self, complete_frame: bool) {
        self.complete_frame = complete_frame;
    }
}
