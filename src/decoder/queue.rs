// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;

use crate::decoder::CodecFrame;

/// Sort key of a frame. Frames without a timestamp go last.
fn sort_key(frame: &CodecFrame) -> u64 {
    frame.pts.unwrap_or(u64::MAX)
}

/// Caller frames waiting for a decoded surface, sorted by ascending presentation timestamp.
/// Frames with equal timestamps keep their insertion order.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    frames: VecDeque<CodecFrame>,
}

impl PendingQueue {
    pub fn insert_sorted(&mut self, frame: CodecFrame) {
        let key = sort_key(&frame);
        let pos = self.frames.partition_point(|f| sort_key(f) <= key);
        self.frames.insert(pos, frame);
    }

    /// Removes the frame with the lowest timestamp.
    pub fn pop_oldest(&mut self) -> Option<CodecFrame> {
        self.frames.pop_front()
    }

    /// Removes the frame with the highest timestamp.
    #[cfg(test)]
    pub fn pop_newest(&mut self) -> Option<CodecFrame> {
        self.frames.pop_back()
    }

    /// Removes the frame at `index`, counted from the oldest frame.
    pub fn evict_at(&mut self, index: usize) -> Option<CodecFrame> {
        self.frames.remove(index)
    }

    pub fn get(&self, index: usize) -> Option<&CodecFrame> {
        self.frames.get(index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &CodecFrame> {
        self.frames.iter()
    }
}

/// Frames handed back to the caller in the order they were pushed.
#[derive(Debug, Default)]
pub(crate) struct FrameFifo {
    frames: VecDeque<CodecFrame>,
}

impl FrameFifo {
    pub fn push(&mut self, frame: CodecFrame) {
        self.frames.push_back(frame);
    }

    pub fn pop(&mut self) -> Option<CodecFrame> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}
