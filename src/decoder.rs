// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod pipeline;
mod queue;
mod timing;

use bytes::Bytes;
use thiserror::Error;

use crate::backend::Status;
use crate::filter::FilterError;
use crate::retry::RetryPolicy;
use crate::surface_pool::PooledSurface;
use crate::task::TaskError;

pub use pipeline::Decoder;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to parse stream header (status {0:?})")]
    BitstreamParse(Status),
    #[error("no surface available")]
    AllocationFailed,
    #[error("decoder initialization failed: {0}")]
    InitFailed(anyhow::Error),
    #[error("unexpected hardware status {0:?}")]
    Unknown(Status),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("post-processing failed: {0}")]
    Filter(#[from] FilterError),
    #[error("decoder is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Non-error outcome of a decoder operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecoderStatus {
    Success,
    /// The hardware needs more input before producing a frame.
    NeedMoreData,
    /// The hardware holds no more frames.
    Flushed,
}

/// Construction-time configuration of a [`Decoder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Number of operations the hardware may have in flight.
    pub async_depth: u16,
    /// Low latency source: one frame in flight, complete frames only.
    pub live_mode: bool,
    /// The decoder was picked automatically to decode an unknown stream. Allows more operations
    /// in flight and does not enforce the codec level.
    pub autoplugged: bool,
    /// Reset instead of outputting frames with major corruption.
    pub skip_corrupted_frames: bool,
    pub busy_retry: RetryPolicy,
    pub sync_retry: RetryPolicy,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            async_depth: 4,
            live_mode: false,
            autoplugged: false,
            skip_corrupted_frames: false,
            busy_retry: RetryPolicy::DECODE_BUSY,
            sync_retry: RetryPolicy::SYNC,
        }
    }
}

/// A unit of compressed input along with its metadata. Frames pushed to a [`Decoder`] are given
/// back either with a decoded surface attached, or as discarded.
#[derive(Debug)]
pub struct CodecFrame {
    pub system_frame_number: u32,
    /// Presentation timestamp, in nanoseconds.
    pub pts: Option<u64>,
    /// Duration, in nanoseconds.
    pub duration: Option<u64>,
    /// The frame can be decoded without reference to previous frames.
    pub sync_point: bool,
    pub input: Bytes,
    output: Option<PooledSurface>,
}

impl CodecFrame {
    pub fn new(
        system_frame_number: u32,
        pts: Option<u64>,
        duration: Option<u64>,
        sync_point: bool,
        input: impl Into<Bytes>,
    ) -> Self {
        Self {
            system_frame_number,
            pts,
            duration,
            sync_point,
            input: input.into(),
            output: None,
        }
    }

    /// The decoded surface of this frame.
    pub fn output(&self) -> Option<&PooledSurface> {
        self.output.as_ref()
    }

    pub fn take_output(&mut self) -> Option<PooledSurface> {
        self.output.take()
    }

    pub(crate) fn set_output(&mut self, surface: PooledSurface) {
        self.output = Some(surface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::FrameInfo;
    use crate::surface_pool::SurfacePool;

    #[test]
    fn output_ownership() {
        let pool = SurfacePool::new(FrameInfo::default(), 1);
        let mut frame = CodecFrame::new(0, Some(0), None, true, vec![1u8, 2, 3]);
        assert!(frame.output().is_none());

        frame.set_output(pool.lease().unwrap());
        assert_eq!(pool.num_free_surfaces(), 0);

        let surface = frame.take_output().unwrap();
        assert!(frame.output().is_none());
        drop(surface);
        assert_eq!(pool.num_free_surfaces(), 1);
    }

    #[test]
    fn default_config() {
        let config = DecoderConfig::default();
        assert_eq!(config.async_depth, 4);
        assert_eq!(config.busy_retry, RetryPolicy::DECODE_BUSY);
    }
}
