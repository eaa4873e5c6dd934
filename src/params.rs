// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter blocks exchanged with the hardware and between cooperating pipeline stages.

use bitflags::bitflags;

use crate::filter::ops::FilterOp;
use crate::Fourcc;
use crate::PicStruct;
use crate::Rect;
use crate::VideoInfo;

/// Compressed formats the decode unit can be configured for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    Avc,
    Hevc,
    Mpeg2,
    Vc1,
    Jpeg,
    Vp8,
    Vp9,
}

impl Codec {
    /// Codecs whose stream parameters must be read from an in-band header before the session
    /// can be initialized.
    pub fn needs_header_probe(&self) -> bool {
        matches!(self, Codec::Vc1 | Codec::Mpeg2 | Codec::Jpeg)
    }
}

/// Codec, profile and level of a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    pub codec: Codec,
    pub profile: u16,
    pub level: u16,
}

impl Profile {
    pub const HEVC_MAIN: u16 = 1;
    pub const HEVC_MAIN10: u16 = 2;

    pub fn new(codec: Codec, profile: u16, level: u16) -> Self {
        Self {
            codec,
            profile,
            level,
        }
    }

    pub fn is_hevc_main10(&self) -> bool {
        self.codec == Codec::Hevc && self.profile == Self::HEVC_MAIN10
    }
}

bitflags! {
    /// Where input and output surfaces of a hardware unit live.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct IoPattern: u16 {
        const IN_VIDEO_MEMORY = 0x01;
        const IN_SYSTEM_MEMORY = 0x02;
        const OUT_VIDEO_MEMORY = 0x10;
        const OUT_SYSTEM_MEMORY = 0x20;
    }
}

bitflags! {
    /// Memory type and provenance of a frame allocation request.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct MemType: u16 {
        const VIDEO_MEMORY_DECODER_TARGET = 0x0010;
        const VIDEO_MEMORY_PROCESSOR_TARGET = 0x0020;
        const SYSTEM_MEMORY = 0x0040;
        const FROM_ENCODE = 0x0100;
        const FROM_DECODE = 0x0200;
        const FROM_VPPIN = 0x0400;
        const FROM_VPPOUT = 0x0800;
        const INTERNAL_FRAME = 0x0001;
        const EXTERNAL_FRAME = 0x0002;
    }
}

/// Layout of the frames processed by a hardware unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub fourcc: Fourcc,
    pub pic_struct: PicStruct,
    /// Allocation width, aligned to the hardware requirements.
    pub width: u16,
    /// Allocation height, aligned to the hardware requirements.
    pub height: u16,
    /// Visible part of the allocation.
    pub crop: Rect,
    pub frame_rate_n: u32,
    pub frame_rate_d: u32,
    pub aspect_ratio_w: u16,
    pub aspect_ratio_h: u16,
    pub bit_depth_luma: u16,
    pub bit_depth_chroma: u16,
    /// Whether samples of high bit depth formats are stored in the most significant bits.
    pub shift: u16,
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self {
            fourcc: Fourcc::NV12,
            pic_struct: PicStruct::Progressive,
            width: 0,
            height: 0,
            crop: Default::default(),
            frame_rate_n: 30,
            frame_rate_d: 1,
            aspect_ratio_w: 1,
            aspect_ratio_h: 1,
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
            shift: 0,
        }
    }
}

impl FrameInfo {
    /// Builds the frame layout for `info`, with both dimensions aligned to 32.
    pub fn from_video_info(info: &VideoInfo) -> Self {
        let depth = info.format.bit_depth();

        Self {
            fourcc: info.format,
            pic_struct: info.pic_struct,
            width: crate::align_up(info.width, 32),
            height: crate::align_up(info.height, 32),
            crop: Rect {
                x: 0,
                y: 0,
                width: info.width,
                height: info.height,
            },
            frame_rate_n: if info.fps_n != 0 { info.fps_n } else { 30 },
            frame_rate_d: info.fps_d,
            aspect_ratio_w: info.par_n,
            aspect_ratio_h: info.par_d,
            bit_depth_luma: depth,
            bit_depth_chroma: depth,
            shift: 0,
        }
    }

    /// Frame rate rounded to the closest integer.
    pub fn rounded_frame_rate(&self) -> Option<u32> {
        crate::rounded_frame_rate(self.frame_rate_n, self.frame_rate_d)
    }
}

/// Input and output layouts of a post-processing unit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VppFrameInfo {
    pub input: FrameInfo,
    pub output: FrameInfo,
}

/// Parameters a hardware unit is initialized with. A task publishes the parameters of its unit
/// so that cooperating stages can adjust to them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VideoParams {
    pub codec: Option<Codec>,
    pub codec_profile: u16,
    pub codec_level: u16,
    /// Number of operations the hardware may have in flight.
    pub async_depth: u16,
    pub io_pattern: IoPattern,
    /// Output decoded frames in decode order rather than display order.
    pub decoded_order: bool,
    /// Decode/encode frame layout.
    pub frame_info: FrameInfo,
    /// Post-processing frame layouts.
    pub vpp: VppFrameInfo,
    /// Post-processing operations to enable, one per kind.
    pub filters: Vec<FilterOp>,
}

/// A number of frames to allocate for a hardware unit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocRequest {
    pub info: FrameInfo,
    pub mem_type: MemType,
    pub num_frame_min: u16,
    pub num_frame_suggested: u16,
}

impl AllocRequest {
    /// Adds the requirements of another stage using the same underlying task. Counts add up and
    /// memory type flags are combined, so no stage loses its share.
    pub fn merge(&mut self, other: &AllocRequest, from: MemType) {
        self.num_frame_min = self.num_frame_min.saturating_add(other.num_frame_min);
        self.num_frame_suggested = self
            .num_frame_suggested
            .saturating_add(other.num_frame_suggested);
        self.mem_type |= from;
    }

    pub fn is_video_memory(&self) -> bool {
        self.mem_type.intersects(
            MemType::VIDEO_MEMORY_DECODER_TARGET | MemType::VIDEO_MEMORY_PROCESSOR_TARGET,
        )
    }
}

/// Handle to device memory backing one frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemId(pub u64);

/// Result of a device frame allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocResponse {
    /// The task the allocation was performed for.
    pub task: crate::task::TaskId,
    pub mem_ids: Vec<MemId>,
}

impl AllocResponse {
    pub fn num_frames(&self) -> usize {
        self.mem_ids.len()
    }
}
