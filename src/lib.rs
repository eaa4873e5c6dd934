// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Orchestration of a hardware decode and post-processing pipeline.
//!
//! Compressed access units are pushed into a [`decoder::Decoder`], which feeds them to the
//! hardware decode unit of a [`backend::Session`], optionally routes every decoded surface
//! through a [`filter::Filter`] (scaling, colour conversion, deinterlacing, ...) and pairs the
//! results with the caller's frames in presentation order.
//!
//! The hardware itself is reached through the [`backend::SessionProvider`] and
//! [`backend::Session`] traits. [`backend::dummy`] provides a scriptable implementation that lets
//! the pipeline run in isolation.

pub mod backend;
pub mod bitstream;
pub mod decoder;
pub mod filter;
pub mod params;
pub mod retry;
pub mod surface_pool;
pub mod task;

use std::fmt;
use std::str::FromStr;

/// A rectangle inside a surface, usually the visible part of a padded allocation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

/// Four character code describing a pixel layout.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const NV12: Fourcc = Fourcc::from_bytes(b"NV12");
    pub const P010: Fourcc = Fourcc::from_bytes(b"P010");
    pub const RGB4: Fourcc = Fourcc::from_bytes(b"RGB4");
    pub const YUY2: Fourcc = Fourcc::from_bytes(b"YUY2");
    pub const A2RGB10: Fourcc = Fourcc::from_bytes(b"RG10");

    pub const fn from_bytes(b: &[u8; 4]) -> Self {
        Fourcc(u32::from_le_bytes(*b))
    }

    /// Luma/chroma bit depth of the layout.
    pub fn bit_depth(&self) -> u16 {
        match *self {
            Fourcc::P010 | Fourcc::A2RGB10 => 10,
            _ => 8,
        }
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(b: &[u8; 4]) -> Self {
        Fourcc::from_bytes(b)
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&b))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fourcc({self})")
    }
}

impl FromStr for Fourcc {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(Fourcc::NV12),
            "p010" | "P010" => Ok(Fourcc::P010),
            "rgb4" | "RGB4" | "bgra" | "BGRA" => Ok(Fourcc::RGB4),
            "yuy2" | "YUY2" => Ok(Fourcc::YUY2),
            "rg10" | "RG10" | "a2rgb10" | "A2RGB10" => Ok(Fourcc::A2RGB10),
            _ => Err("unrecognized format. Valid values: nv12, p010, rgb4, yuy2, a2rgb10"),
        }
    }
}

/// Picture structure of a stream or surface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PicStruct {
    #[default]
    Progressive,
    /// Interlaced, top field first.
    FieldTff,
    /// Interlaced, bottom field first.
    FieldBff,
}

impl PicStruct {
    pub fn is_interlaced(&self) -> bool {
        !matches!(self, PicStruct::Progressive)
    }
}

/// Description of the stream as negotiated with the caller: display geometry, output pixel
/// format and timing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: u16,
    pub height: u16,
    /// Pixel format the caller wants to receive.
    pub format: Fourcc,
    pub pic_struct: PicStruct,
    pub fps_n: u32,
    pub fps_d: u32,
    pub par_n: u16,
    pub par_d: u16,
}

impl Default for VideoInfo {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: Fourcc::NV12,
            pic_struct: PicStruct::Progressive,
            fps_n: 30,
            fps_d: 1,
            par_n: 1,
            par_d: 1,
        }
    }
}

impl VideoInfo {
    pub fn new(width: u16, height: u16, format: Fourcc) -> Self {
        Self {
            width,
            height,
            format,
            ..Default::default()
        }
    }

    /// Frame rate rounded to the closest integer, or `None` if it is not known.
    pub fn rounded_frame_rate(&self) -> Option<u32> {
        rounded_frame_rate(self.fps_n, self.fps_d)
    }
}

/// Rounds `fps_n / fps_d` to the closest integer.
pub(crate) fn rounded_frame_rate(fps_n: u32, fps_d: u32) -> Option<u32> {
    if fps_n == 0 || fps_d == 0 {
        return None;
    }

    Some((fps_n + fps_d / 2) / fps_d)
}

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
pub(crate) fn align_up(value: u16, align: u16) -> u16 {
    debug_assert!(align.is_power_of_two());
    (value.wrapping_add(align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_through_strings() {
        assert_eq!("NV12".parse::<Fourcc>(), Ok(Fourcc::NV12));
        assert_eq!("p010".parse::<Fourcc>(), Ok(Fourcc::P010));
        assert_eq!(Fourcc::RGB4.to_string(), "RGB4");
        assert!("I420".parse::<Fourcc>().is_err());
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(1920, 16), 1920);
        assert_eq!(align_up(1080, 16), 1088);
        assert_eq!(align_up(1080, 32), 1088);
        assert_eq!(align_up(720, 32), 736);
        assert_eq!(align_up(0, 32), 0);
    }

    #[test]
    fn frame_rate_rounding() {
        assert_eq!(rounded_frame_rate(60000, 1001), Some(60));
        assert_eq!(rounded_frame_rate(30000, 1001), Some(30));
        assert_eq!(rounded_frame_rate(25, 1), Some(25));
        assert_eq!(rounded_frame_rate(0, 1), None);
    }
}
