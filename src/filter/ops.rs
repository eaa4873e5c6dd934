// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Post-processing operations and their parameters.

use std::collections::BTreeMap;

use enumn::N;

/// The kinds of operation the post-processing unit can run. A pipeline enables at most one
/// operation of each kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterKind {
    Deinterlacing,
    ProcAmp,
    Denoise,
    Detail,
    Rotation,
    Mirroring,
    ScalingMode,
    FrameRateConversion,
}

/// Colour controls.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ProcAmp {
    /// -100.0 to 100.0.
    pub brightness: f32,
    /// 0.0 to 10.0.
    pub contrast: f32,
    /// -180.0 to 180.0.
    pub hue: f32,
    /// 0.0 to 10.0.
    pub saturation: f32,
}

impl Default for ProcAmp {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
            hue: 0.0,
            saturation: 1.0,
        }
    }
}

#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u16)]
pub enum Rotation {
    #[default]
    Deg0 = 0,
    Deg90 = 90,
    Deg180 = 180,
    Deg270 = 270,
}

impl Rotation {
    pub fn from_degrees(degrees: u16) -> Option<Self> {
        Self::n(degrees)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Mirroring {
    #[default]
    Disabled,
    Horizontal,
    Vertical,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ScalingMode {
    #[default]
    Default,
    LowPower,
    Quality,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DeinterlaceMethod {
    Bob,
    #[default]
    Advanced,
    /// Advanced deinterlacing without reference frames. Produces one output frame per field.
    AdvancedNoRef,
    /// Advanced deinterlacing with scene change detection.
    AdvancedScd,
    FieldWeaving,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrcAlgorithm {
    #[default]
    PreserveTimestamp,
    DistributedTimestamp,
    FrameInterpolation,
    FiPreserveTimestamp,
    FiDistributedTimestamp,
}

impl FrcAlgorithm {
    /// Whether the hardware can be configured with this algorithm. The interpolating algorithms
    /// are not.
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            FrcAlgorithm::PreserveTimestamp | FrcAlgorithm::DistributedTimestamp
        )
    }
}

/// One post-processing operation along with its parameters.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FilterOp {
    Deinterlacing(DeinterlaceMethod),
    ProcAmp(ProcAmp),
    /// Denoise factor, 0 to 100.
    Denoise(u16),
    /// Detail enhancement factor, 0 to 100.
    Detail(u16),
    Rotation(Rotation),
    Mirroring(Mirroring),
    ScalingMode(ScalingMode),
    FrameRateConversion(FrcAlgorithm),
}

impl FilterOp {
    /// The operation of kind `kind` with default parameters.
    pub fn with_defaults(kind: FilterKind) -> Self {
        match kind {
            FilterKind::Deinterlacing => FilterOp::Deinterlacing(Default::default()),
            FilterKind::ProcAmp => FilterOp::ProcAmp(Default::default()),
            FilterKind::Denoise => FilterOp::Denoise(0),
            FilterKind::Detail => FilterOp::Detail(0),
            FilterKind::Rotation => FilterOp::Rotation(Default::default()),
            FilterKind::Mirroring => FilterOp::Mirroring(Default::default()),
            FilterKind::ScalingMode => FilterOp::ScalingMode(Default::default()),
            FilterKind::FrameRateConversion => FilterOp::FrameRateConversion(Default::default()),
        }
    }

    pub fn kind(&self) -> FilterKind {
        match self {
            FilterOp::Deinterlacing(_) => FilterKind::Deinterlacing,
            FilterOp::ProcAmp(_) => FilterKind::ProcAmp,
            FilterOp::Denoise(_) => FilterKind::Denoise,
            FilterOp::Detail(_) => FilterKind::Detail,
            FilterOp::Rotation(_) => FilterKind::Rotation,
            FilterOp::Mirroring(_) => FilterKind::Mirroring,
            FilterOp::ScalingMode(_) => FilterKind::ScalingMode,
            FilterOp::FrameRateConversion(_) => FilterKind::FrameRateConversion,
        }
    }
}

/// The set of operations requested on a post-processing pipeline, keyed by kind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterSet {
    ops: BTreeMap<FilterKind, FilterOp>,
}

impl FilterSet {
    pub fn contains(&self, kind: FilterKind) -> bool {
        self.ops.contains_key(&kind)
    }

    pub fn get(&self, kind: FilterKind) -> Option<&FilterOp> {
        self.ops.get(&kind)
    }

    /// Returns the operation of kind `kind`, adding it with default parameters if it was not part
    /// of the set yet.
    pub fn get_or_insert_default(&mut self, kind: FilterKind) -> &mut FilterOp {
        self.ops
            .entry(kind)
            .or_insert_with(|| FilterOp::with_defaults(kind))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The operations of the set, ordered by kind.
    pub fn to_vec(&self) -> Vec<FilterOp> {
        self.ops.values().copied().collect()
    }
}
