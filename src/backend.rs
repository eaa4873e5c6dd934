// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the hardware.
//!
//! A [`SessionProvider`] hands out [`Session`]s, i.e. device contexts that expose a decode unit,
//! a post-processing (VPP) unit and a way to wait on the asynchronous operations they run. The
//! provider is also responsible for the device memory backing video-memory surfaces.
//!
//! All session methods report the raw hardware [`Status`]; interpreting it (retrying on busy,
//! looping on "more surface", ...) is left to the [`crate::decoder`] and [`crate::filter`]
//! modules.

pub mod dummy;

use std::cell::RefCell;
use std::time::Duration;

use enumn::N;

use crate::bitstream::Bitstream;
use crate::filter::ops::FilterKind;
use crate::params::AllocRequest;
use crate::params::AllocResponse;
use crate::params::VideoParams;
use crate::retry::Attempt;
use crate::retry::Clock;
use crate::retry::RetryPolicy;
use crate::retry::SYNC_TIMEOUT;
use crate::surface_pool::PooledSurface;
use crate::surface_pool::SurfaceId;
use crate::task::TaskId;

/// Status code returned by the hardware. Negative values are errors, positive values warnings.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    #[default]
    None = 0,
    Unknown = -1,
    NullPtr = -2,
    Unsupported = -3,
    MemoryAlloc = -4,
    NotEnoughBuffer = -5,
    InvalidHandle = -6,
    LockMemory = -7,
    NotInitialized = -8,
    NotFound = -9,
    MoreData = -10,
    MoreSurface = -11,
    Aborted = -12,
    DeviceLost = -13,
    IncompatibleVideoParam = -14,
    InvalidVideoParam = -15,
    UndefinedBehavior = -16,
    DeviceFailed = -17,
    MoreBitstream = -18,
    GpuHang = -21,
    ReallocSurface = -22,
    InExecution = 1,
    DeviceBusy = 2,
    VideoParamChanged = 3,
    PartialAcceleration = 4,
    IncompatibleVideoParamWarning = 5,
    ValueNotChanged = 6,
    OutOfRange = 7,
    FilterSkipped = 10,
}

impl Status {
    /// Converts a raw code, mapping codes this crate does not know about to
    /// [`Status::Unknown`].
    pub fn from_raw(code: i32) -> Self {
        Status::n(code).unwrap_or(Status::Unknown)
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn is_error(&self) -> bool {
        self.code() < 0
    }

    pub fn is_warning(&self) -> bool {
        self.code() > 0
    }
}

/// Token returned by an asynchronous submission, used to wait for its completion.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncPoint(pub u64);

/// Outcome of one asynchronous submission to a hardware unit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Submission {
    pub status: Status,
    /// Surface the result will be written to, if the submission produced one.
    pub output: Option<SurfaceId>,
    /// Completion token of the produced result.
    pub sync_point: Option<SyncPoint>,
}

impl Submission {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn completed(status: Status, output: SurfaceId, sync_point: SyncPoint) -> Self {
        Self {
            status,
            output: Some(output),
            sync_point: Some(sync_point),
        }
    }
}

/// Codec plugins that must be loaded into a session before some codecs can be decoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PluginId {
    HevcDecodeHw,
    HevcDecodeSw,
    Vp8DecodeHw,
    Vp9DecodeHw,
}

/// Hardware generation of the device. Only the ordering matters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Platform {
    #[default]
    Unknown = 0,
    Sandybridge = 1,
    Ivybridge = 2,
    Haswell = 3,
    Baytrail = 4,
    Broadwell = 5,
    Cherrytrail = 6,
    Skylake = 7,
    Apollolake = 8,
    Kabylake = 9,
}

/// A hardware context with one decode unit and one post-processing unit.
pub trait Session {
    fn load_plugin(&mut self, plugin: PluginId) -> Status;
    fn unload_plugin(&mut self, plugin: PluginId) -> Status;

    /// Queries how many surfaces the decode unit needs for `params`.
    fn decode_query_io_surf(&mut self, params: &VideoParams) -> (Status, AllocRequest);
    /// Parses an in-band sequence header from `bs` into `params`. When `sequence_header` is
    /// provided, the raw header bytes are copied into it.
    fn decode_header(
        &mut self,
        bs: &Bitstream,
        params: &mut VideoParams,
        sequence_header: Option<&mut Vec<u8>>,
    ) -> Status;
    fn decode_init(&mut self, params: &VideoParams) -> Status;
    fn decode_reset(&mut self, params: &VideoParams) -> Status;
    fn decode_close(&mut self) -> Status;
    /// Submits the unconsumed bytes of `bs` for decoding into `work`. The hardware advances the
    /// bitstream past the bytes it consumed. `bs` is `None` when draining.
    fn decode_frame_async(
        &mut self,
        bs: Option<&mut Bitstream>,
        work: &PooledSurface,
    ) -> Submission;

    /// Validates `params` against the capabilities of the post-processing unit.
    fn vpp_query(&mut self, params: &VideoParams) -> Status;
    /// Probes whether the post-processing unit supports `kind`.
    fn vpp_query_filter(&mut self, kind: FilterKind) -> Status;
    /// Queries how many input and output surfaces the post-processing unit needs.
    fn vpp_query_io_surf(&mut self, params: &VideoParams) -> (Status, [AllocRequest; 2]);
    fn vpp_init(&mut self, params: &VideoParams) -> Status;
    fn vpp_reset(&mut self, params: &VideoParams) -> Status;
    fn vpp_close(&mut self) -> Status;
    fn vpp_run_frame_async(&mut self, input: &PooledSurface, output: &PooledSurface)
        -> Submission;

    /// Waits at most `timeout` for the operation identified by `sync_point` to complete.
    fn sync_operation(&mut self, sync_point: SyncPoint, timeout: Duration) -> Status;
}

/// Waits for the operation identified by `sync_point` to complete, calling the hardware wait
/// again for as long as it reports the operation as still executing.
///
/// Returns the error status reported by the hardware, or [`Status::InExecution`] if `policy`
/// gave up first.
pub(crate) fn wait_for_completion<S: Session + ?Sized>(
    session: &RefCell<S>,
    sync_point: SyncPoint,
    clock: &dyn Clock,
    policy: &RetryPolicy,
) -> Result<(), Status> {
    let res = policy.run(clock, |_| {
        let status = session.borrow_mut().sync_operation(sync_point, SYNC_TIMEOUT);
        match status {
            Status::InExecution => Attempt::Again,
            s if s.is_error() => Attempt::Done(Err(s)),
            _ => Attempt::Done(Ok(())),
        }
    });

    match res {
        Ok(res) => res,
        Err(e) => {
            log::error!("operation {:?} did not complete: {}", sync_point, e);
            Err(Status::InExecution)
        }
    }
}

/// Hands out sessions and manages the device memory of video-memory surfaces.
pub trait SessionProvider {
    type Session: Session;

    fn create_session(&mut self) -> anyhow::Result<Self::Session>;
    fn platform(&self) -> Platform;
    /// Allocates device frames for `task` according to `request`.
    fn alloc_frames(
        &mut self,
        task: TaskId,
        request: &AllocRequest,
    ) -> anyhow::Result<AllocResponse>;
    fn free_frames(&mut self, response: &AllocResponse);
}
