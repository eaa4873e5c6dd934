// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Post-processing (VPP) pipeline.
//!
//! A [`Filter`] runs decoded surfaces through the post-processing unit of a session: scaling,
//! colour conversion, deinterlacing, frame rate conversion and image quality filters. It is either
//! standalone, or attached to the task of a neighbouring stage so that both stages can share
//! surfaces:
//!
//! * as [`TaskType::VPP_IN`] of a decoder task, the filter consumes the decoder output directly.
//! * as [`TaskType::VPP_OUT`] of an encoder task, the filter output is the encoder input.
//!
//! Configuration is only materialized when [`Filter::prepare`] runs, and the hardware unit itself
//! is started lazily by the first [`Filter::process`] call, once the neighbouring stages have had
//! a chance to publish their own requirements.

pub mod ops;

use std::rc::Rc;

use thiserror::Error;

use crate::backend::wait_for_completion;
use crate::backend::Session;
use crate::backend::SessionProvider;
use crate::backend::Status;
use crate::backend::Submission;
use crate::filter::ops::DeinterlaceMethod;
use crate::filter::ops::FilterKind;
use crate::filter::ops::FilterOp;
use crate::filter::ops::FilterSet;
use crate::filter::ops::FrcAlgorithm;
use crate::filter::ops::Mirroring;
use crate::filter::ops::Rotation;
use crate::filter::ops::ScalingMode;
use crate::params::AllocResponse;
use crate::params::FrameInfo;
use crate::params::IoPattern;
use crate::params::MemType;
use crate::params::VideoParams;
use crate::retry::Attempt;
use crate::retry::Clock;
use crate::retry::RetryPolicy;
use crate::retry::SystemClock;
use crate::surface_pool::PooledSurface;
use crate::surface_pool::SurfacePool;
use crate::task::SharedAggregator;
use crate::task::SharedSession;
use crate::task::Task;
use crate::task::TaskError;
use crate::task::TaskType;
use crate::Fourcc;
use crate::PicStruct;
use crate::VideoInfo;

/// Largest output dimension supported by the post-processing unit.
const MAX_DIMENSION: u16 = 8192;
/// Largest number of operations the post-processing unit can have in flight.
const MAX_ASYNC_DEPTH: u16 = 20;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("{0} out of range")]
    OutOfRange(&'static str),
    #[error("{0:?} filter not supported on this platform")]
    Unsupported(FilterKind),
    #[error("unsupported output format {0}")]
    UnsupportedFormat(Fourcc),
    #[error("no output surface available")]
    AllocationFailed,
    #[error("failed to allocate output frames: {0}")]
    Allocation(#[from] TaskError),
    #[error("VPP operation failed with status {0:?}")]
    OperationFailed(Status),
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// Non-error outcome of [`Filter::process`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterStatus {
    /// The output surface is ready.
    Success,
    /// The output surface is ready and another one will be produced from the same input: call
    /// `process` again with the same input surface.
    MoreSurface,
    /// The unit needs more input before producing an output.
    MoreData,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FilterState {
    /// Parameters may still change. The hardware unit is not initialized.
    Configured,
    /// The hardware unit is initialized and processing.
    Started,
}

pub struct Filter<P: SessionProvider> {
    aggregator: SharedAggregator<P>,
    session: SharedSession<P::Session>,
    /// Task of the stage feeding this filter, if the input surfaces are shared with it.
    vpp_in: Option<Task>,
    /// Task the output surfaces belong to. Shared with the consuming stage if it is not a pure
    /// `VPP_OUT` task.
    vpp_out: Task,

    out_pool: Option<SurfacePool>,
    /// Device frames backing `out_pool`, if it uses video memory.
    response: Option<AllocResponse>,
    state: FilterState,
    prepared: bool,

    params: VideoParams,
    /// Layout of the input frames.
    frame_info: FrameInfo,
    fourcc: Option<Fourcc>,
    size: Option<(u16, u16)>,
    framerate: Option<(u32, u32)>,
    ops: FilterSet,

    clock: Rc<dyn Clock>,
    busy_retry: RetryPolicy,
    sync_retry: RetryPolicy,
}

impl<P: SessionProvider> Filter<P> {
    /// Creates a standalone filter running on its own session.
    pub fn new(
        aggregator: &SharedAggregator<P>,
        is_system_in: bool,
        is_system_out: bool,
    ) -> Result<Self> {
        let (vpp_out, session) = aggregator.borrow_mut().create_task(TaskType::VPP_OUT)?;

        Ok(Self::create(
            aggregator,
            session,
            None,
            vpp_out,
            is_system_in,
            is_system_out,
        ))
    }

    /// Creates a filter attached to `task`, running on its session `session`. `role` tells
    /// whether the filter consumes the surfaces of `task` ([`TaskType::VPP_IN`]) or produces
    /// them ([`TaskType::VPP_OUT`]).
    pub fn with_task(
        aggregator: &SharedAggregator<P>,
        session: SharedSession<P::Session>,
        task: &Task,
        role: TaskType,
        is_system_in: bool,
        is_system_out: bool,
    ) -> Self {
        task.set_task_type(task.task_type() | role);

        let (vpp_in, vpp_out) = if role.contains(TaskType::VPP_OUT) {
            (None, task.clone())
        } else {
            let vpp_out = aggregator
                .borrow_mut()
                .task_with_session(TaskType::VPP_OUT);
            (Some(task.clone()), vpp_out)
        };

        Self::create(
            aggregator,
            session,
            vpp_in,
            vpp_out,
            is_system_in,
            is_system_out,
        )
    }

    fn create(
        aggregator: &SharedAggregator<P>,
        session: SharedSession<P::Session>,
        vpp_in: Option<Task>,
        vpp_out: Task,
        is_system_in: bool,
        is_system_out: bool,
    ) -> Self {
        let mut io_pattern = IoPattern::empty();
        io_pattern |= if is_system_in {
            IoPattern::IN_SYSTEM_MEMORY
        } else {
            IoPattern::IN_VIDEO_MEMORY
        };
        io_pattern |= if is_system_out {
            IoPattern::OUT_SYSTEM_MEMORY
        } else {
            IoPattern::OUT_VIDEO_MEMORY
        };

        Self {
            aggregator: Rc::clone(aggregator),
            session,
            vpp_in,
            vpp_out,
            out_pool: None,
            response: None,
            state: FilterState::Configured,
            prepared: false,
            params: VideoParams {
                io_pattern,
                ..Default::default()
            },
            frame_info: Default::default(),
            fourcc: None,
            size: None,
            framerate: None,
            ops: Default::default(),
            clock: Rc::new(SystemClock::default()),
            busy_retry: RetryPolicy::VPP_BUSY,
            sync_retry: RetryPolicy::SYNC,
        }
    }

    /// Uses `clock` and the given policies for the waits on the hardware.
    pub fn set_retry(&mut self, clock: Rc<dyn Clock>, busy: RetryPolicy, sync: RetryPolicy) {
        self.clock = clock;
        self.busy_retry = busy;
        self.sync_retry = sync;
    }

    /// The task the output surfaces belong to.
    pub fn output_task(&self) -> &Task {
        &self.vpp_out
    }

    /// The parameters the unit is (or will be) initialized with.
    pub fn params(&self) -> &VideoParams {
        &self.params
    }

    pub fn filters(&self) -> &FilterSet {
        &self.ops
    }

    pub fn is_started(&self) -> bool {
        self.state == FilterState::Started
    }

    /// Sets the layout of the input frames.
    pub fn set_frame_info(&mut self, info: &FrameInfo) {
        self.frame_info = *info;
    }

    pub fn set_frame_info_from_video_info(&mut self, info: &VideoInfo) {
        self.frame_info = FrameInfo::from_video_info(info);
    }

    /// Requests output frames of pixel layout `fourcc`.
    pub fn set_format(&mut self, fourcc: Fourcc) -> Result<()> {
        match fourcc {
            Fourcc::NV12 | Fourcc::RGB4 | Fourcc::YUY2 | Fourcc::A2RGB10 | Fourcc::P010 => {
                self.fourcc = Some(fourcc);
                Ok(())
            }
            _ => Err(FilterError::UnsupportedFormat(fourcc)),
        }
    }

    /// Requests output frames of `width` x `height` pixels.
    pub fn set_size(&mut self, width: u16, height: u16) -> Result<()> {
        let valid = 1..=MAX_DIMENSION;
        if !valid.contains(&width) || !valid.contains(&height) {
            return Err(FilterError::OutOfRange("size"));
        }

        self.size = Some((width, height));
        Ok(())
    }

    /// Requests an output frame rate of `fps_n / fps_d`. Only effective along with frame rate
    /// conversion.
    pub fn set_framerate(&mut self, fps_n: u32, fps_d: u32) -> Result<()> {
        if fps_n == 0 || fps_d == 0 {
            return Err(FilterError::OutOfRange("frame rate"));
        }

        self.framerate = Some((fps_n, fps_d));
        Ok(())
    }

    pub fn set_async_depth(&mut self, async_depth: u16) -> Result<()> {
        if async_depth > MAX_ASYNC_DEPTH {
            return Err(FilterError::OutOfRange("async depth"));
        }

        self.params.async_depth = async_depth;
        Ok(())
    }

    /// Sets the memory types of the unit and publishes them on the output task right away.
    pub fn set_iopattern_commit_to_task(&mut self, io_pattern: IoPattern) {
        self.params.io_pattern = io_pattern;
        self.vpp_out.set_video_params(&self.params);
    }

    /// Returns the operation of kind `kind`, enabling it if the hardware supports it.
    fn op_mut(&mut self, kind: FilterKind) -> Result<&mut FilterOp> {
        if !self.ops.contains(kind) {
            let status = self.session.borrow_mut().vpp_query_filter(kind);
            if status != Status::None {
                log::warn!("{:?} filter not supported for this platform", kind);
                return Err(FilterError::Unsupported(kind));
            }
        }

        Ok(self.ops.get_or_insert_default(kind))
    }

    fn check_range(value: f32, min: f32, max: f32, what: &'static str) -> Result<()> {
        if value < min || value > max {
            return Err(FilterError::OutOfRange(what));
        }
        Ok(())
    }

    pub fn set_saturation(&mut self, value: f32) -> Result<()> {
        Self::check_range(value, 0.0, 10.0, "saturation")?;
        if let FilterOp::ProcAmp(p) = self.op_mut(FilterKind::ProcAmp)? {
            p.saturation = value;
        }
        Ok(())
    }

    pub fn set_brightness(&mut self, value: f32) -> Result<()> {
        Self::check_range(value, -100.0, 100.0, "brightness")?;
        if let FilterOp::ProcAmp(p) = self.op_mut(FilterKind::ProcAmp)? {
            p.brightness = value;
        }
        Ok(())
    }

    pub fn set_contrast(&mut self, value: f32) -> Result<()> {
        Self::check_range(value, 0.0, 10.0, "contrast")?;
        if let FilterOp::ProcAmp(p) = self.op_mut(FilterKind::ProcAmp)? {
            p.contrast = value;
        }
        Ok(())
    }

    pub fn set_hue(&mut self, value: f32) -> Result<()> {
        Self::check_range(value, -180.0, 180.0, "hue")?;
        if let FilterOp::ProcAmp(p) = self.op_mut(FilterKind::ProcAmp)? {
            p.hue = value;
        }
        Ok(())
    }

    pub fn set_denoising_level(&mut self, level: u16) -> Result<()> {
        if level > 100 {
            return Err(FilterError::OutOfRange("denoising level"));
        }
        if let FilterOp::Denoise(factor) = self.op_mut(FilterKind::Denoise)? {
            *factor = level;
        }
        Ok(())
    }

    pub fn set_detail_level(&mut self, level: u16) -> Result<()> {
        if level > 100 {
            return Err(FilterError::OutOfRange("detail level"));
        }
        if let FilterOp::Detail(factor) = self.op_mut(FilterKind::Detail)? {
            *factor = level;
        }
        Ok(())
    }

    pub fn set_rotation(&mut self, rotation: Rotation) -> Result<()> {
        if let FilterOp::Rotation(r) = self.op_mut(FilterKind::Rotation)? {
            *r = rotation;
        }
        Ok(())
    }

    pub fn set_mirroring(&mut self, mirroring: Mirroring) -> Result<()> {
        if let FilterOp::Mirroring(m) = self.op_mut(FilterKind::Mirroring)? {
            *m = mirroring;
        }
        Ok(())
    }

    pub fn set_scaling_mode(&mut self, mode: ScalingMode) -> Result<()> {
        if let FilterOp::ScalingMode(m) = self.op_mut(FilterKind::ScalingMode)? {
            *m = mode;
        }
        Ok(())
    }

    pub fn set_deinterlace_method(&mut self, method: DeinterlaceMethod) -> Result<()> {
        if let FilterOp::Deinterlacing(m) = self.op_mut(FilterKind::Deinterlacing)? {
            *m = method;
        }
        Ok(())
    }

    pub fn set_frc_algorithm(&mut self, algorithm: FrcAlgorithm) -> Result<()> {
        if !algorithm.is_supported() {
            return Err(FilterError::OutOfRange("frame rate conversion algorithm"));
        }
        if let FilterOp::FrameRateConversion(a) = self.op_mut(FilterKind::FrameRateConversion)? {
            *a = algorithm;
        }
        Ok(())
    }

    fn configure_filters(&mut self) {
        self.params.filters = self.ops.to_vec();
    }

    /// Computes the input and output layouts from the requested configuration.
    fn init_params(&mut self) {
        let mut input = self.frame_info;
        let mut output = self.frame_info;

        // The consuming stage has its own alignment requirements.
        if self.vpp_out.task_type() != TaskType::VPP_OUT {
            output.width = crate::align_up(self.frame_info.crop.width, 32);
            output.height = crate::align_up(self.frame_info.crop.height, 32);
        }

        if let Some((width, height)) = self.size {
            output.crop.width = width;
            output.width = crate::align_up(width, 32);
            output.crop.height = height;
            output.height = crate::align_up(height, 32);
        }

        if self.ops.contains(FilterKind::FrameRateConversion) {
            if let Some((fps_n, fps_d)) = self.framerate {
                output.frame_rate_n = fps_n;
                output.frame_rate_d = fps_d;
            }
        }

        if self.ops.contains(FilterKind::Deinterlacing) {
            // Each field of ~60 fps interlaced content becomes a frame.
            if self.frame_info.pic_struct.is_interlaced()
                && input.rounded_frame_rate() == Some(60)
            {
                input.frame_rate_n /= 2;
            }
            output.pic_struct = PicStruct::Progressive;
        }

        self.params.vpp.input = input;
        self.params.vpp.output = output;

        if let Some(fourcc) = self.fourcc {
            let output = &mut self.params.vpp.output;
            output.fourcc = fourcc;
            output.bit_depth_luma = fourcc.bit_depth();
            output.bit_depth_chroma = fourcc.bit_depth();
            output.shift = 0;

            if fourcc == Fourcc::P010 {
                self.params.vpp.output.shift = 1;
                let status = self.session.borrow_mut().vpp_query(&self.params);
                if status != Status::None {
                    log::debug!("shifted P010 output not supported ({:?})", status);
                    self.params.vpp.output.shift = 0;
                }
            }
        }

        self.configure_filters();
    }

    /// Materializes the configuration and publishes the surface requirements of the unit on
    /// the input and output tasks.
    pub fn prepare(&mut self) -> Result<()> {
        // Memory types may have been changed by a peer stage.
        self.vpp_out.update_video_params(&mut self.params);
        self.init_params();

        let (status, requests) = self.session.borrow_mut().vpp_query_io_surf(&self.params);
        if status.is_error() {
            log::error!(
                "unable to query VPP allocation request: {:?} ({})",
                status,
                status.code()
            );
            return Err(FilterError::OperationFailed(status));
        } else if status.is_warning() {
            self.params.io_pattern = IoPattern::IN_SYSTEM_MEMORY | IoPattern::OUT_SYSTEM_MEMORY;
        }

        if let Some(vpp_in) = &self.vpp_in {
            vpp_in.merge_request(&requests[0], MemType::FROM_VPPIN);
        }

        if self.vpp_out.task_type() == TaskType::VPP_OUT {
            self.vpp_out.set_request(&requests[1]);
        } else {
            self.vpp_out
                .merge_request(&requests[1], MemType::FROM_VPPOUT);
        }

        self.vpp_out.set_video_params(&self.params);
        self.prepared = true;

        Ok(())
    }

    /// Rebuilds the list of operations, and reconfigures the hardware unit if it is running.
    pub fn reset(&mut self) -> Result<()> {
        self.configure_filters();

        if self.state != FilterState::Started {
            return Ok(());
        }

        let status = self.session.borrow_mut().vpp_reset(&self.params);
        if status.is_error() {
            log::error!("error resetting VPP: {:?} ({})", status, status.code());
            return Err(FilterError::OperationFailed(status));
        }

        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.prepared {
            self.prepare()?;
        }

        // Memory types may have been changed by a peer stage.
        self.vpp_out.update_video_params(&mut self.params);

        let memtype_is_system = !self.params.io_pattern.contains(IoPattern::OUT_VIDEO_MEMORY);
        if !memtype_is_system {
            self.vpp_out.use_video_memory();

            let mut aggregator = self.aggregator.borrow_mut();
            aggregator.set_current_task(&self.vpp_out);
            self.response = Some(aggregator.frame_alloc(&self.vpp_out.request())?);
        } else {
            self.vpp_out.ensure_memtype_is_system();
        }

        self.out_pool = Some(SurfacePool::with_task(
            &self.vpp_out,
            self.params.vpp.output,
            self.response.as_ref(),
        ));

        let status = self.session.borrow_mut().vpp_init(&self.params);
        if status.is_error() {
            log::error!("error initializing VPP: {:?} ({})", status, status.code());
            return Err(FilterError::OperationFailed(status));
        }

        log::info!(
            "initialized VPP output task using {} memory",
            if memtype_is_system { "system" } else { "video" }
        );

        self.state = FilterState::Started;
        Ok(())
    }

    /// Runs `surface` through the post-processing unit.
    ///
    /// On [`FilterStatus::Success`] and [`FilterStatus::MoreSurface`] the processed surface is
    /// returned along with the status.
    pub fn process(
        &mut self,
        surface: &PooledSurface,
    ) -> Result<(FilterStatus, Option<PooledSurface>)> {
        // Delayed so that a consuming stage can share our output pool.
        if self.state == FilterState::Configured {
            self.start()?;
        }

        let pool = self
            .out_pool
            .clone()
            .ok_or(FilterError::AllocationFailed)?;
        let session = Rc::clone(&self.session);

        let res = self.busy_retry.run(self.clock.as_ref(), |_| {
            let Some(output) = pool.lease() else {
                return Attempt::Done(None);
            };

            let mut submission = session.borrow_mut().vpp_run_frame_async(surface, &output);
            log::debug!("VPP submission status: {:?}", submission.status);

            match submission.status {
                Status::DeviceBusy => Attempt::Busy,
                Status::IncompatibleVideoParamWarning => {
                    submission.status = Status::None;
                    Attempt::Done(Some((submission, output)))
                }
                _ => Attempt::Done(Some((submission, output))),
            }
        });

        let (submission, output): (Submission, PooledSurface) = match res {
            Ok(Some(res)) => res,
            Ok(None) => return Err(FilterError::AllocationFailed),
            Err(e) => {
                log::error!("VPP still busy: {}", e);
                return Err(FilterError::OperationFailed(Status::DeviceBusy));
            }
        };

        // The current frame is ready, and another one will follow from the same input.
        let more_surface = match submission.status {
            Status::None => false,
            Status::MoreSurface => true,
            Status::MoreData => return Ok((FilterStatus::MoreData, None)),
            status => {
                log::error!(
                    "VPP submission error status: {:?} ({})",
                    status,
                    status.code()
                );
                return Err(FilterError::OperationFailed(status));
            }
        };

        let mut output = output;
        if let Some(sync_point) = submission.sync_point {
            // An encoder consuming our output waits on its own.
            if !self.vpp_out.has_type(TaskType::ENCODER) {
                wait_for_completion(
                    &*self.session,
                    sync_point,
                    self.clock.as_ref(),
                    &self.sync_retry,
                )
                .map_err(FilterError::OperationFailed)?;
            }

            if let Some(id) = submission.output {
                output = pool.find_surface(id).ok_or(FilterError::AllocationFailed)?;
            }
        }

        let status = if more_surface {
            FilterStatus::MoreSurface
        } else {
            FilterStatus::Success
        };

        Ok((status, Some(output)))
    }
}

impl<P: SessionProvider> Drop for Filter<P> {
    fn drop(&mut self) {
        if self.state == FilterState::Started {
            self.session.borrow_mut().vpp_close();
        }

        self.out_pool = None;

        if let Some(response) = self.response.take() {
            let mut aggregator = self.aggregator.borrow_mut();
            // Frames must be freed on behalf of the task they were allocated for.
            aggregator.set_current_task(&self.vpp_out);
            if let Err(e) = aggregator.frame_free(&response) {
                log::error!("failed to free VPP output frames: {}", e);
            }
        }
    }
}
