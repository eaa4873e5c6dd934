// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder proper.
//!
//! A [`Decoder`] accumulates the compressed payload of the frames it is given, submits it to the
//! decode unit of its session and pairs every surface the hardware produces with the caller frame
//! it belongs to. Surfaces go through a post-processing [`Filter`] first when the caller asked for
//! another pixel format than the one the hardware decodes to, or when the stream is interlaced.
//!
//! Caller frames wait in a pending queue sorted by presentation timestamp until a surface is
//! available for them, then move to the decoded queue. Frames that will never get a surface end
//! up in the discarded queue instead, so that every frame given to [`Decoder::decode`] is
//! eventually returned by either [`Decoder::pop_decoded`] or [`Decoder::pop_discarded`].

use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::anyhow;
use bytes::Bytes;

use crate::backend::wait_for_completion;
use crate::backend::Platform;
use crate::backend::PluginId;
use crate::backend::Session;
use crate::backend::SessionProvider;
use crate::backend::Status;
use crate::backend::Submission;
use crate::bitstream::Bitstream;
use crate::decoder::queue::FrameFifo;
use crate::decoder::queue::PendingQueue;
use crate::decoder::timing::Timing;
use crate::decoder::CodecFrame;
use crate::decoder::DecodeError;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderStatus;
use crate::decoder::Result;
use crate::filter::ops::DeinterlaceMethod;
use crate::filter::Filter;
use crate::filter::FilterStatus;
use crate::params::AllocRequest;
use crate::params::AllocResponse;
use crate::params::Codec;
use crate::params::IoPattern;
use crate::params::MemType;
use crate::params::Profile;
use crate::params::VideoParams;
use crate::retry::Attempt;
use crate::retry::Clock;
use crate::retry::RetryPolicy;
use crate::retry::SystemClock;
use crate::surface_pool::Corruption;
use crate::surface_pool::PooledSurface;
use crate::surface_pool::SurfacePool;
use crate::task::SharedAggregator;
use crate::task::SharedSession;
use crate::task::Task;
use crate::task::TaskType;
use crate::Fourcc;
use crate::Rect;
use crate::VideoInfo;

/// Number of operations in flight when the decoder was picked automatically.
const AUTOPLUGGED_ASYNC_DEPTH: u16 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DecodingState {
    /// The session is not initialized yet. It will be by the next call to `decode`.
    Configured,
    /// The session is initialized and decoding.
    Decoding,
    /// The decoder has been closed and cannot be used anymore.
    Closed,
}

pub struct Decoder<P: SessionProvider> {
    aggregator: SharedAggregator<P>,
    decode: Task,
    session: SharedSession<P::Session>,
    profile: Profile,
    info: VideoInfo,
    config: DecoderConfig,

    params: VideoParams,
    request: AllocRequest,
    /// Plugin loaded into the session for this codec.
    plugin: Option<PluginId>,
    pool: Option<SurfacePool>,
    /// Device frames backing `pool`, if it uses video memory.
    response: Option<AllocResponse>,
    filter: Option<Filter<P>>,
    filter_inited: bool,

    bitstream: Bitstream,
    /// Sequence header captured when probing the stream, re-injected after a reset if the next
    /// sync point does not carry one.
    codec_data: Vec<u8>,

    pending: PendingQueue,
    decoded: FrameFifo,
    discarded: FrameFifo,
    timing: Timing,

    state: DecodingState,
    /// Input is skipped until the next sync point.
    was_reset: bool,
    /// A frame has been output since the last reset.
    has_ready_frames: bool,
    memtype_is_system: bool,
    enable_csc: bool,
    enable_deinterlace: bool,
    /// Output one frame per field of the interlaced input.
    can_double_deinterlace: bool,
    /// Number of submissions that needed more data after frames had been output, each of which
    /// may have left a frame without an output.
    num_partial_frames: usize,
    /// Numbers of the input frames whose fields are output by double rate deinterlacing, in
    /// submission order. Synthesized frames carry the number of their input.
    field_sources: VecDeque<u32>,
    field_source: u32,

    clock: Rc<dyn Clock>,
}

impl<P: SessionProvider> Decoder<P> {
    /// Creates a decoder for streams of `profile`, outputting frames as described by `info`.
    pub fn new(
        aggregator: &SharedAggregator<P>,
        profile: Profile,
        info: &VideoInfo,
        config: DecoderConfig,
    ) -> Result<Self> {
        let mut info = info.clone();
        if info.fps_n == 0 {
            info.fps_n = 30;
        }
        if info.fps_d == 0 {
            info.fps_d = 1;
        }

        let mut params = VideoParams {
            codec: Some(profile.codec),
            async_depth: if config.autoplugged {
                AUTOPLUGGED_ASYNC_DEPTH
            } else {
                config.async_depth
            },
            io_pattern: IoPattern::OUT_VIDEO_MEMORY,
            ..Default::default()
        };

        let mut bitstream = Bitstream::new();
        if config.live_mode {
            params.async_depth = 1;
            bitstream.set_complete_frame(true);
            if profile.codec == Codec::Avc {
                params.decoded_order = true;
            }
        }

        let (decode, session) = aggregator.borrow_mut().create_task(TaskType::DECODER)?;

        let mut decoder = Self {
            aggregator: Rc::clone(aggregator),
            decode,
            session,
            profile,
            timing: Timing::new(info.fps_n, info.fps_d),
            info,
            config,
            params,
            request: Default::default(),
            plugin: None,
            pool: None,
            response: None,
            filter: None,
            filter_inited: false,
            bitstream,
            codec_data: Vec::new(),
            pending: Default::default(),
            decoded: Default::default(),
            discarded: Default::default(),
            state: DecodingState::Configured,
            was_reset: false,
            has_ready_frames: false,
            memtype_is_system: false,
            enable_csc: false,
            enable_deinterlace: false,
            can_double_deinterlace: false,
            num_partial_frames: 0,
            field_sources: VecDeque::new(),
            field_source: 0,
            clock: Rc::new(SystemClock::default()),
        };

        decoder.set_video_properties();
        decoder.configure_plugins()?;
        decoder.init_task()?;

        Ok(decoder)
    }

    fn set_video_properties(&mut self) {
        let info = &self.info;
        let interlaced = info.pic_struct.is_interlaced();
        let frame_info = &mut self.params.frame_info;

        frame_info.pic_struct = info.pic_struct;
        frame_info.crop = Rect {
            x: 0,
            y: 0,
            width: info.width,
            height: info.height,
        };
        frame_info.frame_rate_n = info.fps_n;
        frame_info.frame_rate_d = info.fps_d;
        frame_info.aspect_ratio_w = info.par_n;
        frame_info.aspect_ratio_h = info.par_d;

        frame_info.width = crate::align_up(info.width, 16);
        frame_info.height = if self.profile.codec == Codec::Hevc || interlaced {
            crate::align_up(info.height, 32)
        } else {
            crate::align_up(info.height, 16)
        };

        if self.profile.is_hevc_main10() {
            frame_info.fourcc = Fourcc::P010;
            frame_info.bit_depth_luma = 10;
            frame_info.bit_depth_chroma = 10;
            frame_info.shift = 1;
        } else {
            frame_info.fourcc = Fourcc::NV12;
            frame_info.bit_depth_luma = 8;
            frame_info.bit_depth_chroma = 8;
            frame_info.shift = 0;
        }

        self.params.codec_profile = self.profile.profile;
        // The level of an unknown stream cannot be trusted.
        if !self.config.autoplugged {
            self.params.codec_level = self.profile.level;
        }
    }

    /// Loads the plugin needed to decode the codec, if any.
    fn configure_plugins(&mut self) -> Result<()> {
        let candidates: &[PluginId] = match self.profile.codec {
            Codec::Hevc => &[PluginId::HevcDecodeHw, PluginId::HevcDecodeSw],
            Codec::Vp8 => &[PluginId::Vp8DecodeHw],
            Codec::Vp9 => &[PluginId::Vp9DecodeHw],
            _ => return Ok(()),
        };

        let platform = self.aggregator.borrow().platform();
        let main10 = self.profile.is_hevc_main10();
        let mut status = Status::NotFound;

        for &plugin in candidates {
            if plugin == PluginId::HevcDecodeHw && main10 && platform < Platform::Broadwell {
                log::debug!("skipping HEVC hardware plugin for Main10 on {:?}", platform);
                continue;
            }

            status = self.session.borrow_mut().load_plugin(plugin);
            if status != Status::None {
                log::debug!("failed to load plugin {:?}: {:?}", plugin, status);
                continue;
            }

            if plugin == PluginId::HevcDecodeSw {
                self.params.io_pattern = IoPattern::OUT_SYSTEM_MEMORY;
                if main10 {
                    self.params.frame_info.shift = 0;
                }
            }

            self.plugin = Some(plugin);
            return Ok(());
        }

        log::error!(
            "unable to load decoder plugin: {:?} ({})",
            status,
            status.code()
        );
        Err(DecodeError::InitFailed(anyhow!(
            "no plugin could be loaded for {:?}",
            self.profile.codec
        )))
    }

    /// Queries the surface requirements of the decode unit and publishes them on the task.
    fn init_task(&mut self) -> Result<()> {
        let (status, mut request) = self
            .session
            .borrow_mut()
            .decode_query_io_surf(&self.params);
        if status.is_error() {
            log::error!(
                "unable to query decode allocation request: {:?} ({})",
                status,
                status.code()
            );
            return Err(DecodeError::InitFailed(anyhow!(
                "allocation request query failed with status {:?}",
                status
            )));
        } else if status == Status::PartialAcceleration {
            self.params.io_pattern = IoPattern::OUT_SYSTEM_MEMORY;
        }

        self.memtype_is_system = self
            .params
            .io_pattern
            .contains(IoPattern::OUT_SYSTEM_MEMORY);
        request.mem_type = if self.memtype_is_system {
            MemType::SYSTEM_MEMORY
        } else {
            MemType::VIDEO_MEMORY_DECODER_TARGET
        };

        if self.memtype_is_system {
            self.decode.ensure_memtype_is_system();
        }

        self.request = request;
        self.decode.set_request(&self.request);
        self.decode.set_video_params(&self.params);

        self.enable_csc = self.info.format != self.params.frame_info.fourcc;
        if self.info.pic_struct.is_interlaced() {
            self.enable_deinterlace = true;
            self.can_double_deinterlace = self.info.rounded_frame_rate() == Some(60);
        }

        Ok(())
    }

    /// Uses `clock` for the waits on the hardware. Mostly useful for tests.
    pub fn set_clock(&mut self, clock: Rc<dyn Clock>) {
        if let Some(filter) = &mut self.filter {
            filter.set_retry(
                Rc::clone(&clock),
                RetryPolicy::VPP_BUSY,
                self.config.sync_retry,
            );
        }
        self.clock = clock;
    }

    /// Lets a downstream peer choose where the decoded frames live. A peer that already switched
    /// the task to system memory has the last word.
    pub fn set_output_memory(&mut self, video: bool) {
        let Some(published) = self.decode.video_params() else {
            log::warn!("unable to retrieve task parameters for decoder");
            return;
        };

        if published
            .io_pattern
            .contains(IoPattern::OUT_SYSTEM_MEMORY)
        {
            self.memtype_is_system = true;
            self.decode.ensure_memtype_is_system();
            return;
        }

        if video {
            self.params.io_pattern = IoPattern::OUT_VIDEO_MEMORY;
        } else {
            self.memtype_is_system = true;
            self.params.io_pattern = IoPattern::OUT_SYSTEM_MEMORY;
            self.decode.ensure_memtype_is_system();
        }

        if self.decode.task_type() == TaskType::DECODER {
            self.decode.set_io_pattern(self.params.io_pattern);
        }
    }

    /// Reset the decoder instead of outputting frames with major corruption.
    pub fn skip_corrupted_frames(&mut self) {
        self.config.skip_corrupted_frames = true;
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn video_info(&self) -> &VideoInfo {
        &self.info
    }

    pub fn set_video_info(&mut self, info: &VideoInfo) {
        self.info = info.clone();
    }

    /// The parameters the decode unit is (or will be) initialized with.
    pub fn params(&self) -> &VideoParams {
        &self.params
    }

    /// The decoder task, which downstream stages can attach to.
    pub fn task(&self) -> &Task {
        &self.decode
    }

    pub fn session(&self) -> &SharedSession<P::Session> {
        &self.session
    }

    /// The post-processing stage created by the decoder, if any.
    pub fn filter(&self) -> Option<&Filter<P>> {
        self.filter.as_ref()
    }

    pub fn pop_decoded(&mut self) -> Option<CodecFrame> {
        self.decoded.pop()
    }

    pub fn pop_discarded(&mut self) -> Option<CodecFrame> {
        self.discarded.pop()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn num_decoded(&self) -> usize {
        self.decoded.len()
    }

    pub fn num_discarded(&self) -> usize {
        self.discarded.len()
    }

    fn init_filter(&mut self) -> Result<()> {
        let mut filter = Filter::with_task(
            &self.aggregator,
            Rc::clone(&self.session),
            &self.decode,
            TaskType::VPP_IN,
            self.memtype_is_system,
            self.memtype_is_system,
        );
        filter.set_retry(
            Rc::clone(&self.clock),
            RetryPolicy::VPP_BUSY,
            self.config.sync_retry,
        );

        // The filter accounts for the surfaces in flight on its side.
        self.request.mem_type |= MemType::EXTERNAL_FRAME | MemType::FROM_DECODE;
        self.request.num_frame_suggested =
            (self.request.num_frame_suggested + 1).saturating_sub(self.params.async_depth);
        self.decode.set_request(&self.request);

        filter.set_frame_info(&self.params.frame_info);
        if self.enable_csc {
            if let Err(e) = filter.set_format(self.info.format) {
                log::warn!("keeping decoded format: {}", e);
            }
        }
        if self.enable_deinterlace {
            let method = if self.can_double_deinterlace {
                DeinterlaceMethod::AdvancedNoRef
            } else {
                DeinterlaceMethod::Advanced
            };
            if let Err(e) = filter.set_deinterlace_method(method) {
                log::warn!("unable to deinterlace: {}", e);
                self.can_double_deinterlace = false;
            }
        }
        if let Err(e) = filter.set_async_depth(self.params.async_depth) {
            log::warn!("keeping default VPP async depth: {}", e);
        }

        filter.prepare().map_err(|e| {
            log::error!("unable to set up post-processing filter: {}", e);
            DecodeError::InitFailed(e.into())
        })?;

        self.filter = Some(filter);
        Ok(())
    }

    fn init_decoder(&mut self) -> Result<()> {
        if !self.memtype_is_system {
            let mut aggregator = self.aggregator.borrow_mut();
            aggregator.set_current_task(&self.decode);
            self.response = Some(aggregator.frame_alloc(&self.decode.request())?);
        }

        let status = self.session.borrow_mut().decode_init(&self.params);
        if status.is_error() {
            log::error!(
                "error initializing the decoder: {:?} ({})",
                status,
                status.code()
            );
            self.free_frames();
            return Err(DecodeError::InitFailed(anyhow!(
                "decoder initialization failed with status {:?}",
                status
            )));
        }

        self.pool = Some(SurfacePool::with_task(
            &self.decode,
            self.params.frame_info,
            self.response.as_ref(),
        ));

        Ok(())
    }

    fn free_frames(&mut self) {
        if let Some(response) = self.response.take() {
            let mut aggregator = self.aggregator.borrow_mut();
            // Frames must be freed on behalf of the task they were allocated for.
            aggregator.set_current_task(&self.decode);
            if let Err(e) = aggregator.frame_free(&response) {
                log::error!("failed to free decoder frames: {}", e);
            }
        }
    }

    fn close_decoder(&mut self) {
        self.pool = None;
        self.session.borrow_mut().decode_close();
        self.free_frames();
    }

    /// Probes the accumulated data for the stream header of codecs that need it. Returns
    /// `false` if more data is needed.
    fn probe_header(&mut self) -> Result<bool> {
        let codec = self.profile.codec;
        let mut header = Vec::new();
        let mut probed = self.params.clone();

        // JPEG parameters come from the header, others only need their sequence header kept.
        let status = if codec == Codec::Jpeg {
            self.session
                .borrow_mut()
                .decode_header(&self.bitstream, &mut self.params, None)
        } else {
            self.session
                .borrow_mut()
                .decode_header(&self.bitstream, &mut probed, Some(&mut header))
        };

        match status {
            Status::MoreData => return Ok(false),
            status if status.is_error() => {
                log::error!("decode header error: {:?} ({})", status, status.code());
                return Err(DecodeError::BitstreamParse(status));
            }
            _ => (),
        }

        if !header.is_empty() {
            self.codec_data = header;
        }

        Ok(true)
    }

    fn start(&mut self) -> Result<DecoderStatus> {
        if self.profile.codec.needs_header_probe() && !self.probe_header()? {
            return Ok(DecoderStatus::NeedMoreData);
        }

        // Memory types may have been changed by a peer stage.
        self.decode.update_video_params(&mut self.params);
        if self.params.io_pattern.contains(IoPattern::OUT_VIDEO_MEMORY) {
            self.memtype_is_system = false;
            self.decode.use_video_memory();
        } else {
            self.memtype_is_system = true;
        }

        if !self.filter_inited && (self.enable_csc || self.enable_deinterlace) {
            if self.decode.task_type() == TaskType::DECODER {
                self.init_filter()?;
            } else if self.decode.has_type(TaskType::VPP_IN) {
                // A downstream post-processing stage outputs the frames on its own.
                self.can_double_deinterlace = false;
            }
            self.filter_inited = true;
        }

        self.init_decoder()?;

        log::info!(
            "initialized decoder task using {} memory",
            if self.memtype_is_system {
                "system"
            } else {
                "video"
            }
        );

        self.state = DecodingState::Decoding;
        Ok(DecoderStatus::Success)
    }

    /// Moves the frames still waiting for a surface to the discarded queue.
    fn discard_pending(&mut self) {
        while let Some(frame) = self.pending.pop_oldest() {
            self.discarded.push(frame);
        }
    }

    /// Discards frames left without output by submissions that needed more data. Only frames
    /// whose timestamp does not fall on a frame boundary are affected.
    fn discard_partial_frames(&mut self) {
        let mut index = 0;

        while self.num_partial_frames > 0 {
            let Some(frame) = self.pending.get(index) else {
                break;
            };

            let misaligned = matches!(frame.pts, Some(pts) if !self.timing.is_aligned(pts));
            if !misaligned {
                index += 1;
                continue;
            }

            if let Some(frame) = self.pending.evict_at(index) {
                log::debug!(
                    "discarding partial frame {} (pts {:?}, offset {:?})",
                    frame.system_frame_number,
                    frame.pts,
                    self.timing.pts_offset()
                );
                self.discarded.push(frame);
            }
            self.num_partial_frames -= 1;
        }
    }

    /// Attaches `surface` to the frame it belongs to and makes that frame available.
    fn queue_output(&mut self, surface: PooledSurface) {
        let frame = if self.can_double_deinterlace {
            let (pts, duration) = self.timing.next_field();
            Some(CodecFrame::new(
                self.field_source,
                Some(pts),
                Some(duration),
                false,
                Bytes::new(),
            ))
        } else {
            self.pending.pop_oldest()
        };

        let Some(mut frame) = frame else {
            log::warn!(
                "no pending frame for decoded surface {:?}, dropping it",
                surface.id()
            );
            return;
        };

        log::trace!("decoded frame: {}", surface.frame_order());
        frame.set_output(surface);
        self.decoded.push(frame);
    }

    /// Waits for the decode operation behind `submission` and delivers its surface, through the
    /// filter if there is one.
    fn complete(&mut self, submission: &Submission) -> Result<()> {
        let pool = self.pool.clone().ok_or(DecodeError::AllocationFailed)?;

        if let Some(sync_point) = submission.sync_point {
            // An encoder consuming our output waits on its own.
            if !self.decode.has_type(TaskType::ENCODER) {
                wait_for_completion(
                    &*self.session,
                    sync_point,
                    self.clock.as_ref(),
                    &self.config.sync_retry,
                )
                .map_err(DecodeError::Unknown)?;
            }
        }

        let surface = submission
            .output
            .and_then(|id| pool.find_surface(id))
            .ok_or(DecodeError::AllocationFailed)?;

        if self.can_double_deinterlace {
            if let Some(number) = self.field_sources.pop_front() {
                self.field_source = number;
            }
        }

        let mut outputs = Vec::new();
        match &mut self.filter {
            Some(filter) => loop {
                let (status, output) = filter.process(&surface)?;
                outputs.extend(output);
                if status != FilterStatus::MoreSurface {
                    break;
                }
            },
            None => outputs.push(surface),
        }

        for output in outputs {
            self.queue_output(output);
        }

        Ok(())
    }

    /// Decodes `frame`. The frame is returned by [`Decoder::pop_decoded`] once its surface is
    /// ready, or by [`Decoder::pop_discarded`] if it will not get one.
    pub fn decode(&mut self, frame: CodecFrame) -> Result<DecoderStatus> {
        if self.state == DecodingState::Closed {
            self.discarded.push(frame);
            return Err(DecodeError::Closed);
        }

        self.timing.observe(&frame);

        if self.was_reset {
            if !frame.sync_point {
                log::debug!(
                    "skipping frame {} until the next sync point",
                    frame.system_frame_number
                );
                self.discarded.push(frame);
                return Ok(DecoderStatus::NeedMoreData);
            }

            // MPEG-2 sync points may not repeat the sequence header.
            if self.profile.codec == Codec::Mpeg2 && !self.codec_data.is_empty() {
                let probe = Bitstream::from_slice(&frame.input);
                let status =
                    self.session
                        .borrow_mut()
                        .decode_header(&probe, &mut self.params, None);
                if status == Status::MoreData {
                    log::debug!("re-injecting sequence header after reset");
                    self.bitstream.append(&self.codec_data);
                }
            }
            self.was_reset = false;
        }

        if !frame.input.is_empty() {
            self.bitstream.append(&frame.input);
        }

        // Starting settles whether the output is deinterlaced at double rate.
        let started = match self.state {
            DecodingState::Configured => self.start(),
            _ => Ok(DecoderStatus::Success),
        };

        if self.can_double_deinterlace {
            // Output frames are synthesized from the fields of this one.
            self.field_sources.push_back(frame.system_frame_number);
            self.discarded.push(frame);
        } else {
            self.pending.insert_sorted(frame);
        }

        match started? {
            DecoderStatus::Success => (),
            status => return Ok(status),
        }

        let pool = self.pool.clone().ok_or(DecodeError::AllocationFailed)?;
        let session = Rc::clone(&self.session);
        let bitstream = &mut self.bitstream;

        let res = self.config.busy_retry.run(self.clock.as_ref(), |_| {
            let Some(work) = pool.lease() else {
                return Attempt::Done(None);
            };

            let submission = session
                .borrow_mut()
                .decode_frame_async(Some(&mut *bitstream), &work);
            log::debug!("decode submission status: {:?}", submission.status);

            match submission.status {
                Status::DeviceBusy => Attempt::Busy,
                // Another output is coming out of the same data, it needs a fresh surface.
                Status::MoreSurface => Attempt::Again,
                status if status.is_warning() => Attempt::Again,
                _ => Attempt::Done(Some(submission)),
            }
        });

        let submission = match res {
            Ok(Some(submission)) => submission,
            Ok(None) => return Err(DecodeError::AllocationFailed),
            Err(e) => {
                log::error!("decoder still busy: {}", e);
                return Err(DecodeError::Unknown(Status::DeviceBusy));
            }
        };

        match submission.status {
            Status::None => (),
            Status::MoreData => {
                if self.has_ready_frames && !self.can_double_deinterlace {
                    self.num_partial_frames += 1;
                }
                return Ok(DecoderStatus::NeedMoreData);
            }
            status => {
                log::error!("error during decoding: {:?} ({})", status, status.code());
                return Err(DecodeError::Unknown(status));
            }
        }

        if submission.sync_point.is_none() {
            return Ok(DecoderStatus::Success);
        }

        self.discard_partial_frames();

        if self.config.skip_corrupted_frames {
            let corrupted = submission
                .output
                .and_then(|id| pool.find_surface(id))
                .map_or(false, |s| s.corruption().contains(Corruption::MAJOR));
            if corrupted {
                log::debug!("major corruption in decoded frame, resetting");
                self.reset();
                return Ok(DecoderStatus::NeedMoreData);
            }
        }

        self.complete(&submission)?;

        self.has_ready_frames = true;
        self.bitstream.drop_consumed();

        Ok(DecoderStatus::Success)
    }

    /// Retrieves one of the frames held by the hardware, without giving it new input.
    ///
    /// Returns [`DecoderStatus::Flushed`] once the hardware holds no more frames, at which point
    /// the frames still waiting for a surface are discarded.
    pub fn flush(&mut self) -> Result<DecoderStatus> {
        match self.state {
            DecodingState::Closed => return Err(DecodeError::Closed),
            DecodingState::Configured => {
                self.discard_pending();
                return Ok(DecoderStatus::Flushed);
            }
            DecodingState::Decoding => (),
        }

        let pool = self.pool.clone().ok_or(DecodeError::AllocationFailed)?;
        let session = Rc::clone(&self.session);

        let res = self.config.busy_retry.run(self.clock.as_ref(), |_| {
            let Some(work) = pool.lease() else {
                return Attempt::Done(None);
            };

            let submission = session.borrow_mut().decode_frame_async(None, &work);
            log::debug!("drain submission status: {:?}", submission.status);

            match submission.status {
                Status::DeviceBusy => Attempt::Busy,
                _ => Attempt::Done(Some(submission)),
            }
        });

        let submission = match res {
            Ok(Some(submission)) => submission,
            Ok(None) => return Err(DecodeError::AllocationFailed),
            Err(e) => {
                log::error!("decoder still busy: {}", e);
                return Err(DecodeError::Unknown(Status::DeviceBusy));
            }
        };

        if submission.sync_point.is_none() {
            if submission.status != Status::MoreData {
                log::debug!("drain ended with status {:?}", submission.status);
            }
            if !self.pending.is_empty() {
                log::debug!("discarding {} frames left without output", self.pending.len());
            }
            self.discard_pending();
            return Ok(DecoderStatus::Flushed);
        }

        self.complete(&submission)?;
        Ok(DecoderStatus::Success)
    }

    /// Calls [`Decoder::flush`] until the hardware holds no more frames.
    pub fn drain(&mut self) -> Result<()> {
        while self.flush()? != DecoderStatus::Flushed {}
        Ok(())
    }

    /// Abandons the frames in flight, e.g. because of a seek. Returns whether the hardware was
    /// reset cleanly. If it was not, the session will be initialized again by the next call to
    /// [`Decoder::decode`].
    pub fn reset(&mut self) -> bool {
        if self.state == DecodingState::Closed {
            return false;
        }

        self.discard_pending();
        self.timing.reset();
        self.field_sources.clear();
        self.bitstream.clear();
        self.was_reset = true;
        self.has_ready_frames = false;
        self.num_partial_frames = 0;

        if self.state != DecodingState::Decoding {
            return true;
        }

        let status = self.session.borrow_mut().decode_reset(&self.params);
        if status != Status::None {
            log::error!("error resetting the decoder: {:?} ({})", status, status.code());
            self.close_decoder();
            self.state = DecodingState::Configured;
            return false;
        }

        true
    }

    /// Releases the session and all surfaces. Frames still waiting for a surface are discarded.
    pub fn close(&mut self) {
        if self.state == DecodingState::Closed {
            return;
        }

        self.discard_pending();
        self.filter = None;

        if self.state == DecodingState::Decoding {
            self.close_decoder();
        }

        if let Some(plugin) = self.plugin.take() {
            self.session.borrow_mut().unload_plugin(plugin);
        }

        self.state = DecodingState::Closed;
    }
}

impl<P: SessionProvider> Drop for Decoder<P> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::backend::dummy::DummyProvider;
    use crate::backend::dummy::DummyState;
    use crate::filter::ops::FilterKind;
    use crate::retry::ManualClock;
    use crate::task::TaskAggregator;
    use crate::PicStruct;

    const MS: u64 = 1_000_000;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn setup() -> (SharedAggregator<DummyProvider>, Rc<RefCell<DummyState>>) {
        init_logger();
        let aggregator = TaskAggregator::new(DummyProvider::default());
        let state = Rc::clone(aggregator.borrow().provider().state());
        (aggregator, state)
    }

    fn avc() -> Profile {
        Profile::new(Codec::Avc, 100, 40)
    }

    fn progressive() -> VideoInfo {
        VideoInfo::new(1280, 720, Fourcc::NV12)
    }

    fn interlaced_60() -> VideoInfo {
        VideoInfo {
            pic_struct: PicStruct::FieldTff,
            fps_n: 60,
            fps_d: 1,
            ..VideoInfo::new(1920, 1080, Fourcc::NV12)
        }
    }

    fn new_decoder(
        aggregator: &SharedAggregator<DummyProvider>,
        profile: Profile,
        info: &VideoInfo,
    ) -> Decoder<DummyProvider> {
        Decoder::new(aggregator, profile, info, Default::default()).unwrap()
    }

    fn frame(number: u32, pts: u64, sync_point: bool, size: usize) -> CodecFrame {
        CodecFrame::new(
            number,
            Some(pts),
            Some(33 * MS),
            sync_point,
            vec![number as u8; size],
        )
    }

    fn decoded_pts(decoder: &mut Decoder<DummyProvider>) -> Vec<Option<u64>> {
        let mut pts = Vec::new();
        while let Some(frame) = decoder.pop_decoded() {
            assert!(frame.output().is_some());
            pts.push(frame.pts);
        }
        pts
    }

    fn discarded_numbers(decoder: &mut Decoder<DummyProvider>) -> Vec<u32> {
        let mut numbers = Vec::new();
        while let Some(frame) = decoder.pop_discarded() {
            assert!(frame.output().is_none());
            numbers.push(frame.system_frame_number);
        }
        numbers
    }

    #[test]
    fn frames_come_out_in_timestamp_order() {
        let (aggregator, state) = setup();
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());

        for (i, pts) in [0, 33 * MS, 66 * MS].into_iter().enumerate() {
            let status = decoder.decode(frame(i as u32, pts, true, 10)).unwrap();
            assert_eq!(status, DecoderStatus::Success);
        }

        assert_eq!(
            decoded_pts(&mut decoder),
            vec![Some(0), Some(33 * MS), Some(66 * MS)]
        );
        assert_eq!(decoder.num_pending(), 0);
        assert_eq!(state.borrow().decoded_data.len(), 3);
        assert!(decoder.filter().is_none());
    }

    #[test]
    fn reordered_input_is_paired_by_timestamp() {
        let (aggregator, state) = setup();
        state.borrow_mut().output_delay = 1;
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());

        assert_eq!(
            decoder.decode(frame(0, 0, true, 10)).unwrap(),
            DecoderStatus::NeedMoreData
        );
        assert_eq!(
            decoder.decode(frame(1, 66 * MS, false, 10)).unwrap(),
            DecoderStatus::Success
        );
        assert_eq!(
            decoder.decode(frame(2, 33 * MS, false, 10)).unwrap(),
            DecoderStatus::Success
        );
        assert_eq!(decoder.flush().unwrap(), DecoderStatus::Success);
        assert_eq!(decoder.flush().unwrap(), DecoderStatus::Flushed);

        assert_eq!(
            decoded_pts(&mut decoder),
            vec![Some(0), Some(33 * MS), Some(66 * MS)]
        );
        assert_eq!(decoder.num_discarded(), 0);
    }

    #[test]
    fn double_rate_deinterlacing() {
        let (aggregator, state) = setup();
        state.borrow_mut().vpp_outputs_per_input = 2;
        let mut decoder = new_decoder(&aggregator, avc(), &interlaced_60());

        let status = decoder.decode(frame(0, 0, true, 10)).unwrap();
        assert_eq!(status, DecoderStatus::Success);

        let mut outputs = Vec::new();
        while let Some(frame) = decoder.pop_decoded() {
            outputs.push((frame.system_frame_number, frame.pts, frame.duration));
        }
        assert_eq!(
            outputs,
            vec![
                (0, Some(0), Some(16_500_000)),
                (0, Some(16_500_000), Some(16_500_000)),
            ]
        );
        assert_eq!(discarded_numbers(&mut decoder), vec![0]);

        let filter = decoder.filter().unwrap();
        assert!(filter.filters().contains(FilterKind::Deinterlacing));
        assert_eq!(
            filter.params().filters,
            vec![crate::filter::ops::FilterOp::Deinterlacing(
                DeinterlaceMethod::AdvancedNoRef
            )]
        );
    }

    #[test]
    fn double_rate_fields_across_drain() {
        let (aggregator, state) = setup();
        state.borrow_mut().vpp_outputs_per_input = 2;
        state.borrow_mut().output_delay = 1;
        let mut decoder = new_decoder(&aggregator, avc(), &interlaced_60());

        let mut fields = Vec::new();
        let mut collect = |decoder: &mut Decoder<DummyProvider>| {
            while let Some(frame) = decoder.pop_decoded() {
                assert!(frame.output().is_some());
                fields.push((frame.system_frame_number, frame.pts));
            }
        };

        assert_eq!(
            decoder.decode(frame(10, 0, true, 10)).unwrap(),
            DecoderStatus::NeedMoreData
        );
        for (number, pts) in [(11, 33 * MS), (12, 66 * MS)] {
            assert_eq!(
                decoder.decode(frame(number, pts, false, 10)).unwrap(),
                DecoderStatus::Success
            );
            collect(&mut decoder);
        }
        assert_eq!(decoder.num_partial_frames, 0);

        decoder.drain().unwrap();
        collect(&mut decoder);

        let field = 16_500_000;
        assert_eq!(
            fields,
            vec![
                (10, Some(0)),
                (10, Some(field)),
                (11, Some(2 * field)),
                (11, Some(3 * field)),
                (12, Some(4 * field)),
                (12, Some(5 * field)),
            ]
        );
        // Every input is given back exactly once.
        assert_eq!(discarded_numbers(&mut decoder), vec![10, 11, 12]);
        assert_eq!(decoder.num_pending(), 0);
        assert!(decoder.pop_decoded().is_none());
    }

    #[test]
    fn colour_conversion_goes_through_filter() {
        let (aggregator, state) = setup();
        let info = VideoInfo::new(1280, 720, Fourcc::RGB4);
        let mut decoder = new_decoder(&aggregator, avc(), &info);

        decoder.decode(frame(0, 0, true, 10)).unwrap();

        let filter = decoder.filter().unwrap();
        assert!(filter.is_started());
        assert_eq!(filter.params().vpp.output.fourcc, Fourcc::RGB4);
        assert_eq!(decoded_pts(&mut decoder), vec![Some(0)]);
        assert!(decoder
            .task()
            .has_type(TaskType::DECODER | TaskType::VPP_IN));
        assert!(decoder.task().request().mem_type.contains(
            MemType::EXTERNAL_FRAME | MemType::FROM_DECODE | MemType::FROM_VPPIN
        ));

        drop(decoder);
        assert_eq!(state.borrow().live_frames, 0);
    }

    #[test]
    fn every_frame_is_returned_across_reset() {
        let (aggregator, state) = setup();
        state.borrow_mut().output_delay = 1;
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());
        decoder.set_output_memory(false);

        decoder.decode(frame(0, 0, true, 10)).unwrap();
        decoder.decode(frame(1, 33 * MS, false, 10)).unwrap();
        assert!(decoder.reset());

        // Skipped until the next sync point.
        assert_eq!(
            decoder.decode(frame(2, 66 * MS, false, 10)).unwrap(),
            DecoderStatus::NeedMoreData
        );
        decoder.decode(frame(3, 100 * MS, true, 10)).unwrap();
        decoder.decode(frame(4, 133 * MS, false, 10)).unwrap();
        decoder.drain().unwrap();

        assert_eq!(
            decoded_pts(&mut decoder),
            vec![Some(0), Some(100 * MS), Some(133 * MS)]
        );
        assert_eq!(discarded_numbers(&mut decoder), vec![1, 2]);
        assert_eq!(state.borrow().allocations.len(), 0);
        assert!(decoder.task().memtype_is_system());
    }

    #[test]
    fn reset_is_idempotent() {
        let (aggregator, state) = setup();
        state.borrow_mut().output_delay = 2;
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());

        // Nothing to reset in hardware before the first frame.
        assert!(decoder.reset());
        assert_eq!(state.borrow().num_calls("decode_reset"), 0);

        decoder.decode(frame(0, 0, true, 10)).unwrap();
        decoder.decode(frame(1, 33 * MS, false, 10)).unwrap();
        assert_eq!(decoder.num_pending(), 2);

        assert!(decoder.reset());
        let after_one = (
            decoder.num_pending(),
            decoder.num_decoded(),
            decoder.num_discarded(),
        );
        assert!(decoder.reset());
        let after_two = (
            decoder.num_pending(),
            decoder.num_decoded(),
            decoder.num_discarded(),
        );

        assert_eq!(after_one, (0, 0, 2));
        assert_eq!(after_one, after_two);
        assert_eq!(discarded_numbers(&mut decoder), vec![0, 1]);
    }

    #[test]
    fn failed_hardware_reset_reinitializes() {
        let (aggregator, state) = setup();
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());
        decoder.decode(frame(0, 0, true, 10)).unwrap();

        state.borrow_mut().reset_status = Status::DeviceFailed;
        assert!(!decoder.reset());
        assert_eq!(state.borrow().num_calls("decode_close"), 1);
        assert_eq!(state.borrow().live_frames, 0);

        decoder.decode(frame(1, 33 * MS, true, 10)).unwrap();
        assert_eq!(state.borrow().num_calls("decode_init"), 2);
        assert_eq!(decoded_pts(&mut decoder), vec![Some(0), Some(33 * MS)]);
    }

    #[test]
    fn partial_frames_are_discarded() {
        let (aggregator, state) = setup();
        state.borrow_mut().frame_size = 100;
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());

        assert_eq!(
            decoder.decode(frame(0, 0, true, 100)).unwrap(),
            DecoderStatus::Success
        );
        assert_eq!(
            decoder.decode(frame(1, 33_333_333, false, 50)).unwrap(),
            DecoderStatus::NeedMoreData
        );
        assert_eq!(decoder.num_partial_frames, 1);

        // Completes the frame started by the previous payload.
        assert_eq!(
            decoder.decode(frame(2, 50 * MS, false, 50)).unwrap(),
            DecoderStatus::Success
        );
        assert_eq!(decoder.num_partial_frames, 0);

        assert_eq!(decoded_pts(&mut decoder), vec![Some(0), Some(33_333_333)]);
        assert_eq!(discarded_numbers(&mut decoder), vec![2]);
        assert_eq!(decoder.bitstream.buffered(), 0);
    }

    #[test]
    fn partial_frames_mixed_with_aligned_frames() {
        let (aggregator, state) = setup();
        state.borrow_mut().frame_size = 100;
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());
        // Frame boundaries at 30 fps, rounded to the nanosecond.
        let boundary = |n: u64| n * 1_000_000_000 / 30;

        assert_eq!(
            decoder.decode(frame(0, 0, true, 100)).unwrap(),
            DecoderStatus::Success
        );
        assert_eq!(
            decoder.decode(frame(1, boundary(1), false, 40)).unwrap(),
            DecoderStatus::NeedMoreData
        );
        assert_eq!(
            decoder.decode(frame(2, 50 * MS, false, 40)).unwrap(),
            DecoderStatus::NeedMoreData
        );
        assert_eq!(decoder.num_partial_frames, 2);

        // The oldest aligned frame is kept, both misaligned ones are dropped oldest first.
        assert_eq!(
            decoder.decode(frame(3, 60 * MS, false, 40)).unwrap(),
            DecoderStatus::Success
        );
        assert_eq!(decoder.num_partial_frames, 0);
        assert_eq!(decoded_pts(&mut decoder), vec![Some(0), Some(boundary(1))]);
        assert_eq!(discarded_numbers(&mut decoder), vec![2, 3]);
        assert_eq!(decoder.num_pending(), 0);
        assert_eq!(decoder.bitstream.buffered(), 20);

        assert_eq!(
            decoder.decode(frame(4, boundary(3), false, 40)).unwrap(),
            DecoderStatus::NeedMoreData
        );
        assert_eq!(
            decoder.decode(frame(5, 110 * MS, false, 20)).unwrap(),
            DecoderStatus::NeedMoreData
        );
        assert_eq!(decoder.num_partial_frames, 2);

        // Only one frame is misaligned, the scan runs out of frames with one partial left.
        assert_eq!(
            decoder.decode(frame(6, boundary(4), false, 40)).unwrap(),
            DecoderStatus::Success
        );
        assert_eq!(decoder.num_partial_frames, 1);
        assert_eq!(decoded_pts(&mut decoder), vec![Some(boundary(3))]);
        assert_eq!(discarded_numbers(&mut decoder), vec![5]);
        assert_eq!(decoder.num_pending(), 1);

        decoder.drain().unwrap();
        assert_eq!(discarded_numbers(&mut decoder), vec![6]);

        assert!(decoder.reset());
        assert_eq!(decoder.num_partial_frames, 0);
    }

    #[test]
    fn busy_hardware_is_retried() {
        let (aggregator, state) = setup();
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());
        let clock = Rc::new(ManualClock::default());
        decoder.set_clock(clock.clone());

        state.borrow_mut().decode_busy = 5;
        assert_eq!(
            decoder.decode(frame(0, 0, true, 10)).unwrap(),
            DecoderStatus::Success
        );
        assert_eq!(clock.num_sleeps(), 5);

        // Asking for another surface does not sleep.
        state.borrow_mut().decode_more_surface = 2;
        decoder.decode(frame(1, 33 * MS, true, 10)).unwrap();
        assert_eq!(clock.num_sleeps(), 5);
        assert_eq!(decoded_pts(&mut decoder), vec![Some(0), Some(33 * MS)]);
    }

    #[test]
    fn busy_bound_is_an_error() {
        let (aggregator, state) = setup();
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());
        decoder.set_clock(Rc::new(ManualClock::default()));

        state.borrow_mut().decode_busy = u32::MAX;
        assert!(matches!(
            decoder.decode(frame(0, 0, true, 10)),
            Err(DecodeError::Unknown(Status::DeviceBusy))
        ));
    }

    #[test]
    fn hardware_errors_are_reported() {
        let (aggregator, state) = setup();
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());

        state.borrow_mut().decode_failure = Some(Status::DeviceLost);
        assert!(matches!(
            decoder.decode(frame(0, 0, true, 10)),
            Err(DecodeError::Unknown(Status::DeviceLost))
        ));

        state.borrow_mut().sync_failure = Some(Status::GpuHang);
        assert!(matches!(
            decoder.decode(frame(1, 33 * MS, true, 10)),
            Err(DecodeError::Unknown(Status::GpuHang))
        ));
    }

    #[test]
    fn waits_while_in_execution() {
        let (aggregator, state) = setup();
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());
        state.borrow_mut().in_execution = 3;

        decoder.decode(frame(0, 0, true, 10)).unwrap();
        assert_eq!(state.borrow().num_calls("sync_operation"), 4);
        assert_eq!(decoded_pts(&mut decoder), vec![Some(0)]);
    }

    #[test]
    fn encoder_waits_on_its_own() {
        let (aggregator, state) = setup();
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());
        decoder
            .task()
            .set_task_type(TaskType::DECODER | TaskType::ENCODER);

        decoder.decode(frame(0, 0, true, 10)).unwrap();
        assert_eq!(state.borrow().num_calls("sync_operation"), 0);
        assert_eq!(decoder.num_decoded(), 1);
    }

    #[test]
    fn flush_discards_frames_without_output() {
        let (aggregator, state) = setup();
        state.borrow_mut().frame_size = 100;
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());

        decoder.decode(frame(0, 0, true, 100)).unwrap();
        assert_eq!(
            decoder.decode(frame(1, 33 * MS, false, 40)).unwrap(),
            DecoderStatus::NeedMoreData
        );

        assert_eq!(decoder.flush().unwrap(), DecoderStatus::Flushed);
        assert_eq!(decoded_pts(&mut decoder), vec![Some(0)]);
        assert_eq!(discarded_numbers(&mut decoder), vec![1]);
    }

    #[test]
    fn corrupted_frames_trigger_reset() {
        let (aggregator, state) = setup();
        let config = DecoderConfig {
            skip_corrupted_frames: true,
            ..Default::default()
        };
        let mut decoder = Decoder::new(&aggregator, avc(), &progressive(), config).unwrap();

        state.borrow_mut().corrupt_next = Corruption::MAJOR;
        assert_eq!(
            decoder.decode(frame(0, 0, true, 10)).unwrap(),
            DecoderStatus::NeedMoreData
        );
        assert_eq!(state.borrow().num_calls("decode_reset"), 1);
        assert_eq!(discarded_numbers(&mut decoder), vec![0]);

        assert_eq!(
            decoder.decode(frame(1, 33 * MS, true, 10)).unwrap(),
            DecoderStatus::Success
        );
        assert_eq!(decoded_pts(&mut decoder), vec![Some(33 * MS)]);
    }

    #[test]
    fn mpeg2_sequence_header_is_reinjected() {
        let (aggregator, state) = setup();
        let sequence_header = vec![0x00, 0x00, 0x01, 0xb3];
        state.borrow_mut().sequence_header = sequence_header.clone();
        let mut decoder = new_decoder(&aggregator, Profile::new(Codec::Mpeg2, 4, 8), &progressive());

        decoder.decode(frame(0, 0, true, 10)).unwrap();
        assert_eq!(decoder.codec_data, sequence_header);

        assert!(decoder.reset());
        state.borrow_mut().header_status = Status::MoreData;
        decoder.decode(frame(1, 33 * MS, true, 8)).unwrap();

        let mut expected = sequence_header;
        expected.extend_from_slice(&[1u8; 8]);
        assert_eq!(state.borrow().decoded_data.last(), Some(&expected));
    }

    #[test]
    fn header_probe_needs_data() {
        let (aggregator, state) = setup();
        state.borrow_mut().header_status = Status::MoreData;
        let mut decoder =
            new_decoder(&aggregator, Profile::new(Codec::Vc1, 0, 0), &progressive());

        assert_eq!(
            decoder.decode(frame(0, 0, true, 10)).unwrap(),
            DecoderStatus::NeedMoreData
        );
        assert_eq!(state.borrow().num_calls("decode_init"), 0);

        state.borrow_mut().header_status = Status::InvalidVideoParam;
        assert!(matches!(
            decoder.decode(frame(1, 33 * MS, true, 10)),
            Err(DecodeError::BitstreamParse(Status::InvalidVideoParam))
        ));

        state.borrow_mut().header_status = Status::None;
        decoder.decode(frame(2, 66 * MS, true, 10)).unwrap();
        assert_eq!(state.borrow().num_calls("decode_init"), 1);
        // All the data accumulated so far went into the first frame.
        assert_eq!(state.borrow().decoded_data[0].len(), 30);
    }

    #[test]
    fn hevc_plugins() {
        let (aggregator, state) = setup();
        let main = Profile::new(Codec::Hevc, Profile::HEVC_MAIN, 0);
        let decoder = new_decoder(&aggregator, main, &progressive());
        assert_eq!(state.borrow().loaded_plugins, vec![PluginId::HevcDecodeHw]);
        assert_eq!(decoder.params().frame_info.height, 736);
        drop(decoder);
        assert_eq!(state.borrow().unloaded_plugins, vec![PluginId::HevcDecodeHw]);

        state.borrow_mut().failing_plugins = vec![PluginId::HevcDecodeHw];
        let decoder = new_decoder(&aggregator, main, &progressive());
        assert_eq!(decoder.plugin, Some(PluginId::HevcDecodeSw));
        assert!(decoder.task().memtype_is_system());
    }

    #[test]
    fn hevc_main10_on_older_platforms() {
        let (aggregator, state) = setup();
        state.borrow_mut().platform = Platform::Haswell;
        let main10 = Profile::new(Codec::Hevc, Profile::HEVC_MAIN10, 0);
        let info = VideoInfo::new(1920, 1080, Fourcc::P010);
        let decoder = new_decoder(&aggregator, main10, &info);

        assert_eq!(state.borrow().loaded_plugins, vec![PluginId::HevcDecodeSw]);
        let frame_info = decoder.params().frame_info;
        assert_eq!(frame_info.fourcc, Fourcc::P010);
        assert_eq!(frame_info.bit_depth_luma, 10);
        assert_eq!(frame_info.shift, 0);
        assert_eq!(
            decoder.params().io_pattern,
            IoPattern::OUT_SYSTEM_MEMORY
        );
        assert!(!decoder.enable_csc);
    }

    #[test]
    fn vp9_plugin_failure_is_fatal() {
        let (aggregator, state) = setup();
        state.borrow_mut().failing_plugins = vec![PluginId::Vp9DecodeHw];

        assert!(matches!(
            Decoder::new(
                &aggregator,
                Profile::new(Codec::Vp9, 0, 0),
                &progressive(),
                Default::default()
            ),
            Err(DecodeError::InitFailed(_))
        ));
    }

    #[test]
    fn surface_geometry() {
        let (aggregator, _) = setup();
        let info = VideoInfo::new(1366, 720, Fourcc::NV12);

        let decoder = new_decoder(&aggregator, avc(), &info);
        let frame_info = decoder.params().frame_info;
        assert_eq!((frame_info.width, frame_info.height), (1376, 720));
        assert_eq!((frame_info.crop.width, frame_info.crop.height), (1366, 720));
        assert_eq!(frame_info.fourcc, Fourcc::NV12);

        let interlaced = VideoInfo {
            pic_struct: PicStruct::FieldBff,
            ..info.clone()
        };
        let decoder = new_decoder(&aggregator, avc(), &interlaced);
        assert_eq!(decoder.params().frame_info.height, 736);
        assert!(decoder.enable_deinterlace);
        assert!(!decoder.can_double_deinterlace);

        let hevc = Profile::new(Codec::Hevc, Profile::HEVC_MAIN, 0);
        let decoder = new_decoder(&aggregator, hevc, &info);
        assert_eq!(decoder.params().frame_info.height, 736);
    }

    #[test]
    fn configuration() {
        let (aggregator, _) = setup();
        let info = VideoInfo {
            fps_n: 0,
            ..progressive()
        };

        let decoder = new_decoder(&aggregator, avc(), &info);
        assert_eq!(decoder.params().async_depth, 4);
        assert_eq!(decoder.params().codec_level, 40);
        assert_eq!(decoder.params().frame_info.frame_rate_n, 30);
        assert_eq!(decoder.timing.frame_duration(), 33_333_333);

        let autoplugged = DecoderConfig {
            autoplugged: true,
            ..Default::default()
        };
        let decoder = Decoder::new(&aggregator, avc(), &info, autoplugged).unwrap();
        assert_eq!(decoder.params().async_depth, 16);
        assert_eq!(decoder.params().codec_level, 0);

        let live = DecoderConfig {
            live_mode: true,
            ..Default::default()
        };
        let decoder = Decoder::new(&aggregator, avc(), &info, live).unwrap();
        assert_eq!(decoder.params().async_depth, 1);
        assert!(decoder.params().decoded_order);
        assert!(decoder.bitstream.complete_frame());
    }

    #[test]
    fn partial_acceleration_uses_system_memory() {
        let (aggregator, state) = setup();
        state.borrow_mut().decode_query_status = Status::PartialAcceleration;
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());

        assert!(decoder.task().memtype_is_system());
        assert_eq!(decoder.task().request().mem_type, MemType::SYSTEM_MEMORY);

        decoder.decode(frame(0, 0, true, 10)).unwrap();
        assert!(state.borrow().allocations.is_empty());
        assert_eq!(decoded_pts(&mut decoder), vec![Some(0)]);
    }

    #[test]
    fn downstream_filter_owns_post_processing() {
        let (aggregator, state) = setup();
        let mut decoder = new_decoder(&aggregator, avc(), &interlaced_60());

        let _downstream = Filter::with_task(
            &aggregator,
            Rc::clone(decoder.session()),
            decoder.task(),
            TaskType::VPP_IN,
            false,
            false,
        );

        decoder.decode(frame(0, 0, true, 10)).unwrap();
        assert!(decoder.filter().is_none());
        assert!(!decoder.can_double_deinterlace);
        // The input frame itself carries the output.
        assert_eq!(decoded_pts(&mut decoder), vec![Some(0)]);
        assert_eq!(state.borrow().num_calls("vpp_init"), 0);
    }

    #[test]
    fn closed_decoder_discards_input() {
        let (aggregator, state) = setup();
        state.borrow_mut().output_delay = 1;
        let mut decoder = new_decoder(&aggregator, avc(), &progressive());

        decoder.decode(frame(0, 0, true, 10)).unwrap();
        decoder.close();
        assert_eq!(state.borrow().live_frames, 0);

        assert!(matches!(
            decoder.decode(frame(1, 33 * MS, true, 10)),
            Err(DecodeError::Closed)
        ));
        assert!(matches!(decoder.flush(), Err(DecodeError::Closed)));
        assert_eq!(discarded_numbers(&mut decoder), vec![0, 1]);
    }
}
