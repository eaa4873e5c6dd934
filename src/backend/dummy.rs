// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! and the filter run so we can test them in isolation.
//!
//! The behavior of the hardware is scripted through the [`DummyState`] shared by the provider and
//! all the sessions it creates, which also records what the hardware has been asked to do.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;

use crate::backend::Platform;
use crate::backend::PluginId;
use crate::backend::Session;
use crate::backend::SessionProvider;
use crate::backend::Status;
use crate::backend::Submission;
use crate::backend::SyncPoint;
use crate::bitstream::Bitstream;
use crate::filter::ops::FilterKind;
use crate::params::AllocRequest;
use crate::params::AllocResponse;
use crate::params::MemId;
use crate::params::VideoParams;
use crate::surface_pool::Corruption;
use crate::surface_pool::PooledSurface;
use crate::task::TaskId;

/// Script and records of the dummy hardware.
#[derive(Debug)]
pub struct DummyState {
    pub platform: Platform,

    /// Size of one compressed frame. A submission with less data than this returns
    /// [`Status::MoreData`]. Zero means every submission decodes all the data it is given as one
    /// frame.
    pub frame_size: usize,
    /// Number of decoded frames the decode unit keeps before returning the oldest one. The held
    /// frames are returned when draining.
    pub output_delay: usize,
    /// Number of decode submissions to answer with [`Status::DeviceBusy`].
    pub decode_busy: u32,
    /// Number of decode submissions to answer with [`Status::MoreSurface`].
    pub decode_more_surface: u32,
    /// Status returned by the next decode submission instead of decoding.
    pub decode_failure: Option<Status>,
    /// Corruption reported on the next decoded frame.
    pub corrupt_next: Corruption,
    /// Status of the header probe when data is available.
    pub header_status: Status,
    /// Sequence header reported by a successful header probe.
    pub sequence_header: Vec<u8>,
    pub decode_query_status: Status,
    pub decode_request: AllocRequest,
    pub init_status: Status,
    pub reset_status: Status,
    /// Plugins that fail to load.
    pub failing_plugins: Vec<PluginId>,

    /// Number of completion waits to answer with [`Status::InExecution`].
    pub in_execution: u32,
    /// Status returned by the next completion wait.
    pub sync_failure: Option<Status>,

    /// Number of VPP submissions to answer with [`Status::DeviceBusy`].
    pub vpp_busy: u32,
    /// Number of VPP submissions to answer with [`Status::MoreData`].
    pub vpp_more_data: u32,
    /// Number of output frames the VPP produces for each input frame.
    pub vpp_outputs_per_input: usize,
    pub vpp_query_io_status: Status,
    pub vpp_requests: [AllocRequest; 2],
    pub unsupported_filters: Vec<FilterKind>,
    /// Reject high bit depth output stored in the most significant bits.
    pub reject_shifted_output: bool,
    /// Make the next device frame allocation fail.
    pub alloc_failure: bool,

    /// Names of the session methods called, in order.
    pub calls: Vec<&'static str>,
    pub loaded_plugins: Vec<PluginId>,
    pub unloaded_plugins: Vec<PluginId>,
    /// Data passed to the decode unit, per completed frame.
    pub decoded_data: Vec<Vec<u8>>,
    pub decode_params: Option<VideoParams>,
    pub vpp_params: Option<VideoParams>,
    pub allocations: Vec<AllocResponse>,
    pub frees: Vec<AllocResponse>,
    /// Device frames allocated and not freed yet.
    pub live_frames: usize,
    pub sessions_created: usize,

    next_sync: u64,
    next_mem: u64,
    frame_order: u32,
}

impl Default for DummyState {
    fn default() -> Self {
        Self {
            platform: Platform::Skylake,
            frame_size: 0,
            output_delay: 0,
            decode_busy: 0,
            decode_more_surface: 0,
            decode_failure: None,
            corrupt_next: Corruption::empty(),
            header_status: Status::None,
            sequence_header: Vec::new(),
            decode_query_status: Status::None,
            decode_request: AllocRequest {
                num_frame_min: 4,
                num_frame_suggested: 4,
                ..Default::default()
            },
            init_status: Status::None,
            reset_status: Status::None,
            failing_plugins: Vec::new(),
            in_execution: 0,
            sync_failure: None,
            vpp_busy: 0,
            vpp_more_data: 0,
            vpp_outputs_per_input: 1,
            vpp_query_io_status: Status::None,
            vpp_requests: [
                AllocRequest {
                    num_frame_min: 1,
                    num_frame_suggested: 2,
                    ..Default::default()
                },
                AllocRequest {
                    num_frame_min: 2,
                    num_frame_suggested: 3,
                    ..Default::default()
                },
            ],
            unsupported_filters: Vec::new(),
            reject_shifted_output: false,
            alloc_failure: false,
            calls: Vec::new(),
            loaded_plugins: Vec::new(),
            unloaded_plugins: Vec::new(),
            decoded_data: Vec::new(),
            decode_params: None,
            vpp_params: None,
            allocations: Vec::new(),
            frees: Vec::new(),
            live_frames: 0,
            sessions_created: 0,
            next_sync: 0,
            next_mem: 0,
            frame_order: 0,
        }
    }
}

impl DummyState {
    fn next_sync_point(&mut self) -> SyncPoint {
        self.next_sync += 1;
        SyncPoint(self.next_sync)
    }

    /// Number of calls to the session method `name`.
    pub fn num_calls(&self, name: &str) -> usize {
        self.calls.iter().filter(|c| **c == name).count()
    }
}

/// Dummy session. All the sessions of a provider share its [`DummyState`].
pub struct DummySession {
    state: Rc<RefCell<DummyState>>,
    /// Decoded frames held by the decode unit.
    held: VecDeque<PooledSurface>,
    /// Outputs produced so far for the current VPP input.
    vpp_outputs: usize,
}

impl Session for DummySession {
    fn load_plugin(&mut self, plugin: PluginId) -> Status {
        let mut state = self.state.borrow_mut();
        state.calls.push("load_plugin");

        if state.failing_plugins.contains(&plugin) {
            return Status::NotFound;
        }

        state.loaded_plugins.push(plugin);
        Status::None
    }

    fn unload_plugin(&mut self, plugin: PluginId) -> Status {
        let mut state = self.state.borrow_mut();
        state.calls.push("unload_plugin");
        state.unloaded_plugins.push(plugin);
        Status::None
    }

    fn decode_query_io_surf(&mut self, params: &VideoParams) -> (Status, AllocRequest) {
        let mut state = self.state.borrow_mut();
        state.calls.push("decode_query_io_surf");

        let mut request = state.decode_request;
        request.info = params.frame_info;
        (state.decode_query_status, request)
    }

    fn decode_header(
        &mut self,
        bs: &Bitstream,
        _: &mut VideoParams,
        sequence_header: Option<&mut Vec<u8>>,
    ) -> Status {
        let mut state = self.state.borrow_mut();
        state.calls.push("decode_header");

        if bs.is_empty() {
            return Status::MoreData;
        }
        if state.header_status != Status::None {
            return state.header_status;
        }

        if let Some(header) = sequence_header {
            header.clear();
            header.extend_from_slice(&state.sequence_header);
        }

        Status::None
    }

    fn decode_init(&mut self, params: &VideoParams) -> Status {
        let mut state = self.state.borrow_mut();
        state.calls.push("decode_init");
        state.decode_params = Some(params.clone());
        state.init_status
    }

    fn decode_reset(&mut self, params: &VideoParams) -> Status {
        self.held.clear();

        let mut state = self.state.borrow_mut();
        state.calls.push("decode_reset");
        state.decode_params = Some(params.clone());
        state.reset_status
    }

    fn decode_close(&mut self) -> Status {
        self.held.clear();
        self.state.borrow_mut().calls.push("decode_close");
        Status::None
    }

    fn decode_frame_async(
        &mut self,
        bs: Option<&mut Bitstream>,
        work: &PooledSurface,
    ) -> Submission {
        let mut state = self.state.borrow_mut();
        state.calls.push("decode_frame_async");

        if state.decode_busy > 0 {
            state.decode_busy -= 1;
            return Submission::status(Status::DeviceBusy);
        }
        if state.decode_more_surface > 0 {
            state.decode_more_surface -= 1;
            return Submission::status(Status::MoreSurface);
        }
        if let Some(status) = state.decode_failure.take() {
            return Submission::status(status);
        }

        match bs {
            Some(bs) => {
                let size = match state.frame_size {
                    0 => bs.len(),
                    size => size,
                };
                if bs.is_empty() || bs.len() < size {
                    return Submission::status(Status::MoreData);
                }

                state.decoded_data.push(bs.data()[..size].to_vec());
                bs.consume(size);

                work.set_corruption(std::mem::take(&mut state.corrupt_next));
                work.set_frame_order(state.frame_order);
                state.frame_order += 1;
                self.held.push_back(work.clone());

                if self.held.len() <= state.output_delay {
                    return Submission::status(Status::MoreData);
                }
            }
            None if self.held.is_empty() => return Submission::status(Status::MoreData),
            None => (),
        }

        let Some(output) = self.held.pop_front() else {
            return Submission::status(Status::MoreData);
        };

        let sync_point = state.next_sync_point();
        Submission::completed(Status::None, output.id(), sync_point)
    }

    fn vpp_query(&mut self, params: &VideoParams) -> Status {
        let mut state = self.state.borrow_mut();
        state.calls.push("vpp_query");

        if state.reject_shifted_output && params.vpp.output.shift != 0 {
            Status::Unsupported
        } else {
            Status::None
        }
    }

    fn vpp_query_filter(&mut self, kind: FilterKind) -> Status {
        let mut state = self.state.borrow_mut();
        state.calls.push("vpp_query_filter");

        if state.unsupported_filters.contains(&kind) {
            Status::Unsupported
        } else {
            Status::None
        }
    }

    fn vpp_query_io_surf(&mut self, params: &VideoParams) -> (Status, [AllocRequest; 2]) {
        let mut state = self.state.borrow_mut();
        state.calls.push("vpp_query_io_surf");

        let mut requests = state.vpp_requests;
        requests[0].info = params.vpp.input;
        requests[1].info = params.vpp.output;
        (state.vpp_query_io_status, requests)
    }

    fn vpp_init(&mut self, params: &VideoParams) -> Status {
        let mut state = self.state.borrow_mut();
        state.calls.push("vpp_init");
        state.vpp_params = Some(params.clone());
        Status::None
    }

    fn vpp_reset(&mut self, params: &VideoParams) -> Status {
        let mut state = self.state.borrow_mut();
        state.calls.push("vpp_reset");
        state.vpp_params = Some(params.clone());
        Status::None
    }

    fn vpp_close(&mut self) -> Status {
        self.state.borrow_mut().calls.push("vpp_close");
        Status::None
    }

    fn vpp_run_frame_async(
        &mut self,
        input: &PooledSurface,
        output: &PooledSurface,
    ) -> Submission {
        let mut state = self.state.borrow_mut();
        state.calls.push("vpp_run_frame_async");

        if state.vpp_busy > 0 {
            state.vpp_busy -= 1;
            return Submission::status(Status::DeviceBusy);
        }
        if state.vpp_more_data > 0 {
            state.vpp_more_data -= 1;
            return Submission::status(Status::MoreData);
        }

        output.set_frame_order(input.frame_order());
        output.set_corruption(input.corruption());

        let sync_point = state.next_sync_point();
        self.vpp_outputs += 1;
        if self.vpp_outputs < state.vpp_outputs_per_input {
            Submission::completed(Status::MoreSurface, output.id(), sync_point)
        } else {
            self.vpp_outputs = 0;
            Submission::completed(Status::None, output.id(), sync_point)
        }
    }

    fn sync_operation(&mut self, _: SyncPoint, _: Duration) -> Status {
        let mut state = self.state.borrow_mut();
        state.calls.push("sync_operation");

        if state.in_execution > 0 {
            state.in_execution -= 1;
            return Status::InExecution;
        }

        state.sync_failure.take().unwrap_or(Status::None)
    }
}

/// Dummy provider, handing out [`DummySession`]s and fake device memory.
#[derive(Default)]
pub struct DummyProvider {
    state: Rc<RefCell<DummyState>>,
}

impl DummyProvider {
    /// The state shared with all the sessions of this provider.
    pub fn state(&self) -> &Rc<RefCell<DummyState>> {
        &self.state
    }
}

impl SessionProvider for DummyProvider {
    type Session = DummySession;

    fn create_session(&mut self) -> anyhow::Result<DummySession> {
        self.state.borrow_mut().sessions_created += 1;

        Ok(DummySession {
            state: Rc::clone(&self.state),
            held: Default::default(),
            vpp_outputs: 0,
        })
    }

    fn platform(&self) -> Platform {
        self.state.borrow().platform
    }

    fn alloc_frames(
        &mut self,
        task: TaskId,
        request: &AllocRequest,
    ) -> anyhow::Result<AllocResponse> {
        let mut state = self.state.borrow_mut();
        if std::mem::take(&mut state.alloc_failure) {
            return Err(anyhow!("out of device memory"));
        }

        let count = request.num_frame_suggested as u64;
        let first = state.next_mem;
        state.next_mem += count;
        state.live_frames += count as usize;

        let response = AllocResponse {
            task,
            mem_ids: (first..first + count).map(MemId).collect(),
        };
        state.allocations.push(response.clone());

        Ok(response)
    }

    fn free_frames(&mut self, response: &AllocResponse) {
        let mut state = self.state.borrow_mut();
        state.live_frames = state.live_frames.saturating_sub(response.num_frames());
        state.frees.push(response.clone());
    }
}
