// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tasks and the aggregator handing them out.
//!
//! A [`Task`] is the role a hardware unit plays in the pipeline (decoder, post-processing input
//! or output, encoder). Cooperating stages share tasks to publish their parameters and frame
//! requirements to one another: a post-processing stage fed by a decoder registers its input
//! requirements on the decoder task, a decoder learns from its task that a downstream peer wants
//! system memory, and so on.
//!
//! The [`TaskAggregator`] owns the [`SessionProvider`] and tracks which task is the current
//! target of device frame allocations.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use thiserror::Error;

use crate::backend::Platform;
use crate::backend::SessionProvider;
use crate::params::AllocRequest;
use crate::params::AllocResponse;
use crate::params::IoPattern;
use crate::params::MemType;
use crate::params::VideoParams;

bitflags! {
    /// Roles a task plays. A task shared by two stages carries both roles.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct TaskType: u8 {
        const DECODER = 0x01;
        const VPP_IN = 0x02;
        const VPP_OUT = 0x04;
        const ENCODER = 0x08;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no task is the current allocation target")]
    NoCurrentTask,
    #[error("frames of task {owner:?} freed while task {current:?} is the allocation target")]
    MisdirectedFree {
        owner: TaskId,
        current: Option<TaskId>,
    },
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug)]
struct TaskInner {
    id: TaskId,
    task_type: TaskType,
    params: Option<VideoParams>,
    request: AllocRequest,
    memtype_is_system: bool,
}

/// A pipeline role, shared between the stages that cooperate on it.
#[derive(Clone, Debug)]
pub struct Task(Rc<RefCell<TaskInner>>);

impl Task {
    fn new(id: TaskId, task_type: TaskType) -> Self {
        Self(Rc::new(RefCell::new(TaskInner {
            id,
            task_type,
            params: None,
            request: Default::default(),
            memtype_is_system: false,
        })))
    }

    pub fn id(&self) -> TaskId {
        self.0.borrow().id
    }

    pub fn task_type(&self) -> TaskType {
        self.0.borrow().task_type
    }

    pub fn set_task_type(&self, task_type: TaskType) {
        self.0.borrow_mut().task_type = task_type;
    }

    /// Whether this task plays (at least) the `task_type` role.
    pub fn has_type(&self, task_type: TaskType) -> bool {
        self.0.borrow().task_type.contains(task_type)
    }

    /// The parameters published for this task, if any.
    pub fn video_params(&self) -> Option<VideoParams> {
        self.0.borrow().params.clone()
    }

    pub fn set_video_params(&self, params: &VideoParams) {
        self.0.borrow_mut().params = Some(params.clone());
    }

    /// Applies to `params` the changes a peer stage made to the published parameters of this
    /// task, i.e. the memory types it negotiated.
    pub fn update_video_params(&self, params: &mut VideoParams) {
        let inner = self.0.borrow();
        if let Some(published) = &inner.params {
            params.io_pattern = published.io_pattern;
        }
    }

    /// Changes the I/O pattern of the published parameters, if any were published.
    pub fn set_io_pattern(&self, io_pattern: IoPattern) {
        if let Some(params) = &mut self.0.borrow_mut().params {
            params.io_pattern = io_pattern;
        }
    }

    pub fn request(&self) -> AllocRequest {
        self.0.borrow().request
    }

    pub fn set_request(&self, request: &AllocRequest) {
        self.0.borrow_mut().request = *request;
    }

    /// Adds the requirements of another stage to the request of this task.
    pub fn merge_request(&self, request: &AllocRequest, from: MemType) {
        self.0.borrow_mut().request.merge(request, from);
    }

    pub fn memtype_is_system(&self) -> bool {
        self.0.borrow().memtype_is_system
    }

    /// Switches the output of this task to system memory.
    pub fn ensure_memtype_is_system(&self) {
        let mut inner = self.0.borrow_mut();
        inner.memtype_is_system = true;

        let request = &mut inner.request;
        request.mem_type.remove(
            MemType::VIDEO_MEMORY_DECODER_TARGET | MemType::VIDEO_MEMORY_PROCESSOR_TARGET,
        );
        request.mem_type.insert(MemType::SYSTEM_MEMORY);

        if let Some(params) = &mut inner.params {
            params.io_pattern.remove(IoPattern::OUT_VIDEO_MEMORY);
            params.io_pattern.insert(IoPattern::OUT_SYSTEM_MEMORY);
        }
    }

    /// Switches the output of this task to video memory.
    pub fn use_video_memory(&self) {
        let mut inner = self.0.borrow_mut();
        inner.memtype_is_system = false;

        let task_type = inner.task_type;
        let request = &mut inner.request;
        if request.mem_type.contains(MemType::SYSTEM_MEMORY) {
            request.mem_type.remove(MemType::SYSTEM_MEMORY);
            request.mem_type.insert(if task_type.contains(TaskType::DECODER) {
                MemType::VIDEO_MEMORY_DECODER_TARGET
            } else {
                MemType::VIDEO_MEMORY_PROCESSOR_TARGET
            });
        }
    }
}

/// Shared handle to a [`TaskAggregator`].
pub type SharedAggregator<P> = Rc<RefCell<TaskAggregator<P>>>;

/// Shared handle to a session, used by all the stages of a task.
pub type SharedSession<S> = Rc<RefCell<S>>;

/// Hands out tasks and sessions, and routes device frame allocations to the current task.
pub struct TaskAggregator<P: SessionProvider> {
    provider: P,
    current: Option<TaskId>,
    next_id: u32,
}

impl<P: SessionProvider> TaskAggregator<P> {
    pub fn new(provider: P) -> SharedAggregator<P> {
        Rc::new(RefCell::new(Self {
            provider,
            current: None,
            next_id: 1,
        }))
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn platform(&self) -> Platform {
        self.provider.platform()
    }

    /// Creates a task of `task_type` on a new session.
    pub fn create_task(
        &mut self,
        task_type: TaskType,
    ) -> TaskResult<(Task, SharedSession<P::Session>)> {
        let session = self.provider.create_session()?;
        let task = self.task_with_session(task_type);

        log::debug!("created task {:?} ({:?}) on a new session", task.id(), task_type);

        Ok((task, Rc::new(RefCell::new(session))))
    }

    /// Creates a task of `task_type` running on the session of another task.
    pub fn task_with_session(&mut self, task_type: TaskType) -> Task {
        let id = TaskId(self.next_id);
        self.next_id += 1;

        Task::new(id, task_type)
    }

    /// Makes `task` the target of subsequent frame allocations and releases.
    pub fn set_current_task(&mut self, task: &Task) {
        self.current = Some(task.id());
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current
    }

    /// Allocates device frames for the current task.
    pub fn frame_alloc(&mut self, request: &AllocRequest) -> TaskResult<AllocResponse> {
        let task = self.current.ok_or(TaskError::NoCurrentTask)?;
        let response = self.provider.alloc_frames(task, request)?;

        log::debug!(
            "allocated {} frames for task {:?}",
            response.num_frames(),
            task
        );

        Ok(response)
    }

    /// Releases device frames. The task owning them must be the current task.
    pub fn frame_free(&mut self, response: &AllocResponse) -> TaskResult<()> {
        if self.current != Some(response.task) {
            return Err(TaskError::MisdirectedFree {
                owner: response.task,
                current: self.current,
            });
        }

        self.provider.free_frames(response);
        Ok(())
    }
}
