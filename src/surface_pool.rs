// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use bitflags::bitflags;

use crate::params::AllocResponse;
use crate::params::FrameInfo;
use crate::params::MemId;
use crate::task::Task;

bitflags! {
    /// Corruption the hardware detected while producing a surface.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Corruption: u16 {
        const MINOR = 0x0001;
        const MAJOR = 0x0002;
        const ABSENT_TOP_FIELD = 0x0004;
        const ABSENT_BOTTOM_FIELD = 0x0008;
        const REFERENCE_FRAME = 0x0010;
        const REFERENCE_LIST = 0x0020;
    }
}

/// Stable index of a surface inside its pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceId(pub usize);

#[derive(Debug)]
struct Slot {
    /// Device memory backing the surface, `None` for system memory.
    mem_id: Option<MemId>,
    /// Number of live `PooledSurface` handles on this surface.
    handles: usize,
    corruption: Corruption,
    frame_order: u32,
}

impl Slot {
    fn new(mem_id: Option<MemId>) -> Self {
        Self {
            mem_id,
            handles: 0,
            corruption: Corruption::empty(),
            frame_order: 0,
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    info: FrameInfo,
    /// Device memory pools are fixed by their allocation, system memory pools grow on demand.
    growable: bool,
    slots: Vec<Slot>,
}

/// A surface leased from a [`SurfacePool`].
///
/// Handles are reference counted: cloning one gives another reference to the same surface, and
/// the surface becomes free again once the last handle is dropped, provided the pool still
/// exists.
#[derive(Debug)]
pub struct PooledSurface {
    id: SurfaceId,
    pool: Weak<RefCell<PoolInner>>,
}

impl PooledSurface {
    fn new(id: SurfaceId, pool: &Rc<RefCell<PoolInner>>) -> Self {
        pool.borrow_mut().slots[id.0].handles += 1;

        Self {
            id,
            pool: Rc::downgrade(pool),
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// Runs `f` on the slot of this surface, if the pool still exists.
    fn with_slot<R>(&self, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let pool = self.pool.upgrade()?;
        let mut pool = pool.borrow_mut();
        pool.slots.get_mut(self.id.0).map(f)
    }

    /// Layout of the surface. Surfaces whose pool is gone report a default layout.
    pub fn info(&self) -> FrameInfo {
        self.pool
            .upgrade()
            .map(|p| p.borrow().info)
            .unwrap_or_default()
    }

    pub fn mem_id(&self) -> Option<MemId> {
        self.with_slot(|s| s.mem_id).flatten()
    }

    pub fn corruption(&self) -> Corruption {
        self.with_slot(|s| s.corruption).unwrap_or_default()
    }

    pub fn set_corruption(&self, corruption: Corruption) {
        self.with_slot(|s| s.corruption = corruption);
    }

    pub fn frame_order(&self) -> u32 {
        self.with_slot(|s| s.frame_order).unwrap_or_default()
    }

    pub fn set_frame_order(&self, frame_order: u32) {
        self.with_slot(|s| s.frame_order = frame_order);
    }

    /// Number of live handles on this surface, including `self`.
    pub fn ref_count(&self) -> usize {
        self.with_slot(|s| s.handles).unwrap_or(1)
    }

    /// Whether `self` and `other` refer to the same surface of the same pool.
    pub fn same_surface(&self, other: &PooledSurface) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.pool, &other.pool)
    }
}

impl Clone for PooledSurface {
    fn clone(&self) -> Self {
        self.with_slot(|s| s.handles += 1);

        Self {
            id: self.id,
            pool: Weak::clone(&self.pool),
        }
    }
}

impl Drop for PooledSurface {
    fn drop(&mut self) {
        self.with_slot(|s| s.handles = s.handles.saturating_sub(1));
    }
}

/// A set of hardware surfaces of identical layout, lent out as [`PooledSurface`]s.
///
/// Surfaces are addressed by a stable [`SurfaceId`], which is what the hardware reports when a
/// submission completes. [`SurfacePool::find_surface`] resolves it back to a handle.
#[derive(Clone, Debug)]
pub struct SurfacePool(Rc<RefCell<PoolInner>>);

impl SurfacePool {
    /// Creates a pool of `count` system memory surfaces. The pool grows if more surfaces are
    /// needed.
    pub fn new(info: FrameInfo, count: usize) -> Self {
        let slots = (0..count).map(|_| Slot::new(None)).collect();

        Self(Rc::new(RefCell::new(PoolInner {
            info,
            growable: true,
            slots,
        })))
    }

    /// Creates a pool over the device frames of `response`. The pool never grows.
    pub fn from_response(info: FrameInfo, response: &AllocResponse) -> Self {
        let slots = response
            .mem_ids
            .iter()
            .map(|id| Slot::new(Some(*id)))
            .collect();

        Self(Rc::new(RefCell::new(PoolInner {
            info,
            growable: false,
            slots,
        })))
    }

    /// Creates the pool of `task`, from its allocation request and published parameters.
    ///
    /// `response` must be given when the task uses video memory.
    pub fn with_task(task: &Task, info: FrameInfo, response: Option<&AllocResponse>) -> Self {
        match response {
            Some(response) if !task.memtype_is_system() => Self::from_response(info, response),
            _ => Self::new(info, task.request().num_frame_suggested as usize),
        }
    }

    /// Leases a free surface. Returns `None` if all surfaces are in use and the pool cannot
    /// grow.
    pub fn lease(&self) -> Option<PooledSurface> {
        let id = {
            let mut inner = self.0.borrow_mut();
            match inner.slots.iter().position(|s| s.handles == 0) {
                Some(pos) => pos,
                None if inner.growable => {
                    inner.slots.push(Slot::new(None));
                    log::debug!("growing surface pool to {} surfaces", inner.slots.len());
                    inner.slots.len() - 1
                }
                None => return None,
            }
        };

        {
            let mut inner = self.0.borrow_mut();
            let slot = &mut inner.slots[id];
            slot.corruption = Corruption::empty();
        }

        Some(PooledSurface::new(SurfaceId(id), &self.0))
    }

    /// Returns a new handle to the surface identified by `id`.
    pub fn find_surface(&self, id: SurfaceId) -> Option<PooledSurface> {
        if id.0 >= self.0.borrow().slots.len() {
            return None;
        }

        Some(PooledSurface::new(id, &self.0))
    }

    pub fn info(&self) -> FrameInfo {
        self.0.borrow().info
    }

    /// Number of surfaces not referenced by any handle.
    pub fn num_free_surfaces(&self) -> usize {
        self.0.borrow().slots.iter().filter(|s| s.handles == 0).count()
    }

    pub fn num_managed_surfaces(&self) -> usize {
        self.0.borrow().slots.len()
    }

    /// Whether `surface` was leased from this pool.
    pub fn owns(&self, surface: &PooledSurface) -> bool {
        Weak::ptr_eq(&surface.pool, &Rc::downgrade(&self.0))
    }
}
