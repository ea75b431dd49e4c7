// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use log::{debug, warn};
use thiserror::Error as ThisError;

/// nvmap objects are sized in whole pages.
pub const NVMAP_PAGE_SIZE: u32 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum NvMapError {
    #[error("Invalid nvmap handle {0:#x}")]
    InvalidHandle(u32),
    #[error("nvmap handle {0:#x} is already allocated")]
    AlreadyAllocated(u32),
    #[error("Invalid nvmap object size {0:#x}")]
    InvalidSize(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NvMapStatus {
    #[default]
    Created,
    Allocated,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NvMapObject {
    pub id: u32,
    pub size: u32,
    /// Guest address backing the object, valid once allocated.
    pub cpu_addr: u64,
    /// Device virtual address, 0 while the object is not mapped.
    pub dma_map_addr: u32,
    pub status: NvMapStatus,
}

pub type NvMapObjectRef = Arc<RwLock<NvMapObject>>;

/// Resolves guest nvmap handles into memory objects.
pub trait NvMap: Send + Sync {
    fn get_object(&self, handle: u32) -> Option<NvMapObjectRef>;
}

#[derive(Debug)]
struct NvMapObjects {
    next_handle: u32,
    objects: HashMap<u32, NvMapObjectRef>,
}

/// Handle registry backing one nvdec session.
#[derive(Debug)]
pub struct NvMapRegistry {
    inner: RwLock<NvMapObjects>,
}

impl Default for NvMapRegistry {
    fn default() -> Self {
        Self {
            inner: RwLock::new(NvMapObjects {
                // 0 is never a valid handle
                next_handle: 1,
                objects: HashMap::new(),
            }),
        }
    }
}

impl NvMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an unallocated object and returns its handle.
    pub fn create(&self, size: u32) -> Result<u32, NvMapError> {
        let size = size
            .checked_next_multiple_of(NVMAP_PAGE_SIZE)
            .filter(|size| *size != 0)
            .ok_or(NvMapError::InvalidSize(size))?;

        let mut inner = self.inner.write().unwrap();
        let handle = inner.next_handle;
        inner.next_handle = inner.next_handle.wrapping_add(1).max(1);
        inner.objects.insert(
            handle,
            Arc::new(RwLock::new(NvMapObject {
                id: handle,
                size,
                ..Default::default()
            })),
        );
        debug!("nvmap: created handle {handle:#x}, size={size:#x}");
        Ok(handle)
    }

    /// Backs the object with guest memory at `cpu_addr`.
    pub fn alloc(&self, handle: u32, cpu_addr: u64) -> Result<(), NvMapError> {
        let object = self
            .get_object(handle)
            .ok_or(NvMapError::InvalidHandle(handle))?;
        let mut object = object.write().unwrap();
        if object.status == NvMapStatus::Allocated {
            return Err(NvMapError::AlreadyAllocated(handle));
        }
        object.cpu_addr = cpu_addr;
        object.status = NvMapStatus::Allocated;
        debug!("nvmap: allocated handle {handle:#x} at {cpu_addr:#x}");
        Ok(())
    }

    /// Drops the handle. A device mapping of the object is not released.
    pub fn free(&self, handle: u32) -> Result<NvMapObjectRef, NvMapError> {
        let object = self
            .inner
            .write()
            .unwrap()
            .objects
            .remove(&handle)
            .ok_or(NvMapError::InvalidHandle(handle))?;
        {
            let object = object.read().unwrap();
            if object.dma_map_addr != 0 {
                warn!(
                    "nvmap: freeing handle {:#x} still mapped at {:#x}",
                    object.id, object.dma_map_addr
                );
            }
        }
        debug!("nvmap: freed handle {handle:#x}");
        Ok(object)
    }
}

impl NvMap for NvMapRegistry {
    fn get_object(&self, handle: u32) -> Option<NvMapObjectRef> {
        self.inner.read().unwrap().objects.get(&handle).cloned()
    }
}
