// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

mod memory_manager;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex, RwLock,
};

use log::{debug, warn};
use num_enum::TryFromPrimitive;
use vm_memory::{GuestAddressSpace, GuestMemoryAtomic, GuestMemoryMmap};

pub use self::memory_manager::{MemoryManager, DEFAULT_VA_START, GPU_PAGE_SIZE, VA_END_32BIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ChSubmissionMode {
    SetClass = 0,
    Incrementing = 1,
    NonIncrementing = 2,
    Mask = 3,
    Immediate = 4,
    Restart = 5,
    Gather = 6,
}

/// One host1x channel command word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChCommandHeader(pub u32);

impl ChCommandHeader {
    pub fn value(self) -> u16 {
        self.0 as u16
    }

    pub fn method_offset(self) -> u16 {
        ((self.0 >> 16) & 0xfff) as u16
    }

    pub fn submission_mode(self) -> Option<ChSubmissionMode> {
        ChSubmissionMode::try_from((self.0 >> 28) as u8).ok()
    }

    /// Splits little-endian command words out of `bytes`.
    pub fn from_le_bytes(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(4)
            .map(|w| Self(u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
            .collect()
    }
}

/// The GPU side nvdec forwards to.
#[cfg_attr(test, mockall::automock)]
pub trait Gpu: Send + Sync {
    /// Maps `size` bytes at `cpu_addr` in the low 4 GiB of the device
    /// address space. Returns 0 on failure.
    fn allocate_32bit(&self, cpu_addr: u64, size: u64) -> u64;
    fn read_block(&self, gpu_addr: u64, dst: &mut [u8]);
    fn unmap(&self, gpu_addr: u64, size: u64);
    fn push_command_list(&self, cmdlist: Vec<ChCommandHeader>);
}

/// [`Gpu`] backed by the memory of the guest driving the device.
pub struct GuestGpu {
    mem: RwLock<Option<GuestMemoryAtomic<GuestMemoryMmap>>>,
    memory_manager: Mutex<MemoryManager>,
    pushed_headers: AtomicUsize,
}

impl GuestGpu {
    pub fn new(va_start: u64) -> Self {
        Self {
            mem: RwLock::new(None),
            memory_manager: Mutex::new(MemoryManager::new(va_start)),
            pushed_headers: AtomicUsize::new(0),
        }
    }

    pub fn set_memory(&self, mem: GuestMemoryAtomic<GuestMemoryMmap>) {
        *self.mem.write().unwrap() = Some(mem);
    }

    /// Number of command headers pushed so far.
    pub fn pushed_headers(&self) -> usize {
        self.pushed_headers.load(Ordering::Relaxed)
    }
}

impl Gpu for GuestGpu {
    fn allocate_32bit(&self, cpu_addr: u64, size: u64) -> u64 {
        self.memory_manager
            .lock()
            .unwrap()
            .allocate_32bit(cpu_addr, size)
            .unwrap_or(0)
    }

    fn read_block(&self, gpu_addr: u64, dst: &mut [u8]) {
        let mem = self.mem.read().unwrap();
        let Some(mem) = mem.as_ref() else {
            warn!("gpu: read_block before guest memory is set");
            return;
        };
        self.memory_manager
            .lock()
            .unwrap()
            .read_block(&*mem.memory(), gpu_addr, dst);
    }

    fn unmap(&self, gpu_addr: u64, size: u64) {
        self.memory_manager.lock().unwrap().unmap(gpu_addr, size);
    }

    fn push_command_list(&self, cmdlist: Vec<ChCommandHeader>) {
        for header in &cmdlist {
            match header.submission_mode() {
                Some(mode) => debug!(
                    "gpu: {mode:?} method={:#x} value={:#x}",
                    header.method_offset(),
                    header.value()
                ),
                None => warn!("gpu: unknown submission mode in {:#010x}", header.0),
            }
        }
        self.pushed_headers.fetch_add(cmdlist.len(), Ordering::Relaxed);
    }
}
