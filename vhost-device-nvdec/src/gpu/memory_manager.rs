// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    collections::BTreeMap,
    ops::Bound::{Excluded, Unbounded},
};

use log::{debug, warn};
use vm_memory::{Bytes, GuestAddress, GuestMemory};

/// Allocation granularity of the device virtual address space.
pub const GPU_PAGE_SIZE: u64 = 0x1_0000;
/// Lowest address handed out by default.
pub const DEFAULT_VA_START: u64 = 0x10_0000;
/// nvdec only addresses the low 32 bits.
pub const VA_END_32BIT: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GpuMapping {
    size: u64,
    cpu_addr: u64,
}

/// Device virtual address space of the nvdec engine.
///
/// Ranges are carved out first-fit, each one translating linearly onto a
/// contiguous guest range.
#[derive(Debug)]
pub struct MemoryManager {
    va_start: u64,
    mappings: BTreeMap<u64, GpuMapping>,
}

impl MemoryManager {
    pub fn new(va_start: u64) -> Self {
        Self {
            va_start,
            mappings: BTreeMap::new(),
        }
    }

    /// Maps `size` bytes of guest memory at `cpu_addr`, below 4 GiB.
    pub fn allocate_32bit(&mut self, cpu_addr: u64, size: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let size = size.checked_next_multiple_of(GPU_PAGE_SIZE)?;

        let mut candidate = self.va_start;
        for (&start, mapping) in &self.mappings {
            if start.saturating_sub(candidate) >= size {
                break;
            }
            candidate = candidate.max(start + mapping.size);
        }
        if candidate.checked_add(size)? > VA_END_32BIT {
            warn!("gpu: out of 32-bit address space for {size:#x} bytes");
            return None;
        }

        self.mappings.insert(candidate, GpuMapping { size, cpu_addr });
        debug!("gpu: mapped {candidate:#x}+{size:#x} -> {cpu_addr:#x}");
        Some(candidate)
    }

    /// Releases every mapping starting within `[gpu_addr, gpu_addr + size)`.
    pub fn unmap(&mut self, gpu_addr: u64, size: u64) -> usize {
        let starts: Vec<u64> = self
            .mappings
            .range(gpu_addr..gpu_addr.saturating_add(size))
            .map(|(start, _)| *start)
            .collect();
        for start in &starts {
            self.mappings.remove(start);
        }
        debug!("gpu: unmapped {} range(s) at {gpu_addr:#x}+{size:#x}", starts.len());
        starts.len()
    }

    /// Returns the guest address behind `gpu_addr` and the number of bytes
    /// left in its mapping from there.
    pub fn translate(&self, gpu_addr: u64) -> Option<(GuestAddress, u64)> {
        let (start, mapping) = self.mappings.range(..=gpu_addr).next_back()?;
        let offset = gpu_addr - start;
        (offset < mapping.size).then(|| {
            (
                GuestAddress(mapping.cpu_addr + offset),
                mapping.size - offset,
            )
        })
    }

    /// Fills `dst` from the guest memory behind `gpu_addr`. Bytes that are
    /// not mapped or not readable keep their previous value.
    pub fn read_block<M: GuestMemory>(&self, mem: &M, gpu_addr: u64, dst: &mut [u8]) {
        let mut done = 0;
        while done < dst.len() {
            let addr = gpu_addr.saturating_add(done as u64);
            let Some((cpu_addr, remaining)) = self.translate(addr) else {
                warn!("gpu: read from unmapped address {addr:#x}");
                // Skip the hole up to the next mapping, if it is in range
                match self.mappings.range((Excluded(addr), Unbounded)).next() {
                    Some((next, _)) if next - addr < (dst.len() - done) as u64 => {
                        done += (next - addr) as usize;
                        continue;
                    }
                    _ => return,
                }
            };

            let len = usize::try_from(remaining)
                .unwrap_or(usize::MAX)
                .min(dst.len() - done);
            if let Err(e) = mem.read_slice(&mut dst[done..done + len], cpu_addr) {
                warn!("gpu: failed to read {len:#x} bytes at {:#x}: {e}", cpu_addr.0);
            }
            done += len;
        }
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_VA_START)
    }
}
