// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{mem::size_of, sync::Arc};

use log::{debug, error, warn};
use vm_memory::Le32;

use crate::{
    buffer_map::{BufferMap, BufferMapTable},
    gpu::{ChCommandHeader, Gpu},
    ioctl::{
        CommandBuffer, Fence, Ioctl, IoctlGetSyncpoint, IoctlGetWaitbase, IoctlMapBuffer,
        IoctlReader, IoctlSetNvmapFd, IoctlSubmit, IoctlWriter, MapBufferEntry, NvResult,
        NvdecError, NvdecIoctl, Reloc, Result, SyncptIncr,
    },
    nvmap::{NvMap, NvMapStatus},
};

/// Largest number of command words accepted in a single submit, summed
/// over all of its command buffers.
pub const NVDEC_MAX_CMD_WORDS: u32 = 0x10_0000;

/// The nvdec channel of one guest session.
///
/// Syncpoints and fences are not tracked: queries report 0 and the fences
/// of a submit are only validated.
pub struct NvhostNvdec<M: NvMap, G: Gpu> {
    nvmap: Arc<M>,
    gpu: Arc<G>,
    nvmap_fd: u32,
    submit_timeout: Vec<u8>,
    buffer_mappings: BufferMapTable,
}

impl<M: NvMap, G: Gpu> NvhostNvdec<M, G> {
    pub fn new(nvmap: Arc<M>, gpu: Arc<G>) -> Self {
        Self {
            nvmap,
            gpu,
            nvmap_fd: 0,
            submit_timeout: Vec::new(),
            buffer_mappings: BufferMapTable::new(),
        }
    }

    pub fn nvmap_fd(&self) -> u32 {
        self.nvmap_fd
    }

    pub fn submit_timeout(&self) -> &[u8] {
        &self.submit_timeout
    }

    pub fn buffer_mappings(&self) -> &BufferMapTable {
        &self.buffer_mappings
    }

    pub fn find_buffer_map(&self, gpu_addr: u64) -> Option<BufferMap> {
        self.buffer_mappings.find(gpu_addr)
    }

    /// Runs the operation selected by `command`.
    pub fn ioctl(&mut self, command: Ioctl, input: &[u8], output: &mut [u8]) -> Result<NvResult> {
        let ioctl =
            NvdecIoctl::from_command(command).ok_or(NvdecError::UnknownIoctl(command.0))?;
        debug!(
            "{ioctl:?}: size={:#x} direction={:?} input={:#x} output={:#x}",
            command.size(),
            command.direction(),
            input.len(),
            output.len()
        );
        match ioctl {
            NvdecIoctl::SetNvmapFd => self.set_nvmap_fd(input),
            NvdecIoctl::Submit => self.submit(input, output),
            NvdecIoctl::GetSyncpoint => self.get_syncpoint(input, output),
            NvdecIoctl::GetWaitbase => self.get_waitbase(input, output),
            NvdecIoctl::MapBuffer => self.map_buffer(input, output),
            NvdecIoctl::UnmapBuffer => self.unmap_buffer(input, output),
            NvdecIoctl::SetSubmitTimeout => self.set_submit_timeout(input),
        }
    }

    pub fn set_nvmap_fd(&mut self, input: &[u8]) -> Result<NvResult> {
        let params: IoctlSetNvmapFd = IoctlReader::new(input).read_obj()?;
        debug!("called, fd={}", u32::from(params.nvmap_fd));

        self.nvmap_fd = params.nvmap_fd.into();
        Ok(NvResult::Success)
    }

    pub fn submit(&mut self, input: &[u8], output: &mut [u8]) -> Result<NvResult> {
        let mut reader = IoctlReader::new(input);
        let params: IoctlSubmit = reader.read_obj()?;
        debug!(
            "called NVDEC Submit, cmd_buffer_count={}",
            u32::from(params.cmd_buffer_count)
        );
        reader.require(params.payload_len())?;
        IoctlWriter::new(output).require(params.writeback_len())?;

        let relocation_count = params.relocation_count.into();
        let syncpoint_count = params.syncpoint_count.into();
        let command_buffers: Vec<CommandBuffer> =
            reader.read_vec(params.cmd_buffer_count.into())?;
        let relocs: Vec<Reloc> = reader.read_vec(relocation_count)?;
        let reloc_shifts: Vec<Le32> = reader.read_vec(relocation_count)?;
        let syncpt_increments: Vec<SyncptIncr> = reader.read_vec(syncpoint_count)?;
        let wait_checks: Vec<SyncptIncr> = reader.read_vec(syncpoint_count)?;
        // TODO: Use the fences to track syncpoint max values once syncpoints
        // are emulated.
        let _fences: Vec<Fence> = reader.read_vec(params.fence_count.into())?;

        let words: u64 = command_buffers
            .iter()
            .map(|cmd_buffer| u64::from(u32::from(cmd_buffer.word_count)))
            .sum();
        if words > u64::from(NVDEC_MAX_CMD_WORDS) {
            return Err(NvdecError::CommandListTooLarge {
                words,
                max: NVDEC_MAX_CMD_WORDS,
            });
        }

        for cmd_buffer in &command_buffers {
            let handle = u32::from(cmd_buffer.memory_id);
            let Some(object) = self.nvmap.get_object(handle) else {
                error!("invalid cmd_buffer nvmap_handle={handle:#x}");
                return Ok(NvResult::InvalidInput);
            };
            let (cpu_addr, dma_map_addr) = {
                let object = object.read().unwrap();
                (object.cpu_addr, u64::from(object.dma_map_addr))
            };
            let Some(map) = self.buffer_mappings.find(dma_map_addr) else {
                error!("Tried to submit an invalid offset {cpu_addr:#x} dma {dma_map_addr:#x}");
                return Ok(NvResult::Success);
            };

            let word_count = u32::from(cmd_buffer.word_count) as usize;
            let mut cmdlist = vec![0u8; word_count * size_of::<u32>()];
            self.gpu.read_block(
                map.start_addr + u64::from(u32::from(cmd_buffer.offset)),
                &mut cmdlist,
            );
            self.gpu
                .push_command_list(ChCommandHeader::from_le_bytes(&cmdlist));
        }

        let mut writer = IoctlWriter::new(output);
        writer.write_obj(&params)?;
        writer.write_slice(&command_buffers)?;
        writer.write_slice(&relocs)?;
        writer.write_slice(&reloc_shifts)?;
        writer.write_slice(&syncpt_increments)?;
        writer.write_slice(&wait_checks)?;

        Ok(NvResult::Success)
    }

    pub fn get_syncpoint(&self, input: &[u8], output: &mut [u8]) -> Result<NvResult> {
        let mut params: IoctlGetSyncpoint = IoctlReader::new(input).read_obj()?;
        debug!("called GetSyncpoint, id={}", u32::from(params.param));

        // Syncpoints are not emulated
        params.value = 0.into();
        IoctlWriter::new(output).write_obj(&params)?;
        Ok(NvResult::Success)
    }

    pub fn get_waitbase(&self, input: &[u8], output: &mut [u8]) -> Result<NvResult> {
        let mut params: IoctlGetWaitbase = IoctlReader::new(input).read_obj()?;
        params.value = 0.into();
        IoctlWriter::new(output).write_obj(&params)?;
        Ok(NvResult::Success)
    }

    pub fn map_buffer(&mut self, input: &[u8], output: &mut [u8]) -> Result<NvResult> {
        let mut reader = IoctlReader::new(input);
        let params: IoctlMapBuffer = reader.read_obj()?;
        reader.require(params.payload_len())?;
        IoctlWriter::new(output).require(params.payload_len())?;
        let mut entries: Vec<MapBufferEntry> = reader.read_vec(params.num_entries.into())?;

        for entry in entries.iter_mut() {
            let handle = u32::from(entry.map_handle);
            let Some(object) = self.nvmap.get_object(handle) else {
                error!("invalid cmd_buffer nvmap_handle={handle:#x}");
                IoctlWriter::new(output).write_obj(&params)?;
                return Ok(NvResult::InvalidInput);
            };
            let mut object = object.write().unwrap();

            if object.dma_map_addr == 0 {
                let size = u64::from(object.size);
                let addr = self.gpu.allocate_32bit(object.cpu_addr, size);
                object.dma_map_addr = u32::try_from(addr).unwrap_or_else(|_| {
                    error!("allocation at {addr:#x} is outside of the 32-bit space");
                    self.gpu.unmap(addr, size);
                    0
                });
            }

            if object.dma_map_addr == 0 {
                error!("failed to map size={:#x}", object.size);
            } else {
                entry.map_address = object.dma_map_addr.into();
                self.buffer_mappings.insert_or_replace(
                    object.dma_map_addr.into(),
                    object.size.into(),
                    object.cpu_addr,
                    object.status == NvMapStatus::Allocated,
                );
            }
        }

        let mut writer = IoctlWriter::new(output);
        writer.write_obj(&params)?;
        writer.write_slice(&entries)?;
        Ok(NvResult::Success)
    }

    pub fn unmap_buffer(&mut self, input: &[u8], output: &mut [u8]) -> Result<NvResult> {
        let mut reader = IoctlReader::new(input);
        let params: IoctlMapBuffer = reader.read_obj()?;
        reader.require(params.payload_len())?;
        IoctlWriter::new(output).require(params.payload_len())?;
        let entries: Vec<MapBufferEntry> = reader.read_vec(params.num_entries.into())?;

        for entry in &entries {
            let handle = u32::from(entry.map_handle);
            let Some(object) = self.nvmap.get_object(handle) else {
                error!("invalid cmd_buffer nvmap_handle={handle:#x}");
                IoctlWriter::new(output).write_obj(&params)?;
                return Ok(NvResult::InvalidInput);
            };
            let mut object = object.write().unwrap();

            let dma_map_addr = u64::from(object.dma_map_addr);
            match self.buffer_mappings.remove(dma_map_addr) {
                Some(size) => self.gpu.unmap(dma_map_addr, size),
                // Frequent and harmless
                None => debug!(
                    "invalid offset={:#x} dma={dma_map_addr:#x}",
                    object.cpu_addr
                ),
            }
            object.dma_map_addr = 0;
        }

        output.fill(0);
        Ok(NvResult::Success)
    }

    pub fn set_submit_timeout(&mut self, input: &[u8]) -> Result<NvResult> {
        self.submit_timeout = input.to_vec();
        warn!("(STUBBED) called");
        Ok(NvResult::Success)
    }
}
