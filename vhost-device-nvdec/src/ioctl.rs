// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::mem::size_of;

use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use thiserror::Error as ThisError;
use vm_memory::{ByteValued, Le32};

pub type Result<T> = std::result::Result<T, NvdecError>;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
/// Errors raised while decoding or dispatching an nvdec ioctl.
pub enum NvdecError {
    #[error("Malformed request, expected at least {expected} bytes, found: {found}")]
    MalformedRequest { expected: usize, found: usize },
    #[error("Output buffer too small, expected at least {expected} bytes, found: {found}")]
    OutputTooSmall { expected: usize, found: usize },
    #[error("Command list of {words} words exceeds the limit of {max}")]
    CommandListTooLarge { words: u64, max: u32 },
    #[error("Unknown ioctl command {0:#010x}")]
    UnknownIoctl(u32),
}

/// Status code returned to the guest for every nvdec ioctl.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum NvResult {
    Success = 0,
    OutOfMemory = -12,
    InvalidInput = -22,
}

impl From<NvResult> for Le32 {
    fn from(val: NvResult) -> Self {
        Le32::from(val as i32 as u32)
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct IoctlDirection: u32 {
        /// Parameters are copied from the guest.
        const IN = 1 << 0;
        /// Parameters are copied back to the guest.
        const OUT = 1 << 1;
    }
}

/// Raw ioctl command word: `nr` in bits 0-7, `group` in 8-15, parameter
/// `size` in 16-29 and the direction in 30-31.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Ioctl(pub u32);

impl Ioctl {
    const GROUP_SHIFT: u32 = 8;
    const SIZE_SHIFT: u32 = 16;
    const SIZE_MASK: u32 = (1 << 14) - 1;
    const DIR_SHIFT: u32 = 30;

    pub const fn new(group: u8, nr: u8, size: u16, direction: IoctlDirection) -> Self {
        Self(
            nr as u32
                | (group as u32) << Self::GROUP_SHIFT
                | (size as u32 & Self::SIZE_MASK) << Self::SIZE_SHIFT
                | direction.bits() << Self::DIR_SHIFT,
        )
    }

    pub const fn nr(self) -> u8 {
        self.0 as u8
    }

    pub const fn group(self) -> u8 {
        (self.0 >> Self::GROUP_SHIFT) as u8
    }

    pub const fn size(self) -> u16 {
        ((self.0 >> Self::SIZE_SHIFT) & Self::SIZE_MASK) as u16
    }

    pub fn direction(self) -> IoctlDirection {
        IoctlDirection::from_bits_truncate(self.0 >> Self::DIR_SHIFT)
    }
}

/// Ioctl group used by the channel operations.
pub const NVHOST_IOCTL_GROUP_CHANNEL: u8 = 0x00;
/// Ioctl group shared by every nvhost device (`'H'`).
pub const NVHOST_IOCTL_GROUP_HOST: u8 = b'H';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvdecIoctl {
    SetNvmapFd,
    Submit,
    GetSyncpoint,
    GetWaitbase,
    SetSubmitTimeout,
    MapBuffer,
    UnmapBuffer,
}

impl NvdecIoctl {
    pub fn from_command(command: Ioctl) -> Option<Self> {
        use NvdecIoctl::*;
        Some(match (command.group(), command.nr()) {
            (NVHOST_IOCTL_GROUP_CHANNEL, 0x01) => Submit,
            (NVHOST_IOCTL_GROUP_CHANNEL, 0x02) => GetSyncpoint,
            (NVHOST_IOCTL_GROUP_CHANNEL, 0x03) => GetWaitbase,
            (NVHOST_IOCTL_GROUP_CHANNEL, 0x07) => SetSubmitTimeout,
            (NVHOST_IOCTL_GROUP_CHANNEL, 0x09) => MapBuffer,
            (NVHOST_IOCTL_GROUP_CHANNEL, 0x0a) => UnmapBuffer,
            (NVHOST_IOCTL_GROUP_HOST, 0x01) => SetNvmapFd,
            _ => return None,
        })
    }

    /// The command word a guest driver issues for this operation.
    pub fn command(self) -> Ioctl {
        use NvdecIoctl::*;
        let inout = IoctlDirection::IN | IoctlDirection::OUT;
        let (group, nr, size, direction) = match self {
            Submit => (NVHOST_IOCTL_GROUP_CHANNEL, 0x01, size_of::<IoctlSubmit>(), inout),
            GetSyncpoint => (
                NVHOST_IOCTL_GROUP_CHANNEL,
                0x02,
                size_of::<IoctlGetSyncpoint>(),
                inout,
            ),
            GetWaitbase => (
                NVHOST_IOCTL_GROUP_CHANNEL,
                0x03,
                size_of::<IoctlGetWaitbase>(),
                inout,
            ),
            SetSubmitTimeout => (
                NVHOST_IOCTL_GROUP_CHANNEL,
                0x07,
                size_of::<u32>(),
                IoctlDirection::IN,
            ),
            MapBuffer => (
                NVHOST_IOCTL_GROUP_CHANNEL,
                0x09,
                size_of::<IoctlMapBuffer>(),
                inout,
            ),
            UnmapBuffer => (
                NVHOST_IOCTL_GROUP_CHANNEL,
                0x0a,
                size_of::<IoctlMapBuffer>(),
                inout,
            ),
            SetNvmapFd => (
                NVHOST_IOCTL_GROUP_HOST,
                0x01,
                size_of::<IoctlSetNvmapFd>(),
                IoctlDirection::IN,
            ),
        };
        Ioctl::new(group, nr, size as u16, direction)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IoctlSetNvmapFd {
    pub nvmap_fd: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for IoctlSetNvmapFd {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IoctlSubmit {
    pub cmd_buffer_count: Le32,
    pub relocation_count: Le32,
    pub syncpoint_count: Le32,
    pub fence_count: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for IoctlSubmit {}

impl IoctlSubmit {
    /// Bytes written back to the guest: the header followed by every
    /// trailing array except the fences.
    pub fn writeback_len(&self) -> usize {
        let relocs = u32::from(self.relocation_count);
        // Increments are followed by as many wait checks.
        let syncpoints = u64::from(u32::from(self.syncpoint_count)) * 2;
        size_of::<Self>()
            .saturating_add(array_len::<CommandBuffer>(u32::from(self.cmd_buffer_count)))
            .saturating_add(array_len::<Reloc>(relocs))
            .saturating_add(array_len::<u32>(relocs))
            .saturating_add(array_len::<SyncptIncr>(syncpoints))
    }

    /// Bytes the guest must supply: the write-back region plus the fences.
    pub fn payload_len(&self) -> usize {
        self.writeback_len()
            .saturating_add(array_len::<Fence>(u32::from(self.fence_count)))
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandBuffer {
    pub memory_id: Le32,
    pub offset: Le32,
    pub word_count: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for CommandBuffer {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Reloc {
    pub cmdbuffer_memory: Le32,
    pub cmdbuffer_offset: Le32,
    pub target: Le32,
    pub target_offset: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for Reloc {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncptIncr {
    pub id: Le32,
    pub increments: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for SyncptIncr {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Fence {
    pub id: Le32,
    pub value: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for Fence {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IoctlGetSyncpoint {
    /// Syncpoint id.
    pub param: Le32,
    pub value: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for IoctlGetSyncpoint {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IoctlGetWaitbase {
    pub unknown: Le32,
    pub value: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for IoctlGetWaitbase {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IoctlMapBuffer {
    pub num_entries: Le32,
    /// Ignored by the device.
    pub data_address: Le32,
    pub attach_host_ch_das: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for IoctlMapBuffer {}

impl IoctlMapBuffer {
    pub fn payload_len(&self) -> usize {
        size_of::<Self>().saturating_add(array_len::<MapBufferEntry>(u32::from(self.num_entries)))
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MapBufferEntry {
    pub map_handle: Le32,
    pub map_address: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for MapBufferEntry {}

fn array_len<T>(count: impl Into<u64>) -> usize {
    usize::try_from(count.into())
        .unwrap_or(usize::MAX)
        .saturating_mul(size_of::<T>())
}

/// Bounds checked cursor over an ioctl input buffer.
pub struct IoctlReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> IoctlReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Checks that the whole buffer holds at least `len` bytes.
    pub fn require(&self, len: usize) -> Result<()> {
        if self.buf.len() < len {
            return Err(NvdecError::MalformedRequest {
                expected: len,
                found: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn read_obj<T: ByteValued + Default>(&mut self) -> Result<T> {
        let end = self.offset.saturating_add(size_of::<T>());
        self.require(end)?;
        let mut obj = T::default();
        obj.as_mut_slice().copy_from_slice(&self.buf[self.offset..end]);
        self.offset = end;
        Ok(obj)
    }

    pub fn read_vec<T: ByteValued + Default>(&mut self, count: u32) -> Result<Vec<T>> {
        self.require(self.offset.saturating_add(array_len::<T>(count)))?;
        (0..count).map(|_| self.read_obj()).collect()
    }
}

/// Bounds checked cursor over an ioctl output buffer.
pub struct IoctlWriter<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> IoctlWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn require(&self, len: usize) -> Result<()> {
        if self.buf.len() < len {
            return Err(NvdecError::OutputTooSmall {
                expected: len,
                found: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn write_obj<T: ByteValued>(&mut self, obj: &T) -> Result<()> {
        let end = self.offset.saturating_add(size_of::<T>());
        self.require(end)?;
        self.buf[self.offset..end].copy_from_slice(obj.as_slice());
        self.offset = end;
        Ok(())
    }

    pub fn write_slice<T: ByteValued>(&mut self, objs: &[T]) -> Result<()> {
        self.require(self.offset.saturating_add(objs.len().saturating_mul(size_of::<T>())))?;
        objs.iter().try_for_each(|obj| self.write_obj(obj))
    }
}
