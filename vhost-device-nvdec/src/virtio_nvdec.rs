// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
// Struct definitions use the kernel-style naming for consistency
#![allow(non_camel_case_types)]

use std::mem::size_of;

use vm_memory::{ByteValued, Le32, Le64};

use crate::{
    ioctl::{NvResult, NvdecError},
    nvmap::NvMapError,
    vhu_nvdec::{Result, VuNvdecError},
};

/// Virtio nvdec command types
pub(crate) const VIRTIO_NVDEC_CMD_NVMAP_CREATE: u32 = 0x0100;
pub(crate) const VIRTIO_NVDEC_CMD_NVMAP_ALLOC: u32 = 0x0101;
pub(crate) const VIRTIO_NVDEC_CMD_NVMAP_FREE: u32 = 0x0102;
pub(crate) const VIRTIO_NVDEC_CMD_IOCTL: u32 = 0x0103;

/// Virtio nvdec response types
pub(crate) const VIRTIO_NVDEC_RESP_OK_NODATA: u32 = 0x0200;
pub(crate) const VIRTIO_NVDEC_RESP_OK_NVMAP_CREATE: u32 = 0x0201;
pub(crate) const VIRTIO_NVDEC_RESP_OK_IOCTL: u32 = 0x0202;

pub(crate) const VIRTIO_NVDEC_RESP_ERR_INVALID_OPERATION: u32 = 0x0203;
pub(crate) const VIRTIO_NVDEC_RESP_ERR_INVALID_HANDLE: u32 = 0x0204;
pub(crate) const VIRTIO_NVDEC_RESP_ERR_INVALID_IOCTL: u32 = 0x0205;
pub(crate) const VIRTIO_NVDEC_RESP_ERR_INVALID_PARAMETER: u32 = 0x0206;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdError {
    InvalidOperation,
    InvalidHandle,
    InvalidIoctl,
    InvalidParameter,
}

impl From<NvdecError> for CmdError {
    fn from(e: NvdecError) -> Self {
        match e {
            NvdecError::UnknownIoctl(_) => Self::InvalidIoctl,
            NvdecError::MalformedRequest { .. }
            | NvdecError::OutputTooSmall { .. }
            | NvdecError::CommandListTooLarge { .. } => Self::InvalidParameter,
        }
    }
}

impl From<NvMapError> for CmdError {
    fn from(e: NvMapError) -> Self {
        match e {
            NvMapError::InvalidHandle(_) => Self::InvalidHandle,
            NvMapError::AlreadyAllocated(_) => Self::InvalidOperation,
            NvMapError::InvalidSize(_) => Self::InvalidParameter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdResponse {
    OkNoData,
    NvmapCreate { handle: u32 },
    Ioctl { status: NvResult, output: Vec<u8> },
    Error(CmdError),
}

impl CmdResponse {
    fn cmd_type(&self) -> Le32 {
        use CmdResponse::*;
        Le32::from(match self {
            OkNoData => VIRTIO_NVDEC_RESP_OK_NODATA,
            NvmapCreate { .. } => VIRTIO_NVDEC_RESP_OK_NVMAP_CREATE,
            Ioctl { .. } => VIRTIO_NVDEC_RESP_OK_IOCTL,
            Error(e) => match e {
                CmdError::InvalidOperation => VIRTIO_NVDEC_RESP_ERR_INVALID_OPERATION,
                CmdError::InvalidHandle => VIRTIO_NVDEC_RESP_ERR_INVALID_HANDLE,
                CmdError::InvalidIoctl => VIRTIO_NVDEC_RESP_ERR_INVALID_IOCTL,
                CmdError::InvalidParameter => VIRTIO_NVDEC_RESP_ERR_INVALID_PARAMETER,
            },
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        use CmdResponse::*;
        let hdr = virtio_nvdec_cmd_hdr {
            type_: self.cmd_type(),
            ..Default::default()
        };
        let mut response_raw: Vec<u8> = Vec::new();
        match self {
            NvmapCreate { handle } => {
                let response = virtio_nvdec_nvmap_create_resp {
                    hdr,
                    handle: (*handle).into(),
                    ..Default::default()
                };
                response_raw.extend_from_slice(response.as_slice());
            }
            Ioctl { status, output } => {
                let response = virtio_nvdec_ioctl_resp {
                    hdr,
                    status: (*status).into(),
                    ..Default::default()
                };
                response_raw.extend_from_slice(response.as_slice());
                response_raw.extend_from_slice(output);
            }
            OkNoData | Error(_) => response_raw.extend_from_slice(hdr.as_slice()),
        }
        response_raw
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NvdecCmd {
    NvmapCreate { size: u32 },
    NvmapAlloc { handle: u32, addr: u64 },
    NvmapFree { handle: u32 },
    Ioctl { command: u32, input: Vec<u8> },
}

impl NvdecCmd {
    /// Parses the readable part of a request.
    pub fn from_bytes(request: &[u8]) -> Result<Self> {
        use self::NvdecCmd::*;
        let header: virtio_nvdec_cmd_hdr = read_body(request)?;
        Ok(match header.type_.into() {
            VIRTIO_NVDEC_CMD_NVMAP_CREATE => {
                let body: virtio_nvdec_nvmap_create = read_body(request)?;
                NvmapCreate {
                    size: body.size.into(),
                }
            }
            VIRTIO_NVDEC_CMD_NVMAP_ALLOC => {
                let body: virtio_nvdec_nvmap_alloc = read_body(request)?;
                NvmapAlloc {
                    handle: body.handle.into(),
                    addr: body.addr.into(),
                }
            }
            VIRTIO_NVDEC_CMD_NVMAP_FREE => {
                let body: virtio_nvdec_nvmap_free = read_body(request)?;
                NvmapFree {
                    handle: body.handle.into(),
                }
            }
            VIRTIO_NVDEC_CMD_IOCTL => {
                let body: virtio_nvdec_ioctl = read_body(request)?;
                Ioctl {
                    command: body.command.into(),
                    input: request[size_of::<virtio_nvdec_ioctl>()..].to_vec(),
                }
            }
            other => return Err(VuNvdecError::InvalidCmdType(other)),
        })
    }
}

fn read_body<T: ByteValued + Default>(request: &[u8]) -> Result<T> {
    let request_size = size_of::<T>();
    if request.len() < request_size {
        return Err(VuNvdecError::UnexpectedMinimumDescriptorSize(
            request_size,
            request.len(),
        ));
    }
    let mut body = T::default();
    body.as_mut_slice().copy_from_slice(&request[..request_size]);
    Ok(body)
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct virtio_nvdec_cmd_hdr {
    pub type_: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_nvdec_cmd_hdr {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct virtio_nvdec_nvmap_create {
    pub hdr: virtio_nvdec_cmd_hdr,
    pub size: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_nvdec_nvmap_create {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct virtio_nvdec_nvmap_alloc {
    pub hdr: virtio_nvdec_cmd_hdr,
    pub handle: Le32,
    pub padding: Le32,
    pub addr: Le64,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_nvdec_nvmap_alloc {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct virtio_nvdec_nvmap_free {
    pub hdr: virtio_nvdec_cmd_hdr,
    pub handle: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_nvdec_nvmap_free {}

/// Followed by the ioctl input.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct virtio_nvdec_ioctl {
    pub hdr: virtio_nvdec_cmd_hdr,
    pub command: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_nvdec_ioctl {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct virtio_nvdec_nvmap_create_resp {
    pub hdr: virtio_nvdec_cmd_hdr,
    pub handle: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_nvdec_nvmap_create_resp {}

/// Followed by the ioctl output.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct virtio_nvdec_ioctl_resp {
    pub hdr: virtio_nvdec_cmd_hdr,
    pub status: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_nvdec_ioctl_resp {}
