// VIRTIO NVDEC control device via vhost-user
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

pub mod buffer_map;
pub mod device;
pub mod gpu;
pub mod ioctl;
pub mod nvmap;
pub mod vhu_nvdec;
mod virtio_nvdec;

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
    thread::{spawn, JoinHandle},
};

use log::info;
use thiserror::Error as ThisError;
use vhost_user_backend::VhostUserDaemon;
use vhu_nvdec::{VuNvdecBackend, VuNvdecError};
use vm_memory::{GuestMemoryAtomic, GuestMemoryMmap};

use crate::gpu::{GPU_PAGE_SIZE, VA_END_32BIT};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
/// Errors related to the nvdec daemon
pub enum Error {
    #[error("Could not create backend: {0}")]
    CouldNotCreateBackend(VuNvdecError),
    #[error("Could not create daemon: {0}")]
    CouldNotCreateDaemon(vhost_user_backend::Error),
    #[error("Fatal error: {0}")]
    ServeFailed(vhost_user_backend::Error),
}

#[derive(Debug, PartialEq, Eq, ThisError)]
pub enum NvdecConfigError {
    #[error("Device address space can't start at 0")]
    ZeroVaStart,
    #[error("Device address space start {0:#x} is not aligned to 64 KiB")]
    UnalignedVaStart(u64),
    #[error("Device address space start {0:#x} is outside of the 32-bit range")]
    VaStartTooHigh(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvdecConfig {
    pub socket_path: PathBuf,
    /// First device virtual address handed out by map-buffer.
    pub va_start: u64,
}

impl NvdecConfig {
    pub fn new(socket_path: PathBuf, va_start: u64) -> std::result::Result<Self, NvdecConfigError> {
        if va_start == 0 {
            return Err(NvdecConfigError::ZeroVaStart);
        }
        if va_start % GPU_PAGE_SIZE != 0 {
            return Err(NvdecConfigError::UnalignedVaStart(va_start));
        }
        if va_start >= VA_END_32BIT {
            return Err(NvdecConfigError::VaStartTooHigh(va_start));
        }
        Ok(Self {
            socket_path,
            va_start,
        })
    }
}

pub fn start_backend(config: NvdecConfig) -> Result<()> {
    let handle: JoinHandle<Result<()>> = spawn(move || loop {
        // nvmap handles and buffer mappings live for one connection only.
        let backend = Arc::new(RwLock::new(
            VuNvdecBackend::new(&config).map_err(Error::CouldNotCreateBackend)?,
        ));

        let mut daemon = VhostUserDaemon::new(
            String::from("vhost-device-nvdec-backend"),
            backend,
            GuestMemoryAtomic::new(GuestMemoryMmap::new()),
        )
        .map_err(Error::CouldNotCreateDaemon)?;

        info!("Waiting for a connection on {}", config.socket_path.display());
        daemon.serve(&config.socket_path).map_err(Error::ServeFailed)?;
        info!("Connection closed");
    });

    handle.join().map_err(std::panic::resume_unwind).unwrap()
}
