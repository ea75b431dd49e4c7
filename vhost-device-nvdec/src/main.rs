// VIRTIO NVDEC control device via vhost-user
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{num::ParseIntError, path::PathBuf, process::exit};

use clap::Parser;
use log::error;
use vhost_device_nvdec::{gpu::DEFAULT_VA_START, start_backend, NvdecConfig, NvdecConfigError};

fn parse_addr(addr: &str) -> Result<u64, ParseIntError> {
    match addr.strip_prefix("0x").or_else(|| addr.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => addr.replace('_', "").parse(),
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct NvdecArgs {
    /// Location of vhost-user Unix domain socket.
    #[clap(short, long, value_name = "SOCKET")]
    socket_path: PathBuf,

    /// First device virtual address handed out to mapped buffers. Must be a
    /// non zero multiple of 64 KiB below 4 GiB.
    #[clap(
        long,
        value_name = "ADDR",
        value_parser = parse_addr,
        default_value_t = DEFAULT_VA_START
    )]
    va_start: u64,
}

impl TryFrom<NvdecArgs> for NvdecConfig {
    type Error = NvdecConfigError;

    fn try_from(args: NvdecArgs) -> Result<Self, Self::Error> {
        NvdecConfig::new(args.socket_path, args.va_start)
    }
}

fn main() {
    env_logger::init();

    let config = match NvdecConfig::try_from(NvdecArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            exit(1);
        }
    };

    if let Err(e) = start_backend(config) {
        error!("{e}");
        exit(1);
    }
}
