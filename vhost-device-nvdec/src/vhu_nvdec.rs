// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    convert,
    io::{self, Result as IoResult},
    mem::size_of,
    sync::Arc,
};

use log::{debug, error, warn};
use thiserror::Error as ThisError;
use vhost::vhost_user::message::{VhostUserProtocolFeatures, VhostUserVirtioFeatures};
use vhost_user_backend::{VhostUserBackendMut, VringRwLock, VringT};
use virtio_bindings::bindings::{
    virtio_config::{VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_F_VERSION_1},
    virtio_ring::{VIRTIO_RING_F_EVENT_IDX, VIRTIO_RING_F_INDIRECT_DESC},
};
use virtio_queue::{DescriptorChain, QueueOwnedT};
use vm_memory::{
    ByteValued, Bytes, GuestAddressSpace, GuestMemoryAtomic, GuestMemoryLoadGuard,
    GuestMemoryMmap, Le32,
};
use vmm_sys_util::{
    epoll::EventSet,
    eventfd::{EventFd, EFD_NONBLOCK},
};

use crate::{
    device::{NvhostNvdec, NVDEC_MAX_CMD_WORDS},
    gpu::GuestGpu,
    ioctl::Ioctl,
    nvmap::NvMapRegistry,
    virtio_nvdec::{virtio_nvdec_ioctl_resp, CmdError, CmdResponse, NvdecCmd},
    NvdecConfig,
};

const COMMAND_Q: u16 = 0;
const NUM_QUEUES: usize = 1;
const QUEUE_SIZE: usize = 1024;

pub type Result<T> = std::result::Result<T, VuNvdecError>;
pub type NvdecDescriptorChain = DescriptorChain<GuestMemoryLoadGuard<GuestMemoryMmap<()>>>;

#[derive(Debug, ThisError)]
pub enum VuNvdecError {
    #[error("Descriptor not found")]
    DescriptorNotFound,
    #[error("Descriptor read failed")]
    DescriptorReadFailed,
    #[error("Descriptor write failed")]
    DescriptorWriteFailed,
    #[error("Notification send failed")]
    SendNotificationFailed,
    #[error("Can't create eventFd")]
    EventFdError,
    #[error("Failed to handle event")]
    HandleEventNotEpollIn,
    #[error("Unknown device event")]
    HandleUnknownEvent,
    #[error("Invalid command type {0:#x}")]
    InvalidCmdType(u32),
    #[error("Invalid descriptor count {0}")]
    UnexpectedDescriptorCount(usize),
    #[error("Invalid descriptor size, expected at least: {0}, found: {1}")]
    UnexpectedMinimumDescriptorSize(usize, usize),
    #[error("Insufficient descriptor size, required: {0}, found: {1}")]
    InsufficientDescriptorSize(usize, usize),
    #[error("Received unexpected readable descriptor at index {0}")]
    UnexpectedReadableDescriptor(usize),
    #[error("Received unexpected write only descriptor at index {0}")]
    UnexpectedWriteOnlyDescriptor(usize),
    #[error("No memory configured")]
    NoMemoryConfigured,
}

impl convert::From<VuNvdecError> for io::Error {
    fn from(e: VuNvdecError) -> Self {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

/// Virtio nvdec configuration space
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub(crate) struct VirtioNvdecConfig {
    version: Le32,
    max_cmd_words: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for VirtioNvdecConfig {}

pub struct VuNvdecBackend {
    config: VirtioNvdecConfig,
    event_idx: bool,
    mem: Option<GuestMemoryAtomic<GuestMemoryMmap>>,
    nvmap: Arc<NvMapRegistry>,
    gpu: Arc<GuestGpu>,
    nvdec: NvhostNvdec<NvMapRegistry, GuestGpu>,
    pub exit_event: EventFd,
}

impl VuNvdecBackend {
    /// Creates a device with a fresh nvmap registry and address space.
    pub fn new(config: &NvdecConfig) -> Result<Self> {
        let nvmap = Arc::new(NvMapRegistry::new());
        let gpu = Arc::new(GuestGpu::new(config.va_start));
        Ok(Self {
            config: VirtioNvdecConfig {
                version: 0.into(),
                max_cmd_words: NVDEC_MAX_CMD_WORDS.into(),
            },
            event_idx: false,
            mem: None,
            nvdec: NvhostNvdec::new(nvmap.clone(), gpu.clone()),
            nvmap,
            gpu,
            exit_event: EventFd::new(EFD_NONBLOCK).map_err(|_| VuNvdecError::EventFdError)?,
        })
    }

    fn handle_cmd(&mut self, cmd: NvdecCmd, output_len: usize) -> CmdResponse {
        let response = match cmd {
            NvdecCmd::NvmapCreate { size } => self
                .nvmap
                .create(size)
                .map(|handle| CmdResponse::NvmapCreate { handle })
                .map_err(CmdError::from),
            NvdecCmd::NvmapAlloc { handle, addr } => self
                .nvmap
                .alloc(handle, addr)
                .map(|_| CmdResponse::OkNoData)
                .map_err(CmdError::from),
            NvdecCmd::NvmapFree { handle } => self
                .nvmap
                .free(handle)
                .map(|_| CmdResponse::OkNoData)
                .map_err(CmdError::from),
            NvdecCmd::Ioctl { command, input } => {
                let mut output = vec![0u8; output_len];
                self.nvdec
                    .ioctl(Ioctl(command), &input, &mut output)
                    .map(|status| CmdResponse::Ioctl { status, output })
                    .map_err(|e| {
                        warn!("ioctl {command:#010x} failed: {e}");
                        CmdError::from(e)
                    })
            }
        };
        response.unwrap_or_else(CmdResponse::Error)
    }

    pub fn process_requests(
        &mut self,
        requests: Vec<NvdecDescriptorChain>,
        vring: &VringRwLock,
    ) -> Result<()> {
        for desc_chain in requests {
            let descriptors: Vec<_> = desc_chain.clone().collect();
            if descriptors.len() != 2 {
                return Err(VuNvdecError::UnexpectedDescriptorCount(descriptors.len()));
            }

            let desc_request = descriptors[0];
            if desc_request.is_write_only() {
                return Err(VuNvdecError::UnexpectedWriteOnlyDescriptor(0));
            }
            let desc_response = descriptors[1];
            if !desc_response.is_write_only() {
                return Err(VuNvdecError::UnexpectedReadableDescriptor(1));
            }

            let mut request = vec![0u8; desc_request.len() as usize];
            desc_chain
                .memory()
                .read_slice(&mut request, desc_request.addr())
                .map_err(|_| VuNvdecError::DescriptorReadFailed)?;

            let write_desc_len = desc_response.len() as usize;
            let response = match NvdecCmd::from_bytes(&request) {
                Err(e) => {
                    warn!("Reading command failed: {e}");
                    CmdResponse::Error(CmdError::InvalidOperation)
                }
                Ok(cmd) => {
                    debug!("Received command: {cmd:?}");
                    // The ioctl output fills whatever follows the response header
                    let output_len =
                        write_desc_len.saturating_sub(size_of::<virtio_nvdec_ioctl_resp>());
                    self.handle_cmd(cmd, output_len)
                }
            };

            let mut response = response.to_bytes();
            if response.len() > write_desc_len {
                error!(
                    "Response of length {} cannot fit into the descriptor size {}",
                    response.len(),
                    write_desc_len
                );
                response = CmdResponse::Error(CmdError::InvalidParameter).to_bytes();
                if response.len() > write_desc_len {
                    return Err(VuNvdecError::InsufficientDescriptorSize(
                        response.len(),
                        write_desc_len,
                    ));
                }
            }

            desc_chain
                .memory()
                .write_slice(&response, desc_response.addr())
                .map_err(|_| VuNvdecError::DescriptorWriteFailed)?;

            if vring
                .add_used(desc_chain.head_index(), response.len() as u32)
                .is_err()
            {
                error!("Couldn't return used descriptors to the ring");
            }
        }
        Ok(())
    }

    fn process_queue(&mut self, vring: &VringRwLock) -> Result<()> {
        let mem = self
            .mem
            .as_ref()
            .ok_or(VuNvdecError::NoMemoryConfigured)?
            .memory();
        let requests: Vec<_> = vring
            .get_mut()
            .get_queue_mut()
            .iter(mem)
            .map_err(|_| VuNvdecError::DescriptorNotFound)?
            .collect();

        debug!("Requests to process: {}", requests.len());
        if requests.is_empty() {
            return Ok(());
        }
        self.process_requests(requests, vring)?;

        // Send notification once all the requests are processed
        vring
            .signal_used_queue()
            .map_err(|_| VuNvdecError::SendNotificationFailed)
    }
}

/// VhostUserBackend trait methods
impl VhostUserBackendMut for VuNvdecBackend {
    type Vring = VringRwLock;
    type Bitmap = ();

    fn num_queues(&self) -> usize {
        NUM_QUEUES
    }

    fn max_queue_size(&self) -> usize {
        QUEUE_SIZE
    }

    fn features(&self) -> u64 {
        1 << VIRTIO_F_VERSION_1
            | 1 << VIRTIO_F_NOTIFY_ON_EMPTY
            | 1 << VIRTIO_RING_F_INDIRECT_DESC
            | 1 << VIRTIO_RING_F_EVENT_IDX
            | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits()
    }

    fn protocol_features(&self) -> VhostUserProtocolFeatures {
        VhostUserProtocolFeatures::MQ | VhostUserProtocolFeatures::CONFIG
    }

    fn set_event_idx(&mut self, enabled: bool) {
        self.event_idx = enabled;
    }

    fn update_memory(&mut self, mem: GuestMemoryAtomic<GuestMemoryMmap>) -> IoResult<()> {
        self.gpu.set_memory(mem.clone());
        self.mem = Some(mem);
        Ok(())
    }

    fn handle_event(
        &mut self,
        device_event: u16,
        evset: EventSet,
        vrings: &[VringRwLock],
        _thread_id: usize,
    ) -> IoResult<()> {
        if evset != EventSet::IN {
            return Err(VuNvdecError::HandleEventNotEpollIn.into());
        }

        match device_event {
            COMMAND_Q => {
                let vring = &vrings[COMMAND_Q as usize];
                if self.event_idx {
                    // vm-virtio's Queue implementation only checks avail_index
                    // once, so to properly support EVENT_IDX we need to keep
                    // calling process_queue() until it stops finding new
                    // requests on the queue.
                    loop {
                        vring.disable_notification().unwrap();
                        self.process_queue(vring)?;
                        if !vring.enable_notification().unwrap() {
                            break;
                        }
                    }
                } else {
                    // Without EVENT_IDX, a single call is enough.
                    self.process_queue(vring)?;
                }
            }

            _ => {
                warn!("unhandled device_event: {device_event}");
                return Err(VuNvdecError::HandleUnknownEvent.into());
            }
        }
        Ok(())
    }

    fn get_config(&self, offset: u32, size: u32) -> Vec<u8> {
        let offset = offset as usize;
        let size = size as usize;
        let buf = self.config.as_slice();

        if offset.saturating_add(size) > buf.len() {
            return Vec::new();
        }

        buf[offset..offset + size].to_vec()
    }

    fn exit_event(&self, _thread_index: usize) -> Option<EventFd> {
        self.exit_event.try_clone().ok()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rstest::*;
    use virtio_bindings::virtio_ring::{VRING_DESC_F_NEXT, VRING_DESC_F_WRITE};
    use virtio_queue::{
        desc::{split::Descriptor as SplitDescriptor, RawDescriptor},
        mock::MockSplitQueue,
        Queue,
    };
    use vm_memory::{Address, GuestAddress};

    use super::*;
    use crate::{
        gpu::DEFAULT_VA_START,
        ioctl::{IoctlMapBuffer, MapBufferEntry, NvResult, NvdecIoctl},
        virtio_nvdec::{
            VIRTIO_NVDEC_CMD_IOCTL, VIRTIO_NVDEC_CMD_NVMAP_ALLOC, VIRTIO_NVDEC_CMD_NVMAP_CREATE,
            VIRTIO_NVDEC_CMD_NVMAP_FREE, VIRTIO_NVDEC_RESP_ERR_INVALID_HANDLE,
            VIRTIO_NVDEC_RESP_ERR_INVALID_IOCTL, VIRTIO_NVDEC_RESP_ERR_INVALID_OPERATION,
            VIRTIO_NVDEC_RESP_ERR_INVALID_PARAMETER, VIRTIO_NVDEC_RESP_OK_IOCTL,
            VIRTIO_NVDEC_RESP_OK_NODATA, VIRTIO_NVDEC_RESP_OK_NVMAP_CREATE,
        },
    };

    const RESPONSE_LEN: u32 = 0x100;

    fn make_backend() -> VuNvdecBackend {
        let config = NvdecConfig::new("/foo/nvdec.sock".into(), DEFAULT_VA_START).unwrap();
        VuNvdecBackend::new(&config).unwrap()
    }

    fn words(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn build_cmd_desc_chain(request: &[u8], response_len: u32) -> NvdecDescriptorChain {
        let mem = &GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap();
        let vq = MockSplitQueue::new(mem, 16);
        let next_addr = vq.desc_table().total_size() + 0x100;

        // Descriptor for the request
        let desc_request = SplitDescriptor::new(
            next_addr,
            request.len() as u32,
            VRING_DESC_F_NEXT as u16,
            1,
        );
        mem.write_slice(request, desc_request.addr()).unwrap();
        vq.desc_table()
            .store(0, RawDescriptor::from(desc_request))
            .unwrap();

        // Descriptor for the response
        let desc_response = SplitDescriptor::new(
            next_addr + 0x200,
            response_len,
            VRING_DESC_F_WRITE as u16,
            0,
        );
        vq.desc_table()
            .store(1, RawDescriptor::from(desc_response))
            .unwrap();

        // Put the descriptor index 0 in the first available ring position.
        mem.write_obj(0u16, vq.avail_addr().unchecked_add(4))
            .unwrap();
        // Set `avail_idx` to 1.
        mem.write_obj(1u16, vq.avail_addr().unchecked_add(2))
            .unwrap();
        // Create descriptor chain from pre-filled memory.
        vq.create_queue::<Queue>()
            .unwrap()
            .iter(GuestMemoryAtomic::new(mem.clone()).memory())
            .unwrap()
            .next()
            .unwrap()
    }

    /// Runs a single request and returns the written response.
    fn run(backend: &mut VuNvdecBackend, request: &[u8], response_len: u32) -> Vec<u8> {
        let mem = GuestMemoryAtomic::new(
            GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap(),
        );
        let vring = VringRwLock::new(mem, 0x1000).unwrap();
        let desc_chain = build_cmd_desc_chain(request, response_len);
        backend
            .process_requests(vec![desc_chain.clone()], &vring)
            .unwrap();

        let descriptors: Vec<_> = desc_chain.clone().collect();
        let mut response = vec![0; descriptors[1].len() as usize];
        desc_chain
            .memory()
            .read_slice(&mut response, descriptors[1].addr())
            .unwrap();
        response
    }

    fn resp_type(response: &[u8]) -> u32 {
        u32::from_le_bytes([response[0], response[1], response[2], response[3]])
    }

    fn nvmap_create(backend: &mut VuNvdecBackend, size: u32) -> u32 {
        let response = run(
            backend,
            &words(&[VIRTIO_NVDEC_CMD_NVMAP_CREATE, 0, size, 0]),
            RESPONSE_LEN,
        );
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_OK_NVMAP_CREATE);
        u32::from_le_bytes([response[8], response[9], response[10], response[11]])
    }

    fn nvmap_alloc_request(handle: u32, addr: u64) -> Vec<u8> {
        words(&[
            VIRTIO_NVDEC_CMD_NVMAP_ALLOC,
            0,
            handle,
            0,
            addr as u32,
            (addr >> 32) as u32,
        ])
    }

    fn ioctl_request(ioctl: NvdecIoctl, input: &[u8]) -> Vec<u8> {
        let mut request = words(&[VIRTIO_NVDEC_CMD_IOCTL, 0, ioctl.command().0, 0]);
        request.extend_from_slice(input);
        request
    }

    fn map_input(handle: u32) -> Vec<u8> {
        let mut input = IoctlMapBuffer {
            num_entries: 1.into(),
            ..Default::default()
        }
        .as_slice()
        .to_vec();
        input.extend_from_slice(
            MapBufferEntry {
                map_handle: handle.into(),
                map_address: 0.into(),
            }
            .as_slice(),
        );
        input
    }

    #[test]
    fn test_nvdec_backend() {
        let mut backend = make_backend();

        assert_eq!(backend.num_queues(), NUM_QUEUES);
        assert_eq!(backend.max_queue_size(), QUEUE_SIZE);
        assert_eq!(backend.features(), 0x171000000);
        assert_eq!(
            backend.protocol_features(),
            VhostUserProtocolFeatures::MQ | VhostUserProtocolFeatures::CONFIG
        );

        let config = backend.get_config(0, 8);
        assert_eq!(config, words(&[0, NVDEC_MAX_CMD_WORDS]));
        assert_eq!(backend.get_config(4, 4), NVDEC_MAX_CMD_WORDS.to_le_bytes());
        assert!(backend.get_config(4, 8).is_empty());

        backend.set_event_idx(true);
        assert!(backend.event_idx);

        assert!(backend.exit_event(0).is_some());

        let mem = GuestMemoryAtomic::new(
            GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap(),
        );
        backend.update_memory(mem.clone()).unwrap();

        let vring = VringRwLock::new(mem, 0x1000).unwrap();
        vring.set_queue_info(0x100, 0x200, 0x300).unwrap();
        vring.set_queue_ready(true);
        let vrings = [vring];

        assert_matches!(
            backend
                .handle_event(0, EventSet::OUT, &vrings, 0)
                .unwrap_err()
                .kind(),
            io::ErrorKind::Other
        );
        assert_matches!(
            backend
                .handle_event(1, EventSet::IN, &vrings, 0)
                .unwrap_err()
                .kind(),
            io::ErrorKind::Other
        );

        // Hit the loop part
        backend.set_event_idx(true);
        backend.handle_event(0, EventSet::IN, &vrings, 0).unwrap();

        // Hit the non-loop part
        backend.set_event_idx(false);
        backend.handle_event(0, EventSet::IN, &vrings, 0).unwrap();
    }

    #[test]
    fn test_process_queue_without_memory() {
        let mut backend = make_backend();
        let mem = GuestMemoryAtomic::new(
            GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap(),
        );
        let vring = VringRwLock::new(mem, 0x1000).unwrap();
        assert_matches!(
            backend.process_queue(&vring),
            Err(VuNvdecError::NoMemoryConfigured)
        );
    }

    #[test]
    fn test_nvmap_commands() {
        let mut backend = make_backend();
        let handle = nvmap_create(&mut backend, 0x1000);
        assert_eq!(handle, 1);

        let response = run(&mut backend, &nvmap_alloc_request(handle, 0x800), RESPONSE_LEN);
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_OK_NODATA);

        // Allocating twice is refused
        let response = run(&mut backend, &nvmap_alloc_request(handle, 0x800), RESPONSE_LEN);
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_ERR_INVALID_OPERATION);

        let free = words(&[VIRTIO_NVDEC_CMD_NVMAP_FREE, 0, handle, 0]);
        let response = run(&mut backend, &free, RESPONSE_LEN);
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_OK_NODATA);
        let response = run(&mut backend, &free, RESPONSE_LEN);
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_ERR_INVALID_HANDLE);

        let response = run(
            &mut backend,
            &words(&[VIRTIO_NVDEC_CMD_NVMAP_CREATE, 0, 0, 0]),
            RESPONSE_LEN,
        );
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_ERR_INVALID_PARAMETER);
    }

    #[rstest]
    #[case::unknown_type(words(&[0x0104, 0]))]
    #[case::short_header(vec![0, 1])]
    #[case::short_body(words(&[VIRTIO_NVDEC_CMD_NVMAP_FREE, 0]))]
    fn test_invalid_commands(#[case] request: Vec<u8>) {
        let mut backend = make_backend();
        let response = run(&mut backend, &request, RESPONSE_LEN);
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_ERR_INVALID_OPERATION);
    }

    #[test]
    fn test_ioctl_map_unmap() {
        let mut backend = make_backend();
        let handle = nvmap_create(&mut backend, 0x1000);
        run(&mut backend, &nvmap_alloc_request(handle, 0x800), RESPONSE_LEN);

        let input = map_input(handle);
        let response_len = (size_of::<virtio_nvdec_ioctl_resp>() + input.len()) as u32;
        let response = run(
            &mut backend,
            &ioctl_request(NvdecIoctl::MapBuffer, &input),
            response_len,
        );
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_OK_IOCTL);
        assert_eq!(&response[8..12], &(NvResult::Success as i32).to_le_bytes());
        assert_eq!(&response[16..28], &input[..12]);
        assert_eq!(&response[28..32], &handle.to_le_bytes());
        assert_eq!(&response[32..36], &(DEFAULT_VA_START as u32).to_le_bytes());
        assert!(backend.nvdec.find_buffer_map(DEFAULT_VA_START).is_some());

        let response = run(
            &mut backend,
            &ioctl_request(NvdecIoctl::UnmapBuffer, &input),
            response_len,
        );
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_OK_IOCTL);
        assert!(response[16..].iter().all(|b| *b == 0));
        assert!(backend.nvdec.find_buffer_map(DEFAULT_VA_START).is_none());
    }

    #[test]
    fn test_ioctl_status() {
        let mut backend = make_backend();
        let response = run(
            &mut backend,
            &ioctl_request(NvdecIoctl::MapBuffer, &map_input(7)),
            RESPONSE_LEN,
        );
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_OK_IOCTL);
        assert_eq!(
            &response[8..12],
            &(NvResult::InvalidInput as i32).to_le_bytes()
        );
    }

    #[test]
    fn test_ioctl_submit() {
        let mut backend = make_backend();
        let mem = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap();
        mem.write_slice(&words(&[0x1abc_0002, 0x6000_0010]), GuestAddress(0x800))
            .unwrap();
        backend.update_memory(GuestMemoryAtomic::new(mem)).unwrap();

        let handle = nvmap_create(&mut backend, 0x100);
        run(&mut backend, &nvmap_alloc_request(handle, 0x800), RESPONSE_LEN);
        run(
            &mut backend,
            &ioctl_request(NvdecIoctl::MapBuffer, &map_input(handle)),
            RESPONSE_LEN,
        );

        // One command buffer of two words, nothing else
        let input = words(&[1, 0, 0, 0, handle, 0, 2]);
        let response = run(
            &mut backend,
            &ioctl_request(NvdecIoctl::Submit, &input),
            RESPONSE_LEN,
        );
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_OK_IOCTL);
        assert_eq!(&response[8..12], &[0; 4]);
        assert_eq!(&response[16..16 + input.len()], &input[..]);
        assert_eq!(backend.gpu.pushed_headers(), 2);
    }

    #[rstest]
    #[case::unknown_ioctl(
        words(&[VIRTIO_NVDEC_CMD_IOCTL, 0, 0xc008_0004, 0]),
        VIRTIO_NVDEC_RESP_ERR_INVALID_IOCTL
    )]
    #[case::malformed_ioctl(
        ioctl_request(NvdecIoctl::Submit, &[1, 0, 0, 0]),
        VIRTIO_NVDEC_RESP_ERR_INVALID_PARAMETER
    )]
    fn test_ioctl_errors(#[case] request: Vec<u8>, #[case] expected: u32) {
        let mut backend = make_backend();
        let response = run(&mut backend, &request, RESPONSE_LEN);
        assert_eq!(resp_type(&response), expected);
    }

    #[test]
    fn test_response_does_not_fit() {
        let mut backend = make_backend();
        // Room for an error header only
        let response = run(
            &mut backend,
            &words(&[VIRTIO_NVDEC_CMD_NVMAP_CREATE, 0, 0x1000, 0]),
            8,
        );
        assert_eq!(resp_type(&response), VIRTIO_NVDEC_RESP_ERR_INVALID_PARAMETER);

        let mem = GuestMemoryAtomic::new(
            GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap(),
        );
        let vring = VringRwLock::new(mem, 0x1000).unwrap();
        let desc_chain =
            build_cmd_desc_chain(&words(&[VIRTIO_NVDEC_CMD_NVMAP_CREATE, 0, 0x1000, 0]), 4);
        assert_matches!(
            backend.process_requests(vec![desc_chain], &vring),
            Err(VuNvdecError::InsufficientDescriptorSize(8, 4))
        );
    }

    // Build just empty descriptors
    struct DescParameters {
        addr: Option<u64>,
        flags: u16,
        len: u32,
    }

    fn build_dummy_desc_chain(parameters: Vec<&DescParameters>) -> NvdecDescriptorChain {
        let mem = &GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap();
        let vq = MockSplitQueue::new(mem, 16);

        for (i, p) in parameters.iter().enumerate() {
            let mut f: u16 = if i == parameters.len() - 1 {
                0
            } else {
                VRING_DESC_F_NEXT as u16
            };
            f |= p.flags;
            let offset = p.addr.unwrap_or(0x100);
            let desc = RawDescriptor::from(SplitDescriptor::new(offset, p.len, f, (i + 1) as u16));
            vq.desc_table().store(i as u16, desc).unwrap();
        }

        // Put the descriptor index 0 in the first available ring position.
        mem.write_obj(0u16, vq.avail_addr().unchecked_add(4))
            .unwrap();
        // Set `avail_idx` to 1.
        mem.write_obj(1u16, vq.avail_addr().unchecked_add(2))
            .unwrap();
        // Create descriptor chain from pre-filled memory
        vq.create_queue::<Queue>()
            .unwrap()
            .iter(GuestMemoryAtomic::new(mem.clone()).memory())
            .unwrap()
            .next()
            .unwrap()
    }

    #[test]
    fn test_process_requests_failure() {
        let mut backend = make_backend();
        let mem = GuestMemoryAtomic::new(
            GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap(),
        );
        let vring = VringRwLock::new(mem, 0x1000).unwrap();
        let default = DescParameters {
            addr: None,
            flags: 0,
            len: 0,
        };
        let write = DescParameters {
            addr: None,
            flags: VRING_DESC_F_WRITE as u16,
            len: 0x10,
        };

        // Descriptor chain size zero, shouldn't fail
        backend
            .process_requests(Vec::<NvdecDescriptorChain>::new(), &vring)
            .unwrap();

        let desc_chain = build_dummy_desc_chain(vec![&default]);
        assert_matches!(
            backend.process_requests(vec![desc_chain], &vring),
            Err(VuNvdecError::UnexpectedDescriptorCount(1))
        );

        let desc_chain = build_dummy_desc_chain(vec![&default, &default, &default]);
        assert_matches!(
            backend.process_requests(vec![desc_chain], &vring),
            Err(VuNvdecError::UnexpectedDescriptorCount(3))
        );

        let desc_chain = build_dummy_desc_chain(vec![&write, &write]);
        assert_matches!(
            backend.process_requests(vec![desc_chain], &vring),
            Err(VuNvdecError::UnexpectedWriteOnlyDescriptor(0))
        );

        let desc_chain = build_dummy_desc_chain(vec![&default, &default]);
        assert_matches!(
            backend.process_requests(vec![desc_chain], &vring),
            Err(VuNvdecError::UnexpectedReadableDescriptor(1))
        );

        // Invalid request address.
        let desc_chain = build_dummy_desc_chain(vec![
            &DescParameters {
                addr: Some(0x10000),
                flags: 0,
                len: 8,
            },
            &write,
        ]);
        assert_matches!(
            backend.process_requests(vec![desc_chain], &vring),
            Err(VuNvdecError::DescriptorReadFailed)
        );

        // Invalid response address.
        let desc_chain = build_dummy_desc_chain(vec![
            &DescParameters {
                addr: None,
                flags: 0,
                len: 8,
            },
            &DescParameters {
                addr: Some(0x10000),
                flags: VRING_DESC_F_WRITE as u16,
                len: 0x10,
            },
        ]);
        assert_matches!(
            backend.process_requests(vec![desc_chain], &vring),
            Err(VuNvdecError::DescriptorWriteFailed)
        );
    }
}
