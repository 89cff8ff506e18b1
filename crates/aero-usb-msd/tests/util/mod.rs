#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use aero_usb_msd::wire::{CommandStatusWrapper, CswStatus, CBW_LEN, CDB_LEN};
use aero_usb_msd::{
    ClassHandle, Completion, DeviceHandle, DeviceInfo, Direction, EndpointDescriptor,
    HostHandle, InterfaceDescriptor, MsdConfig, MsdHostDriver, PipeHandle, PipeInit, SetupPacket,
    TransferError, TransferEvent, TransferId, TransferService, TransferStatus,
};

pub const HOST: HostHandle = HostHandle(7);
pub const DEVICE: DeviceHandle = DeviceHandle(3);
pub const CONTROL_PIPE: PipeHandle = PipeHandle(1);
/// Second device on the same host controller as [`DEVICE`].
pub const DEVICE_B: DeviceHandle = DeviceHandle(4);
pub const CONTROL_PIPE_B: PipeHandle = PipeHandle(2);
/// Device behind a second host controller, whose transfer ids overlap [`HOST`]'s.
pub const OTHER_HOST: HostHandle = HostHandle(8);
pub const DEVICE_C: DeviceHandle = DeviceHandle(5);
pub const CONTROL_PIPE_C: PipeHandle = PipeHandle(3);
pub const INTERFACE_NUMBER: u8 = 0;
pub const EP_IN: u8 = 0x81;
pub const EP_OUT: u8 = 0x02;

/// READ(10), LUN 0, one block.
pub const READ10: [u8; CDB_LEN] = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
/// WRITE(10), LUN 0, one block.
pub const WRITE10: [u8; CDB_LEN] = [0x2a, 0, 0, 0, 0, 0, 0, 0, 1, 0];
/// TEST UNIT READY padded to ten bytes.
pub const TEST_UNIT_READY: [u8; CDB_LEN] = [0; CDB_LEN];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    Send {
        pipe: PipeHandle,
        transfer: TransferId,
        data: Vec<u8>,
    },
    Recv {
        pipe: PipeHandle,
        transfer: TransferId,
        len: usize,
    },
    Setup {
        pipe: PipeHandle,
        transfer: TransferId,
        setup: SetupPacket,
    },
}

impl Submission {
    pub fn transfer(&self) -> TransferId {
        match self {
            Submission::Send { transfer, .. }
            | Submission::Recv { transfer, .. }
            | Submission::Setup { transfer, .. } => *transfer,
        }
    }

    pub fn pipe(&self) -> PipeHandle {
        match self {
            Submission::Send { pipe, .. }
            | Submission::Recv { pipe, .. }
            | Submission::Setup { pipe, .. } => *pipe,
        }
    }
}

/// Scripted host controller: records every request and lets the test decide how each transfer
/// finishes.
pub struct MockHost {
    next_transfer: HashMap<HostHandle, u32>,
    free_list: HashMap<HostHandle, Vec<TransferId>>,
    next_pipe: u32,
    pub allocated: HashSet<(HostHandle, TransferId)>,
    pub alloc_count: usize,
    pub freed: Vec<TransferId>,
    pub opened: Vec<(PipeHandle, PipeInit)>,
    pub closed: Vec<PipeHandle>,
    pub cancels: Vec<(PipeHandle, Option<TransferId>)>,
    pub submissions: VecDeque<Submission>,
    pub interfaces_opened: Vec<u8>,
    pub interfaces_closed: Vec<Option<u8>>,
    /// Fail the n-th `open_pipe` call (0-based).
    pub fail_open_pipe_at: Option<usize>,
    pub fail_alloc: bool,
    pub reject_submissions: bool,
    /// Hand freed transfer ids out again, most recently freed first.
    pub reuse_ids: bool,
    pub control_max_packet_size: u16,
}

impl Default for MockHost {
    fn default() -> Self {
        Self {
            next_transfer: HashMap::new(),
            free_list: HashMap::new(),
            next_pipe: 10,
            allocated: HashSet::new(),
            alloc_count: 0,
            freed: Vec::new(),
            opened: Vec::new(),
            closed: Vec::new(),
            cancels: Vec::new(),
            submissions: VecDeque::new(),
            interfaces_opened: Vec::new(),
            interfaces_closed: Vec::new(),
            fail_open_pipe_at: None,
            fail_alloc: false,
            reject_submissions: false,
            reuse_ids: false,
            control_max_packet_size: 64,
        }
    }
}

impl MockHost {
    pub fn pop(&mut self) -> Submission {
        self.submissions
            .pop_front()
            .expect("expected a pending submission")
    }

    pub fn assert_idle(&self) {
        assert!(
            self.submissions.is_empty(),
            "unexpected submissions: {:?}",
            self.submissions
        );
    }

    /// Handle of the currently open bulk pipe for `endpoint_number`/`direction` of [`DEVICE`].
    pub fn pipe_for(&self, endpoint_number: u8, direction: Direction) -> PipeHandle {
        self.device_pipe(DEVICE, endpoint_number, direction)
    }

    pub fn device_pipe(
        &self,
        device: DeviceHandle,
        endpoint_number: u8,
        direction: Direction,
    ) -> PipeHandle {
        self.opened
            .iter()
            .rev()
            .find(|(handle, init)| {
                init.device == device
                    && init.endpoint_number == endpoint_number
                    && init.direction == direction
                    && !self.closed.contains(handle)
            })
            .map(|(handle, _)| *handle)
            .expect("bulk pipe is not open")
    }

    pub fn bulk_in(&self) -> PipeHandle {
        self.pipe_for(EP_IN & 0x0f, Direction::In)
    }

    pub fn bulk_out(&self) -> PipeHandle {
        self.pipe_for(EP_OUT & 0x0f, Direction::Out)
    }

    pub fn live_pipes(&self) -> usize {
        self.opened
            .iter()
            .filter(|(handle, _)| !self.closed.contains(handle))
            .count()
    }
}

impl TransferService for MockHost {
    fn device_info(&self, device: DeviceHandle) -> Option<DeviceInfo> {
        let (host, control_pipe) = match device {
            DEVICE => (HOST, CONTROL_PIPE),
            DEVICE_B => (HOST, CONTROL_PIPE_B),
            DEVICE_C => (OTHER_HOST, CONTROL_PIPE_C),
            _ => return None,
        };
        Some(DeviceInfo { host, control_pipe })
    }

    fn open_interface(&mut self, _device: DeviceHandle, interface: u8) -> Result<(), TransferError> {
        self.interfaces_opened.push(interface);
        Ok(())
    }

    fn close_interface(&mut self, _device: DeviceHandle, interface: Option<u8>) {
        self.interfaces_closed.push(interface);
    }

    fn alloc_transfer(&mut self, host: HostHandle) -> Result<TransferId, TransferError> {
        if self.fail_alloc {
            return Err(TransferError::Busy);
        }
        let reused = if self.reuse_ids {
            self.free_list.get_mut(&host).and_then(Vec::pop)
        } else {
            None
        };
        let id = reused.unwrap_or_else(|| {
            let next = self.next_transfer.entry(host).or_insert(100);
            let id = TransferId(*next);
            *next += 1;
            id
        });
        assert!(self.allocated.insert((host, id)), "transfer {id:?} handed out twice");
        self.alloc_count += 1;
        Ok(id)
    }

    fn free_transfer(&mut self, host: HostHandle, transfer: TransferId) {
        assert!(
            self.allocated.remove(&(host, transfer)),
            "freeing unallocated transfer {transfer:?}"
        );
        self.free_list.entry(host).or_default().push(transfer);
        self.freed.push(transfer);
    }

    fn open_pipe(&mut self, _host: HostHandle, init: &PipeInit) -> Result<PipeHandle, TransferError> {
        if self.fail_open_pipe_at == Some(self.opened.len()) {
            return Err(TransferError::Rejected);
        }
        let handle = PipeHandle(self.next_pipe);
        self.next_pipe += 1;
        self.opened.push((handle, *init));
        Ok(handle)
    }

    fn close_pipe(&mut self, _host: HostHandle, pipe: PipeHandle) -> Result<(), TransferError> {
        self.closed.push(pipe);
        Ok(())
    }

    fn send(
        &mut self,
        host: HostHandle,
        pipe: PipeHandle,
        transfer: TransferId,
        data: &[u8],
    ) -> Result<(), TransferError> {
        if self.reject_submissions {
            return Err(TransferError::Rejected);
        }
        assert!(self.allocated.contains(&(host, transfer)));
        self.submissions.push_back(Submission::Send {
            pipe,
            transfer,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn recv(
        &mut self,
        host: HostHandle,
        pipe: PipeHandle,
        transfer: TransferId,
        len: usize,
    ) -> Result<(), TransferError> {
        if self.reject_submissions {
            return Err(TransferError::Rejected);
        }
        assert!(self.allocated.contains(&(host, transfer)));
        self.submissions
            .push_back(Submission::Recv { pipe, transfer, len });
        Ok(())
    }

    fn send_setup(
        &mut self,
        host: HostHandle,
        pipe: PipeHandle,
        transfer: TransferId,
        setup: SetupPacket,
        _data: &[u8],
    ) -> Result<(), TransferError> {
        if self.reject_submissions {
            return Err(TransferError::Rejected);
        }
        assert!(self.allocated.contains(&(host, transfer)));
        self.submissions.push_back(Submission::Setup {
            pipe,
            transfer,
            setup,
        });
        Ok(())
    }

    fn cancel(
        &mut self,
        _host: HostHandle,
        pipe: PipeHandle,
        transfer: Option<TransferId>,
    ) -> Result<(), TransferError> {
        self.cancels.push((pipe, transfer));
        Ok(())
    }

    fn max_packet_size(&self, _host: HostHandle, pipe: PipeHandle) -> u16 {
        if [CONTROL_PIPE, CONTROL_PIPE_B, CONTROL_PIPE_C].contains(&pipe) {
            self.control_max_packet_size
        } else {
            0
        }
    }
}

/// Collects completions delivered to callbacks.
#[derive(Clone, Default)]
pub struct Recorder(Rc<RefCell<Vec<Completion>>>);

impl Recorder {
    pub fn callback(&self) -> impl FnOnce(Completion) + 'static {
        let inner = self.0.clone();
        move |completion| inner.borrow_mut().push(completion)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    pub fn single(&self) -> Completion {
        let mut all = self.take();
        assert_eq!(all.len(), 1, "expected exactly one completion: {all:?}");
        all.remove(0)
    }
}

pub fn bulk_endpoint(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        attributes: 0x02,
        max_packet_size,
        interval: 0,
    }
}

/// Interface with one bulk pair and an interrupt endpoint the driver must ignore.
pub fn msd_interface() -> InterfaceDescriptor {
    InterfaceDescriptor {
        number: INTERFACE_NUMBER,
        alternate_setting: 0,
        endpoints: vec![
            bulk_endpoint(EP_IN, 512),
            EndpointDescriptor {
                address: 0x83,
                attributes: 0x03,
                max_packet_size: 8,
                interval: 10,
            },
            bulk_endpoint(EP_OUT, 512),
        ],
    }
}

/// Creates an instance for `device` and selects [`msd_interface`] at alternate setting 0.
pub fn bind(host: &mut MockHost, driver: &mut MsdHostDriver, device: DeviceHandle) -> ClassHandle {
    let handle = driver.init(host, device).unwrap();
    let recorder = Recorder::default();
    driver
        .set_interface(host, handle, msd_interface(), 0, recorder.callback())
        .unwrap();
    assert_eq!(
        recorder.single().status,
        aero_usb_msd::CompletionStatus::Success
    );
    handle
}

pub struct Harness {
    pub host: MockHost,
    pub driver: MsdHostDriver,
    pub handle: ClassHandle,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(MsdConfig::default())
    }

    /// Driver bound to [`msd_interface`] at alternate setting 0.
    pub fn with_config(config: MsdConfig) -> Self {
        init_tracing();
        let mut host = MockHost::default();
        let mut driver = MsdHostDriver::new(config);
        let handle = bind(&mut host, &mut driver, DEVICE);
        Self {
            host,
            driver,
            handle,
        }
    }

    pub fn complete(&mut self, event: TransferEvent) {
        self.driver.advance(&mut self.host, event);
    }

    /// Pops the next submission, asserting it is a CBW on the bulk OUT pipe.
    pub fn expect_cbw(&mut self) -> (TransferId, Vec<u8>) {
        match self.host.pop() {
            Submission::Send {
                pipe,
                transfer,
                data,
            } => {
                assert_eq!(pipe, self.host.bulk_out());
                assert_eq!(data.len(), CBW_LEN);
                assert_eq!(&data[0..4], b"USBC");
                (transfer, data)
            }
            other => panic!("expected CBW, got {other:?}"),
        }
    }

    pub fn expect_recv(&mut self, pipe: PipeHandle, len: usize) -> TransferId {
        match self.host.pop() {
            Submission::Recv {
                pipe: got,
                transfer,
                len: got_len,
            } => {
                assert_eq!(got, pipe);
                assert_eq!(got_len, len);
                transfer
            }
            other => panic!("expected recv on {pipe:?}, got {other:?}"),
        }
    }

    pub fn expect_setup(&mut self) -> (TransferId, SetupPacket) {
        match self.host.pop() {
            Submission::Setup {
                pipe,
                transfer,
                setup,
            } => {
                assert_eq!(pipe, CONTROL_PIPE);
                (transfer, setup)
            }
            other => panic!("expected control request, got {other:?}"),
        }
    }

    /// Completes the CBW successfully.
    pub fn ack_cbw(&mut self) {
        let (transfer, _) = self.expect_cbw();
        let pipe = self.host.bulk_out();
        self.complete(TransferEvent::sent(HOST, transfer, pipe, CBW_LEN));
    }

    /// Completes the pending CSW read with the given status.
    pub fn answer_csw(&mut self, tag: u32, status: CswStatus) {
        let pipe = self.host.bulk_in();
        let transfer = self.expect_recv(pipe, 13);
        let csw = CommandStatusWrapper {
            tag,
            residue: 0,
            status,
        };
        self.complete(TransferEvent::received(HOST, transfer, pipe, csw.to_bytes().to_vec()));
    }

    /// Completes the pending control request with `status`.
    pub fn finish_setup(&mut self, transfer: TransferId, status: TransferStatus) {
        let event = if status == TransferStatus::Success {
            TransferEvent::sent(HOST, transfer, CONTROL_PIPE, 0)
        } else {
            TransferEvent::failed(HOST, transfer, CONTROL_PIPE, status)
        };
        self.complete(event);
    }
}

pub fn cbw_tag(cbw: &[u8]) -> u32 {
    u32::from_le_bytes(cbw[4..8].try_into().unwrap())
}
