//! Contract for the asynchronous USB transfer service the class driver runs on.
//!
//! The host controller driver owns pipes and transfer descriptors. The class driver only asks it
//! to start work (`send`, `recv`, `send_setup`) and later receives a [`TransferEvent`] for every
//! transfer it started, including transfers that were cancelled. Submission methods never block:
//! they either queue the transfer and return `Ok(())`, or reject it synchronously.

use bitflags::bitflags;

/// Host controller context a device is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostHandle(pub u32);

/// Enumerated device, as handed out by the enumeration layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipeHandle(pub u32);

/// A transfer descriptor allocated from the host controller's pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransferId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// Direction bit as used in endpoint addresses and `bmRequestType`.
    pub fn address_bit(self) -> u8 {
        match self {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    /// Decodes the transfer type from an endpoint descriptor's `bmAttributes`.
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

bitflags! {
    /// `bmRequestType` bits used by the mass-storage class driver.
    ///
    /// Standard type and device recipient are both zero, so they have no flag of their own.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct RequestType: u8 {
        const DIR_IN = 1 << 7;
        const TYPE_CLASS = 1 << 5;
        const RECIPIENT_INTERFACE = 0x01;
        const RECIPIENT_ENDPOINT = 0x02;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(self) -> bool {
        (self.request_type & RequestType::DIR_IN.bits()) != 0
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.request_type;
        out[1] = self.request;
        out[2..4].copy_from_slice(&self.value.to_le_bytes());
        out[4..6].copy_from_slice(&self.index.to_le_bytes());
        out[6..8].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// Parameters for opening a pipe on one endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeInit {
    pub device: DeviceHandle,
    pub pipe_type: EndpointType,
    pub direction: Direction,
    /// Endpoint number without the direction bit.
    pub endpoint_number: u8,
    pub interval: u8,
    pub max_packet_size: u16,
    pub transactions_per_microframe: u8,
    /// NAK retries the controller performs before failing a transaction.
    pub nak_count: u16,
}

/// Host-side information derived from an enumerated device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub host: HostHandle,
    pub control_pipe: PipeHandle,
}

/// Terminal status of a transfer, as reported by the host controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Success,
    /// The endpoint answered with STALL and is now halted.
    Stall,
    /// The transfer was cancelled before it finished.
    Cancel,
    /// Any other failure (NAK budget exhausted, CRC/babble errors, ...).
    Error,
}

/// Completion of a transfer previously started through [`TransferService`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferEvent {
    /// Host controller the transfer was allocated from. Transfer ids are only unique per host.
    pub host: HostHandle,
    pub transfer: TransferId,
    pub pipe: PipeHandle,
    pub status: TransferStatus,
    /// Bytes moved on the bus.
    pub actual: usize,
    /// Bytes received for IN transfers (`data.len() == actual`); empty for OUT transfers.
    pub data: Vec<u8>,
}

impl TransferEvent {
    /// Successful OUT (or no-data control) completion.
    pub fn sent(host: HostHandle, transfer: TransferId, pipe: PipeHandle, actual: usize) -> Self {
        Self {
            host,
            transfer,
            pipe,
            status: TransferStatus::Success,
            actual,
            data: Vec::new(),
        }
    }

    /// Successful IN completion carrying the received bytes.
    pub fn received(
        host: HostHandle,
        transfer: TransferId,
        pipe: PipeHandle,
        data: Vec<u8>,
    ) -> Self {
        Self {
            host,
            transfer,
            pipe,
            status: TransferStatus::Success,
            actual: data.len(),
            data,
        }
    }

    pub fn failed(
        host: HostHandle,
        transfer: TransferId,
        pipe: PipeHandle,
        status: TransferStatus,
    ) -> Self {
        Self {
            host,
            transfer,
            pipe,
            status,
            actual: 0,
            data: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    #[error("no free transfer descriptor")]
    Busy,
    #[error("host controller rejected the request")]
    Rejected,
    #[error("pipe is not open")]
    InvalidPipe,
    #[error("device is not attached")]
    UnknownDevice,
}

/// Asynchronous transfer primitives provided by the host controller driver.
///
/// Every transfer accepted by `send`, `recv` or `send_setup` must eventually be reported back
/// through the class driver's `advance` entry point, exactly once, even when it is cancelled.
/// A transfer id must not be handed out again until the class driver frees it.
pub trait TransferService {
    fn device_info(&self, device: DeviceHandle) -> Option<DeviceInfo>;

    /// Tells the host driver that the class driver now owns `interface`.
    fn open_interface(&mut self, device: DeviceHandle, interface: u8) -> Result<(), TransferError>;

    fn close_interface(&mut self, device: DeviceHandle, interface: Option<u8>);

    fn alloc_transfer(&mut self, host: HostHandle) -> Result<TransferId, TransferError>;

    fn free_transfer(&mut self, host: HostHandle, transfer: TransferId);

    fn open_pipe(&mut self, host: HostHandle, init: &PipeInit) -> Result<PipeHandle, TransferError>;

    fn close_pipe(&mut self, host: HostHandle, pipe: PipeHandle) -> Result<(), TransferError>;

    fn send(
        &mut self,
        host: HostHandle,
        pipe: PipeHandle,
        transfer: TransferId,
        data: &[u8],
    ) -> Result<(), TransferError>;

    fn recv(
        &mut self,
        host: HostHandle,
        pipe: PipeHandle,
        transfer: TransferId,
        len: usize,
    ) -> Result<(), TransferError>;

    /// Starts a control transfer. For host-to-device requests `data` is the data stage; for
    /// device-to-host requests the controller reads up to `setup.length` bytes.
    fn send_setup(
        &mut self,
        host: HostHandle,
        pipe: PipeHandle,
        transfer: TransferId,
        setup: SetupPacket,
        data: &[u8],
    ) -> Result<(), TransferError>;

    /// Cancels one transfer, or every transfer queued on `pipe` when `transfer` is `None`.
    fn cancel(
        &mut self,
        host: HostHandle,
        pipe: PipeHandle,
        transfer: Option<TransferId>,
    ) -> Result<(), TransferError>;

    fn max_packet_size(&self, host: HostHandle, pipe: PipeHandle) -> u16;
}
