//! Bulk pipe management for a bound mass-storage interface.

use crate::transfer::{
    DeviceHandle, Direction, EndpointType, HostHandle, PipeHandle, PipeInit, TransferError,
    TransferService,
};

const MAX_PACKET_SIZE_MASK: u16 = 0x07ff;
const ADDITIONAL_TRANSACTIONS_SHIFT: u16 = 11;
const ADDITIONAL_TRANSACTIONS_MASK: u16 = 0x3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// `bEndpointAddress`, including the direction bit.
    pub address: u8,
    /// `bmAttributes`.
    pub attributes: u8,
    /// Raw `wMaxPacketSize`, including the high-bandwidth bits.
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn transfer_type(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }
}

/// One alternate setting of an interface, with its endpoint list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    /// `bAlternateSetting` as enumerated. Informational only: the setting that gets selected is
    /// the one passed to `MsdHostDriver::set_interface`.
    pub alternate_setting: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OpenPipe {
    pub(crate) handle: PipeHandle,
    pub(crate) endpoint_number: u8,
    pub(crate) max_packet_size: u16,
}

#[derive(Debug, Default)]
pub(crate) struct PipeSet {
    bulk_in: Option<OpenPipe>,
    bulk_out: Option<OpenPipe>,
}

impl PipeSet {
    pub(crate) fn get(&self, direction: Direction) -> Option<OpenPipe> {
        match direction {
            Direction::In => self.bulk_in,
            Direction::Out => self.bulk_out,
        }
    }

    fn slot(&mut self, direction: Direction) -> &mut Option<OpenPipe> {
        match direction {
            Direction::In => &mut self.bulk_in,
            Direction::Out => &mut self.bulk_out,
        }
    }

    /// Endpoint address (with direction bit) of the open pipe, used as `wIndex` for
    /// CLEAR_FEATURE(ENDPOINT_HALT).
    pub(crate) fn endpoint_address(&self, direction: Direction) -> Option<u8> {
        self.get(direction)
            .map(|pipe| direction.address_bit() | pipe.endpoint_number)
    }

    pub(crate) fn cancel_all<S: TransferService>(&self, service: &mut S, host: HostHandle) {
        for pipe in [self.bulk_in, self.bulk_out].into_iter().flatten() {
            if let Err(err) = service.cancel(host, pipe.handle, None) {
                tracing::warn!(pipe = pipe.handle.0, %err, "error when cancelling bulk pipe");
            }
        }
    }

    pub(crate) fn close_all<S: TransferService>(&mut self, service: &mut S, host: HostHandle) {
        for pipe in [self.bulk_in.take(), self.bulk_out.take()].into_iter().flatten() {
            if let Err(err) = service.close_pipe(host, pipe.handle) {
                tracing::warn!(pipe = pipe.handle.0, %err, "error when closing bulk pipe");
            }
        }
    }

    /// Closes any previously open pipes and opens one bulk IN and one bulk OUT pipe from the
    /// interface's endpoint list. Non-bulk endpoints are ignored.
    ///
    /// If a pipe fails to open, pipes opened by this call are closed again and the error is
    /// returned.
    pub(crate) fn open<S: TransferService>(
        &mut self,
        service: &mut S,
        host: HostHandle,
        device: DeviceHandle,
        interface: &InterfaceDescriptor,
        nak_count: u16,
    ) -> Result<(), TransferError> {
        self.close_all(service, host);

        for ep in &interface.endpoints {
            if ep.transfer_type() != EndpointType::Bulk {
                continue;
            }
            let direction = ep.direction();
            if self.get(direction).is_some() {
                tracing::debug!(
                    endpoint = ep.address,
                    "ignoring extra bulk endpoint on mass-storage interface"
                );
                continue;
            }

            let init = PipeInit {
                device,
                pipe_type: EndpointType::Bulk,
                direction,
                endpoint_number: ep.number(),
                interval: ep.interval,
                max_packet_size: ep.max_packet_size & MAX_PACKET_SIZE_MASK,
                transactions_per_microframe: (((ep.max_packet_size >> ADDITIONAL_TRANSACTIONS_SHIFT)
                    & ADDITIONAL_TRANSACTIONS_MASK)
                    + 1) as u8,
                nak_count,
            };
            match service.open_pipe(host, &init) {
                Ok(handle) => {
                    *self.slot(direction) = Some(OpenPipe {
                        handle,
                        endpoint_number: init.endpoint_number,
                        max_packet_size: init.max_packet_size,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        interface = interface.number,
                        endpoint = ep.address,
                        %err,
                        "failed to open bulk pipe"
                    );
                    self.close_all(service, host);
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}
