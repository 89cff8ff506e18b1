//! Per-device instance lifecycle and the application-facing class driver API.

use std::collections::{HashMap, HashSet};

use crate::command::{CommandContext, CommandPhase, Completion, CompletionCallback, CompletionStatus};
use crate::config::MsdConfig;
use crate::error::{MsdError, Result};
use crate::pipe::{InterfaceDescriptor, PipeSet};
use crate::recovery::{RecoveryKind, RecoveryOrigin, ResetStep, REQUEST_GET_MAX_LUN};
use crate::transfer::{
    DeviceHandle, Direction, EndpointType, HostHandle, PipeHandle, RequestType, SetupPacket,
    TransferError, TransferEvent, TransferId, TransferService, TransferStatus,
};
use crate::wire::CDB_LEN;

const USB_REQUEST_SET_INTERFACE: u8 = 0x0b;

/// Stable reference to one bound mass-storage device. Handles are never reused while the
/// instance they name is alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassHandle(u32);

impl ClassHandle {
    pub fn raw(self) -> u32 {
        self.0
    }
}

pub(crate) enum ControlOp {
    SetInterface { callback: CompletionCallback },
    GetMaxLun { callback: CompletionCallback },
    /// Command-path halt clear; the command resumes when it finishes.
    ClearHalt,
    Reset {
        step: ResetStep,
        origin: RecoveryOrigin,
    },
}

/// The device's single outstanding control transfer.
pub(crate) struct ControlInflight {
    pub(crate) transfer: TransferId,
    pub(crate) op: ControlOp,
}

pub(crate) struct MsdInstance {
    pub(crate) id: ClassHandle,
    pub(crate) host: HostHandle,
    pub(crate) device: DeviceHandle,
    pub(crate) control_pipe: PipeHandle,
    pub(crate) interface: Option<InterfaceDescriptor>,
    pub(crate) pipes: PipeSet,
    pub(crate) control: Option<ControlInflight>,
    pub(crate) command: CommandContext,
    pub(crate) config: MsdConfig,
}

impl MsdInstance {
    fn owns(&self, host: HostHandle, transfer: TransferId) -> bool {
        self.host == host
            && (self.command.transfer == Some(transfer)
                || self
                    .control
                    .as_ref()
                    .is_some_and(|ctl| ctl.transfer == transfer))
    }

    /// Allocates a transfer and sends a control request on it, claiming the control slot's
    /// transfer. The caller records the operation in `self.control`.
    pub(crate) fn begin_control<S: TransferService>(
        &mut self,
        service: &mut S,
        setup: SetupPacket,
        data: &[u8],
    ) -> Result<TransferId> {
        if self.control.is_some() {
            return Err(MsdError::Busy);
        }
        let transfer = service.alloc_transfer(self.host).map_err(|err| {
            tracing::warn!(handle = self.id.raw(), %err, "allocate transfer error");
            MsdError::Busy
        })?;
        if let Err(err) = service.send_setup(self.host, self.control_pipe, transfer, setup, data) {
            service.free_transfer(self.host, transfer);
            return Err(err.into());
        }
        Ok(transfer)
    }

    fn open_pipes<S: TransferService>(&mut self, service: &mut S) -> CompletionStatus {
        let Some(interface) = self.interface.as_ref() else {
            return CompletionStatus::Error;
        };
        match self
            .pipes
            .open(service, self.host, self.device, interface, self.config.nak_count)
        {
            Ok(()) => CompletionStatus::Success,
            Err(_) => CompletionStatus::Error,
        }
    }

    fn advance<S: TransferService>(&mut self, service: &mut S, event: TransferEvent) {
        let is_control = self
            .control
            .as_ref()
            .is_some_and(|ctl| ctl.transfer == event.transfer);
        if !is_control {
            self.on_command_event(service, event);
            return;
        }
        let Some(inflight) = self.control.take() else {
            return;
        };
        service.free_transfer(self.host, inflight.transfer);

        match inflight.op {
            ControlOp::SetInterface { callback } => {
                let status = match event.status {
                    TransferStatus::Success => self.open_pipes(service),
                    other => other.into(),
                };
                callback(Completion::status_only(status));
            }
            ControlOp::GetMaxLun { callback } => {
                let mut data = event.data;
                data.truncate(event.actual);
                callback(Completion {
                    buffer: Some(data),
                    transferred: event.actual,
                    status: event.status.into(),
                });
            }
            ControlOp::ClearHalt => self.on_clear_halt_done(service, event.status),
            ControlOp::Reset { step, origin } => {
                self.on_reset_step_done(service, step, origin, event.status)
            }
        }
    }

    /// Cancels everything and settles every outstanding callback with `TransferCancel`.
    ///
    /// Returns the transfers that were cancelled while on the bus. Their completions are still
    /// owed by the host, so they stay allocated until [`MsdHostDriver::advance`] sees them.
    fn teardown<S: TransferService>(
        mut self,
        service: &mut S,
        device: DeviceHandle,
    ) -> Vec<TransferId> {
        let host = self.host;
        let mut draining = Vec::new();
        self.pipes.cancel_all(service, host);
        self.pipes.close_all(service, host);

        if let Some(inflight) = self.control.take() {
            if let Err(err) = service.cancel(host, self.control_pipe, Some(inflight.transfer)) {
                tracing::warn!(handle = self.id.raw(), %err, "error when cancelling control transfer");
            }
            draining.push(inflight.transfer);
            match inflight.op {
                ControlOp::SetInterface { callback }
                | ControlOp::GetMaxLun { callback }
                | ControlOp::Reset {
                    origin: RecoveryOrigin::Application(callback),
                    ..
                } => callback(Completion::status_only(CompletionStatus::TransferCancel)),
                // The command itself is settled below.
                ControlOp::ClearHalt
                | ControlOp::Reset {
                    origin: RecoveryOrigin::Internal(_),
                    ..
                } => {}
            }
        }

        if self.command.phase != CommandPhase::Idle {
            self.complete_command(CompletionStatus::TransferCancel);
        }
        if let Some(transfer) = self.command.transfer.take() {
            if self.command.in_flight {
                draining.push(transfer);
            } else {
                service.free_transfer(host, transfer);
            }
        }
        service.close_interface(device, self.interface.as_ref().map(|iface| iface.number));
        tracing::debug!(
            handle = self.id.raw(),
            draining = draining.len(),
            "mass-storage instance released"
        );
        draining
    }
}

/// Host-side USB mass-storage (bulk-only transport) class driver.
///
/// The driver owns one instance per bound device, addressed by [`ClassHandle`]. It never owns the
/// host controller: every call that may touch the bus takes the [`TransferService`] explicitly,
/// and completions are fed back through [`MsdHostDriver::advance`] one event at a time.
pub struct MsdHostDriver {
    config: MsdConfig,
    next_id: u32,
    instances: HashMap<ClassHandle, MsdInstance>,
    /// Transfers of released instances whose cancellation has not been reported yet.
    draining: HashSet<(HostHandle, TransferId)>,
}

impl Default for MsdHostDriver {
    fn default() -> Self {
        Self::new(MsdConfig::default())
    }
}

impl MsdHostDriver {
    pub fn new(config: MsdConfig) -> Self {
        Self {
            config,
            next_id: 1,
            instances: HashMap::new(),
            draining: HashSet::new(),
        }
    }

    pub fn config(&self) -> &MsdConfig {
        &self.config
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn alloc_id(&mut self) -> Option<ClassHandle> {
        // Bounded by the id space; in practice the first candidate is free.
        for _ in 0..=self.instances.len() {
            let id = ClassHandle(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.instances.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn instance_mut(&mut self, handle: ClassHandle) -> Result<&mut MsdInstance> {
        self.instances
            .get_mut(&handle)
            .ok_or(MsdError::InvalidHandle)
    }

    /// Creates the class instance for a newly configured device.
    pub fn init<S: TransferService>(
        &mut self,
        service: &mut S,
        device: DeviceHandle,
    ) -> Result<ClassHandle> {
        let info = service
            .device_info(device)
            .ok_or(MsdError::Transfer(TransferError::UnknownDevice))?;
        let id = self.alloc_id().ok_or(MsdError::AllocFail)?;
        self.instances.insert(
            id,
            MsdInstance {
                id,
                host: info.host,
                device,
                control_pipe: info.control_pipe,
                interface: None,
                pipes: PipeSet::default(),
                control: None,
                command: CommandContext::new(),
                config: self.config.clone(),
            },
        );
        tracing::debug!(handle = id.raw(), device = device.0, "mass-storage instance created");
        Ok(id)
    }

    /// Binds `interface` and (re)opens its bulk pipes.
    ///
    /// Outstanding bulk transfers are cancelled first. Alternate setting 0 opens the pipes
    /// immediately and calls `callback` before returning; any other setting sends SET_INTERFACE
    /// and opens the pipes when it completes.
    pub fn set_interface<S, F>(
        &mut self,
        service: &mut S,
        handle: ClassHandle,
        interface: InterfaceDescriptor,
        alternate_setting: u8,
        callback: F,
    ) -> Result<()>
    where
        S: TransferService,
        F: FnOnce(Completion) + 'static,
    {
        let inst = self.instance_mut(handle)?;
        if alternate_setting != 0 && inst.control.is_some() {
            return Err(MsdError::Busy);
        }
        service.open_interface(inst.device, interface.number)?;
        let number = interface.number;
        inst.interface = Some(interface);
        inst.pipes.cancel_all(service, inst.host);

        if alternate_setting == 0 {
            let status = inst.open_pipes(service);
            callback(Completion::status_only(status));
            return Ok(());
        }

        let setup = SetupPacket {
            request_type: RequestType::RECIPIENT_INTERFACE.bits(),
            request: USB_REQUEST_SET_INTERFACE,
            value: u16::from(alternate_setting),
            index: u16::from(number),
            length: 0,
        };
        let transfer = inst.begin_control(service, setup, &[])?;
        inst.control = Some(ControlInflight {
            transfer,
            op: ControlOp::SetInterface {
                callback: Box::new(callback),
            },
        });
        Ok(())
    }

    /// Releases the instance bound to `device`.
    ///
    /// With no handle this only tells the host driver that the interface is closed. Completions
    /// still owed to the application are delivered before this returns, with `TransferCancel`.
    pub fn deinit<S: TransferService>(
        &mut self,
        service: &mut S,
        device: DeviceHandle,
        handle: Option<ClassHandle>,
    ) -> Result<()> {
        let Some(handle) = handle else {
            service.close_interface(device, None);
            return Ok(());
        };
        let Some(inst) = self.instances.remove(&handle) else {
            tracing::warn!(handle = handle.raw(), "deinit of unknown mass-storage instance");
            service.close_interface(device, None);
            return Ok(());
        };
        let host = inst.host;
        for transfer in inst.teardown(service, device) {
            self.draining.insert((host, transfer));
        }
        Ok(())
    }

    /// Runs one bulk-only command.
    ///
    /// `buffer` is the data stage (its length is the CBW data-transfer length); `None` or an empty
    /// buffer means there is no data stage. The buffer comes back through the completion, filled
    /// with received data for `Direction::In`.
    pub fn command<S, F>(
        &mut self,
        service: &mut S,
        handle: ClassHandle,
        buffer: Option<Vec<u8>>,
        callback: F,
        direction: Direction,
        cdb: [u8; CDB_LEN],
    ) -> Result<()>
    where
        S: TransferService,
        F: FnOnce(Completion) + 'static,
    {
        self.instance_mut(handle)?
            .start_command(service, buffer, Box::new(callback), direction, cdb)
    }

    /// Runs reset recovery on behalf of the application. `callback` receives the final status.
    pub fn mass_storage_reset<S, F>(
        &mut self,
        service: &mut S,
        handle: ClassHandle,
        callback: F,
    ) -> Result<()>
    where
        S: TransferService,
        F: FnOnce(Completion) + 'static,
    {
        self.instance_mut(handle)?
            .start_reset(service, RecoveryOrigin::Application(Box::new(callback)))
    }

    /// Sends Get Max LUN. The completion carries the one-byte response buffer.
    pub fn get_max_logical_unit<S, F>(
        &mut self,
        service: &mut S,
        handle: ClassHandle,
        callback: F,
    ) -> Result<()>
    where
        S: TransferService,
        F: FnOnce(Completion) + 'static,
    {
        let inst = self.instance_mut(handle)?;
        let interface = inst.interface.as_ref().ok_or(MsdError::NoInterface)?.number;
        let setup = SetupPacket {
            request_type: (RequestType::DIR_IN
                | RequestType::TYPE_CLASS
                | RequestType::RECIPIENT_INTERFACE)
                .bits(),
            request: REQUEST_GET_MAX_LUN,
            value: 0,
            index: u16::from(interface),
            length: 1,
        };
        let transfer = inst.begin_control(service, setup, &[])?;
        inst.control = Some(ControlInflight {
            transfer,
            op: ControlOp::GetMaxLun {
                callback: Box::new(callback),
            },
        });
        Ok(())
    }

    /// Max packet size of the control pipe or of an open bulk pipe; 0 otherwise.
    pub fn packet_size<S: TransferService>(
        &self,
        service: &S,
        handle: ClassHandle,
        pipe_type: EndpointType,
        direction: Direction,
    ) -> u16 {
        let Some(inst) = self.instances.get(&handle) else {
            return 0;
        };
        match pipe_type {
            EndpointType::Control => service.max_packet_size(inst.host, inst.control_pipe),
            EndpointType::Bulk => inst
                .pipes
                .get(direction)
                .map_or(0, |pipe| pipe.max_packet_size),
            EndpointType::Isochronous | EndpointType::Interrupt => 0,
        }
    }

    /// Feeds one transfer completion into the instance that started the transfer.
    ///
    /// Completions of transfers cancelled by [`MsdHostDriver::deinit`] only release the transfer.
    pub fn advance<S: TransferService>(&mut self, service: &mut S, event: TransferEvent) {
        if self.draining.remove(&(event.host, event.transfer)) {
            tracing::debug!(
                host = event.host.0,
                transfer = event.transfer.0,
                status = ?event.status,
                "released transfer of a removed instance"
            );
            service.free_transfer(event.host, event.transfer);
            return;
        }
        let Some(inst) = self
            .instances
            .values_mut()
            .find(|inst| inst.owns(event.host, event.transfer))
        else {
            tracing::debug!(
                host = event.host.0,
                transfer = event.transfer.0,
                status = ?event.status,
                "dropping completion for unknown transfer"
            );
            return;
        };
        inst.advance(service, event);
    }

    pub fn command_phase(&self, handle: ClassHandle) -> Option<CommandPhase> {
        self.instances.get(&handle).map(|inst| inst.command.phase)
    }

    pub fn retries_remaining(&self, handle: ClassHandle) -> Option<u8> {
        self.instances.get(&handle).map(|inst| inst.command.retries)
    }

    /// Reports a reset recovery currently occupying the control slot.
    pub fn recovery_in_progress(&self, handle: ClassHandle) -> Option<RecoveryKind> {
        let inst = self.instances.get(&handle)?;
        match &inst.control {
            Some(ControlInflight {
                op: ControlOp::Reset { origin, .. },
                ..
            }) => Some(origin.kind()),
            _ => None,
        }
    }

    /// Transfers of removed instances still waiting for their cancellation to be reported.
    pub fn draining_count(&self) -> usize {
        self.draining.len()
    }

    pub fn control_in_flight(&self, handle: ClassHandle) -> bool {
        self.instances
            .get(&handle)
            .is_some_and(|inst| inst.control.is_some())
    }
}
