//! Bulk-only transport command engine.
//!
//! A command runs through three bulk phases on the device's pipes:
//!
//! ```text
//! Idle -> TransferCbw -> [TransferData]* -> TransferCsw -> Done -> Idle
//!              \               \                \
//!               +---------------+----------------+--> ErrorDone -> (reset recovery) -> Idle
//! ```
//!
//! Exactly one transfer is outstanding per phase and the engine only moves when that transfer's
//! [`TransferEvent`] is fed back in. The same transfer descriptor is reused for every phase of
//! every command on a device; it is allocated on first use and freed at teardown.
//!
//! Failure handling per phase:
//!
//! | phase | stall                               | cancel   | other error              |
//! |-------|-------------------------------------|----------|--------------------------|
//! | CBW   | retry budget, clear OUT halt        | complete | retry budget             |
//! | DATA  | retry budget, clear halt, then CSW  | complete | reset recovery           |
//! | CSW   | retry budget, clear IN halt         | complete | retry budget             |
//!
//! "Retry budget" means: consume one retry; if any remain, recover in place, otherwise escalate
//! to reset recovery. A CSW that is malformed or reports a phase error always escalates.

use crate::driver::{ControlInflight, ControlOp, MsdInstance};
use crate::error::{MsdError, Result};
use crate::recovery::{clear_halt_setup, RecoveryOrigin, RecoveryOutcome};
use crate::transfer::{Direction, PipeHandle, TransferEvent, TransferId, TransferService, TransferStatus};
use crate::wire::{CommandBlockWrapper, CommandStatusWrapper, CswStatus, CBW_LEN, CDB_LEN, CSW_LEN};

/// Status delivered to completion callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    Success,
    /// The device reported command failure in the CSW (status 1 or a reserved value).
    StatusFail,
    /// A control request was stalled. Commands never complete with this status.
    TransferStall,
    TransferCancel,
    Error,
}

impl From<TransferStatus> for CompletionStatus {
    fn from(status: TransferStatus) -> Self {
        match status {
            TransferStatus::Success => CompletionStatus::Success,
            TransferStatus::Stall => CompletionStatus::TransferStall,
            TransferStatus::Cancel => CompletionStatus::TransferCancel,
            TransferStatus::Error => CompletionStatus::Error,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    /// The caller's buffer, handed back. `None` for requests without a data buffer.
    pub buffer: Option<Vec<u8>>,
    pub transferred: usize,
    pub status: CompletionStatus,
}

impl Completion {
    pub(crate) fn status_only(status: CompletionStatus) -> Self {
        Self {
            buffer: None,
            transferred: 0,
            status,
        }
    }
}

pub type CompletionCallback = Box<dyn FnOnce(Completion)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandPhase {
    Idle,
    TransferCbw,
    TransferData,
    TransferCsw,
    Done,
    /// The command has failed and is waiting for reset recovery to finish before it completes.
    ErrorDone,
}

pub(crate) struct CommandContext {
    pub(crate) phase: CommandPhase,
    cbw: CommandBlockWrapper,
    buffer: Option<Vec<u8>>,
    direction: Direction,
    data_sofar: usize,
    pub(crate) retries: u8,
    pub(crate) transfer: Option<TransferId>,
    /// `transfer` is submitted and its completion has not been fed back yet.
    pub(crate) in_flight: bool,
    callback: Option<CompletionCallback>,
    next_tag: u32,
}

impl CommandContext {
    pub(crate) fn new() -> Self {
        Self {
            phase: CommandPhase::Idle,
            cbw: CommandBlockWrapper::new(0, 0, Direction::Out, &[0u8; CDB_LEN]),
            buffer: None,
            direction: Direction::Out,
            data_sofar: 0,
            retries: 0,
            transfer: None,
            in_flight: false,
            callback: None,
            next_tag: 1,
        }
    }

    fn data_len(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }
}

impl MsdInstance {
    pub(crate) fn start_command<S: TransferService>(
        &mut self,
        service: &mut S,
        buffer: Option<Vec<u8>>,
        callback: CompletionCallback,
        direction: Direction,
        cdb: [u8; CDB_LEN],
    ) -> Result<()> {
        if self.command.phase != CommandPhase::Idle {
            return Err(MsdError::Busy);
        }
        let buffer = buffer.filter(|buf| !buf.is_empty());
        let data_len = buffer.as_ref().map_or(0, Vec::len);
        let data_len = u32::try_from(data_len).map_err(|_| MsdError::BufferTooLarge)?;

        let cmd = &mut self.command;
        let tag = cmd.next_tag;
        cmd.next_tag = cmd.next_tag.wrapping_add(1);
        cmd.cbw = CommandBlockWrapper::new(tag, data_len, direction, &cdb);
        cmd.buffer = buffer;
        cmd.direction = direction;
        cmd.data_sofar = 0;
        cmd.retries = self.config.retry_budget;
        cmd.callback = Some(callback);
        cmd.phase = CommandPhase::TransferCbw;

        tracing::debug!(
            handle = self.id.raw(),
            tag,
            opcode = cdb[0],
            data_len,
            ?direction,
            "starting mass-storage command"
        );

        if let Err(err) = self.process_command(service) {
            // Never started: report synchronously and leave no trace of the command.
            tracing::warn!(handle = self.id.raw(), %err, "failed to start mass-storage command");
            let cmd = &mut self.command;
            cmd.phase = CommandPhase::Idle;
            cmd.callback = None;
            cmd.buffer = None;
            return Err(err);
        }
        Ok(())
    }

    fn bulk_pipe(&self, direction: Direction) -> Result<PipeHandle> {
        self.pipes
            .get(direction)
            .map(|pipe| pipe.handle)
            .ok_or(MsdError::PipeNotOpen(direction))
    }

    fn command_transfer<S: TransferService>(&mut self, service: &mut S) -> Result<TransferId> {
        if let Some(transfer) = self.command.transfer {
            return Ok(transfer);
        }
        let transfer = service.alloc_transfer(self.host).map_err(|err| {
            tracing::warn!(handle = self.id.raw(), %err, "allocate transfer error");
            MsdError::Busy
        })?;
        self.command.transfer = Some(transfer);
        Ok(transfer)
    }

    /// Issues the transfer for the current phase.
    fn process_command<S: TransferService>(&mut self, service: &mut S) -> Result<()> {
        let transfer = self.command_transfer(service)?;
        let host = self.host;

        match self.command.phase {
            CommandPhase::TransferCbw => {
                let pipe = self.bulk_pipe(Direction::Out)?;
                let cbw = self.command.cbw.to_bytes();
                tracing::trace!(handle = self.id.raw(), tag = self.command.cbw.tag, "CBW out");
                service.send(host, pipe, transfer, &cbw)?;
                self.command.in_flight = true;
            }
            CommandPhase::TransferData => {
                let remaining = self.command.data_len() - self.command.data_sofar;
                if remaining == 0 {
                    self.command.phase = CommandPhase::TransferCsw;
                    return self.process_command(service);
                }
                let pipe = self.bulk_pipe(self.command.direction)?;
                match self.command.direction {
                    Direction::In => service.recv(host, pipe, transfer, remaining)?,
                    Direction::Out => {
                        let sofar = self.command.data_sofar;
                        let data = self.command.buffer.as_deref().unwrap_or(&[]);
                        service.send(host, pipe, transfer, &data[sofar..])?;
                    }
                }
                self.command.in_flight = true;
            }
            CommandPhase::TransferCsw => {
                let pipe = self.bulk_pipe(Direction::In)?;
                service.recv(host, pipe, transfer, CSW_LEN)?;
                self.command.in_flight = true;
            }
            CommandPhase::Done => self.complete_command(CompletionStatus::Success),
            CommandPhase::Idle | CommandPhase::ErrorDone => {}
        }
        Ok(())
    }

    /// Re-enters the current phase from a completion; a phase that cannot even be submitted
    /// finishes the command.
    pub(crate) fn continue_command<S: TransferService>(&mut self, service: &mut S) {
        if let Err(err) = self.process_command(service) {
            tracing::warn!(
                handle = self.id.raw(),
                phase = ?self.command.phase,
                %err,
                "failed to issue mass-storage phase"
            );
            self.complete_command(CompletionStatus::Error);
        }
    }

    pub(crate) fn complete_command(&mut self, status: CompletionStatus) {
        let cmd = &mut self.command;
        cmd.phase = CommandPhase::Idle;
        let completion = Completion {
            buffer: cmd.buffer.take(),
            transferred: cmd.data_sofar,
            status,
        };
        tracing::debug!(
            handle = self.id.raw(),
            tag = cmd.cbw.tag,
            ?status,
            transferred = completion.transferred,
            "mass-storage command done"
        );
        if let Some(callback) = cmd.callback.take() {
            callback(completion);
        }
    }

    /// Restarts the current command from its CBW with a fresh retry budget.
    pub(crate) fn restart_command<S: TransferService>(&mut self, service: &mut S) {
        let cmd = &mut self.command;
        cmd.phase = CommandPhase::TransferCbw;
        cmd.data_sofar = 0;
        cmd.retries = self.config.retry_budget;
        tracing::debug!(handle = self.id.raw(), tag = cmd.cbw.tag, "restarting command after reset recovery");
        self.continue_command(service);
    }

    /// Consumes one retry and reports whether any remain.
    fn consume_retry(&mut self) -> bool {
        self.command.retries = self.command.retries.saturating_sub(1);
        self.command.retries > 0
    }

    fn retry_exhausted_outcome(&self) -> RecoveryOutcome {
        if self.config.restart_after_recovery {
            RecoveryOutcome::Restart
        } else {
            RecoveryOutcome::Fail
        }
    }

    fn escalate<S: TransferService>(&mut self, service: &mut S, outcome: RecoveryOutcome) {
        tracing::warn!(
            handle = self.id.raw(),
            phase = ?self.command.phase,
            retries = self.command.retries,
            ?outcome,
            "escalating to mass-storage reset recovery"
        );
        self.command.phase = CommandPhase::ErrorDone;
        if let Err(err) = self.start_reset(service, RecoveryOrigin::Internal(outcome)) {
            tracing::warn!(handle = self.id.raw(), %err, "failed to start reset recovery");
            self.complete_command(CompletionStatus::Error);
        }
    }

    fn clear_halt<S: TransferService>(&mut self, service: &mut S, direction: Direction) {
        let Some(address) = self.pipes.endpoint_address(direction) else {
            self.complete_command(CompletionStatus::Error);
            return;
        };
        match self.begin_control(service, clear_halt_setup(address), &[]) {
            Ok(transfer) => {
                tracing::debug!(handle = self.id.raw(), endpoint = address, "clearing endpoint halt");
                self.control = Some(ControlInflight {
                    transfer,
                    op: ControlOp::ClearHalt,
                });
            }
            Err(err) => {
                tracing::warn!(handle = self.id.raw(), endpoint = address, %err, "failed to send clear halt");
                self.complete_command(CompletionStatus::Error);
            }
        }
    }

    pub(crate) fn on_clear_halt_done<S: TransferService>(&mut self, service: &mut S, status: TransferStatus) {
        match status {
            TransferStatus::Success => self.continue_command(service),
            TransferStatus::Cancel => self.complete_command(CompletionStatus::TransferCancel),
            TransferStatus::Stall | TransferStatus::Error => {
                self.complete_command(CompletionStatus::Error)
            }
        }
    }

    pub(crate) fn on_command_event<S: TransferService>(&mut self, service: &mut S, event: TransferEvent) {
        if !self.command.in_flight {
            tracing::debug!(
                handle = self.id.raw(),
                status = ?event.status,
                "dropping bulk completion with no transfer in flight"
            );
            return;
        }
        self.command.in_flight = false;
        match self.command.phase {
            CommandPhase::TransferCbw => self.on_cbw_done(service, event),
            CommandPhase::TransferData => self.on_data_done(service, event),
            CommandPhase::TransferCsw => self.on_csw_done(service, event),
            phase => {
                tracing::debug!(
                    handle = self.id.raw(),
                    ?phase,
                    status = ?event.status,
                    "dropping bulk completion outside of a transfer phase"
                );
            }
        }
    }

    fn on_cbw_done<S: TransferService>(&mut self, service: &mut S, event: TransferEvent) {
        match event.status {
            TransferStatus::Success if event.actual == CBW_LEN => {
                self.command.phase = if self.command.data_len() > 0 {
                    CommandPhase::TransferData
                } else {
                    CommandPhase::TransferCsw
                };
                self.continue_command(service);
            }
            TransferStatus::Stall => {
                if self.consume_retry() {
                    self.clear_halt(service, Direction::Out);
                } else {
                    let outcome = self.retry_exhausted_outcome();
                    self.escalate(service, outcome);
                }
            }
            TransferStatus::Cancel => self.complete_command(CompletionStatus::TransferCancel),
            // Short CBW or transfer error.
            TransferStatus::Success | TransferStatus::Error => {
                if self.consume_retry() {
                    self.continue_command(service);
                } else {
                    let outcome = self.retry_exhausted_outcome();
                    self.escalate(service, outcome);
                }
            }
        }
    }

    fn on_data_done<S: TransferService>(&mut self, service: &mut S, event: TransferEvent) {
        match event.status {
            TransferStatus::Success => {
                let cmd = &mut self.command;
                let sofar = cmd.data_sofar;
                if cmd.direction == Direction::In {
                    if let Some(buffer) = cmd.buffer.as_mut() {
                        let n = event.data.len().min(buffer.len() - sofar);
                        buffer[sofar..sofar + n].copy_from_slice(&event.data[..n]);
                    }
                }
                cmd.data_sofar = (sofar + event.actual).min(cmd.data_len());
                if cmd.data_sofar >= cmd.data_len() {
                    cmd.phase = CommandPhase::TransferCsw;
                }
                self.continue_command(service);
            }
            TransferStatus::Stall => {
                // Out of retries: clear the halt anyway and move on to the CSW. After a data
                // stall a BOT device still reports status, so the command ends on its CSW
                // instead of a reset.
                if !self.consume_retry() {
                    self.command.phase = CommandPhase::TransferCsw;
                }
                let direction = self.command.direction;
                self.clear_halt(service, direction);
            }
            TransferStatus::Cancel => self.complete_command(CompletionStatus::TransferCancel),
            TransferStatus::Error => self.escalate(service, RecoveryOutcome::Fail),
        }
    }

    fn on_csw_done<S: TransferService>(&mut self, service: &mut S, event: TransferEvent) {
        match event.status {
            TransferStatus::Success => {
                let received = &event.data[..event.actual.min(event.data.len())];
                match CommandStatusWrapper::decode(received) {
                    Ok(csw) => {
                        tracing::trace!(
                            handle = self.id.raw(),
                            tag = csw.tag,
                            residue = csw.residue,
                            status = ?csw.status,
                            "CSW in"
                        );
                        match csw.status {
                            CswStatus::Passed => {
                                self.command.phase = CommandPhase::Done;
                                self.complete_command(CompletionStatus::Success);
                            }
                            CswStatus::PhaseError => self.escalate(service, RecoveryOutcome::Fail),
                            CswStatus::Failed | CswStatus::Reserved(_) => {
                                self.complete_command(CompletionStatus::StatusFail)
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(handle = self.id.raw(), %err, "invalid CSW");
                        self.escalate(service, RecoveryOutcome::Fail);
                    }
                }
            }
            TransferStatus::Stall => {
                if self.consume_retry() {
                    self.clear_halt(service, Direction::In);
                } else {
                    let outcome = self.retry_exhausted_outcome();
                    self.escalate(service, outcome);
                }
            }
            TransferStatus::Cancel => self.complete_command(CompletionStatus::TransferCancel),
            TransferStatus::Error => {
                if self.consume_retry() {
                    self.continue_command(service);
                } else {
                    let outcome = self.retry_exhausted_outcome();
                    self.escalate(service, outcome);
                }
            }
        }
    }
}
