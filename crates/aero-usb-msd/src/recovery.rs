//! Bulk-only mass storage reset recovery.
//!
//! Recovery is the three control requests that Bulk-Only Transport defines, each gated on the
//! previous one succeeding:
//!
//! 1. class request Bulk-Only Mass Storage Reset,
//! 2. CLEAR_FEATURE(ENDPOINT_HALT) on bulk IN (skipped if no IN pipe is open),
//! 3. CLEAR_FEATURE(ENDPOINT_HALT) on bulk OUT (skipped if no OUT pipe is open).
//!
//! The sequence occupies the device's single control slot, so a second reset (or any other
//! control request) is rejected with `Busy` while one is running. The [`RecoveryOrigin`] rides
//! along in the slot and decides who hears about the result: the application's own callback, or
//! the command that escalated.

use crate::command::{Completion, CompletionCallback, CompletionStatus};
use crate::driver::{ControlInflight, ControlOp, MsdInstance};
use crate::error::{MsdError, Result};
use crate::transfer::{Direction, RequestType, SetupPacket, TransferService, TransferStatus};

pub(crate) const REQUEST_MASS_STORAGE_RESET: u8 = 0xff;
pub(crate) const REQUEST_GET_MAX_LUN: u8 = 0xfe;

const USB_REQUEST_CLEAR_FEATURE: u8 = 0x01;
const USB_FEATURE_ENDPOINT_HALT: u16 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ResetStep {
    MassStorageReset,
    ClearHaltIn,
    ClearHaltOut,
}

/// What happens to the escalating command once recovery succeeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecoveryOutcome {
    /// Complete the command with `Error`.
    Fail,
    /// Run the command again from its CBW.
    Restart,
}

pub(crate) enum RecoveryOrigin {
    /// Requested through `mass_storage_reset`; the callback receives the final status.
    Application(CompletionCallback),
    /// Triggered by a failing command.
    Internal(RecoveryOutcome),
}

/// Observable summary of a recovery in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecoveryKind {
    Application,
    Internal(RecoveryOutcome),
}

impl RecoveryOrigin {
    pub(crate) fn kind(&self) -> RecoveryKind {
        match self {
            RecoveryOrigin::Application(_) => RecoveryKind::Application,
            RecoveryOrigin::Internal(outcome) => RecoveryKind::Internal(*outcome),
        }
    }
}

pub(crate) fn clear_halt_setup(endpoint_address: u8) -> SetupPacket {
    SetupPacket {
        request_type: RequestType::RECIPIENT_ENDPOINT.bits(),
        request: USB_REQUEST_CLEAR_FEATURE,
        value: USB_FEATURE_ENDPOINT_HALT,
        index: u16::from(endpoint_address),
        length: 0,
    }
}

fn mass_storage_reset_setup(interface: u8) -> SetupPacket {
    SetupPacket {
        request_type: (RequestType::TYPE_CLASS | RequestType::RECIPIENT_INTERFACE).bits(),
        request: REQUEST_MASS_STORAGE_RESET,
        value: 0,
        index: u16::from(interface),
        length: 0,
    }
}

impl MsdInstance {
    pub(crate) fn start_reset<S: TransferService>(
        &mut self,
        service: &mut S,
        origin: RecoveryOrigin,
    ) -> Result<()> {
        let interface = self.interface.as_ref().ok_or(MsdError::NoInterface)?.number;
        let transfer = self.begin_control(service, mass_storage_reset_setup(interface), &[])?;
        tracing::debug!(handle = self.id.raw(), origin = ?origin.kind(), "mass storage reset");
        self.control = Some(ControlInflight {
            transfer,
            op: ControlOp::Reset {
                step: ResetStep::MassStorageReset,
                origin,
            },
        });
        Ok(())
    }

    fn next_reset_step(&self, after: ResetStep) -> Option<ResetStep> {
        let candidates: &[(ResetStep, Direction)] = match after {
            ResetStep::MassStorageReset => &[
                (ResetStep::ClearHaltIn, Direction::In),
                (ResetStep::ClearHaltOut, Direction::Out),
            ],
            ResetStep::ClearHaltIn => &[(ResetStep::ClearHaltOut, Direction::Out)],
            ResetStep::ClearHaltOut => &[],
        };
        candidates
            .iter()
            .find(|(_, direction)| self.pipes.get(*direction).is_some())
            .map(|(step, _)| *step)
    }

    fn issue_clear_halt_step<S: TransferService>(
        &mut self,
        service: &mut S,
        step: ResetStep,
        origin: RecoveryOrigin,
    ) {
        let direction = match step {
            ResetStep::ClearHaltIn => Direction::In,
            _ => Direction::Out,
        };
        let Some(address) = self.pipes.endpoint_address(direction) else {
            self.reset_done(service, origin, CompletionStatus::Error);
            return;
        };
        match self.begin_control(service, clear_halt_setup(address), &[]) {
            Ok(transfer) => {
                tracing::debug!(handle = self.id.raw(), ?step, endpoint = address, "reset recovery step");
                self.control = Some(ControlInflight {
                    transfer,
                    op: ControlOp::Reset { step, origin },
                });
            }
            Err(err) => {
                tracing::warn!(handle = self.id.raw(), ?step, %err, "failed to send reset recovery step");
                self.reset_done(service, origin, CompletionStatus::Error);
            }
        }
    }

    pub(crate) fn on_reset_step_done<S: TransferService>(
        &mut self,
        service: &mut S,
        step: ResetStep,
        origin: RecoveryOrigin,
        status: TransferStatus,
    ) {
        if status != TransferStatus::Success {
            tracing::warn!(handle = self.id.raw(), ?step, ?status, "reset recovery step failed");
            self.reset_done(service, origin, status.into());
            return;
        }
        match self.next_reset_step(step) {
            Some(next) => self.issue_clear_halt_step(service, next, origin),
            None => self.reset_done(service, origin, CompletionStatus::Success),
        }
    }

    /// Delivers the recovery result to whoever requested it. The origin is consumed here, so no
    /// recovery state survives this call.
    fn reset_done<S: TransferService>(
        &mut self,
        service: &mut S,
        origin: RecoveryOrigin,
        status: CompletionStatus,
    ) {
        tracing::debug!(handle = self.id.raw(), origin = ?origin.kind(), ?status, "reset recovery done");
        match origin {
            RecoveryOrigin::Internal(RecoveryOutcome::Restart) if status == CompletionStatus::Success => {
                self.restart_command(service);
            }
            RecoveryOrigin::Internal(_) => self.complete_command(CompletionStatus::Error),
            RecoveryOrigin::Application(callback) => callback(Completion::status_only(status)),
        }
    }
}
