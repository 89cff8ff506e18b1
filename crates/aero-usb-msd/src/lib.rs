//! Host-side USB Mass Storage class driver (Bulk-Only Transport).
//!
//! The driver sits between an application issuing SCSI/UFI commands and a host controller driver
//! that moves bytes on the bus. It never blocks and never owns the controller: every request is
//! split into transfers submitted through a [`TransferService`], and the driver only makes
//! progress when the host feeds a [`TransferEvent`] back through [`MsdHostDriver::advance`].
//!
//! ```text
//! application --command/reset/get_max_lun--> MsdHostDriver --send/recv/setup--> TransferService
//!      ^                                          |   ^                               |
//!      +-------------- Completion ----------------+   +------- TransferEvent ---------+
//! ```
//!
//! Every accepted request produces exactly one [`Completion`], including when the device is torn
//! down underneath it.

mod command;
mod config;
mod driver;
mod error;
mod pipe;
mod recovery;

pub mod transfer;
pub mod wire;

pub use command::{CommandPhase, Completion, CompletionCallback, CompletionStatus};
pub use config::{MsdConfig, DEFAULT_NAK_COUNT, DEFAULT_RETRY_BUDGET};
pub use driver::{ClassHandle, MsdHostDriver};
pub use error::{MsdError, Result};
pub use pipe::{EndpointDescriptor, InterfaceDescriptor};
pub use recovery::{RecoveryKind, RecoveryOutcome};
pub use transfer::{
    DeviceHandle, DeviceInfo, Direction, EndpointType, HostHandle, PipeHandle, PipeInit,
    RequestType, SetupPacket, TransferError, TransferEvent, TransferId, TransferService,
    TransferStatus,
};
