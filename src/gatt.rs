use instructor::{Exstruct, Instruct};
use thiserror::Error;

/// The ASCS characteristics a notification can target.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Characteristic {
    /// Sink or Source ASE characteristic, identified by its ASE id.
    Ase(u8),
    ControlPoint
}

// ([Vol 3] Part F, Section 3.4.1.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct, Error)]
#[repr(u8)]
pub enum AttError {
    #[error("The attribute handle given was not valid on this server")]
    InvalidHandle = 0x01,
    #[error("Offset specified was past the end of the attribute")]
    InvalidOffset = 0x07,
    #[error("The attribute value length is invalid for the operation")]
    InvalidAttributeValueLength = 0x0D,
    #[error("The attribute request could not be completed due to an unlikely error")]
    UnlikelyError = 0x0E,
    #[error("Insufficient resources to complete the request")]
    InsufficientResources = 0x11
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum NotifyError {
    #[error("No ATT transmit buffers available")]
    NoBuffers,
    #[error("The connection is not established")]
    NotConnected,
    #[error("ATT error: {0}")]
    Att(#[from] AttError)
}

/// The attribute server below ASCS.
///
/// Long writes are reassembled by the implementation; the control point only sees
/// complete writes.
pub trait GattServer: Send {
    fn notify(&mut self, conn: u16, characteristic: Characteristic, data: &[u8]) -> Result<(), NotifyError>;

    fn is_subscribed(&self, conn: u16, characteristic: Characteristic) -> bool;

    fn mtu(&self, conn: u16) -> u16;

    /// The current connection interval in units of 1.25 ms.
    fn connection_interval(&self, conn: u16) -> u16;
}
