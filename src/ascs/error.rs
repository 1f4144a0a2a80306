use instructor::{Exstruct, Instruct};
use thiserror::Error;

use crate::ascs::endpoint::AseState;
use crate::iso::TransportError;

// ([ASCS] Section 5 Table 5.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct, Error)]
#[repr(u8)]
pub enum ResponseCode {
    #[error("Success")]
    Success = 0x00,
    #[error("Unsupported Opcode")]
    UnsupportedOpcode = 0x01,
    #[error("Invalid Length")]
    InvalidLength = 0x02,
    #[error("Invalid ASE_ID")]
    InvalidAseId = 0x03,
    #[error("Invalid ASE State Machine Transition")]
    InvalidAseState = 0x04,
    #[error("Invalid ASE direction")]
    InvalidAseDirection = 0x05,
    #[error("Unsupported Audio Capabilities")]
    UnsupportedAudioCapabilities = 0x06,
    #[error("Unsupported Configuration Parameter value")]
    ConfUnsupported = 0x07,
    #[error("Rejected Configuration Parameter value")]
    ConfRejected = 0x08,
    #[error("Invalid Configuration Parameter value")]
    ConfInvalid = 0x09,
    #[error("Unsupported Metadata")]
    MetadataUnsupported = 0x0A,
    #[error("Rejected Metadata")]
    MetadataRejected = 0x0B,
    #[error("Invalid Metadata")]
    MetadataInvalid = 0x0C,
    #[error("Insufficient Resources")]
    InsufficientResources = 0x0D,
    #[error("Unspecified Error")]
    Unspecified = 0x0E
}

/// Reason values for the configuration response codes ([ASCS] Section 5 Table 5.2).
///
/// Metadata response codes carry the offending metadata type in the reason field instead.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum Reason {
    None = 0x00,
    CodecId = 0x01,
    CodecSpecificConfiguration = 0x02,
    SduInterval = 0x03,
    Framing = 0x04,
    Phy = 0x05,
    MaxSdu = 0x06,
    Rtn = 0x07,
    MaxTransportLatency = 0x08,
    PresentationDelay = 0x09,
    InvalidAseCisMapping = 0x0A
}

/// A response code together with its raw reason byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("{code} (reason 0x{reason:02X})")]
pub struct Rsp {
    pub code: ResponseCode,
    pub reason: u8
}

impl Rsp {
    pub const SUCCESS: Rsp = Rsp { code: ResponseCode::Success, reason: 0x00 };

    pub const fn new(code: ResponseCode, reason: Reason) -> Self {
        Self { code, reason: reason as u8 }
    }

    pub const fn metadata(code: ResponseCode, kind: u8) -> Self {
        Self { code, reason: kind }
    }

    pub const fn code(code: ResponseCode) -> Self {
        Self { code, reason: 0x00 }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success
    }

    /// A rejection must never be reported as success.
    pub fn normalize(self) -> Self {
        match self.code {
            ResponseCode::Success => Rsp::code(ResponseCode::Unspecified),
            _ => self
        }
    }
}

impl From<ResponseCode> for Rsp {
    fn from(code: ResponseCode) -> Self {
        Rsp::code(code)
    }
}

impl From<instructor::Error> for ResponseCode {
    fn from(_: instructor::Error) -> Self {
        ResponseCode::InvalidLength
    }
}

impl From<instructor::Error> for Rsp {
    fn from(value: instructor::Error) -> Self {
        Rsp::code(value.into())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    #[error("ASE id is out of range")]
    InvalidAseId,
    #[error("No such ASE")]
    UnknownAse,
    #[error("Operation is not allowed in state {0:?}")]
    InvalidState(AseState),
    #[error("Operation is not allowed for this ASE direction")]
    InvalidDirection,
    #[error("The connection is not established")]
    NotConnected,
    #[error("No free resources")]
    NoMemory,
    #[error("Value does not fit a one byte length field")]
    InvalidLength,
    #[error("Rejected: {0}")]
    Rejected(Rsp),
    #[error("No binding exists for this channel")]
    UnknownChannel,
    #[error(transparent)]
    Transport(#[from] TransportError)
}

impl From<Rsp> for Error {
    fn from(value: Rsp) -> Self {
        Error::Rejected(value)
    }
}
