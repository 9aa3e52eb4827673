//! Control bytes.
//!
//! Every frame starts with exactly one control byte. Only [`DATA`] frames
//! carry a length and payload.

use crate::error::FrameError;

/// The sender is alive and ready to receive.
pub const CONNECT: u8 = 1;

/// The sender is going away; no more frames follow.
pub const DISCONNECT: u8 = 2;

/// A length-prefixed data packet follows.
pub const DATA: u8 = 3;

/// A decoded control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlByte {
    Connect = CONNECT,
    Disconnect = DISCONNECT,
    Data = DATA,
}

impl ControlByte {
    /// The wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name for logs and diagnostics.
    pub fn name(self) -> &'static str {
        control_name(self.as_u8())
    }
}

impl TryFrom<u8> for ControlByte {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            CONNECT => Ok(Self::Connect),
            DISCONNECT => Ok(Self::Disconnect),
            DATA => Ok(Self::Data),
            other => Err(FrameError::UnknownControlByte(other)),
        }
    }
}

/// Returns a human-readable name for a control byte.
pub fn control_name(byte: u8) -> &'static str {
    match byte {
        CONNECT => "CONNECT",
        DISCONNECT => "DISCONNECT",
        DATA => "DATA",
        _ => "UNKNOWN",
    }
}
