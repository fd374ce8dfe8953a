//! Error taxonomy for the module/routing fabric
//!
//! Every failure that crosses a component boundary is reported as an
//! [`ErrorCode`]; no panic is allowed to escape to the transport callback
//! edge. Responses carry the code as a status byte in the frame header.

use thiserror::Error;

/// Enumerated error codes propagated across the routing fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    /// Nil module, unparseable frame header, or similar caller mistake.
    #[error("invalid arguments")]
    InvalidArguments,

    /// Outbound buffer full; caller may drop or apply backpressure.
    #[error("send buffer overflow")]
    SendBufferOverflow,

    /// Mailbox still full after a drain retry.
    #[error("receive buffer overflow")]
    RecvBufferOverflow,

    /// Binding an egress callback failed; fatal to registration.
    #[error("failed to set send callback")]
    SetSendCallbackFailed,

    /// Request key unknown and no network module to fall back to.
    #[error("service id not found")]
    ServiceIdNotFound,

    /// Service-key collision on registration; all keys rolled back.
    #[error("service id already registered")]
    ServiceIdAlreadyRegistered,

    /// Duplicate module id on registration.
    #[error("module already registered")]
    ModuleAlreadyRegistered,

    /// The transport refused to start; fatal to the node.
    #[error("network start failed")]
    NetworkStartFailed,

    /// RPC deadline elapsed; resolved into the caller future.
    #[error("rpc timeout")]
    Timeout,
}

impl ErrorCode {
    /// Wire representation used in the response frame status byte.
    /// Zero is reserved for success.
    pub fn status_byte(self) -> u8 {
        match self {
            ErrorCode::InvalidArguments => 1,
            ErrorCode::SendBufferOverflow => 2,
            ErrorCode::RecvBufferOverflow => 3,
            ErrorCode::SetSendCallbackFailed => 4,
            ErrorCode::ServiceIdNotFound => 5,
            ErrorCode::ServiceIdAlreadyRegistered => 6,
            ErrorCode::ModuleAlreadyRegistered => 7,
            ErrorCode::NetworkStartFailed => 8,
            ErrorCode::Timeout => 9,
        }
    }

    /// Inverse of [`ErrorCode::status_byte`]. Unknown bytes map to
    /// `InvalidArguments` so a malformed peer cannot smuggle a success.
    pub fn from_status(status: u8) -> Option<ErrorCode> {
        match status {
            0 => None,
            1 => Some(ErrorCode::InvalidArguments),
            2 => Some(ErrorCode::SendBufferOverflow),
            3 => Some(ErrorCode::RecvBufferOverflow),
            4 => Some(ErrorCode::SetSendCallbackFailed),
            5 => Some(ErrorCode::ServiceIdNotFound),
            6 => Some(ErrorCode::ServiceIdAlreadyRegistered),
            7 => Some(ErrorCode::ModuleAlreadyRegistered),
            8 => Some(ErrorCode::NetworkStartFailed),
            9 => Some(ErrorCode::Timeout),
            _ => Some(ErrorCode::InvalidArguments),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_byte_round_trip() {
        let codes = [
            ErrorCode::InvalidArguments,
            ErrorCode::SendBufferOverflow,
            ErrorCode::RecvBufferOverflow,
            ErrorCode::SetSendCallbackFailed,
            ErrorCode::ServiceIdNotFound,
            ErrorCode::ServiceIdAlreadyRegistered,
            ErrorCode::ModuleAlreadyRegistered,
            ErrorCode::NetworkStartFailed,
            ErrorCode::Timeout,
        ];
        for code in codes {
            assert_eq!(ErrorCode::from_status(code.status_byte()), Some(code));
        }
        assert_eq!(ErrorCode::from_status(0), None);
    }

    #[test]
    fn unknown_status_is_not_success() {
        assert_eq!(
            ErrorCode::from_status(200),
            Some(ErrorCode::InvalidArguments)
        );
    }
}
