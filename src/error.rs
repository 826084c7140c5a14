//! Error types for udrpc.

use std::fmt;

/// Error type for udrpc setup and codec operations.
///
/// The session-management plane itself never raises across the API
/// boundary: fail-soft paths log and return `None`/`false`, and malformed
/// packets are discarded. These errors surface only from construction and
/// from explicit wire decoding.
#[derive(Debug)]
pub enum Error {
    /// IO error from the management socket.
    Io(std::io::Error),
    /// An endpoint with this ID is already registered with the Nexus.
    EndpointIdExists(u8),
    /// A request handler is already registered for this request type.
    ReqFuncExists(u8),
    /// Request handlers must be registered before any endpoint is created.
    ReqFuncRegistryFrozen,
    /// Invalid session-management packet type on the wire.
    InvalidSmPktType(u16),
    /// Invalid session-management error type on the wire.
    InvalidSmErrType(u16),
    /// Invalid transport type on the wire.
    InvalidTransportType(u8),
    /// Buffer too small to hold the encoded or decoded value.
    BufferTooSmall { required: usize, available: usize },
    /// Invalid configuration.
    InvalidConfig(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::EndpointIdExists(id) => write!(f, "Endpoint ID {} already exists", id),
            Error::ReqFuncExists(ty) => {
                write!(f, "Request handler for type {} already exists", ty)
            }
            Error::ReqFuncRegistryFrozen => {
                write!(f, "Request handlers must be registered before endpoint creation")
            }
            Error::InvalidSmPktType(t) => write!(f, "Invalid SM packet type: {}", t),
            Error::InvalidSmErrType(t) => write!(f, "Invalid SM error type: {}", t),
            Error::InvalidTransportType(t) => write!(f, "Invalid transport type: {}", t),
            Error::BufferTooSmall { required, available } => {
                write!(
                    f,
                    "Buffer too small: required {} bytes, available {} bytes",
                    required, available
                )
            }
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for udrpc operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes returned by the datapath enqueue API.
///
/// The numeric values and their string mappings are stable; applications
/// may match on either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DatapathErrCode {
    /// The session argument is unknown, not a client, or not connected.
    InvalidSessionArg = 1,
    /// The message buffer argument is invalid or failed its magic check.
    InvalidMsgBufferArg,
    /// The message size is zero or exceeds the limit.
    InvalidMsgSizeArg,
    /// The request type is out of range.
    InvalidReqTypeArg,
    /// No request handler is registered for this request type.
    InvalidReqFuncArg,
    /// All message slots of this session are in flight.
    NoSessionMsgSlots,
}

impl DatapathErrCode {
    /// The stable integer value of this error code.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The stable string mapping of this error code.
    pub fn as_str(self) -> &'static str {
        match self {
            DatapathErrCode::InvalidSessionArg => "[Invalid session argument]",
            DatapathErrCode::InvalidMsgBufferArg => "[Invalid MsgBuffer argument]",
            DatapathErrCode::InvalidMsgSizeArg => "[Invalid message size argument]",
            DatapathErrCode::InvalidReqTypeArg => "[Invalid request type argument]",
            DatapathErrCode::InvalidReqFuncArg => "[Invalid request function argument]",
            DatapathErrCode::NoSessionMsgSlots => "[No session message slots]",
        }
    }
}

impl fmt::Display for DatapathErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datapath_err_codes_stable() {
        assert_eq!(DatapathErrCode::InvalidSessionArg.code(), 1);
        assert_eq!(DatapathErrCode::InvalidMsgBufferArg.code(), 2);
        assert_eq!(DatapathErrCode::InvalidMsgSizeArg.code(), 3);
        assert_eq!(DatapathErrCode::InvalidReqTypeArg.code(), 4);
        assert_eq!(DatapathErrCode::InvalidReqFuncArg.code(), 5);
        assert_eq!(DatapathErrCode::NoSessionMsgSlots.code(), 6);
    }

    #[test]
    fn test_datapath_err_strings_stable() {
        assert_eq!(
            DatapathErrCode::NoSessionMsgSlots.as_str(),
            "[No session message slots]"
        );
        assert_eq!(
            DatapathErrCode::InvalidSessionArg.to_string(),
            "[Invalid session argument]"
        );
    }
}
