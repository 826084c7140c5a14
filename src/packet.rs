//! Session-management packet codec.
//!
//! SM packets form the out-of-band control plane: two request/response
//! exchanges (connect, disconnect) plus a fault-injection packet. The wire
//! layout is fixed-size and serialized explicitly, little-endian, so it is
//! stable across endpoints and compilers.

use crate::endpoint::{SessionEndpoint, ENDPOINT_WIRE_SIZE};
use crate::error::{Error, Result};

/// Wire size of a serialized SM packet.
///
/// Layout:
///
/// ```text
/// Offset  Size  Field
/// 0       2     pkt_type
/// 2       2     err_type
/// 4       4     (padding)
/// 8       128   client endpoint
/// 136     128   server endpoint
/// ```
pub const SM_PKT_WIRE_SIZE: usize = 8 + 2 * ENDPOINT_WIRE_SIZE;

const CLIENT_OFF: usize = 8;
const SERVER_OFF: usize = 8 + ENDPOINT_WIRE_SIZE;

/// Session-management packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SmPktType {
    /// Client requests a new session.
    ConnectReq = 1,
    /// Server's response to a connect request.
    ConnectResp = 2,
    /// Client requests session teardown.
    DisconnectReq = 3,
    /// Server's response to a disconnect request.
    DisconnectResp = 4,
    /// Fault injection: ask the receiver to drop its datapath TX.
    FaultDropTxRemote = 5,
}

impl SmPktType {
    /// True iff this type travels client-to-server.
    #[inline]
    pub fn is_req(self) -> bool {
        matches!(
            self,
            SmPktType::ConnectReq | SmPktType::DisconnectReq | SmPktType::FaultDropTxRemote
        )
    }

    /// True iff this type is a response to a request.
    #[inline]
    pub fn is_resp(self) -> bool {
        matches!(self, SmPktType::ConnectResp | SmPktType::DisconnectResp)
    }

    /// True iff a request of this type expects a response.
    #[inline]
    pub fn has_resp(self) -> bool {
        matches!(self, SmPktType::ConnectReq | SmPktType::DisconnectReq)
    }

    /// The response type matching this request type.
    ///
    /// # Panics
    /// Panics if `self` is not a request type with a response.
    pub fn to_resp(self) -> SmPktType {
        match self {
            SmPktType::ConnectReq => SmPktType::ConnectResp,
            SmPktType::DisconnectReq => SmPktType::DisconnectResp,
            _ => unreachable!("no response type for {:?}", self),
        }
    }
}

impl TryFrom<u16> for SmPktType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(SmPktType::ConnectReq),
            2 => Ok(SmPktType::ConnectResp),
            3 => Ok(SmPktType::DisconnectReq),
            4 => Ok(SmPktType::DisconnectResp),
            5 => Ok(SmPktType::FaultDropTxRemote),
            _ => Err(Error::InvalidSmPktType(value)),
        }
    }
}

/// Session-management error type carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SmErrType {
    NoError = 0,
    /// The server's session table is at capacity.
    TooManySessions = 1,
    /// The server could not allocate session resources.
    OutOfMemory = 2,
    /// Remote routing information could not be resolved.
    RoutingResolutionFailure = 3,
    /// No endpoint with the requested ID exists at the destination.
    InvalidRemoteEndpointId = 4,
    /// A session for this client endpoint already exists at the server.
    ClientEndpointExists = 5,
}

impl TryFrom<u16> for SmErrType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(SmErrType::NoError),
            1 => Ok(SmErrType::TooManySessions),
            2 => Ok(SmErrType::OutOfMemory),
            3 => Ok(SmErrType::RoutingResolutionFailure),
            4 => Ok(SmErrType::InvalidRemoteEndpointId),
            5 => Ok(SmErrType::ClientEndpointExists),
            _ => Err(Error::InvalidSmErrType(value)),
        }
    }
}

/// Session event reported to the application's session-management handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventType {
    Connected,
    ConnectFailed,
    Disconnected,
    DisconnectFailed,
}

/// A session-management packet.
///
/// A response carries the exact `client` and `server` endpoints of the
/// originating request, with `err_type` possibly non-`NoError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmPkt {
    pub pkt_type: SmPktType,
    pub err_type: SmErrType,
    pub client: SessionEndpoint,
    pub server: SessionEndpoint,
}

impl SmPkt {
    /// Create a packet with `err_type = NoError`.
    pub fn new(pkt_type: SmPktType, client: SessionEndpoint, server: SessionEndpoint) -> Self {
        Self {
            pkt_type,
            err_type: SmErrType::NoError,
            client,
            server,
        }
    }

    /// True iff this packet travels client-to-server.
    #[inline]
    pub fn is_req(&self) -> bool {
        self.pkt_type.is_req()
    }

    /// The endpoint ID this packet must be routed to: the server's for
    /// requests, the client's for responses.
    #[inline]
    pub fn dst_endpoint_id(&self) -> u8 {
        if self.is_req() {
            self.server.endpoint_id
        } else {
            self.client.endpoint_id
        }
    }

    /// The hostname this packet must be routed to.
    pub fn dst_hostname(&self) -> &str {
        if self.is_req() {
            self.server.hostname_str()
        } else {
            self.client.hostname_str()
        }
    }

    /// Serialize to the fixed wire representation.
    pub fn to_bytes(&self) -> [u8; SM_PKT_WIRE_SIZE] {
        let mut buf = [0u8; SM_PKT_WIRE_SIZE];
        buf[0..2].copy_from_slice(&(self.pkt_type as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&(self.err_type as u16).to_le_bytes());
        // Endpoint serialization cannot fail with a full-size buffer.
        self.client.to_bytes(&mut buf[CLIENT_OFF..SERVER_OFF]).unwrap();
        self.server.to_bytes(&mut buf[SERVER_OFF..]).unwrap();
        buf
    }

    /// Deserialize from the fixed wire representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SM_PKT_WIRE_SIZE {
            return Err(Error::BufferTooSmall {
                required: SM_PKT_WIRE_SIZE,
                available: bytes.len(),
            });
        }

        let pkt_type = SmPktType::try_from(u16::from_le_bytes([bytes[0], bytes[1]]))?;
        let err_type = SmErrType::try_from(u16::from_le_bytes([bytes[2], bytes[3]]))?;
        let client = SessionEndpoint::from_bytes(&bytes[CLIENT_OFF..SERVER_OFF])?;
        let server = SessionEndpoint::from_bytes(&bytes[SERVER_OFF..])?;

        Ok(Self {
            pkt_type,
            err_type,
            client,
            server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{TransportType, SECRET_MASK};

    fn sample_pkt() -> SmPkt {
        let mut client = SessionEndpoint::new(TransportType::Udp, "client-host", 0, 1);
        client.session_num = 3;
        client.secret = 0x1234_5678_9abc & SECRET_MASK;

        let mut server = SessionEndpoint::new(TransportType::Udp, "server-host", 0, 2);
        server.secret = client.secret;

        SmPkt::new(SmPktType::ConnectReq, client, server)
    }

    #[test]
    fn test_sm_pkt_roundtrip() {
        let pkt = sample_pkt();
        let bytes = pkt.to_bytes();
        let pkt2 = SmPkt::from_bytes(&bytes).unwrap();
        assert_eq!(pkt, pkt2);
    }

    #[test]
    fn test_sm_pkt_wire_layout() {
        let pkt = sample_pkt();
        let bytes = pkt.to_bytes();

        assert_eq!(bytes.len(), 264);
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), 1); // ConnectReq
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 0); // NoError
        assert_eq!(&bytes[8 + 4..8 + 4 + 11], b"client-host");
        assert_eq!(&bytes[136 + 4..136 + 4 + 11], b"server-host");
    }

    #[test]
    fn test_sm_pkt_rejects_unknown_type() {
        let mut bytes = sample_pkt().to_bytes();
        bytes[0] = 0xff;
        assert!(SmPkt::from_bytes(&bytes).is_err());

        let mut bytes = sample_pkt().to_bytes();
        bytes[2] = 0xff;
        assert!(SmPkt::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_req_resp_mapping() {
        assert_eq!(SmPktType::ConnectReq.to_resp(), SmPktType::ConnectResp);
        assert_eq!(SmPktType::DisconnectReq.to_resp(), SmPktType::DisconnectResp);
        assert!(SmPktType::ConnectReq.is_req());
        assert!(SmPktType::FaultDropTxRemote.is_req());
        assert!(!SmPktType::FaultDropTxRemote.has_resp());
        assert!(SmPktType::ConnectResp.is_resp());
    }

    #[test]
    fn test_dst_endpoint_id() {
        let pkt = sample_pkt();
        assert_eq!(pkt.dst_endpoint_id(), 2);
        assert_eq!(pkt.dst_hostname(), "server-host");

        let mut resp = pkt;
        resp.pkt_type = SmPktType::ConnectResp;
        assert_eq!(resp.dst_endpoint_id(), 1);
        assert_eq!(resp.dst_hostname(), "client-host");
    }
}
