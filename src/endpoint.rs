//! Session endpoint: the addressing tuple identifying one side of a session.

use std::fmt;

use crate::error::{Error, Result};

/// Maximum hostname length, excluding the NUL terminator.
pub const MAX_HOSTNAME_LEN: usize = 63;

/// Size of the opaque routing-info blob carried in every endpoint.
pub const ROUTING_INFO_LEN: usize = 48;

/// Number of meaningful low bits in a session secret.
pub const SECRET_BITS: u32 = 48;

/// Mask selecting the meaningful bits of a session secret.
pub const SECRET_MASK: u64 = (1u64 << SECRET_BITS) - 1;

/// Wire size of a serialized endpoint.
///
/// Layout (little-endian, stable across implementations):
///
/// ```text
/// Offset  Size  Field
/// 0       1     transport_type
/// 1       3     (padding)
/// 4       64    hostname, NUL-terminated
/// 68      1     phy_port
/// 69      1     endpoint_id
/// 70      2     session_num
/// 72      8     secret (low SECRET_BITS meaningful)
/// 80      48    routing_info
/// ```
pub const ENDPOINT_WIRE_SIZE: usize = 128;

const HOSTNAME_OFF: usize = 4;
const PHY_PORT_OFF: usize = 68;
const ENDPOINT_ID_OFF: usize = 69;
const SESSION_NUM_OFF: usize = 70;
const SECRET_OFF: usize = 72;
const ROUTING_INFO_OFF: usize = 80;

/// The unreliable transport variant an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportType {
    /// Datagrams over a UDP socket.
    Udp = 1,
    /// In-memory transport for testing.
    Fake = 2,
}

impl TryFrom<u8> for TransportType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(TransportType::Udp),
            2 => Ok(TransportType::Fake),
            _ => Err(Error::InvalidTransportType(value)),
        }
    }
}

/// Opaque routing blob whose interpretation belongs to the transport.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RoutingInfo {
    pub buf: [u8; ROUTING_INFO_LEN],
}

impl RoutingInfo {
    /// A zeroed, unresolved routing blob.
    pub fn zeroed() -> Self {
        Self { buf: [0u8; ROUTING_INFO_LEN] }
    }
}

impl Default for RoutingInfo {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for RoutingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingInfo({:02x?}...)", &self.buf[..8])
    }
}

/// The addressing tuple identifying one side of a session.
///
/// A connected session pair carries the same `secret` in both copies;
/// `session_num` on each side indexes the owner's session table.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionEndpoint {
    pub transport_type: TransportType,
    /// NUL-terminated hostname bytes.
    pub hostname: [u8; MAX_HOSTNAME_LEN + 1],
    pub phy_port: u8,
    pub endpoint_id: u8,
    pub session_num: u16,
    /// Only the low `SECRET_BITS` are meaningful.
    pub secret: u64,
    pub routing_info: RoutingInfo,
}

impl SessionEndpoint {
    /// Create an endpoint with the given identity and a zeroed routing blob.
    ///
    /// `hostname` must be at most `MAX_HOSTNAME_LEN` bytes; callers
    /// validate this before constructing endpoints.
    pub fn new(
        transport_type: TransportType,
        hostname: &str,
        phy_port: u8,
        endpoint_id: u8,
    ) -> Self {
        debug_assert!(hostname.len() <= MAX_HOSTNAME_LEN);

        let mut hostname_buf = [0u8; MAX_HOSTNAME_LEN + 1];
        let len = hostname.len().min(MAX_HOSTNAME_LEN);
        hostname_buf[..len].copy_from_slice(&hostname.as_bytes()[..len]);

        Self {
            transport_type,
            hostname: hostname_buf,
            phy_port,
            endpoint_id,
            session_num: 0,
            secret: 0,
            routing_info: RoutingInfo::zeroed(),
        }
    }

    /// The hostname as a string slice, up to the NUL terminator.
    pub fn hostname_str(&self) -> &str {
        let len = self
            .hostname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.hostname.len());
        std::str::from_utf8(&self.hostname[..len]).unwrap_or("")
    }

    /// True iff `other` names the same RPC endpoint (hostname and
    /// endpoint ID), regardless of session identity.
    #[inline]
    pub fn same_rpc(&self, hostname: &str, endpoint_id: u8) -> bool {
        self.endpoint_id == endpoint_id && self.hostname_str() == hostname
    }

    /// A short "hostname:endpoint_id" name for diagnostics.
    pub fn rpc_name(&self) -> String {
        format!("{}:{}", self.hostname_str(), self.endpoint_id)
    }

    /// Serialize into `out`, which must hold `ENDPOINT_WIRE_SIZE` bytes.
    pub fn to_bytes(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < ENDPOINT_WIRE_SIZE {
            return Err(Error::BufferTooSmall {
                required: ENDPOINT_WIRE_SIZE,
                available: out.len(),
            });
        }

        out[..ENDPOINT_WIRE_SIZE].fill(0);
        out[0] = self.transport_type as u8;
        out[HOSTNAME_OFF..HOSTNAME_OFF + MAX_HOSTNAME_LEN + 1].copy_from_slice(&self.hostname);
        out[PHY_PORT_OFF] = self.phy_port;
        out[ENDPOINT_ID_OFF] = self.endpoint_id;
        out[SESSION_NUM_OFF..SESSION_NUM_OFF + 2].copy_from_slice(&self.session_num.to_le_bytes());
        out[SECRET_OFF..SECRET_OFF + 8].copy_from_slice(&self.secret.to_le_bytes());
        out[ROUTING_INFO_OFF..ROUTING_INFO_OFF + ROUTING_INFO_LEN]
            .copy_from_slice(&self.routing_info.buf);
        Ok(())
    }

    /// Deserialize from `bytes`, which must hold `ENDPOINT_WIRE_SIZE` bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENDPOINT_WIRE_SIZE {
            return Err(Error::BufferTooSmall {
                required: ENDPOINT_WIRE_SIZE,
                available: bytes.len(),
            });
        }

        let transport_type = TransportType::try_from(bytes[0])?;

        let mut hostname = [0u8; MAX_HOSTNAME_LEN + 1];
        hostname.copy_from_slice(&bytes[HOSTNAME_OFF..HOSTNAME_OFF + MAX_HOSTNAME_LEN + 1]);

        let mut routing_info = RoutingInfo::zeroed();
        routing_info
            .buf
            .copy_from_slice(&bytes[ROUTING_INFO_OFF..ROUTING_INFO_OFF + ROUTING_INFO_LEN]);

        Ok(Self {
            transport_type,
            hostname,
            phy_port: bytes[PHY_PORT_OFF],
            endpoint_id: bytes[ENDPOINT_ID_OFF],
            session_num: u16::from_le_bytes([bytes[SESSION_NUM_OFF], bytes[SESSION_NUM_OFF + 1]]),
            secret: u64::from_le_bytes(bytes[SECRET_OFF..SECRET_OFF + 8].try_into().unwrap()),
            routing_info,
        })
    }
}

impl fmt::Debug for SessionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEndpoint")
            .field("transport_type", &self.transport_type)
            .field("hostname", &self.hostname_str())
            .field("phy_port", &self.phy_port)
            .field("endpoint_id", &self.endpoint_id)
            .field("session_num", &self.session_num)
            .field("secret", &format_args!("{:#x}", self.secret))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_endpoint() -> SessionEndpoint {
        let mut ep = SessionEndpoint::new(TransportType::Udp, "host-a", 1, 7);
        ep.session_num = 42;
        ep.secret = 0xdead_beef_cafe & SECRET_MASK;
        ep.routing_info.buf[0] = 0xaa;
        ep.routing_info.buf[ROUTING_INFO_LEN - 1] = 0xbb;
        ep
    }

    #[test]
    fn test_endpoint_roundtrip() {
        let ep = sample_endpoint();
        let mut buf = [0u8; ENDPOINT_WIRE_SIZE];
        ep.to_bytes(&mut buf).unwrap();

        let ep2 = SessionEndpoint::from_bytes(&buf).unwrap();
        assert_eq!(ep, ep2);
        assert_eq!(ep2.hostname_str(), "host-a");
    }

    #[test]
    fn test_endpoint_wire_offsets() {
        let ep = sample_endpoint();
        let mut buf = [0u8; ENDPOINT_WIRE_SIZE];
        ep.to_bytes(&mut buf).unwrap();

        assert_eq!(buf[0], TransportType::Udp as u8);
        assert_eq!(&buf[4..10], b"host-a");
        assert_eq!(buf[68], 1); // phy_port
        assert_eq!(buf[69], 7); // endpoint_id
        assert_eq!(u16::from_le_bytes([buf[70], buf[71]]), 42);
        assert_eq!(
            u64::from_le_bytes(buf[72..80].try_into().unwrap()),
            0xdead_beef_cafe & SECRET_MASK
        );
        assert_eq!(buf[80], 0xaa);
        assert_eq!(buf[127], 0xbb);
    }

    #[test]
    fn test_endpoint_short_buffer() {
        let ep = sample_endpoint();
        let mut buf = [0u8; 16];
        assert!(ep.to_bytes(&mut buf).is_err());
        assert!(SessionEndpoint::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_same_rpc() {
        let ep = sample_endpoint();
        assert!(ep.same_rpc("host-a", 7));
        assert!(!ep.same_rpc("host-a", 8));
        assert!(!ep.same_rpc("host-b", 7));
    }

    #[test]
    fn test_secret_mask_width() {
        assert_eq!(SECRET_MASK.count_ones(), SECRET_BITS);
        assert_eq!(u64::MAX & SECRET_MASK, SECRET_MASK);
    }
}
