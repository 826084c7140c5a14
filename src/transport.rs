//! The unreliable datagram transport seam.
//!
//! The endpoint runtime is polymorphic over the transport capability set:
//! per-packet payload limit, routing-info handling, and burst send and
//! receive. A concrete variant is selected at construction. `UdpTransport`
//! carries datapath frames over a UDP socket; `FakeTransport` is an
//! in-memory variant for tests.

use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};

use log::warn;

use crate::buffer::PKT_HDR_SIZE;
use crate::endpoint::{RoutingInfo, TransportType};
use crate::error::Result;

/// Frames pulled per `rx_burst` call.
pub const RX_BURST_SIZE: usize = 32;

/// One datapath frame queued for transmission.
pub struct TxBurstItem {
    /// Resolved routing info of the destination.
    pub routing_info: RoutingInfo,
    /// Wire frame: packet header plus payload.
    pub frame: Vec<u8>,
}

/// The capability set the endpoint runtime needs from an unreliable
/// datagram transport.
pub trait Transport {
    /// The transport variant, carried in endpoint identities.
    fn transport_type(&self) -> TransportType;

    /// Maximum payload bytes per packet.
    fn max_data_per_pkt(&self) -> usize;

    /// Write this transport's local routing info into `ri`.
    fn fill_local_routing_info(&self, ri: &mut RoutingInfo);

    /// Resolve a peer's routing info in place, returning false if the
    /// blob cannot be interpreted.
    fn resolve_remote_routing_info(&self, ri: &mut RoutingInfo) -> bool;

    /// Transmit a burst of frames. Returns the number sent.
    fn tx_burst(&mut self, batch: &[TxBurstItem]) -> usize;

    /// Receive a burst of frames into `out`. Returns the number received.
    fn rx_burst(&mut self, out: &mut Vec<Vec<u8>>) -> usize;
}

// =============================================================================
// UdpTransport
// =============================================================================

/// Conservative UDP payload budget per datagram on an untagged MTU-1500
/// path.
pub const UDP_MTU: usize = 1472;

const RI_TAG_UDP: u8 = 0x01;

/// Datagram transport over a nonblocking UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind a datapath socket on an ephemeral port.
    pub fn new() -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Self { socket, local_addr })
    }

    /// The bound datapath address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn addr_from_routing_info(ri: &RoutingInfo) -> Option<SocketAddr> {
        if ri.buf[0] != RI_TAG_UDP {
            return None;
        }
        let ip = std::net::Ipv4Addr::new(ri.buf[1], ri.buf[2], ri.buf[3], ri.buf[4]);
        let port = u16::from_le_bytes([ri.buf[5], ri.buf[6]]);
        Some(SocketAddr::from((ip, port)))
    }
}

impl Transport for UdpTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    fn max_data_per_pkt(&self) -> usize {
        UDP_MTU - PKT_HDR_SIZE
    }

    fn fill_local_routing_info(&self, ri: &mut RoutingInfo) {
        ri.buf.fill(0);
        ri.buf[0] = RI_TAG_UDP;
        match self.local_addr {
            SocketAddr::V4(addr) => {
                ri.buf[1..5].copy_from_slice(&addr.ip().octets());
                ri.buf[5..7].copy_from_slice(&addr.port().to_le_bytes());
            }
            SocketAddr::V6(_) => {
                // The bind above is always v4.
                unreachable!("UdpTransport is IPv4-only");
            }
        }
    }

    fn resolve_remote_routing_info(&self, ri: &mut RoutingInfo) -> bool {
        Self::addr_from_routing_info(ri).is_some()
    }

    fn tx_burst(&mut self, batch: &[TxBurstItem]) -> usize {
        let mut sent = 0;
        for item in batch {
            let Some(dest) = Self::addr_from_routing_info(&item.routing_info) else {
                warn!("udp transport: unresolved routing info, dropping frame");
                continue;
            };
            match self.socket.send_to(&item.frame, dest) {
                Ok(_) => sent += 1,
                Err(e) => warn!("udp transport: send to {} failed: {}", dest, e),
            }
        }
        sent
    }

    fn rx_burst(&mut self, out: &mut Vec<Vec<u8>>) -> usize {
        let mut buf = [0u8; UDP_MTU];
        let mut n = 0;
        for _ in 0..RX_BURST_SIZE {
            match self.socket.recv_from(&mut buf) {
                Ok((len, _src)) => {
                    out.push(buf[..len].to_vec());
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }
}

// =============================================================================
// FakeTransport
// =============================================================================

const RI_TAG_FAKE: u8 = 0xFA;

/// In-memory transport for tests: records transmitted frames, serves
/// injected receive frames, and can be told to fail routing resolution.
pub struct FakeTransport {
    max_data_per_pkt: usize,
    sent: Vec<TxBurstItem>,
    rx_queue: VecDeque<Vec<u8>>,
    fail_resolve: bool,
}

impl FakeTransport {
    pub fn new(max_data_per_pkt: usize) -> Self {
        Self {
            max_data_per_pkt,
            sent: Vec::new(),
            rx_queue: VecDeque::new(),
            fail_resolve: false,
        }
    }

    /// Queue a frame for the next `rx_burst`.
    pub fn push_rx(&mut self, frame: Vec<u8>) {
        self.rx_queue.push_back(frame);
    }

    /// Frames transmitted so far.
    pub fn sent_frames(&self) -> &[TxBurstItem] {
        &self.sent
    }

    /// Take and clear the transmitted frames.
    pub fn take_sent(&mut self) -> Vec<TxBurstItem> {
        std::mem::take(&mut self.sent)
    }

    /// Make `resolve_remote_routing_info` fail.
    pub fn set_fail_resolve(&mut self, fail: bool) {
        self.fail_resolve = fail;
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Transport for FakeTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Fake
    }

    fn max_data_per_pkt(&self) -> usize {
        self.max_data_per_pkt
    }

    fn fill_local_routing_info(&self, ri: &mut RoutingInfo) {
        ri.buf.fill(0);
        ri.buf[0] = RI_TAG_FAKE;
    }

    fn resolve_remote_routing_info(&self, ri: &mut RoutingInfo) -> bool {
        !self.fail_resolve && ri.buf[0] == RI_TAG_FAKE
    }

    fn tx_burst(&mut self, batch: &[TxBurstItem]) -> usize {
        let mut n = 0;
        for item in batch {
            self.sent.push(TxBurstItem {
                routing_info: item.routing_info,
                frame: item.frame.clone(),
            });
            n += 1;
        }
        n
    }

    fn rx_burst(&mut self, out: &mut Vec<Vec<u8>>) -> usize {
        let mut n = 0;
        while n < RX_BURST_SIZE {
            match self.rx_queue.pop_front() {
                Some(frame) => {
                    out.push(frame);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_routing_info_roundtrip() {
        let tp = UdpTransport::new().unwrap();
        let mut ri = RoutingInfo::zeroed();
        tp.fill_local_routing_info(&mut ri);

        let addr = UdpTransport::addr_from_routing_info(&ri).unwrap();
        assert_eq!(addr.port(), tp.local_addr().port());
        assert!(tp.resolve_remote_routing_info(&mut ri));
    }

    #[test]
    fn test_udp_rejects_foreign_routing_info() {
        let tp = UdpTransport::new().unwrap();
        let mut ri = RoutingInfo::zeroed();
        ri.buf[0] = RI_TAG_FAKE;
        assert!(!tp.resolve_remote_routing_info(&mut ri));
    }

    #[test]
    fn test_udp_loopback_burst() {
        let mut a = UdpTransport::new().unwrap();
        let mut b = UdpTransport::new().unwrap();

        let mut ri = RoutingInfo::zeroed();
        b.fill_local_routing_info(&mut ri);

        let sent = a.tx_burst(&[TxBurstItem {
            routing_info: ri,
            frame: vec![0u8; 64],
        }]);
        assert_eq!(sent, 1);

        // Nonblocking receive needs a moment for loopback delivery.
        let mut frames = Vec::new();
        for _ in 0..100 {
            if b.rx_burst(&mut frames) > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 64);
    }

    #[test]
    fn test_fake_transport_fault() {
        let mut tp = FakeTransport::new(1024);
        let mut ri = RoutingInfo::zeroed();
        tp.fill_local_routing_info(&mut ri);
        assert!(tp.resolve_remote_routing_info(&mut ri));

        tp.set_fail_resolve(true);
        assert!(!tp.resolve_remote_routing_info(&mut ri));
    }

    #[test]
    fn test_fake_transport_bursts() {
        let mut tp = FakeTransport::new(1024);
        tp.push_rx(vec![1, 2, 3]);

        let mut frames = Vec::new();
        assert_eq!(tp.rx_burst(&mut frames), 1);
        assert_eq!(frames[0], vec![1, 2, 3]);

        let ri = RoutingInfo::zeroed();
        tp.tx_burst(&[TxBurstItem {
            routing_info: ri,
            frame: vec![9; 10],
        }]);
        assert_eq!(tp.sent_frames().len(), 1);
    }
}
