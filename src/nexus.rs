//! The process-wide multiplexer.
//!
//! A `Nexus` owns the session-management plane shared by every endpoint
//! runtime in the process: the UDP socket SM packets travel over, the
//! listener thread, and one hook per registered endpoint. Its lifetime
//! must strictly exceed every endpoint runtime it serves; endpoint
//! runtimes hold it through a reference-counted handle.

use std::collections::HashMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::buffer::MsgBuffer;
use crate::config::NexusConfig;
use crate::error::{Error, Result};
use crate::hook::{sm_queue, NexusHook, SmReceiver, SmSender, SmWorkItem};
use crate::packet::{SmErrType, SmPkt, SmPktType, SM_PKT_WIRE_SIZE};

/// Number of usable request types; type 255 is reserved.
pub const MAX_REQ_TYPES: usize = 255;

/// Datagrams handled per `process_sm_rx` call.
const SM_RX_BATCH: usize = 16;

/// Request handler invoked by the datapath dispatch layer.
pub type ReqHandler = fn(req: &[u8], resp: &mut MsgBuffer);

/// A request handler registered with the Nexus before endpoint creation.
/// Each endpoint runtime snapshots the table at construction; dispatch of
/// incoming requests belongs to the datapath layer.
#[derive(Clone, Copy)]
pub struct ReqFunc {
    pub handler: ReqHandler,
    /// Whether the handler runs on a background thread instead of the
    /// dispatch thread.
    pub run_in_background: bool,
}

impl ReqFunc {
    pub fn new(handler: ReqHandler) -> Self {
        Self {
            handler,
            run_in_background: false,
        }
    }
}

/// The Nexus-side halves of one endpoint's hook.
struct HookPeer {
    /// Producer into the endpoint runtime's SM-RX queue.
    to_rpc: SmSender,
    /// Consumer of the endpoint runtime's SM-TX queue.
    from_rpc: SmReceiver,
}

pub(crate) struct NexusInner {
    hostname: String,
    /// The port actually bound (resolves an ephemeral request).
    sm_udp_port: u16,
    numa_node: usize,
    socket: UdpSocket,
    hooks: Mutex<HashMap<u8, HookPeer>>,
    req_funcs: Mutex<Vec<Option<ReqFunc>>>,
    /// Set once the first endpoint registers; the req-func table is
    /// immutable from then on.
    frozen: AtomicBool,
    stop: AtomicBool,
    /// Testing fault: number of outbound SM packets to discard.
    sm_drop_tx: AtomicUsize,
    /// Emitted SM packets by type, including fault-dropped ones.
    tx_counts: [AtomicU64; 6],
    /// Received SM packets by type.
    rx_counts: [AtomicU64; 6],
}

impl NexusInner {
    pub(crate) fn hostname(&self) -> &str {
        &self.hostname
    }

    pub(crate) fn register_hook(&self, endpoint_id: u8) -> Result<NexusHook> {
        self.frozen.store(true, Ordering::Release);

        let mut hooks = self.hooks.lock().unwrap();
        if hooks.contains_key(&endpoint_id) {
            return Err(Error::EndpointIdExists(endpoint_id));
        }

        let (rx_tx, rx_rx) = sm_queue(); // Nexus -> Rpc
        let (tx_tx, tx_rx) = sm_queue(); // Rpc -> Nexus
        hooks.insert(
            endpoint_id,
            HookPeer {
                to_rpc: rx_tx,
                from_rpc: tx_rx,
            },
        );

        Ok(NexusHook {
            endpoint_id,
            sm_rx: rx_rx,
            sm_tx: tx_tx,
        })
    }

    pub(crate) fn unregister_hook(&self, endpoint_id: u8) {
        self.hooks.lock().unwrap().remove(&endpoint_id);
    }

    pub(crate) fn snapshot_req_funcs(&self) -> Vec<Option<ReqFunc>> {
        self.req_funcs.lock().unwrap().clone()
    }

    #[inline]
    fn count_tx(&self, pkt_type: SmPktType) {
        self.tx_counts[pkt_type as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn count_rx(&self, pkt_type: SmPktType) {
        self.rx_counts[pkt_type as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Consume one unit of the SM drop fault, if armed.
    fn consume_drop(&self) -> bool {
        self.sm_drop_tx
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Transmit one SM work item: reply to the recorded peer if present,
    /// otherwise resolve the packet's destination hostname and send a
    /// datagram to it on the shared SM port.
    fn route_out(&self, wi: SmWorkItem) {
        self.count_tx(wi.pkt.pkt_type);

        if self.consume_drop() {
            debug!(
                "nexus {}: fault-dropping outbound {:?}",
                self.hostname, wi.pkt.pkt_type
            );
            return;
        }

        let bytes = wi.pkt.to_bytes();
        let dest = match wi.peer {
            Some(addr) => Some(addr),
            None => {
                let host = wi.pkt.dst_hostname().to_owned();
                match (host.as_str(), self.sm_udp_port).to_socket_addrs() {
                    Ok(mut addrs) => addrs.next(),
                    Err(e) => {
                        warn!("nexus {}: cannot resolve SM peer {}: {}", self.hostname, host, e);
                        None
                    }
                }
            }
        };

        let Some(dest) = dest else {
            warn!(
                "nexus {}: dropping unroutable {:?} for {}",
                self.hostname,
                wi.pkt.pkt_type,
                wi.pkt.dst_hostname()
            );
            return;
        };

        if let Err(e) = self.socket.send_to(&bytes, dest) {
            warn!("nexus {}: SM send to {} failed: {}", self.hostname, dest, e);
        }
    }

    /// Route one SM packet to the hook of its destination endpoint.
    /// Requests for an unknown endpoint ID are answered with an
    /// InvalidRemoteEndpointId response; orphan responses are dropped.
    fn deliver(&self, wi: SmWorkItem) {
        let dst_id = wi.pkt.dst_endpoint_id();
        {
            let hooks = self.hooks.lock().unwrap();
            if let Some(peer) = hooks.get(&dst_id) {
                if !peer.to_rpc.send(wi) {
                    warn!("nexus {}: endpoint {} hook is dead", self.hostname, dst_id);
                }
                return;
            }
        }

        if wi.pkt.pkt_type.has_resp() {
            warn!(
                "nexus {}: {:?} for unknown endpoint {}, answering with error",
                self.hostname, wi.pkt.pkt_type, dst_id
            );
            let mut resp = *wi.pkt;
            resp.pkt_type = resp.pkt_type.to_resp();
            resp.err_type = SmErrType::InvalidRemoteEndpointId;
            self.route_out(SmWorkItem::new(dst_id, Box::new(resp), wi.peer));
        } else {
            warn!(
                "nexus {}: dropping {:?} for unknown endpoint {}",
                self.hostname, wi.pkt.pkt_type, dst_id
            );
        }
    }

    /// Drain every hook's SM-TX queue and transmit the items.
    fn process_sm_tx(&self) -> usize {
        let items: Vec<SmWorkItem> = {
            let hooks = self.hooks.lock().unwrap();
            hooks
                .values()
                .flat_map(|peer| peer.from_rpc.drain())
                .collect()
        };

        let n = items.len();
        for wi in items {
            self.route_out(wi);
        }
        n
    }

    /// Receive a batch of SM datagrams and route them to local hooks.
    fn process_sm_rx(&self) -> usize {
        let mut buf = [0u8; SM_PKT_WIRE_SIZE];
        let mut n = 0;

        for _ in 0..SM_RX_BATCH {
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(_) => break,
            };
            if len != SM_PKT_WIRE_SIZE {
                warn!("nexus {}: runt SM datagram ({} bytes) from {}", self.hostname, len, src);
                continue;
            }
            let pkt = match SmPkt::from_bytes(&buf) {
                Ok(pkt) => pkt,
                Err(e) => {
                    warn!("nexus {}: bad SM datagram from {}: {}", self.hostname, src, e);
                    continue;
                }
            };

            self.count_rx(pkt.pkt_type);
            let peer = if pkt.is_req() { Some(src) } else { None };
            let dst_id = pkt.dst_endpoint_id();
            self.deliver(SmWorkItem::new(dst_id, Box::new(pkt), peer));
            n += 1;
        }
        n
    }
}

/// The process-wide multiplexer owning the SM plane.
pub struct Nexus {
    inner: Arc<NexusInner>,
    sm_thread: Option<JoinHandle<()>>,
}

impl Nexus {
    /// Create a Nexus, bind the SM socket, and (unless disabled) spawn
    /// the SM listener thread.
    pub fn new(config: NexusConfig) -> Result<Nexus> {
        let socket = UdpSocket::bind(("0.0.0.0", config.sm_udp_port))?;
        socket.set_nonblocking(true)?;
        let sm_udp_port = socket.local_addr()?.port();

        let inner = Arc::new(NexusInner {
            hostname: config.hostname.clone(),
            sm_udp_port,
            numa_node: config.numa_node,
            socket,
            hooks: Mutex::new(HashMap::new()),
            req_funcs: Mutex::new(vec![None; MAX_REQ_TYPES]),
            frozen: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            sm_drop_tx: AtomicUsize::new(0),
            tx_counts: Default::default(),
            rx_counts: Default::default(),
        });

        let sm_thread = if config.spawn_sm_thread {
            let thread_inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name("udrpc-sm".to_owned())
                .spawn(move || sm_thread_loop(thread_inner))?;
            Some(handle)
        } else {
            None
        };

        info!(
            "nexus {}: created, SM port {}, listener {}",
            config.hostname,
            sm_udp_port,
            if config.spawn_sm_thread { "on" } else { "off" }
        );

        Ok(Nexus { inner, sm_thread })
    }

    pub(crate) fn inner(&self) -> &Arc<NexusInner> {
        &self.inner
    }

    /// The hostname this process is reachable under.
    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    /// The bound SM UDP port.
    pub fn sm_udp_port(&self) -> u16 {
        self.inner.sm_udp_port
    }

    /// The NUMA node of the process.
    pub fn numa_node(&self) -> usize {
        self.inner.numa_node
    }

    /// Register a request handler. Must be called before the first
    /// endpoint runtime is created.
    pub fn register_req_func(&self, req_type: u8, req_func: ReqFunc) -> Result<()> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(Error::ReqFuncRegistryFrozen);
        }
        if req_type as usize >= MAX_REQ_TYPES {
            return Err(Error::InvalidConfig(format!(
                "request type {} is reserved",
                req_type
            )));
        }

        let mut funcs = self.inner.req_funcs.lock().unwrap();
        if funcs[req_type as usize].is_some() {
            return Err(Error::ReqFuncExists(req_type));
        }
        funcs[req_type as usize] = Some(req_func);
        Ok(())
    }

    /// Drain all endpoints' SM-TX queues and transmit. Called by the SM
    /// thread; exposed so embeddings without the thread can drive the SM
    /// plane themselves.
    pub fn process_sm_tx(&self) -> usize {
        self.inner.process_sm_tx()
    }

    /// Receive and route a batch of SM datagrams. Counterpart of
    /// `process_sm_tx`.
    pub fn process_sm_rx(&self) -> usize {
        self.inner.process_sm_rx()
    }

    /// Inject one SM work item directly into the local routing step,
    /// bypassing the wire.
    pub fn deliver(&self, wi: SmWorkItem) {
        self.inner.deliver(wi)
    }

    /// Testing fault: discard the next `n` outbound SM packets.
    pub fn drop_next_sm_tx(&self, n: usize) {
        self.inner.sm_drop_tx.fetch_add(n, Ordering::AcqRel);
    }

    /// Number of SM packets of this type emitted (fault-dropped packets
    /// included).
    pub fn sm_tx_count(&self, pkt_type: SmPktType) -> u64 {
        self.inner.tx_counts[pkt_type as usize].load(Ordering::Relaxed)
    }

    /// Number of SM packets of this type received from the wire.
    pub fn sm_rx_count(&self, pkt_type: SmPktType) -> u64 {
        self.inner.rx_counts[pkt_type as usize].load(Ordering::Relaxed)
    }

    /// Number of registered endpoint hooks.
    pub fn num_hooks(&self) -> usize {
        self.inner.hooks.lock().unwrap().len()
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.sm_thread.take() {
            let _ = handle.join();
        }
        info!("nexus {}: destroyed", self.inner.hostname);
    }
}

fn sm_thread_loop(inner: Arc<NexusInner>) {
    while !inner.stop.load(Ordering::Acquire) {
        let tx = inner.process_sm_tx();
        let rx = inner.process_sm_rx();
        if tx == 0 && rx == 0 {
            std::thread::sleep(Duration::from_micros(100));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NexusConfig;

    fn test_nexus() -> Nexus {
        let config = NexusConfig::new("127.0.0.1")
            .with_sm_udp_port(0)
            .with_sm_thread(false);
        Nexus::new(config).unwrap()
    }

    #[test]
    fn test_hook_registration() {
        let nexus = test_nexus();
        let hook = nexus.inner().register_hook(1).unwrap();
        assert_eq!(hook.endpoint_id, 1);
        assert!(nexus.inner().register_hook(1).is_err());
        assert_eq!(nexus.num_hooks(), 1);

        nexus.inner().unregister_hook(1);
        assert_eq!(nexus.num_hooks(), 0);
        assert!(nexus.inner().register_hook(1).is_ok());
    }

    #[test]
    fn test_req_func_registry_freezes() {
        fn echo(_req: &[u8], _resp: &mut MsgBuffer) {}

        let nexus = test_nexus();
        nexus.register_req_func(7, ReqFunc::new(echo)).unwrap();
        assert!(matches!(
            nexus.register_req_func(7, ReqFunc::new(echo)),
            Err(Error::ReqFuncExists(7))
        ));

        let _hook = nexus.inner().register_hook(1).unwrap();
        assert!(matches!(
            nexus.register_req_func(8, ReqFunc::new(echo)),
            Err(Error::ReqFuncRegistryFrozen)
        ));

        let funcs = nexus.inner().snapshot_req_funcs();
        assert!(funcs[7].is_some());
        assert!(funcs[8].is_none());
    }

    #[test]
    fn test_ephemeral_port_bound() {
        let nexus = test_nexus();
        assert_ne!(nexus.sm_udp_port(), 0);
    }
}
