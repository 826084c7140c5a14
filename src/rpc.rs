//! The endpoint runtime.
//!
//! An `Rpc` binds one endpoint ID on one physical port, owns its sessions
//! and buffer allocator, and multiplexes them over the transport handed
//! to it at construction. All public operations run on the creator
//! thread; SM packets from other threads arrive through the Nexus hook
//! and are processed by the event loop.
//!
//! When `multi_threaded` is set in the configuration, background threads
//! may additionally use the buffer allocator, which is guarded by its own
//! lock; session state remains creator-thread only.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use log::{debug, info, warn};
use minstant::Instant;

use crate::buffer::{
    data_size_to_num_pkts, frame_check_magic, frame_dest_session, HugeAlloc, MsgBuffer,
};
use crate::config::{RpcConfig, MAX_PHY_PORTS};
use crate::endpoint::{SessionEndpoint, MAX_HOSTNAME_LEN, SECRET_MASK};
use crate::error::{DatapathErrCode, Error, Result};
use crate::hook::{NexusHook, SmWorkItem};
use crate::nexus::{Nexus, NexusInner, ReqFunc, MAX_REQ_TYPES};
use crate::packet::{SmErrType, SmEventType, SmPkt, SmPktType};
use crate::retry::SmRetryQueue;
use crate::session::{
    SSlot, Session, SessionRole, SessionState, SessionTable, SLOTS_PER_SESSION,
};
use crate::transport::{Transport, TxBurstItem};

/// Session-management event handler. Invoked on the creator thread with
/// the session number, the event, and the error type that produced it.
pub type SmHandler = Box<dyn FnMut(u16, SmEventType, SmErrType)>;

/// Fault-injection flags. These are instance state, toggled through the
/// fault API or by an incoming `FaultDropTxRemote` packet.
#[derive(Default)]
struct Faults {
    /// Discard datapath TX bursts instead of sending them.
    drop_tx_local: Cell<bool>,
    /// Fail remote routing-info resolution during connect handling.
    fail_resolve_remote_rinfo: Cell<bool>,
}

#[derive(Default)]
struct DpathStats {
    ev_loop_calls: Cell<u64>,
    rx_frames: Cell<u64>,
    tx_frames: Cell<u64>,
    dropped_frames: Cell<u64>,
}

/// An RPC endpoint runtime.
pub struct Rpc<T: Transport> {
    nexus: Arc<NexusInner>,
    endpoint_id: u8,
    config: RpcConfig,
    /// Thread that constructed this Rpc; the only one allowed to drive it.
    creator: ThreadId,
    transport: RefCell<T>,
    /// Shared allocator handle; slots' buffers reference it indirectly.
    huge_alloc: Arc<Mutex<HugeAlloc>>,
    sm_handler: RefCell<SmHandler>,
    sessions: RefCell<SessionTable>,
    retry_queue: RefCell<SmRetryQueue>,
    /// The hook shared with the Nexus.
    hook: NexusHook,
    /// Session numbers needing datapath TX.
    tx_work_queue: RefCell<Vec<u16>>,
    /// Request-handler table snapshot taken from the Nexus.
    req_funcs: Vec<Option<ReqFunc>>,
    faults: Faults,
    stats: DpathStats,
}

impl<T: Transport> Rpc<T> {
    /// Construct the endpoint runtime and register its hook with the
    /// Nexus. Fails on an out-of-range port or a duplicate endpoint ID;
    /// both are unrecoverable setup errors.
    pub fn new<F>(
        nexus: &Nexus,
        endpoint_id: u8,
        sm_handler: F,
        transport: T,
        config: RpcConfig,
    ) -> Result<Self>
    where
        F: FnMut(u16, SmEventType, SmErrType) + 'static,
    {
        if config.phy_port >= MAX_PHY_PORTS {
            return Err(Error::InvalidConfig(format!(
                "physical port {} out of range",
                config.phy_port
            )));
        }

        let hook = nexus.inner().register_hook(endpoint_id)?;
        let req_funcs = nexus.inner().snapshot_req_funcs();
        let huge_alloc = Arc::new(Mutex::new(HugeAlloc::new(
            config.alloc_capacity,
            config.numa_node,
        )));

        info!(
            "rpc {}: created on {} port {}",
            endpoint_id,
            nexus.hostname(),
            config.phy_port
        );

        Ok(Self {
            nexus: Arc::clone(nexus.inner()),
            endpoint_id,
            retry_queue: RefCell::new(SmRetryQueue::new(config.sm_timeout_ms)),
            config,
            creator: thread::current().id(),
            transport: RefCell::new(transport),
            huge_alloc,
            sm_handler: RefCell::new(Box::new(sm_handler)),
            sessions: RefCell::new(SessionTable::new()),
            hook,
            tx_work_queue: RefCell::new(Vec::new()),
            req_funcs,
            faults: Faults::default(),
            stats: DpathStats::default(),
        })
    }

    /// True iff the caller is the creator thread.
    #[inline]
    pub fn in_creator(&self) -> bool {
        thread::current().id() == self.creator
    }

    /// This endpoint's ID.
    #[inline]
    pub fn endpoint_id(&self) -> u8 {
        self.endpoint_id
    }

    /// Maximum payload bytes per packet of the underlying transport.
    pub fn max_data_per_pkt(&self) -> usize {
        self.transport.borrow().max_data_per_pkt()
    }

    // =========================================================================
    // Message buffers
    // =========================================================================

    /// Allocate a MsgBuffer for up to `max_data_size` payload bytes. The
    /// magic field of the zeroth packet header is set; headers are
    /// otherwise untouched. Returns None if the allocator is out of
    /// memory.
    pub fn alloc_msg_buffer(&self, max_data_size: usize) -> Option<MsgBuffer> {
        debug_assert!(max_data_size > 0);
        let max_num_pkts = data_size_to_num_pkts(max_data_size, self.max_data_per_pkt());
        let raw = self
            .huge_alloc
            .lock()
            .unwrap()
            .alloc(MsgBuffer::required_region_size(max_data_size, max_num_pkts))?;
        Some(MsgBuffer::from_raw(raw, max_data_size, max_num_pkts))
    }

    /// Shrink a MsgBuffer's logical size below its allocation.
    ///
    /// # Panics
    /// Panics if the buffer is invalid or the new size exceeds the
    /// buffer's maximum.
    pub fn resize_msg_buffer(&self, msg_buffer: &mut MsgBuffer, new_data_size: usize) {
        assert!(msg_buffer.is_valid() && msg_buffer.check_magic());
        assert!(new_data_size <= msg_buffer.max_data_size());
        let num_pkts = data_size_to_num_pkts(new_data_size, self.max_data_per_pkt());
        msg_buffer.resize(new_data_size, num_pkts);
    }

    /// Return a MsgBuffer allocated by `alloc_msg_buffer` to the pool.
    /// The handle and any copies of it must not be used afterwards.
    pub fn free_msg_buffer(&self, msg_buffer: MsgBuffer) {
        debug_assert!(msg_buffer.is_dynamic() && msg_buffer.check_magic());
        self.huge_alloc.lock().unwrap().free_buf(msg_buffer.raw());
    }

    /// Total bytes currently leased from the allocator.
    pub fn stat_user_alloc_tot(&self) -> usize {
        self.huge_alloc.lock().unwrap().stat_user_alloc_tot()
    }

    // =========================================================================
    // Session management API
    // =========================================================================

    /// Create a client session and send the first connect request.
    ///
    /// Returns the session number, or None on any precondition failure
    /// (logged). A `Connected` or `ConnectFailed` callback follows a
    /// successful call.
    pub fn create_session(
        &self,
        remote_hostname: &str,
        remote_endpoint_id: u8,
        remote_phy_port: u8,
    ) -> Option<u16> {
        if !self.in_creator() {
            warn!("rpc {}: create_session() caller is not the creator thread", self.endpoint_id);
            return None;
        }
        if remote_phy_port >= MAX_PHY_PORTS {
            warn!("rpc {}: create_session() invalid remote port {}", self.endpoint_id, remote_phy_port);
            return None;
        }
        if remote_hostname.is_empty() || remote_hostname.len() > MAX_HOSTNAME_LEN {
            warn!("rpc {}: create_session() invalid remote hostname", self.endpoint_id);
            return None;
        }
        if remote_hostname == self.nexus.hostname() && remote_endpoint_id == self.endpoint_id {
            warn!("rpc {}: create_session() remote Rpc is same as local", self.endpoint_id);
            return None;
        }

        {
            let sessions = self.sessions.borrow();
            for session in sessions.iter() {
                if session.is_client()
                    && session.server.same_rpc(remote_hostname, remote_endpoint_id)
                {
                    warn!(
                        "rpc {}: create_session() session to {} already exists",
                        self.endpoint_id,
                        session.server.rpc_name()
                    );
                    return None;
                }
            }
            if sessions.is_full() {
                warn!("rpc {}: create_session() session limit reached", self.endpoint_id);
                return None;
            }
        }

        let slots = match self.prealloc_session_slots() {
            Some(slots) => slots,
            None => {
                warn!(
                    "rpc {}: create_session() failed to allocate prealloc MsgBuffers",
                    self.endpoint_id
                );
                return None;
            }
        };

        let transport_type = self.transport.borrow().transport_type();
        let secret = rand::random::<u64>() & SECRET_MASK;

        let mut sessions = self.sessions.borrow_mut();
        let session_num = sessions.next_session_num();

        let mut client = SessionEndpoint::new(
            transport_type,
            self.nexus.hostname(),
            self.config.phy_port,
            self.endpoint_id,
        );
        client.session_num = session_num;
        client.secret = secret;
        self.transport
            .borrow()
            .fill_local_routing_info(&mut client.routing_info);

        // The server's session number and routing info arrive with the
        // connect response. The secret is shared.
        let mut server = SessionEndpoint::new(
            transport_type,
            remote_hostname,
            remote_phy_port,
            remote_endpoint_id,
        );
        server.secret = secret;

        let mut session = Session::new(
            SessionRole::Client,
            SessionState::ConnectInProgress,
            session_num,
            client,
            server,
            slots,
        );
        session.sm_api_req_pending = true;
        sessions.push(session);
        drop(sessions);

        self.retry_queue.borrow_mut().add(session_num);

        info!(
            "rpc {}: sending first connect req for session {} to {}:{}",
            self.endpoint_id, session_num, remote_hostname, remote_endpoint_id
        );
        let sessions = self.sessions.borrow();
        self.enqueue_sm_req(sessions.get(session_num).unwrap(), SmPktType::ConnectReq);
        Some(session_num)
    }

    /// Disconnect and destroy a client session. The session must not be
    /// used by the application after this returns true; a `Disconnected`
    /// or `DisconnectFailed` callback follows.
    ///
    /// Returns false if the session cannot be disconnected right now: the
    /// argument is invalid, connection establishment is still in
    /// progress, a disconnect is already running, or the session is
    /// already dead.
    pub fn destroy_session(&self, session_num: u16) -> bool {
        if !self.in_creator() {
            warn!("rpc {}: destroy_session() caller is not the creator thread", self.endpoint_id);
            return false;
        }

        let mut sessions = self.sessions.borrow_mut();
        let session = match sessions.get_mut(session_num) {
            Some(session) if session.is_client() => session,
            _ => {
                warn!("rpc {}: destroy_session() invalid session {}", self.endpoint_id, session_num);
                return false;
            }
        };

        match session.state {
            SessionState::ConnectInProgress => {
                // The user must wait for the connect callback.
                debug_assert!(self.retry_queue.borrow().contains(session_num));
                warn!(
                    "rpc {}: destroy_session() session {} connection in progress",
                    self.endpoint_id, session_num
                );
                false
            }
            SessionState::Connected => {
                session.state = SessionState::DisconnectInProgress;
                session.sm_api_req_pending = true;
                drop(sessions);
                self.retry_queue.borrow_mut().add(session_num);

                info!(
                    "rpc {}: sending first disconnect req for session {}",
                    self.endpoint_id, session_num
                );
                let sessions = self.sessions.borrow();
                self.enqueue_sm_req(sessions.get(session_num).unwrap(), SmPktType::DisconnectReq);
                true
            }
            SessionState::DisconnectInProgress => {
                debug_assert!(self.retry_queue.borrow().contains(session_num));
                warn!(
                    "rpc {}: destroy_session() session {} disconnection in progress",
                    self.endpoint_id, session_num
                );
                false
            }
            SessionState::Disconnected => {
                warn!(
                    "rpc {}: destroy_session() session {} already destroyed",
                    self.endpoint_id, session_num
                );
                false
            }
        }
    }

    /// Number of live server and client sessions.
    pub fn num_active_sessions(&self) -> usize {
        debug_assert!(self.in_creator());
        self.sessions.borrow().active_count()
    }

    /// Current state of a session, if it is alive.
    pub fn session_state(&self, session_num: u16) -> Option<SessionState> {
        self.sessions.borrow().get(session_num).map(|s| s.state)
    }

    /// The client and server endpoints of a live session.
    pub fn session_endpoints(&self, session_num: u16) -> Option<(SessionEndpoint, SessionEndpoint)> {
        self.sessions
            .borrow()
            .get(session_num)
            .map(|s| (s.client, s.server))
    }

    /// Number of free request slots of a live session.
    pub fn session_free_slots(&self, session_num: u16) -> Option<usize> {
        self.sessions
            .borrow()
            .get(session_num)
            .map(|s| s.free_slots.len())
    }

    /// True iff the session has an SM request in flight.
    pub fn in_sm_retry_queue(&self, session_num: u16) -> bool {
        self.retry_queue.borrow().contains(session_num)
    }

    /// Preallocate one MTU-sized response buffer per slot, rolling back
    /// everything on failure.
    fn prealloc_session_slots(&self) -> Option<Vec<SSlot>> {
        let max_data_per_pkt = self.max_data_per_pkt();
        let mut bufs: Vec<MsgBuffer> = Vec::with_capacity(SLOTS_PER_SESSION);
        for _ in 0..SLOTS_PER_SESSION {
            match self.alloc_msg_buffer(max_data_per_pkt) {
                Some(buf) => bufs.push(buf),
                None => {
                    for buf in bufs {
                        self.free_msg_buffer(buf);
                    }
                    return None;
                }
            }
        }
        Some(
            bufs.into_iter()
                .enumerate()
                .map(|(i, buf)| SSlot::new(i, buf))
                .collect(),
        )
    }

    // =========================================================================
    // SM packet emission
    // =========================================================================

    /// Emit a fresh SM request carrying the session's current endpoints.
    fn enqueue_sm_req(&self, session: &Session, pkt_type: SmPktType) {
        debug_assert!(session.is_client());
        let pkt = Box::new(SmPkt::new(pkt_type, session.client, session.server));
        self.hook
            .sm_tx
            .send(SmWorkItem::new(self.endpoint_id, pkt, None));
    }

    /// Emit the response to an incoming SM request: same endpoints,
    /// request type flipped to the response type, with `err_type` set.
    /// The original peer handle is carried along.
    fn enqueue_sm_resp(&self, req_wi: &SmWorkItem, err_type: SmErrType) {
        debug_assert!(req_wi.pkt.is_req());
        let mut pkt = *req_wi.pkt;
        pkt.pkt_type = pkt.pkt_type.to_resp();
        pkt.err_type = err_type;
        self.hook
            .sm_tx
            .send(SmWorkItem::new(self.endpoint_id, Box::new(pkt), req_wi.peer));
    }

    // =========================================================================
    // SM packet handlers
    // =========================================================================

    /// Drain the SM-RX queue in a single pass and dispatch each packet.
    /// Handlers never trigger another drain within the same tick; each
    /// packet is freed after dispatch.
    fn handle_session_management(&self) {
        debug_assert!(self.in_creator());
        let work_items = self.hook.sm_rx.drain();
        for mut wi in work_items {
            match wi.pkt.pkt_type {
                SmPktType::ConnectReq => self.handle_connect_req(&mut wi),
                SmPktType::ConnectResp => self.handle_connect_resp(&wi.pkt),
                SmPktType::DisconnectReq => self.handle_disconnect_req(&wi),
                SmPktType::DisconnectResp => self.handle_disconnect_resp(&wi.pkt),
                SmPktType::FaultDropTxRemote => {
                    info!(
                        "rpc {}: received drop-TX fault from {}",
                        self.endpoint_id,
                        wi.pkt.client.rpc_name()
                    );
                    self.faults.drop_tx_local.set(true);
                }
            }
        }
    }

    /// Server side of the connect exchange: accept the request by
    /// creating a session directly in Connected, or answer with an error
    /// and keep no state.
    fn handle_connect_req(&self, wi: &mut SmWorkItem) {
        let client_hostname = wi.pkt.client.hostname_str().to_owned();

        if wi.pkt.client.secret != wi.pkt.server.secret {
            warn!("rpc {}: connect req with mismatched secrets, discarding", self.endpoint_id);
            return;
        }
        if wi.pkt.server.endpoint_id != self.endpoint_id
            || wi.pkt.server.hostname_str() != self.nexus.hostname()
            || wi.pkt.server.phy_port >= MAX_PHY_PORTS
        {
            warn!(
                "rpc {}: connect req from {} addressed to wrong endpoint",
                self.endpoint_id,
                wi.pkt.client.rpc_name()
            );
            self.enqueue_sm_resp(wi, SmErrType::InvalidRemoteEndpointId);
            return;
        }

        // A duplicate of an accepted request (the client retried because
        // our response was lost) is answered idempotently. The same
        // client endpoint under a different secret is a stale client;
        // like any secret mismatch it is discarded silently, with no
        // state kept and no response.
        {
            let sessions = self.sessions.borrow();
            for session in sessions.iter() {
                if !session.is_client()
                    && session.client.session_num == wi.pkt.client.session_num
                    && session.client.same_rpc(&client_hostname, wi.pkt.client.endpoint_id)
                {
                    if session.client.secret == wi.pkt.client.secret {
                        info!(
                            "rpc {}: resending connect resp for session {}",
                            self.endpoint_id, session.local_session_num
                        );
                        let resp = SmPkt {
                            pkt_type: SmPktType::ConnectResp,
                            err_type: SmErrType::NoError,
                            client: session.client,
                            server: session.server,
                        };
                        self.hook.sm_tx.send(SmWorkItem::new(
                            self.endpoint_id,
                            Box::new(resp),
                            wi.peer,
                        ));
                    } else {
                        warn!(
                            "rpc {}: connect req duplicates client endpoint {} with a stale secret, discarding",
                            self.endpoint_id,
                            wi.pkt.client.rpc_name()
                        );
                    }
                    return;
                }
            }

            if sessions.is_full() {
                warn!("rpc {}: rejecting connect req, session limit reached", self.endpoint_id);
                self.enqueue_sm_resp(wi, SmErrType::TooManySessions);
                return;
            }
        }

        let slots = match self.prealloc_session_slots() {
            Some(slots) => slots,
            None => {
                warn!("rpc {}: rejecting connect req, out of memory", self.endpoint_id);
                self.enqueue_sm_resp(wi, SmErrType::OutOfMemory);
                return;
            }
        };

        let mut sessions = self.sessions.borrow_mut();
        let session_num = sessions.next_session_num();

        let mut server = wi.pkt.server;
        server.session_num = session_num;
        self.transport
            .borrow()
            .fill_local_routing_info(&mut server.routing_info);

        let session = Session::new(
            SessionRole::Server,
            SessionState::Connected,
            session_num,
            wi.pkt.client,
            server,
            slots,
        );
        sessions.push(session);
        drop(sessions);

        info!(
            "rpc {}: accepted connect req from {}, server session {}",
            self.endpoint_id,
            wi.pkt.client.rpc_name(),
            session_num
        );

        // Carry the completed server endpoint back in the response.
        wi.pkt.server = server;
        self.enqueue_sm_resp(wi, SmErrType::NoError);
    }

    /// Client side of the connect exchange.
    fn handle_connect_resp(&self, pkt: &SmPkt) {
        let session_num = pkt.client.session_num;

        let (event, err_type) = {
            let mut sessions = self.sessions.borrow_mut();
            let session = match sessions.get_mut(session_num) {
                Some(session) => session,
                None => {
                    warn!(
                        "rpc {}: connect resp for unknown session {}, discarding",
                        self.endpoint_id, session_num
                    );
                    return;
                }
            };
            if !session.is_client() {
                warn!("rpc {}: connect resp for server session, discarding", self.endpoint_id);
                return;
            }
            if pkt.client.secret != session.client.secret
                || pkt.server.secret != session.client.secret
            {
                // Likely a response from a previous life of this session
                // number; drop without a callback.
                debug!(
                    "rpc {}: connect resp with mismatched secret for session {}, discarding",
                    self.endpoint_id, session_num
                );
                return;
            }
            match session.state {
                SessionState::ConnectInProgress => {}
                other => {
                    warn!(
                        "rpc {}: connect resp for session {} in state {}, discarding",
                        self.endpoint_id, session_num, other
                    );
                    return;
                }
            }

            if pkt.err_type != SmErrType::NoError {
                warn!(
                    "rpc {}: connect req for session {} refused by server: {:?}",
                    self.endpoint_id, session_num, pkt.err_type
                );
                session.state = SessionState::Disconnected;
                session.sm_api_req_pending = false;
                (SmEventType::ConnectFailed, pkt.err_type)
            } else {
                // Adopt the completed server endpoint, then resolve its
                // routing info through the transport.
                session.server = pkt.server;
                let resolved = !self.faults.fail_resolve_remote_rinfo.get()
                    && self
                        .transport
                        .borrow()
                        .resolve_remote_routing_info(&mut session.server.routing_info);
                if !resolved {
                    warn!(
                        "rpc {}: failed to resolve routing info for session {}",
                        self.endpoint_id, session_num
                    );
                    session.state = SessionState::Disconnected;
                    session.sm_api_req_pending = false;
                    (SmEventType::ConnectFailed, SmErrType::RoutingResolutionFailure)
                } else {
                    info!("rpc {}: session {} connected", self.endpoint_id, session_num);
                    session.state = SessionState::Connected;
                    session.sm_api_req_pending = false;
                    (SmEventType::Connected, SmErrType::NoError)
                }
            }
        };

        self.retry_queue.borrow_mut().remove(session_num);
        self.invoke_sm_handler(session_num, event, err_type);
        if event == SmEventType::ConnectFailed {
            self.bury_session(session_num);
        }
    }

    /// Server side of the disconnect exchange. Teardown is idempotent: a
    /// request for a session that is already gone still gets a NoError
    /// response.
    fn handle_disconnect_req(&self, wi: &SmWorkItem) {
        let session_num = wi.pkt.server.session_num;

        let found = {
            let sessions = self.sessions.borrow();
            match sessions.get(session_num) {
                Some(session) => {
                    !session.is_client()
                        && session.client.secret == wi.pkt.client.secret
                        && session.server.secret == wi.pkt.server.secret
                }
                None => false,
            }
        };

        if found {
            info!(
                "rpc {}: disconnect req from {}, destroying server session {}",
                self.endpoint_id,
                wi.pkt.client.rpc_name(),
                session_num
            );
            self.bury_session(session_num);
        } else {
            debug!(
                "rpc {}: disconnect req for missing session {}, responding anyway",
                self.endpoint_id, session_num
            );
        }

        self.enqueue_sm_resp(wi, SmErrType::NoError);
    }

    /// Client side of the disconnect exchange.
    fn handle_disconnect_resp(&self, pkt: &SmPkt) {
        let session_num = pkt.client.session_num;

        {
            let mut sessions = self.sessions.borrow_mut();
            let session = match sessions.get_mut(session_num) {
                Some(session) => session,
                None => {
                    warn!(
                        "rpc {}: disconnect resp for unknown session {}, discarding",
                        self.endpoint_id, session_num
                    );
                    return;
                }
            };
            if !session.is_client() {
                warn!("rpc {}: disconnect resp for server session, discarding", self.endpoint_id);
                return;
            }
            if pkt.client.secret != session.client.secret {
                debug!(
                    "rpc {}: disconnect resp with mismatched secret for session {}, discarding",
                    self.endpoint_id, session_num
                );
                return;
            }
            if session.state != SessionState::DisconnectInProgress {
                warn!(
                    "rpc {}: disconnect resp for session {} in state {}, discarding",
                    self.endpoint_id, session_num, session.state
                );
                return;
            }
            session.state = SessionState::Disconnected;
            session.sm_api_req_pending = false;
        }

        self.retry_queue.borrow_mut().remove(session_num);

        let (event, err_type) = if pkt.err_type == SmErrType::NoError {
            (SmEventType::Disconnected, SmErrType::NoError)
        } else {
            (SmEventType::DisconnectFailed, pkt.err_type)
        };
        self.invoke_sm_handler(session_num, event, err_type);
        self.bury_session(session_num);
    }

    fn invoke_sm_handler(&self, session_num: u16, event: SmEventType, err_type: SmErrType) {
        let mut handler = self.sm_handler.borrow_mut();
        (handler)(session_num, event, err_type);
    }

    /// Free a session's runtime-owned resources and null its table entry.
    /// The application must not touch a buried session.
    ///
    /// Runtime-preallocated response buffers are always freed, as is a
    /// dynamic RX buffer. A client's TX buffer belongs to the application
    /// and is left alone; a server's dynamic TX response buffer is
    /// runtime-owned and freed here.
    fn bury_session(&self, session_num: u16) {
        debug_assert!(self.in_creator());
        let session = match self.sessions.borrow_mut().bury(session_num) {
            Some(session) => session,
            None => return,
        };
        debug_assert!(!(session.is_client() && session.sm_api_req_pending));

        let role = session.role;
        for slot in session.slots {
            self.free_msg_buffer(slot.pre_resp_msgbuf);
            if let Some(rx_msgbuf) = slot.rx_msgbuf {
                if rx_msgbuf.is_dynamic() {
                    self.free_msg_buffer(rx_msgbuf);
                }
            }
            if let Some(tx_msgbuf) = slot.tx_msgbuf {
                if role == SessionRole::Server && tx_msgbuf.is_dynamic() {
                    self.free_msg_buffer(tx_msgbuf);
                }
            }
        }
        debug!("rpc {}: buried session {}", self.endpoint_id, session_num);
    }

    // =========================================================================
    // SM retry
    // =========================================================================

    /// Re-emit SM requests whose deadline has expired. Retries repeat
    /// until a matching response terminal-transitions the session.
    fn sm_retry(&self) {
        let now = Instant::now();
        let due = {
            let mut retry_queue = self.retry_queue.borrow_mut();
            if !retry_queue.any_due(now) {
                return;
            }
            retry_queue.fire_due(now)
        };

        for session_num in due {
            let sessions = self.sessions.borrow();
            match sessions.get(session_num) {
                Some(session) if session.state == SessionState::ConnectInProgress => {
                    debug!("rpc {}: retrying connect req for session {}", self.endpoint_id, session_num);
                    self.enqueue_sm_req(session, SmPktType::ConnectReq);
                }
                Some(session) if session.state == SessionState::DisconnectInProgress => {
                    debug!(
                        "rpc {}: retrying disconnect req for session {}",
                        self.endpoint_id, session_num
                    );
                    self.enqueue_sm_req(session, SmPktType::DisconnectReq);
                }
                _ => {
                    drop(sessions);
                    warn!(
                        "rpc {}: session {} in retry queue without SM request in flight",
                        self.endpoint_id, session_num
                    );
                    self.retry_queue.borrow_mut().remove(session_num);
                }
            }
        }
    }

    // =========================================================================
    // Datapath
    // =========================================================================

    /// Try to enqueue a request for transmission on a connected client
    /// session. On success the slot holds the application's MsgBuffer
    /// (non-owning) until the request completes, and the session is
    /// upserted into the TX work queue.
    pub fn enqueue_request(
        &self,
        session_num: u16,
        req_type: u8,
        msg_buffer: &MsgBuffer,
    ) -> std::result::Result<(), DatapathErrCode> {
        debug_assert!(self.in_creator());

        let mut sessions = self.sessions.borrow_mut();
        let session = match sessions.get_mut(session_num) {
            Some(session) if session.is_client() && session.is_connected() => session,
            _ => return Err(DatapathErrCode::InvalidSessionArg),
        };

        if !msg_buffer.is_valid() || !msg_buffer.check_magic() {
            return Err(DatapathErrCode::InvalidMsgBufferArg);
        }
        let max_data = self.transport.borrow().max_data_per_pkt();
        if msg_buffer.data_size() == 0 || msg_buffer.data_size() > max_data {
            // Multi-packet requests belong to the datapath reliability
            // layer; this enqueue handles one packet per request.
            return Err(DatapathErrCode::InvalidMsgSizeArg);
        }
        if req_type as usize >= MAX_REQ_TYPES {
            return Err(DatapathErrCode::InvalidReqTypeArg);
        }
        if self.req_funcs[req_type as usize].is_none() {
            return Err(DatapathErrCode::InvalidReqFuncArg);
        }

        let slot_index = match session.alloc_slot() {
            Some(slot_index) => slot_index,
            None => return Err(DatapathErrCode::NoSessionMsgSlots),
        };

        let slot = &mut session.slots[slot_index];
        slot.tx_msgbuf = Some(*msg_buffer);
        slot.req_type = req_type;
        slot.tx_queued = true;

        let needs_upsert = if session.in_tx_queue {
            false
        } else {
            session.in_tx_queue = true;
            true
        };
        drop(sessions);

        if needs_upsert {
            self.tx_work_queue.borrow_mut().push(session_num);
        }
        Ok(())
    }

    /// Transmit pending frames of sessions in the TX work queue. Sessions
    /// buried during this tick are skipped.
    fn process_tx_queue(&self) {
        let queued: Vec<u16> = std::mem::take(&mut *self.tx_work_queue.borrow_mut());
        if queued.is_empty() {
            return;
        }

        let mut batch: Vec<TxBurstItem> = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            for session_num in queued {
                let session = match sessions.get_mut(session_num) {
                    Some(session) => session,
                    None => continue,
                };
                session.in_tx_queue = false;
                if !session.is_connected() {
                    continue;
                }

                let remote_session_num = session.remote_endpoint().session_num;
                let routing_info = session.remote_endpoint().routing_info;
                for slot in &mut session.slots {
                    if !slot.tx_queued {
                        continue;
                    }
                    slot.tx_queued = false;
                    if let Some(tx_msgbuf) = slot.tx_msgbuf.as_mut() {
                        batch.push(TxBurstItem {
                            routing_info,
                            frame: tx_msgbuf.build_frame(remote_session_num, slot.req_type),
                        });
                    }
                }
            }
        }

        if batch.is_empty() {
            return;
        }
        if self.faults.drop_tx_local.get() {
            debug!(
                "rpc {}: drop_tx_local set, discarding {} frames",
                self.endpoint_id,
                batch.len()
            );
            self.stats
                .dropped_frames
                .set(self.stats.dropped_frames.get() + batch.len() as u64);
            return;
        }

        let sent = self.transport.borrow_mut().tx_burst(&batch);
        self.stats.tx_frames.set(self.stats.tx_frames.get() + sent as u64);
    }

    /// Pull RX completions from the transport. Frames are validated and
    /// accounted here; request/response dispatch belongs to the datapath
    /// layer above this runtime.
    fn process_completions(&self) {
        let mut frames = Vec::new();
        self.transport.borrow_mut().rx_burst(&mut frames);
        if frames.is_empty() {
            return;
        }

        let sessions = self.sessions.borrow();
        for frame in frames {
            if !frame_check_magic(&frame) {
                warn!("rpc {}: dropping malformed datapath frame", self.endpoint_id);
                self.stats
                    .dropped_frames
                    .set(self.stats.dropped_frames.get() + 1);
                continue;
            }
            let dest = match frame_dest_session(&frame) {
                Some(dest) => dest,
                None => continue,
            };
            match sessions.get(dest) {
                Some(session) if session.is_connected() => {
                    self.stats.rx_frames.set(self.stats.rx_frames.get() + 1);
                    debug!(
                        "rpc {}: datapath frame of {} bytes for session {}",
                        self.endpoint_id,
                        frame.len(),
                        dest
                    );
                }
                _ => {
                    debug!("rpc {}: dropping frame for dead session {}", self.endpoint_id, dest);
                    self.stats
                        .dropped_frames
                        .set(self.stats.dropped_frames.get() + 1);
                }
            }
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Run one iteration of the event loop: drain SM-RX, fire due SM
    /// retries, pull RX completions, push TX work.
    pub fn run_event_loop_one(&self) {
        debug_assert!(self.in_creator());
        self.stats.ev_loop_calls.set(self.stats.ev_loop_calls.get() + 1);

        self.handle_session_management();
        if !self.retry_queue.borrow().is_empty() {
            self.sm_retry();
        }
        self.process_completions();
        self.process_tx_queue();
    }

    /// Run the event loop forever.
    pub fn run_event_loop(&self) -> ! {
        debug_assert!(self.in_creator());
        loop {
            self.run_event_loop_one();
        }
    }

    /// Run the event loop until `timeout_ms` wall-clock milliseconds have
    /// elapsed.
    pub fn run_event_loop_timeout(&self, timeout_ms: u64) {
        debug_assert!(self.in_creator());
        let start = Instant::now();
        loop {
            self.run_event_loop_one();
            if start.elapsed().as_millis() as u64 > timeout_ms {
                return;
            }
        }
    }

    // =========================================================================
    // Fault injection and stats
    // =========================================================================

    /// Fail remote routing-info resolution during connect handling.
    pub fn fault_inject_fail_resolve_remote_rinfo(&self, fail: bool) {
        debug_assert!(self.in_creator());
        self.faults.fail_resolve_remote_rinfo.set(fail);
    }

    /// Ask the remote end of a connected client session to drop its
    /// datapath TX. Returns false if the session is not a connected
    /// client.
    pub fn fault_inject_drop_tx_remote(&self, session_num: u16) -> bool {
        debug_assert!(self.in_creator());
        let sessions = self.sessions.borrow();
        let session = match sessions.get(session_num) {
            Some(session) if session.is_client() && session.is_connected() => session,
            _ => return false,
        };
        info!(
            "rpc {}: sending drop-TX fault for session {}",
            self.endpoint_id, session_num
        );
        let pkt = Box::new(SmPkt::new(
            SmPktType::FaultDropTxRemote,
            session.client,
            session.server,
        ));
        self.hook
            .sm_tx
            .send(SmWorkItem::new(self.endpoint_id, pkt, None));
        true
    }

    /// True iff this endpoint is currently discarding datapath TX.
    pub fn drop_tx_local(&self) -> bool {
        self.faults.drop_tx_local.get()
    }

    /// Number of event-loop iterations so far.
    pub fn stat_ev_loop_calls(&self) -> u64 {
        self.stats.ev_loop_calls.get()
    }

    /// Datapath frames accepted by RX processing.
    pub fn stat_rx_frames(&self) -> u64 {
        self.stats.rx_frames.get()
    }

    /// Datapath frames handed to the transport.
    pub fn stat_tx_frames(&self) -> u64 {
        self.stats.tx_frames.get()
    }

    /// Datapath frames dropped by validation or fault injection.
    pub fn stat_dropped_frames(&self) -> u64 {
        self.stats.dropped_frames.get()
    }
}

impl<T: Transport> Drop for Rpc<T> {
    fn drop(&mut self) {
        self.nexus.unregister_hook(self.endpoint_id);
        info!("rpc {}: destroyed", self.endpoint_id);
    }
}
