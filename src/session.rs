//! Session and slot management.
//!
//! A session is a logical, bidirectional channel between two endpoints
//! with a request window of `SLOTS_PER_SESSION` slots. Sessions are owned
//! by their endpoint runtime and mutated only from its creator thread.

use std::fmt;

use crate::buffer::MsgBuffer;
use crate::endpoint::SessionEndpoint;

/// Request window size: concurrent in-flight requests per session.
pub const SLOTS_PER_SESSION: usize = 8;

/// Bound on the append-only session table of one endpoint.
pub const MAX_SESSIONS_PER_ENDPOINT: usize = 1024;

/// Which side of the session this endpoint runtime plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// Session lifecycle state.
///
/// Transitions happen only on the creator thread of the owning endpoint
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect request sent, awaiting the response.
    ConnectInProgress,
    /// Connected and usable for requests.
    Connected,
    /// Disconnect request sent, awaiting the response.
    DisconnectInProgress,
    /// Terminal state; the session is a zombie until buried.
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::ConnectInProgress => "connect-in-progress",
            SessionState::Connected => "connected",
            SessionState::DisconnectInProgress => "disconnect-in-progress",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// A per-session reservation for one in-flight request/response pair.
///
/// At rest, `tx_msgbuf` and `rx_msgbuf` are both None. A slot index
/// present in the session's free stack has no in-flight request.
pub struct SSlot {
    /// Slot index within the session.
    pub index: usize,
    /// Response buffer of one MTU of payload, allocated at session
    /// creation and owned by the runtime.
    pub pre_resp_msgbuf: MsgBuffer,
    /// The current outgoing message. Non-owning for client requests;
    /// owning for dynamic server responses.
    pub tx_msgbuf: Option<MsgBuffer>,
    /// In-place receive buffer; may be dynamic.
    pub rx_msgbuf: Option<MsgBuffer>,
    /// Request type of the in-flight request.
    pub req_type: u8,
    /// Whether the slot has a frame waiting in the TX work queue.
    pub tx_queued: bool,
}

impl SSlot {
    /// Create a slot at rest.
    pub fn new(index: usize, pre_resp_msgbuf: MsgBuffer) -> Self {
        Self {
            index,
            pre_resp_msgbuf,
            tx_msgbuf: None,
            rx_msgbuf: None,
            req_type: 0,
            tx_queued: false,
        }
    }

    /// True iff the slot holds no in-flight buffers.
    #[inline]
    pub fn at_rest(&self) -> bool {
        self.tx_msgbuf.is_none() && self.rx_msgbuf.is_none()
    }
}

/// Per-session state.
pub struct Session {
    pub role: SessionRole,
    pub state: SessionState,
    /// Client-side endpoint of the pair.
    pub client: SessionEndpoint,
    /// Server-side endpoint of the pair. Partially filled on a client
    /// until the connect response arrives.
    pub server: SessionEndpoint,
    /// This session's number in the owner's session table.
    pub local_session_num: u16,
    /// The request window.
    pub slots: Vec<SSlot>,
    /// Stack of free slot indices.
    pub free_slots: Vec<usize>,
    /// Whether the session is queued in the datapath TX work queue.
    pub in_tx_queue: bool,
    /// Client only: an application-initiated SM request is in flight.
    pub sm_api_req_pending: bool,
}

impl Session {
    /// Create a session with a full free-slot stack.
    pub fn new(
        role: SessionRole,
        state: SessionState,
        local_session_num: u16,
        client: SessionEndpoint,
        server: SessionEndpoint,
        slots: Vec<SSlot>,
    ) -> Self {
        debug_assert_eq!(slots.len(), SLOTS_PER_SESSION);
        let free_slots = (0..slots.len()).collect();
        Self {
            role,
            state,
            client,
            server,
            local_session_num,
            slots,
            free_slots,
            in_tx_queue: false,
            sm_api_req_pending: false,
        }
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// The endpoint of this session owned by this runtime.
    #[inline]
    pub fn local_endpoint(&self) -> &SessionEndpoint {
        match self.role {
            SessionRole::Client => &self.client,
            SessionRole::Server => &self.server,
        }
    }

    /// The endpoint of this session owned by the peer.
    #[inline]
    pub fn remote_endpoint(&self) -> &SessionEndpoint {
        match self.role {
            SessionRole::Client => &self.server,
            SessionRole::Server => &self.client,
        }
    }

    /// Pop a free slot index, if any.
    #[inline]
    pub fn alloc_slot(&mut self) -> Option<usize> {
        self.free_slots.pop()
    }

    /// Push a slot index back onto the free stack.
    pub fn release_slot(&mut self, index: usize) {
        debug_assert!(index < self.slots.len());
        debug_assert!(!self.free_slots.contains(&index));
        self.free_slots.push(index);
    }

    /// Number of slots with an in-flight request.
    #[inline]
    pub fn in_flight_slots(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }
}

/// Append-only table of sessions, indexed by session number.
///
/// Buried sessions leave a permanent None at their index; numbers are
/// never reused. Growth is bounded by `MAX_SESSIONS_PER_ENDPOINT`.
pub struct SessionTable {
    sessions: Vec<Option<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self { sessions: Vec::new() }
    }

    /// The session number the next appended session will receive.
    #[inline]
    pub fn next_session_num(&self) -> u16 {
        self.sessions.len() as u16
    }

    /// True iff the table has reached its growth bound.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.sessions.len() >= MAX_SESSIONS_PER_ENDPOINT
    }

    /// Append a session; its `local_session_num` must equal
    /// `next_session_num()`.
    pub fn push(&mut self, session: Session) -> u16 {
        let num = self.next_session_num();
        debug_assert_eq!(session.local_session_num, num);
        self.sessions.push(Some(session));
        num
    }

    pub fn get(&self, session_num: u16) -> Option<&Session> {
        self.sessions.get(session_num as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, session_num: u16) -> Option<&mut Session> {
        self.sessions
            .get_mut(session_num as usize)
            .and_then(|s| s.as_mut())
    }

    /// Null the table entry and return the session for resource teardown.
    pub fn bury(&mut self, session_num: u16) -> Option<Session> {
        self.sessions.get_mut(session_num as usize).and_then(|s| s.take())
    }

    /// Count of live (non-null) sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    /// Iterate over live sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().filter_map(|s| s.as_ref())
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{HugeAlloc, MsgBuffer};
    use crate::endpoint::{SessionEndpoint, TransportType};

    fn make_session(alloc: &mut HugeAlloc, num: u16) -> Session {
        let slots = (0..SLOTS_PER_SESSION)
            .map(|i| {
                let raw = alloc.alloc(MsgBuffer::required_region_size(1024, 1)).unwrap();
                SSlot::new(i, MsgBuffer::from_raw(raw, 1024, 1))
            })
            .collect();

        let mut client = SessionEndpoint::new(TransportType::Fake, "local", 0, 1);
        client.session_num = num;
        let server = SessionEndpoint::new(TransportType::Fake, "remote", 0, 2);

        Session::new(
            SessionRole::Client,
            SessionState::ConnectInProgress,
            num,
            client,
            server,
            slots,
        )
    }

    #[test]
    fn test_slot_accounting() {
        let mut alloc = HugeAlloc::new(16 * 1024 * 1024, 0);
        let mut session = make_session(&mut alloc, 0);

        assert_eq!(session.free_slots.len(), SLOTS_PER_SESSION);
        assert_eq!(session.in_flight_slots(), 0);

        let mut held = Vec::new();
        while let Some(idx) = session.alloc_slot() {
            held.push(idx);
            assert_eq!(
                session.free_slots.len() + session.in_flight_slots(),
                SLOTS_PER_SESSION
            );
        }
        assert_eq!(held.len(), SLOTS_PER_SESSION);
        assert!(session.alloc_slot().is_none());

        for idx in held {
            session.release_slot(idx);
        }
        assert_eq!(session.free_slots.len(), SLOTS_PER_SESSION);
    }

    #[test]
    fn test_slots_at_rest() {
        let mut alloc = HugeAlloc::new(16 * 1024 * 1024, 0);
        let session = make_session(&mut alloc, 0);
        for slot in &session.slots {
            assert!(slot.at_rest());
            assert!(!slot.tx_queued);
        }
    }

    #[test]
    fn test_table_append_only() {
        let mut alloc = HugeAlloc::new(64 * 1024 * 1024, 0);
        let mut table = SessionTable::new();

        assert_eq!(table.next_session_num(), 0);
        let s0 = make_session(&mut alloc, 0);
        assert_eq!(table.push(s0), 0);
        let s1 = make_session(&mut alloc, 1);
        assert_eq!(table.push(s1), 1);
        assert_eq!(table.active_count(), 2);

        // Burying leaves a permanent hole; numbers are not reused.
        assert!(table.bury(0).is_some());
        assert!(table.get(0).is_none());
        assert!(table.bury(0).is_none());
        assert_eq!(table.active_count(), 1);
        assert_eq!(table.next_session_num(), 2);
    }

    #[test]
    fn test_local_session_num_matches_endpoint() {
        let mut alloc = HugeAlloc::new(16 * 1024 * 1024, 0);
        let session = make_session(&mut alloc, 0);
        assert_eq!(session.local_session_num, session.client.session_num);
    }
}
