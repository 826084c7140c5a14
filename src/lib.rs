//! # udrpc - RPC runtime for lossy datagram transports
//!
//! This crate implements a user-space RPC runtime that multiplexes many
//! logical sessions over unreliable datagram transports. An application
//! thread creates an [`Rpc`] endpoint bound to a physical port and an
//! endpoint ID, opens client sessions to remote endpoints, and drives
//! progress by polling the event loop.
//!
//! ## Features
//!
//! - **Session management plane**: connect/disconnect exchanges with
//!   retry and timeout, carried over a process-wide [`Nexus`]
//! - **Request windows**: a fixed slot window per session with explicit
//!   free-slot accounting
//! - **Application-owned buffers**: page-backed [`MsgBuffer`]s from a
//!   per-endpoint size-class allocator
//! - **Pluggable transports**: the runtime is generic over the
//!   [`Transport`] capability set
//!
//! ## Usage
//!
//! ```no_run
//! use udrpc::{Nexus, NexusConfig, Rpc, RpcConfig, UdpTransport};
//!
//! let nexus = Nexus::new(NexusConfig::new("client-host")).unwrap();
//!
//! let transport = UdpTransport::new().unwrap();
//! let rpc = Rpc::new(
//!     &nexus,
//!     1,
//!     |session_num, event, err| {
//!         println!("session {}: {:?} ({:?})", session_num, event, err);
//!     },
//!     transport,
//!     RpcConfig::default(),
//! )
//! .unwrap();
//!
//! let session = rpc.create_session("server-host", 2, 0).unwrap();
//!
//! loop {
//!     rpc.run_event_loop_one();
//!     if rpc.session_state(session).is_none() {
//!         break;
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`endpoint`]: session endpoint identity and wire codec
//! - [`packet`]: session-management packet codec
//! - [`session`]: sessions, slots, and the session table
//! - [`buffer`]: message buffers and the size-class allocator
//! - [`hook`]: the SM queue pair shared with the multiplexer
//! - [`retry`]: deadlines for in-flight SM requests
//! - [`nexus`]: the process-wide multiplexer and SM listener
//! - [`transport`]: the unreliable-transport seam
//! - [`rpc`]: the endpoint runtime and event loop

pub mod buffer;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod hook;
pub mod nexus;
pub mod packet;
pub mod retry;
pub mod rpc;
pub mod session;
pub mod transport;

// Re-export main types
pub use buffer::{HugeAlloc, MsgBuffer};
pub use config::{NexusConfig, RpcConfig, MAX_PHY_PORTS};
pub use endpoint::{
    RoutingInfo, SessionEndpoint, TransportType, MAX_HOSTNAME_LEN, ROUTING_INFO_LEN, SECRET_BITS,
};
pub use error::{DatapathErrCode, Error, Result};
pub use hook::{NexusHook, SmWorkItem};
pub use nexus::{Nexus, ReqFunc, MAX_REQ_TYPES};
pub use packet::{SmErrType, SmEventType, SmPkt, SmPktType, SM_PKT_WIRE_SIZE};
pub use retry::SmRetryQueue;
pub use rpc::{Rpc, SmHandler};
pub use session::{
    SSlot, Session, SessionRole, SessionState, MAX_SESSIONS_PER_ENDPOINT, SLOTS_PER_SESSION,
};
pub use transport::{FakeTransport, Transport, TxBurstItem, UdpTransport};
