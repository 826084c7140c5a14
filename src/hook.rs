//! The hook connecting one endpoint runtime to the multiplexer.
//!
//! SM packets cross threads through two MPSC queues: SM-RX (multiplexer
//! thread produces, endpoint runtime consumes) and SM-TX (endpoint
//! runtime produces, multiplexer thread consumes). Enqueueing a work item
//! transfers ownership of the boxed packet to the consumer thread, which
//! frees it after dispatch.
//!
//! The queues are thin wrappers around `std::sync::mpsc`; std's
//! implementation is well-tested and a hand-rolled lock-free MPSC would
//! buy nothing at session-management rates.

use std::net::SocketAddr;
use std::sync::mpsc;

use crate::packet::SmPkt;

/// One session-management packet in flight between an endpoint runtime
/// and the multiplexer.
pub struct SmWorkItem {
    /// Endpoint ID of the runtime that produced or consumes the item.
    pub origin_endpoint_id: u8,
    /// The owned packet.
    pub pkt: Box<SmPkt>,
    /// Opaque peer handle: the datagram source to reply to, when the
    /// packet arrived from the wire.
    pub peer: Option<SocketAddr>,
}

impl SmWorkItem {
    pub fn new(origin_endpoint_id: u8, pkt: Box<SmPkt>, peer: Option<SocketAddr>) -> Self {
        Self {
            origin_endpoint_id,
            pkt,
            peer,
        }
    }
}

/// Producer half of an SM work queue. Cloneable across threads.
pub struct SmSender {
    inner: mpsc::Sender<SmWorkItem>,
}

impl Clone for SmSender {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl SmSender {
    /// Enqueue a work item, transferring packet ownership to the
    /// consumer. Returns false if the consumer is gone.
    pub fn send(&self, wi: SmWorkItem) -> bool {
        self.inner.send(wi).is_ok()
    }
}

/// Consumer half of an SM work queue.
pub struct SmReceiver {
    inner: mpsc::Receiver<SmWorkItem>,
}

impl SmReceiver {
    /// Drain all currently queued items in a single pass. Items enqueued
    /// by one producer are observed in enqueue order.
    pub fn drain(&self) -> Vec<SmWorkItem> {
        let mut items = Vec::new();
        while let Ok(wi) = self.inner.try_recv() {
            items.push(wi);
        }
        items
    }
}

/// Create a connected SM work queue.
pub fn sm_queue() -> (SmSender, SmReceiver) {
    let (tx, rx) = mpsc::channel();
    (SmSender { inner: tx }, SmReceiver { inner: rx })
}

/// The endpoint runtime's half of the hook shared with the Nexus.
pub struct NexusHook {
    /// Endpoint ID this hook belongs to.
    pub endpoint_id: u8,
    /// SM-RX: packets from the multiplexer, drained by the event loop.
    pub sm_rx: SmReceiver,
    /// SM-TX: packets to the multiplexer's transmit side.
    pub sm_tx: SmSender,
}
