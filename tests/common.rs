//! Common utilities for session-management integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use udrpc::{FakeTransport, Nexus, NexusConfig, Rpc, RpcConfig, SmErrType, SmEventType};

/// Initialize test logging; safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Recorded `(session_num, event, err_type)` callback invocations.
pub type EventLog = Rc<RefCell<Vec<(u16, SmEventType, SmErrType)>>>;

pub fn event_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// A session-management handler that appends every event to `log`.
pub fn recording_handler(log: &EventLog) -> impl FnMut(u16, SmEventType, SmErrType) + 'static {
    let log = Rc::clone(log);
    move |session_num, event, err_type| {
        log.borrow_mut().push((session_num, event, err_type));
    }
}

/// A loopback Nexus with an ephemeral SM port and no SM thread; the test
/// pumps `process_sm_tx`/`process_sm_rx` itself, which keeps packet loss
/// and ordering deterministic.
pub fn manual_nexus() -> Nexus {
    let config = NexusConfig::new("127.0.0.1")
        .with_sm_udp_port(0)
        .with_sm_thread(false);
    Nexus::new(config).expect("failed to create nexus")
}

/// An endpoint runtime over the fake transport with default config.
pub fn make_rpc(nexus: &Nexus, endpoint_id: u8, log: &EventLog) -> Rpc<FakeTransport> {
    Rpc::new(
        nexus,
        endpoint_id,
        recording_handler(log),
        FakeTransport::new(1024),
        RpcConfig::default(),
    )
    .expect("failed to create rpc")
}

/// Drive the SM plane and all endpoint event loops until `cond` holds.
/// Returns false on timeout.
pub fn pump_until<F>(
    nexus: &Nexus,
    rpcs: &[&Rpc<FakeTransport>],
    timeout: Duration,
    mut cond: F,
) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        for rpc in rpcs {
            rpc.run_event_loop_one();
        }
        nexus.process_sm_tx();
        nexus.process_sm_rx();
        for rpc in rpcs {
            rpc.run_event_loop_one();
        }

        if cond() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
}
