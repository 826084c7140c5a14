//! Retry queue for in-flight session-management requests.
//!
//! Sessions with an unanswered connect or disconnect request sit here
//! with a deadline; the event loop re-emits the request each time the
//! deadline passes. Session management is not performance-critical, so a
//! plain vector with linear scans is enough.

use std::time::Duration;

use minstant::Instant;

struct RetryEntry {
    session_num: u16,
    deadline: Instant,
}

/// Ordered collection of sessions with an in-flight SM request.
///
/// A session is present iff its state is ConnectInProgress or
/// DisconnectInProgress; it leaves exactly when a matching response
/// terminal-transitions it.
pub struct SmRetryQueue {
    entries: Vec<RetryEntry>,
    timeout: Duration,
}

impl SmRetryQueue {
    /// Create a queue with the given retransmission timeout.
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            entries: Vec::new(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Register a session with deadline `now + timeout`. A session
    /// already present is left untouched.
    pub fn add(&mut self, session_num: u16) {
        debug_assert!(!self.contains(session_num));
        if self.contains(session_num) {
            return;
        }
        self.entries.push(RetryEntry {
            session_num,
            deadline: Instant::now() + self.timeout,
        });
    }

    /// Remove a session; no-op if absent.
    pub fn remove(&mut self, session_num: u16) {
        self.entries.retain(|e| e.session_num != session_num);
    }

    /// True iff the session is registered.
    pub fn contains(&self, session_num: u16) -> bool {
        self.entries.iter().any(|e| e.session_num == session_num)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True iff any deadline has passed.
    pub fn any_due(&self, now: Instant) -> bool {
        self.entries.iter().any(|e| e.deadline <= now)
    }

    /// Collect the sessions whose deadline has passed and re-arm each
    /// with a fresh deadline. The caller re-emits the SM request.
    pub fn fire_due(&mut self, now: Instant) -> Vec<u16> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if entry.deadline <= now {
                due.push(entry.session_num);
                entry.deadline = now + self.timeout;
            }
        }
        due
    }
}
