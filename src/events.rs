//! Tester events, for whoever records the results of a test run

use std::sync::{Arc, Mutex};

use crate::protocol::ProtocolTag;
use crate::verdict::Verdict;

/// Event emitted by a [crate::session::Session]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TesterEvent {
    /// A candidate protocol is about to be probed
    ProtocolAttempt(ProtocolTag),
    /// The vehicle answered the probe on a protocol
    ProtocolResponded {
        /// Protocol
        protocol: ProtocolTag,
        /// Number of ECUs that answered
        ecu_count: usize,
    },
    /// Protocol determination finished
    ProtocolDetermined {
        /// Protocol found, if any
        protocol: Option<ProtocolTag>,
        /// Outcome
        verdict: Verdict,
    },
    /// The connect fingerprint was captured
    FingerprintCaptured {
        /// Protocol of the fingerprint
        protocol: ProtocolTag,
        /// Number of ECUs in the fingerprint
        ecu_count: usize,
    },
    /// The vehicle stopped answering on the protocol determined
    LinkLost(ProtocolTag),
    /// A request finished
    Request {
        /// Request service ID
        sid: u8,
        /// Request sub IDs
        sub_ids: Vec<u8>,
        /// Number of ECUs that responded
        responders: usize,
        /// Outcome
        verdict: Verdict,
    },
    /// A conformance violation was detected
    Violation {
        /// Severity
        verdict: Verdict,
        /// Description, already logged
        desc: String,
    },
}

/// Handler for events happening within a session
pub trait EventHandler {
    /// Handle an incoming event
    fn on_event(&mut self, e: TesterEvent);
}

/// Handler that drops every event
#[derive(Debug, Copy, Clone, Default)]
pub struct VoidHandler;

impl EventHandler for VoidHandler {
    #[inline(always)]
    fn on_event(&mut self, _e: TesterEvent) {}
}

/// Handler that records every event. Clones share the same log, so a clone
/// kept by the caller sees what the session recorded
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<TesterEvent>>>,
}

impl EventLog {
    /// Creates an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the events recorded so far
    pub fn events(&self) -> Vec<TesterEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of recorded violations with a given severity
    pub fn violations(&self, verdict: Verdict) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, TesterEvent::Violation { verdict: v, .. } if *v == verdict))
            .count()
    }

    /// Forgets every recorded event
    pub fn clear(&self) {
        if let Ok(mut e) = self.events.lock() {
            e.clear();
        }
    }
}

impl EventHandler for EventLog {
    fn on_event(&mut self, e: TesterEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(e);
        }
    }
}
